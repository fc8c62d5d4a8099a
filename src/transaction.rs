use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use log::{debug, warn};

use crate::record::{RecordEntry, SchemaBits};
use crate::table::{Position, Table, TableMeta};

/// Enough state to reverse one mutating `Query` call. Recorded by `Query`
/// as it mutates a table, consumed in reverse order by
/// [`Transaction::abort`].
pub enum UndoEntry {
    /// A fresh rid was allocated (the key did not already exist).
    InsertNew {
        key: i64,
        rid: u64,
        values: Vec<i64>,
    },
    /// An existing rid's base entry was overwritten in place.
    InsertOverwrite {
        rid: u64,
        previous_indirection: u64,
        previous_timestamp: i64,
        previous_values: Vec<i64>,
        previous_positions: Vec<Option<Position>>,
        previous_materialized: Vec<i64>,
    },
    Delete {
        key: i64,
        base_rid: u64,
    },
    Update {
        base_rid: u64,
        tail_rid: u64,
        previous_indirection: u64,
        previous_values: Vec<(usize, i64)>,
    },
}

fn apply_undo(meta: &mut TableMeta, num_columns: usize, entry: &UndoEntry) {
    match entry {
        UndoEntry::InsertNew { key, rid, values } => {
            for col in 0..num_columns {
                if meta.index.is_built(col) {
                    meta.index.remove(col, values[col], *rid);
                }
            }
            meta.page_directory.remove(rid);
            meta.base_positions.remove(rid);
            meta.key_to_rid.remove(key);
        }
        UndoEntry::InsertOverwrite {
            rid,
            previous_indirection,
            previous_timestamp,
            previous_values,
            previous_positions,
            previous_materialized,
        } => {
            let current: Vec<i64> = (0..num_columns).map(|c| meta.current_value(*rid, c).unwrap_or(0)).collect();

            meta.page_directory.insert(
                *rid,
                RecordEntry {
                    indirection: *previous_indirection,
                    rid: *rid,
                    timestamp: *previous_timestamp,
                    schema: SchemaBits::zeros(num_columns),
                    values: previous_values.clone(),
                },
            );
            meta.base_positions.insert(*rid, previous_positions.clone());

            for col in 0..num_columns {
                if meta.index.is_built(col) {
                    meta.index.remove(col, current[col], *rid);
                    meta.index.add(col, previous_materialized[col], *rid);
                }
            }
        }
        UndoEntry::Delete { key, base_rid } => {
            if let Some(entry) = meta.page_directory.get_mut(base_rid) {
                entry.rid = *base_rid;
            }
            meta.key_to_rid.insert(*key, *base_rid);
            for col in 0..num_columns {
                if meta.index.is_built(col) {
                    if let Some(value) = meta.current_value(*base_rid, col) {
                        meta.index.add(col, value, *base_rid);
                    }
                }
            }
        }
        UndoEntry::Update {
            base_rid,
            tail_rid,
            previous_indirection,
            previous_values,
        } => {
            let post_values: Vec<(usize, Option<i64>)> = previous_values
                .iter()
                .map(|(col, _)| (*col, meta.current_value(*base_rid, *col)))
                .collect();

            if let Some(base) = meta.page_directory.get_mut(base_rid) {
                base.indirection = *previous_indirection;
            }
            meta.page_directory.remove(tail_rid);
            meta.tail_positions.remove(tail_rid);

            for (col, old_value) in previous_values {
                if meta.index.is_built(*col) {
                    if let Some(Some(post_value)) = post_values.iter().find(|(c, _)| c == col).map(|(_, v)| v) {
                        meta.index.remove(*col, *post_value, *base_rid);
                    }
                    meta.index.add(*col, *old_value, *base_rid);
                }
            }
        }
    }
}

/// A single-use sequence of `Query` calls with strict two-phase locking:
/// every lock taken on this transaction's behalf is released only when it
/// commits or aborts, never in between. `Query` methods record
/// undo entries directly via [`Transaction::record_undo`] as they run;
/// `abort` replays them in reverse.
pub struct Transaction {
    id: u64,
    queued: Mutex<Vec<Box<dyn Fn(&Transaction) -> bool + Send + Sync>>>,
    undo_log: Mutex<Vec<(Arc<Table>, UndoEntry)>>,
    touched: Mutex<Vec<Arc<Table>>>,
    finished: AtomicBool,
    retryable: AtomicBool,
}

impl Transaction {
    pub fn new(id: u64) -> Transaction {
        Transaction {
            id,
            queued: Mutex::new(Vec::new()),
            undo_log: Mutex::new(Vec::new()),
            touched: Mutex::new(Vec::new()),
            finished: AtomicBool::new(false),
            retryable: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Queues a `Query` call for [`Transaction::run`] to execute in order.
    /// `op` typically wraps a single `Query` method bound to its arguments,
    /// e.g. `txn.add_query(move |t| query.insert(t, &values))`.
    pub fn add_query(&self, op: impl Fn(&Transaction) -> bool + Send + Sync + 'static) {
        self.queued.lock().unwrap().push(Box::new(op));
    }

    pub(crate) fn touch_table(&self, table: &Arc<Table>) {
        let mut touched = self.touched.lock().unwrap();
        if !touched.iter().any(|t| Arc::ptr_eq(t, table)) {
            touched.push(Arc::clone(table));
        }
    }

    pub(crate) fn record_undo(&self, table: Arc<Table>, entry: UndoEntry) {
        self.undo_log.lock().unwrap().push((table, entry));
    }

    /// Flags the query call currently failing as a lock conflict rather
    /// than a hard failure, so [`Transaction::run`] retries the whole
    /// batch instead of aborting it for good. `Query` calls this
    /// immediately before returning `false` from a failed lock acquire.
    pub(crate) fn mark_retryable(&self) {
        self.retryable.store(true, Ordering::SeqCst);
    }

    /// Runs every queued query in order. On a lock-conflict failure, undoes
    /// the partial batch, releases its locks, and retries the whole batch
    /// from the start — no-wait 2PL means a conflicting holder may release
    /// at any time, so retrying is how a transaction eventually gets in. A
    /// non-retryable failure (bad arity, missing key, ...) unwinds once and
    /// gives up. A transaction is single-use: calling `run` twice panics.
    pub fn run(&self) -> bool {
        assert!(
            !self.finished.swap(true, Ordering::SeqCst),
            "transaction {} already ran", self.id
        );

        let queued = std::mem::take(&mut *self.queued.lock().unwrap());
        loop {
            self.retryable.store(false, Ordering::SeqCst);
            let mut failed = false;
            for op in &queued {
                if !op(self) {
                    failed = true;
                    break;
                }
            }
            if !failed {
                self.commit();
                return true;
            }

            let retry = self.retryable.swap(false, Ordering::SeqCst);
            self.unwind();
            if !retry {
                debug!("transaction {} aborting for good on non-retryable failure", self.id);
                return false;
            }
            debug!("transaction {} retrying after lock conflict", self.id);
            std::thread::yield_now();
        }
    }

    /// Releases every lock this transaction holds and discards its undo
    /// log without replaying it. Idempotent.
    pub fn commit(&self) {
        for table in self.touched.lock().unwrap().drain(..) {
            table.lock_manager.release_all(self.id);
        }
        self.undo_log.lock().unwrap().clear();
    }

    /// Replays this transaction's undo log in reverse, then releases every
    /// lock it holds. Idempotent (a transaction with an empty undo log
    /// just releases locks).
    fn unwind(&self) {
        let entries: Vec<_> = self.undo_log.lock().unwrap().drain(..).collect();
        for (table, entry) in entries.into_iter().rev() {
            table.with_meta(|meta| apply_undo(meta, table.num_columns, &entry));
        }
        for table in self.touched.lock().unwrap().drain(..) {
            table.lock_manager.release_all(self.id);
        }
    }

    /// Public one-shot abort: unwinds the transaction and finalizes it.
    /// Unlike a retry inside [`Transaction::run`], this never re-attempts
    /// the queued operations.
    pub fn abort(&self) {
        self.unwind();
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        if !self.undo_log.lock().unwrap().is_empty() {
            warn!("transaction {} dropped with a non-empty undo log; locks may leak", self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer_pool::BufferPool;
    use crate::page_store::PageStore;
    use crate::query::Query;

    fn fresh_table() -> (tempfile::TempDir, Arc<Table>) {
        let dir = tempfile::tempdir().unwrap();
        let store = PageStore::new(dir.path());
        let pool = Arc::new(BufferPool::new(64, store));
        (dir, Arc::new(Table::new("t", 2, 0, pool)))
    }

    #[test]
    fn abort_undoes_insert() {
        let (_dir, table) = fresh_table();
        let query = Query::new(Arc::clone(&table));
        let txn = Transaction::new(1);

        assert!(query.insert(&txn, &[1, 2]));
        txn.abort();
        assert!(query.select(&Transaction::new(2), 1, 0, &[true, true]).unwrap().is_empty());
    }

    #[test]
    fn abort_undoes_delete() {
        let (_dir, table) = fresh_table();
        let query = Query::new(Arc::clone(&table));
        let setup = Transaction::new(1);
        assert!(query.insert(&setup, &[1, 2]));
        setup.commit();

        let txn = Transaction::new(2);
        assert!(query.delete(&txn, 1));
        txn.abort();

        let check = Transaction::new(3);
        assert_eq!(query.select(&check, 1, 0, &[true, true]).unwrap().len(), 1);
    }

    #[test]
    fn run_commits_queued_inserts() {
        let (_dir, table) = fresh_table();
        let query = Arc::new(Query::new(Arc::clone(&table)));
        let txn = Transaction::new(1);

        let q1 = Arc::clone(&query);
        txn.add_query(move |t| q1.insert(t, &[1, 10]));
        let q2 = Arc::clone(&query);
        txn.add_query(move |t| q2.insert(t, &[2, 20]));

        assert!(txn.run());

        let check = Transaction::new(2);
        assert_eq!(query.sum(&check, 1, 2, 1), Some(30));
    }

    #[test]
    fn run_aborts_for_good_on_non_retryable_failure() {
        let (_dir, table) = fresh_table();
        let query = Arc::new(Query::new(Arc::clone(&table)));

        let txn = Transaction::new(1);
        let q1 = Arc::clone(&query);
        // wrong arity: fails without ever touching the lock manager, so
        // there is nothing to retry.
        txn.add_query(move |t| q1.insert(t, &[1]));

        assert!(!txn.run());
    }

    #[test]
    fn run_retries_until_conflicting_lock_is_released() {
        let (_dir, table) = fresh_table();
        let query = Arc::new(Query::new(Arc::clone(&table)));

        // Another transaction holds an exclusive lock on key 1, guaranteed
        // to conflict with txn's queued insert. A background thread
        // releases it after a short delay; txn's own run() call must keep
        // retrying the whole batch until that happens, then succeed.
        let blocker = Transaction::new(99);
        assert!(table.lock_manager.acquire_exclusive(1, blocker.id()));

        let release_table = Arc::clone(&table);
        let blocker_id = blocker.id();
        let releaser = std::thread::spawn(move || {
            std::thread::sleep(std::time::Duration::from_millis(20));
            release_table.lock_manager.release_all(blocker_id);
        });

        let txn = Transaction::new(1);
        let q1 = Arc::clone(&query);
        txn.add_query(move |t| q1.insert(t, &[1, 10]));

        assert!(txn.run());
        releaser.join().unwrap();

        let check = Transaction::new(2);
        let rows = query.select(&check, 1, 0, &[true, true]).unwrap();
        assert_eq!(rows[0].columns[1], Some(10));
    }
}
