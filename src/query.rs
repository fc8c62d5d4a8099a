use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use log::warn;

use crate::record::{Record, RecordEntry, SchemaBits};
use crate::table::Table;
use crate::transaction::{Transaction, UndoEntry};

/// Per-table query surface: insert/select/update/delete/sum and
/// their versioned/incremented variants. Every method acquires the locks it
/// needs on `txn`'s behalf and returns `false`/`None` on any lock conflict
/// or missing key — callers under strict 2PL must abort the whole
/// transaction on such a result, never retry the single call.
pub struct Query {
    table: Arc<Table>,
}

fn now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

impl Query {
    pub fn new(table: Arc<Table>) -> Query {
        Query { table }
    }

    pub fn table(&self) -> &Arc<Table> {
        &self.table
    }

    /// Inserts a new record. If `values[key_index]` already names a live
    /// key, the existing base entry is overwritten in place (same rid,
    /// indirection reset to 0, `base_positions` reset so reads fall back
    /// to the directory until the next append) rather than allocating a
    /// fresh rid.
    pub fn insert(&self, txn: &Transaction, values: &[i64]) -> bool {
        if values.len() != self.table.num_columns {
            return false;
        }
        let key = values[self.table.key_index];

        if !self.table.lock_manager.acquire_exclusive(key, txn.id()) {
            txn.mark_retryable();
            return false;
        }
        txn.touch_table(&self.table);

        let ts = now();
        self.table.with_meta(|meta| {
            if let Some(&rid) = meta.key_to_rid.get(&key) {
                let num_columns = self.table.num_columns;
                let (previous_indirection, previous_timestamp, previous_values) = {
                    let entry = meta.page_directory.get(&rid).expect("key_to_rid points at a live entry");
                    (entry.indirection, entry.timestamp, entry.values.clone())
                };
                let previous_positions = meta
                    .base_positions
                    .get(&rid)
                    .cloned()
                    .unwrap_or_else(|| vec![None; num_columns]);
                let previous_materialized: Vec<i64> = (0..num_columns)
                    .map(|c| meta.current_value(rid, c).unwrap_or(previous_values[c]))
                    .collect();

                deindex_current(meta, rid, num_columns);

                {
                    let entry = meta.page_directory.get_mut(&rid).unwrap();
                    entry.indirection = 0;
                    entry.timestamp = ts;
                    entry.schema = SchemaBits::zeros(num_columns);
                    entry.values = values.to_vec();
                }
                meta.base_positions.insert(rid, vec![None; num_columns]);

                for col in 0..num_columns {
                    if meta.index.is_built(col) {
                        meta.index.add(col, values[col], rid);
                    }
                }

                txn.record_undo(
                    Arc::clone(&self.table),
                    UndoEntry::InsertOverwrite {
                        rid,
                        previous_indirection,
                        previous_timestamp,
                        previous_values,
                        previous_positions,
                        previous_materialized,
                    },
                );
            } else {
                let rid = meta.next_rid;
                meta.next_rid += 1;
                let entry = RecordEntry::new_base(rid, ts, values.to_vec());

                let mut positions = Vec::with_capacity(self.table.num_columns);
                for (col, &value) in values.iter().enumerate() {
                    match meta.append_to_column(&self.table.buffer_pool, &self.table.name, true, col, value) {
                        Ok(pos) => positions.push(Some(pos)),
                        Err(e) => {
                            warn!("insert: append_to_column failed: {}", e);
                            positions.push(None);
                        }
                    }
                }

                meta.page_directory.insert(rid, entry);
                meta.base_positions.insert(rid, positions);
                meta.key_to_rid.insert(key, rid);

                for col in 0..self.table.num_columns {
                    if meta.index.is_built(col) {
                        meta.index.add(col, values[col], rid);
                    }
                }

                txn.record_undo(
                    Arc::clone(&self.table),
                    UndoEntry::InsertNew {
                        key,
                        rid,
                        values: values.to_vec(),
                    },
                );
            }
        });

        true
    }

    /// Tombstones the live record keyed by `key`.
    pub fn delete(&self, txn: &Transaction, key: i64) -> bool {
        if !self.table.lock_manager.acquire_exclusive(key, txn.id()) {
            txn.mark_retryable();
            return false;
        }
        txn.touch_table(&self.table);

        let result = self.table.with_meta(|meta| {
            let rid = match meta.key_to_rid.get(&key).copied() {
                Some(r) => r,
                None => return false,
            };
            let is_live = meta
                .page_directory
                .get(&rid)
                .map(|e| !e.is_tombstoned())
                .unwrap_or(false);
            if !is_live {
                return false;
            }

            deindex_current(meta, rid, self.table.num_columns);
            meta.key_to_rid.remove(&key);
            if let Some(entry) = meta.page_directory.get_mut(&rid) {
                entry.rid = 0;
            }

            txn.record_undo(Arc::clone(&self.table), UndoEntry::Delete { key, base_rid: rid });
            true
        });

        result
    }

    /// Appends a tail record carrying only the columns set in `values`
    /// (`None` entries are left unmodified).
    pub fn update(&self, txn: &Transaction, key: i64, values: &[Option<i64>]) -> bool {
        if values.len() != self.table.num_columns {
            return false;
        }
        if !self.table.lock_manager.acquire_exclusive(key, txn.id()) {
            txn.mark_retryable();
            return false;
        }
        txn.touch_table(&self.table);

        self.table.with_meta(|meta| {
            let base_rid = match meta.key_to_rid.get(&key).copied() {
                Some(r) => r,
                None => return false,
            };
            if meta.page_directory.get(&base_rid).map(|e| e.is_tombstoned()).unwrap_or(true) {
                return false;
            }
            if !values.iter().any(Option::is_some) {
                return true;
            }

            let previous_indirection = meta.page_directory.get(&base_rid).unwrap().indirection;
            let previous_values: Vec<(usize, i64)> = (0..self.table.num_columns)
                .filter(|&c| values[c].is_some() && meta.index.is_built(c))
                .filter_map(|c| meta.current_value(base_rid, c).map(|v| (c, v)))
                .collect();

            let ts = now();
            let tail_rid = meta.next_rid;
            meta.next_rid += 1;

            let mut tail = RecordEntry::new_base(tail_rid, ts, vec![0; self.table.num_columns]);
            tail.indirection = previous_indirection;

            let mut positions = vec![None; self.table.num_columns];
            for (col, maybe_value) in values.iter().enumerate() {
                if let Some(value) = maybe_value {
                    tail.schema.set(col, true);
                    tail.values[col] = *value;
                    match meta.append_to_column(&self.table.buffer_pool, &self.table.name, false, col, *value) {
                        Ok(pos) => positions[col] = Some(pos),
                        Err(e) => warn!("update: append_to_column failed: {}", e),
                    }
                }
            }

            meta.page_directory.insert(tail_rid, tail);
            meta.tail_positions.insert(tail_rid, positions);
            if let Some(base) = meta.page_directory.get_mut(&base_rid) {
                base.indirection = tail_rid;
            }

            for (col, old_value) in &previous_values {
                if let Some(new_value) = meta.current_value(base_rid, *col) {
                    if *old_value != new_value {
                        meta.index.remove(*col, *old_value, base_rid);
                        meta.index.add(*col, new_value, base_rid);
                    }
                }
            }

            txn.record_undo(
                Arc::clone(&self.table),
                UndoEntry::Update {
                    base_rid,
                    tail_rid,
                    previous_indirection,
                    previous_values,
                },
            );
            true
        })
    }

    /// Adds 1 to `column` for `key`, implemented as a targeted single-column
    /// update.
    pub fn increment(&self, txn: &Transaction, key: i64, column: usize) -> bool {
        if column >= self.table.num_columns {
            return false;
        }
        let current = match self.select(txn, key, self.table.key_index, &all_true(self.table.num_columns)) {
            Some(rows) if !rows.is_empty() => rows[0].columns[column],
            _ => None,
        };
        let current = match current {
            Some(v) => v,
            None => return false,
        };

        let mut values = vec![None; self.table.num_columns];
        values[column] = Some(current + 1);
        self.update(txn, key, &values)
    }

    /// Finds live records whose `search_column` currently equals
    /// `search_key`, projected by `projection`. Supports both the primary
    /// key (fast path via `key_to_rid`) and any other column (via its
    /// secondary index if built, otherwise a full scan).
    pub fn select(&self, txn: &Transaction, search_key: i64, search_column: usize, projection: &[bool]) -> Option<Vec<Record>> {
        self.select_impl(txn, search_key, search_column, projection, 0)
    }

    /// As [`Query::select`], but each record is materialized after
    /// discarding the `|relative_version|` most recent updates.
    /// `relative_version` must be `<= 0`; `0` is the current version.
    /// Only supports searching by the primary key; any other
    /// `search_column` returns `None`.
    pub fn select_version(
        &self,
        txn: &Transaction,
        search_key: i64,
        search_column: usize,
        projection: &[bool],
        relative_version: i64,
    ) -> Option<Vec<Record>> {
        if search_column != self.table.key_index {
            return None;
        }
        self.select_impl(txn, search_key, search_column, projection, relative_version)
    }

    fn select_impl(
        &self,
        txn: &Transaction,
        search_key: i64,
        search_column: usize,
        projection: &[bool],
        relative_version: i64,
    ) -> Option<Vec<Record>> {
        if !self.table.lock_manager.acquire_shared(search_key, txn.id()) {
            txn.mark_retryable();
            return None;
        }
        txn.touch_table(&self.table);

        let skip_newest = relative_version.unsigned_abs() as usize;

        self.table.with_meta(|meta| {
            let rids = candidate_rids(meta, self.table.num_columns, search_column, search_key);
            let mut out = Vec::new();
            for rid in rids {
                if let Ok(Some(rec)) = meta.materialize(
                    &self.table.buffer_pool,
                    &self.table.name,
                    self.table.num_columns,
                    self.table.key_index,
                    rid,
                    projection,
                    skip_newest,
                ) {
                    out.push(rec);
                }
            }
            Some(out)
        })
    }

    /// Sum of `agg_column` over live keys in `[start_key, end_key]`.
    pub fn sum(&self, txn: &Transaction, start_key: i64, end_key: i64, agg_column: usize) -> Option<i64> {
        self.sum_version(txn, start_key, end_key, agg_column, 0)
    }

    pub fn sum_version(
        &self,
        txn: &Transaction,
        start_key: i64,
        end_key: i64,
        agg_column: usize,
        relative_version: i64,
    ) -> Option<i64> {
        let skip_newest = relative_version.unsigned_abs() as usize;
        let mut total = 0i64;
        let mut any = false;

        self.table.with_meta(|meta| {
            let rids: Vec<(i64, u64)> = meta
                .key_to_rid
                .iter()
                .filter(|(&k, _)| k >= start_key && k <= end_key)
                .map(|(&k, &rid)| (k, rid))
                .collect();

            for (key, rid) in rids {
                if !self.table.lock_manager.acquire_shared(key, txn.id()) {
                    continue;
                }
                let mut mask = vec![false; self.table.num_columns];
                mask[agg_column] = true;
                if let Ok(Some(rec)) = meta.materialize(
                    &self.table.buffer_pool,
                    &self.table.name,
                    self.table.num_columns,
                    self.table.key_index,
                    rid,
                    &mask,
                    skip_newest,
                ) {
                    if let Some(v) = rec.columns[agg_column] {
                        total += v;
                        any = true;
                    }
                }
            }
        });
        txn.touch_table(&self.table);

        if any {
            Some(total)
        } else {
            None
        }
    }
}

fn all_true(n: usize) -> Vec<bool> {
    vec![true; n]
}

/// rids whose *current* materialized value of `search_column` equals
/// `search_key`: via the index if built, via a full scan of live keys
/// otherwise.
fn candidate_rids(meta: &crate::table::TableMeta, num_columns: usize, search_column: usize, search_key: i64) -> Vec<u64> {
    if meta.index.is_built(search_column) {
        return meta.index.locate(search_column, search_key).unwrap_or_default();
    }
    let _ = num_columns;
    meta.key_to_rid
        .values()
        .copied()
        .filter(|&rid| meta.current_value(rid, search_column) == Some(search_key))
        .collect()
}

/// Removes a live base's current values from every built index, used
/// before tombstoning or overwriting it.
fn deindex_current(meta: &mut crate::table::TableMeta, rid: u64, num_columns: usize) {
    for col in 0..num_columns {
        if meta.index.is_built(col) {
            if let Some(value) = meta.current_value(rid, col) {
                meta.index.remove(col, value, rid);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer_pool::BufferPool;
    use crate::page_store::PageStore;

    fn fresh(num_columns: usize, key_index: usize) -> (tempfile::TempDir, Arc<Table>) {
        let dir = tempfile::tempdir().unwrap();
        let store = PageStore::new(dir.path());
        let pool = Arc::new(BufferPool::new(64, store));
        (dir, Arc::new(Table::new("grades", num_columns, key_index, pool)))
    }

    #[test]
    fn insert_then_select_round_trips() {
        let (_dir, table) = fresh(3, 0);
        let query = Query::new(Arc::clone(&table));
        let txn = Transaction::new(1);

        assert!(query.insert(&txn, &[10, 90, 85]));
        let rows = query.select(&txn, 10, 0, &[true, true, true]).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].columns, vec![Some(10), Some(90), Some(85)]);
    }

    #[test]
    fn update_then_select_version_sees_old_value() {
        let (_dir, table) = fresh(2, 0);
        let query = Query::new(Arc::clone(&table));
        let txn = Transaction::new(1);

        assert!(query.insert(&txn, &[1, 100]));
        assert!(query.update(&txn, 1, &[None, Some(200)]));

        let now = query.select(&txn, 1, 0, &[true, true]).unwrap();
        assert_eq!(now[0].columns[1], Some(200));

        let old = query.select_version(&txn, 1, 0, &[true, true], -1).unwrap();
        assert_eq!(old[0].columns[1], Some(100));
    }

    #[test]
    fn delete_removes_key_from_subsequent_select() {
        let (_dir, table) = fresh(2, 0);
        let query = Query::new(Arc::clone(&table));
        let txn = Transaction::new(1);

        assert!(query.insert(&txn, &[1, 5]));
        assert!(query.delete(&txn, 1));
        assert!(query.select(&txn, 1, 0, &[true, true]).unwrap().is_empty());
    }

    #[test]
    fn sum_adds_across_range() {
        let (_dir, table) = fresh(2, 0);
        let query = Query::new(Arc::clone(&table));
        let txn = Transaction::new(1);

        for k in 1..=5 {
            assert!(query.insert(&txn, &[k, k * 10]));
        }
        assert_eq!(query.sum(&txn, 1, 5, 1), Some(150));
        assert_eq!(query.sum(&txn, 2, 3, 1), Some(50));
    }

    #[test]
    fn increment_adds_one() {
        let (_dir, table) = fresh(2, 0);
        let query = Query::new(Arc::clone(&table));
        let txn = Transaction::new(1);

        assert!(query.insert(&txn, &[1, 9]));
        assert!(query.increment(&txn, 1, 1));
        let rows = query.select(&txn, 1, 0, &[true, true]).unwrap();
        assert_eq!(rows[0].columns[1], Some(10));
    }

    #[test]
    fn duplicate_insert_overwrites_prior_record() {
        let (_dir, table) = fresh(2, 0);
        let query = Query::new(Arc::clone(&table));
        let txn = Transaction::new(1);

        assert!(query.insert(&txn, &[1, 5]));
        assert!(query.insert(&txn, &[1, 99]));
        let rows = query.select(&txn, 1, 0, &[true, true]).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].columns[1], Some(99));
    }

    #[test]
    fn select_version_rejects_non_primary_key_search() {
        let (_dir, table) = fresh(2, 0);
        table.create_index(1);
        let query = Query::new(Arc::clone(&table));
        let txn = Transaction::new(1);

        assert!(query.insert(&txn, &[1, 42]));
        assert!(query.select(&txn, 42, 1, &[true, true]).is_some());
        assert!(query.select_version(&txn, 42, 1, &[true, true], 0).is_none());
    }

    #[test]
    fn update_with_all_none_is_a_no_op() {
        let (_dir, table) = fresh(2, 0);
        let query = Query::new(Arc::clone(&table));
        let txn = Transaction::new(1);

        assert!(query.insert(&txn, &[1, 10]));
        let rid_before = table.with_meta(|meta| *meta.key_to_rid.get(&1).unwrap());

        assert!(query.update(&txn, 1, &[None, None]));

        let rid_after = table.with_meta(|meta| *meta.key_to_rid.get(&1).unwrap());
        assert_eq!(rid_before, rid_after, "no-op update must not allocate a tail rid");

        let rows = query.select(&txn, 1, 0, &[true, true]).unwrap();
        assert_eq!(rows[0].columns[1], Some(10));
    }
}
