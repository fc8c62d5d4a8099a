use std::sync::Arc;
use std::thread::{self, JoinHandle};

use log::info;

use crate::transaction::Transaction;

/// Runs a fixed list of transactions sequentially on one background
/// thread, recording each one's commit/abort outcome into `stats`. A
/// worker is single-use: `run` spawns its thread exactly once, `join`
/// waits for it and populates `stats`/`result` from the recorded outcomes.
pub struct TransactionWorker {
    transactions: Vec<Arc<Transaction>>,
    handle: Option<JoinHandle<Vec<bool>>>,
    stats: Vec<bool>,
}

impl TransactionWorker {
    pub fn new() -> TransactionWorker {
        TransactionWorker {
            transactions: Vec::new(),
            handle: None,
            stats: Vec::new(),
        }
    }

    /// Queues a transaction to run on this worker's thread. Panics if
    /// called after [`TransactionWorker::run`].
    pub fn add_transaction(&mut self, txn: Arc<Transaction>) {
        assert!(self.handle.is_none(), "worker already started");
        self.transactions.push(txn);
    }

    /// Spawns the worker thread, which runs every queued transaction in
    /// order via [`Transaction::run`] and records each result.
    pub fn run(&mut self) {
        assert!(self.handle.is_none(), "worker already started");
        let transactions = std::mem::take(&mut self.transactions);
        self.handle = Some(thread::spawn(move || {
            let mut stats = Vec::with_capacity(transactions.len());
            for txn in &transactions {
                let committed = txn.run();
                info!("transaction {} finished: committed={}", txn.id(), committed);
                stats.push(committed);
            }
            stats
        }));
    }

    /// Blocks until the worker thread finishes, records the per-
    /// transaction commit results into `stats` (readable via
    /// [`TransactionWorker::stats`]/[`TransactionWorker::result`]), and
    /// returns them in queued order. Panics if the thread panicked, or if
    /// `run` was never called.
    pub fn join(&mut self) -> Vec<bool> {
        let stats = self
            .handle
            .take()
            .expect("worker was never started")
            .join()
            .expect("transaction worker thread panicked");
        self.stats = stats.clone();
        stats
    }

    /// Per-transaction commit/abort outcomes in queued order, as recorded
    /// by the most recent [`TransactionWorker::join`]. Empty before `join`
    /// returns.
    pub fn stats(&self) -> &[bool] {
        &self.stats
    }

    /// Number of queued transactions that committed, as recorded by the
    /// most recent [`TransactionWorker::join`].
    pub fn result(&self) -> usize {
        self.stats.iter().filter(|&&ok| ok).count()
    }
}

impl Default for TransactionWorker {
    fn default() -> Self {
        TransactionWorker::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer_pool::BufferPool;
    use crate::page_store::PageStore;
    use crate::query::Query;
    use crate::table::Table;

    #[test]
    fn runs_queued_transactions_and_reports_results() {
        let dir = tempfile::tempdir().unwrap();
        let store = PageStore::new(dir.path());
        let pool = Arc::new(BufferPool::new(64, store));
        let table = Arc::new(Table::new("t", 2, 0, pool));
        let query = Arc::new(Query::new(Arc::clone(&table)));

        let mut worker = TransactionWorker::new();
        for k in 1..=3 {
            let txn = Arc::new(Transaction::new(k as u64));
            let q = Arc::clone(&query);
            txn.add_query(move |t| q.insert(t, &[k, k * 2]));
            worker.add_transaction(txn);
        }

        worker.run();
        let results = worker.join();
        assert_eq!(results, vec![true, true, true]);
        assert_eq!(worker.stats(), &[true, true, true]);
        assert_eq!(worker.result(), 3);

        let check = Transaction::new(100);
        assert_eq!(query.sum(&check, 1, 3, 1), Some(12));
    }

    #[test]
    fn result_counts_only_committed_transactions() {
        let dir = tempfile::tempdir().unwrap();
        let store = PageStore::new(dir.path());
        let pool = Arc::new(BufferPool::new(64, store));
        let table = Arc::new(Table::new("t", 2, 0, pool));
        let query = Arc::new(Query::new(Arc::clone(&table)));

        let mut worker = TransactionWorker::new();

        let ok_txn = Arc::new(Transaction::new(1));
        let q1 = Arc::clone(&query);
        ok_txn.add_query(move |t| q1.insert(t, &[1, 10]));
        worker.add_transaction(ok_txn);

        let bad_txn = Arc::new(Transaction::new(2));
        let q2 = Arc::clone(&query);
        // wrong arity: fails without touching the lock manager, so this
        // transaction aborts for good instead of retrying forever.
        bad_txn.add_query(move |t| q2.insert(t, &[1]));
        worker.add_transaction(bad_txn);

        worker.run();
        let results = worker.join();
        assert_eq!(results, vec![true, false]);
        assert_eq!(worker.result(), 1);
    }
}
