use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use log::debug;

/// Lock state held on one primary key: at most one exclusive holder, or
/// any number of shared holders, never both (except momentarily during an
/// upgrade, which this implementation performs atomically under the table
/// mutex so no other caller ever observes that intermediate state).
#[derive(Default)]
struct LockState {
    exclusive: Option<u64>,
    shared: HashSet<u64>,
}

impl LockState {
    fn is_empty(&self) -> bool {
        self.exclusive.is_none() && self.shared.is_empty()
    }
}

/// Per-primary-key shared/exclusive lock table with upgrade and a no-wait
/// conflict policy: a caller whose request conflicts gets `false`
/// immediately and must abort (strict 2PL, no queueing, no deadlock
/// detection, no timeout).
///
/// A single mutex guards the whole table; none of these methods call back
/// into `Query`/`Table` while holding it.
pub struct LockManager {
    table: Mutex<HashMap<i64, LockState>>,
}

impl LockManager {
    pub fn new() -> LockManager {
        LockManager {
            table: Mutex::new(HashMap::new()),
        }
    }

    /// Grants a shared lock unless another transaction holds exclusive.
    /// A transaction that already holds exclusive is granted shared too
    /// (X dominates S).
    pub fn acquire_shared(&self, key: i64, txn: u64) -> bool {
        let mut table = self.table.lock().unwrap();
        let state = table.entry(key).or_default();

        if let Some(holder) = state.exclusive {
            if holder != txn {
                return false;
            }
            debug!("shared lock granted via existing exclusive: key={} txn={}", key, txn);
            return true;
        }

        state.shared.insert(txn);
        debug!("shared lock acquired: key={} txn={}", key, txn);
        true
    }

    /// Grants an exclusive lock when there are no other holders, when this
    /// transaction already holds exclusive (idempotent), or as an upgrade
    /// when this transaction is the sole shared holder.
    pub fn acquire_exclusive(&self, key: i64, txn: u64) -> bool {
        let mut table = self.table.lock().unwrap();
        let state = table.entry(key).or_default();

        if let Some(holder) = state.exclusive {
            return holder == txn;
        }

        match state.shared.len() {
            0 => {
                state.exclusive = Some(txn);
                debug!("exclusive lock acquired: key={} txn={}", key, txn);
                true
            }
            1 if state.shared.contains(&txn) => {
                state.shared.clear();
                state.exclusive = Some(txn);
                debug!("exclusive lock upgraded: key={} txn={}", key, txn);
                true
            }
            _ => false,
        }
    }

    /// Clears whichever of exclusive/shared `txn` holds on `key`,
    /// independently of one another. Returns whether anything changed.
    ///
    /// Note: this deliberately does not reproduce an "exclusive held and
    /// txn in shared" check seen in some lock manager implementations,
    /// which is unreachable given the lock invariants here.
    pub fn release(&self, key: i64, txn: u64) -> bool {
        let mut table = self.table.lock().unwrap();
        let mut changed = false;

        if let Some(state) = table.get_mut(&key) {
            if state.exclusive == Some(txn) {
                state.exclusive = None;
                changed = true;
            }
            if state.shared.remove(&txn) {
                changed = true;
            }
            if state.is_empty() {
                table.remove(&key);
            }
        }

        changed
    }

    /// Clears every lock held by `txn` across the whole table.
    pub fn release_all(&self, txn: u64) {
        let mut table = self.table.lock().unwrap();
        table.retain(|_, state| {
            if state.exclusive == Some(txn) {
                state.exclusive = None;
            }
            state.shared.remove(&txn);
            !state.is_empty()
        });
    }

    /// Drops all lock state. Used to reset the manager in tests.
    pub fn clear(&self) {
        self.table.lock().unwrap().clear();
    }
}

impl Default for LockManager {
    fn default() -> Self {
        LockManager::new()
    }
}
