use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use log::info;

use crate::buffer_pool::BufferPool;
use crate::config::{DATA_DIR, DEFAULT_BUFFERPOOL_PAGES};
use crate::error::StorageResult;
use crate::page_store::PageStore;
use crate::table::{Table, TableMetadata};

/// Owned handle to an open database directory: one shared buffer pool and
/// a name→table map, bootstrapped from `<root>/data/<table>/metadata.json`
/// on open and persisted back on close.
///
/// This is a plain owned value returned by [`Database::open`], not a
/// process-wide singleton — see DESIGN.md for why.
pub struct Database {
    root: PathBuf,
    store: PageStore,
    buffer_pool: Arc<BufferPool>,
    tables: Mutex<HashMap<String, Arc<Table>>>,
}

impl Database {
    /// Opens (creating if necessary) the database directory at `path`,
    /// rehydrating any tables whose metadata was previously flushed.
    pub fn open(path: impl Into<PathBuf>) -> StorageResult<Database> {
        let root: PathBuf = path.into();
        std::fs::create_dir_all(root.join(DATA_DIR))?;

        let buffer_pool = Arc::new(BufferPool::new(DEFAULT_BUFFERPOOL_PAGES, PageStore::new(root.clone())));
        let store = PageStore::new(root.clone());

        let mut tables = HashMap::new();
        if let Ok(entries) = std::fs::read_dir(root.join(DATA_DIR)) {
            for entry in entries.flatten() {
                if !entry.path().is_dir() {
                    continue;
                }
                let name = entry.file_name().to_string_lossy().to_string();
                if let Some(descriptor) = TableMetadata::load(&store, &name)? {
                    info!("rehydrated table {:?} from {:?}", name, root);
                    tables.insert(name, Arc::new(Table::load_from_disk(descriptor, Arc::clone(&buffer_pool))));
                }
            }
        }

        Ok(Database {
            root,
            store,
            buffer_pool,
            tables: Mutex::new(tables),
        })
    }

    pub fn root(&self) -> &std::path::Path {
        &self.root
    }

    /// Creates a table with `num_columns` columns keyed on column
    /// `key_index`. Creating a table that already exists is idempotent:
    /// the existing table is returned unchanged.
    pub fn create_table(&self, name: &str, num_columns: usize, key_index: usize) -> StorageResult<Arc<Table>> {
        let mut tables = self.tables.lock().unwrap();
        if let Some(existing) = tables.get(name) {
            return Ok(Arc::clone(existing));
        }

        self.store.ensure_table_dir(name)?;
        let table = Arc::new(Table::new(name, num_columns, key_index, Arc::clone(&self.buffer_pool)));
        tables.insert(name.to_string(), Arc::clone(&table));
        Ok(table)
    }

    pub fn get_table(&self, name: &str) -> Option<Arc<Table>> {
        self.tables.lock().unwrap().get(name).cloned()
    }

    pub fn drop_table(&self, name: &str) -> bool {
        self.tables.lock().unwrap().remove(name).is_some()
    }

    /// Flushes every resident dirty page and every table's metadata to
    /// disk. After this returns, a fresh `Database::open` on the same
    /// path reconstructs equivalent tables.
    pub fn close(&self) -> StorageResult<()> {
        self.buffer_pool.flush_all()?;
        for table in self.tables.lock().unwrap().values() {
            table.flush_to_disk(&self.store)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_table_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::open(dir.path()).unwrap();
        let a = db.create_table("grades", 3, 0).unwrap();
        let b = db.create_table("grades", 3, 0).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn reopen_rehydrates_table_metadata() {
        use crate::query::Query;
        use crate::transaction::Transaction;

        let dir = tempfile::tempdir().unwrap();
        {
            let db = Database::open(dir.path()).unwrap();
            let table = db.create_table("grades", 2, 0).unwrap();
            let query = Query::new(table);
            let txn = Transaction::new(1);
            assert!(query.insert(&txn, &[1, 42]));
            txn.commit();
            db.close().unwrap();
        }

        let db2 = Database::open(dir.path()).unwrap();
        let table = db2.get_table("grades").expect("table should survive reopen");
        let query = Query::new(table);
        let txn = Transaction::new(2);
        let rows = query.select(&txn, 1, 0, &[true, true]).unwrap();
        assert_eq!(rows[0].columns, vec![Some(1), Some(42)]);
    }
}
