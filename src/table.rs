use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};

use crate::buffer_pool::{BufferPool, FrameKey};
use crate::config::MAX_RECORDS;
use crate::error::StorageResult;
use crate::index::Index;
use crate::lock_manager::LockManager;
use crate::page_store::PageStore;
use crate::record::{Record, RecordEntry, RecordEntryJson, SchemaBits};

/// A page-and-slot position, recording exactly where a column value was
/// appended.
pub type Position = (usize, usize);

/// All metadata a table carries in memory: the record directory,
/// key→rid map, per-column page counters/slots, and per-rid page
/// positions. Guarded by a single mutex (`Table::meta`) — separate
/// per-table mutexes are collapsed into one, since nearly every operation
/// needs all of them together.
pub(crate) struct TableMeta {
    pub next_rid: u64,
    pub page_directory: HashMap<u64, RecordEntry>,
    pub key_to_rid: HashMap<i64, u64>,
    pub base_page_counts: Vec<usize>,
    pub tail_page_counts: Vec<usize>,
    pub base_page_next_slot: Vec<usize>,
    pub tail_page_next_slot: Vec<usize>,
    pub base_positions: HashMap<u64, Vec<Option<Position>>>,
    pub tail_positions: HashMap<u64, Vec<Option<Position>>>,
    pub index: Index,
}

impl TableMeta {
    fn new(num_columns: usize) -> TableMeta {
        TableMeta {
            next_rid: 1,
            page_directory: HashMap::new(),
            key_to_rid: HashMap::new(),
            base_page_counts: vec![0; num_columns],
            tail_page_counts: vec![0; num_columns],
            base_page_next_slot: vec![0; num_columns],
            tail_page_next_slot: vec![0; num_columns],
            base_positions: HashMap::new(),
            tail_positions: HashMap::new(),
            index: Index::new(num_columns),
        }
    }

    /// Appends one value to a column's page stream, allocating a new page
    /// when the current one is full (or doesn't exist yet). This is the
    /// per-column serialization point; the caller already holds the
    /// table's metadata mutex, so page allocation, slot counters, and the
    /// directory move atomically with respect to other writers.
    pub fn append_to_column(
        &mut self,
        buffer_pool: &BufferPool,
        table_name: &str,
        is_base: bool,
        col: usize,
        value: i64,
    ) -> StorageResult<Position> {
        let counts = if is_base {
            &mut self.base_page_counts
        } else {
            &mut self.tail_page_counts
        };
        let slots = if is_base {
            &mut self.base_page_next_slot
        } else {
            &mut self.tail_page_next_slot
        };

        if counts[col] == 0 || slots[col] >= MAX_RECORDS {
            let new_page_index = counts[col];
            counts[col] += 1;
            slots[col] = 0;

            let key = FrameKey::new(table_name, is_base, col, new_page_index);
            if let Some(frame) = buffer_pool.get_page(&key, true)? {
                {
                    let mut f = frame.lock().unwrap();
                    f.page.num_records = 0;
                }
                buffer_pool.mark_dirty(&frame);
                buffer_pool.unpin(&frame);
            }
        }

        let page_index = counts[col] - 1;
        let slot_index = slots[col];

        let key = FrameKey::new(table_name, is_base, col, page_index);
        let frame = buffer_pool
            .get_page(&key, true)?
            .expect("page just allocated above must exist");
        {
            let mut f = frame.lock().unwrap();
            f.page.num_records = slot_index;
            f.page.write(value)?;
        }
        slots[col] += 1;
        buffer_pool.mark_dirty(&frame);
        buffer_pool.unpin(&frame);

        Ok((page_index, slot_index))
    }

    /// Reads the value at a specific page position, or `None` if that
    /// page is not resident/materialized.
    pub fn read_value_at(
        &self,
        buffer_pool: &BufferPool,
        table_name: &str,
        is_base: bool,
        col: usize,
        page_index: usize,
        slot_index: usize,
    ) -> StorageResult<Option<i64>> {
        let key = FrameKey::new(table_name, is_base, col, page_index);
        match buffer_pool.get_page(&key, false)? {
            None => Ok(None),
            Some(frame) => {
                let value = frame.lock().unwrap().page.read(slot_index as i64).ok();
                buffer_pool.unpin(&frame);
                Ok(value)
            }
        }
    }

    /// Resolves the base columns for `base_rid`: page values where a
    /// position is recorded (falling back to the directory value if the
    /// page read misses), directory values otherwise.
    fn base_columns(
        &self,
        buffer_pool: &BufferPool,
        table_name: &str,
        num_columns: usize,
        base: &RecordEntry,
        base_rid: u64,
    ) -> StorageResult<Vec<i64>> {
        let positions = self.base_positions.get(&base_rid);
        let mut out = Vec::with_capacity(num_columns);
        for c in 0..num_columns {
            let value = match positions.and_then(|p| p[c]) {
                Some((pg, slot)) => self
                    .read_value_at(buffer_pool, table_name, true, c, pg, slot)?
                    .unwrap_or(base.values[c]),
                None => base.values[c],
            };
            out.push(value);
        }
        Ok(out)
    }

    /// Applies one tail entry's updated columns onto `columns` in place.
    fn apply_tail(
        &self,
        buffer_pool: &BufferPool,
        table_name: &str,
        num_columns: usize,
        tail: &RecordEntry,
        columns: &mut [i64],
    ) -> StorageResult<()> {
        let positions = self.tail_positions.get(&tail.rid);
        for c in 0..num_columns {
            if !tail.schema.get(c) {
                continue;
            }
            let value = match positions.and_then(|p| p[c]) {
                Some((pg, slot)) => self
                    .read_value_at(buffer_pool, table_name, false, c, pg, slot)?
                    .unwrap_or(tail.values[c]),
                None => tail.values[c],
            };
            columns[c] = value;
        }
        Ok(())
    }

    /// Walks the indirection chain from `base`, skipping the `skip_newest`
    /// most recent tails, and returns the remaining tails oldest-first.
    fn tail_chain(&self, base: &RecordEntry, skip_newest: usize) -> Vec<&RecordEntry> {
        let mut tail_rid = base.indirection;
        for _ in 0..skip_newest {
            if tail_rid == 0 {
                break;
            }
            let tail = match self.page_directory.get(&tail_rid) {
                Some(t) => t,
                None => break,
            };
            tail_rid = tail.indirection;
        }

        let mut newest_first = Vec::new();
        while tail_rid != 0 {
            let tail = match self.page_directory.get(&tail_rid) {
                Some(t) => t,
                None => break,
            };
            newest_first.push(tail);
            tail_rid = tail.indirection;
        }
        newest_first.reverse();
        newest_first
    }

    /// Full record materialization: base values overlaid with
    /// tails from oldest to newest, `skip_newest` of the most recent tails
    /// discarded (0 for `select`, `|relative_version|` for
    /// `select_version`), then projected by `mask`.
    pub fn materialize(
        &self,
        buffer_pool: &BufferPool,
        table_name: &str,
        num_columns: usize,
        key_index: usize,
        base_rid: u64,
        mask: &[bool],
        skip_newest: usize,
    ) -> StorageResult<Option<Record>> {
        let base = match self.page_directory.get(&base_rid) {
            Some(b) if !b.is_tombstoned() => b,
            _ => return Ok(None),
        };

        let mut columns = self.base_columns(buffer_pool, table_name, num_columns, base, base_rid)?;

        for tail in self.tail_chain(base, skip_newest) {
            self.apply_tail(buffer_pool, table_name, num_columns, tail, &mut columns)?;
        }

        let key = columns[key_index];
        let projected = columns
            .into_iter()
            .zip(mask.iter())
            .map(|(v, include)| if *include { Some(v) } else { None })
            .collect();

        Ok(Some(Record {
            rid: base_rid,
            key,
            columns: projected,
        }))
    }

    /// Current materialized value of `column` for `base_rid`, used by
    /// `Index::create_index` to seed a fresh index.
    pub fn current_value(&self, base_rid: u64, column: usize) -> Option<i64> {
        let base = self.page_directory.get(&base_rid)?;
        let mut value = base.values[column];
        let mut tail_rid = base.indirection;
        while tail_rid != 0 {
            let tail = self.page_directory.get(&tail_rid)?;
            if tail.schema.get(column) {
                value = tail.values[column];
                break;
            }
            tail_rid = tail.indirection;
        }
        Some(value)
    }
}

/// `(name, num_columns, key_index)` plus the metadata above and shared
/// handles to the buffer pool and this table's lock manager (each table
/// owns its own lock manager).
pub struct Table {
    pub name: String,
    pub num_columns: usize,
    pub key_index: usize,
    pub buffer_pool: Arc<BufferPool>,
    pub lock_manager: Arc<LockManager>,
    pub(crate) meta: Mutex<TableMeta>,
}

impl Table {
    pub fn new(
        name: impl Into<String>,
        num_columns: usize,
        key_index: usize,
        buffer_pool: Arc<BufferPool>,
    ) -> Table {
        assert!(num_columns >= 1, "a table needs at least one column");
        assert!(key_index < num_columns, "key_index out of range");
        Table {
            name: name.into(),
            num_columns,
            key_index,
            buffer_pool,
            lock_manager: Arc::new(LockManager::new()),
            meta: Mutex::new(TableMeta::new(num_columns)),
        }
    }

    /// Runs `f` with exclusive access to this table's metadata and a
    /// reference to the shared buffer pool. Every `Query` operation goes
    /// through this single critical section.
    pub(crate) fn with_meta<R>(&self, f: impl FnOnce(&mut TableMeta) -> R) -> R {
        let mut meta = self.meta.lock().unwrap();
        f(&mut meta)
    }

    /// Builds a fresh secondary index on `column` by resolving every live
    /// key's current value.
    pub fn create_index(&self, column: usize) {
        assert!(column < self.num_columns, "column out of range");
        self.with_meta(|meta| {
            let entries: Vec<(i64, u64)> = meta
                .key_to_rid
                .values()
                .filter_map(|&rid| meta.current_value(rid, column).map(|v| (v, rid)))
                .collect();
            meta.index.create_index(column, entries.into_iter());
        });
    }

    /// Discards the secondary index on `column`, if any.
    pub fn drop_index(&self, column: usize) {
        assert!(column < self.num_columns, "column out of range");
        self.with_meta(|meta| meta.index.drop_index(column));
    }

    pub fn flush_to_disk(&self, store: &PageStore) -> StorageResult<()> {
        let descriptor = self.with_meta(|meta| TableMetadata::from_live(self, meta));
        store.ensure_table_dir(&self.name)?;
        let path = store.root().join(crate::config::DATA_DIR).join(&self.name).join(crate::config::METADATA_FILE);
        let json = serde_json::to_string_pretty(&descriptor).expect("metadata is always serializable");
        std::fs::write(path, json)?;
        Ok(())
    }

    /// Rebuilds a `Table` from a previously persisted descriptor, wiring
    /// in the live (shared) buffer pool handle, which is never itself
    /// serialized.
    pub fn load_from_disk(descriptor: TableMetadata, buffer_pool: Arc<BufferPool>) -> Table {
        let num_columns = descriptor.num_columns;
        let meta = TableMeta {
            next_rid: descriptor.next_rid,
            page_directory: descriptor
                .page_directory
                .into_iter()
                .map(|(rid, entry)| (rid, entry.into()))
                .collect(),
            key_to_rid: descriptor.key_to_rid,
            base_page_counts: descriptor.base_page_counts,
            tail_page_counts: descriptor.tail_page_counts,
            base_page_next_slot: descriptor.base_page_next_slot,
            tail_page_next_slot: descriptor.tail_page_next_slot,
            base_positions: descriptor.base_positions,
            tail_positions: descriptor.tail_positions,
            index: Index::new(num_columns),
        };
        Table {
            name: descriptor.name,
            num_columns,
            key_index: descriptor.key,
            buffer_pool,
            lock_manager: Arc::new(LockManager::new()),
            meta: Mutex::new(meta),
        }
    }
}

/// JSON-serializable table descriptor persisted to `metadata.json`.
/// Integer-keyed maps serialize with stringified keys (serde_json's
/// default for non-string map keys), and are parsed back to integers on
/// load.
#[derive(Debug, Serialize, Deserialize)]
pub struct TableMetadata {
    pub name: String,
    pub num_columns: usize,
    pub key: usize,
    pub next_rid: u64,
    pub key_to_rid: HashMap<i64, u64>,
    pub page_directory: HashMap<u64, RecordEntryJson>,
    pub base_page_counts: Vec<usize>,
    pub tail_page_counts: Vec<usize>,
    pub base_page_next_slot: Vec<usize>,
    pub tail_page_next_slot: Vec<usize>,
    pub base_positions: HashMap<u64, Vec<Option<Position>>>,
    pub tail_positions: HashMap<u64, Vec<Option<Position>>>,
}

impl TableMetadata {
    fn from_live(table: &Table, meta: &TableMeta) -> TableMetadata {
        TableMetadata {
            name: table.name.clone(),
            num_columns: table.num_columns,
            key: table.key_index,
            next_rid: meta.next_rid,
            key_to_rid: meta.key_to_rid.clone(),
            page_directory: meta
                .page_directory
                .iter()
                .map(|(rid, entry)| (*rid, entry.into()))
                .collect(),
            base_page_counts: meta.base_page_counts.clone(),
            tail_page_counts: meta.tail_page_counts.clone(),
            base_page_next_slot: meta.base_page_next_slot.clone(),
            tail_page_next_slot: meta.tail_page_next_slot.clone(),
            base_positions: meta.base_positions.clone(),
            tail_positions: meta.tail_positions.clone(),
        }
    }

    pub fn load(store: &PageStore, table_name: &str) -> StorageResult<Option<TableMetadata>> {
        let path = store
            .root()
            .join(crate::config::DATA_DIR)
            .join(table_name)
            .join(crate::config::METADATA_FILE);
        match std::fs::read_to_string(&path) {
            Ok(s) => Ok(Some(serde_json::from_str(&s).expect("metadata.json is always well-formed"))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer_pool::BufferPool;
    use crate::page_store::PageStore;

    fn fresh_table(num_columns: usize, key_index: usize) -> (tempfile::TempDir, Table) {
        let dir = tempfile::tempdir().unwrap();
        let store = PageStore::new(dir.path());
        let pool = Arc::new(BufferPool::new(128, store));
        (dir, Table::new("t", num_columns, key_index, pool))
    }

    #[test]
    fn append_crosses_page_boundary() {
        let (_dir, table) = fresh_table(1, 0);
        table.with_meta(|meta| {
            for i in 0..(MAX_RECORDS as i64 + 1) {
                meta.append_to_column(&table.buffer_pool, &table.name, true, 0, i).unwrap();
            }
            assert_eq!(meta.base_page_counts[0], 2);
            assert_eq!(meta.base_page_next_slot[0], 1);
            let v = meta
                .read_value_at(&table.buffer_pool, &table.name, true, 0, 1, 0)
                .unwrap()
                .unwrap();
            assert_eq!(v, MAX_RECORDS as i64);
        });
    }

    #[test]
    fn materialize_base_only() {
        let (_dir, table) = fresh_table(3, 0);
        table.with_meta(|meta| {
            let rid = meta.next_rid;
            meta.next_rid += 1;
            let mut entry = RecordEntry::new_base(rid, 0, vec![1, 2, 3]);
            let mut positions = Vec::new();
            for (c, v) in entry.values.clone().into_iter().enumerate() {
                positions.push(Some(meta.append_to_column(&table.buffer_pool, &table.name, true, c, v).unwrap()));
            }
            meta.page_directory.insert(rid, entry.clone());
            meta.base_positions.insert(rid, positions);
            meta.key_to_rid.insert(1, rid);

            let rec = meta
                .materialize(&table.buffer_pool, &table.name, 3, 0, rid, &[true, true, true], 0)
                .unwrap()
                .unwrap();
            assert_eq!(rec.columns, vec![Some(1), Some(2), Some(3)]);
            entry.rid = rid;
        });
    }
}
