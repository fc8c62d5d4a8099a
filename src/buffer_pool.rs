use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use log::debug;

use crate::error::{StorageError, StorageResult};
use crate::page::Page;
use crate::page_store::PageStore;

/// Identity of a resident frame: which table, which stream (base or
/// tail), which column, which page index.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FrameKey {
    pub table: String,
    pub is_base: bool,
    pub col: usize,
    pub page_index: usize,
}

impl FrameKey {
    pub fn new(table: impl Into<String>, is_base: bool, col: usize, page_index: usize) -> Self {
        FrameKey {
            table: table.into(),
            is_base,
            col,
            page_index,
        }
    }
}

/// A cached page plus its pin count, dirty bit, and recency timestamp.
pub struct PageFrame {
    pub key: FrameKey,
    pub page: Page,
    pub pin_count: u32,
    pub dirty: bool,
    pub last_used: Instant,
}

impl PageFrame {
    fn new(key: FrameKey, page: Page) -> Self {
        PageFrame {
            key,
            page,
            pin_count: 0,
            dirty: false,
            last_used: Instant::now(),
        }
    }

    fn pin(&mut self) {
        self.pin_count += 1;
        self.last_used = Instant::now();
    }

    fn unpin(&mut self) {
        self.pin_count = self.pin_count.saturating_sub(1);
        self.last_used = Instant::now();
    }
}

/// A handle to a pinned frame. `get_page` hands these out; callers must
/// `unpin` (via [`BufferPool::unpin`]) before dropping their reference to
/// the underlying frame, since the pool itself does not track pin lifetime
/// through RAII — every call site must unpin explicitly.
pub type FrameHandle = Arc<Mutex<PageFrame>>;

struct Inner {
    max_pages: usize,
    frames: HashMap<FrameKey, FrameHandle>,
    // insertion/access order, used by "Toss Immediate" eviction: the first
    // unpinned frame encountered while scanning in this order is evicted.
    order: Vec<FrameKey>,
    store: PageStore,
}

/// Bounded cache of resident page frames with pin/unpin, dirty tracking,
/// and "Toss Immediate" eviction (first unpinned frame scanned, in
/// residency order).
///
/// A single pool-wide mutex serializes `get_page`, `mark_dirty`, `unpin`,
/// `flush_all`, and eviction. A frame's `Page` is mutated by its pinner(s)
/// outside that mutex; the table's per-column append serialization (one
/// metadata mutex per table) ensures no two writers touch the same page
/// concurrently.
pub struct BufferPool {
    inner: Mutex<Inner>,
}

impl BufferPool {
    pub fn new(max_pages: usize, store: PageStore) -> BufferPool {
        BufferPool {
            inner: Mutex::new(Inner {
                max_pages,
                frames: HashMap::new(),
                order: Vec::new(),
                store,
            }),
        }
    }

    /// Fetches (and pins) the frame for `key`, reading it from disk or
    /// allocating a fresh page if absent and `create_if_missing`.
    ///
    /// Returns `Ok(None)` if the page does not exist on disk and
    /// `create_if_missing` is false. Any other failure is fatal.
    pub fn get_page(&self, key: &FrameKey, create_if_missing: bool) -> StorageResult<Option<FrameHandle>> {
        let mut inner = self.inner.lock().unwrap();

        if let Some(handle) = inner.frames.get(key) {
            handle.lock().unwrap().pin();
            touch(&mut inner.order, key);
            debug!("buffer pool hit: {:?}", key);
            return Ok(Some(Arc::clone(handle)));
        }

        if inner.frames.len() >= inner.max_pages {
            evict_one(&mut inner)?;
        }

        let path = inner.store.page_path(&key.table, key.is_base, key.col, key.page_index);
        let bytes = inner.store.read_page_bytes(&path)?;

        let page = match bytes {
            Some(b) => Page::from_bytes(&b)?,
            None => {
                if !create_if_missing {
                    return Ok(None);
                }
                Page::new()
            }
        };

        let mut frame = PageFrame::new(key.clone(), page);
        frame.pin();
        let handle = Arc::new(Mutex::new(frame));
        inner.frames.insert(key.clone(), Arc::clone(&handle));
        inner.order.push(key.clone());
        debug!("buffer pool fault: {:?}", key);
        Ok(Some(handle))
    }

    /// Marks a resident frame dirty.
    pub fn mark_dirty(&self, frame: &FrameHandle) {
        let _guard = self.inner.lock().unwrap();
        let mut f = frame.lock().unwrap();
        f.dirty = true;
        f.last_used = Instant::now();
    }

    /// Releases one pin on a frame.
    pub fn unpin(&self, frame: &FrameHandle) {
        let mut inner = self.inner.lock().unwrap();
        let key = {
            let mut f = frame.lock().unwrap();
            f.unpin();
            f.key.clone()
        };
        touch(&mut inner.order, &key);
    }

    /// Flushes every dirty resident frame to disk and clears their dirty
    /// bits. Does not evict.
    pub fn flush_all(&self) -> StorageResult<()> {
        let inner = self.inner.lock().unwrap();
        for handle in inner.frames.values() {
            let mut frame = handle.lock().unwrap();
            flush_if_dirty(&inner.store, &mut frame)?;
        }
        Ok(())
    }

    /// Drops all resident frames without flushing. Used to reset buffer
    /// pool state in tests.
    pub fn clear(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.frames.clear();
        inner.order.clear();
    }
}

fn touch(order: &mut Vec<FrameKey>, key: &FrameKey) {
    if let Some(pos) = order.iter().position(|k| k == key) {
        let k = order.remove(pos);
        order.push(k);
    } else {
        order.push(key.clone());
    }
}

fn flush_if_dirty(store: &PageStore, frame: &mut PageFrame) -> StorageResult<()> {
    if !frame.dirty {
        return Ok(());
    }
    let path = store.page_path(&frame.key.table, frame.key.is_base, frame.key.col, frame.key.page_index);
    store.write_page_bytes(&path, &frame.page.to_bytes())?;
    frame.dirty = false;
    Ok(())
}

/// "Toss Immediate": scan resident frames in (roughly) iteration order and
/// evict the first one with `pin_count == 0`, flushing it first if dirty.
fn evict_one(inner: &mut Inner) -> StorageResult<()> {
    let candidate = inner.order.iter().find(|key| {
        inner
            .frames
            .get(*key)
            .map(|h| h.lock().unwrap().pin_count == 0)
            .unwrap_or(false)
    }).cloned();

    match candidate {
        Some(key) => {
            if let Some(handle) = inner.frames.get(&key) {
                let mut frame = handle.lock().unwrap();
                flush_if_dirty(&inner.store, &mut frame)?;
            }
            inner.frames.remove(&key);
            inner.order.retain(|k| k != &key);
            debug!("evicted frame: {:?}", key);
            Ok(())
        }
        None => Err(StorageError::PoolExhausted),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DEFAULT_BUFFERPOOL_PAGES;

    fn pool(max_pages: usize) -> (tempfile::TempDir, BufferPool) {
        let dir = tempfile::tempdir().unwrap();
        let store = PageStore::new(dir.path());
        (dir, BufferPool::new(max_pages, store))
    }

    #[test]
    fn fetch_creates_empty_page_when_missing() {
        let (_dir, pool) = pool(DEFAULT_BUFFERPOOL_PAGES);
        let key = FrameKey::new("t", true, 0, 0);
        let frame = pool.get_page(&key, true).unwrap().unwrap();
        assert_eq!(frame.lock().unwrap().page.num_records, 0);
        pool.unpin(&frame);
    }

    #[test]
    fn missing_without_create_returns_none() {
        let (_dir, pool) = pool(DEFAULT_BUFFERPOOL_PAGES);
        let key = FrameKey::new("t", true, 0, 0);
        assert!(pool.get_page(&key, false).unwrap().is_none());
    }

    #[test]
    fn dirty_flush_persists_bytes() {
        let (_dir, pool) = pool(DEFAULT_BUFFERPOOL_PAGES);
        let key = FrameKey::new("t", true, 0, 0);
        let frame = pool.get_page(&key, true).unwrap().unwrap();
        frame.lock().unwrap().page.write(99).unwrap();
        pool.mark_dirty(&frame);
        pool.unpin(&frame);
        pool.flush_all().unwrap();

        pool.clear();
        let reloaded = pool.get_page(&key, false).unwrap().unwrap();
        assert_eq!(reloaded.lock().unwrap().page.read(0).unwrap(), 99);
    }

    #[test]
    fn single_slot_pool_evicts_then_refetches() {
        let (_dir, pool) = pool(1);
        let a = FrameKey::new("t", true, 0, 0);
        let b = FrameKey::new("t", true, 0, 1);

        let fa = pool.get_page(&a, true).unwrap().unwrap();
        pool.unpin(&fa);

        // second key must evict the first since capacity is 1.
        let fb = pool.get_page(&b, true).unwrap().unwrap();
        pool.unpin(&fb);

        let fa_again = pool.get_page(&a, true).unwrap().unwrap();
        assert_eq!(fa_again.lock().unwrap().page.num_records, 0);
        pool.unpin(&fa_again);
    }

    #[test]
    fn exhausted_pool_fails_when_all_pinned() {
        let (_dir, pool) = pool(1);
        let a = FrameKey::new("t", true, 0, 0);
        let b = FrameKey::new("t", true, 0, 1);

        let _fa = pool.get_page(&a, true).unwrap().unwrap(); // stays pinned
        let err = pool.get_page(&b, true).unwrap_err();
        assert!(matches!(err, StorageError::PoolExhausted));
    }
}
