use std::path::{Path, PathBuf};

use log::debug;

use crate::config::{BASE_DIR, DATA_DIR, TAIL_DIR};
use crate::error::StorageResult;

/// Filesystem adapter mapping `(table, is_base, column, page_index)` to a
/// byte blob. Contains no in-memory caching of its own; that is the
/// [`crate::buffer_pool::BufferPool`]'s job.
pub struct PageStore {
    root: PathBuf,
}

impl PageStore {
    pub fn new(root: impl Into<PathBuf>) -> PageStore {
        PageStore { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Deterministic on-disk path for a page:
    /// `<root>/data/<table>/<base|tail>/<base|tail>_col<c>_pg<p>.bin`
    pub fn page_path(&self, table: &str, is_base: bool, col: usize, page_index: usize) -> PathBuf {
        let subdir = if is_base { BASE_DIR } else { TAIL_DIR };
        let prefix = if is_base { "base" } else { "tail" };
        self.root
            .join(DATA_DIR)
            .join(table)
            .join(subdir)
            .join(format!("{}_col{}_pg{}.bin", prefix, col, page_index))
    }

    /// Reads the raw bytes of a page file. Returns `None` if the file does
    /// not exist; any other I/O failure is fatal.
    pub fn read_page_bytes(&self, path: &Path) -> StorageResult<Option<Vec<u8>>> {
        match std::fs::read(path) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Writes (overwrites) a page file, creating parent directories on
    /// demand. Atomic replace is not required: the engine tolerates whole
    /// rewrites between flushes.
    pub fn write_page_bytes(&self, path: &Path, bytes: &[u8]) -> StorageResult<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        debug!("writing page: {:?} ({} bytes)", path, bytes.len());
        std::fs::write(path, bytes)?;
        Ok(())
    }

    /// Ensures `<root>/data/<table>/{base,tail}/` exist.
    pub fn ensure_table_dir(&self, table: &str) -> StorageResult<PathBuf> {
        let table_dir = self.root.join(DATA_DIR).join(table);
        std::fs::create_dir_all(table_dir.join(BASE_DIR))?;
        std::fs::create_dir_all(table_dir.join(TAIL_DIR))?;
        Ok(table_dir)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_path_is_deterministic() {
        let store = PageStore::new("/tmp/does-not-exist-db-root");
        let p = store.page_path("grades", true, 2, 7);
        assert!(p.ends_with("data/grades/base/base_col2_pg7.bin"));
    }

    #[test]
    fn missing_file_reads_as_none() {
        let dir = tempfile::tempdir().unwrap();
        let store = PageStore::new(dir.path());
        let p = store.page_path("grades", true, 0, 0);
        assert!(store.read_page_bytes(&p).unwrap().is_none());
    }

    #[test]
    fn write_then_read_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let store = PageStore::new(dir.path());
        let p = store.page_path("grades", false, 1, 3);
        store.write_page_bytes(&p, &[1, 2, 3, 4]).unwrap();
        assert_eq!(store.read_page_bytes(&p).unwrap().unwrap(), vec![1, 2, 3, 4]);
    }
}
