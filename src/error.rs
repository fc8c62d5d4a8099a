use std::fmt;

/// Error kinds surfaced by the page/buffer-pool layer.
///
/// None of these ever cross the `Query` boundary directly: Query
/// operations catch them and translate into `false`/empty results. They
/// exist so internal call sites can distinguish a programmer error
/// (`PageFull`, `OutOfBounds`, `BadPageSize`, `PoolExhausted`) from a normal
/// I/O failure.
#[derive(Debug)]
pub enum StorageError {
    /// `Page::write` called with no remaining capacity.
    PageFull,
    /// `Page::read` called with an out-of-range slot index.
    OutOfBounds { index: i64, num_records: i64 },
    /// `Page::from_bytes` called with a buffer that isn't exactly
    /// `PAGE_SIZE` bytes.
    BadPageSize { actual: usize },
    /// The buffer pool needed to evict a frame but every resident frame was
    /// pinned.
    PoolExhausted,
    /// A filesystem operation failed for a reason other than "file does
    /// not exist".
    Io(std::io::Error),
}

impl fmt::Display for StorageError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            StorageError::PageFull => write!(f, "page is full"),
            StorageError::OutOfBounds { index, num_records } => write!(
                f,
                "index {} out of bounds (num_records = {})",
                index, num_records
            ),
            StorageError::BadPageSize { actual } => {
                write!(f, "invalid page size for from_bytes: {} bytes", actual)
            }
            StorageError::PoolExhausted => {
                write!(f, "buffer pool is full and all pages are pinned")
            }
            StorageError::Io(e) => write!(f, "io error: {}", e),
        }
    }
}

impl std::error::Error for StorageError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            StorageError::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for StorageError {
    fn from(e: std::io::Error) -> Self {
        StorageError::Io(e)
    }
}

pub type StorageResult<T> = Result<T, StorageError>;
