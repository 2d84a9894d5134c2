
use serde::{Deserialize, Serialize};
use std::io;
use thiserror::Error;

/// Fixed page size of the cached file layer, in bytes.
/// Examples:
/// - `let page_no = offset / PAGE_SIZE as u64;`
/// - `let mut buf = [0u8; PAGE_SIZE];`
pub const PAGE_SIZE: usize = 8192;

/// Smallest cache the page layer will allocate (32 pages).
pub const MIN_CACHE: usize = 256 * 1024;

/// Cache allocated when the caller does not ask for a specific size.
pub const DEFAULT_CACHE: usize = 1024 * 1024;

/// Sentinel file offset meaning "no record here".
///
/// Used on disk wherever a link in a record or tree node is unset; it is
/// also why `u64::MAX` is not a valid key.
/// Examples:
/// - `header.next = NONE_OFFSET; // tail of the list`
/// - `if node.parent == NONE_OFFSET { /* root */ }`
pub const NONE_OFFSET: u64 = u64::MAX;

/// Canonical error type shared across the storage stack.
#[derive(Error, Debug)]
pub enum DbError {
    /// The file layout or a structural invariant is not what it must be.
    #[error("storage: {0}")]
    Storage(String),
    /// A checksum or consistency check failed on data read back from disk.
    #[error("corrupted: {0}")]
    Corrupted(String),
    /// Insert of a key that is already present.
    #[error("duplicate key {0}")]
    DuplicateKey(u64),
    /// Update or erase of a key that is not present.
    #[error("key {0} not found")]
    KeyNotFound(u64),
    /// Mutation attempted on a database opened read-only.
    #[error("database is read-only")]
    ReadOnly,
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Result alias that carries a `DbError`.
pub type DbResult<T> = Result<T, DbError>;

/// Runtime configuration for a database handle.
///
/// # Example
/// ```
/// use common::Config;
///
/// let config = Config::builder()
///     .cache_bytes(4 * 1024 * 1024)
///     .read_only(false)
///     .free_lookup_depth(64)
///     .build();
/// ```
#[derive(Clone, Debug, Serialize, Deserialize, bon::Builder)]
pub struct Config {
    /// Memory budget of the page cache in bytes, clamped up to `MIN_CACHE`.
    #[builder(default = DEFAULT_CACHE)]
    pub cache_bytes: usize,
    /// Opens the file for reading only; every mutating call reports
    /// `DbError::ReadOnly`.
    #[builder(default = false)]
    pub read_only: bool,
    /// Upper bound on how many free records one allocation may inspect.
    /// `None` scans the whole free list.
    pub free_lookup_depth: Option<usize>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            cache_bytes: DEFAULT_CACHE,
            read_only: false,
            free_lookup_depth: None,
        }
    }
}

/// Convenient re-exports for downstream crates.
pub mod prelude {
    pub use crate::{Config, DbError, DbResult, DEFAULT_CACHE, MIN_CACHE, NONE_OFFSET, PAGE_SIZE};
}
