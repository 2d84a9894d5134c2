//! Embedded single-file key/value database.
//!
//! `Database` is the thin façade over the storage stack: a B+ tree index
//! whose nodes and values live as records in one file, served through a
//! fixed-page LRU cache. Keys are unsigned 64-bit integers, values are
//! strings. One handle owns the file; callers needing cross-thread access
//! serialise it themselves.
//!
//! # Example
//!
//! ```no_run
//! use database::Database;
//!
//! let mut db = Database::open("/tmp/example.db").unwrap();
//! db.insert(1, "first").unwrap();
//! let auto_key = db.insert_auto("second").unwrap();
//! assert_eq!(db.get(1).unwrap(), Some("first".to_string()));
//! assert_eq!(db.get(auto_key).unwrap(), Some("second".to_string()));
//! db.close().unwrap();
//! ```

use std::path::Path;

use btree::BTreeIndex;
use buffer::CachedFile;
use storage::RecordFile;

pub use buffer::CacheStat;
pub use common::{Config, DbError, DbResult};

/// One open database file.
///
/// Every mutating call persists the affected tree nodes and headers into
/// the page cache before returning; [`flush`](Database::flush) (or
/// [`close`](Database::close)) pushes them to the device.
#[derive(Debug)]
pub struct Database {
    index: BTreeIndex,
}

impl Database {
    /// Open or create the database at `path` with default configuration.
    pub fn open(path: impl AsRef<Path>) -> DbResult<Self> {
        Self::open_with(path, Config::default())
    }

    /// Open or create the database at `path`.
    ///
    /// A read-only open requires the file to exist and hold a valid
    /// database; a writable open of a fresh file initialises it.
    pub fn open_with(path: impl AsRef<Path>, config: Config) -> DbResult<Self> {
        let file = CachedFile::open(path, config.cache_bytes, config.read_only)?;
        let records = RecordFile::new(file, config.free_lookup_depth)?;
        let index = BTreeIndex::open(records)?;
        Ok(Self { index })
    }

    /// Flush everything and release the handle.
    ///
    /// Consuming the handle makes a second close impossible; dropping
    /// without calling this still flushes, but without error reporting.
    pub fn close(mut self) -> DbResult<()> {
        self.index.flush()
    }

    /// Number of key/value pairs stored.
    pub fn size(&self) -> u64 {
        self.index.size()
    }

    /// Whether `key` is present.
    pub fn contains(&mut self, key: u64) -> DbResult<bool> {
        self.index.contains(key)
    }

    /// Insert a pair under an explicit key.
    pub fn insert(&mut self, key: u64, value: &str) -> DbResult<()> {
        self.ensure_writable()?;
        self.index.insert(key, value)
    }

    /// Insert a value under the next automatic key and return that key.
    pub fn insert_auto(&mut self, value: &str) -> DbResult<u64> {
        self.ensure_writable()?;
        let key = self.index.next_auto_key();
        self.index.insert(key, value)?;
        Ok(key)
    }

    /// Fetch the value stored under `key`; a hit anchors the cursor there.
    pub fn get(&mut self, key: u64) -> DbResult<Option<String>> {
        self.index.search(key)
    }

    /// Replace the value of an existing key.
    pub fn update(&mut self, key: u64, value: &str) -> DbResult<()> {
        self.ensure_writable()?;
        self.index.update(key, value)
    }

    /// Remove a key and its value.
    pub fn erase(&mut self, key: u64) -> DbResult<()> {
        self.ensure_writable()?;
        self.index.erase(key)
    }

    /// Smallest entry; anchors the cursor.
    pub fn first(&mut self) -> DbResult<Option<(u64, String)>> {
        self.index.first()
    }

    /// Largest entry; anchors the cursor.
    pub fn last(&mut self) -> DbResult<Option<(u64, String)>> {
        self.index.last()
    }

    /// Next entry in ascending order, or `None` at the end or after the
    /// tree changed since the cursor was anchored.
    pub fn next(&mut self) -> DbResult<Option<(u64, String)>> {
        self.index.next()
    }

    /// Previous entry in descending order.
    pub fn previous(&mut self) -> DbResult<Option<(u64, String)>> {
        self.index.previous()
    }

    /// Push every buffered page to the device.
    pub fn flush(&mut self) -> DbResult<()> {
        self.index.flush()
    }

    /// One page-cache statistic (see [`CacheStat`]).
    pub fn stat(&self, stat: CacheStat) -> f64 {
        self.index.records().cache().stat(stat)
    }

    /// The key the next [`insert_auto`](Database::insert_auto) would use.
    pub fn next_auto_key(&self) -> u64 {
        self.index.next_auto_key()
    }

    pub fn is_read_only(&self) -> bool {
        self.index.is_read_only()
    }

    fn ensure_writable(&self) -> DbResult<()> {
        if self.index.is_read_only() {
            return Err(DbError::ReadOnly);
        }
        Ok(())
    }
}
