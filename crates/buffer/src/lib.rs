//! Page-cached random-access file I/O.
//!
//! `CachedFile` sits between the record layer and the operating system,
//! providing:
//! - Positioned byte reads and writes composed from fixed 8 KiB pages
//! - Strict LRU replacement with dirty-page write-back on eviction
//! - Fetch-before-write so partial page writes never lose resident bytes
//! - Sequential (page-number ordered) flushing and I/O statistics
//!
//! # Example
//!
//! ```no_run
//! use buffer::CachedFile;
//! use common::DEFAULT_CACHE;
//!
//! let mut file = CachedFile::open("/tmp/data.db", DEFAULT_CACHE, false).unwrap();
//! file.write(0, b"hello").unwrap();
//!
//! let mut buf = [0u8; 5];
//! file.read(0, &mut buf).unwrap();
//! assert_eq!(&buf, b"hello");
//!
//! file.flush().unwrap();
//! ```

#[cfg(test)]
mod tests;

use common::{DbError, DbResult, MIN_CACHE, PAGE_SIZE};
use hashbrown::HashMap;
use lru::LruCache;
use std::{
    fs::{File, OpenOptions},
    io::{Read, Seek, SeekFrom, Write},
    num::NonZeroUsize,
    path::Path,
    time::Instant,
};

/// One resident page of the backing file.
#[derive(Debug)]
struct Page {
    no: u64,
    /// Bytes of `data` actually populated, either from the file or by
    /// writes. Everything past `len` is zero.
    len: usize,
    data: Vec<u8>,
}

impl Page {
    fn empty(no: u64) -> Self {
        Self {
            no,
            len: 0,
            data: vec![0u8; PAGE_SIZE],
        }
    }
}

/// Selector for one cache statistic.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CacheStat {
    /// Total page lookups.
    Requests,
    /// Lookups that had to load the page from the file.
    Misses,
    /// Lookups served from memory.
    Hits,
    /// Hits over requests, 0–100.
    HitRate,
    /// Misses over requests, 0–100.
    MissRate,
    /// Bytes copied out to callers.
    BytesRead,
    /// Bytes copied in from callers.
    BytesWritten,
    /// Cumulative read time in nanoseconds.
    ReadTimeNs,
    /// Cumulative write and flush time in nanoseconds.
    WriteTimeNs,
    /// Read throughput in MB/s.
    ReadThroughput,
    /// Write throughput in MB/s.
    WriteThroughput,
}

#[derive(Clone, Copy, Debug, Default)]
struct Counters {
    requests: u64,
    misses: u64,
    bytes_read: u64,
    bytes_written: u64,
    read_ns: u64,
    write_ns: u64,
}

/// LRU page cache over one random-access file.
///
/// All byte traffic to the backing file goes through the cache: reads fault
/// pages in, writes fetch the target page first and then overwrite a slice
/// of it, and dirty pages reach the device only on eviction or [`flush`].
///
/// [`flush`]: CachedFile::flush
#[derive(Debug)]
pub struct CachedFile {
    file: File,
    read_only: bool,
    cache: LruCache<u64, Page>,
    dirty: HashMap<u64, bool>,
    counters: Counters,
}

impl CachedFile {
    /// Open or create the file at `path` and allocate the cache.
    ///
    /// `cache_bytes` is clamped up to `MIN_CACHE`. With `read_only` set the
    /// file must already exist and every mutating call fails with
    /// [`DbError::ReadOnly`].
    pub fn open(path: impl AsRef<Path>, cache_bytes: usize, read_only: bool) -> DbResult<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(!read_only)
            .create(!read_only)
            .truncate(false)
            .open(path.as_ref())
            .map_err(|e| {
                DbError::Storage(format!(
                    "failed to open {}: {e}",
                    path.as_ref().display()
                ))
            })?;

        let capacity = Self::page_capacity(cache_bytes);
        Ok(Self {
            file,
            read_only,
            cache: LruCache::new(NonZeroUsize::new(capacity).unwrap()),
            dirty: HashMap::new(),
            counters: Counters::default(),
        })
    }

    /// Whether the file was opened without write permission.
    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    /// Read up to `buf.len()` bytes starting at `position`.
    ///
    /// Returns the number of bytes copied, which is less than requested
    /// only when the read runs past the end of the data. Reading past EOF
    /// is not an error.
    pub fn read(&mut self, position: u64, buf: &mut [u8]) -> DbResult<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        // One exact aligned page goes through the page fast path.
        if position % PAGE_SIZE as u64 == 0 && buf.len() == PAGE_SIZE {
            if let Ok(page_buf) = <&mut [u8; PAGE_SIZE]>::try_from(&mut *buf) {
                return self.read_page(position / PAGE_SIZE as u64, page_buf);
            }
        }

        let started = Instant::now();
        let mut copied = 0;
        while copied < buf.len() {
            let pos = position + copied as u64;
            let page_no = pos / PAGE_SIZE as u64;
            let offset = (pos % PAGE_SIZE as u64) as usize;
            let want = (buf.len() - copied).min(PAGE_SIZE - offset);

            let page = self.fetch_page(page_no)?;
            let available = page.len.saturating_sub(offset);
            let n = want.min(available);
            buf[copied..copied + n].copy_from_slice(&page.data[offset..offset + n]);
            copied += n;
            if n < want {
                break;
            }
        }
        self.counters.bytes_read += copied as u64;
        self.counters.read_ns += started.elapsed().as_nanos() as u64;
        Ok(copied)
    }

    /// Write `buf` starting at `position`, extending the file as needed.
    ///
    /// Every touched page is fetched first so the bytes around the written
    /// slice survive. Returns the number of bytes accepted (always
    /// `buf.len()` on success).
    pub fn write(&mut self, position: u64, buf: &[u8]) -> DbResult<usize> {
        if self.read_only {
            return Err(DbError::ReadOnly);
        }
        if buf.is_empty() {
            return Ok(0);
        }

        let started = Instant::now();
        let mut copied = 0;
        while copied < buf.len() {
            let pos = position + copied as u64;
            let page_no = pos / PAGE_SIZE as u64;
            let offset = (pos % PAGE_SIZE as u64) as usize;
            let n = (buf.len() - copied).min(PAGE_SIZE - offset);
            {
                let page = self.fetch_page(page_no)?;
                page.data[offset..offset + n].copy_from_slice(&buf[copied..copied + n]);
                page.len = page.len.max(offset + n);
            }
            self.dirty.insert(page_no, true);
            copied += n;
        }
        self.counters.bytes_written += copied as u64;
        self.counters.write_ns += started.elapsed().as_nanos() as u64;
        Ok(copied)
    }

    /// Copy one whole page into `buf`; returns the populated byte count.
    pub fn read_page(&mut self, page_no: u64, buf: &mut [u8; PAGE_SIZE]) -> DbResult<usize> {
        let started = Instant::now();
        let len = {
            let page = self.fetch_page(page_no)?;
            buf[..page.len].copy_from_slice(&page.data[..page.len]);
            page.len
        };
        self.counters.bytes_read += len as u64;
        self.counters.read_ns += started.elapsed().as_nanos() as u64;
        Ok(len)
    }

    /// Overwrite one whole page from `buf`.
    pub fn write_page(&mut self, page_no: u64, buf: &[u8; PAGE_SIZE]) -> DbResult<usize> {
        if self.read_only {
            return Err(DbError::ReadOnly);
        }
        let started = Instant::now();
        {
            let page = self.fetch_page(page_no)?;
            page.data.copy_from_slice(buf);
            page.len = PAGE_SIZE;
        }
        self.dirty.insert(page_no, true);
        self.counters.bytes_written += PAGE_SIZE as u64;
        self.counters.write_ns += started.elapsed().as_nanos() as u64;
        Ok(PAGE_SIZE)
    }

    /// Persist every dirty page in ascending page order, then sync the
    /// file handle. Pages stay resident and become clean.
    pub fn flush(&mut self) -> DbResult<()> {
        if self.read_only {
            return Ok(());
        }
        let started = Instant::now();

        // Ascending page order keeps the device writes sequential.
        let mut pages: Vec<u64> = self.dirty.keys().copied().collect();
        pages.sort_unstable();

        for no in pages {
            if let Some(page) = self.cache.peek(&no) {
                Self::persist_page(&mut self.file, page)?;
            }
            self.dirty.remove(&no);
        }
        self.file.sync_all()?;

        self.counters.write_ns += started.elapsed().as_nanos() as u64;
        Ok(())
    }

    /// Current size of the backing file in bytes.
    ///
    /// Pages written but not yet flushed are not included.
    pub fn file_size(&self) -> DbResult<u64> {
        Ok(self.file.metadata()?.len())
    }

    /// Replace the cache capacity, flushing dirty pages first so nothing
    /// is lost when shrinking. Returns the new capacity in bytes.
    pub fn set_cache_size(&mut self, cache_bytes: usize) -> DbResult<usize> {
        self.flush()?;
        let capacity = Self::page_capacity(cache_bytes);
        self.cache.resize(NonZeroUsize::new(capacity).unwrap());
        Ok(capacity * PAGE_SIZE)
    }

    /// Cache capacity in bytes.
    pub fn cache_size(&self) -> usize {
        self.cache.cap().get() * PAGE_SIZE
    }

    /// Report one statistic. Rates are percentages, throughputs MB/s.
    pub fn stat(&self, stat: CacheStat) -> f64 {
        let c = &self.counters;
        let requests = c.requests as f64;
        let misses = c.misses as f64;
        match stat {
            CacheStat::Requests => requests,
            CacheStat::Misses => misses,
            CacheStat::Hits => requests - misses,
            CacheStat::HitRate => {
                if c.requests == 0 {
                    0.0
                } else {
                    (requests - misses) / requests * 100.0
                }
            }
            CacheStat::MissRate => {
                if c.requests == 0 {
                    0.0
                } else {
                    misses / requests * 100.0
                }
            }
            CacheStat::BytesRead => c.bytes_read as f64,
            CacheStat::BytesWritten => c.bytes_written as f64,
            CacheStat::ReadTimeNs => c.read_ns as f64,
            CacheStat::WriteTimeNs => c.write_ns as f64,
            CacheStat::ReadThroughput => {
                if c.read_ns == 0 {
                    0.0
                } else {
                    let seconds = c.read_ns as f64 / 1_000_000_000.0;
                    let megabytes = c.bytes_read as f64 / (1024.0 * 1024.0);
                    megabytes / seconds
                }
            }
            CacheStat::WriteThroughput => {
                if c.write_ns == 0 {
                    0.0
                } else {
                    let seconds = c.write_ns as f64 / 1_000_000_000.0;
                    let megabytes = c.bytes_written as f64 / (1024.0 * 1024.0);
                    megabytes / seconds
                }
            }
        }
    }

    /// Zero all statistics counters.
    pub fn reset_stats(&mut self) {
        self.counters = Counters::default();
    }

    /// Translate a byte budget into an LRU capacity in pages.
    fn page_capacity(cache_bytes: usize) -> usize {
        cache_bytes.max(MIN_CACHE) / PAGE_SIZE
    }

    /// Look up a page, loading it from the file on a miss.
    ///
    /// Either way the page becomes the most recently used entry.
    fn fetch_page(&mut self, page_no: u64) -> DbResult<&mut Page> {
        self.counters.requests += 1;
        if self.cache.contains(&page_no) {
            // LruCache::get_mut refreshes the recency order.
            return Ok(self.cache.get_mut(&page_no).unwrap());
        }

        self.counters.misses += 1;
        let page = self.load_page(page_no)?;
        self.evict_if_needed()?;
        self.cache.push(page_no, page);
        Ok(self.cache.get_mut(&page_no).unwrap())
    }

    /// Read a page from the file; a page past EOF comes back empty.
    fn load_page(&mut self, page_no: u64) -> DbResult<Page> {
        let mut page = Page::empty(page_no);
        self.file
            .seek(SeekFrom::Start(page_no * PAGE_SIZE as u64))?;
        while page.len < PAGE_SIZE {
            let n = self.file.read(&mut page.data[page.len..])?;
            if n == 0 {
                break;
            }
            page.len += n;
        }
        Ok(page)
    }

    /// Drop the least recently used page when the cache is full, writing
    /// it out first if it is dirty.
    fn evict_if_needed(&mut self) -> DbResult<()> {
        if self.cache.len() < self.cache.cap().get() {
            return Ok(());
        }
        if let Some((no, page)) = self.cache.pop_lru()
            && self.dirty.remove(&no).is_some()
        {
            Self::persist_page(&mut self.file, &page)?;
        }
        Ok(())
    }

    fn persist_page(file: &mut File, page: &Page) -> DbResult<()> {
        file.seek(SeekFrom::Start(page.no * PAGE_SIZE as u64))?;
        file.write_all(&page.data[..page.len])?;
        Ok(())
    }
}

impl Drop for CachedFile {
    fn drop(&mut self) {
        // Best effort; explicit flush is the path that reports errors.
        let _ = self.flush();
    }
}
