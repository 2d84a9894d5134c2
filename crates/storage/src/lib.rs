//! Variable-length record storage over a page-cached file.
//!
//! `RecordFile` lays records out as a doubly-linked list: each record is a
//! fixed 32-byte header followed by its payload. Removed records move to a
//! free list and their space is reused by later allocations. A cursor
//! provides linked-list navigation, and both the header and the payload of
//! every record carry a crc32 checksum that is verified on read.
//!
//! # Example
//!
//! ```no_run
//! use buffer::CachedFile;
//! use common::DEFAULT_CACHE;
//! use storage::RecordFile;
//!
//! let file = CachedFile::open("/tmp/data.db", DEFAULT_CACHE, false).unwrap();
//! let mut records = RecordFile::new(file, None).unwrap();
//!
//! let offset = records.create_record(b"payload").unwrap();
//! records.set_position(offset).unwrap();
//! assert_eq!(records.record_data().unwrap(), b"payload");
//! ```

#[cfg(test)]
mod tests;

use bincode::config::{self, Config};
use bincode::serde::{decode_from_slice, encode_into_slice};
use buffer::CachedFile;
use common::{DbError, DbResult, NONE_OFFSET};
use serde::{Deserialize, Serialize};

/// First four bytes of every storage file ("BSDB" on disk).
pub const STORAGE_SIGNATURE: u32 = 0x4244_5342;
/// Current storage format version.
pub const STORAGE_VERSION: u32 = 1;
/// Size of the storage header at the start of the file.
pub const STORAGE_HEADER_SIZE: usize = 64;
/// Size of the fixed header preceding every record payload.
pub const RECORD_HEADER_SIZE: usize = 32;

fn bincode_config() -> impl Config {
    config::legacy()
}

/// File-level bookkeeping persisted in the first 64 bytes.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
struct StorageHeader {
    signature: u32,
    version: u32,
    end_of_file: u64,
    total_records: u64,
    first_record: u64,
    last_record: u64,
    total_free_records: u64,
    first_free_record: u64,
    last_free_record: u64,
}

impl StorageHeader {
    fn empty() -> Self {
        Self {
            signature: STORAGE_SIGNATURE,
            version: STORAGE_VERSION,
            end_of_file: STORAGE_HEADER_SIZE as u64,
            total_records: 0,
            first_record: NONE_OFFSET,
            last_record: NONE_OFFSET,
            total_free_records: 0,
            first_free_record: NONE_OFFSET,
            last_free_record: NONE_OFFSET,
        }
    }

    /// Structural validation of a loaded header.
    ///
    /// The header has no spare bytes for a checksum of its own, so a torn
    /// write is caught by these checks instead.
    fn validate(&self) -> DbResult<()> {
        if self.signature != STORAGE_SIGNATURE {
            return Err(DbError::Storage(format!(
                "bad storage signature {:#010x}",
                self.signature
            )));
        }
        if self.version != STORAGE_VERSION {
            return Err(DbError::Storage(format!(
                "unsupported storage version {}",
                self.version
            )));
        }
        if self.end_of_file < STORAGE_HEADER_SIZE as u64 {
            return Err(DbError::Corrupted(format!(
                "end of file offset {} is inside the header",
                self.end_of_file
            )));
        }
        for offset in [
            self.first_record,
            self.last_record,
            self.first_free_record,
            self.last_free_record,
        ] {
            if offset != NONE_OFFSET
                && (offset < STORAGE_HEADER_SIZE as u64 || offset >= self.end_of_file)
            {
                return Err(DbError::Corrupted(format!(
                    "record offset {offset} is outside the file"
                )));
            }
        }
        Ok(())
    }

    fn to_bytes(&self) -> DbResult<[u8; STORAGE_HEADER_SIZE]> {
        let mut buf = [0u8; STORAGE_HEADER_SIZE];
        let written = encode_into_slice(self, &mut buf, bincode_config())
            .map_err(|e| DbError::Storage(format!("encode storage header failed: {e}")))?;
        debug_assert_eq!(written, STORAGE_HEADER_SIZE);
        Ok(buf)
    }

    fn from_bytes(buf: &[u8; STORAGE_HEADER_SIZE]) -> DbResult<Self> {
        let (header, read): (Self, usize) = decode_from_slice(buf, bincode_config())
            .map_err(|e| DbError::Corrupted(format!("decode storage header failed: {e}")))?;
        debug_assert_eq!(read, STORAGE_HEADER_SIZE);
        header.validate()?;
        Ok(header)
    }
}

/// Per-record header: list links, capacity, length, and two checksums.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
struct RecordHeader {
    next: u64,
    previous: u64,
    capacity: u32,
    data_length: u32,
    data_checksum: u32,
    head_checksum: u32,
}

impl RecordHeader {
    /// Encode the header, computing `head_checksum` over everything that
    /// precedes it.
    fn seal(&mut self) -> DbResult<[u8; RECORD_HEADER_SIZE]> {
        self.head_checksum = 0;
        let mut buf = [0u8; RECORD_HEADER_SIZE];
        let written = encode_into_slice(&*self, &mut buf, bincode_config())
            .map_err(|e| DbError::Storage(format!("encode record header failed: {e}")))?;
        debug_assert_eq!(written, RECORD_HEADER_SIZE);
        let checksum = crc32fast::hash(&buf[..RECORD_HEADER_SIZE - 4]);
        self.head_checksum = checksum;
        buf[RECORD_HEADER_SIZE - 4..].copy_from_slice(&checksum.to_le_bytes());
        Ok(buf)
    }

    fn from_bytes(offset: u64, buf: &[u8; RECORD_HEADER_SIZE]) -> DbResult<Self> {
        let (header, read): (Self, usize) = decode_from_slice(buf, bincode_config())
            .map_err(|e| DbError::Corrupted(format!("decode record header failed: {e}")))?;
        debug_assert_eq!(read, RECORD_HEADER_SIZE);
        let expected = crc32fast::hash(&buf[..RECORD_HEADER_SIZE - 4]);
        if header.head_checksum != expected {
            return Err(DbError::Corrupted(format!(
                "record header checksum mismatch at offset {offset}"
            )));
        }
        Ok(header)
    }
}

/// Cursor: the record the store is currently positioned on.
#[derive(Clone, Copy, Debug)]
struct Position {
    offset: u64,
    header: RecordHeader,
}

/// Record store over a [`CachedFile`].
///
/// Records live in two disjoint doubly-linked lists: the active list in
/// insertion order and the free list of removed records awaiting reuse.
/// The storage header is persisted after every structural change; reaching
/// the device still requires [`flush`](RecordFile::flush).
#[derive(Debug)]
pub struct RecordFile {
    file: CachedFile,
    header: StorageHeader,
    position: Option<Position>,
    free_lookup_depth: Option<usize>,
}

impl RecordFile {
    /// Take ownership of `file` and load (or initialise) the storage
    /// header.
    ///
    /// An empty writable file gets a fresh header; an empty read-only file
    /// is an error. `free_lookup_depth` bounds the free-list scan per
    /// allocation; `None` scans the whole list.
    pub fn new(mut file: CachedFile, free_lookup_depth: Option<usize>) -> DbResult<Self> {
        let header = if file.file_size()? == 0 {
            if file.is_read_only() {
                return Err(DbError::Storage(
                    "cannot initialise storage on a read-only file".into(),
                ));
            }
            let header = StorageHeader::empty();
            file.write(0, &header.to_bytes()?)?;
            header
        } else {
            let mut buf = [0u8; STORAGE_HEADER_SIZE];
            let n = file.read(0, &mut buf)?;
            if n < STORAGE_HEADER_SIZE {
                return Err(DbError::Corrupted("truncated storage header".into()));
            }
            StorageHeader::from_bytes(&buf)?
        };

        Ok(Self {
            file,
            header,
            position: None,
            free_lookup_depth,
        })
    }

    /// Number of records on the active list.
    pub fn total_records(&self) -> u64 {
        self.header.total_records
    }

    /// Number of removed records awaiting reuse.
    pub fn total_free_records(&self) -> u64 {
        self.header.total_free_records
    }

    /// Bound the free-list scan per allocation; `None` is unlimited.
    pub fn set_free_lookup_depth(&mut self, depth: Option<usize>) {
        self.free_lookup_depth = depth;
    }

    pub fn is_read_only(&self) -> bool {
        self.file.is_read_only()
    }

    /// The underlying page cache (statistics, file size).
    pub fn cache(&self) -> &CachedFile {
        &self.file
    }

    pub fn cache_mut(&mut self) -> &mut CachedFile {
        &mut self.file
    }

    /// Push every dirty page to the device.
    pub fn flush(&mut self) -> DbResult<()> {
        self.file.flush()
    }

    // ---- Navigation ----

    /// Move the cursor to the record at `offset`.
    ///
    /// The target header is validated first; on a checksum failure the
    /// cursor does not move.
    pub fn set_position(&mut self, offset: u64) -> DbResult<()> {
        let header = self.read_record_header(offset)?;
        self.position = Some(Position { offset, header });
        Ok(())
    }

    /// Offset of the current record, if the cursor is positioned.
    pub fn position(&self) -> Option<u64> {
        self.position.map(|p| p.offset)
    }

    /// Move to the head of the active list.
    pub fn first(&mut self) -> DbResult<Option<u64>> {
        if self.header.first_record == NONE_OFFSET {
            return Ok(None);
        }
        self.set_position(self.header.first_record)?;
        Ok(Some(self.header.first_record))
    }

    /// Move to the tail of the active list.
    pub fn last(&mut self) -> DbResult<Option<u64>> {
        if self.header.last_record == NONE_OFFSET {
            return Ok(None);
        }
        self.set_position(self.header.last_record)?;
        Ok(Some(self.header.last_record))
    }

    /// Follow the current record's `next` link.
    pub fn next(&mut self) -> DbResult<Option<u64>> {
        let Some(position) = self.position else {
            return Ok(None);
        };
        if position.header.next == NONE_OFFSET {
            return Ok(None);
        }
        self.set_position(position.header.next)?;
        Ok(Some(position.header.next))
    }

    /// Follow the current record's `previous` link.
    pub fn previous(&mut self) -> DbResult<Option<u64>> {
        let Some(position) = self.position else {
            return Ok(None);
        };
        if position.header.previous == NONE_OFFSET {
            return Ok(None);
        }
        self.set_position(position.header.previous)?;
        Ok(Some(position.header.previous))
    }

    /// Payload length of the current record.
    pub fn data_length(&self) -> Option<u32> {
        self.position.map(|p| p.header.data_length)
    }

    /// Allocated payload capacity of the current record.
    pub fn capacity(&self) -> Option<u32> {
        self.position.map(|p| p.header.capacity)
    }

    // ---- CRUD ----

    /// Append a record holding `data`, reusing freed space when a large
    /// enough free record exists. The cursor moves to the new record and
    /// its offset is returned.
    pub fn create_record(&mut self, data: &[u8]) -> DbResult<u64> {
        self.ensure_writable()?;
        let length = record_length(data)?;
        let (offset, capacity) = self.allocate(length)?;

        let mut header = RecordHeader {
            next: NONE_OFFSET,
            previous: self.header.last_record,
            capacity,
            data_length: length,
            data_checksum: crc32fast::hash(data),
            head_checksum: 0,
        };

        // Link onto the tail of the active list.
        if self.header.last_record != NONE_OFFSET {
            let tail_offset = self.header.last_record;
            let mut tail = self.read_record_header(tail_offset)?;
            tail.next = offset;
            self.write_record_header(tail_offset, &mut tail)?;
        } else {
            self.header.first_record = offset;
        }
        self.header.last_record = offset;
        self.header.total_records += 1;

        self.write_record_header(offset, &mut header)?;
        self.file
            .write(offset + RECORD_HEADER_SIZE as u64, data)?;
        self.persist_header()?;

        self.position = Some(Position { offset, header });
        Ok(offset)
    }

    /// Read the current record's payload, verifying its checksum.
    pub fn record_data(&mut self) -> DbResult<Vec<u8>> {
        let position = self.require_position()?;
        let length = position.header.data_length as usize;
        let mut buf = vec![0u8; length];
        let n = self
            .file
            .read(position.offset + RECORD_HEADER_SIZE as u64, &mut buf)?;
        if n < length {
            return Err(DbError::Corrupted(format!(
                "record payload at {} is truncated",
                position.offset
            )));
        }
        if crc32fast::hash(&buf) != position.header.data_checksum {
            return Err(DbError::Corrupted(format!(
                "record payload checksum mismatch at offset {}",
                position.offset
            )));
        }
        Ok(buf)
    }

    /// Replace the current record's payload.
    ///
    /// Fits-in-place updates rewrite the payload where it is; a larger
    /// payload moves the record to a fresh allocation, patches both
    /// neighbours (and the list ends) to the new offset, and frees the old
    /// record. Returns the record's offset after the update, where the
    /// cursor now stands.
    pub fn set_record_data(&mut self, data: &[u8]) -> DbResult<u64> {
        self.ensure_writable()?;
        let position = self.require_position()?;
        let length = record_length(data)?;

        if length <= position.header.capacity {
            let mut header = position.header;
            header.data_length = length;
            header.data_checksum = crc32fast::hash(data);
            self.write_record_header(position.offset, &mut header)?;
            self.file
                .write(position.offset + RECORD_HEADER_SIZE as u64, data)?;
            self.position = Some(Position {
                offset: position.offset,
                header,
            });
            return Ok(position.offset);
        }

        // Not enough capacity: move the record.
        let (offset, capacity) = self.allocate(length)?;
        let mut header = RecordHeader {
            next: position.header.next,
            previous: position.header.previous,
            capacity,
            data_length: length,
            data_checksum: crc32fast::hash(data),
            head_checksum: 0,
        };

        if header.previous != NONE_OFFSET {
            let mut left = self.read_record_header(header.previous)?;
            left.next = offset;
            self.write_record_header(header.previous, &mut left)?;
        } else {
            self.header.first_record = offset;
        }
        if header.next != NONE_OFFSET {
            let mut right = self.read_record_header(header.next)?;
            right.previous = offset;
            self.write_record_header(header.next, &mut right)?;
        } else {
            self.header.last_record = offset;
        }

        self.push_free(position.offset, position.header)?;
        self.write_record_header(offset, &mut header)?;
        self.file
            .write(offset + RECORD_HEADER_SIZE as u64, data)?;
        self.persist_header()?;

        self.position = Some(Position { offset, header });
        Ok(offset)
    }

    /// Remove the current record: unlink it from the active list and push
    /// it onto the free list. Capacity is preserved for reuse; the file
    /// never shrinks.
    ///
    /// The cursor lands on the right neighbour, or the left neighbour when
    /// the tail was removed, or nowhere when the list emptied. The landing
    /// offset is returned.
    pub fn remove_record(&mut self) -> DbResult<Option<u64>> {
        self.ensure_writable()?;
        let position = self.require_position()?;
        let RecordHeader { next, previous, .. } = position.header;

        if previous != NONE_OFFSET {
            let mut left = self.read_record_header(previous)?;
            left.next = next;
            self.write_record_header(previous, &mut left)?;
        } else {
            self.header.first_record = next;
        }
        if next != NONE_OFFSET {
            let mut right = self.read_record_header(next)?;
            right.previous = previous;
            self.write_record_header(next, &mut right)?;
        } else {
            self.header.last_record = previous;
        }

        self.push_free(position.offset, position.header)?;
        self.header.total_records -= 1;
        self.persist_header()?;

        let landing = if next != NONE_OFFSET {
            Some(next)
        } else if previous != NONE_OFFSET {
            Some(previous)
        } else {
            None
        };
        match landing {
            Some(offset) => self.set_position(offset)?,
            None => self.position = None,
        }
        Ok(landing)
    }

    // ---- Internals ----

    fn ensure_writable(&self) -> DbResult<()> {
        if self.file.is_read_only() {
            return Err(DbError::ReadOnly);
        }
        Ok(())
    }

    fn require_position(&self) -> DbResult<Position> {
        self.position
            .ok_or_else(|| DbError::Storage("cursor is not positioned on a record".into()))
    }

    fn read_record_header(&mut self, offset: u64) -> DbResult<RecordHeader> {
        let mut buf = [0u8; RECORD_HEADER_SIZE];
        let n = self.file.read(offset, &mut buf)?;
        if n < RECORD_HEADER_SIZE {
            return Err(DbError::Corrupted(format!(
                "truncated record header at offset {offset}"
            )));
        }
        RecordHeader::from_bytes(offset, &buf)
    }

    fn write_record_header(&mut self, offset: u64, header: &mut RecordHeader) -> DbResult<()> {
        let buf = header.seal()?;
        self.file.write(offset, &buf)?;
        Ok(())
    }

    /// Find space for `length` payload bytes: first-fit from the free
    /// list, else append at the end of the file. Returns the offset and
    /// the capacity of the spot.
    fn allocate(&mut self, length: u32) -> DbResult<(u64, u32)> {
        let mut scanned = 0usize;
        let mut current = self.header.first_free_record;
        while current != NONE_OFFSET {
            if let Some(depth) = self.free_lookup_depth
                && scanned >= depth
            {
                break;
            }
            let header = self.read_record_header(current)?;
            if header.capacity >= length {
                self.unlink_free(&header)?;
                self.header.total_free_records -= 1;
                return Ok((current, header.capacity));
            }
            scanned += 1;
            current = header.next;
        }

        let offset = self.header.end_of_file;
        self.header.end_of_file = offset + RECORD_HEADER_SIZE as u64 + length as u64;
        Ok((offset, length))
    }

    /// Push a record onto the head of the free list.
    fn push_free(&mut self, offset: u64, mut header: RecordHeader) -> DbResult<()> {
        header.next = self.header.first_free_record;
        header.previous = NONE_OFFSET;
        self.write_record_header(offset, &mut header)?;

        if header.next != NONE_OFFSET {
            let old_head_offset = header.next;
            let mut old_head = self.read_record_header(old_head_offset)?;
            old_head.previous = offset;
            self.write_record_header(old_head_offset, &mut old_head)?;
        } else {
            self.header.last_free_record = offset;
        }
        self.header.first_free_record = offset;
        self.header.total_free_records += 1;
        Ok(())
    }

    /// Detach a record from the free list before reusing it.
    fn unlink_free(&mut self, header: &RecordHeader) -> DbResult<()> {
        if header.previous != NONE_OFFSET {
            let mut left = self.read_record_header(header.previous)?;
            left.next = header.next;
            self.write_record_header(header.previous, &mut left)?;
        } else {
            self.header.first_free_record = header.next;
        }
        if header.next != NONE_OFFSET {
            let mut right = self.read_record_header(header.next)?;
            right.previous = header.previous;
            self.write_record_header(header.next, &mut right)?;
        } else {
            self.header.last_free_record = header.previous;
        }
        Ok(())
    }

    fn persist_header(&mut self) -> DbResult<()> {
        let buf = self.header.to_bytes()?;
        self.file.write(0, &buf)?;
        Ok(())
    }
}

fn record_length(data: &[u8]) -> DbResult<u32> {
    u32::try_from(data.len())
        .map_err(|_| DbError::Storage("record payload exceeds 4 GiB".into()))
}
