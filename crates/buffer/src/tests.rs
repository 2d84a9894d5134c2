use super::*;
use common::{DEFAULT_CACHE, MIN_CACHE};
use tempfile::tempdir;

fn pattern(page_no: u64, i: usize) -> u8 {
    (page_no as usize + i * 7) as u8
}

#[test]
fn write_then_read_round_trip() {
    let dir = tempdir().unwrap();
    let mut file = CachedFile::open(dir.path().join("data.db"), DEFAULT_CACHE, false).unwrap();

    file.write(0, b"hello world").unwrap();

    let mut buf = [0u8; 11];
    let n = file.read(0, &mut buf).unwrap();
    assert_eq!(n, 11);
    assert_eq!(&buf, b"hello world");
}

#[test]
fn unaligned_cross_page_round_trip() {
    let dir = tempdir().unwrap();
    let mut file = CachedFile::open(dir.path().join("data.db"), DEFAULT_CACHE, false).unwrap();

    // Straddle the first page boundary.
    let position = PAGE_SIZE as u64 - 100;
    let payload: Vec<u8> = (0..300).map(|i| (i % 251) as u8).collect();
    assert_eq!(file.write(position, &payload).unwrap(), 300);

    let mut buf = vec![0u8; 300];
    let n = file.read(position, &mut buf).unwrap();
    assert_eq!(n, 300);
    assert_eq!(buf, payload);
}

#[test]
fn partial_page_write_preserves_other_bytes() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("data.db");

    {
        let mut file = CachedFile::open(&path, DEFAULT_CACHE, false).unwrap();
        let page: Vec<u8> = (0..PAGE_SIZE).map(|i| (i % 256) as u8).collect();
        file.write(0, &page).unwrap();
        file.flush().unwrap();
    }

    // Fresh handle: the page is fetched before the partial write lands.
    let mut file = CachedFile::open(&path, DEFAULT_CACHE, false).unwrap();
    file.write(100, &[0xFF; 8]).unwrap();
    file.flush().unwrap();

    let mut buf = [0u8; PAGE_SIZE];
    file.read_page(0, &mut buf).unwrap();
    assert_eq!(buf[99], 99);
    assert_eq!(&buf[100..108], &[0xFF; 8]);
    assert_eq!(buf[108], 108);
}

#[test]
fn read_past_eof_returns_zero_bytes() {
    let dir = tempdir().unwrap();
    let mut file = CachedFile::open(dir.path().join("data.db"), DEFAULT_CACHE, false).unwrap();

    let mut buf = [0u8; 64];
    assert_eq!(file.read(1_000_000, &mut buf).unwrap(), 0);

    // A short tail read reports only what exists.
    file.write(0, &[7u8; 10]).unwrap();
    let n = file.read(5, &mut buf).unwrap();
    assert_eq!(n, 5);
    assert_eq!(&buf[..5], &[7u8; 10][..5]);
}

#[test]
fn flush_persists_across_reopen() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("data.db");

    {
        let mut file = CachedFile::open(&path, DEFAULT_CACHE, false).unwrap();
        file.write(4096, b"durable").unwrap();
        file.flush().unwrap();
    }

    let mut file = CachedFile::open(&path, DEFAULT_CACHE, false).unwrap();
    let mut buf = [0u8; 7];
    assert_eq!(file.read(4096, &mut buf).unwrap(), 7);
    assert_eq!(&buf, b"durable");
}

#[test]
fn eviction_writes_dirty_pages_back() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("data.db");

    // Minimum cache holds 32 pages; touch 40 so 8 evictions happen.
    let pages = 40u64;
    {
        let mut file = CachedFile::open(&path, MIN_CACHE, false).unwrap();
        for no in 0..pages {
            let page: Vec<u8> = (0..PAGE_SIZE).map(|i| pattern(no, i)).collect();
            file.write(no * PAGE_SIZE as u64, &page).unwrap();
        }
        file.flush().unwrap();
    }

    let mut file = CachedFile::open(&path, MIN_CACHE, false).unwrap();
    for no in 0..pages {
        let mut buf = [0u8; PAGE_SIZE];
        assert_eq!(file.read_page(no, &mut buf).unwrap(), PAGE_SIZE);
        for (i, &b) in buf.iter().enumerate() {
            assert_eq!(b, pattern(no, i), "page {no} byte {i}");
        }
    }
}

#[test]
fn evicted_page_reloads_with_modifications() {
    let dir = tempdir().unwrap();
    let mut file = CachedFile::open(dir.path().join("data.db"), MIN_CACHE, false).unwrap();

    file.write(0, &[42u8; 16]).unwrap();
    // Touch enough other pages to push page 0 out of the cache.
    for no in 1..40u64 {
        file.write(no * PAGE_SIZE as u64, &[1u8]).unwrap();
    }

    let mut buf = [0u8; 16];
    assert_eq!(file.read(0, &mut buf).unwrap(), 16);
    assert_eq!(buf, [42u8; 16]);
}

#[test]
fn page_fast_path_round_trip() {
    let dir = tempdir().unwrap();
    let mut file = CachedFile::open(dir.path().join("data.db"), DEFAULT_CACHE, false).unwrap();

    let mut page = [0u8; PAGE_SIZE];
    for (i, b) in page.iter_mut().enumerate() {
        *b = (i % 256) as u8;
    }
    assert_eq!(file.write_page(3, &page).unwrap(), PAGE_SIZE);

    let mut buf = [0u8; PAGE_SIZE];
    assert_eq!(file.read(3 * PAGE_SIZE as u64, &mut buf).unwrap(), PAGE_SIZE);
    assert_eq!(buf, page);
}

#[test]
fn repeated_scan_approaches_full_hit_rate() {
    let dir = tempdir().unwrap();
    let mut file = CachedFile::open(dir.path().join("data.db"), DEFAULT_CACHE, false).unwrap();

    // 16 pages of data, well under the cache capacity.
    let bytes = 16 * PAGE_SIZE;
    file.write(0, &vec![9u8; bytes]).unwrap();
    file.reset_stats();

    let mut buf = vec![0u8; bytes];
    let mut last_rate = 0.0;
    for _ in 0..10 {
        file.read(0, &mut buf).unwrap();
        let rate = file.stat(CacheStat::HitRate);
        assert!(rate >= last_rate);
        last_rate = rate;
    }
    assert!(last_rate > 99.0, "hit rate was {last_rate}");
}

#[test]
fn stats_count_requests_and_bytes() {
    let dir = tempdir().unwrap();
    let mut file = CachedFile::open(dir.path().join("data.db"), DEFAULT_CACHE, false).unwrap();

    file.write(0, &[1u8; 100]).unwrap();
    let mut buf = [0u8; 100];
    file.read(0, &mut buf).unwrap();

    assert_eq!(file.stat(CacheStat::BytesWritten), 100.0);
    assert_eq!(file.stat(CacheStat::BytesRead), 100.0);
    assert!(file.stat(CacheStat::Requests) >= 2.0);
    assert_eq!(file.stat(CacheStat::Misses), 1.0);

    file.reset_stats();
    assert_eq!(file.stat(CacheStat::Requests), 0.0);
    assert_eq!(file.stat(CacheStat::HitRate), 0.0);
}

#[test]
fn open_missing_file_read_only_fails() {
    let dir = tempdir().unwrap();
    let result = CachedFile::open(dir.path().join("absent.db"), DEFAULT_CACHE, true);
    assert!(matches!(result, Err(DbError::Storage(_))));
}

#[test]
fn write_on_read_only_file_is_rejected() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("data.db");
    {
        let mut file = CachedFile::open(&path, DEFAULT_CACHE, false).unwrap();
        file.write(0, b"seed").unwrap();
        file.flush().unwrap();
    }

    let mut file = CachedFile::open(&path, DEFAULT_CACHE, true).unwrap();
    assert!(matches!(file.write(0, b"nope"), Err(DbError::ReadOnly)));
    assert!(matches!(
        file.write_page(0, &[0u8; PAGE_SIZE]),
        Err(DbError::ReadOnly)
    ));

    // Reads still work.
    let mut buf = [0u8; 4];
    assert_eq!(file.read(0, &mut buf).unwrap(), 4);
    assert_eq!(&buf, b"seed");
}

#[test]
fn file_size_never_shrinks() {
    let dir = tempdir().unwrap();
    let mut file = CachedFile::open(dir.path().join("data.db"), DEFAULT_CACHE, false).unwrap();

    let mut last = file.file_size().unwrap();
    for no in 0..8u64 {
        file.write(no * PAGE_SIZE as u64, &[3u8; 128]).unwrap();
        file.flush().unwrap();
        let size = file.file_size().unwrap();
        assert!(size >= last);
        last = size;
    }
}

#[test]
fn resize_keeps_data_intact() {
    let dir = tempdir().unwrap();
    let mut file = CachedFile::open(dir.path().join("data.db"), DEFAULT_CACHE, false).unwrap();

    file.write(0, &[5u8; 1000]).unwrap();
    let bytes = file.set_cache_size(MIN_CACHE).unwrap();
    assert_eq!(bytes, MIN_CACHE);
    assert_eq!(file.cache_size(), MIN_CACHE);

    let mut buf = [0u8; 1000];
    assert_eq!(file.read(0, &mut buf).unwrap(), 1000);
    assert_eq!(buf, [5u8; 1000]);
}

#[test]
fn tiny_cache_request_is_clamped_to_minimum() {
    let dir = tempdir().unwrap();
    let file = CachedFile::open(dir.path().join("data.db"), 1, false).unwrap();
    assert_eq!(file.cache_size(), MIN_CACHE / PAGE_SIZE * PAGE_SIZE);
}
