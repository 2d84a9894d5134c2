use super::*;
use common::{DEFAULT_CACHE, PAGE_SIZE};
use tempfile::tempdir;

fn open_store(dir: &tempfile::TempDir) -> RecordFile {
    let file = CachedFile::open(dir.path().join("records.db"), DEFAULT_CACHE, false).unwrap();
    RecordFile::new(file, None).unwrap()
}

fn reopen_store(dir: &tempfile::TempDir) -> RecordFile {
    let file = CachedFile::open(dir.path().join("records.db"), DEFAULT_CACHE, false).unwrap();
    RecordFile::new(file, None).unwrap()
}

/// Offsets of the whole active list, walked from the head.
fn walk_forward(records: &mut RecordFile) -> Vec<u64> {
    let mut offsets = Vec::new();
    let mut current = records.first().unwrap();
    while let Some(offset) = current {
        offsets.push(offset);
        current = records.next().unwrap();
    }
    offsets
}

fn walk_backward(records: &mut RecordFile) -> Vec<u64> {
    let mut offsets = Vec::new();
    let mut current = records.last().unwrap();
    while let Some(offset) = current {
        offsets.push(offset);
        current = records.previous().unwrap();
    }
    offsets
}

#[test]
fn create_and_read_round_trip() {
    let dir = tempdir().unwrap();
    let mut records = open_store(&dir);

    let offset = records.create_record(b"first payload").unwrap();
    assert_eq!(offset, STORAGE_HEADER_SIZE as u64);
    assert_eq!(records.position(), Some(offset));
    assert_eq!(records.data_length(), Some(13));
    assert_eq!(records.capacity(), Some(13));
    assert_eq!(records.record_data().unwrap(), b"first payload");
    assert_eq!(records.total_records(), 1);
}

#[test]
fn records_are_laid_out_back_to_back() {
    let dir = tempdir().unwrap();
    let mut records = open_store(&dir);

    let a = records.create_record(&[1u8; 10]).unwrap();
    let b = records.create_record(&[2u8; 20]).unwrap();
    let c = records.create_record(&[3u8; 30]).unwrap();

    assert_eq!(b, a + RECORD_HEADER_SIZE as u64 + 10);
    assert_eq!(c, b + RECORD_HEADER_SIZE as u64 + 20);
}

#[test]
fn active_list_walks_both_ways() {
    let dir = tempdir().unwrap();
    let mut records = open_store(&dir);

    let offsets: Vec<u64> = (0..5)
        .map(|i| records.create_record(format!("payload {i}").as_bytes()).unwrap())
        .collect();

    assert_eq!(walk_forward(&mut records), offsets);
    let mut reversed = offsets.clone();
    reversed.reverse();
    assert_eq!(walk_backward(&mut records), reversed);
    assert_eq!(records.total_records(), 5);
}

#[test]
fn remove_moves_record_to_free_list() {
    let dir = tempdir().unwrap();
    let mut records = open_store(&dir);

    let a = records.create_record(b"a").unwrap();
    let b = records.create_record(b"b").unwrap();
    let c = records.create_record(b"c").unwrap();

    records.set_position(b).unwrap();
    let landing = records.remove_record().unwrap();
    assert_eq!(landing, Some(c));
    assert_eq!(records.position(), Some(c));

    assert_eq!(records.total_records(), 2);
    assert_eq!(records.total_free_records(), 1);
    assert_eq!(walk_forward(&mut records), vec![a, c]);
    assert_eq!(walk_backward(&mut records), vec![c, a]);
}

#[test]
fn remove_tail_lands_on_left_neighbour() {
    let dir = tempdir().unwrap();
    let mut records = open_store(&dir);

    let a = records.create_record(b"a").unwrap();
    let b = records.create_record(b"b").unwrap();

    records.set_position(b).unwrap();
    assert_eq!(records.remove_record().unwrap(), Some(a));
    assert_eq!(records.position(), Some(a));

    records.set_position(a).unwrap();
    assert_eq!(records.remove_record().unwrap(), None);
    assert_eq!(records.position(), None);
    assert_eq!(records.total_records(), 0);
    assert_eq!(records.first().unwrap(), None);
    assert_eq!(records.last().unwrap(), None);
}

#[test]
fn freed_capacity_is_reused_first_fit() {
    let dir = tempdir().unwrap();
    let mut records = open_store(&dir);

    let _a = records.create_record(&[1u8; 40]).unwrap();
    let b = records.create_record(&[2u8; 100]).unwrap();
    let _c = records.create_record(&[3u8; 40]).unwrap();

    records.set_position(b).unwrap();
    records.remove_record().unwrap();
    assert_eq!(records.total_free_records(), 1);

    // Fits inside b's capacity, so b's slot is recycled.
    let d = records.create_record(&[4u8; 60]).unwrap();
    assert_eq!(d, b);
    assert_eq!(records.total_free_records(), 0);
    records.set_position(d).unwrap();
    assert_eq!(records.capacity(), Some(100));
    assert_eq!(records.data_length(), Some(60));
    assert_eq!(records.record_data().unwrap(), vec![4u8; 60]);
}

#[test]
fn too_small_free_records_are_skipped() {
    let dir = tempdir().unwrap();
    let mut records = open_store(&dir);

    let a = records.create_record(&[1u8; 8]).unwrap();
    let _b = records.create_record(&[2u8; 8]).unwrap();
    records.set_position(a).unwrap();
    records.remove_record().unwrap();

    let c = records.create_record(&[3u8; 500]).unwrap();
    assert_ne!(c, a);
    assert_eq!(records.total_free_records(), 1);
    assert_eq!(records.record_data().unwrap(), vec![3u8; 500]);
}

#[test]
fn free_lookup_depth_zero_always_appends() {
    let dir = tempdir().unwrap();
    let file = CachedFile::open(dir.path().join("records.db"), DEFAULT_CACHE, false).unwrap();
    let mut records = RecordFile::new(file, Some(0)).unwrap();

    let a = records.create_record(&[1u8; 64]).unwrap();
    records.set_position(a).unwrap();
    records.remove_record().unwrap();

    let b = records.create_record(&[2u8; 16]).unwrap();
    assert_ne!(b, a);
    assert_eq!(records.total_free_records(), 1);
}

#[test]
fn update_in_place_keeps_offset() {
    let dir = tempdir().unwrap();
    let mut records = open_store(&dir);

    let offset = records.create_record(&[9u8; 50]).unwrap();
    records.set_position(offset).unwrap();

    let updated = records.set_record_data(&[7u8; 20]).unwrap();
    assert_eq!(updated, offset);
    assert_eq!(records.capacity(), Some(50));
    assert_eq!(records.data_length(), Some(20));
    assert_eq!(records.record_data().unwrap(), vec![7u8; 20]);
}

#[test]
fn growing_update_relocates_and_patches_neighbours() {
    let dir = tempdir().unwrap();
    let mut records = open_store(&dir);

    let a = records.create_record(b"aa").unwrap();
    let b = records.create_record(b"bb").unwrap();
    let c = records.create_record(b"cc").unwrap();

    records.set_position(b).unwrap();
    let moved = records.set_record_data(&[5u8; 300]).unwrap();
    assert_ne!(moved, b);
    assert_eq!(records.position(), Some(moved));
    assert_eq!(records.record_data().unwrap(), vec![5u8; 300]);

    // The old slot went to the free list and both neighbours follow the
    // new offset.
    assert_eq!(records.total_records(), 3);
    assert_eq!(records.total_free_records(), 1);
    assert_eq!(walk_forward(&mut records), vec![a, moved, c]);
    assert_eq!(walk_backward(&mut records), vec![c, moved, a]);
}

#[test]
fn growing_update_of_tail_updates_list_end() {
    let dir = tempdir().unwrap();
    let mut records = open_store(&dir);

    let a = records.create_record(b"head").unwrap();
    let b = records.create_record(b"tail").unwrap();

    records.set_position(b).unwrap();
    let moved = records.set_record_data(&[1u8; 200]).unwrap();
    assert_ne!(moved, b);
    assert_eq!(records.last().unwrap(), Some(moved));
    assert_eq!(walk_forward(&mut records), vec![a, moved]);

    records.set_position(a).unwrap();
    let moved_head = records.set_record_data(&[2u8; 200]).unwrap();
    assert_ne!(moved_head, a);
    assert_eq!(records.first().unwrap(), Some(moved_head));
    assert_eq!(walk_forward(&mut records), vec![moved_head, moved]);
}

#[test]
fn header_survives_reopen() {
    let dir = tempdir().unwrap();
    let offsets;
    {
        let mut records = open_store(&dir);
        offsets = vec![
            records.create_record(b"one").unwrap(),
            records.create_record(b"two").unwrap(),
            records.create_record(b"three").unwrap(),
        ];
        records.set_position(offsets[1]).unwrap();
        records.remove_record().unwrap();
        records.flush().unwrap();
    }

    let mut records = reopen_store(&dir);
    assert_eq!(records.total_records(), 2);
    assert_eq!(records.total_free_records(), 1);
    assert_eq!(walk_forward(&mut records), vec![offsets[0], offsets[2]]);
    records.set_position(offsets[2]).unwrap();
    assert_eq!(records.record_data().unwrap(), b"three");
}

#[test]
fn corrupted_header_fails_navigation_without_moving_cursor() {
    let dir = tempdir().unwrap();
    let mut records = open_store(&dir);

    let a = records.create_record(b"intact").unwrap();
    let b = records.create_record(b"doomed").unwrap();

    // Smash one byte of b's on-disk header.
    let mut byte = [0u8; 1];
    records.cache_mut().read(b, &mut byte).unwrap();
    records.cache_mut().write(b, &[byte[0] ^ 0xFF]).unwrap();

    records.set_position(a).unwrap();
    let err = records.set_position(b).unwrap_err();
    assert!(matches!(err, DbError::Corrupted(_)));
    assert_eq!(records.position(), Some(a));

    // next() walks into the same bad header and also refuses to move.
    assert!(records.next().is_err());
    assert_eq!(records.position(), Some(a));
}

#[test]
fn corrupted_payload_is_detected() {
    let dir = tempdir().unwrap();
    let mut records = open_store(&dir);

    let offset = records.create_record(b"checksummed").unwrap();
    let payload_at = offset + RECORD_HEADER_SIZE as u64;
    records.cache_mut().write(payload_at, b"Xhecksummed").unwrap();

    records.set_position(offset).unwrap();
    let err = records.record_data().unwrap_err();
    assert!(matches!(err, DbError::Corrupted(_)));
}

#[test]
fn file_size_is_monotonic() {
    let dir = tempdir().unwrap();
    let mut records = open_store(&dir);

    let mut last = 0;
    for i in 0..20 {
        let offset = records.create_record(&vec![i as u8; 100]).unwrap();
        if i % 3 == 0 {
            records.set_position(offset).unwrap();
            records.remove_record().unwrap();
        }
        records.flush().unwrap();
        let size = records.cache().file_size().unwrap();
        assert!(size >= last);
        last = size;
    }
}

#[test]
fn large_record_spans_pages() {
    let dir = tempdir().unwrap();
    let mut records = open_store(&dir);

    let payload: Vec<u8> = (0..3 * PAGE_SIZE).map(|i| (i % 251) as u8).collect();
    let offset = records.create_record(&payload).unwrap();

    records.set_position(offset).unwrap();
    assert_eq!(records.record_data().unwrap(), payload);
}

#[test]
fn empty_storage_has_no_records() {
    let dir = tempdir().unwrap();
    let mut records = open_store(&dir);

    assert_eq!(records.total_records(), 0);
    assert_eq!(records.first().unwrap(), None);
    assert_eq!(records.last().unwrap(), None);
    assert_eq!(records.position(), None);
}

#[test]
fn mutation_on_read_only_store_is_rejected() {
    let dir = tempdir().unwrap();
    {
        let mut records = open_store(&dir);
        records.create_record(b"seed").unwrap();
        records.flush().unwrap();
    }

    let file = CachedFile::open(dir.path().join("records.db"), DEFAULT_CACHE, true).unwrap();
    let mut records = RecordFile::new(file, None).unwrap();
    assert_eq!(records.total_records(), 1);

    assert!(matches!(
        records.create_record(b"no"),
        Err(DbError::ReadOnly)
    ));
    records.first().unwrap();
    assert!(matches!(records.remove_record(), Err(DbError::ReadOnly)));
    assert!(matches!(
        records.set_record_data(b"no"),
        Err(DbError::ReadOnly)
    ));
    assert_eq!(records.record_data().unwrap(), b"seed");
}

#[test]
fn opening_garbage_file_fails() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("records.db");
    std::fs::write(&path, vec![0xABu8; 128]).unwrap();

    let file = CachedFile::open(&path, DEFAULT_CACHE, false).unwrap();
    let err = RecordFile::new(file, None).unwrap_err();
    assert!(matches!(err, DbError::Storage(_) | DbError::Corrupted(_)));
}
