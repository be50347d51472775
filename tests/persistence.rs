//! Integration tests against the public API: the concrete recovery and
//! crash-safety scenarios this log is built to satisfy.

use std::net::{IpAddr, Ipv4Addr};

use raft_persistent_log::{CancellationToken, Endpoint, Log, LogOptions, NewEntry, PersistentLog};

fn options(dir: &std::path::Path) -> LogOptions {
    LogOptions { location: dir.to_path_buf(), records_per_partition: 4, max_record_size: 256 }
}

#[tokio::test]
async fn open_empty_directory_yields_sentinel_only() {
    let dir = tempfile::tempdir().unwrap();
    let log = PersistentLog::open(options(dir.path())).await.unwrap();

    assert_eq!(log.get_last_index(false), 0);
    assert_eq!(log.get_last_index(true), 0);
    let entries = log.get_entries(0, 0).await.unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].term(), 0);
    assert!(entries[0].is_empty());
}

#[tokio::test]
async fn appending_past_partition_boundary_creates_second_file() {
    let dir = tempfile::tempdir().unwrap();
    let log = PersistentLog::open(options(dir.path())).await.unwrap();

    let first = log
        .append(
            vec![NewEntry::new(1, "a", "text/plain", b"hi".to_vec())],
            Some(1),
            CancellationToken::new(),
        )
        .await
        .unwrap();
    assert_eq!(first, 1);
    assert_eq!(log.get_last_index(false), 1);
    assert!(dir.path().join("0").exists());
    assert!(!dir.path().join("1").exists());

    let more = vec![
        NewEntry::new(2, "b", "text/plain", b"x".to_vec()),
        NewEntry::new(2, "c", "text/plain", b"x".to_vec()),
        NewEntry::new(3, "d", "text/plain", b"x".to_vec()),
        NewEntry::new(3, "e", "text/plain", b"x".to_vec()),
    ];
    log.append(more, Some(2), CancellationToken::new()).await.unwrap();

    assert_eq!(log.get_last_index(false), 5);
    assert!(dir.path().join("1").exists());

    let entries = log.get_entries(1, 5).await.unwrap();
    assert_eq!(entries.len(), 5);
    assert_eq!(entries[0].payload().unwrap(), b"hi");
    assert_eq!(entries[4].term(), 3);
}

#[tokio::test]
async fn overwriting_an_occupied_index_replaces_it() {
    let dir = tempfile::tempdir().unwrap();
    let log = PersistentLog::open(options(dir.path())).await.unwrap();
    log.append(
        vec![NewEntry::new(1, "a", "text/plain", b"first".to_vec())],
        Some(1),
        CancellationToken::new(),
    )
    .await
    .unwrap();
    log.append(
        vec![NewEntry::new(2, "b", "text/plain", b"second".to_vec())],
        Some(1),
        CancellationToken::new(),
    )
    .await
    .unwrap();

    let entries = log.get_entries(1, 1).await.unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].term(), 2);
    assert_eq!(entries[0].payload().unwrap(), b"second");
}

#[tokio::test]
async fn term_survives_close_and_reopen() {
    let dir = tempfile::tempdir().unwrap();
    {
        let log = PersistentLog::open(options(dir.path())).await.unwrap();
        assert_eq!(log.increment_term(CancellationToken::new()).await.unwrap(), 1);
        assert_eq!(log.increment_term(CancellationToken::new()).await.unwrap(), 2);
    }

    let log = PersistentLog::open(options(dir.path())).await.unwrap();
    assert_eq!(log.term(), 2);
}

#[tokio::test]
async fn voted_for_survives_close_and_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let voted = Endpoint::new(IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)), 9000);
    let other = Endpoint::new(IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)), 9001);

    {
        let log = PersistentLog::open(options(dir.path())).await.unwrap();
        log.update_voted_for(Some(&voted), CancellationToken::new()).await.unwrap();
    }

    let log = PersistentLog::open(options(dir.path())).await.unwrap();
    assert!(log.is_voted_for(&voted).await.unwrap());
    assert!(!log.is_voted_for(&other).await.unwrap());
}

#[tokio::test]
async fn repeated_voted_for_update_is_idempotent() {
    let dir = tempfile::tempdir().unwrap();
    let voted = Endpoint::new(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 5)), 7000);
    let log = PersistentLog::open(options(dir.path())).await.unwrap();
    log.update_voted_for(Some(&voted), CancellationToken::new()).await.unwrap();
    log.update_voted_for(Some(&voted), CancellationToken::new()).await.unwrap();
    assert!(log.is_voted_for(&voted).await.unwrap());
}

#[tokio::test]
async fn get_entries_with_end_before_start_is_empty() {
    let dir = tempfile::tempdir().unwrap();
    let log = PersistentLog::open(options(dir.path())).await.unwrap();
    log.append(
        vec![NewEntry::new(1, "a", "text/plain", b"hi".to_vec())],
        Some(1),
        CancellationToken::new(),
    )
    .await
    .unwrap();
    assert_eq!(log.get_entries(5, 3).await.unwrap().len(), 0);
}

#[tokio::test]
async fn entry_at_max_record_size_succeeds_one_byte_over_fails() {
    let dir = tempfile::tempdir().unwrap();
    // present(1) + name prefix+bytes(2) + type prefix+bytes(2) + term(8) + length(8) = 21 bytes overhead.
    let log = PersistentLog::open(LogOptions {
        location: dir.path().to_path_buf(),
        records_per_partition: 2,
        max_record_size: 31,
    })
    .await
    .unwrap();

    let exact = NewEntry::new(1, "a", "b", vec![0u8; 10]);
    assert_eq!(exact.encoded_len(), 31);
    log.append(vec![exact], Some(1), CancellationToken::new()).await.unwrap();

    let too_big = NewEntry::new(1, "a", "b", vec![0u8; 11]);
    let err = log.append(vec![too_big], Some(1), CancellationToken::new()).await;
    assert!(err.is_err());
}

/// Simulates a crash between the body flush and the present-flag flush:
/// a slot whose bytes are fully written but whose present byte never made
/// it to disk must read back as empty, and recovery must not choke on it.
#[tokio::test]
async fn crash_before_present_flag_flush_leaves_slot_reading_as_empty() {
    let dir = tempfile::tempdir().unwrap();
    {
        let log = PersistentLog::open(options(dir.path())).await.unwrap();
        log.append(
            vec![
                NewEntry::new(1, "a", "text/plain", b"one".to_vec()),
                NewEntry::new(1, "b", "text/plain", b"two".to_vec()),
                NewEntry::new(1, "c", "text/plain", b"three".to_vec()),
            ],
            Some(1),
            CancellationToken::new(),
        )
        .await
        .unwrap();
    }

    // Clear the present flag of the last written slot (global index 3,
    // partition 0 slot 3) to emulate a crash that landed the body flush
    // but not the present-flag flush.
    let partition_path = dir.path().join("0");
    let max_record_size = 256u64;
    let header_len = 16u64;
    let slot_offset = header_len + 3 * max_record_size;
    {
        use std::io::{Seek, SeekFrom, Write};
        let mut file = std::fs::OpenOptions::new().write(true).open(&partition_path).unwrap();
        file.seek(SeekFrom::Start(slot_offset)).unwrap();
        file.write_all(&[0u8]).unwrap();
        file.sync_all().unwrap();
    }

    let log = PersistentLog::open(options(dir.path())).await.unwrap();
    assert_eq!(log.get_last_index(false), 2);
    let entries = log.get_entries(1, 3).await.unwrap();
    assert_eq!(entries.len(), 2);
    assert_eq!(entries[1].payload().unwrap(), b"two");
}

#[tokio::test]
async fn commit_never_exceeds_last_index() {
    let dir = tempfile::tempdir().unwrap();
    let log = PersistentLog::open(options(dir.path())).await.unwrap();
    log.append(
        vec![NewEntry::new(1, "a", "text/plain", b"hi".to_vec())],
        Some(1),
        CancellationToken::new(),
    )
    .await
    .unwrap();

    log.commit(Some(100), CancellationToken::new()).await.unwrap();
    assert_eq!(log.get_last_index(true), log.get_last_index(false));
    assert!(log.get_last_index(true) <= log.get_last_index(false));
}
