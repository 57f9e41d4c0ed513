//! Crash and reopen scenarios.
//!
//! `SharedMemoryBackend` exposes snapshot and restore of its raw bytes, so
//! these tests freeze the data file and log at chosen points, "crash" by
//! dropping the store, and reopen from the frozen bytes to exercise
//! recovery. The file-backed tests at the bottom run the same reopen paths
//! against real files.

use recdb_core::wal::{WalManager, WalRecord};
use recdb_core::{
    CommitId, CoreError, Recid, Store, StoreAppend, StoreConfig, StoreDirect, StoreWal,
    U64Serializer,
};
use recdb_storage::{FileBackend, SharedMemoryBackend};

fn config() -> StoreConfig {
    StoreConfig::default().index_capacity(256)
}

fn open_wal_store(data: &SharedMemoryBackend, log: &SharedMemoryBackend) -> StoreWal {
    StoreWal::open(Box::new(data.clone()), Box::new(log.clone()), &config()).unwrap()
}

#[test]
fn crash_loses_only_the_transaction_in_flight() {
    let data = SharedMemoryBackend::new();
    let log = SharedMemoryBackend::new();
    let ser = U64Serializer;

    let store = open_wal_store(&data, &log);
    let committed = store.put(Some(&100), &ser).unwrap();
    store.commit().unwrap();

    let lost = store.put(Some(&200), &ser).unwrap();
    store.update(committed, &ser, Some(&999)).unwrap();

    // Crash: freeze both files exactly as they are now
    let data_snapshot = data.data();
    let log_snapshot = log.data();
    drop(store);

    let data = SharedMemoryBackend::new();
    let log = SharedMemoryBackend::new();
    data.set_data(data_snapshot);
    log.set_data(log_snapshot);

    let store = open_wal_store(&data, &log);
    assert_eq!(store.get(committed, &ser).unwrap(), Some(100));
    assert!(matches!(
        store.get(lost, &ser),
        Err(CoreError::RecidNotFound { .. })
    ));
    store.verify().unwrap();
}

#[test]
fn torn_log_tail_discards_uncommitted_entries() {
    let data = SharedMemoryBackend::new();
    let log = SharedMemoryBackend::new();
    let ser = U64Serializer;

    let store = open_wal_store(&data, &log);
    let committed = store.put(Some(&1), &ser).unwrap();
    store.commit().unwrap();
    store.put(Some(&2), &ser).unwrap();

    // Crash mid-append: the last log entry is half-written
    let mut log_bytes = log.data();
    let torn_len = log_bytes.len() - 3;
    log_bytes.truncate(torn_len);
    let data_snapshot = data.data();
    drop(store);

    let data = SharedMemoryBackend::new();
    let log = SharedMemoryBackend::new();
    data.set_data(data_snapshot);
    log.set_data(log_bytes);

    let store = open_wal_store(&data, &log);
    assert_eq!(store.get(committed, &ser).unwrap(), Some(1));
    assert!(store.pending_ops() == 0);
    store.verify().unwrap();
}

#[test]
fn recovery_is_idempotent() {
    let data = SharedMemoryBackend::new();
    let ser = U64Serializer;

    // A log holding one committed transaction, built directly so it can be
    // replayed onto the same data file more than once
    let make_log = || {
        let log = SharedMemoryBackend::new();
        let wal = WalManager::new(Box::new(log.clone()), &config());
        wal.append(&WalRecord::Put {
            recid: Recid::new(1),
            payload: Some(7u64.to_le_bytes().to_vec()),
        })
        .unwrap();
        wal.append(&WalRecord::Put {
            recid: Recid::new(2),
            payload: None,
        })
        .unwrap();
        wal.append(&WalRecord::Delete {
            recid: Recid::new(2),
        })
        .unwrap();
        wal.append(&WalRecord::Commit {
            commit_id: CommitId::new(1),
        })
        .unwrap();
        log
    };

    // First recovery applies the log; the second, simulating a crash after
    // apply but before the log was cleared, must converge on the same state
    for _ in 0..2 {
        let store = StoreWal::open(Box::new(data.clone()), Box::new(make_log()), &config()).unwrap();
        assert_eq!(store.get(Recid::new(1), &ser).unwrap(), Some(7));
        assert!(matches!(
            store.get(Recid::new(2), &ser),
            Err(CoreError::RecidNotFound { .. })
        ));
        store.verify().unwrap();
        drop(store);
    }
}

#[test]
fn corrupt_log_entry_ends_replay() {
    let data = SharedMemoryBackend::new();
    let log = SharedMemoryBackend::new();
    let ser = U64Serializer;

    let store = open_wal_store(&data, &log);
    let committed = store.put(Some(&5), &ser).unwrap();
    store.commit().unwrap();
    store.put(Some(&6), &ser).unwrap();

    // Flip a byte inside the uncommitted entry's payload
    let mut log_bytes = log.data();
    let last = log_bytes.len() - 5;
    log_bytes[last] ^= 0xFF;
    let data_snapshot = data.data();
    drop(store);

    let data = SharedMemoryBackend::new();
    let log = SharedMemoryBackend::new();
    data.set_data(data_snapshot);
    log.set_data(log_bytes);

    // The damaged entry sits after the last commit marker, so recovery
    // discards it and keeps everything committed
    let store = open_wal_store(&data, &log);
    assert_eq!(store.get(committed, &ser).unwrap(), Some(5));
    store.verify().unwrap();
}

#[test]
fn append_store_survives_repeated_crashes() {
    let backend = SharedMemoryBackend::new();
    let ser = U64Serializer;

    let (r1, r2);
    {
        let store = StoreAppend::open(Box::new(backend.clone()), &config()).unwrap();
        r1 = store.put(Some(&1), &ser).unwrap();
        r2 = store.put(Some(&2), &ser).unwrap();
        store.update(r1, &ser, Some(&10)).unwrap();
        // No commit, no close: every complete frame still survives
    }

    for _ in 0..3 {
        let store = StoreAppend::open(Box::new(backend.clone()), &config()).unwrap();
        assert_eq!(store.get(r1, &ser).unwrap(), Some(10));
        assert_eq!(store.get(r2, &ser).unwrap(), Some(2));
        store.verify().unwrap();
    }
}

#[test]
fn append_store_torn_frame_then_new_writes() {
    let backend = SharedMemoryBackend::new();
    let ser = U64Serializer;

    let r1;
    {
        let store = StoreAppend::open(Box::new(backend.clone()), &config()).unwrap();
        r1 = store.put(Some(&1), &ser).unwrap();
        store.put(Some(&2), &ser).unwrap();
    }

    // Tear the second frame, then write through the reopened store
    let mut bytes = backend.data();
    let torn = bytes.len() - 4;
    bytes.truncate(torn);
    backend.set_data(bytes);

    let r3;
    {
        let store = StoreAppend::open(Box::new(backend.clone()), &config()).unwrap();
        // The torn recid was never allocated, so it is handed out again
        r3 = store.put(Some(&3), &ser).unwrap();
        assert_eq!(r3.as_u64(), 2);
        store.commit().unwrap();
    }

    let store = StoreAppend::open(Box::new(backend), &config()).unwrap();
    assert_eq!(store.get(r1, &ser).unwrap(), Some(1));
    assert_eq!(store.get(r3, &ser).unwrap(), Some(3));
    store.verify().unwrap();
}

#[test]
fn direct_store_file_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("records.db");
    let ser = U64Serializer;
    let (kept, freed);

    {
        let backend = FileBackend::open(&path).unwrap();
        let store = StoreDirect::open(Box::new(backend), &config()).unwrap();
        kept = store.put(Some(&77), &ser).unwrap();
        freed = store.put(Some(&88), &ser).unwrap();
        store.delete(freed).unwrap();
        store.commit().unwrap();
        store.close().unwrap();
    }

    let backend = FileBackend::open(&path).unwrap();
    let store = StoreDirect::open(Box::new(backend), &config()).unwrap();
    assert_eq!(store.get(kept, &ser).unwrap(), Some(77));
    assert!(matches!(
        store.get(freed, &ser),
        Err(CoreError::RecidNotFound { .. })
    ));
    let reused = store.put(Some(&99), &ser).unwrap();
    assert_eq!(reused, freed);
    store.verify().unwrap();
}

#[test]
fn wal_store_file_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let data_path = dir.path().join("records.db");
    let log_path = dir.path().join("records.wal");
    let ser = U64Serializer;
    let recid;

    {
        let store = StoreWal::open(
            Box::new(FileBackend::open(&data_path).unwrap()),
            Box::new(FileBackend::open(&log_path).unwrap()),
            &config(),
        )
        .unwrap();
        recid = store.put(Some(&123), &ser).unwrap();
        store.commit().unwrap();
        store.close().unwrap();
    }

    let store = StoreWal::open(
        Box::new(FileBackend::open(&data_path).unwrap()),
        Box::new(FileBackend::open(&log_path).unwrap()),
        &config(),
    )
    .unwrap();
    assert_eq!(store.get(recid, &ser).unwrap(), Some(123));
    store.verify().unwrap();
}

#[test]
fn append_store_file_reopen_after_compact() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("records.log");
    let ser = U64Serializer;
    let keep;

    {
        let backend = FileBackend::open(&path).unwrap();
        let store = StoreAppend::open(Box::new(backend), &config()).unwrap();
        keep = store.put(Some(&1), &ser).unwrap();
        let gone = store.put(Some(&2), &ser).unwrap();
        store.update(keep, &ser, Some(&11)).unwrap();
        store.delete(gone).unwrap();
        store.compact().unwrap();
        store.commit().unwrap();
        store.close().unwrap();
    }

    let backend = FileBackend::open(&path).unwrap();
    let store = StoreAppend::open(Box::new(backend), &config()).unwrap();
    assert_eq!(store.get(keep, &ser).unwrap(), Some(11));
    assert!(store.put(Some(&3), &ser).unwrap().as_u64() > keep.as_u64());
    store.verify().unwrap();
}
