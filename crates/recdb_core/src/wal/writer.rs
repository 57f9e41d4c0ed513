//! WAL writer.

use crate::config::StoreConfig;
use crate::error::CoreResult;
use crate::wal::iterator::WalRecordIterator;
use crate::wal::record::{WalRecord, WAL_MAGIC, WAL_VERSION};
use parking_lot::Mutex;
use recdb_storage::StorageBackend;

/// Envelope header size: magic (4) + version (2) + type (1) + length (4).
pub(crate) const HEADER_SIZE: usize = 11;

/// CRC field size.
pub(crate) const CRC_SIZE: usize = 4;

/// Manages WAL appends and reads.
///
/// Entries are framed as `magic | version | type | payload length | payload
/// | crc32`, where the CRC covers everything before it. With checksums
/// disabled in the [`StoreConfig`] the CRC field is written as zero and
/// ignored on read.
pub struct WalManager {
    backend: Mutex<Box<dyn StorageBackend>>,
    sync_on_commit: bool,
    checksum: bool,
    checksum_on_read: bool,
}

impl WalManager {
    /// Creates a WAL manager over a backend.
    pub fn new(backend: Box<dyn StorageBackend>, config: &StoreConfig) -> Self {
        Self {
            backend: Mutex::new(backend),
            sync_on_commit: config.sync_on_commit,
            checksum: config.checksum,
            checksum_on_read: config.checksum_on_read,
        }
    }

    /// Appends a record to the WAL.
    ///
    /// Returns the offset where the record was written.
    ///
    /// # Errors
    ///
    /// Returns an error on encoding failure or I/O error.
    pub fn append(&self, record: &WalRecord) -> CoreResult<u64> {
        let payload = record.encode_payload()?;

        let mut data = Vec::with_capacity(HEADER_SIZE + payload.len() + CRC_SIZE);
        data.extend_from_slice(&WAL_MAGIC);
        data.extend_from_slice(&WAL_VERSION.to_le_bytes());
        data.push(record.record_type().as_byte());
        data.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        data.extend_from_slice(&payload);

        let crc = if self.checksum {
            crc32fast::hash(&data)
        } else {
            0
        };
        data.extend_from_slice(&crc.to_le_bytes());

        let mut backend = self.backend.lock();
        let offset = backend.append(&data)?;
        Ok(offset)
    }

    /// Forces the log to durable storage (no-op when `sync_on_commit` is
    /// disabled in the configuration).
    pub fn sync(&self) -> CoreResult<()> {
        let mut backend = self.backend.lock();
        backend.flush()?;
        if self.sync_on_commit {
            backend.sync()?;
        }
        Ok(())
    }

    /// Returns the current WAL size.
    pub fn size(&self) -> CoreResult<u64> {
        Ok(self.backend.lock().size()?)
    }

    /// Returns a streaming iterator over WAL records starting at offset 0.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend size cannot be determined.
    pub fn iter(&self) -> CoreResult<WalRecordIterator<'_>> {
        let backend = self.backend.lock();
        WalRecordIterator::new(backend, 0, self.checksum_on_read)
    }

    /// Truncates the WAL to `offset`, discarding everything after it.
    pub fn truncate(&self, offset: u64) -> CoreResult<()> {
        self.backend.lock().truncate(offset)?;
        Ok(())
    }

    /// Discards the whole log. Used after commit replay has reached the
    /// data file.
    pub fn clear(&self) -> CoreResult<()> {
        self.truncate(0)
    }
}

impl std::fmt::Debug for WalManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WalManager")
            .field("sync_on_commit", &self.sync_on_commit)
            .field("checksum", &self.checksum)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{CommitId, Recid};
    use recdb_storage::InMemoryBackend;

    fn memory_wal() -> WalManager {
        WalManager::new(Box::new(InMemoryBackend::new()), &StoreConfig::default())
    }

    fn read_all(wal: &WalManager) -> Vec<(u64, WalRecord)> {
        wal.iter().unwrap().map(|r| r.unwrap()).collect()
    }

    #[test]
    fn roundtrip_single_record() {
        let wal = memory_wal();
        let record = WalRecord::Put {
            recid: Recid::new(1),
            payload: Some(vec![0xCA, 0xFE]),
        };
        wal.append(&record).unwrap();

        let records = read_all(&wal);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].1, record);
    }

    #[test]
    fn records_read_back_in_order() {
        let wal = memory_wal();

        let r1 = WalRecord::Preallocate {
            recid: Recid::new(1),
        };
        let r2 = WalRecord::Put {
            recid: Recid::new(1),
            payload: Some(vec![1, 2, 3]),
        };
        let r3 = WalRecord::Commit {
            commit_id: CommitId::new(1),
        };

        wal.append(&r1).unwrap();
        wal.append(&r2).unwrap();
        wal.append(&r3).unwrap();

        let records = read_all(&wal);
        assert_eq!(records.len(), 3);
        assert_eq!(records[0].1, r1);
        assert_eq!(records[1].1, r2);
        assert_eq!(records[2].1, r3);
    }

    #[test]
    fn empty_log_has_no_records() {
        let wal = memory_wal();
        assert!(read_all(&wal).is_empty());
    }

    #[test]
    fn append_grows_log() {
        let wal = memory_wal();
        assert_eq!(wal.size().unwrap(), 0);

        wal.append(&WalRecord::Delete {
            recid: Recid::new(1),
        })
        .unwrap();

        assert!(wal.size().unwrap() > 0);
    }

    #[test]
    fn clear_empties_log() {
        let wal = memory_wal();

        wal.append(&WalRecord::Put {
            recid: Recid::new(1),
            payload: None,
        })
        .unwrap();
        wal.append(&WalRecord::Commit {
            commit_id: CommitId::new(1),
        })
        .unwrap();

        assert!(wal.size().unwrap() > 0);
        wal.clear().unwrap();

        assert_eq!(wal.size().unwrap(), 0);
        assert!(read_all(&wal).is_empty());
    }

    #[test]
    fn truncate_discards_tail() {
        let wal = memory_wal();

        let offset1 = wal
            .append(&WalRecord::Delete {
                recid: Recid::new(1),
            })
            .unwrap();
        let size_after_first = wal.size().unwrap();

        wal.append(&WalRecord::Commit {
            commit_id: CommitId::new(1),
        })
        .unwrap();

        assert_eq!(read_all(&wal).len(), 2);
        wal.truncate(size_after_first).unwrap();

        let records = read_all(&wal);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].0, offset1);
    }

    #[test]
    fn checksum_disabled_still_roundtrips() {
        let config = StoreConfig::default().checksum(false).checksum_on_read(false);
        let wal = WalManager::new(Box::new(InMemoryBackend::new()), &config);

        let record = WalRecord::Put {
            recid: Recid::new(5),
            payload: Some(vec![9, 9]),
        };
        wal.append(&record).unwrap();

        let records = read_all(&wal);
        assert_eq!(records[0].1, record);
    }
}
