//! Streaming WAL record iterator.
//!
//! Reads records one at a time from the storage backend. A truncated
//! trailing record - the signature of a crash mid-append - ends the scan
//! cleanly rather than erroring; recovery then simply never sees the torn
//! entry.

use crate::error::{CoreError, CoreResult};
use crate::wal::record::{WalRecord, WalRecordType, WAL_MAGIC, WAL_VERSION};
use crate::wal::writer::{CRC_SIZE, HEADER_SIZE};
use parking_lot::MutexGuard;
use recdb_storage::StorageBackend;

/// A streaming iterator over WAL records.
///
/// Yields `(offset, record)` pairs in log order.
///
/// # Error Handling
///
/// - Invalid magic bytes or unknown record types yield a corruption error
/// - CRC mismatches yield [`CoreError::ChecksumMismatch`] when verification
///   is enabled
/// - A record whose header or payload extends past the end of the log is
///   treated as the end of the WAL
pub struct WalRecordIterator<'a> {
    backend: MutexGuard<'a, Box<dyn StorageBackend>>,
    total_size: u64,
    current_offset: u64,
    verify_checksum: bool,
    finished: bool,
}

impl<'a> WalRecordIterator<'a> {
    /// Creates an iterator starting at `start_offset`.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend size cannot be determined.
    pub fn new(
        backend: MutexGuard<'a, Box<dyn StorageBackend>>,
        start_offset: u64,
        verify_checksum: bool,
    ) -> CoreResult<Self> {
        let total_size = backend.size()?;
        Ok(Self {
            backend,
            total_size,
            current_offset: start_offset,
            verify_checksum,
            finished: false,
        })
    }

    fn read_next_record(&mut self) -> CoreResult<Option<(u64, WalRecord)>> {
        let record_start = self.current_offset;

        if record_start + HEADER_SIZE as u64 > self.total_size {
            // Incomplete header: truncated WAL, treat as end
            self.finished = true;
            return Ok(None);
        }

        let header = self.backend.read_at(record_start, HEADER_SIZE)?;

        if header[0..4] != WAL_MAGIC {
            self.finished = true;
            return Err(CoreError::wal_corruption(format!(
                "invalid magic at offset {record_start}"
            )));
        }

        let version = u16::from_le_bytes([header[4], header[5]]);
        if version > WAL_VERSION {
            self.finished = true;
            return Err(CoreError::wal_corruption(format!(
                "unsupported version {version} at offset {record_start}"
            )));
        }

        let type_byte = header[6];
        let Some(record_type) = WalRecordType::from_byte(type_byte) else {
            self.finished = true;
            return Err(CoreError::wal_corruption(format!(
                "unknown record type {type_byte} at offset {record_start}"
            )));
        };

        let payload_len = u32::from_le_bytes([header[7], header[8], header[9], header[10]]) as usize;
        let total_len = HEADER_SIZE + payload_len + CRC_SIZE;

        if record_start + total_len as u64 > self.total_size {
            // Incomplete record: truncated WAL, treat as end
            self.finished = true;
            return Ok(None);
        }

        let payload = self
            .backend
            .read_at(record_start + HEADER_SIZE as u64, payload_len)?;
        let crc_bytes = self
            .backend
            .read_at(record_start + (HEADER_SIZE + payload_len) as u64, CRC_SIZE)?;
        let stored_crc = u32::from_le_bytes([crc_bytes[0], crc_bytes[1], crc_bytes[2], crc_bytes[3]]);

        if self.verify_checksum {
            let mut hasher = crc32fast::Hasher::new();
            hasher.update(&header);
            hasher.update(&payload);
            let computed_crc = hasher.finalize();

            if stored_crc != computed_crc {
                self.finished = true;
                return Err(CoreError::ChecksumMismatch {
                    expected: stored_crc,
                    actual: computed_crc,
                });
            }
        }

        let record = WalRecord::decode_payload(record_type, &payload)?;
        self.current_offset += total_len as u64;

        Ok(Some((record_start, record)))
    }

    /// Offset one past the last record yielded so far.
    #[must_use]
    pub fn offset(&self) -> u64 {
        self.current_offset
    }
}

impl Iterator for WalRecordIterator<'_> {
    type Item = CoreResult<(u64, WalRecord)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }

        match self.read_next_record() {
            Ok(Some(item)) => Some(Ok(item)),
            Ok(None) => None,
            Err(e) => {
                self.finished = true;
                Some(Err(e))
            }
        }
    }
}
