//! WAL record types and serialization.

use crate::error::{CoreError, CoreResult};
use crate::types::{CommitId, Recid};

/// Magic bytes identifying a WAL record.
pub const WAL_MAGIC: [u8; 4] = *b"RWAL";

/// Current WAL format version.
pub const WAL_VERSION: u16 = 1;

/// Type of WAL record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum WalRecordType {
    /// Write a record payload (or the null state) under a recid.
    Put = 1,
    /// Delete a record, returning its recid to the free list.
    Delete = 2,
    /// Allocate a recid in the null state.
    Preallocate = 3,
    /// Commit marker closing the entries before it.
    Commit = 4,
}

impl WalRecordType {
    /// Converts a byte to a record type.
    #[must_use]
    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            1 => Some(Self::Put),
            2 => Some(Self::Delete),
            3 => Some(Self::Preallocate),
            4 => Some(Self::Commit),
            _ => None,
        }
    }

    /// Converts the record type to a byte.
    #[must_use]
    pub const fn as_byte(self) -> u8 {
        self as u8
    }
}

/// A WAL record describing one recid mutation or a commit boundary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WalRecord {
    /// Write a payload (`None` = null state) under `recid`.
    Put {
        /// Target recid.
        recid: Recid,
        /// Serialized payload, or `None` for the null state.
        payload: Option<Vec<u8>>,
    },

    /// Delete the record at `recid`.
    Delete {
        /// Target recid.
        recid: Recid,
    },

    /// Allocate `recid` in the null state.
    Preallocate {
        /// Allocated recid.
        recid: Recid,
    },

    /// Commit marker: every entry before it is durable once this marker is.
    Commit {
        /// Monotonic id of this commit.
        commit_id: CommitId,
    },
}

impl WalRecord {
    /// Maximum payload size in a WAL record (4-byte length field).
    pub const MAX_PAYLOAD_SIZE: usize = u32::MAX as usize;

    /// Returns the record type.
    #[must_use]
    pub fn record_type(&self) -> WalRecordType {
        match self {
            Self::Put { .. } => WalRecordType::Put,
            Self::Delete { .. } => WalRecordType::Delete,
            Self::Preallocate { .. } => WalRecordType::Preallocate,
            Self::Commit { .. } => WalRecordType::Commit,
        }
    }

    /// Serializes the record payload (without envelope).
    ///
    /// # Errors
    ///
    /// Returns an error if a `Put` payload exceeds [`Self::MAX_PAYLOAD_SIZE`].
    pub fn encode_payload(&self) -> CoreResult<Vec<u8>> {
        let mut buf = Vec::new();

        match self {
            Self::Put { recid, payload } => {
                buf.extend_from_slice(&recid.as_u64().to_le_bytes());
                match payload {
                    None => buf.push(0),
                    Some(bytes) => {
                        if bytes.len() > Self::MAX_PAYLOAD_SIZE {
                            return Err(CoreError::invalid_operation(format!(
                                "WAL payload of {} bytes exceeds maximum of {}",
                                bytes.len(),
                                Self::MAX_PAYLOAD_SIZE
                            )));
                        }
                        buf.push(1);
                        buf.extend_from_slice(&(bytes.len() as u32).to_le_bytes());
                        buf.extend_from_slice(bytes);
                    }
                }
            }

            Self::Delete { recid } | Self::Preallocate { recid } => {
                buf.extend_from_slice(&recid.as_u64().to_le_bytes());
            }

            Self::Commit { commit_id } => {
                buf.extend_from_slice(&commit_id.as_u64().to_le_bytes());
            }
        }

        Ok(buf)
    }

    /// Deserializes a record from its type and payload.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::WalCorruption`] on truncated or trailing bytes.
    pub fn decode_payload(record_type: WalRecordType, payload: &[u8]) -> CoreResult<Self> {
        let mut cursor = 0usize;

        let read_u64 = |cursor: &mut usize| -> CoreResult<u64> {
            if *cursor + 8 > payload.len() {
                return Err(CoreError::wal_corruption("unexpected end of payload"));
            }
            let bytes: [u8; 8] = payload[*cursor..*cursor + 8]
                .try_into()
                .map_err(|_| CoreError::wal_corruption("invalid u64"))?;
            *cursor += 8;
            Ok(u64::from_le_bytes(bytes))
        };

        let read_u32 = |cursor: &mut usize| -> CoreResult<u32> {
            if *cursor + 4 > payload.len() {
                return Err(CoreError::wal_corruption("unexpected end of payload"));
            }
            let bytes: [u8; 4] = payload[*cursor..*cursor + 4]
                .try_into()
                .map_err(|_| CoreError::wal_corruption("invalid u32"))?;
            *cursor += 4;
            Ok(u32::from_le_bytes(bytes))
        };

        let check_consumed = |cursor: usize| -> CoreResult<()> {
            if cursor != payload.len() {
                return Err(CoreError::wal_corruption(format!(
                    "trailing bytes: expected {} bytes, got {}",
                    cursor,
                    payload.len()
                )));
            }
            Ok(())
        };

        match record_type {
            WalRecordType::Put => {
                let recid = Recid::new(read_u64(&mut cursor)?);
                if cursor >= payload.len() {
                    return Err(CoreError::wal_corruption("missing payload flag"));
                }
                let flag = payload[cursor];
                cursor += 1;
                let value = match flag {
                    0 => None,
                    1 => {
                        let len = read_u32(&mut cursor)? as usize;
                        if cursor + len > payload.len() {
                            return Err(CoreError::wal_corruption("unexpected end of payload"));
                        }
                        let bytes = payload[cursor..cursor + len].to_vec();
                        cursor += len;
                        Some(bytes)
                    }
                    other => {
                        return Err(CoreError::wal_corruption(format!(
                            "invalid payload flag {other}"
                        )))
                    }
                };
                check_consumed(cursor)?;
                Ok(Self::Put {
                    recid,
                    payload: value,
                })
            }

            WalRecordType::Delete => {
                let recid = Recid::new(read_u64(&mut cursor)?);
                check_consumed(cursor)?;
                Ok(Self::Delete { recid })
            }

            WalRecordType::Preallocate => {
                let recid = Recid::new(read_u64(&mut cursor)?);
                check_consumed(cursor)?;
                Ok(Self::Preallocate { recid })
            }

            WalRecordType::Commit => {
                let commit_id = CommitId::new(read_u64(&mut cursor)?);
                check_consumed(cursor)?;
                Ok(Self::Commit { commit_id })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn type_byte_roundtrip() {
        for t in [
            WalRecordType::Put,
            WalRecordType::Delete,
            WalRecordType::Preallocate,
            WalRecordType::Commit,
        ] {
            assert_eq!(WalRecordType::from_byte(t.as_byte()), Some(t));
        }
    }

    #[test]
    fn unknown_type_byte() {
        assert_eq!(WalRecordType::from_byte(0), None);
        assert_eq!(WalRecordType::from_byte(99), None);
    }

    #[test]
    fn put_payload_roundtrip() {
        let record = WalRecord::Put {
            recid: Recid::new(42),
            payload: Some(vec![0xCA, 0xFE, 0xBA, 0xBE]),
        };
        let payload = record.encode_payload().unwrap();
        let decoded = WalRecord::decode_payload(WalRecordType::Put, &payload).unwrap();
        assert_eq!(record, decoded);
    }

    #[test]
    fn put_null_roundtrip() {
        let record = WalRecord::Put {
            recid: Recid::new(7),
            payload: None,
        };
        let payload = record.encode_payload().unwrap();
        let decoded = WalRecord::decode_payload(WalRecordType::Put, &payload).unwrap();
        assert_eq!(record, decoded);
    }

    #[test]
    fn delete_payload_roundtrip() {
        let record = WalRecord::Delete {
            recid: Recid::new(99),
        };
        let payload = record.encode_payload().unwrap();
        let decoded = WalRecord::decode_payload(WalRecordType::Delete, &payload).unwrap();
        assert_eq!(record, decoded);
    }

    #[test]
    fn preallocate_payload_roundtrip() {
        let record = WalRecord::Preallocate {
            recid: Recid::new(3),
        };
        let payload = record.encode_payload().unwrap();
        let decoded = WalRecord::decode_payload(WalRecordType::Preallocate, &payload).unwrap();
        assert_eq!(record, decoded);
    }

    #[test]
    fn commit_payload_roundtrip() {
        let record = WalRecord::Commit {
            commit_id: CommitId::new(500),
        };
        let payload = record.encode_payload().unwrap();
        let decoded = WalRecord::decode_payload(WalRecordType::Commit, &payload).unwrap();
        assert_eq!(record, decoded);
    }

    #[test]
    fn truncated_payload_rejected() {
        let record = WalRecord::Put {
            recid: Recid::new(1),
            payload: Some(vec![1, 2, 3]),
        };
        let payload = record.encode_payload().unwrap();
        let result = WalRecord::decode_payload(WalRecordType::Put, &payload[..payload.len() - 1]);
        assert!(matches!(result, Err(CoreError::WalCorruption { .. })));
    }

    #[test]
    fn trailing_bytes_rejected() {
        let record = WalRecord::Delete {
            recid: Recid::new(1),
        };
        let mut payload = record.encode_payload().unwrap();
        payload.push(0);
        let result = WalRecord::decode_payload(WalRecordType::Delete, &payload);
        assert!(matches!(result, Err(CoreError::WalCorruption { .. })));
    }
}
