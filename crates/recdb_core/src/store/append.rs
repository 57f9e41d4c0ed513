//! Append-only log store.
//!
//! Every mutation is a frame appended to a single log:
//!
//! ```text
//! recid u64 LE (8) | size i32 LE (4) | payload (size bytes when size >= 0)
//! ```
//!
//! `size` is the payload length, or `-1` for the null state, or `-2` for a
//! tombstone. The latest frame for a recid wins; opening the store scans
//! the log once to rebuild the in-memory recid index, truncating a torn
//! trailing frame. Superseded frames are dead weight until
//! [`Store::compact`] rewrites the log with only the latest state of each
//! live recid.

use crate::config::StoreConfig;
use crate::error::{CoreError, CoreResult};
use crate::serializer::Serializer;
use crate::store::index::MAX_RECORD_SIZE;
use crate::store::{opt_equals, serialize_opt, Store};
use crate::types::Recid;
use parking_lot::RwLock;
use recdb_storage::StorageBackend;
use std::collections::{HashMap, HashSet};
use tracing::{debug, info};

/// Frame header size: recid (8) + size (4).
pub const FRAME_HEADER_SIZE: u64 = 12;

/// Size field value for a null-state frame.
pub const SIZE_NULL: i32 = -1;

/// Size field value for a tombstone frame.
pub const SIZE_TOMBSTONE: i32 = -2;

/// Latest known state of a live recid.
#[derive(Debug, Clone, Copy)]
enum AppendSlot {
    Null,
    Present {
        /// Payload offset (just past the frame header).
        offset: u64,
        size: u32,
    },
}

struct AppendInner {
    backend: Box<dyn StorageBackend>,
    /// Latest state per allocated recid; deleted recids are absent.
    index: HashMap<u64, AppendSlot>,
    max_recid: u64,
    free_stack: Vec<u64>,
    free_set: HashSet<u64>,
    sync_on_commit: bool,
    closed: bool,
}

impl AppendInner {
    fn check_open(&self) -> CoreResult<()> {
        if self.closed {
            return Err(CoreError::StoreClosed);
        }
        Ok(())
    }

    fn allocate(&mut self) -> CoreResult<Recid> {
        while let Some(recid) = self.free_stack.pop() {
            if !self.free_set.remove(&recid) {
                continue;
            }
            if self.index.contains_key(&recid) {
                return Err(CoreError::data_corruption(format!(
                    "free recid {recid} still indexed"
                )));
            }
            return Ok(Recid::new(recid));
        }
        self.max_recid += 1;
        Ok(Recid::new(self.max_recid))
    }

    fn encode_frame(recid: Recid, bytes: Option<&[u8]>, tombstone: bool) -> CoreResult<Vec<u8>> {
        let size = match (tombstone, bytes) {
            (true, _) => SIZE_TOMBSTONE,
            (false, None) => SIZE_NULL,
            (false, Some(data)) => {
                if data.len() > MAX_RECORD_SIZE {
                    return Err(CoreError::RecordTooLarge {
                        size: data.len(),
                        max: MAX_RECORD_SIZE,
                    });
                }
                data.len() as i32
            }
        };

        let mut frame =
            Vec::with_capacity(FRAME_HEADER_SIZE as usize + bytes.map_or(0, <[u8]>::len));
        frame.extend_from_slice(&recid.as_u64().to_le_bytes());
        frame.extend_from_slice(&size.to_le_bytes());
        if !tombstone {
            if let Some(data) = bytes {
                frame.extend_from_slice(data);
            }
        }
        Ok(frame)
    }

    /// Appends a frame and updates the index to match.
    fn write_frame(&mut self, recid: Recid, bytes: Option<&[u8]>) -> CoreResult<()> {
        let frame = Self::encode_frame(recid, bytes, false)?;
        let offset = self.backend.append(&frame)?;
        let slot = match bytes {
            None => AppendSlot::Null,
            Some(data) => AppendSlot::Present {
                offset: offset + FRAME_HEADER_SIZE,
                size: data.len() as u32,
            },
        };
        self.index.insert(recid.as_u64(), slot);
        Ok(())
    }

    fn write_tombstone(&mut self, recid: Recid) -> CoreResult<()> {
        let frame = Self::encode_frame(recid, None, true)?;
        self.backend.append(&frame)?;
        self.index.remove(&recid.as_u64());
        let id = recid.as_u64();
        if self.free_set.insert(id) {
            self.free_stack.push(id);
        }
        Ok(())
    }

    fn current_bytes(&self, recid: Recid) -> CoreResult<Option<Vec<u8>>> {
        match self.index.get(&recid.as_u64()) {
            None => Err(CoreError::recid_not_found(recid)),
            Some(AppendSlot::Null) => Ok(None),
            Some(AppendSlot::Present { offset, size }) => {
                Ok(Some(self.backend.read_at(*offset, *size as usize)?))
            }
        }
    }

    fn current<T, S: Serializer<T>>(&self, recid: Recid, ser: &S) -> CoreResult<Option<T>> {
        self.current_bytes(recid)?
            .map(|b| ser.deserialize(&b))
            .transpose()
    }
}

/// Append-only store.
///
/// Simple and fast to write, with the whole recid index held in memory.
/// There are no transactions: `commit` just forces the log to disk, and
/// recovery is the open-time scan (complete frames survive, a torn tail
/// does not).
pub struct StoreAppend {
    inner: RwLock<AppendInner>,
}

impl StoreAppend {
    /// Opens an append-only store, scanning any existing log to rebuild
    /// the recid index.
    ///
    /// An incomplete trailing frame is truncated away. A frame with a size
    /// field below `-2` fails the open with a corruption error.
    ///
    /// # Errors
    ///
    /// Fails on invalid configuration, a malformed log, or I/O errors.
    pub fn open(mut backend: Box<dyn StorageBackend>, config: &StoreConfig) -> CoreResult<Self> {
        config.validate()?;

        let total = backend.size()?;
        let mut index: HashMap<u64, AppendSlot> = HashMap::new();
        let mut max_recid = 0u64;
        let mut pos = 0u64;

        while pos + FRAME_HEADER_SIZE <= total {
            let header = backend.read_at(pos, FRAME_HEADER_SIZE as usize)?;
            let recid = u64::from_le_bytes(
                header[0..8]
                    .try_into()
                    .map_err(|_| CoreError::data_corruption("short frame header"))?,
            );
            let size = i32::from_le_bytes(
                header[8..12]
                    .try_into()
                    .map_err(|_| CoreError::data_corruption("short frame header"))?,
            );
            if recid == 0 {
                return Err(CoreError::data_corruption(format!(
                    "frame for reserved recid 0 at offset {pos}"
                )));
            }

            match size {
                SIZE_TOMBSTONE => {
                    index.remove(&recid);
                    max_recid = max_recid.max(recid);
                    pos += FRAME_HEADER_SIZE;
                }
                SIZE_NULL => {
                    index.insert(recid, AppendSlot::Null);
                    max_recid = max_recid.max(recid);
                    pos += FRAME_HEADER_SIZE;
                }
                len if len >= 0 => {
                    let end = pos + FRAME_HEADER_SIZE + len as u64;
                    if end > total {
                        // Torn payload: the frame never finished
                        break;
                    }
                    index.insert(
                        recid,
                        AppendSlot::Present {
                            offset: pos + FRAME_HEADER_SIZE,
                            size: len as u32,
                        },
                    );
                    max_recid = max_recid.max(recid);
                    pos = end;
                }
                other => {
                    return Err(CoreError::data_corruption(format!(
                        "invalid frame size {other} at offset {pos}"
                    )));
                }
            }
        }

        if pos < total {
            info!(discarded = total - pos, "truncating torn log tail");
            backend.truncate(pos)?;
        }

        let mut free_stack = Vec::new();
        let mut free_set = HashSet::new();
        for recid in 1..=max_recid {
            if !index.contains_key(&recid) {
                free_set.insert(recid);
                free_stack.push(recid);
            }
        }

        info!(
            max_recid,
            live = index.len(),
            free = free_stack.len(),
            "opened append store"
        );

        Ok(Self {
            inner: RwLock::new(AppendInner {
                backend,
                index,
                max_recid,
                free_stack,
                free_set,
                sync_on_commit: config.sync_on_commit,
                closed: false,
            }),
        })
    }

    /// Highest recid ever seen in the log.
    #[must_use]
    pub fn max_recid(&self) -> u64 {
        self.inner.read().max_recid
    }
}

impl Store for StoreAppend {
    fn get<T, S: Serializer<T>>(&self, recid: Recid, ser: &S) -> CoreResult<Option<T>> {
        let inner = self.inner.read();
        inner.check_open()?;
        inner.current(recid, ser)
    }

    fn put<T, S: Serializer<T>>(&self, value: Option<&T>, ser: &S) -> CoreResult<Recid> {
        let bytes = serialize_opt(ser, value)?;
        let mut inner = self.inner.write();
        inner.check_open()?;
        let recid = inner.allocate()?;
        inner.write_frame(recid, bytes.as_deref())?;
        Ok(recid)
    }

    fn update<T, S: Serializer<T>>(
        &self,
        recid: Recid,
        ser: &S,
        value: Option<&T>,
    ) -> CoreResult<()> {
        let bytes = serialize_opt(ser, value)?;
        let mut inner = self.inner.write();
        inner.check_open()?;
        if !inner.index.contains_key(&recid.as_u64()) {
            return Err(CoreError::recid_not_found(recid));
        }
        inner.write_frame(recid, bytes.as_deref())
    }

    fn delete(&self, recid: Recid) -> CoreResult<()> {
        let mut inner = self.inner.write();
        inner.check_open()?;
        if !inner.index.contains_key(&recid.as_u64()) {
            return Err(CoreError::recid_not_found(recid));
        }
        inner.write_tombstone(recid)
    }

    fn preallocate(&self) -> CoreResult<Recid> {
        let mut inner = self.inner.write();
        inner.check_open()?;
        let recid = inner.allocate()?;
        inner.write_frame(recid, None)?;
        Ok(recid)
    }

    fn compare_and_update<T, S: Serializer<T>>(
        &self,
        recid: Recid,
        ser: &S,
        expected: Option<&T>,
        new: Option<&T>,
    ) -> CoreResult<bool> {
        let bytes = serialize_opt(ser, new)?;
        let mut inner = self.inner.write();
        inner.check_open()?;
        let current = inner.current(recid, ser)?;
        if !opt_equals(ser, current.as_ref(), expected) {
            return Ok(false);
        }
        inner.write_frame(recid, bytes.as_deref())?;
        Ok(true)
    }

    fn compare_and_delete<T, S: Serializer<T>>(
        &self,
        recid: Recid,
        ser: &S,
        expected: Option<&T>,
    ) -> CoreResult<bool> {
        let mut inner = self.inner.write();
        inner.check_open()?;
        let current = inner.current(recid, ser)?;
        if !opt_equals(ser, current.as_ref(), expected) {
            return Ok(false);
        }
        inner.write_tombstone(recid)?;
        Ok(true)
    }

    fn commit(&self) -> CoreResult<()> {
        let mut inner = self.inner.write();
        inner.check_open()?;
        inner.backend.flush()?;
        if inner.sync_on_commit {
            inner.backend.sync()?;
        }
        Ok(())
    }

    fn compact(&self) -> CoreResult<()> {
        let mut inner = self.inner.write();
        inner.check_open()?;

        // Latest state of each live recid, gathered before the log is
        // rewritten
        let mut live: Vec<(u64, Option<Vec<u8>>)> = Vec::new();
        let mut recids: Vec<u64> = inner.index.keys().copied().collect();
        recids.sort_unstable();
        for recid in &recids {
            live.push((*recid, inner.current_bytes(Recid::new(*recid))?));
        }

        let mut log = Vec::new();
        let mut offsets: Vec<(u64, AppendSlot)> = Vec::new();
        for (recid, bytes) in &live {
            let frame = AppendInner::encode_frame(Recid::new(*recid), bytes.as_deref(), false)?;
            let slot = match bytes {
                None => AppendSlot::Null,
                Some(data) => AppendSlot::Present {
                    offset: log.len() as u64 + FRAME_HEADER_SIZE,
                    size: data.len() as u32,
                },
            };
            log.extend_from_slice(&frame);
            offsets.push((*recid, slot));
        }

        let old_size = inner.backend.size()?;
        inner.backend.truncate(0)?;
        if !log.is_empty() {
            inner.backend.append(&log)?;
        }
        inner.index = offsets.into_iter().collect();

        let new_max = recids.last().copied().unwrap_or(0);
        inner.free_set.retain(|&r| r <= new_max);
        let free_set = inner.free_set.clone();
        inner.free_stack.retain(|r| free_set.contains(r));
        inner.max_recid = new_max;

        debug!(
            reclaimed = old_size.saturating_sub(log.len() as u64),
            new_max,
            "compacted append store"
        );
        Ok(())
    }

    fn close(&self) -> CoreResult<()> {
        let mut inner = self.inner.write();
        if inner.closed {
            return Ok(());
        }
        inner.backend.flush()?;
        inner.backend.sync()?;
        inner.closed = true;
        Ok(())
    }

    fn verify(&self) -> CoreResult<()> {
        let inner = self.inner.read();
        let total = inner.backend.size()?;

        for (&recid, slot) in &inner.index {
            if recid == 0 || recid > inner.max_recid {
                return Err(CoreError::data_corruption(format!(
                    "indexed recid {recid} outside [1, {}]",
                    inner.max_recid
                )));
            }
            if let AppendSlot::Present { offset, size } = slot {
                if *offset < FRAME_HEADER_SIZE || offset + u64::from(*size) > total {
                    return Err(CoreError::data_corruption(format!(
                        "recid {recid} payload span outside the log"
                    )));
                }
            }
        }

        for recid in 1..=inner.max_recid {
            let indexed = inner.index.contains_key(&recid);
            let free = inner.free_set.contains(&recid);
            if indexed == free {
                return Err(CoreError::data_corruption(format!(
                    "recid {recid} must be exactly one of indexed or free"
                )));
            }
        }

        Ok(())
    }

    fn is_empty(&self) -> CoreResult<bool> {
        let inner = self.inner.read();
        inner.check_open()?;
        Ok(inner.index.is_empty())
    }
}

impl std::fmt::Debug for StoreAppend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.read();
        f.debug_struct("StoreAppend")
            .field("live", &inner.index.len())
            .field("max_recid", &inner.max_recid)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::serializer::{BytesSerializer, StringSerializer, U64Serializer};
    use recdb_storage::{InMemoryBackend, SharedMemoryBackend};

    fn create_store() -> StoreAppend {
        StoreAppend::open(Box::new(InMemoryBackend::new()), &StoreConfig::default()).unwrap()
    }

    #[test]
    fn put_get_roundtrip() {
        let store = create_store();
        let ser = StringSerializer;

        let recid = store.put(Some(&"hello".to_string()), &ser).unwrap();
        assert_eq!(store.get(recid, &ser).unwrap(), Some("hello".to_string()));
        store.verify().unwrap();
    }

    #[test]
    fn update_appends_new_frame() {
        let store = create_store();
        let ser = U64Serializer;

        let recid = store.put(Some(&1), &ser).unwrap();
        store.update(recid, &ser, Some(&2)).unwrap();
        store.update(recid, &ser, None).unwrap();
        assert_eq!(store.get(recid, &ser).unwrap(), None);
        store.verify().unwrap();
    }

    #[test]
    fn delete_writes_tombstone() {
        let store = create_store();
        let ser = U64Serializer;

        let recid = store.put(Some(&1), &ser).unwrap();
        store.delete(recid).unwrap();
        assert!(matches!(
            store.get(recid, &ser),
            Err(CoreError::RecidNotFound { .. })
        ));

        // The freed recid comes back before a new one is minted
        let next = store.put(Some(&2), &ser).unwrap();
        assert_eq!(next, recid);
    }

    #[test]
    fn reopen_replays_last_wins() {
        let backend = SharedMemoryBackend::new();
        let ser = U64Serializer;
        let (updated, deleted, nulled);

        {
            let store =
                StoreAppend::open(Box::new(backend.clone()), &StoreConfig::default()).unwrap();
            updated = store.put(Some(&1), &ser).unwrap();
            deleted = store.put(Some(&2), &ser).unwrap();
            nulled = store.preallocate().unwrap();
            store.update(updated, &ser, Some(&10)).unwrap();
            store.delete(deleted).unwrap();
            store.commit().unwrap();
        }

        let store = StoreAppend::open(Box::new(backend), &StoreConfig::default()).unwrap();
        assert_eq!(store.get(updated, &ser).unwrap(), Some(10));
        assert_eq!(store.get(nulled, &ser).unwrap(), None);
        assert!(matches!(
            store.get(deleted, &ser),
            Err(CoreError::RecidNotFound { .. })
        ));
        store.verify().unwrap();
    }

    #[test]
    fn torn_tail_truncated_on_open() {
        let backend = SharedMemoryBackend::new();
        let ser = BytesSerializer;
        let survivor;

        {
            let store =
                StoreAppend::open(Box::new(backend.clone()), &StoreConfig::default()).unwrap();
            survivor = store.put(Some(&vec![7u8; 16]), &ser).unwrap();
            store.put(Some(&vec![8u8; 16]), &ser).unwrap();
        }

        // Chop the second frame mid-payload
        let mut bytes = backend.data();
        bytes.truncate(bytes.len() - 10);
        backend.set_data(bytes);

        let store = StoreAppend::open(Box::new(backend), &StoreConfig::default()).unwrap();
        assert_eq!(store.get(survivor, &ser).unwrap(), Some(vec![7u8; 16]));
        // The torn frame is as if it never happened
        assert_eq!(store.max_recid(), 1);
        assert!(matches!(
            store.get(Recid::new(2), &ser),
            Err(CoreError::RecidNotFound { .. })
        ));
        store.verify().unwrap();
    }

    #[test]
    fn invalid_frame_size_is_corruption() {
        // One valid null frame, then a frame with size -3
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&1u64.to_le_bytes());
        bytes.extend_from_slice(&SIZE_NULL.to_le_bytes());
        bytes.extend_from_slice(&2u64.to_le_bytes());
        bytes.extend_from_slice(&(-3i32).to_le_bytes());

        let result = StoreAppend::open(
            Box::new(InMemoryBackend::with_data(bytes)),
            &StoreConfig::default(),
        );
        assert!(matches!(result, Err(CoreError::DataCorruption { .. })));
    }

    #[test]
    fn compact_drops_superseded_frames() {
        let backend = SharedMemoryBackend::new();
        let ser = BytesSerializer;

        let store =
            StoreAppend::open(Box::new(backend.clone()), &StoreConfig::default()).unwrap();
        let keep = store.put(Some(&vec![1u8; 64]), &ser).unwrap();
        let gone = store.put(Some(&vec![2u8; 64]), &ser).unwrap();
        store.update(keep, &ser, Some(&vec![3u8; 8])).unwrap();
        store.delete(gone).unwrap();

        let before = backend.data().len();
        store.compact().unwrap();
        let after = backend.data().len();
        assert!(after < before);

        assert_eq!(store.get(keep, &ser).unwrap(), Some(vec![3u8; 8]));
        assert!(matches!(
            store.get(gone, &ser),
            Err(CoreError::RecidNotFound { .. })
        ));
        store.verify().unwrap();
    }

    #[test]
    fn compact_preserves_recids_across_reopen() {
        let backend = SharedMemoryBackend::new();
        let ser = U64Serializer;
        let keep;

        {
            let store =
                StoreAppend::open(Box::new(backend.clone()), &StoreConfig::default()).unwrap();
            let gone = store.put(Some(&1), &ser).unwrap();
            store.delete(gone).unwrap();
            keep = store.put(Some(&2), &ser).unwrap();
            store.compact().unwrap();
            store.commit().unwrap();
        }

        let store = StoreAppend::open(Box::new(backend), &StoreConfig::default()).unwrap();
        assert_eq!(store.get(keep, &ser).unwrap(), Some(2));
        store.verify().unwrap();
    }

    #[test]
    fn cas_semantics() {
        let store = create_store();
        let ser = U64Serializer;

        let recid = store.preallocate().unwrap();
        assert!(store.compare_and_update(recid, &ser, None, Some(&1)).unwrap());
        assert!(!store.compare_and_delete(recid, &ser, Some(&9)).unwrap());
        assert!(store.compare_and_delete(recid, &ser, Some(&1)).unwrap());
        assert!(matches!(
            store.get(recid, &ser),
            Err(CoreError::RecidNotFound { .. })
        ));
    }

    #[test]
    fn oversized_record_rejected() {
        let store = create_store();
        let ser = BytesSerializer;

        let result = store.put(Some(&vec![0u8; MAX_RECORD_SIZE + 1]), &ser);
        assert!(matches!(result, Err(CoreError::RecordTooLarge { .. })));
    }

    #[test]
    fn closed_store_rejects_operations() {
        let store = create_store();
        store.close().unwrap();
        assert!(matches!(store.preallocate(), Err(CoreError::StoreClosed)));
    }
}
