//! Single-file random-access store.
//!
//! File layout:
//!
//! ```text
//! header      magic "RDIR" (4) | version u16 (2) | reserved (2) | index capacity u64 (8)
//! index       one packed word per recid, slot r at 16 + r*8 (slot 0 unused)
//! data        payloads, bump-allocated from the end of the index region
//! ```
//!
//! Updates are never in place: new payloads always go to fresh space at the
//! data tail and the index word is rewritten. Released spans are only
//! accounted (see [`StoreDirect::released_bytes`]); space comes back through
//! [`Store::compact`], which rewrites live payloads densely. Recid slots are
//! reused LIFO via the free stack.
//!
//! There is no journal here. Durability is best effort (`commit` flushes and
//! optionally syncs); [`crate::StoreWal`] layers a write-ahead log on top of
//! this store when crash consistency is required.

use crate::config::StoreConfig;
use crate::error::{CoreError, CoreResult};
use crate::serializer::Serializer;
use crate::store::index::{self, IndexEntry, WORD_ABSENT, WORD_NULL};
use crate::store::{opt_equals, serialize_opt, Store};
use crate::types::Recid;
use parking_lot::RwLock;
use recdb_storage::StorageBackend;
use std::collections::HashSet;
use tracing::{debug, info};

/// Magic bytes identifying a store file.
pub const DIRECT_MAGIC: [u8; 4] = *b"RDIR";

/// Current file format version.
pub const DIRECT_VERSION: u16 = 1;

/// File header size in bytes.
pub const HEADER_SIZE: u64 = 16;

struct DirectInner {
    backend: Box<dyn StorageBackend>,
    /// Number of recid slots; immutable once the file is created.
    capacity: u64,
    /// First byte of the data region.
    data_start: u64,
    /// Bump pointer: next payload goes here.
    data_tail: u64,
    /// Highest recid ever allocated (and not compacted away).
    max_recid: u64,
    /// Freed recids, popped LIFO. Stale entries (reclaimed by WAL replay)
    /// are skipped via `free_set`.
    free_stack: Vec<u64>,
    free_set: HashSet<u64>,
    /// Bytes released by updates and deletes, reclaimed only by compaction.
    released_bytes: u64,
    sync_on_commit: bool,
    closed: bool,
}

impl DirectInner {
    fn check_open(&self) -> CoreResult<()> {
        if self.closed {
            return Err(CoreError::StoreClosed);
        }
        Ok(())
    }

    fn slot_offset(&self, recid: u64) -> u64 {
        HEADER_SIZE + recid * 8
    }

    /// Reads a slot word; slots the file has never reached read as absent.
    fn read_slot(&self, recid: u64) -> CoreResult<u64> {
        let offset = self.slot_offset(recid);
        if offset + 8 > self.backend.size()? {
            return Ok(WORD_ABSENT);
        }
        let bytes = self.backend.read_at(offset, 8)?;
        Ok(u64::from_le_bytes(bytes.try_into().map_err(|_| {
            CoreError::data_corruption("short index slot read")
        })?))
    }

    fn write_slot(&mut self, recid: u64, word: u64) -> CoreResult<()> {
        let offset = self.slot_offset(recid);
        self.backend.write_at(offset, &word.to_le_bytes())?;
        Ok(())
    }

    fn entry(&self, recid: Recid) -> CoreResult<IndexEntry> {
        let id = recid.as_u64();
        if id == 0 || id > self.capacity {
            return Ok(IndexEntry::Absent);
        }
        Ok(index::unpack(self.read_slot(id)?))
    }

    /// Pops a reusable recid or advances the max-recid counter.
    fn allocate(&mut self) -> CoreResult<Recid> {
        while let Some(recid) = self.free_stack.pop() {
            if !self.free_set.remove(&recid) {
                // Stale stack entry, already reclaimed elsewhere
                continue;
            }
            // A freed slot must read absent before it is claimed
            if self.read_slot(recid)? != WORD_ABSENT {
                return Err(CoreError::data_corruption(format!(
                    "free recid {recid} has a non-empty index slot"
                )));
            }
            return Ok(Recid::new(recid));
        }

        if self.max_recid >= self.capacity {
            return Err(CoreError::invalid_operation(format!(
                "recid index table full ({} slots)",
                self.capacity
            )));
        }
        self.max_recid += 1;
        Ok(Recid::new(self.max_recid))
    }

    /// Bump-allocates data-region space.
    fn space_allocate(&mut self, size: usize) -> u64 {
        let offset = self.data_tail;
        self.data_tail += size as u64;
        offset
    }

    /// Bookkeeping for a span that is no longer referenced. The span itself
    /// is not reused until compaction.
    fn space_release(&mut self, size: u16) {
        self.released_bytes += u64::from(size);
    }

    /// Writes a payload (or the null state) and rewrites the index word.
    fn store_payload(&mut self, recid: Recid, bytes: Option<&[u8]>) -> CoreResult<()> {
        match bytes {
            None => self.write_slot(recid.as_u64(), WORD_NULL),
            Some(data) => {
                // Size check up front so an oversized payload never touches disk
                index::pack(data.len(), 0)?;
                let offset = self.space_allocate(data.len());
                self.backend.write_at(offset, data)?;
                self.write_slot(recid.as_u64(), index::pack(data.len(), offset)?)
            }
        }
    }

    fn read_payload(&self, size: u16, offset: u64) -> CoreResult<Vec<u8>> {
        Ok(self.backend.read_at(offset, usize::from(size))?)
    }

    fn current_bytes(&self, recid: Recid) -> CoreResult<Option<Vec<u8>>> {
        match self.entry(recid)? {
            IndexEntry::Absent => Err(CoreError::recid_not_found(recid)),
            IndexEntry::Null => Ok(None),
            IndexEntry::Present { size, offset } => Ok(Some(self.read_payload(size, offset)?)),
        }
    }

    fn current<T, S: Serializer<T>>(&self, recid: Recid, ser: &S) -> CoreResult<Option<T>> {
        self.current_bytes(recid)?
            .map(|b| ser.deserialize(&b))
            .transpose()
    }

    fn free_recid(&mut self, recid: u64) -> CoreResult<()> {
        self.write_slot(recid, WORD_ABSENT)?;
        if self.free_set.insert(recid) {
            self.free_stack.push(recid);
        }
        Ok(())
    }

    fn delete_entry(&mut self, recid: Recid) -> CoreResult<()> {
        match self.entry(recid)? {
            IndexEntry::Absent => Err(CoreError::recid_not_found(recid)),
            IndexEntry::Null => self.free_recid(recid.as_u64()),
            IndexEntry::Present { size, .. } => {
                self.space_release(size);
                self.free_recid(recid.as_u64())
            }
        }
    }

    fn update_entry(&mut self, recid: Recid, bytes: Option<&[u8]>) -> CoreResult<()> {
        match self.entry(recid)? {
            IndexEntry::Absent => Err(CoreError::recid_not_found(recid)),
            IndexEntry::Null => self.store_payload(recid, bytes),
            IndexEntry::Present { size, .. } => {
                self.space_release(size);
                self.store_payload(recid, bytes)
            }
        }
    }
}

/// Single-buffer/file store with a packed recid index and bump-pointer
/// data region.
///
/// # Example
///
/// ```rust
/// use recdb_core::{Store, StoreConfig, StoreDirect, U64Serializer};
/// use recdb_storage::InMemoryBackend;
///
/// let store = StoreDirect::open(
///     Box::new(InMemoryBackend::new()),
///     &StoreConfig::default().index_capacity(1024),
/// ).unwrap();
/// let ser = U64Serializer;
/// let recid = store.put(Some(&7u64), &ser).unwrap();
/// assert_eq!(store.get(recid, &ser).unwrap(), Some(7));
/// ```
pub struct StoreDirect {
    inner: RwLock<DirectInner>,
}

impl StoreDirect {
    /// Opens a store over a backend, creating the file header if the
    /// backend is empty.
    ///
    /// For an existing file the index region is scanned once to recover the
    /// max-recid counter and the free-recid set.
    ///
    /// # Errors
    ///
    /// Fails on invalid configuration, an unrecognized header, or I/O
    /// errors.
    pub fn open(mut backend: Box<dyn StorageBackend>, config: &StoreConfig) -> CoreResult<Self> {
        config.validate()?;

        let size = backend.size()?;
        let capacity;

        if size == 0 {
            capacity = config.index_capacity;
            let mut header = Vec::with_capacity(HEADER_SIZE as usize);
            header.extend_from_slice(&DIRECT_MAGIC);
            header.extend_from_slice(&DIRECT_VERSION.to_le_bytes());
            header.extend_from_slice(&0u16.to_le_bytes());
            header.extend_from_slice(&capacity.to_le_bytes());
            backend.append(&header)?;
        } else {
            if size < HEADER_SIZE {
                return Err(CoreError::data_corruption("store file shorter than header"));
            }
            let header = backend.read_at(0, HEADER_SIZE as usize)?;
            if header[0..4] != DIRECT_MAGIC {
                return Err(CoreError::data_corruption("bad store file magic"));
            }
            let version = u16::from_le_bytes([header[4], header[5]]);
            if version > DIRECT_VERSION {
                return Err(CoreError::data_corruption(format!(
                    "unsupported store file version {version}"
                )));
            }
            capacity = u64::from_le_bytes(
                header[8..16]
                    .try_into()
                    .map_err(|_| CoreError::data_corruption("short header"))?,
            );
            if capacity == 0 {
                return Err(CoreError::data_corruption("zero index capacity in header"));
            }
        }

        let data_start = HEADER_SIZE + (capacity + 1) * 8;

        let mut inner = DirectInner {
            backend,
            capacity,
            data_start,
            data_tail: data_start.max(size),
            max_recid: 0,
            free_stack: Vec::new(),
            free_set: HashSet::new(),
            released_bytes: 0,
            sync_on_commit: config.sync_on_commit,
            closed: false,
        };

        // One pass over the index region: the highest non-empty slot is
        // max_recid, empty slots below it are free.
        let mut max_recid = 0u64;
        for recid in 1..=capacity {
            if inner.slot_offset(recid) + 8 > size {
                break;
            }
            if inner.read_slot(recid)? != WORD_ABSENT {
                max_recid = recid;
            }
        }
        for recid in 1..=max_recid {
            if inner.read_slot(recid)? == WORD_ABSENT {
                inner.free_set.insert(recid);
                inner.free_stack.push(recid);
            }
        }
        inner.max_recid = max_recid;

        info!(
            max_recid,
            free = inner.free_stack.len(),
            capacity,
            "opened direct store"
        );

        Ok(Self {
            inner: RwLock::new(inner),
        })
    }

    /// Bytes released by updates and deletes since the last compaction.
    #[must_use]
    pub fn released_bytes(&self) -> u64 {
        self.inner.read().released_bytes
    }

    /// Highest recid currently allocated or free-listed.
    #[must_use]
    pub fn max_recid(&self) -> u64 {
        self.inner.read().max_recid
    }

    /// Applies a put by explicit recid. Idempotent; used by WAL replay.
    pub(crate) fn apply_put(&self, recid: Recid, bytes: Option<&[u8]>) -> CoreResult<()> {
        let mut inner = self.inner.write();
        inner.check_open()?;

        let id = recid.as_u64();
        if id == 0 || id > inner.capacity {
            return Err(CoreError::invalid_operation(format!(
                "recid {id} outside index capacity {}",
                inner.capacity
            )));
        }

        if id > inner.max_recid {
            // Replay allocates in log order; any gap below the new max is free
            for skipped in inner.max_recid + 1..id {
                if inner.free_set.insert(skipped) {
                    inner.free_stack.push(skipped);
                }
            }
            inner.max_recid = id;
        }
        inner.free_set.remove(&id);

        if let IndexEntry::Present { size, .. } = inner.entry(recid)? {
            inner.space_release(size);
        }
        inner.store_payload(recid, bytes)
    }

    /// Applies a delete by explicit recid. Deleting an absent recid is a
    /// no-op so replaying a log twice converges.
    pub(crate) fn apply_delete(&self, recid: Recid) -> CoreResult<()> {
        let mut inner = self.inner.write();
        inner.check_open()?;

        match inner.entry(recid)? {
            IndexEntry::Absent => Ok(()),
            IndexEntry::Null => inner.free_recid(recid.as_u64()),
            IndexEntry::Present { size, .. } => {
                inner.space_release(size);
                inner.free_recid(recid.as_u64())
            }
        }
    }

    /// Snapshot of the recid allocator: (max recid, free stack in pop
    /// order). Used by the WAL store to allocate without touching the data
    /// file before commit.
    pub(crate) fn alloc_snapshot(&self) -> (u64, Vec<u64>) {
        let inner = self.inner.read();
        let free: Vec<u64> = inner
            .free_stack
            .iter()
            .copied()
            .filter(|r| inner.free_set.contains(r))
            .collect();
        (inner.max_recid, free)
    }

    /// Number of recid slots in the index table.
    pub(crate) fn capacity(&self) -> u64 {
        self.inner.read().capacity
    }

    /// Whether a recid is currently allocated (null or present).
    pub(crate) fn allocated(&self, recid: Recid) -> CoreResult<bool> {
        let inner = self.inner.read();
        Ok(!matches!(inner.entry(recid)?, IndexEntry::Absent))
    }

    /// Forces file contents to durable storage regardless of
    /// `sync_on_commit`. Used by WAL recovery.
    pub(crate) fn force_sync(&self) -> CoreResult<()> {
        let mut inner = self.inner.write();
        inner.backend.flush()?;
        inner.backend.sync()?;
        Ok(())
    }
}

impl Store for StoreDirect {
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
        inner.store_payload(recid, bytes.as_deref())?;
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
        inner.update_entry(recid, bytes.as_deref())
    }

    fn delete(&self, recid: Recid) -> CoreResult<()> {
        let mut inner = self.inner.write();
        inner.check_open()?;
        inner.delete_entry(recid)
    }

    fn preallocate(&self) -> CoreResult<Recid> {
        let mut inner = self.inner.write();
        inner.check_open()?;
        let recid = inner.allocate()?;
        inner.write_slot(recid.as_u64(), WORD_NULL)?;
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
        inner.update_entry(recid, bytes.as_deref())?;
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
        inner.delete_entry(recid)?;
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

        // Collect live payloads, then rewrite them densely from the start
        // of the data region.
        let mut live: Vec<(u64, Vec<u8>)> = Vec::new();
        let mut new_max = 0u64;
        for recid in 1..=inner.max_recid {
            match index::unpack(inner.read_slot(recid)?) {
                IndexEntry::Absent => {}
                IndexEntry::Null => new_max = recid,
                IndexEntry::Present { size, offset } => {
                    live.push((recid, inner.read_payload(size, offset)?));
                    new_max = recid;
                }
            }
        }

        let mut tail = inner.data_start;
        for (recid, bytes) in &live {
            inner.backend.write_at(tail, bytes)?;
            let word = index::pack(bytes.len(), tail)?;
            inner.write_slot(*recid, word)?;
            tail += bytes.len() as u64;
        }
        if tail < inner.backend.size()? {
            inner.backend.truncate(tail)?;
        }

        let reclaimed = inner.data_tail - tail;
        inner.data_tail = tail;
        inner.released_bytes = 0;
        inner.free_set.retain(|&r| r <= new_max);
        let free_set = inner.free_set.clone();
        inner.free_stack.retain(|r| free_set.contains(r));
        inner.max_recid = new_max;

        debug!(reclaimed, new_max, "compacted direct store");
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

        let mut spans: Vec<(u64, u64)> = Vec::new();
        for recid in 1..=inner.max_recid {
            let word = inner.read_slot(recid)?;
            match index::unpack(word) {
                IndexEntry::Absent => {
                    if !inner.free_set.contains(&recid) {
                        return Err(CoreError::data_corruption(format!(
                            "recid {recid} absent but not free-listed"
                        )));
                    }
                }
                IndexEntry::Null => {}
                IndexEntry::Present { size, offset } => {
                    if offset < inner.data_start {
                        return Err(CoreError::data_corruption(format!(
                            "recid {recid} offset {offset} inside index region"
                        )));
                    }
                    if offset + u64::from(size) > inner.data_tail {
                        return Err(CoreError::data_corruption(format!(
                            "recid {recid} span ends past data tail"
                        )));
                    }
                    if size > 0 {
                        spans.push((offset, u64::from(size)));
                    }
                }
            }
        }

        spans.sort_unstable();
        for pair in spans.windows(2) {
            let (a_off, a_len) = pair[0];
            let (b_off, _) = pair[1];
            if a_off + a_len > b_off {
                return Err(CoreError::data_corruption(format!(
                    "live records overlap at offset {b_off}"
                )));
            }
        }

        for &recid in &inner.free_set {
            if recid == 0 || recid > inner.max_recid {
                return Err(CoreError::data_corruption(format!(
                    "free recid {recid} outside [1, {}]",
                    inner.max_recid
                )));
            }
            if inner.read_slot(recid)? != WORD_ABSENT {
                return Err(CoreError::data_corruption(format!(
                    "free recid {recid} has a non-empty index slot"
                )));
            }
        }

        Ok(())
    }

    fn is_empty(&self) -> CoreResult<bool> {
        let inner = self.inner.read();
        inner.check_open()?;
        for recid in 1..=inner.max_recid {
            if inner.read_slot(recid)? != WORD_ABSENT {
                return Ok(false);
            }
        }
        Ok(true)
    }
}

impl std::fmt::Debug for StoreDirect {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.read();
        f.debug_struct("StoreDirect")
            .field("capacity", &inner.capacity)
            .field("max_recid", &inner.max_recid)
            .field("data_tail", &inner.data_tail)
            .finish_non_exhaustive()
    }
}
