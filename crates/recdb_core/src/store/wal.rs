//! Write-ahead-logged store.
//!
//! Wraps a [`StoreDirect`] data file with a [`WalManager`]. Mutations never
//! touch the data file directly: they are appended to the log and buffered
//! in an in-memory overlay, so reads see their own uncommitted writes.
//! `commit` appends a commit marker, syncs the log, applies the buffered
//! operations to the data file, syncs it, and clears the log. A crash at
//! any point loses at most the transaction in flight: on reopen, entries up
//! to the last complete commit marker are replayed onto the data file and
//! everything after it is discarded.

use crate::config::StoreConfig;
use crate::error::{CoreError, CoreResult};
use crate::serializer::{BytesSerializer, Serializer};
use crate::store::direct::StoreDirect;
use crate::store::index;
use crate::store::{opt_equals, serialize_opt, Store};
use crate::types::{CommitId, Recid};
use crate::wal::{WalManager, WalRecord};
use parking_lot::RwLock;
use recdb_storage::StorageBackend;
use std::collections::HashMap;
use tracing::{info, warn};

/// Pending state of a recid touched since the last commit.
#[derive(Debug, Clone)]
enum PendingEntry {
    /// Recid written or preallocated; `None` is the null state.
    Put(Option<Vec<u8>>),
    /// Recid deleted.
    Deleted,
}

struct WalStoreInner {
    direct: StoreDirect,
    wal: WalManager,
    /// Uncommitted recid states, shadowing the data file.
    pending: HashMap<u64, PendingEntry>,
    /// Uncommitted operations in log order, replayed into the data file at
    /// commit.
    ops: Vec<WalRecord>,
    /// Allocator overlay: the data file's allocator state plus the effect
    /// of uncommitted operations.
    max_recid: u64,
    free_stack: Vec<u64>,
    commit_id: u64,
    closed: bool,
}

impl WalStoreInner {
    fn check_open(&self) -> CoreResult<()> {
        if self.closed {
            return Err(CoreError::StoreClosed);
        }
        Ok(())
    }

    fn allocate(&mut self) -> CoreResult<Recid> {
        if let Some(recid) = self.free_stack.pop() {
            return Ok(Recid::new(recid));
        }
        if self.max_recid >= self.direct.capacity() {
            return Err(CoreError::invalid_operation(format!(
                "recid index table full ({} slots)",
                self.direct.capacity()
            )));
        }
        self.max_recid += 1;
        Ok(Recid::new(self.max_recid))
    }

    /// Current record state: outer `None` means absent.
    fn state_bytes(&self, recid: Recid) -> CoreResult<Option<Option<Vec<u8>>>> {
        if let Some(entry) = self.pending.get(&recid.as_u64()) {
            return Ok(match entry {
                PendingEntry::Deleted => None,
                PendingEntry::Put(bytes) => Some(bytes.clone()),
            });
        }
        if !self.direct.allocated(recid)? {
            return Ok(None);
        }
        Ok(Some(self.direct.get(recid, &BytesSerializer)?))
    }

    fn current<T, S: Serializer<T>>(&self, recid: Recid, ser: &S) -> CoreResult<Option<T>> {
        match self.state_bytes(recid)? {
            None => Err(CoreError::recid_not_found(recid)),
            Some(None) => Ok(None),
            Some(Some(bytes)) => Ok(Some(ser.deserialize(&bytes)?)),
        }
    }

    fn require_allocated(&self, recid: Recid) -> CoreResult<()> {
        if self.state_bytes(recid)?.is_none() {
            return Err(CoreError::recid_not_found(recid));
        }
        Ok(())
    }

    /// Logs and buffers a put under an already-validated recid.
    fn log_put(&mut self, recid: Recid, bytes: Option<Vec<u8>>) -> CoreResult<()> {
        if let Some(data) = &bytes {
            if data.len() > index::MAX_RECORD_SIZE {
                return Err(CoreError::RecordTooLarge {
                    size: data.len(),
                    max: index::MAX_RECORD_SIZE,
                });
            }
        }
        let record = WalRecord::Put {
            recid,
            payload: bytes.clone(),
        };
        self.wal.append(&record)?;
        self.ops.push(record);
        self.pending.insert(recid.as_u64(), PendingEntry::Put(bytes));
        Ok(())
    }

    fn log_delete(&mut self, recid: Recid) -> CoreResult<()> {
        let record = WalRecord::Delete { recid };
        self.wal.append(&record)?;
        self.ops.push(record);
        self.pending.insert(recid.as_u64(), PendingEntry::Deleted);
        self.free_stack.push(recid.as_u64());
        Ok(())
    }

    /// Replays one logged operation onto the data file. Idempotent, so a
    /// crash between applying and clearing the log converges on replay.
    fn apply(&self, record: &WalRecord) -> CoreResult<()> {
        match record {
            WalRecord::Put { recid, payload } => {
                self.direct.apply_put(*recid, payload.as_deref())
            }
            WalRecord::Preallocate { recid } => self.direct.apply_put(*recid, None),
            WalRecord::Delete { recid } => self.direct.apply_delete(*recid),
            WalRecord::Commit { .. } => Ok(()),
        }
    }

    fn reset_alloc_overlay(&mut self) {
        let (max_recid, free_stack) = self.direct.alloc_snapshot();
        self.max_recid = max_recid;
        self.free_stack = free_stack;
    }

    /// Commit: marker to the log, log to disk, operations to the data
    /// file, data file to disk, then the log is discarded.
    fn commit_pending(&mut self) -> CoreResult<()> {
        self.commit_id += 1;
        self.wal.append(&WalRecord::Commit {
            commit_id: CommitId::new(self.commit_id),
        })?;
        self.wal.sync()?;

        for record in &self.ops {
            self.apply(record)?;
        }
        self.direct.commit()?;

        self.wal.clear()?;
        self.ops.clear();
        self.pending.clear();
        self.reset_alloc_overlay();
        Ok(())
    }
}

/// Durable store: a [`StoreDirect`] data file guarded by a write-ahead
/// log.
///
/// Mutations become durable at [`Store::commit`] (all of them) or not at
/// all; [`StoreWal::rollback`] discards everything since the last commit.
pub struct StoreWal {
    inner: RwLock<WalStoreInner>,
}

impl StoreWal {
    /// Opens a WAL store over a data backend and a log backend.
    ///
    /// If the log is non-empty this replays every entry up to its last
    /// complete commit marker onto the data file, discards the rest, and
    /// clears the log.
    ///
    /// # Errors
    ///
    /// Fails on invalid configuration, an unrecognized data file, or I/O
    /// errors during recovery.
    pub fn open(
        data: Box<dyn StorageBackend>,
        log: Box<dyn StorageBackend>,
        config: &StoreConfig,
    ) -> CoreResult<Self> {
        let direct = StoreDirect::open(data, config)?;
        let wal = WalManager::new(log, config);

        let mut last_commit_id = 0u64;
        if wal.size()? > 0 {
            let mut committed: Vec<WalRecord> = Vec::new();
            let mut uncommitted: Vec<WalRecord> = Vec::new();
            {
                let iter = wal.iter()?;
                for item in iter {
                    match item {
                        Ok((_, WalRecord::Commit { commit_id })) => {
                            committed.append(&mut uncommitted);
                            last_commit_id = last_commit_id.max(commit_id.as_u64());
                        }
                        Ok((_, record)) => uncommitted.push(record),
                        Err(err) => {
                            // Everything past the last commit marker is an
                            // interrupted transaction; a torn or corrupt
                            // entry ends the scan the same way
                            warn!(%err, "stopping log replay at damaged entry");
                            break;
                        }
                    }
                }
            }

            info!(
                replayed = committed.len(),
                discarded = uncommitted.len(),
                last_commit_id,
                "recovering from write-ahead log"
            );
            for record in &committed {
                match record {
                    WalRecord::Put { recid, payload } => {
                        direct.apply_put(*recid, payload.as_deref())?;
                    }
                    WalRecord::Preallocate { recid } => direct.apply_put(*recid, None)?,
                    WalRecord::Delete { recid } => direct.apply_delete(*recid)?,
                    WalRecord::Commit { .. } => {}
                }
            }
            direct.force_sync()?;
            wal.clear()?;
        }

        let (max_recid, free_stack) = direct.alloc_snapshot();
        Ok(Self {
            inner: RwLock::new(WalStoreInner {
                direct,
                wal,
                pending: HashMap::new(),
                ops: Vec::new(),
                max_recid,
                free_stack,
                commit_id: last_commit_id,
                closed: false,
            }),
        })
    }

    /// Discards all uncommitted mutations and truncates the log.
    ///
    /// # Errors
    ///
    /// Fails on I/O errors while truncating.
    pub fn rollback(&self) -> CoreResult<()> {
        let mut inner = self.inner.write();
        inner.check_open()?;
        inner.wal.clear()?;
        inner.ops.clear();
        inner.pending.clear();
        inner.reset_alloc_overlay();
        Ok(())
    }

    /// Id of the most recent commit (zero before the first).
    #[must_use]
    pub fn commit_id(&self) -> CommitId {
        CommitId::new(self.inner.read().commit_id)
    }

    /// Number of uncommitted operations.
    #[must_use]
    pub fn pending_ops(&self) -> usize {
        self.inner.read().ops.len()
    }
}

impl Store for StoreWal {
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
        inner.log_put(recid, bytes)?;
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
        inner.require_allocated(recid)?;
        inner.log_put(recid, bytes)
    }

    fn delete(&self, recid: Recid) -> CoreResult<()> {
        let mut inner = self.inner.write();
        inner.check_open()?;
        inner.require_allocated(recid)?;
        inner.log_delete(recid)
    }

    fn preallocate(&self) -> CoreResult<Recid> {
        let mut inner = self.inner.write();
        inner.check_open()?;
        let recid = inner.allocate()?;
        let record = WalRecord::Preallocate { recid };
        inner.wal.append(&record)?;
        inner.ops.push(record);
        inner.pending.insert(recid.as_u64(), PendingEntry::Put(None));
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
        inner.log_put(recid, bytes)?;
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
        inner.log_delete(recid)?;
        Ok(true)
    }

    fn commit(&self) -> CoreResult<()> {
        let mut inner = self.inner.write();
        inner.check_open()?;
        inner.commit_pending()
    }

    fn compact(&self) -> CoreResult<()> {
        let mut inner = self.inner.write();
        inner.check_open()?;
        // Compaction rewrites the data file, so pending work is committed
        // first to keep the log and the file consistent
        if !inner.ops.is_empty() {
            inner.commit_pending()?;
        }
        inner.direct.compact()?;
        inner.reset_alloc_overlay();
        Ok(())
    }

    fn close(&self) -> CoreResult<()> {
        let mut inner = self.inner.write();
        if inner.closed {
            return Ok(());
        }
        // Uncommitted mutations are discarded, same as a crash before commit
        inner.wal.clear()?;
        inner.ops.clear();
        inner.pending.clear();
        inner.direct.close()?;
        inner.closed = true;
        Ok(())
    }

    fn verify(&self) -> CoreResult<()> {
        let inner = self.inner.read();
        inner.direct.verify()?;
        for (&recid, entry) in &inner.pending {
            if recid == 0 || recid > inner.max_recid {
                return Err(CoreError::data_corruption(format!(
                    "pending recid {recid} outside [1, {}]",
                    inner.max_recid
                )));
            }
            if let PendingEntry::Put(Some(bytes)) = entry {
                if bytes.len() > index::MAX_RECORD_SIZE {
                    return Err(CoreError::data_corruption(format!(
                        "pending recid {recid} payload exceeds record size limit"
                    )));
                }
            }
        }
        Ok(())
    }

    fn is_empty(&self) -> CoreResult<bool> {
        let inner = self.inner.read();
        inner.check_open()?;
        for recid in 1..=inner.max_recid {
            if inner.state_bytes(Recid::new(recid))?.is_some() {
                return Ok(false);
            }
        }
        Ok(true)
    }
}

impl std::fmt::Debug for StoreWal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.read();
        f.debug_struct("StoreWal")
            .field("commit_id", &inner.commit_id)
            .field("pending_ops", &inner.ops.len())
            .finish_non_exhaustive()
    }
}
