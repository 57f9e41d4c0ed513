//! In-memory storage backends.

use crate::backend::StorageBackend;
use crate::error::{StorageError, StorageResult};
use parking_lot::RwLock;
use std::sync::Arc;

/// Byte store held entirely in a `Vec<u8>`.
///
/// Nothing persists past the value's lifetime, which makes this the
/// backend of choice for unit tests and ephemeral stores. All operations
/// go through one reader/writer lock.
///
/// # Example
///
/// ```rust
/// use recdb_storage::{StorageBackend, InMemoryBackend};
///
/// let mut backend = InMemoryBackend::new();
/// let offset = backend.append(b"bytes").unwrap();
/// assert_eq!(offset, 0);
/// assert_eq!(backend.read_at(0, 5).unwrap(), b"bytes");
/// ```
#[derive(Debug, Default)]
pub struct InMemoryBackend {
    data: RwLock<Vec<u8>>,
}

impl InMemoryBackend {
    /// Creates an empty backend.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a backend seeded with `data`, as if those bytes had been
    /// written by an earlier session. Recovery tests build malformed or
    /// truncated files this way.
    #[must_use]
    pub fn with_data(data: Vec<u8>) -> Self {
        Self {
            data: RwLock::new(data),
        }
    }

    /// Copies out the full contents.
    #[must_use]
    pub fn data(&self) -> Vec<u8> {
        self.data.read().clone()
    }
}

fn read_at_locked(data: &[u8], offset: u64, len: usize) -> StorageResult<Vec<u8>> {
    let size = data.len() as u64;
    let offset_usize = offset as usize;
    let end = offset_usize.saturating_add(len);

    if offset > size || end > data.len() {
        return Err(StorageError::ReadPastEnd { offset, len, size });
    }

    Ok(data[offset_usize..end].to_vec())
}

fn write_at_locked(data: &mut Vec<u8>, offset: u64, new_data: &[u8]) {
    let end = offset as usize + new_data.len();
    if end > data.len() {
        // Gap between old end and offset reads as zeroes, like a file hole
        data.resize(end, 0);
    }
    data[offset as usize..end].copy_from_slice(new_data);
}

fn truncate_locked(data: &mut Vec<u8>, new_size: u64) -> StorageResult<()> {
    let current_size = data.len() as u64;
    if new_size > current_size {
        return Err(StorageError::Io(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            format!("cannot truncate from {current_size} to larger size {new_size}"),
        )));
    }
    data.truncate(new_size as usize);
    Ok(())
}

impl StorageBackend for InMemoryBackend {
    fn read_at(&self, offset: u64, len: usize) -> StorageResult<Vec<u8>> {
        read_at_locked(&self.data.read(), offset, len)
    }

    fn write_at(&mut self, offset: u64, new_data: &[u8]) -> StorageResult<()> {
        write_at_locked(&mut self.data.write(), offset, new_data);
        Ok(())
    }

    fn append(&mut self, new_data: &[u8]) -> StorageResult<u64> {
        let mut data = self.data.write();
        let offset = data.len() as u64;
        data.extend_from_slice(new_data);
        Ok(offset)
    }

    fn flush(&mut self) -> StorageResult<()> {
        // Nothing buffered
        Ok(())
    }

    fn size(&self) -> StorageResult<u64> {
        Ok(self.data.read().len() as u64)
    }

    fn sync(&mut self) -> StorageResult<()> {
        Ok(())
    }

    fn truncate(&mut self, new_size: u64) -> StorageResult<()> {
        truncate_locked(&mut self.data.write(), new_size)
    }
}

/// A cloneable in-memory backend sharing one underlying buffer.
///
/// Every clone reads and writes the same bytes. Crash-recovery tests hand
/// one clone to a store, let it write, then drop the store and reopen a new
/// store over another clone - exactly what a process restart over the same
/// file looks like.
///
/// # Example
///
/// ```rust
/// use recdb_storage::{StorageBackend, SharedMemoryBackend};
///
/// let a = SharedMemoryBackend::new();
/// let mut b = a.clone();
/// b.append(b"written through b").unwrap();
/// assert_eq!(a.size().unwrap(), 17);
/// ```
#[derive(Debug, Default, Clone)]
pub struct SharedMemoryBackend {
    data: Arc<RwLock<Vec<u8>>>,
}

impl SharedMemoryBackend {
    /// Creates a new empty shared backend.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Copies out the full contents.
    #[must_use]
    pub fn data(&self) -> Vec<u8> {
        self.data.read().clone()
    }

    /// Replaces the buffer contents wholesale.
    ///
    /// Used by tests to rewind the "disk" to an earlier snapshot.
    pub fn set_data(&self, data: Vec<u8>) {
        *self.data.write() = data;
    }
}

impl StorageBackend for SharedMemoryBackend {
    fn read_at(&self, offset: u64, len: usize) -> StorageResult<Vec<u8>> {
        read_at_locked(&self.data.read(), offset, len)
    }

    fn write_at(&mut self, offset: u64, new_data: &[u8]) -> StorageResult<()> {
        write_at_locked(&mut self.data.write(), offset, new_data);
        Ok(())
    }

    fn append(&mut self, new_data: &[u8]) -> StorageResult<u64> {
        let mut data = self.data.write();
        let offset = data.len() as u64;
        data.extend_from_slice(new_data);
        Ok(offset)
    }

    fn flush(&mut self) -> StorageResult<()> {
        Ok(())
    }

    fn size(&self) -> StorageResult<u64> {
        Ok(self.data.read().len() as u64)
    }

    fn sync(&mut self) -> StorageResult<()> {
        Ok(())
    }

    fn truncate(&mut self, new_size: u64) -> StorageResult<()> {
        truncate_locked(&mut self.data.write(), new_size)
    }
}
