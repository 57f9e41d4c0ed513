//! File-backed storage.

use crate::backend::StorageBackend;
use crate::error::{StorageError, StorageResult};
use fs2::FileExt;
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

struct FileInner {
    file: File,
    /// Tracked length, kept in sync with every write so `size()` never
    /// needs a metadata syscall.
    size: u64,
}

impl FileInner {
    fn seek_read(&mut self, offset: u64, len: usize) -> StorageResult<Vec<u8>> {
        self.file.seek(SeekFrom::Start(offset))?;
        let mut buf = vec![0u8; len];
        self.file.read_exact(&mut buf)?;
        Ok(buf)
    }

    fn seek_write(&mut self, offset: u64, data: &[u8]) -> StorageResult<()> {
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.write_all(data)?;
        self.size = self.size.max(offset + data.len() as u64);
        Ok(())
    }
}

/// Store file on the local filesystem.
///
/// `flush` pushes buffered writes to the OS; `sync` additionally forces
/// data and metadata to the device (`File::sync_all`). A write past the
/// current end leaves a hole that reads back as zeroes.
///
/// # Single writer
///
/// Opening takes an advisory exclusive lock on the file. Two store
/// instances must never interpret the same file concurrently; a second
/// open of a locked file fails with [`StorageError::Locked`]. The lock is
/// released when the backend is dropped.
///
/// # Example
///
/// ```no_run
/// use recdb_storage::{StorageBackend, FileBackend};
/// use std::path::Path;
///
/// let mut backend = FileBackend::open(Path::new("data.bin")).unwrap();
/// backend.append(b"persistent data").unwrap();
/// backend.sync().unwrap();
/// ```
pub struct FileBackend {
    path: PathBuf,
    inner: Mutex<FileInner>,
}

impl FileBackend {
    /// Opens the file at `path`, creating it if missing, and takes its
    /// advisory exclusive lock.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be opened or created, or
    /// [`StorageError::Locked`] if another instance already holds the lock.
    pub fn open(path: &Path) -> StorageResult<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;

        file.try_lock_exclusive()
            .map_err(|_| StorageError::Locked {
                path: path.display().to_string(),
            })?;

        let size = file.metadata()?.len();
        Ok(Self {
            path: path.to_path_buf(),
            inner: Mutex::new(FileInner { file, size }),
        })
    }

    /// Like [`FileBackend::open`], creating parent directories first.
    ///
    /// # Errors
    ///
    /// Returns an error if directories cannot be created or the file
    /// cannot be opened.
    pub fn open_with_create_dirs(path: &Path) -> StorageResult<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        Self::open(path)
    }

    /// The path this backend was opened with.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl std::fmt::Debug for FileBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileBackend")
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

impl Drop for FileBackend {
    fn drop(&mut self) {
        let _ = fs2::FileExt::unlock(&self.inner.lock().file);
    }
}

impl StorageBackend for FileBackend {
    fn read_at(&self, offset: u64, len: usize) -> StorageResult<Vec<u8>> {
        let mut inner = self.inner.lock();
        let end = offset.saturating_add(len as u64);
        if end > inner.size {
            return Err(StorageError::ReadPastEnd {
                offset,
                len,
                size: inner.size,
            });
        }
        if len == 0 {
            return Ok(Vec::new());
        }
        inner.seek_read(offset, len)
    }

    fn write_at(&mut self, offset: u64, data: &[u8]) -> StorageResult<()> {
        if data.is_empty() {
            return Ok(());
        }
        self.inner.lock().seek_write(offset, data)
    }

    fn append(&mut self, data: &[u8]) -> StorageResult<u64> {
        let mut inner = self.inner.lock();
        let offset = inner.size;
        if !data.is_empty() {
            inner.seek_write(offset, data)?;
        }
        Ok(offset)
    }

    fn flush(&mut self) -> StorageResult<()> {
        self.inner.lock().file.flush()?;
        Ok(())
    }

    fn size(&self) -> StorageResult<u64> {
        Ok(self.inner.lock().size)
    }

    fn sync(&mut self) -> StorageResult<()> {
        self.inner.lock().file.sync_all()?;
        Ok(())
    }

    fn truncate(&mut self, new_size: u64) -> StorageResult<()> {
        let mut inner = self.inner.lock();
        if new_size > inner.size {
            return Err(StorageError::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!(
                    "cannot truncate from {} to larger size {new_size}",
                    inner.size
                ),
            )));
        }
        inner.file.set_len(new_size)?;
        inner.file.sync_all()?;
        inner.size = new_size;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn open_in(dir: &tempfile::TempDir) -> FileBackend {
        FileBackend::open(&dir.path().join("store.bin")).unwrap()
    }

    #[test]
    fn open_creates_empty_file() {
        let dir = tempdir().unwrap();
        let backend = open_in(&dir);
        assert_eq!(backend.size().unwrap(), 0);
        assert!(backend.path().exists());
    }

    #[test]
    fn append_returns_prior_end() {
        let dir = tempdir().unwrap();
        let mut backend = open_in(&dir);

        assert_eq!(backend.append(b"one").unwrap(), 0);
        assert_eq!(backend.append(b"two").unwrap(), 3);
        assert_eq!(backend.size().unwrap(), 6);
        assert_eq!(backend.read_at(0, 6).unwrap(), b"onetwo");
        assert_eq!(backend.read_at(3, 3).unwrap(), b"two");
    }

    #[test]
    fn write_at_overwrites_in_place() {
        let dir = tempdir().unwrap();
        let mut backend = open_in(&dir);
        backend.append(b"aaaa bbbb").unwrap();

        backend.write_at(5, b"cccc").unwrap();
        assert_eq!(backend.read_at(0, 9).unwrap(), b"aaaa cccc");
        assert_eq!(backend.size().unwrap(), 9);
    }

    #[test]
    fn write_past_end_leaves_zero_hole() {
        let dir = tempdir().unwrap();
        let mut backend = open_in(&dir);

        backend.write_at(6, b"end").unwrap();
        assert_eq!(backend.size().unwrap(), 9);
        assert_eq!(backend.read_at(0, 9).unwrap(), b"\0\0\0\0\0\0end");
    }

    #[test]
    fn read_past_end_fails() {
        let dir = tempdir().unwrap();
        let mut backend = open_in(&dir);
        backend.append(b"short").unwrap();

        assert!(matches!(
            backend.read_at(3, 10),
            Err(StorageError::ReadPastEnd { .. })
        ));
    }

    #[test]
    fn zero_length_ops_are_noops() {
        let dir = tempdir().unwrap();
        let mut backend = open_in(&dir);
        backend.append(b"x").unwrap();

        assert_eq!(backend.append(b"").unwrap(), 1);
        backend.write_at(0, b"").unwrap();
        assert!(backend.read_at(1, 0).unwrap().is_empty());
        assert_eq!(backend.size().unwrap(), 1);
    }

    #[test]
    fn contents_survive_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("store.bin");

        {
            let mut backend = FileBackend::open(&path).unwrap();
            backend.append(b"keep me").unwrap();
            backend.sync().unwrap();
        }

        let backend = FileBackend::open(&path).unwrap();
        assert_eq!(backend.size().unwrap(), 7);
        assert_eq!(backend.read_at(0, 7).unwrap(), b"keep me");
    }

    #[test]
    fn truncate_discards_tail() {
        let dir = tempdir().unwrap();
        let mut backend = open_in(&dir);
        backend.append(b"head tail").unwrap();

        backend.truncate(4).unwrap();
        assert_eq!(backend.size().unwrap(), 4);
        assert_eq!(backend.read_at(0, 4).unwrap(), b"head");
        assert!(backend.truncate(100).is_err());
    }

    #[test]
    fn second_open_is_locked() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("store.bin");

        let first = FileBackend::open(&path).unwrap();
        assert!(matches!(
            FileBackend::open(&path),
            Err(StorageError::Locked { .. })
        ));

        // Dropping the holder releases the lock
        drop(first);
        assert!(FileBackend::open(&path).is_ok());
    }

    #[test]
    fn open_with_create_dirs_builds_parents() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("a").join("b").join("store.bin");

        let backend = FileBackend::open_with_create_dirs(&path).unwrap();
        assert_eq!(backend.size().unwrap(), 0);
        assert!(path.exists());
    }
}
