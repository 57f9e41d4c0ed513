//! Store configuration.

use crate::error::{CoreError, CoreResult};

/// Default number of index slots in a [`crate::StoreDirect`] file.
pub const DEFAULT_INDEX_CAPACITY: u64 = 1 << 20;

/// Configuration for opening a store.
///
/// Built once by the embedding application and passed into the store
/// constructor; there is no process-wide default registry.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Whether `commit()` forces data to durable storage before returning.
    pub sync_on_commit: bool,

    /// Whether WAL entries carry a CRC32 checksum.
    pub checksum: bool,

    /// Whether checksums are verified when reading WAL entries back.
    /// Requires `checksum`.
    pub checksum_on_read: bool,

    /// Number of recid slots in the fixed-size index region of a
    /// `StoreDirect` file. Immutable once the file is created.
    pub index_capacity: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            sync_on_commit: true,
            checksum: true,
            checksum_on_read: true,
            index_capacity: DEFAULT_INDEX_CAPACITY,
        }
    }
}

impl StoreConfig {
    /// Creates a configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets whether commit forces durable storage.
    #[must_use]
    pub const fn sync_on_commit(mut self, value: bool) -> Self {
        self.sync_on_commit = value;
        self
    }

    /// Sets whether WAL entries carry a checksum.
    #[must_use]
    pub const fn checksum(mut self, value: bool) -> Self {
        self.checksum = value;
        self
    }

    /// Sets whether checksums are verified on read.
    #[must_use]
    pub const fn checksum_on_read(mut self, value: bool) -> Self {
        self.checksum_on_read = value;
        self
    }

    /// Sets the index region capacity for `StoreDirect` files.
    #[must_use]
    pub const fn index_capacity(mut self, slots: u64) -> Self {
        self.index_capacity = slots;
        self
    }

    /// Fails fast on contradictory options.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::WrongConfiguration`] if `checksum_on_read` is
    /// requested without `checksum`, or if `index_capacity` is zero.
    pub fn validate(&self) -> CoreResult<()> {
        if self.checksum_on_read && !self.checksum {
            return Err(CoreError::wrong_configuration(
                "checksum_on_read requires checksum",
            ));
        }
        if self.index_capacity == 0 {
            return Err(CoreError::wrong_configuration(
                "index_capacity must be at least 1",
            ));
        }
        Ok(())
    }
}
