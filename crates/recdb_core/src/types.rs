//! Core type definitions for recdb.

use std::fmt;

/// Opaque handle identifying one stored record.
///
/// Recids are positive; `0` is reserved and never handed out. A recid stays
/// valid until it is deleted, after which the store may reuse it for a later
/// `put`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Recid(pub u64);

impl Recid {
    /// Creates a recid from its raw value.
    #[must_use]
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    /// Returns the raw handle value.
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for Recid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "recid:{}", self.0)
    }
}

/// Sequence number carried in WAL commit markers.
///
/// Commit ids are monotonically increasing per store. Recovery reports the
/// id of the commit it restored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CommitId(pub u64);

impl CommitId {
    /// Creates a commit id.
    #[must_use]
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    /// Returns the raw sequence value.
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// Returns the next commit id.
    #[must_use]
    pub const fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

impl fmt::Display for CommitId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "commit:{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recid_ordering() {
        assert!(Recid::new(1) < Recid::new(2));
    }

    #[test]
    fn recid_display() {
        assert_eq!(format!("{}", Recid::new(7)), "recid:7");
    }

    #[test]
    fn commit_id_next() {
        assert_eq!(CommitId::new(5).next().as_u64(), 6);
    }
}
