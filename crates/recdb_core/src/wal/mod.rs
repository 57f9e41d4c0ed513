//! Write-ahead log format and plumbing.
//!
//! The WAL is an ordered, append-only stream of typed entries describing
//! recid mutations, punctuated by commit markers. Entries after the last
//! commit marker belong to an interrupted transaction and are discarded by
//! recovery.

mod iterator;
mod record;
mod writer;

pub use iterator::WalRecordIterator;
pub use record::{WalRecord, WalRecordType, WAL_MAGIC, WAL_VERSION};
pub use writer::WalManager;
