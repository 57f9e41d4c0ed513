//! # recdb core
//!
//! Record store engine for recdb.
//!
//! A record store hands out opaque 64-bit **recids** and stores one binary
//! payload per recid, serialized through a caller-supplied [`Serializer`].
//! This crate provides:
//!
//! - The [`Store`] contract: `get`, `put`, `update`, `delete`,
//!   `preallocate`, compare-and-swap operations, `commit`, `compact`,
//!   `close`, `verify`, `is_empty`
//! - [`StoreOnHeap`] - in-memory reference implementation, the behavioral
//!   oracle the persistent backends are tested against
//! - [`StoreDirect`] - single-file random-access store with a packed recid
//!   index table and a bump-pointer data region
//! - [`StoreWal`] - durable variant wrapping a [`StoreDirect`] data file
//!   with a write-ahead log and crash recovery
//! - [`StoreAppend`] - append-only log-structured store whose index is
//!   rebuilt by scanning the log on open

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod config;
mod error;
mod serializer;
mod types;

pub mod store;
pub mod wal;

pub use config::StoreConfig;
pub use error::{CoreError, CoreResult};
pub use serializer::{BytesSerializer, CborSerializer, Serializer, StringSerializer, U64Serializer};
pub use store::append::StoreAppend;
pub use store::direct::StoreDirect;
pub use store::heap::StoreOnHeap;
pub use store::wal::StoreWal;
pub use store::Store;
pub use types::{CommitId, Recid};
