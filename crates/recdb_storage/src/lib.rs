//! # recdb storage
//!
//! Storage backend trait and implementations for recdb.
//!
//! This crate provides the lowest-level storage abstraction for recdb.
//! Storage backends are **opaque byte stores** - they do not interpret
//! the data they store.
//!
//! ## Design Principles
//!
//! - Backends are simple byte stores (read, write, append, flush)
//! - No knowledge of recdb record formats, index words, or WAL entries
//! - Must be `Send + Sync` for concurrent access
//! - recdb core owns all file format interpretation
//!
//! ## Available Backends
//!
//! - [`InMemoryBackend`] - For testing and ephemeral stores
//! - [`SharedMemoryBackend`] - Cloneable handle over one in-memory buffer,
//!   used by crash-recovery tests to reopen a "crashed" copy of the bytes
//! - [`FileBackend`] - For persistent storage using OS file APIs
//!
//! ## Example
//!
//! ```rust
//! use recdb_storage::{StorageBackend, InMemoryBackend};
//!
//! let mut backend = InMemoryBackend::new();
//! let offset = backend.append(b"hello world").unwrap();
//! let data = backend.read_at(offset, 11).unwrap();
//! assert_eq!(&data, b"hello world");
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod backend;
mod error;
mod file;
mod memory;

pub use backend::StorageBackend;
pub use error::{StorageError, StorageResult};
pub use file::FileBackend;
pub use memory::{InMemoryBackend, SharedMemoryBackend};
