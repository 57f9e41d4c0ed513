//! Store contract and backends.
//!
//! A store maps recids to one of three record states:
//!
//! - **absent** - the recid was never allocated (or was deleted); any access
//!   fails with [`CoreError::RecidNotFound`]
//! - **null** - the recid is allocated but holds no value; `get` returns
//!   `None`
//! - **present** - the recid holds bytes deserializable by the caller's
//!   serializer
//!
//! All backends must behave identically at this contract level;
//! [`heap::StoreOnHeap`] is the reference implementation the persistent
//! backends are validated against.

use crate::error::CoreResult;
use crate::serializer::Serializer;
use crate::types::Recid;

pub mod append;
pub mod direct;
pub mod heap;
pub mod index;
pub mod wal;

/// The record store contract.
///
/// Calls are synchronous and blocking. Every mutating operation is atomic
/// with respect to concurrent callers: each store owns one reader/writer
/// lock, reads take it shared, mutations take it exclusively for their
/// entire duration. Compare-and-swap is therefore coarse-grained mutual
/// exclusion with a CAS contract, not a lock-free primitive.
pub trait Store {
    /// Reads the record at `recid`.
    ///
    /// Returns `None` if the recid is in the null state.
    ///
    /// # Errors
    ///
    /// Fails with [`crate::CoreError::RecidNotFound`] if the recid was never
    /// allocated or was deleted.
    fn get<T, S: Serializer<T>>(&self, recid: Recid, ser: &S) -> CoreResult<Option<T>>;

    /// Allocates a recid and stores `value` under it.
    ///
    /// `None` stores the null state. Returns the new recid; freed recids
    /// are reused LIFO before the max-recid counter advances.
    ///
    /// # Errors
    ///
    /// Fails only on serialization or I/O errors.
    fn put<T, S: Serializer<T>>(&self, value: Option<&T>, ser: &S) -> CoreResult<Recid>;

    /// Overwrites the record at `recid` (or sets the null state).
    ///
    /// # Errors
    ///
    /// Fails with [`crate::CoreError::RecidNotFound`] if the recid is not
    /// currently allocated, including after a delete.
    fn update<T, S: Serializer<T>>(
        &self,
        recid: Recid,
        ser: &S,
        value: Option<&T>,
    ) -> CoreResult<()>;

    /// Deletes the record and returns the recid to the free list.
    ///
    /// # Errors
    ///
    /// Fails with [`crate::CoreError::RecidNotFound`] if the recid is not
    /// allocated; a double delete fails.
    fn delete(&self, recid: Recid) -> CoreResult<()>;

    /// Allocates a recid in the null state without writing a value.
    ///
    /// # Errors
    ///
    /// Fails only on I/O errors.
    fn preallocate(&self) -> CoreResult<Recid>;

    /// Atomically replaces the record iff its current value equals
    /// `expected` under the serializer's semantic equality.
    ///
    /// Returns whether the swap happened.
    ///
    /// # Errors
    ///
    /// Fails with [`crate::CoreError::RecidNotFound`] if the recid is not
    /// allocated.
    fn compare_and_update<T, S: Serializer<T>>(
        &self,
        recid: Recid,
        ser: &S,
        expected: Option<&T>,
        new: Option<&T>,
    ) -> CoreResult<bool>;

    /// Atomically deletes the record iff its current value equals
    /// `expected` under the serializer's semantic equality.
    ///
    /// Returns whether the delete happened.
    ///
    /// # Errors
    ///
    /// Fails with [`crate::CoreError::RecidNotFound`] if the recid is not
    /// allocated.
    fn compare_and_delete<T, S: Serializer<T>>(
        &self,
        recid: Recid,
        ser: &S,
        expected: Option<&T>,
    ) -> CoreResult<bool>;

    /// Makes all prior mutations durable.
    ///
    /// # Errors
    ///
    /// Fails on I/O errors; the store state is unchanged on failure.
    fn commit(&self) -> CoreResult<()>;

    /// Reclaims space held by deleted and obsolete record versions and
    /// shrinks the max-recid counter past trailing free recids.
    ///
    /// Compaction never changes logical state.
    ///
    /// # Errors
    ///
    /// Fails on I/O errors.
    fn compact(&self) -> CoreResult<()>;

    /// Closes the store. Subsequent operations fail with
    /// [`crate::CoreError::StoreClosed`].
    ///
    /// # Errors
    ///
    /// Fails on I/O errors while flushing.
    fn close(&self) -> CoreResult<()>;

    /// Walks internal structures and fails on any invariant violation.
    ///
    /// Intended for tests and diagnostics, not production error handling.
    ///
    /// # Errors
    ///
    /// Fails with [`crate::CoreError::DataCorruption`] describing the first
    /// violated invariant.
    fn verify(&self) -> CoreResult<()>;

    /// Returns whether the store holds no allocated recids.
    ///
    /// # Errors
    ///
    /// Fails on I/O errors.
    fn is_empty(&self) -> CoreResult<bool>;
}

/// Equality over optional values using the serializer's semantics.
///
/// Two nulls are equal; null never equals a present value.
pub(crate) fn opt_equals<T, S: Serializer<T>>(ser: &S, a: Option<&T>, b: Option<&T>) -> bool {
    match (a, b) {
        (None, None) => true,
        (Some(a), Some(b)) => ser.equals(a, b),
        _ => false,
    }
}

/// Serializes an optional value; `None` maps to the null state.
pub(crate) fn serialize_opt<T, S: Serializer<T>>(
    ser: &S,
    value: Option<&T>,
) -> CoreResult<Option<Vec<u8>>> {
    value.map(|v| ser.serialize(v)).transpose()
}
