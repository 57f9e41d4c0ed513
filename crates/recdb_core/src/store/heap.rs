//! In-memory reference store.

use crate::error::{CoreError, CoreResult};
use crate::serializer::Serializer;
use crate::store::{opt_equals, serialize_opt, Store};
use crate::types::Recid;
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};

/// One allocated record slot.
#[derive(Debug, Clone, PartialEq, Eq)]
enum HeapSlot {
    /// Allocated, holds no value.
    Null,
    /// Holds serialized bytes.
    Present(Vec<u8>),
}

#[derive(Debug, Default)]
struct HeapInner {
    /// recid -> slot; absent recids have no entry.
    slots: HashMap<u64, HeapSlot>,
    /// Freed recids, reused LIFO.
    free: Vec<u64>,
    /// Highest recid ever allocated (and not compacted away).
    max_recid: u64,
    closed: bool,
}

impl HeapInner {
    fn check_open(&self) -> CoreResult<()> {
        if self.closed {
            return Err(CoreError::StoreClosed);
        }
        Ok(())
    }

    fn allocate(&mut self) -> Recid {
        if let Some(recid) = self.free.pop() {
            return Recid::new(recid);
        }
        self.max_recid += 1;
        Recid::new(self.max_recid)
    }

    fn slot_mut(&mut self, recid: Recid) -> CoreResult<&mut HeapSlot> {
        self.slots
            .get_mut(&recid.as_u64())
            .ok_or_else(|| CoreError::recid_not_found(recid))
    }

    fn value(&self, recid: Recid) -> CoreResult<Option<&[u8]>> {
        match self.slots.get(&recid.as_u64()) {
            None => Err(CoreError::recid_not_found(recid)),
            Some(HeapSlot::Null) => Ok(None),
            Some(HeapSlot::Present(bytes)) => Ok(Some(bytes)),
        }
    }

    fn store(&mut self, recid: Recid, bytes: Option<Vec<u8>>) {
        let slot = match bytes {
            None => HeapSlot::Null,
            Some(b) => HeapSlot::Present(b),
        };
        self.slots.insert(recid.as_u64(), slot);
    }

    fn remove(&mut self, recid: Recid) -> CoreResult<()> {
        if self.slots.remove(&recid.as_u64()).is_none() {
            return Err(CoreError::recid_not_found(recid));
        }
        self.free.push(recid.as_u64());
        Ok(())
    }

    fn current<T, S: Serializer<T>>(&self, recid: Recid, ser: &S) -> CoreResult<Option<T>> {
        self.value(recid)?.map(|b| ser.deserialize(b)).transpose()
    }
}

/// In-memory store holding records in a recid -> bytes map.
///
/// This is the reference implementation of the [`Store`] contract: no file
/// format, no allocator, just the recid lifecycle. The persistent backends
/// are tested against it as an oracle.
///
/// # Example
///
/// ```rust
/// use recdb_core::{Store, StoreOnHeap, StringSerializer};
///
/// let store = StoreOnHeap::new();
/// let ser = StringSerializer;
/// let recid = store.put(Some(&"hello".to_string()), &ser).unwrap();
/// assert_eq!(store.get(recid, &ser).unwrap(), Some("hello".to_string()));
/// ```
#[derive(Debug, Default)]
pub struct StoreOnHeap {
    inner: RwLock<HeapInner>,
}

impl StoreOnHeap {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Highest recid currently allocated or free-listed.
    #[must_use]
    pub fn max_recid(&self) -> u64 {
        self.inner.read().max_recid
    }
}

impl Store for StoreOnHeap {
    fn get<T, S: Serializer<T>>(&self, recid: Recid, ser: &S) -> CoreResult<Option<T>> {
        let inner = self.inner.read();
        inner.check_open()?;
        inner.current(recid, ser)
    }

    fn put<T, S: Serializer<T>>(&self, value: Option<&T>, ser: &S) -> CoreResult<Recid> {
        let bytes = serialize_opt(ser, value)?;
        let mut inner = self.inner.write();
        inner.check_open()?;
        let recid = inner.allocate();
        inner.store(recid, bytes);
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
        inner.slot_mut(recid)?;
        inner.store(recid, bytes);
        Ok(())
    }

    fn delete(&self, recid: Recid) -> CoreResult<()> {
        let mut inner = self.inner.write();
        inner.check_open()?;
        inner.remove(recid)
    }

    fn preallocate(&self) -> CoreResult<Recid> {
        let mut inner = self.inner.write();
        inner.check_open()?;
        let recid = inner.allocate();
        inner.store(recid, None);
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
        inner.store(recid, bytes);
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
        inner.remove(recid)?;
        Ok(true)
    }

    fn commit(&self) -> CoreResult<()> {
        self.inner.read().check_open()
    }

    fn compact(&self) -> CoreResult<()> {
        let mut inner = self.inner.write();
        inner.check_open()?;

        // Highest recid still referenced; free ids above it are dropped.
        let new_max = inner.slots.keys().copied().max().unwrap_or(0);
        inner.free.retain(|&r| r <= new_max);
        inner.max_recid = new_max;
        Ok(())
    }

    fn close(&self) -> CoreResult<()> {
        self.inner.write().closed = true;
        Ok(())
    }

    fn verify(&self) -> CoreResult<()> {
        let inner = self.inner.read();

        let mut seen = HashSet::new();
        for &recid in &inner.free {
            if recid == 0 || recid > inner.max_recid {
                return Err(CoreError::data_corruption(format!(
                    "free recid {recid} outside [1, {}]",
                    inner.max_recid
                )));
            }
            if inner.slots.contains_key(&recid) {
                return Err(CoreError::data_corruption(format!(
                    "recid {recid} both free and allocated"
                )));
            }
            if !seen.insert(recid) {
                return Err(CoreError::data_corruption(format!(
                    "recid {recid} free-listed twice"
                )));
            }
        }

        for &recid in inner.slots.keys() {
            if recid == 0 || recid > inner.max_recid {
                return Err(CoreError::data_corruption(format!(
                    "allocated recid {recid} outside [1, {}]",
                    inner.max_recid
                )));
            }
        }

        Ok(())
    }

    fn is_empty(&self) -> CoreResult<bool> {
        let inner = self.inner.read();
        inner.check_open()?;
        Ok(inner.slots.is_empty())
    }
}
