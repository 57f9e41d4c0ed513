//! Value serialization for store operations.
//!
//! Stores only ever manipulate byte spans; a [`Serializer`] is passed
//! explicitly into each operation to convert values to and from bytes and
//! to supply the semantic equality used by compare-and-swap.

use crate::error::{CoreError, CoreResult};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::marker::PhantomData;

/// Converts values of type `T` to and from opaque byte strings.
///
/// The store never inspects the produced bytes. Compare-and-swap operations
/// use [`Serializer::equals`] - semantic equality over deserialized values,
/// not byte or identity comparison.
pub trait Serializer<T> {
    /// Serializes a value to bytes.
    ///
    /// # Errors
    ///
    /// Returns an error if the value cannot be encoded.
    fn serialize(&self, value: &T) -> CoreResult<Vec<u8>>;

    /// Deserializes a value from bytes previously produced by
    /// [`Serializer::serialize`].
    ///
    /// # Errors
    ///
    /// Returns an error if the bytes are not a valid encoding.
    fn deserialize(&self, bytes: &[u8]) -> CoreResult<T>;

    /// Semantic equality between two values.
    fn equals(&self, a: &T, b: &T) -> bool;
}

/// Identity serializer for raw byte vectors.
#[derive(Debug, Clone, Copy, Default)]
pub struct BytesSerializer;

impl Serializer<Vec<u8>> for BytesSerializer {
    fn serialize(&self, value: &Vec<u8>) -> CoreResult<Vec<u8>> {
        Ok(value.clone())
    }

    fn deserialize(&self, bytes: &[u8]) -> CoreResult<Vec<u8>> {
        Ok(bytes.to_vec())
    }

    fn equals(&self, a: &Vec<u8>, b: &Vec<u8>) -> bool {
        a == b
    }
}

/// UTF-8 string serializer.
#[derive(Debug, Clone, Copy, Default)]
pub struct StringSerializer;

impl Serializer<String> for StringSerializer {
    fn serialize(&self, value: &String) -> CoreResult<Vec<u8>> {
        Ok(value.as_bytes().to_vec())
    }

    fn deserialize(&self, bytes: &[u8]) -> CoreResult<String> {
        String::from_utf8(bytes.to_vec())
            .map_err(|e| CoreError::serializer(format!("invalid UTF-8: {e}")))
    }

    fn equals(&self, a: &String, b: &String) -> bool {
        a == b
    }
}

/// Fixed-width little-endian serializer for `u64` values.
#[derive(Debug, Clone, Copy, Default)]
pub struct U64Serializer;

impl Serializer<u64> for U64Serializer {
    fn serialize(&self, value: &u64) -> CoreResult<Vec<u8>> {
        Ok(value.to_le_bytes().to_vec())
    }

    fn deserialize(&self, bytes: &[u8]) -> CoreResult<u64> {
        let arr: [u8; 8] = bytes
            .try_into()
            .map_err(|_| CoreError::serializer(format!("expected 8 bytes, got {}", bytes.len())))?;
        Ok(u64::from_le_bytes(arr))
    }

    fn equals(&self, a: &u64, b: &u64) -> bool {
        a == b
    }
}

/// CBOR serializer for arbitrary serde-compatible types.
///
/// # Example
///
/// ```rust
/// use recdb_core::{CborSerializer, Serializer};
/// use serde::{Deserialize, Serialize};
///
/// #[derive(Serialize, Deserialize, PartialEq, Debug)]
/// struct Point { x: i32, y: i32 }
///
/// let ser = CborSerializer::<Point>::new();
/// let bytes = ser.serialize(&Point { x: 1, y: 2 }).unwrap();
/// let back = ser.deserialize(&bytes).unwrap();
/// assert_eq!(back, Point { x: 1, y: 2 });
/// ```
#[derive(Debug, Clone, Copy)]
pub struct CborSerializer<T> {
    _marker: PhantomData<fn() -> T>,
}

impl<T> CborSerializer<T> {
    /// Creates a CBOR serializer for `T`.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            _marker: PhantomData,
        }
    }
}

impl<T> Default for CborSerializer<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Serializer<T> for CborSerializer<T>
where
    T: Serialize + DeserializeOwned + PartialEq,
{
    fn serialize(&self, value: &T) -> CoreResult<Vec<u8>> {
        let mut buf = Vec::new();
        ciborium::into_writer(value, &mut buf)
            .map_err(|e| CoreError::serializer(format!("CBOR encode failed: {e}")))?;
        Ok(buf)
    }

    fn deserialize(&self, bytes: &[u8]) -> CoreResult<T> {
        ciborium::from_reader(bytes)
            .map_err(|e| CoreError::serializer(format!("CBOR decode failed: {e}")))
    }

    fn equals(&self, a: &T, b: &T) -> bool {
        a == b
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde::Deserialize;

    #[test]
    fn bytes_roundtrip() {
        let ser = BytesSerializer;
        let value = vec![1u8, 2, 3];
        let bytes = ser.serialize(&value).unwrap();
        assert_eq!(ser.deserialize(&bytes).unwrap(), value);
    }

    #[test]
    fn string_rejects_invalid_utf8() {
        let ser = StringSerializer;
        assert!(matches!(
            ser.deserialize(&[0xFF, 0xFE]),
            Err(CoreError::Serializer { .. })
        ));
    }

    #[test]
    fn u64_fixed_width() {
        let ser = U64Serializer;
        let bytes = ser.serialize(&0x0102_0304_0506_0708).unwrap();
        assert_eq!(bytes.len(), 8);
        assert_eq!(bytes[0], 0x08);
    }

    #[test]
    fn u64_rejects_wrong_width() {
        let ser = U64Serializer;
        assert!(ser.deserialize(&[1, 2, 3]).is_err());
    }

    #[derive(Serialize, Deserialize, PartialEq, Debug, Clone)]
    struct Sample {
        name: String,
        count: u32,
    }

    #[test]
    fn cbor_struct_roundtrip() {
        let ser = CborSerializer::<Sample>::new();
        let value = Sample {
            name: "x".into(),
            count: 9,
        };
        let bytes = ser.serialize(&value).unwrap();
        assert_eq!(ser.deserialize(&bytes).unwrap(), value);
    }

    proptest! {
        #[test]
        fn u64_roundtrip(v: u64) {
            let ser = U64Serializer;
            let bytes = ser.serialize(&v).unwrap();
            prop_assert_eq!(ser.deserialize(&bytes).unwrap(), v);
        }

        #[test]
        fn string_roundtrip(s in ".*") {
            let ser = StringSerializer;
            let bytes = ser.serialize(&s).unwrap();
            prop_assert_eq!(ser.deserialize(&bytes).unwrap(), s);
        }
    }
}
