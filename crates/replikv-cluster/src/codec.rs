//! Value codecs
//!
//! The cache stores and ships values in serialized form. The codec is
//! chosen when the cache is built; no runtime type lookup is involved.

use bytes::Bytes;
use replikv_common::{Error, Result};
use replikv_store::fields::{decode_fields, encode_fields};
use replikv_store::FieldMap;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::marker::PhantomData;

/// Converts cache values to and from bytes
pub trait ValueCodec<V>: Send + Sync {
    fn encode(&self, value: &V) -> Result<Bytes>;
    fn decode(&self, bytes: &[u8]) -> Result<V>;
}

/// bincode for any serde type
pub struct BincodeCodec<V>(PhantomData<fn() -> V>);

impl<V> BincodeCodec<V> {
    #[must_use]
    pub const fn new() -> Self {
        Self(PhantomData)
    }
}

impl<V> Default for BincodeCodec<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V> Clone for BincodeCodec<V> {
    fn clone(&self) -> Self {
        Self::new()
    }
}

impl<V: Serialize + DeserializeOwned> ValueCodec<V> for BincodeCodec<V> {
    fn encode(&self, value: &V) -> Result<Bytes> {
        bincode::serialize(value)
            .map(Bytes::from)
            .map_err(|e| Error::codec(e.to_string()))
    }

    fn decode(&self, bytes: &[u8]) -> Result<V> {
        bincode::deserialize(bytes).map_err(|e| Error::codec(e.to_string()))
    }
}

/// Values that already are bytes
#[derive(Debug, Default, Clone, Copy)]
pub struct RawCodec;

impl ValueCodec<Bytes> for RawCodec {
    fn encode(&self, value: &Bytes) -> Result<Bytes> {
        Ok(value.clone())
    }

    fn decode(&self, bytes: &[u8]) -> Result<Bytes> {
        Ok(Bytes::copy_from_slice(bytes))
    }
}

/// Structured values replicated with dirty-field merging
#[derive(Debug, Default, Clone, Copy)]
pub struct FieldMapCodec;

impl ValueCodec<FieldMap> for FieldMapCodec {
    fn encode(&self, value: &FieldMap) -> Result<Bytes> {
        encode_fields(value)
    }

    fn decode(&self, bytes: &[u8]) -> Result<FieldMap> {
        decode_fields(bytes)
    }
}
