use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::fmt;
use std::marker::PhantomData;

use super::error::CodecError;

/// Paired decode/encode between wire values and a typed value.
///
/// Absent params are presented to `decode` as `Value::Null`.
pub trait Codec<T>: Send + Sync + 'static {
    fn decode(&self, raw: &Value) -> Result<T, CodecError>;
    fn encode(&self, value: &T) -> Result<Value, CodecError>;
}

/// Codec backed by the type's serde implementations
pub struct JsonCodec<T> {
    _marker: PhantomData<fn() -> T>,
}

impl<T> JsonCodec<T> {
    pub fn new() -> Self {
        Self {
            _marker: PhantomData,
        }
    }
}

impl<T> Default for JsonCodec<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> fmt::Debug for JsonCodec<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "JsonCodec<{}>", std::any::type_name::<T>())
    }
}

impl<T> Codec<T> for JsonCodec<T>
where
    T: Serialize + DeserializeOwned + 'static,
{
    fn decode(&self, raw: &Value) -> Result<T, CodecError> {
        Ok(T::deserialize(raw)?)
    }

    fn encode(&self, value: &T) -> Result<Value, CodecError> {
        Ok(serde_json::to_value(value)?)
    }
}

/// Passes wire values through untouched
#[derive(Debug, Clone, Copy, Default)]
pub struct RawCodec;

impl Codec<Value> for RawCodec {
    fn decode(&self, raw: &Value) -> Result<Value, CodecError> {
        Ok(raw.clone())
    }

    fn encode(&self, value: &Value) -> Result<Value, CodecError> {
        Ok(value.clone())
    }
}

/// Codec assembled from two functions, for schemas serde cannot express
pub struct FnCodec<D, E> {
    decode: D,
    encode: E,
}

impl<D, E> FnCodec<D, E> {
    pub fn new(decode: D, encode: E) -> Self {
        Self { decode, encode }
    }
}

impl<T, D, E> Codec<T> for FnCodec<D, E>
where
    D: Fn(&Value) -> Result<T, CodecError> + Send + Sync + 'static,
    E: Fn(&T) -> Result<Value, CodecError> + Send + Sync + 'static,
{
    fn decode(&self, raw: &Value) -> Result<T, CodecError> {
        (self.decode)(raw)
    }

    fn encode(&self, value: &T) -> Result<Value, CodecError> {
        (self.encode)(value)
    }
}
