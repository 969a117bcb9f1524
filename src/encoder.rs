//! Codecs for user-defined OBJECT values.
//!
//! Every OBJECT record embeds the tag of the encoder that produced it, so
//! a reopened store can look the codec up again. The string-set codec is
//! registered by default; user codecs are registered via
//! [`crate::store::Options::encoder`].

use crate::errinput;
use crate::error::Result;

use serde::de::DeserializeOwned;
use serde::Serialize;
use std::any::Any;
use std::collections::HashSet;
use std::marker::PhantomData;
use std::sync::Arc;

/// The tag of the built-in string-set codec.
pub const STRING_SET_TAG: &str = "StringSet";

/// Encodes and decodes one user-defined value type.
pub trait Encoder: Send + Sync + 'static {
    type Value: Send + Sync + 'static;

    /// The tag stored in every record this encoder produces. At most 255
    /// UTF-8 bytes.
    fn tag(&self) -> &str;

    fn encode(&self, value: &Self::Value) -> Result<Vec<u8>>;

    fn decode(&self, bytes: &[u8]) -> Result<Self::Value>;
}

/// The object-safe form of [`Encoder`] held by the store's registry.
pub(crate) trait ErasedEncoder: Send + Sync {
    fn tag(&self) -> &str;
    fn encode_value(&self, value: &(dyn Any + Send + Sync)) -> Result<Vec<u8>>;
    fn decode_value(&self, bytes: &[u8]) -> Result<Arc<dyn Any + Send + Sync>>;
}

impl<E: Encoder> ErasedEncoder for E {
    fn tag(&self) -> &str {
        Encoder::tag(self)
    }

    fn encode_value(&self, value: &(dyn Any + Send + Sync)) -> Result<Vec<u8>> {
        let Some(value) = value.downcast_ref::<E::Value>() else {
            return errinput!("value type does not match encoder {}", Encoder::tag(self));
        };
        self.encode(value)
    }

    fn decode_value(&self, bytes: &[u8]) -> Result<Arc<dyn Any + Send + Sync>> {
        Ok(Arc::new(self.decode(bytes)?))
    }
}

/// An encoder for any serde-serializable type, using bincode.
pub struct BincodeEncoder<T> {
    tag: String,
    _marker: PhantomData<fn() -> T>,
}

impl<T> BincodeEncoder<T> {
    pub fn new(tag: impl Into<String>) -> Self {
        Self { tag: tag.into(), _marker: PhantomData }
    }
}

impl<T: Serialize + DeserializeOwned + Send + Sync + 'static> Encoder for BincodeEncoder<T> {
    type Value = T;

    fn tag(&self) -> &str {
        &self.tag
    }

    fn encode(&self, value: &T) -> Result<Vec<u8>> {
        Ok(bincode::serialize(value)?)
    }

    fn decode(&self, bytes: &[u8]) -> Result<T> {
        Ok(bincode::deserialize(bytes)?)
    }
}

/// The built-in string-set codec.
pub(crate) fn string_set_encoder() -> BincodeEncoder<HashSet<String>> {
    BincodeEncoder::new(STRING_SET_TAG)
}
