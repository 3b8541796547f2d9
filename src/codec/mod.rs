//! Serialization boundary between typed objects and stored bytes.

use serde::de::DeserializeOwned;
use serde::Serialize;
use std::marker::PhantomData;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CodecError {
    #[error("encode failed: {0}")]
    Encode(String),

    #[error("decode failed: {0}")]
    Decode(String),
}

pub type CodecResult<T> = Result<T, CodecError>;

/// Converts objects to and from their stored representation.
pub trait Codec<T>: Send + Sync {
    fn encode(&self, obj: &T) -> CodecResult<Vec<u8>>;
    fn decode(&self, data: &[u8]) -> CodecResult<T>;
}

/// JSON codec backed by serde_json.
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

impl<T> Codec<T> for JsonCodec<T>
where
    T: Serialize + DeserializeOwned,
{
    fn encode(&self, obj: &T) -> CodecResult<Vec<u8>> {
        serde_json::to_vec(obj).map_err(|e| CodecError::Encode(e.to_string()))
    }

    fn decode(&self, data: &[u8]) -> CodecResult<T> {
        serde_json::from_slice(data).map_err(|e| CodecError::Decode(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Widget {
        name: String,
        size: u32,
    }

    #[test]
    fn test_json_codec() {
        let codec = JsonCodec::<Widget>::new();
        let data = codec
            .encode(&Widget {
                name: "w".into(),
                size: 3,
            })
            .unwrap();
        assert_eq!(data, br#"{"name":"w","size":3}"#);

        let err = codec.decode(b"{not json").unwrap_err();
        assert!(matches!(err, CodecError::Decode(_)));
    }
}
