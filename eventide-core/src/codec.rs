//! Serialization strategy for event payloads.
//!
//! The event log stores opaque bytes. A [`Codec`] turns typed events into
//! those bytes and back; [`JsonCodec`] is the default.

use serde::{Serialize, de::DeserializeOwned};

/// Serialization codec used for event payloads and read models.
pub trait Codec: Clone + Send + Sync + 'static {
    type Error: std::error::Error + Send + Sync + 'static;

    /// Serialize a value to bytes.
    ///
    /// # Errors
    ///
    /// Returns a codec-specific error when the value cannot be encoded.
    fn serialize<T>(&self, value: &T) -> Result<Vec<u8>, Self::Error>
    where
        T: Serialize + ?Sized;

    /// Deserialize bytes into a value.
    ///
    /// # Errors
    ///
    /// Returns a codec-specific error when the bytes do not describe a `T`.
    fn deserialize<T>(&self, data: &[u8]) -> Result<T, Self::Error>
    where
        T: DeserializeOwned;
}

/// JSON codec backed by `serde_json`.
#[derive(Clone, Copy, Debug, Default)]
pub struct JsonCodec;

impl Codec for JsonCodec {
    type Error = serde_json::Error;

    fn serialize<T>(&self, value: &T) -> Result<Vec<u8>, Self::Error>
    where
        T: Serialize + ?Sized,
    {
        serde_json::to_vec(value)
    }

    fn deserialize<T>(&self, data: &[u8]) -> Result<T, Self::Error>
    where
        T: DeserializeOwned,
    {
        serde_json::from_slice(data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
    struct ValueAdded {
        amount: i32,
    }

    #[test]
    fn json_codec_roundtrips() {
        let codec = JsonCodec;
        let value = ValueAdded { amount: 42 };
        let bytes = codec.serialize(&value).unwrap();
        let decoded: ValueAdded = codec.deserialize(&bytes).unwrap();
        assert_eq!(decoded, value);
    }

    #[test]
    fn json_codec_rejects_wrong_shape() {
        let codec = JsonCodec;
        let result: Result<ValueAdded, _> = codec.deserialize(br#"{"wrong_field":123}"#);
        assert!(result.is_err());
    }
}
