//! Pluggable value codecs.
//!
//! The cache never inspects payloads; the caller supplies the codec that
//! turns its values into bytes and back.

use crate::error::{Error, Result};
use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fmt;
use std::marker::PhantomData;

/// Encodes values to payload bytes and decodes them back.
pub trait ValueCodec<V>: Send + Sync + 'static {
    /// Encode a value.
    fn encode(&self, value: &V) -> Result<Bytes>;

    /// Decode a payload.
    fn decode(&self, payload: &[u8]) -> Result<V>;
}

/// Codec backed by bincode for any serde value.
pub struct BincodeCodec<V> {
    _marker: PhantomData<fn() -> V>,
}

impl<V> BincodeCodec<V> {
    /// Create a new bincode codec.
    pub fn new() -> Self {
        Self {
            _marker: PhantomData,
        }
    }
}

impl<V> Default for BincodeCodec<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V> fmt::Debug for BincodeCodec<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("BincodeCodec")
    }
}

impl<V> ValueCodec<V> for BincodeCodec<V>
where
    V: Serialize + DeserializeOwned + 'static,
{
    fn encode(&self, value: &V) -> Result<Bytes> {
        bincode::serialize(value)
            .map(Bytes::from)
            .map_err(|e| Error::Codec(e.to_string()))
    }

    fn decode(&self, payload: &[u8]) -> Result<V> {
        bincode::deserialize(payload).map_err(|e| Error::Codec(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use std::collections::BTreeMap;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    enum Computed {
        Scalar(f64),
        Curve(Vec<(f64, f64)>),
        Labels(BTreeMap<String, String>),
        Missing,
    }

    #[test]
    fn test_structured_values_survive_codec() {
        let codec = BincodeCodec::<Computed>::new();
        let mut labels = BTreeMap::new();
        labels.insert("ccy".to_string(), "USD".to_string());

        for value in [
            Computed::Scalar(42.5),
            Computed::Curve(vec![(0.25, 0.01), (1.0, 0.015)]),
            Computed::Labels(labels),
            Computed::Missing,
        ] {
            let bytes = codec.encode(&value).unwrap();
            assert_eq!(codec.decode(&bytes).unwrap(), value);
        }
    }

    #[test]
    fn test_garbage_payload_is_codec_error() {
        let codec = BincodeCodec::<String>::new();
        let err = codec.decode(&[0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0x01]).unwrap_err();
        assert!(matches!(err, Error::Codec(_)));
    }
}
