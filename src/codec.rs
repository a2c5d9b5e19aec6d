//! Element codec: how an element becomes a backend blob and back.
//!
//! Backends store elements as opaque byte arrays. The codec is a seam so
//! deployments can swap the envelope format without touching the cache or
//! the backends.

use crate::element::CacheElement;
use crate::error::CodecError;

/// Encodes and decodes the element envelope for backend storage.
pub trait ElementCodec: Send + Sync {
    fn encode(&self, element: &CacheElement) -> Result<Vec<u8>, CodecError>;
    fn decode(&self, bytes: &[u8]) -> Result<CacheElement, CodecError>;
}

/// Default codec: the element envelope as a JSON document.
///
/// One object per blob, greppable and debuggable with standard tools.
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonCodec;

impl ElementCodec for JsonCodec {
    fn encode(&self, element: &CacheElement) -> Result<Vec<u8>, CodecError> {
        serde_json::to_vec(element).map_err(|e| CodecError::Encode(e.to_string()))
    }

    fn decode(&self, bytes: &[u8]) -> Result<CacheElement, CodecError> {
        serde_json::from_slice(bytes).map_err(|e| CodecError::Decode(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::element::ElementAttributes;

    #[test]
    fn test_json_codec_roundtrip() {
        let el = CacheElement::with_attributes(
            "region:item-1",
            b"payload".to_vec(),
            ElementAttributes {
                create_time_ms: 1_700_000_000_000,
                max_life_s: 60,
                is_eternal: false,
            },
        );
        let codec = JsonCodec;
        let bytes = codec.encode(&el).unwrap();
        assert_eq!(codec.decode(&bytes).unwrap(), el);
    }

    #[test]
    fn test_json_codec_rejects_garbage() {
        let err = JsonCodec.decode(b"\xff\xfe not json").unwrap_err();
        assert!(matches!(err, CodecError::Decode(_)));
    }
}
