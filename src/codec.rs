//! rkyv-backed serialization for everything that crosses a process boundary:
//! task envelopes, control payloads, and user arguments and results.
//!
//! Archives are always validated on the way in. Received bytes are copied
//! into an [`AlignedVec`] first because frame parts land at arbitrary offsets.

use std::any::type_name;

use rkyv::{
    de::deserializers::SharedDeserializeMap, ser::serializers::AllocSerializer,
    validation::validators::DefaultValidator, AlignedVec, Archive, CheckBytes, Deserialize,
    Serialize,
};

use crate::error::CodecError;

/// Scratch space preallocated by the serializer; larger values spill to the
/// heap.
const SCRATCH: usize = 256;

pub trait Encode {
    fn encode(&self) -> Result<Vec<u8>, CodecError>;
}

impl<T> Encode for T
where
    T: Serialize<AllocSerializer<SCRATCH>>,
{
    fn encode(&self) -> Result<Vec<u8>, CodecError> {
        rkyv::to_bytes::<_, SCRATCH>(self)
            .map(|bytes| bytes.to_vec())
            .map_err(|e| CodecError::Encode(format!("{}: {}", type_name::<T>(), e)))
    }
}

pub trait Decode: Sized {
    fn decode(bytes: &[u8]) -> Result<Self, CodecError>;
}

impl<T> Decode for T
where
    T: Archive,
    T::Archived: for<'a> CheckBytes<DefaultValidator<'a>> + Deserialize<T, SharedDeserializeMap>,
{
    fn decode(bytes: &[u8]) -> Result<Self, CodecError> {
        let mut aligned = AlignedVec::with_capacity(bytes.len());
        aligned.extend_from_slice(bytes);
        rkyv::from_bytes::<T>(&aligned).map_err(|_| CodecError::Decode(type_name::<T>()))
    }
}

pub fn compress(bytes: &[u8]) -> Result<Vec<u8>, CodecError> {
    zstd::encode_all(bytes, zstd::DEFAULT_COMPRESSION_LEVEL)
        .map_err(|e| CodecError::Compression(e.to_string()))
}

pub fn decompress(bytes: &[u8]) -> Result<Vec<u8>, CodecError> {
    zstd::decode_all(bytes).map_err(|e| CodecError::Compression(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::{FailureKind, Outcome, TaskFailure};

    #[test]
    fn decodes_from_unaligned_offsets() {
        let encoded = 0xfeed_u64.encode().unwrap();
        let mut shifted = vec![0u8];
        shifted.extend_from_slice(&encoded);
        assert_eq!(u64::decode(&shifted[1..]).unwrap(), 0xfeed);
    }

    #[test]
    fn garbage_is_a_decode_error() {
        let err = Outcome::decode(&[1, 2, 3]).unwrap_err();
        assert!(matches!(err, CodecError::Decode(_)));
    }

    #[test]
    fn nested_enums_survive() {
        let outcome = Outcome::Failure(TaskFailure::new(FailureKind::Raised, "nope"));
        let bytes = outcome.encode().unwrap();
        assert_eq!(Outcome::decode(&bytes).unwrap(), outcome);
    }

    #[test]
    fn compression_is_lossless() {
        let payload = vec![7u8; 4096];
        let packed = compress(&payload).unwrap();
        assert!(packed.len() < payload.len());
        assert_eq!(decompress(&packed).unwrap(), payload);
    }
}
