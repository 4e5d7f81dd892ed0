//! Schema-versioned binary codec for cache values stored outside memory.
//!
//! Grounded on the teacher's bincode cache codec: values are serialized with
//! `bincode` and tagged with a schema version so a store can refuse to
//! decode an entry written by an incompatible version instead of panicking
//! on garbage bytes.

use serde::{Deserialize, Serialize};
use thiserror::Error;

const CURRENT_SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("failed to encode value: {0}")]
    Encode(String),
    #[error("failed to decode value: {0}")]
    Decode(String),
    #[error("schema version {found} is incompatible with current version {current}")]
    VersionMismatch { found: u32, current: u32 },
}

pub type CodecResult<T> = Result<T, CodecError>;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Envelope {
    version: u32,
    payload: Vec<u8>,
}

/// Encodes/decodes values for stores that persist bytes rather than live
/// objects (the sled-backed remote tier).
pub struct BincodeCodec;

impl BincodeCodec {
    pub fn encode<T: Serialize>(value: &T) -> CodecResult<Vec<u8>> {
        let payload =
            bincode::serialize(value).map_err(|e| CodecError::Encode(e.to_string()))?;
        let envelope = Envelope {
            version: CURRENT_SCHEMA_VERSION,
            payload,
        };
        bincode::serialize(&envelope).map_err(|e| CodecError::Encode(e.to_string()))
    }

    pub fn decode<T: for<'de> Deserialize<'de>>(bytes: &[u8]) -> CodecResult<T> {
        let envelope: Envelope =
            bincode::deserialize(bytes).map_err(|e| CodecError::Decode(e.to_string()))?;
        if envelope.version != CURRENT_SCHEMA_VERSION {
            return Err(CodecError::VersionMismatch {
                found: envelope.version,
                current: CURRENT_SCHEMA_VERSION,
            });
        }
        bincode::deserialize(&envelope.payload).map_err(|e| CodecError::Decode(e.to_string()))
    }
}
