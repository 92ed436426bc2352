use bincode::error::{DecodeError, EncodeError};
use thiserror::Error;

use crate::FrameId;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum CacheError {
    #[error("backend error: {0}")]
    Backend(String),
    #[error("serialization encode error: {0}")]
    Encode(String),
    #[error("serialization decode error: {0}")]
    Decode(String),
    #[error("compression error: {0}")]
    Compression(String),
    /// A cached vector does not have the length its pipeline declares.
    #[error(
        "cached embedding for frame {frame_id} under '{pipeline_id}' has dimension {actual}, expected {expected}"
    )]
    Inconsistency {
        frame_id: FrameId,
        pipeline_id: String,
        expected: usize,
        actual: usize,
    },
}

impl From<EncodeError> for CacheError {
    fn from(e: EncodeError) -> Self {
        CacheError::Encode(e.to_string())
    }
}

impl From<DecodeError> for CacheError {
    fn from(e: DecodeError) -> Self {
        CacheError::Decode(e.to_string())
    }
}

impl From<std::io::Error> for CacheError {
    fn from(e: std::io::Error) -> Self {
        CacheError::Compression(e.to_string())
    }
}

impl CacheError {
    pub fn backend<E: std::fmt::Display>(err: E) -> Self {
        Self::Backend(err.to_string())
    }
}
