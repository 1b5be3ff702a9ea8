//! Assembler error type and its mapping onto wire error codes.

use thiserror::Error;

use vault_common::error::DecodeError;
use vault_common::protocol::{Envelope, ErrorCode};

#[derive(Error, Debug)]
pub enum AssemblyError {
    #[error("Upload session invalid: {0}")]
    UnknownUpload(String),

    #[error("Upload {0} was already finalized")]
    AlreadyFinalized(String),

    #[error("Upload incomplete: received {received} of {expected} chunks")]
    Incomplete { received: u64, expected: u64 },

    #[error("Upload of {size} bytes exceeds the {limit}-byte limit")]
    QuotaExceeded { size: u64, limit: u64 },

    #[error("Invalid upload metadata: {0}")]
    InvalidMetadata(String),

    #[error("Unexpected chunk: all {expected} chunks were already received")]
    UnexpectedChunk { expected: u64 },

    #[error("Chunk {index} is {actual} bytes, expected {expected}")]
    ChunkSizeMismatch { index: u64, actual: u64, expected: u64 },

    #[error("Cannot decode chunk: {0}")]
    Decode(#[from] DecodeError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Record not found: {0}")]
    NotFound(String),
}

impl AssemblyError {
    pub fn code(&self) -> ErrorCode {
        match self {
            AssemblyError::UnknownUpload(_) => ErrorCode::UnknownUpload,
            AssemblyError::AlreadyFinalized(_) => ErrorCode::AlreadyFinalized,
            AssemblyError::Incomplete { .. } => ErrorCode::IncompleteUpload,
            AssemblyError::QuotaExceeded { .. } => ErrorCode::QuotaExceeded,
            AssemblyError::InvalidMetadata(_) => ErrorCode::InvalidMetadata,
            AssemblyError::UnexpectedChunk { .. } => ErrorCode::UnexpectedChunk,
            AssemblyError::ChunkSizeMismatch { .. } => ErrorCode::ChunkSizeMismatch,
            AssemblyError::Decode(_) => ErrorCode::DecodeError,
            AssemblyError::Io(_) | AssemblyError::Serialization(_) => ErrorCode::StorageError,
            AssemblyError::NotFound(_) => ErrorCode::NotFound,
        }
    }
}

/// Wrap an assembler result in the uniform response envelope.
pub fn envelope<T>(result: Result<T, AssemblyError>) -> Envelope<T> {
    match result {
        Ok(data) => Envelope::ok(data),
        Err(e) => Envelope::fail(e.code(), e.to_string()),
    }
}

/// Result type alias using AssemblyError
pub type AssemblyResult<T> = Result<T, AssemblyError>;
