//! Capture-time and transfer-time error types.

use thiserror::Error;

use crate::session::CaptureState;

/// Errors raised while acquiring devices or driving a recorder.
#[derive(Error, Debug)]
pub enum CaptureError {
    #[error("Device unavailable: {0}")]
    DeviceUnavailable(String),

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Unsupported encoding: {0}")]
    UnsupportedEncoding(String),

    #[error("Capture session is already armed")]
    AlreadyArmed,

    #[error("Cannot {op} while {from}")]
    InvalidState {
        op: &'static str,
        from: CaptureState,
    },

    #[error("Recorder error: {0}")]
    Recorder(String),
}

/// Errors raised by the three-phase upload. None of them is retried
/// automatically: a failed transfer restarts from `initiate`.
#[derive(Error, Debug)]
pub enum TransferError {
    #[error("Upload initiation rejected: {0}")]
    InitiationRejected(String),

    #[error("Chunk {} of {total} failed: {message}", .index + 1)]
    ChunkTransferFailed {
        index: usize,
        total: usize,
        message: String,
    },

    #[error("Upload incomplete: {0}")]
    IncompleteUpload(String),

    #[error("Upload finalize rejected: {0}")]
    FinalizeRejected(String),

    #[error("Upload cancelled")]
    Cancelled,
}
