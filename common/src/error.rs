//! Error types shared by the client and server sides of the upload
//! boundary.

use thiserror::Error;

/// Failure to carry a call across the RPC boundary.
///
/// This is distinct from a delivered `success: false` envelope: a
/// `ChannelError` means no well-formed response came back at all.
#[derive(Error, Debug)]
pub enum ChannelError {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("unexpected HTTP status {status} from {url}")]
    Status { status: u16, url: String },

    #[error("call timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("malformed response: {0}")]
    Malformed(String),
}

/// Failure to turn an encoded chunk back into bytes.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum DecodeError {
    #[error("data URL is missing the ';base64,' marker")]
    NotBase64DataUrl,

    #[error("invalid base64: {0}")]
    Base64(String),
}
