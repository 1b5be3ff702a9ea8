//! Vault capture client – records media from local devices and uploads it
//! to a vault server through the chunked upload protocol.

pub mod device;
pub mod error;
pub mod ffmpeg;
pub mod http;
pub mod session;
pub mod transfer;
