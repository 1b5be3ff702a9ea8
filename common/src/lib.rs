//! Types and helpers shared by the capture client and the vault server.

pub mod chunker;
pub mod config;
pub mod error;
pub mod payload;
pub mod protocol;
