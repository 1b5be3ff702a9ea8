//! Vault server – the remote assembler side of the chunked upload
//! protocol and its HTTP front end.

pub mod assembler;
pub mod error;
pub mod reclaim;
pub mod server;
pub mod store;
