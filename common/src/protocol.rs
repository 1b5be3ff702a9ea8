//! Wire types for the chunked upload RPC boundary, shared between the
//! capture client and the vault server.
//!
//! Every call answers with the same [`Envelope`]: `success`, optional
//! `data`, a human-readable `message`, and an optional machine-readable
//! [`ErrorCode`]. The boundary carries text only; chunk bytes travel in
//! the encoding produced by [`crate::chunker`].

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::ChannelError;
use crate::payload::MediaKind;

/// Uniform response envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope<T> {
    pub success: bool,
    pub data: Option<T>,
    #[serde(default)]
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<ErrorCode>,
}

impl<T> Envelope<T> {
    pub fn ok(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            message: String::new(),
            code: None,
        }
    }

    pub fn fail(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            message: message.into(),
            code: Some(code),
        }
    }

    /// Convert a typed result; failures carry their message but no code.
    pub fn from_result<E: std::fmt::Display>(result: Result<T, E>) -> Self {
        match result {
            Ok(data) => Self::ok(data),
            Err(e) => Self {
                success: false,
                data: None,
                message: e.to_string(),
                code: None,
            },
        }
    }

    /// The failure message, or a generic one when the server sent none.
    pub fn failure_message(&self) -> String {
        if self.message.is_empty() {
            "request failed".to_string()
        } else {
            self.message.clone()
        }
    }
}

/// Machine-readable failure classification carried in [`Envelope::code`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    UnknownUpload,
    AlreadyFinalized,
    IncompleteUpload,
    QuotaExceeded,
    InvalidMetadata,
    UnexpectedChunk,
    ChunkSizeMismatch,
    DecodeError,
    StorageError,
    NotFound,
}

/// Phase 1: open an upload session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitiateRequest {
    pub name: String,
    /// Human-readable size, e.g. `"1.2 MB"`.
    pub total_size: String,
    pub media_kind: MediaKind,
    pub is_recording: bool,
    /// Exact payload length; with `chunk_size` it fixes the chunk count.
    pub total_bytes: u64,
    pub chunk_size: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitiateData {
    pub upload_id: String,
}

/// Phase 2: append the next chunk. Call order is chunk order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppendRequest {
    pub upload_id: String,
    pub chunk: String,
}

/// Acknowledgement of one appended chunk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppendAck {
    pub chunks_received: u64,
}

/// Phase 3: close the session and persist the result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FinalizeRequest {
    pub upload_id: String,
}

/// Durable record of a finalized upload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UploadRecord {
    pub id: String,
    pub filename: String,
    /// Human-readable size, as sent at initiation.
    pub size: String,
    /// Local time, `%Y-%m-%d %H:%M:%S`.
    pub timestamp: String,
    #[serde(rename = "type")]
    pub kind: MediaKind,
    /// Path of the stored file relative to the data directory.
    pub filepath: String,
}

/// Health-check response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub uptime_secs: u64,
    pub active_uploads: usize,
}

/// Request/response channel to a remote assembler.
///
/// `Err` means the call did not complete; a delivered rejection is an
/// `Ok` envelope with `success == false`.
#[async_trait]
pub trait UploadChannel: Send + Sync {
    async fn initiate(&self, req: InitiateRequest)
        -> Result<Envelope<InitiateData>, ChannelError>;

    async fn append(&self, req: AppendRequest) -> Result<Envelope<AppendAck>, ChannelError>;

    async fn finalize(&self, req: FinalizeRequest)
        -> Result<Envelope<UploadRecord>, ChannelError>;
}

#[async_trait]
impl<C: UploadChannel + ?Sized> UploadChannel for Arc<C> {
    async fn initiate(
        &self,
        req: InitiateRequest,
    ) -> Result<Envelope<InitiateData>, ChannelError> {
        (**self).initiate(req).await
    }

    async fn append(&self, req: AppendRequest) -> Result<Envelope<AppendAck>, ChannelError> {
        (**self).append(req).await
    }

    async fn finalize(
        &self,
        req: FinalizeRequest,
    ) -> Result<Envelope<UploadRecord>, ChannelError> {
        (**self).finalize(req).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_envelope_wire_shape() {
        let ok = Envelope::ok(InitiateData {
            upload_id: "abc".into(),
        });
        let json = serde_json::to_value(&ok).unwrap();
        assert_eq!(json["success"], true);
        assert_eq!(json["data"]["uploadId"], "abc");
        assert!(json.get("code").is_none());

        let fail: Envelope<()> = Envelope::fail(ErrorCode::UnknownUpload, "Upload session invalid");
        let json = serde_json::to_value(&fail).unwrap();
        assert_eq!(json["code"], "UNKNOWN_UPLOAD");
        assert_eq!(json["data"], serde_json::Value::Null);
    }

    #[test]
    fn test_envelope_tolerates_missing_fields() {
        let env: Envelope<AppendAck> = serde_json::from_str(r#"{"success": true}"#).unwrap();
        assert!(env.success);
        assert!(env.data.is_none());
        assert_eq!(env.failure_message(), "request failed");
    }

    #[test]
    fn test_record_uses_type_key() {
        let record = UploadRecord {
            id: "1".into(),
            filename: "a.webm".into(),
            size: "0.1 MB".into(),
            timestamp: "2024-02-24 16:19:37".into(),
            kind: MediaKind::Video,
            filepath: "recordings/a.webm".into(),
        };
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["type"], "video");
        let back: UploadRecord = serde_json::from_value(json).unwrap();
        assert_eq!(back, record);
    }
}
