//! Client side of the chunked upload: initiate, append every chunk in
//! order, finalize.
//!
//! Calls are strictly sequential. Each append waits for its
//! acknowledgement before the next one is sent, because the assembler
//! trusts call order as chunk order. Any failure abandons the remote
//! session; a new attempt starts over with a fresh upload id.

use std::future::Future;
use std::num::NonZeroUsize;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use vault_common::chunker::{self, DEFAULT_CHUNK_SIZE};
use vault_common::config::Config;
use vault_common::error::ChannelError;
use vault_common::payload::MediaPayload;
use vault_common::protocol::{
    AppendRequest, Envelope, ErrorCode, FinalizeRequest, InitiateRequest, UploadChannel,
    UploadRecord,
};

use crate::error::TransferError;

/// Room left in an append message for everything but the chunk itself.
const APPEND_OVERHEAD: usize = 512;

/// `{success, data, message}` as handed back to page-level callers.
pub type UploadOutcome = Envelope<UploadRecord>;

pub struct TransferClient<C> {
    channel: C,
    chunk_size: NonZeroUsize,
    call_timeout: Option<Duration>,
    max_message_bytes: Option<usize>,
}

impl<C: UploadChannel> TransferClient<C> {
    pub fn new(channel: C, chunk_size: NonZeroUsize) -> Self {
        Self {
            channel,
            chunk_size,
            call_timeout: None,
            max_message_bytes: None,
        }
    }

    /// A client with the default 512 KiB chunk size.
    pub fn with_default_chunks(channel: C) -> Self {
        Self::new(channel, DEFAULT_CHUNK_SIZE)
    }

    pub fn from_config(channel: C, config: &Config) -> Self {
        Self::new(channel, config.chunk_size)
            .with_call_timeout(config.call_timeout)
            .with_message_limit(config.max_message_bytes)
    }

    /// Fail any single call that takes longer than `timeout`.
    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = Some(timeout);
        self
    }

    /// Refuse chunk sizes whose encoded append would exceed `limit`.
    pub fn with_message_limit(mut self, limit: usize) -> Self {
        self.max_message_bytes = Some(limit);
        self
    }

    pub fn channel(&self) -> &C {
        &self.channel
    }

    pub fn chunk_size(&self) -> NonZeroUsize {
        self.chunk_size
    }

    /// Upload `payload`, reporting percent complete after each chunk.
    pub async fn upload(
        &self,
        payload: &MediaPayload,
        is_recording: bool,
        on_progress: impl FnMut(u8),
    ) -> Result<UploadRecord, TransferError> {
        self.upload_with_cancel(payload, is_recording, on_progress, &CancellationToken::new())
            .await
    }

    /// Like [`upload`](Self::upload), but the envelope shape callers
    /// display.
    pub async fn upload_outcome(
        &self,
        payload: &MediaPayload,
        is_recording: bool,
        on_progress: impl FnMut(u8),
    ) -> UploadOutcome {
        Envelope::from_result(self.upload(payload, is_recording, on_progress).await)
    }

    /// Upload, checking `cancel` before initiating and between chunks.
    /// An append already sent is never interrupted.
    pub async fn upload_with_cancel(
        &self,
        payload: &MediaPayload,
        is_recording: bool,
        mut on_progress: impl FnMut(u8),
        cancel: &CancellationToken,
    ) -> Result<UploadRecord, TransferError> {
        if payload.is_empty() {
            return Err(TransferError::InitiationRejected(
                "nothing to upload: payload is empty".into(),
            ));
        }
        if let Some(limit) = self.max_message_bytes {
            let needed = chunker::encoded_len(self.chunk_size.get()) + APPEND_OVERHEAD;
            if needed > limit {
                return Err(TransferError::InitiationRejected(format!(
                    "chunk size {} encodes to {needed} bytes, over the {limit} byte message limit",
                    self.chunk_size
                )));
            }
        }
        if cancel.is_cancelled() {
            return Err(TransferError::Cancelled);
        }

        let total = chunker::chunk_count(payload.len(), self.chunk_size);

        // ── phase 1: initiate ──
        let req = InitiateRequest {
            name: payload.name().to_string(),
            total_size: payload.total_size(),
            media_kind: payload.kind(),
            is_recording,
            total_bytes: payload.len() as u64,
            chunk_size: self.chunk_size.get() as u64,
        };
        let upload_id = match self.call(self.channel.initiate(req)).await {
            Err(e) => return Err(TransferError::InitiationRejected(e.to_string())),
            Ok(env) if !env.success => {
                return Err(TransferError::InitiationRejected(env.failure_message()))
            }
            Ok(env) => match env.data {
                Some(data) => data.upload_id,
                None => {
                    return Err(TransferError::InitiationRejected(
                        "server returned no upload id".into(),
                    ))
                }
            },
        };
        info!(
            "Uploading {} ({}) as {upload_id} in {total} chunk(s)",
            payload.name(),
            payload.total_size()
        );

        // ── phase 2: append, in order ──
        for chunk in chunker::chunks(payload.bytes(), self.chunk_size) {
            if cancel.is_cancelled() {
                warn!("Upload {upload_id} cancelled after {} chunk(s)", chunk.index);
                return Err(TransferError::Cancelled);
            }
            let index = chunk.index;
            let req = AppendRequest {
                upload_id: upload_id.clone(),
                chunk: chunk.encoded,
            };
            let failure = match self.call(self.channel.append(req)).await {
                Err(e) => Some(e.to_string()),
                Ok(env) if !env.success => Some(env.failure_message()),
                Ok(_) => None,
            };
            if let Some(message) = failure {
                warn!("Chunk {}/{total} of {upload_id} failed: {message}", index + 1);
                return Err(TransferError::ChunkTransferFailed {
                    index,
                    total,
                    message,
                });
            }
            let percent = progress_percent(index + 1, total);
            debug!("{upload_id}: chunk {}/{total} ({percent}%)", index + 1);
            on_progress(percent);
        }

        // ── phase 3: finalize ──
        let req = FinalizeRequest {
            upload_id: upload_id.clone(),
        };
        let record = match self.call(self.channel.finalize(req)).await {
            Err(e) => return Err(TransferError::FinalizeRejected(e.to_string())),
            Ok(env) if !env.success => {
                let message = env.failure_message();
                return Err(match env.code {
                    Some(ErrorCode::IncompleteUpload) => TransferError::IncompleteUpload(message),
                    _ => TransferError::FinalizeRejected(message),
                });
            }
            Ok(env) => env.data.ok_or_else(|| {
                TransferError::FinalizeRejected("server returned no record".into())
            })?,
        };

        info!("Upload {upload_id} stored as {} ({})", record.filename, record.size);
        Ok(record)
    }

    async fn call<T>(
        &self,
        fut: impl Future<Output = Result<Envelope<T>, ChannelError>>,
    ) -> Result<Envelope<T>, ChannelError> {
        match self.call_timeout {
            Some(limit) => tokio::time::timeout(limit, fut)
                .await
                .unwrap_or(Err(ChannelError::Timeout(limit))),
            None => fut.await,
        }
    }
}

/// `round(100 * done / total)`, saturating at 100.
pub fn progress_percent(done: usize, total: usize) -> u8 {
    if total == 0 {
        return 100;
    }
    let pct = (100 * done as u64 + total as u64 / 2) / total as u64;
    pct.min(100) as u8
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    use async_trait::async_trait;
    use vault_common::payload::MediaKind;
    use vault_common::protocol::{AppendAck, InitiateData};

    #[derive(Default)]
    struct ScriptedChannel {
        calls: Mutex<Vec<String>>,
        appended: Mutex<Vec<u8>>,
        reject_initiate: bool,
        fail_append_at: Option<usize>,
        finalize_failure: Option<ErrorCode>,
        initiate_delay: Option<Duration>,
    }

    impl ScriptedChannel {
        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }

        fn appends(&self) -> usize {
            self.calls().iter().filter(|c| *c == "append").count()
        }
    }

    #[async_trait]
    impl UploadChannel for ScriptedChannel {
        async fn initiate(
            &self,
            req: InitiateRequest,
        ) -> Result<Envelope<InitiateData>, ChannelError> {
            self.calls.lock().unwrap().push("initiate".into());
            if let Some(delay) = self.initiate_delay {
                tokio::time::sleep(delay).await;
            }
            if self.reject_initiate {
                return Ok(Envelope::fail(ErrorCode::QuotaExceeded, "quota exceeded"));
            }
            assert!(req.total_bytes > 0);
            Ok(Envelope::ok(InitiateData {
                upload_id: "up-1".into(),
            }))
        }

        async fn append(&self, req: AppendRequest) -> Result<Envelope<AppendAck>, ChannelError> {
            let n = {
                let mut calls = self.calls.lock().unwrap();
                calls.push("append".into());
                calls.iter().filter(|c| *c == "append").count()
            };
            if self.fail_append_at == Some(n) {
                return Err(ChannelError::Status {
                    status: 502,
                    url: "/api/upload/append".into(),
                });
            }
            let bytes = chunker::decode(&req.chunk).unwrap();
            self.appended.lock().unwrap().extend(bytes);
            Ok(Envelope::ok(AppendAck {
                chunks_received: n as u64,
            }))
        }

        async fn finalize(
            &self,
            req: FinalizeRequest,
        ) -> Result<Envelope<UploadRecord>, ChannelError> {
            self.calls.lock().unwrap().push("finalize".into());
            if let Some(code) = self.finalize_failure {
                return Ok(Envelope::fail(code, "finalize refused"));
            }
            Ok(Envelope::ok(UploadRecord {
                id: req.upload_id,
                filename: "clip.webm".into(),
                size: "0.0 MB".into(),
                timestamp: "2024-02-24T16:19:37Z".into(),
                kind: MediaKind::Video,
                filepath: "uploads/clip.webm".into(),
            }))
        }
    }

    fn payload(len: usize) -> MediaPayload {
        let bytes = (0..len).map(|i| (i % 251) as u8).collect();
        MediaPayload::new("clip.webm", "video/webm", bytes)
    }

    fn client(channel: Arc<ScriptedChannel>) -> TransferClient<Arc<ScriptedChannel>> {
        TransferClient::new(channel, NonZeroUsize::new(4).unwrap())
    }

    #[tokio::test]
    async fn test_upload_sends_all_chunks_in_order() {
        let channel = Arc::new(ScriptedChannel::default());
        let p = payload(10);
        let mut seen = Vec::new();

        let record = client(channel.clone())
            .upload(&p, false, |pct| seen.push(pct))
            .await
            .unwrap();

        assert_eq!(record.id, "up-1");
        assert_eq!(
            channel.calls(),
            ["initiate", "append", "append", "append", "finalize"]
        );
        assert_eq!(*channel.appended.lock().unwrap(), p.bytes());
        assert_eq!(seen, vec![33, 67, 100]);
    }

    #[tokio::test]
    async fn test_rejected_initiate_never_appends() {
        let channel = Arc::new(ScriptedChannel {
            reject_initiate: true,
            ..ScriptedChannel::default()
        });
        let err = client(channel.clone())
            .upload(&payload(10), true, |_| {})
            .await
            .unwrap_err();

        assert!(matches!(err, TransferError::InitiationRejected(ref m) if m == "quota exceeded"));
        assert_eq!(channel.calls(), ["initiate"]);
    }

    #[tokio::test]
    async fn test_failed_append_stops_transfer() {
        let channel = Arc::new(ScriptedChannel {
            fail_append_at: Some(2),
            ..ScriptedChannel::default()
        });
        let err = client(channel.clone())
            .upload(&payload(10), false, |_| {})
            .await
            .unwrap_err();

        match err {
            TransferError::ChunkTransferFailed { index, total, .. } => {
                assert_eq!((index, total), (1, 3));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(channel.appends(), 2);
        assert!(!channel.calls().contains(&"finalize".to_string()));
    }

    #[tokio::test]
    async fn test_finalize_failure_classification() {
        let incomplete = Arc::new(ScriptedChannel {
            finalize_failure: Some(ErrorCode::IncompleteUpload),
            ..ScriptedChannel::default()
        });
        let err = client(incomplete).upload(&payload(5), false, |_| {}).await.unwrap_err();
        assert!(matches!(err, TransferError::IncompleteUpload(_)));

        let other = Arc::new(ScriptedChannel {
            finalize_failure: Some(ErrorCode::StorageError),
            ..ScriptedChannel::default()
        });
        let err = client(other).upload(&payload(5), false, |_| {}).await.unwrap_err();
        assert!(matches!(err, TransferError::FinalizeRejected(_)));
    }

    #[tokio::test]
    async fn test_cancel_between_chunks() {
        let channel = Arc::new(ScriptedChannel::default());
        let token = CancellationToken::new();
        let trigger = token.clone();

        let err = client(channel.clone())
            .upload_with_cancel(&payload(10), false, |_| trigger.cancel(), &token)
            .await
            .unwrap_err();

        assert!(matches!(err, TransferError::Cancelled));
        assert_eq!(channel.calls(), ["initiate", "append"]);
    }

    #[tokio::test]
    async fn test_cancel_before_initiate() {
        let channel = Arc::new(ScriptedChannel::default());
        let token = CancellationToken::new();
        token.cancel();
        let err = client(channel.clone())
            .upload_with_cancel(&payload(10), false, |_| {}, &token)
            .await
            .unwrap_err();
        assert!(matches!(err, TransferError::Cancelled));
        assert!(channel.calls().is_empty());
    }

    #[tokio::test]
    async fn test_call_timeout_fails_the_phase() {
        let channel = Arc::new(ScriptedChannel {
            initiate_delay: Some(Duration::from_millis(500)),
            ..ScriptedChannel::default()
        });
        let err = client(channel.clone())
            .with_call_timeout(Duration::from_millis(20))
            .upload(&payload(10), false, |_| {})
            .await
            .unwrap_err();
        assert!(matches!(err, TransferError::InitiationRejected(ref m) if m.contains("timed out")));
        assert_eq!(channel.appends(), 0);
    }

    #[tokio::test]
    async fn test_refuses_before_initiating() {
        let channel = Arc::new(ScriptedChannel::default());
        let empty = MediaPayload::new("empty.webm", "video/webm", Vec::new());
        let err = client(channel.clone()).upload(&empty, false, |_| {}).await.unwrap_err();
        assert!(matches!(err, TransferError::InitiationRejected(_)));

        let err = TransferClient::with_default_chunks(channel.clone())
            .with_message_limit(64 * 1024)
            .upload(&payload(10), false, |_| {})
            .await
            .unwrap_err();
        assert!(matches!(err, TransferError::InitiationRejected(_)));
        assert!(channel.calls().is_empty());
    }

    #[tokio::test]
    async fn test_upload_outcome_envelope() {
        let channel = Arc::new(ScriptedChannel {
            reject_initiate: true,
            ..ScriptedChannel::default()
        });
        let outcome = client(channel).upload_outcome(&payload(3), false, |_| {}).await;
        assert!(!outcome.success);
        assert!(outcome.data.is_none());
        assert!(outcome.message.contains("quota exceeded"));
    }

    #[test]
    fn test_progress_percent() {
        assert_eq!(progress_percent(1, 3), 33);
        assert_eq!(progress_percent(2, 3), 67);
        assert_eq!(progress_percent(3, 3), 100);
        assert_eq!(progress_percent(1, 8), 13);
        assert_eq!(progress_percent(0, 0), 100);
    }
}
