//! End-to-end uploads: transfer client against a real assembler, both
//! in-process and over HTTP.

use std::num::NonZeroUsize;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;

use vault_capture::error::TransferError;
use vault_capture::http::HttpChannel;
use vault_capture::transfer::TransferClient;
use vault_common::payload::{MediaKind, MediaPayload};
use vault_server::assembler::{Assembler, AssemblerSettings};
use vault_server::server::router;

const MAX_MESSAGE_BYTES: usize = 1024 * 1024;

async fn assembler(root: &Path) -> Arc<Assembler> {
    Arc::new(
        Assembler::open(AssemblerSettings::under(root))
            .await
            .unwrap(),
    )
}

fn media(name: &str, mime: &str, len: usize, seed: u8) -> MediaPayload {
    let bytes = (0..len)
        .map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed))
        .collect();
    MediaPayload::new(name, mime, bytes)
}

/// Serve the router on an ephemeral port and return its base URL.
async fn serve(asm: Arc<Assembler>, limit: usize) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router(asm, limit)).await.unwrap();
    });
    format!("http://{addr}")
}

#[tokio::test]
async fn test_recording_reassembles_exactly() {
    let dir = tempfile::tempdir().unwrap();
    let asm = assembler(dir.path()).await;
    let payload = media("evidence.webm", "video/webm", 1_300_000, 7);

    let client = TransferClient::with_default_chunks(asm.clone());
    let mut progress = Vec::new();
    let record = client
        .upload(&payload, true, |pct| progress.push(pct))
        .await
        .unwrap();

    assert_eq!(progress, vec![33, 67, 100]);
    assert_eq!(record.filename, "evidence.webm");
    assert_eq!(record.kind, MediaKind::Video);
    assert_eq!(record.size, "1.2 MB");
    let stored = std::fs::read(dir.path().join(&record.filepath)).unwrap();
    assert_eq!(stored.len(), 1_300_000);
    assert_eq!(stored, payload.bytes());
    assert!(record.filepath.starts_with("recordings"));

    assert_eq!(asm.records().list().await, vec![record]);
    assert_eq!(asm.active_count().await, 0);
}

#[tokio::test]
async fn test_concurrent_uploads_stay_separate() {
    let dir = tempfile::tempdir().unwrap();
    let asm = assembler(dir.path()).await;
    let chunk = NonZeroUsize::new(1000).unwrap();
    let a = media("a.webm", "video/webm", 25_500, 1);
    let b = media("b.wav", "audio/wav", 17_250, 2);

    let client_a = TransferClient::new(asm.clone(), chunk);
    let client_b = TransferClient::new(asm.clone(), chunk);
    let (ra, rb) = tokio::join!(
        client_a.upload(&a, false, |_| {}),
        client_b.upload(&b, false, |_| {}),
    );
    let (ra, rb) = (ra.unwrap(), rb.unwrap());

    assert_ne!(ra.id, rb.id);
    assert_eq!(rb.kind, MediaKind::Audio);
    assert_eq!(std::fs::read(dir.path().join(&ra.filepath)).unwrap(), a.bytes());
    assert_eq!(std::fs::read(dir.path().join(&rb.filepath)).unwrap(), b.bytes());
}

#[tokio::test]
async fn test_name_collision_keeps_both_files() {
    let dir = tempfile::tempdir().unwrap();
    let asm = assembler(dir.path()).await;
    let client = TransferClient::new(asm.clone(), NonZeroUsize::new(64).unwrap());

    let first = media("clip.webm", "video/webm", 100, 3);
    let second = media("clip.webm", "video/webm", 200, 4);
    let r1 = client.upload(&first, false, |_| {}).await.unwrap();
    let r2 = client.upload(&second, false, |_| {}).await.unwrap();

    assert_ne!(r1.filepath, r2.filepath);
    assert_eq!(std::fs::read(dir.path().join(&r1.filepath)).unwrap(), first.bytes());
    assert_eq!(std::fs::read(dir.path().join(&r2.filepath)).unwrap(), second.bytes());
}

#[tokio::test]
async fn test_http_upload_list_delete() {
    let dir = tempfile::tempdir().unwrap();
    let asm = assembler(dir.path()).await;
    let base_url = serve(asm.clone(), MAX_MESSAGE_BYTES).await;

    let channel = HttpChannel::new(&base_url, Duration::from_secs(10)).unwrap();
    let health = channel.health().await.unwrap();
    assert_eq!(health.status, "ok");

    let payload = media("upload.mp4", "video/mp4", 1_300_000, 9);
    let client = TransferClient::with_default_chunks(channel)
        .with_message_limit(MAX_MESSAGE_BYTES)
        .with_call_timeout(Duration::from_secs(10));
    let record = client.upload(&payload, false, |_| {}).await.unwrap();

    let stored = std::fs::read(dir.path().join(&record.filepath)).unwrap();
    assert_eq!(stored, payload.bytes());
    assert!(record.filepath.starts_with("uploads"));

    let listed = client.channel().list_uploads().await.unwrap();
    assert!(listed.success);
    assert_eq!(listed.data.unwrap(), vec![record.clone()]);

    let deleted = client.channel().delete_upload(&record.id).await.unwrap();
    assert!(deleted.success);
    assert!(!dir.path().join(&record.filepath).exists());

    let missing = client.channel().delete_upload(&record.id).await.unwrap();
    assert!(!missing.success);
    assert!(client.channel().list_uploads().await.unwrap().data.unwrap().is_empty());
}

#[tokio::test]
async fn test_http_oversized_chunk_fails_first_append() {
    let dir = tempfile::tempdir().unwrap();
    let asm = assembler(dir.path()).await;
    let base_url = serve(asm.clone(), 64 * 1024).await;

    let channel = HttpChannel::new(&base_url, Duration::from_secs(10)).unwrap();
    let client = TransferClient::with_default_chunks(channel);
    let err = client
        .upload(&media("big.webm", "video/webm", 600_000, 5), false, |_| {})
        .await
        .unwrap_err();

    match err {
        TransferError::ChunkTransferFailed { index, total, .. } => {
            assert_eq!((index, total), (0, 2));
        }
        other => panic!("unexpected error: {other}"),
    }
    // The session is left for the reclaimer.
    assert_eq!(asm.active_count().await, 1);
    assert!(asm.records().list().await.is_empty());
}
