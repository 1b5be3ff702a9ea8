//! HTTP front end for the assembler.
//!
//! Routes:
//!   GET    /api/health             → health check
//!   POST   /api/upload/initiate    → open an upload session
//!   POST   /api/upload/append      → append the next chunk
//!   POST   /api/upload/finalize    → persist and record the upload
//!   GET    /api/uploads            → list upload records
//!   DELETE /api/uploads/{id}       → remove a record and its file
//!
//! Protocol failures are reported in the envelope with HTTP 200; only
//! transport-level problems (oversized or malformed bodies) use other
//! status codes.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use axum::extract::{DefaultBodyLimit, Path, State};
use axum::response::Json;
use axum::routing::{delete, get, post};
use axum::Router;
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;
use tracing::{info, warn};

use vault_common::protocol::{
    AppendAck, AppendRequest, Envelope, FinalizeRequest, HealthResponse, InitiateData,
    InitiateRequest, UploadRecord,
};

use crate::assembler::Assembler;
use crate::error::envelope;

/// Shared state for route handlers.
#[derive(Clone)]
struct AppState {
    assembler: Arc<Assembler>,
    start_time: Instant,
}

/// Build the router. `max_message_bytes` caps every request body.
pub fn router(assembler: Arc<Assembler>, max_message_bytes: usize) -> Router {
    let state = AppState {
        assembler,
        start_time: Instant::now(),
    };

    Router::new()
        .route("/api/health", get(health))
        .route("/api/upload/initiate", post(initiate))
        .route("/api/upload/append", post(append))
        .route("/api/upload/finalize", post(finalize))
        .route("/api/uploads", get(list_uploads))
        .route("/api/uploads/{id}", delete(delete_upload))
        .layer(DefaultBodyLimit::max(max_message_bytes))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Start the HTTP server. Blocks until shutdown.
pub async fn run(
    assembler: Arc<Assembler>,
    listen_addr: &str,
    max_message_bytes: usize,
    shutdown: Arc<AtomicBool>,
) -> anyhow::Result<()> {
    let app = router(assembler, max_message_bytes);

    let listener = TcpListener::bind(listen_addr).await?;
    info!("Vault HTTP server listening on {listen_addr}");

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            loop {
                tokio::time::sleep(std::time::Duration::from_secs(1)).await;
                if shutdown.load(Ordering::Relaxed) {
                    break;
                }
            }
        })
        .await?;

    Ok(())
}

// ── route handlers ───────────────────────────────────────────────────────

async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        uptime_secs: state.start_time.elapsed().as_secs(),
        active_uploads: state.assembler.active_count().await,
    })
}

async fn initiate(
    State(state): State<AppState>,
    Json(req): Json<InitiateRequest>,
) -> Json<Envelope<InitiateData>> {
    let result = state.assembler.initiate_upload(req).await;
    if let Err(e) = &result {
        warn!("initiate rejected: {e}");
    }
    Json(envelope(result))
}

async fn append(
    State(state): State<AppState>,
    Json(req): Json<AppendRequest>,
) -> Json<Envelope<AppendAck>> {
    let upload_id = req.upload_id.clone();
    let result = state.assembler.append_chunk(req).await;
    if let Err(e) = &result {
        warn!("append to {upload_id} rejected: {e}");
    }
    Json(envelope(result))
}

async fn finalize(
    State(state): State<AppState>,
    Json(req): Json<FinalizeRequest>,
) -> Json<Envelope<UploadRecord>> {
    let upload_id = req.upload_id.clone();
    let result = state.assembler.finalize_upload(req).await;
    if let Err(e) = &result {
        warn!("finalize of {upload_id} rejected: {e}");
    }
    Json(envelope(result))
}

async fn list_uploads(State(state): State<AppState>) -> Json<Envelope<Vec<UploadRecord>>> {
    Json(Envelope::ok(state.assembler.records().list().await))
}

async fn delete_upload(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Json<Envelope<UploadRecord>> {
    Json(envelope(state.assembler.delete_record(&id).await))
}
