//! Vault Server – receives chunked uploads and stores finished media.
//!
//! This binary:
//! 1. Reads configuration from `vault.conf`
//! 2. Opens the assembler and clears stale staging files
//! 3. Starts the abandoned-session sweeper
//! 4. Runs the axum HTTP server until Ctrl-C

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::info;

use vault_common::config::Config;
use vault_server::assembler::{Assembler, AssemblerSettings};
use vault_server::{reclaim, server};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    // ── load config ──────────────────────────────────────────────────
    let config_path = std::env::args().nth(1).map(PathBuf::from);
    let config = vault_common::config::load_or_default(config_path.as_deref())
        .context("Config load failed")?;

    info!(
        "Vault Server starting (listen={}, data={})",
        config.listen_addr,
        config.data_dir.display()
    );

    // ── assembler ────────────────────────────────────────────────────
    let assembler = Arc::new(
        Assembler::open(AssemblerSettings::from(&config))
            .await
            .context("Cannot open assembler")?,
    );
    assembler
        .sweep_staging()
        .await
        .context("Cannot sweep staging directory")?;

    // ── ctrl-c ───────────────────────────────────────────────────────
    let shutdown = Arc::new(AtomicBool::new(false));
    let shutdown_signal = shutdown.clone();
    ctrlc::set_handler(move || {
        shutdown_signal.store(true, Ordering::Relaxed);
        info!("Shutdown signal received");
    })
    .context("Cannot set Ctrl-C handler")?;

    // ── reclaim abandoned sessions ───────────────────────────────────
    let reclaimer = reclaim::spawn(assembler.clone(), config.reclaim_interval, shutdown.clone());

    // ── HTTP server (runs until shutdown) ────────────────────────────
    run_server(&config, assembler, shutdown).await?;

    reclaimer.abort();
    info!("Vault Server stopped");
    Ok(())
}

async fn run_server(
    config: &Config,
    assembler: Arc<Assembler>,
    shutdown: Arc<AtomicBool>,
) -> Result<()> {
    server::run(
        assembler,
        &config.listen_addr,
        config.max_message_bytes,
        shutdown,
    )
    .await
    .context("HTTP server error")
}
