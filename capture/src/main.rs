//! Vault Capture – records from local devices and uploads to a vault
//! server.
//!
//! Subcommands:
//!   record   arm the configured devices, record, stop, upload
//!   upload   upload an existing file
//!   list     print the server's upload records
//!   delete   remove an upload record and its file

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use vault_capture::device::{DeviceConstraints, EncodingOptions};
use vault_capture::ffmpeg::FfmpegBackend;
use vault_capture::http::HttpChannel;
use vault_capture::session::CaptureSession;
use vault_capture::transfer::TransferClient;
use vault_common::config::Config;
use vault_common::payload::MediaPayload;

#[derive(Parser, Debug)]
#[command(version, about)]
struct Cli {
    /// KEY=VALUE config file (defaults to /etc/vault/vault.conf if present)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Record from the configured devices, then upload as a recording
    Record {
        /// Stop after this many seconds (Ctrl-C stops early)
        #[arg(short, long, default_value_t = 10)]
        seconds: u64,
        /// Record the audio device only
        #[arg(long)]
        audio_only: bool,
        /// Override MIME_TYPE from the config
        #[arg(long)]
        mime_type: Option<String>,
    },
    /// Upload an existing media file
    Upload { file: PathBuf },
    /// List stored uploads
    List,
    /// Delete a stored upload by id
    Delete { id: String },
}

/// First Ctrl-C stops recording; once uploading it cancels the upload.
#[derive(Clone, Default)]
struct Interrupts {
    stop_recording: CancellationToken,
    cancel_upload: CancellationToken,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let cli = Cli::parse();
    let config = vault_common::config::load_or_default(cli.config.as_deref())
        .context("Config load failed")?;

    let interrupts = Interrupts::default();
    let handler = interrupts.clone();
    ctrlc::set_handler(move || {
        if handler.stop_recording.is_cancelled() {
            info!("Interrupt received, cancelling upload");
            handler.cancel_upload.cancel();
        } else {
            info!("Interrupt received, stopping recording");
            handler.stop_recording.cancel();
        }
    })
    .context("Cannot set Ctrl-C handler")?;

    match cli.command {
        Command::Record {
            seconds,
            audio_only,
            mime_type,
        } => record(&config, seconds, audio_only, mime_type, &interrupts).await,
        Command::Upload { file } => {
            interrupts.stop_recording.cancel();
            let payload = MediaPayload::from_file(&file)?;
            upload(&config, &payload, false, &interrupts.cancel_upload).await
        }
        Command::List => list(&config).await,
        Command::Delete { id } => delete(&config, &id).await,
    }
}

async fn record(
    config: &Config,
    seconds: u64,
    audio_only: bool,
    mime_type: Option<String>,
    interrupts: &Interrupts,
) -> Result<()> {
    let constraints = DeviceConstraints::from_config(config, audio_only);
    let mut options = EncodingOptions::from_config(config);
    match mime_type {
        Some(mime) => options.mime_type = mime,
        None if audio_only && !options.mime_type.starts_with("audio/") => {
            options.mime_type = "audio/webm;codecs=opus".to_string();
        }
        None => {}
    }

    let mut session = CaptureSession::new(FfmpegBackend::from_config(config));
    session.arm(&constraints).context("Cannot arm capture devices")?;
    session
        .start_recording(&options)
        .context("Cannot start recording")?;

    info!("Recording for {seconds}s (Ctrl-C to stop early)");
    tokio::select! {
        _ = tokio::time::sleep(Duration::from_secs(seconds)) => {}
        _ = interrupts.stop_recording.cancelled() => info!("Stopping early"),
    }
    interrupts.stop_recording.cancel();

    let payload = session.stop_recording().await?;
    session.disarm();

    let Some(payload) = payload else {
        warn!("Nothing was recorded; skipping upload");
        return Ok(());
    };
    upload(config, &payload, true, &interrupts.cancel_upload).await
}

async fn upload(
    config: &Config,
    payload: &MediaPayload,
    is_recording: bool,
    cancel: &CancellationToken,
) -> Result<()> {
    let channel = HttpChannel::from_config(config)?;
    match channel.health().await {
        Ok(health) => info!(
            "Server {} up for {}s ({} active upload(s))",
            channel.base_url(),
            health.uptime_secs,
            health.active_uploads
        ),
        Err(e) => warn!("Health check failed: {e}"),
    }

    let client = TransferClient::from_config(channel, config);
    let record = client
        .upload_with_cancel(
            payload,
            is_recording,
            |pct| info!("Upload progress: {pct}%"),
            cancel,
        )
        .await?;

    info!(
        "Stored {} as {} ({}, id={})",
        payload.name(),
        record.filepath,
        record.size,
        record.id
    );
    Ok(())
}

async fn list(config: &Config) -> Result<()> {
    let channel = HttpChannel::from_config(config)?;
    let envelope = channel.list_uploads().await?;
    if !envelope.success {
        bail!("List failed: {}", envelope.failure_message());
    }
    let records = envelope.data.unwrap_or_default();
    if records.is_empty() {
        println!("No uploads");
    }
    for r in records {
        println!(
            "{}  {:<5}  {:>9}  {}  {}",
            r.id, r.kind, r.size, r.timestamp, r.filepath
        );
    }
    Ok(())
}

async fn delete(config: &Config, id: &str) -> Result<()> {
    let channel = HttpChannel::from_config(config)?;
    let envelope = channel.delete_upload(id).await?;
    if !envelope.success {
        bail!("Delete failed: {}", envelope.failure_message());
    }
    info!("Deleted upload {id}");
    Ok(())
}
