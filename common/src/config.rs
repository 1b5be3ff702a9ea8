//! Configuration parsing – reads a KEY=VALUE file (`vault.conf`).
//!
//! The capture client and the vault server load the same file; each
//! ignores the fields it does not need.

use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::info;

use crate::chunker::DEFAULT_CHUNK_SIZE;

/// Application configuration, shared between the capture client and the
/// vault server.
#[derive(Debug, Clone)]
pub struct Config {
    // ── network (client ↔ server) ────────────────────────────────────
    /// Address the vault HTTP server listens on.
    pub listen_addr: String,
    /// URL the capture client uses to reach the vault server.
    pub server_url: String,
    /// Ceiling on a single RPC request body, in bytes.
    pub max_message_bytes: usize,
    /// Per-call timeout applied by the client to each protocol phase.
    pub call_timeout: Duration,

    // ── storage (server) ─────────────────────────────────────────────
    pub data_dir: PathBuf,
    pub uploads_dir: PathBuf,
    pub recordings_dir: PathBuf,
    pub staging_dir: PathBuf,
    pub max_file_size: u64,
    /// Idle time after which an unfinished upload session is reclaimed.
    pub session_ttl: Duration,
    pub reclaim_interval: Duration,

    // ── transfer (client) ────────────────────────────────────────────
    pub chunk_size: NonZeroUsize,

    // ── capture (client) ─────────────────────────────────────────────
    pub video_device: Option<String>,
    pub audio_device: Option<String>,
    pub video_input_format: String,
    pub audio_input_format: String,
    pub video_width: u32,
    pub video_height: u32,
    pub frame_rate: u32,
    pub mime_type: String,
    pub video_bitrate: u32,
}

impl Config {
    /// Default config path.
    pub fn default_path() -> &'static str {
        "/etc/vault/vault.conf"
    }

    /// Location of the upload record index.
    pub fn records_path(&self) -> PathBuf {
        self.data_dir.join("uploads.json")
    }
}

impl Default for Config {
    fn default() -> Self {
        from_map(&HashMap::new())
    }
}

/// Parse a `KEY=VALUE` configuration file.
///
/// Lines starting with `#` are comments.  Values may be optionally
/// double-quoted.  Unknown keys are silently ignored.
pub fn load(path: &Path) -> Result<Config> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("Cannot read config: {}", path.display()))?;

    let map = parse_conf(&text);
    let mut config = from_map(&map);
    if let Some(v) = map.get("CHUNK_SIZE").filter(|v| !v.is_empty()) {
        let n: usize = v
            .parse()
            .with_context(|| format!("CHUNK_SIZE is not a number: {v}"))?;
        config.chunk_size = NonZeroUsize::new(n).context("CHUNK_SIZE must be greater than zero")?;
    }
    info!("Loaded config from {}", path.display());
    Ok(config)
}

/// Load `path` if given, otherwise fall back to the default path, and to
/// built-in defaults when the default file does not exist.
pub fn load_or_default(path: Option<&Path>) -> Result<Config> {
    match path {
        Some(p) => load(p),
        None => {
            let default = Path::new(Config::default_path());
            if default.exists() {
                load(default)
            } else {
                info!("No config at {} – using defaults", default.display());
                Ok(Config::default())
            }
        }
    }
}

/// Build a config from parsed keys. `CHUNK_SIZE` is validated by [`load`].
fn from_map(map: &HashMap<String, String>) -> Config {
    let get = |key: &str| -> Option<String> { map.get(key).filter(|v| !v.is_empty()).cloned() };
    let get_u64 = |key: &str, default: u64| -> u64 {
        get(key).and_then(|v| v.parse().ok()).unwrap_or(default)
    };
    let get_u32 = |key: &str, default: u32| -> u32 {
        get(key).and_then(|v| v.parse().ok()).unwrap_or(default)
    };

    let data_dir = PathBuf::from(get("DATA_DIR").unwrap_or_else(|| "/data/vault".into()));
    let uploads_dir = get("UPLOADS_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|| data_dir.join("uploads"));
    let recordings_dir = get("RECORDINGS_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|| data_dir.join("recordings"));
    let staging_dir = get("STAGING_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|| data_dir.join("staging"));

    Config {
        listen_addr: get("LISTEN_ADDR").unwrap_or_else(|| "0.0.0.0:8090".into()),
        server_url: get("SERVER_URL")
            .unwrap_or_else(|| "http://localhost:8090".into())
            .trim_end_matches('/')
            .to_string(),
        max_message_bytes: get_u64("MAX_MESSAGE_BYTES", 1024 * 1024) as usize,
        call_timeout: Duration::from_secs(get_u64("CALL_TIMEOUT_SECS", 30)),

        data_dir,
        uploads_dir,
        recordings_dir,
        staging_dir,
        max_file_size: get_u64("MAX_FILE_SIZE", 500 * 1024 * 1024),
        session_ttl: Duration::from_secs(get_u64("SESSION_TTL_SECS", 3600)),
        reclaim_interval: Duration::from_secs(get_u64("RECLAIM_INTERVAL_SECS", 300).max(1)),

        chunk_size: DEFAULT_CHUNK_SIZE,

        video_device: get("VIDEO_DEVICE"),
        audio_device: get("AUDIO_DEVICE"),
        video_input_format: get("VIDEO_INPUT_FORMAT").unwrap_or_else(|| "v4l2".into()),
        audio_input_format: get("AUDIO_INPUT_FORMAT").unwrap_or_else(|| "alsa".into()),
        video_width: get_u32("VIDEO_WIDTH", 1280),
        video_height: get_u32("VIDEO_HEIGHT", 720),
        frame_rate: get_u32("FRAME_RATE", 30),
        mime_type: get("MIME_TYPE").unwrap_or_else(|| "video/webm;codecs=vp9".into()),
        video_bitrate: get_u32("VIDEO_BITRATE", 2_500_000),
    }
}

/// Parse `KEY=VALUE` lines into a map, stripping optional double-quotes.
fn parse_conf(text: &str) -> HashMap<String, String> {
    let mut map = HashMap::new();
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if let Some((key, val)) = line.split_once('=') {
            let key = key.trim();
            let val = val.trim().trim_matches('"');
            map.insert(key.to_string(), val.to_string());
        }
    }
    map
}

// ─── tests ───────────────────────────────────────────────────────────────
