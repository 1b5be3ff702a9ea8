//! Remote assembler – per-upload staging state for the chunked upload
//! protocol.
//!
//! `initiate_upload` opens a staging file under a fresh UUID,
//! `append_chunk` decodes a chunk and writes it at the end of that file, and
//! `finalize_upload` checks the counts, moves the file into its final
//! directory and records it. Chunks carry no index: call order is chunk
//! order.
//!
//! The [`UploadChannel`] impl wraps the same three calls in envelopes, so
//! `Arc<Assembler>` can be handed straight to a transfer client.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::fs::File;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use vault_common::chunker;
use vault_common::config::Config;
use vault_common::error::ChannelError;
use vault_common::payload::MediaKind;
use vault_common::protocol::{
    AppendAck, AppendRequest, Envelope, FinalizeRequest, InitiateData, InitiateRequest,
    UploadChannel, UploadRecord,
};

use crate::error::{envelope, AssemblyError, AssemblyResult};
use crate::store::RecordStore;

/// Prefix of in-flight staging files.
const STAGING_PREFIX: &str = "temp_";

/// Finalized ids remembered for duplicate-finalize detection.
const FINALIZED_MEMORY: usize = 10_000;

/// Directories and limits the assembler works with.
#[derive(Debug, Clone)]
pub struct AssemblerSettings {
    pub data_dir: PathBuf,
    pub staging_dir: PathBuf,
    pub uploads_dir: PathBuf,
    pub recordings_dir: PathBuf,
    pub records_path: PathBuf,
    pub max_file_size: u64,
    pub session_ttl: Duration,
}

impl AssemblerSettings {
    /// Everything under one root, with default limits. Used by tests and
    /// embedded setups.
    pub fn under(root: &Path) -> Self {
        Self {
            data_dir: root.to_path_buf(),
            staging_dir: root.join("staging"),
            uploads_dir: root.join("uploads"),
            recordings_dir: root.join("recordings"),
            records_path: root.join("uploads.json"),
            max_file_size: 500 * 1024 * 1024,
            session_ttl: Duration::from_secs(3600),
        }
    }
}

impl From<&Config> for AssemblerSettings {
    fn from(config: &Config) -> Self {
        Self {
            data_dir: config.data_dir.clone(),
            staging_dir: config.staging_dir.clone(),
            uploads_dir: config.uploads_dir.clone(),
            recordings_dir: config.recordings_dir.clone(),
            records_path: config.records_path(),
            max_file_size: config.max_file_size,
            session_ttl: config.session_ttl,
        }
    }
}

/// Server-side view of one in-progress upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadSession {
    pub upload_id: String,
    pub original_name: String,
    pub total_size: String,
    pub media_kind: MediaKind,
    pub is_recording: bool,
    pub total_bytes: u64,
    pub chunk_size: u64,
    pub chunks_expected: u64,
    pub chunks_received: u64,
    pub bytes_received: u64,
}

struct InFlight {
    session: UploadSession,
    /// `None` once the session has been finalized.
    file: Option<File>,
    staging_path: PathBuf,
    last_activity: Instant,
    /// Set when the reclaimer dropped the session under a caller's feet.
    reclaimed: bool,
}

type SessionHandle = Arc<Mutex<InFlight>>;

pub struct Assembler {
    settings: AssemblerSettings,
    sessions: Mutex<HashMap<String, SessionHandle>>,
    finalized: Mutex<HashSet<String>>,
    store: RecordStore,
}

impl Assembler {
    /// Create the working directories and open the record store.
    pub async fn open(settings: AssemblerSettings) -> AssemblyResult<Self> {
        for dir in [
            &settings.staging_dir,
            &settings.uploads_dir,
            &settings.recordings_dir,
        ] {
            tokio::fs::create_dir_all(dir).await?;
        }
        let store = RecordStore::open(&settings.records_path).await?;
        Ok(Self {
            settings,
            sessions: Mutex::new(HashMap::new()),
            finalized: Mutex::new(HashSet::new()),
            store,
        })
    }

    pub fn settings(&self) -> &AssemblerSettings {
        &self.settings
    }

    pub fn records(&self) -> &RecordStore {
        &self.store
    }

    /// Phase 1: allocate a session and its staging file.
    pub async fn initiate_upload(&self, req: InitiateRequest) -> AssemblyResult<InitiateData> {
        let name = sanitize_filename(&req.name);
        if name.is_empty() {
            return Err(AssemblyError::InvalidMetadata("empty file name".into()));
        }
        if req.total_bytes == 0 {
            return Err(AssemblyError::InvalidMetadata("empty upload".into()));
        }
        if req.chunk_size == 0 {
            return Err(AssemblyError::InvalidMetadata("zero chunk size".into()));
        }
        if req.total_bytes > self.settings.max_file_size {
            return Err(AssemblyError::QuotaExceeded {
                size: req.total_bytes,
                limit: self.settings.max_file_size,
            });
        }

        let upload_id = uuid::Uuid::new_v4().to_string();
        let staging_path = self
            .settings
            .staging_dir
            .join(format!("{STAGING_PREFIX}{upload_id}"));
        tokio::fs::create_dir_all(&self.settings.staging_dir).await?;
        let file = File::create(&staging_path).await?;

        let session = UploadSession {
            upload_id: upload_id.clone(),
            original_name: name,
            total_size: req.total_size,
            media_kind: req.media_kind,
            is_recording: req.is_recording,
            total_bytes: req.total_bytes,
            chunk_size: req.chunk_size,
            chunks_expected: req.total_bytes.div_ceil(req.chunk_size),
            chunks_received: 0,
            bytes_received: 0,
        };
        info!(
            "Upload {} initiated: {} ({} bytes, {} chunk(s), {})",
            upload_id,
            session.original_name,
            session.total_bytes,
            session.chunks_expected,
            session.media_kind
        );

        let in_flight = InFlight {
            session,
            file: Some(file),
            staging_path,
            last_activity: Instant::now(),
            reclaimed: false,
        };
        self.sessions
            .lock()
            .await
            .insert(upload_id.clone(), Arc::new(Mutex::new(in_flight)));

        Ok(InitiateData { upload_id })
    }

    /// Phase 2: decode one chunk and append it to the staging file.
    pub async fn append_chunk(&self, req: AppendRequest) -> AssemblyResult<AppendAck> {
        let handle = self.lookup(&req.upload_id).await?;
        Self::append_to(&handle, req).await
    }

    /// The handle may have been reclaimed between lookup and lock.
    async fn append_to(handle: &SessionHandle, req: AppendRequest) -> AssemblyResult<AppendAck> {
        let mut guard = handle.lock().await;
        let in_flight = &mut *guard;
        if in_flight.reclaimed {
            return Err(AssemblyError::UnknownUpload(req.upload_id));
        }
        let Some(file) = in_flight.file.as_mut() else {
            return Err(AssemblyError::AlreadyFinalized(req.upload_id));
        };
        let session = &mut in_flight.session;

        let bytes = chunker::decode(&req.chunk)?;
        let index = session.chunks_received;
        let expected = chunker::expected_chunk_len(session.total_bytes, session.chunk_size, index)
            .ok_or(AssemblyError::UnexpectedChunk {
                expected: session.chunks_expected,
            })?;
        if bytes.len() as u64 != expected {
            return Err(AssemblyError::ChunkSizeMismatch {
                index,
                actual: bytes.len() as u64,
                expected,
            });
        }

        file.write_all(&bytes).await?;
        session.chunks_received += 1;
        session.bytes_received += bytes.len() as u64;
        in_flight.last_activity = Instant::now();
        debug!(
            "Upload {}: chunk {}/{} ({} bytes)",
            session.upload_id,
            session.chunks_received,
            session.chunks_expected,
            bytes.len()
        );

        Ok(AppendAck {
            chunks_received: session.chunks_received,
        })
    }

    /// Phase 3: verify completeness, move the staged bytes into place and
    /// write the upload record.
    pub async fn finalize_upload(&self, req: FinalizeRequest) -> AssemblyResult<UploadRecord> {
        let handle = self.lookup(&req.upload_id).await?;
        let mut in_flight = handle.lock().await;
        if in_flight.reclaimed {
            return Err(AssemblyError::UnknownUpload(req.upload_id));
        }
        if in_flight.file.is_none() {
            return Err(AssemblyError::AlreadyFinalized(req.upload_id));
        }

        let session = in_flight.session.clone();
        if session.chunks_received < session.chunks_expected
            || session.bytes_received != session.total_bytes
        {
            warn!(
                "Upload {} finalized early: {}/{} chunks, {}/{} bytes",
                session.upload_id,
                session.chunks_received,
                session.chunks_expected,
                session.bytes_received,
                session.total_bytes
            );
            return Err(AssemblyError::Incomplete {
                received: session.chunks_received,
                expected: session.chunks_expected,
            });
        }

        // From here on the session is closed, whatever happens below.
        let file = in_flight.file.take();
        self.sessions.lock().await.remove(&session.upload_id);
        self.remember_finalized(&session.upload_id).await;

        let target_dir = if session.is_recording {
            &self.settings.recordings_dir
        } else {
            &self.settings.uploads_dir
        };
        let placed: std::io::Result<PathBuf> = async {
            if let Some(mut file) = file {
                file.flush().await?;
                file.sync_all().await?;
            }
            place(&in_flight.staging_path, target_dir, &session.original_name).await
        }
        .await;
        let final_path = match placed {
            Ok(path) => path,
            Err(e) => {
                warn!("Upload {} could not be stored: {e}", session.upload_id);
                discard(&in_flight.staging_path).await;
                return Err(e.into());
            }
        };

        let filename = final_path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| session.original_name.clone());
        let filepath = final_path
            .strip_prefix(&self.settings.data_dir)
            .unwrap_or(&final_path)
            .to_string_lossy()
            .to_string();
        let record = UploadRecord {
            id: uuid::Uuid::new_v4().to_string(),
            filename,
            size: session.total_size.clone(),
            timestamp: chrono::Local::now().format("%Y-%m-%d %H:%M:%S").to_string(),
            kind: session.media_kind,
            filepath,
        };
        if let Err(e) = self.store.add(record.clone()).await {
            warn!("Upload {} could not be recorded: {e}", session.upload_id);
            discard(&final_path).await;
            return Err(e);
        }

        info!(
            "Upload {} finalized → {} ({} bytes)",
            session.upload_id,
            final_path.display(),
            session.bytes_received
        );
        Ok(record)
    }

    /// Delete an upload record and its stored file.
    pub async fn delete_record(&self, id: &str) -> AssemblyResult<UploadRecord> {
        let record = self
            .store
            .remove(id)
            .await?
            .ok_or_else(|| AssemblyError::NotFound(id.to_string()))?;

        let path = self.settings.data_dir.join(&record.filepath);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => info!("Deleted {}", path.display()),
            Err(e) => warn!("Failed to delete stored file {}: {e}", path.display()),
        }
        Ok(record)
    }

    /// Snapshot of an in-flight session.
    pub async fn session(&self, upload_id: &str) -> Option<UploadSession> {
        let handle = self.sessions.lock().await.get(upload_id).cloned()?;
        let in_flight = handle.lock().await;
        Some(in_flight.session.clone())
    }

    pub async fn active_count(&self) -> usize {
        self.sessions.lock().await.len()
    }

    /// Drop sessions idle for longer than the configured TTL and delete
    /// their staging files. Sessions busy in a call are skipped.
    pub async fn reclaim_idle(&self) -> usize {
        self.reclaim_older_than(self.settings.session_ttl).await
    }

    pub async fn reclaim_older_than(&self, ttl: Duration) -> usize {
        let mut stale = Vec::new();
        {
            let mut sessions = self.sessions.lock().await;
            sessions.retain(|id, handle| {
                let Ok(mut in_flight) = handle.try_lock() else {
                    return true;
                };
                if in_flight.last_activity.elapsed() < ttl {
                    return true;
                }
                in_flight.reclaimed = true;
                stale.push((id.clone(), in_flight.staging_path.clone()));
                false
            });
        }

        for (id, path) in &stale {
            info!("Reclaiming abandoned upload {id}");
            if let Err(e) = tokio::fs::remove_file(path).await {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!("Cannot remove staging file {}: {e}", path.display());
                }
            }
        }
        stale.len()
    }

    /// Remove staging files that no live session owns, e.g. after a crash.
    pub async fn sweep_staging(&self) -> AssemblyResult<usize> {
        let live: HashSet<String> = self.sessions.lock().await.keys().cloned().collect();
        let mut removed = 0;
        let mut entries = tokio::fs::read_dir(&self.settings.staging_dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().to_string();
            let Some(id) = name.strip_prefix(STAGING_PREFIX) else {
                continue;
            };
            if live.contains(id) {
                continue;
            }
            match tokio::fs::remove_file(entry.path()).await {
                Ok(()) => removed += 1,
                Err(e) => warn!("Cannot remove stray staging file {name}: {e}"),
            }
        }
        if removed > 0 {
            info!("Removed {removed} stray staging file(s)");
        }
        Ok(removed)
    }

    async fn lookup(&self, upload_id: &str) -> AssemblyResult<SessionHandle> {
        if let Some(handle) = self.sessions.lock().await.get(upload_id) {
            return Ok(handle.clone());
        }
        if self.finalized.lock().await.contains(upload_id) {
            Err(AssemblyError::AlreadyFinalized(upload_id.to_string()))
        } else {
            Err(AssemblyError::UnknownUpload(upload_id.to_string()))
        }
    }

    async fn remember_finalized(&self, upload_id: &str) {
        let mut finalized = self.finalized.lock().await;
        // Prevent unbounded growth
        if finalized.len() >= FINALIZED_MEMORY {
            finalized.clear();
        }
        finalized.insert(upload_id.to_string());
    }
}

/// The assembler doubles as an in-process channel.
#[async_trait]
impl UploadChannel for Assembler {
    async fn initiate(
        &self,
        req: InitiateRequest,
    ) -> Result<Envelope<InitiateData>, ChannelError> {
        Ok(envelope(Assembler::initiate_upload(self, req).await))
    }

    async fn append(&self, req: AppendRequest) -> Result<Envelope<AppendAck>, ChannelError> {
        Ok(envelope(Assembler::append_chunk(self, req).await))
    }

    async fn finalize(
        &self,
        req: FinalizeRequest,
    ) -> Result<Envelope<UploadRecord>, ChannelError> {
        Ok(envelope(Assembler::finalize_upload(self, req).await))
    }
}

/// Keep only `[A-Za-z0-9_.-]`, replacing everything else with `_`, after
/// stripping any directory components.
pub fn sanitize_filename(name: &str) -> String {
    let base = name.rsplit(['/', '\\']).next().unwrap_or_default();
    let cleaned: String = base
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.') {
                c
            } else {
                '_'
            }
        })
        .collect();
    if cleaned.chars().all(|c| c == '.') {
        String::new()
    } else {
        cleaned
    }
}

/// Move a staged file into `dir` under a name nobody else holds.
async fn place(staging: &Path, dir: &Path, name: &str) -> std::io::Result<PathBuf> {
    tokio::fs::create_dir_all(dir).await?;
    let path = claim_path(dir, name).await?;
    if let Err(e) = move_file(staging, &path).await {
        discard(&path).await;
        return Err(e);
    }
    Ok(path)
}

/// Create `dir/name` exclusively, or `dir/<stem>_<unix secs>[_n].<ext>`
/// when that is taken. The empty file reserves the name until the staged
/// bytes are renamed over it.
async fn claim_path(dir: &Path, name: &str) -> std::io::Result<PathBuf> {
    let (stem, ext) = match name.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() => (stem, format!(".{ext}")),
        _ => (name, String::new()),
    };
    let secs = chrono::Utc::now().timestamp();
    let mut attempt = 0u32;
    loop {
        let candidate = match attempt {
            0 => dir.join(name),
            1 => dir.join(format!("{stem}_{secs}{ext}")),
            n => dir.join(format!("{stem}_{secs}_{}{ext}", n - 1)),
        };
        let claimed = tokio::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&candidate)
            .await;
        match claimed {
            Ok(_) => return Ok(candidate),
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => attempt += 1,
            Err(e) => return Err(e),
        }
    }
}

/// Rename, falling back to copy + delete across filesystems.
async fn move_file(from: &Path, to: &Path) -> std::io::Result<()> {
    if tokio::fs::rename(from, to).await.is_ok() {
        return Ok(());
    }
    tokio::fs::copy(from, to).await?;
    tokio::fs::remove_file(from).await
}

/// Best-effort removal of a file left behind by a failed finalize.
async fn discard(path: &Path) {
    if let Err(e) = tokio::fs::remove_file(path).await {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!("Cannot remove {}: {e}", path.display());
        }
    }
}
