//! Captured or user-supplied media ready for upload.

use std::fmt;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// MIME types accepted for video uploads.
pub const VIDEO_MIME_TYPES: &[&str] = &["video/webm", "video/mp4", "video/x-matroska"];

/// MIME types accepted for audio uploads.
pub const AUDIO_MIME_TYPES: &[&str] = &["audio/webm", "audio/wav", "audio/mp3", "audio/mpeg", "audio/ogg"];

/// Broad category of a payload, derived from its MIME type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Video,
    Audio,
}

impl MediaKind {
    /// Anything that is not `video/*` is filed as audio.
    pub fn from_mime(mime_type: &str) -> Self {
        if mime_type.trim_start().starts_with("video") {
            MediaKind::Video
        } else {
            MediaKind::Audio
        }
    }
}

impl fmt::Display for MediaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MediaKind::Video => f.pad("video"),
            MediaKind::Audio => f.pad("audio"),
        }
    }
}

/// An immutable media blob plus the metadata the upload protocol needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaPayload {
    name: String,
    mime_type: String,
    bytes: Vec<u8>,
}

impl MediaPayload {
    pub fn new(name: impl Into<String>, mime_type: impl Into<String>, bytes: Vec<u8>) -> Self {
        Self {
            name: name.into(),
            mime_type: mime_type.into(),
            bytes,
        }
    }

    /// Build a payload for a fresh recording, named after the current
    /// local time, e.g. `recording-20240224-161937.webm`.
    pub fn recording(mime_type: impl Into<String>, bytes: Vec<u8>) -> Self {
        let mime_type = mime_type.into();
        let name = format!(
            "recording-{}.{}",
            chrono::Local::now().format("%Y%m%d-%H%M%S"),
            extension_for_mime(&mime_type)
        );
        Self::new(name, mime_type, bytes)
    }

    /// Read a file from disk, guessing its MIME type from the extension.
    pub fn from_file(path: &Path) -> Result<Self> {
        let bytes =
            std::fs::read(path).with_context(|| format!("Cannot read {}", path.display()))?;
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .with_context(|| format!("No file name in {}", path.display()))?;
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default();
        Ok(Self::new(name, mime_for_extension(ext), bytes))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn mime_type(&self) -> &str {
        &self.mime_type
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn kind(&self) -> MediaKind {
        MediaKind::from_mime(&self.mime_type)
    }

    /// Human-readable size, e.g. `"1.2 MB"`.
    pub fn total_size(&self) -> String {
        format_total_size(self.bytes.len() as u64)
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }
}

/// Format a byte count the way upload records display it: megabytes with
/// one decimal.
pub fn format_total_size(bytes: u64) -> String {
    format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
}

/// The MIME type without parameters: `video/webm;codecs=vp9` → `video/webm`.
pub fn base_mime(mime_type: &str) -> &str {
    mime_type.split(';').next().unwrap_or_default().trim()
}

/// File extension conventionally used for a MIME type.
pub fn extension_for_mime(mime_type: &str) -> &'static str {
    match base_mime(mime_type) {
        "video/mp4" => "mp4",
        "video/x-matroska" => "mkv",
        "audio/wav" => "wav",
        "audio/mp3" | "audio/mpeg" => "mp3",
        "audio/ogg" => "ogg",
        _ => "webm",
    }
}

/// Best-effort MIME type for a file extension.
pub fn mime_for_extension(ext: &str) -> &'static str {
    match ext.to_ascii_lowercase().as_str() {
        "mp4" | "m4v" => "video/mp4",
        "mkv" => "video/x-matroska",
        "webm" => "video/webm",
        "wav" => "audio/wav",
        "mp3" => "audio/mpeg",
        "ogg" | "oga" | "opus" => "audio/ogg",
        "weba" => "audio/webm",
        _ => "application/octet-stream",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_from_mime() {
        assert_eq!(MediaKind::from_mime("video/webm;codecs=vp9"), MediaKind::Video);
        assert_eq!(MediaKind::from_mime("audio/webm"), MediaKind::Audio);
        assert_eq!(MediaKind::from_mime("application/octet-stream"), MediaKind::Audio);
    }

    #[test]
    fn test_total_size() {
        assert_eq!(format_total_size(0), "0.0 MB");
        assert_eq!(format_total_size(1_300_000), "1.2 MB");
        let p = MediaPayload::new("a.webm", "video/webm", vec![0; 3 * 1024 * 1024]);
        assert_eq!(p.total_size(), "3.0 MB");
    }

    #[test]
    fn test_recording_name_uses_mime_extension() {
        let p = MediaPayload::recording("audio/ogg;codecs=opus", vec![1, 2, 3]);
        assert!(p.name().starts_with("recording-"));
        assert!(p.name().ends_with(".ogg"));
        assert_eq!(p.kind(), MediaKind::Audio);
    }

    #[test]
    fn test_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("clip.MP4");
        std::fs::write(&path, b"abc").unwrap();
        let p = MediaPayload::from_file(&path).unwrap();
        assert_eq!(p.name(), "clip.MP4");
        assert_eq!(p.mime_type(), "video/mp4");
        assert_eq!(p.bytes(), b"abc");
    }
}
