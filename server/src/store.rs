//! Upload record index – a JSON array of [`UploadRecord`]s on disk.

use std::path::{Path, PathBuf};

use tokio::sync::Mutex;
use tracing::{debug, info};

use vault_common::protocol::UploadRecord;

use crate::error::AssemblyResult;

pub struct RecordStore {
    path: PathBuf,
    records: Mutex<Vec<UploadRecord>>,
}

impl RecordStore {
    /// Open the index at `path`, starting empty when the file does not exist.
    pub async fn open(path: &Path) -> AssemblyResult<Self> {
        let records = match tokio::fs::read(path).await {
            Ok(bytes) if bytes.is_empty() => Vec::new(),
            Ok(bytes) => serde_json::from_slice(&bytes)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(e) => return Err(e.into()),
        };
        info!("Record store {} holds {} upload(s)", path.display(), records.len());
        Ok(Self {
            path: path.to_path_buf(),
            records: Mutex::new(records),
        })
    }

    pub async fn list(&self) -> Vec<UploadRecord> {
        self.records.lock().await.clone()
    }

    pub async fn get(&self, id: &str) -> Option<UploadRecord> {
        self.records.lock().await.iter().find(|r| r.id == id).cloned()
    }

    pub async fn add(&self, record: UploadRecord) -> AssemblyResult<()> {
        let mut records = self.records.lock().await;
        records.push(record);
        if let Err(e) = self.persist(&records).await {
            records.pop();
            return Err(e);
        }
        Ok(())
    }

    /// Remove a record, returning it if it existed.
    pub async fn remove(&self, id: &str) -> AssemblyResult<Option<UploadRecord>> {
        let mut records = self.records.lock().await;
        let Some(pos) = records.iter().position(|r| r.id == id) else {
            return Ok(None);
        };
        let removed = records.remove(pos);
        if let Err(e) = self.persist(&records).await {
            records.insert(pos, removed);
            return Err(e);
        }
        Ok(Some(removed))
    }

    /// Write the index atomically: temp file, then rename over the old one.
    async fn persist(&self, records: &[UploadRecord]) -> AssemblyResult<()> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, serde_json::to_vec_pretty(records)?).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        debug!("Persisted {} record(s) to {}", records.len(), self.path.display());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vault_common::payload::MediaKind;

    fn record(id: &str) -> UploadRecord {
        UploadRecord {
            id: id.to_string(),
            filename: format!("{id}.webm"),
            size: "0.1 MB".into(),
            timestamp: "2024-02-24 16:19:37".into(),
            kind: MediaKind::Audio,
            filepath: format!("uploads/{id}.webm"),
        }
    }

    #[tokio::test]
    async fn test_add_remove_and_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("uploads.json");

        let store = RecordStore::open(&path).await.unwrap();
        assert!(store.list().await.is_empty());
        store.add(record("a")).await.unwrap();
        store.add(record("b")).await.unwrap();
        assert_eq!(store.remove("a").await.unwrap().map(|r| r.id), Some("a".into()));
        assert!(store.remove("a").await.unwrap().is_none());

        let reopened = RecordStore::open(&path).await.unwrap();
        let ids: Vec<String> = reopened.list().await.into_iter().map(|r| r.id).collect();
        assert_eq!(ids, vec!["b".to_string()]);
        assert!(reopened.get("b").await.is_some());
    }
}
