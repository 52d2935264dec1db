//! Snapshot filer for crystal objects.
//!
//! Persists one document's snapshot envelope (waypoint + serialized bytes)
//! to a redundant main/backup pair, each hash-framed, and keeps a bounded
//! in-memory history of recent envelopes for journal replay verification.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{StorageError, StorageResult};
use crate::hash;
use crate::waypoint::Waypoint;

/// Suffix appended to the main path for the backup generation.
const BACKUP_SUFFIX: &str = ".back";

/// One persisted snapshot: the waypoint and the serialized document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotEnvelope {
    /// Waypoint at the time of the save.
    pub waypoint: Waypoint,
    /// Serialized document bytes (format chosen by the document's config).
    pub data: Vec<u8>,
}

/// Redundant-pair snapshot persistence for one document.
pub struct CrystalFiler {
    main: PathBuf,
    backup: PathBuf,
    history: Mutex<VecDeque<SnapshotEnvelope>>,
    history_limit: usize,
}

impl CrystalFiler {
    /// Creates a filer writing to `main` and `main` + `.back`.
    pub fn new(main: impl Into<PathBuf>, history_limit: usize) -> Self {
        let main = main.into();
        let mut backup = main.as_os_str().to_owned();
        backup.push(BACKUP_SUFFIX);
        Self {
            main,
            backup: PathBuf::from(backup),
            history: Mutex::new(VecDeque::new()),
            history_limit,
        }
    }

    /// The main snapshot path.
    pub fn main_path(&self) -> &Path {
        &self.main
    }

    /// Writes the envelope to both generations and records it in history.
    pub async fn save(&self, envelope: SnapshotEnvelope) -> StorageResult<()> {
        let payload = bincode::serialize(&envelope).map_err(|err| StorageError::DeserializeError {
            context: format!("snapshot encode: {err}"),
        })?;
        let sealed = hash::seal(&payload);
        if let Some(parent) = self.main.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&self.main, &sealed).await?;
        tokio::fs::write(&self.backup, &sealed).await?;

        let mut history = self.history.lock();
        history.push_back(envelope);
        while history.len() > self.history_limit {
            history.pop_front();
        }
        Ok(())
    }

    /// Loads the most recent envelope, main first, backup on any failure.
    /// Corrupt or undecodable snapshots are treated as absent.
    pub async fn load(&self) -> Option<SnapshotEnvelope> {
        for path in [&self.main, &self.backup] {
            let blob = match tokio::fs::read(path).await {
                Ok(blob) => blob,
                Err(_) => continue,
            };
            let Some(payload) = hash::unseal(&blob) else {
                debug!(path = %path.display(), "snapshot hash mismatch, trying next");
                continue;
            };
            match bincode::deserialize::<SnapshotEnvelope>(payload) {
                Ok(envelope) => return Some(envelope),
                Err(err) => {
                    debug!(path = %path.display(), %err, "snapshot decode failed, trying next");
                }
            }
        }
        None
    }

    /// Removes both generations. Returns the first error, but attempts both.
    pub async fn delete(&self) -> StorageResult<()> {
        let first = remove_if_present(&self.main).await;
        let second = remove_if_present(&self.backup).await;
        self.history.lock().clear();
        first.and(second)
    }

    /// Recent envelopes, oldest first.
    pub fn history(&self) -> Vec<SnapshotEnvelope> {
        self.history.lock().iter().cloned().collect()
    }
}

async fn remove_if_present(path: &Path) -> StorageResult<()> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(_) => Err(StorageError::DeleteError {
            path: path.display().to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn envelope(hash: u64, data: &[u8]) -> SnapshotEnvelope {
        SnapshotEnvelope {
            waypoint: Waypoint {
                journal_position: 0,
                current_plane: 1,
                next_plane: 2,
                hash,
            },
            data: data.to_vec(),
        }
    }

    #[tokio::test]
    async fn test_save_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let filer = CrystalFiler::new(dir.path().join("doc.crystal"), 4);
        filer.save(envelope(7, b"document")).await.unwrap();

        let loaded = filer.load().await.unwrap();
        assert_eq!(loaded.data, b"document");
        assert_eq!(loaded.waypoint.hash, 7);
    }

    #[tokio::test]
    async fn test_load_missing_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let filer = CrystalFiler::new(dir.path().join("absent.crystal"), 4);
        assert!(filer.load().await.is_none());
    }

    #[tokio::test]
    async fn test_corrupt_main_falls_back() {
        let dir = tempfile::tempdir().unwrap();
        let main = dir.path().join("doc.crystal");
        let filer = CrystalFiler::new(&main, 4);
        filer.save(envelope(1, b"good")).await.unwrap();

        let mut bytes = std::fs::read(&main).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xFF;
        std::fs::write(&main, &bytes).unwrap();

        let loaded = filer.load().await.unwrap();
        assert_eq!(loaded.data, b"good");
    }

    #[tokio::test]
    async fn test_both_corrupt_is_absent() {
        let dir = tempfile::tempdir().unwrap();
        let main = dir.path().join("doc.crystal");
        let filer = CrystalFiler::new(&main, 4);
        filer.save(envelope(1, b"good")).await.unwrap();

        for path in [&main, &filer.backup] {
            let mut bytes = std::fs::read(path).unwrap();
            bytes[9] ^= 0xFF;
            std::fs::write(path, &bytes).unwrap();
        }
        assert!(filer.load().await.is_none());
    }

    #[tokio::test]
    async fn test_delete_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let filer = CrystalFiler::new(dir.path().join("doc.crystal"), 4);
        filer.save(envelope(1, b"x")).await.unwrap();
        filer.delete().await.unwrap();
        filer.delete().await.unwrap();
        assert!(filer.load().await.is_none());
        assert!(filer.history().is_empty());
    }

    #[tokio::test]
    async fn test_history_bounded() {
        let dir = tempfile::tempdir().unwrap();
        let filer = CrystalFiler::new(dir.path().join("doc.crystal"), 2);
        for i in 0..5u64 {
            filer.save(envelope(i, &[i as u8])).await.unwrap();
        }
        let history = filer.history();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].waypoint.hash, 3);
        assert_eq!(history[1].waypoint.hash, 4);
    }
}
