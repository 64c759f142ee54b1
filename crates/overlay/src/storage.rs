//! Snapshot persistence
//!
//! The registry and directory are written together as one JSON document.
//! Each save rotates the previous document aside, so a snapshot that was
//! torn or hand-edited into garbage still leaves the one before it to start
//! from.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{debug, info, warn};

use crate::metadata::{DirectorySnapshot, NodeInfo};

const CURRENT_FILE: &str = "overlay.snapshot.json";
const PREVIOUS_FILE: &str = "overlay.snapshot.prev.json";
const STAGING_FILE: &str = "overlay.snapshot.json.tmp";

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Cannot encode snapshot: {0}")]
    Encode(String),
    #[error("Snapshot {path:?} is unreadable: {reason}")]
    Corrupt { path: PathBuf, reason: String },
}

/// Everything needed to rebuild an overlay
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OverlaySnapshot {
    pub cluster_name: String,
    pub saved_at: DateTime<Utc>,
    pub nodes: Vec<NodeInfo>,
    pub directory: DirectorySnapshot,
}

impl OverlaySnapshot {
    fn decode(path: &Path, bytes: &[u8]) -> Result<Self, StorageError> {
        serde_json::from_slice(bytes).map_err(|e| StorageError::Corrupt {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })
    }

    fn encode(&self) -> Result<Vec<u8>, StorageError> {
        serde_json::to_vec_pretty(self).map_err(|e| StorageError::Encode(e.to_string()))
    }
}

/// Current and previous snapshot in one data directory
pub struct SnapshotStore {
    dir: PathBuf,
}

impl SnapshotStore {
    pub fn new(dir: impl AsRef<Path>) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
        }
    }

    pub fn current_path(&self) -> PathBuf {
        self.dir.join(CURRENT_FILE)
    }

    pub fn previous_path(&self) -> PathBuf {
        self.dir.join(PREVIOUS_FILE)
    }

    /// Newest readable snapshot, `None` for a fresh overlay
    ///
    /// An unreadable current snapshot falls back to the previous one. Only
    /// when both exist and neither decodes is the error returned.
    pub async fn load(&self) -> Result<Option<OverlaySnapshot>, StorageError> {
        let current = match Self::read(&self.current_path()).await {
            Ok(found) => found,
            Err(e) => {
                warn!("{}, trying the previous snapshot", e);
                match Self::read(&self.previous_path()).await? {
                    Some(snapshot) => Some(snapshot),
                    None => return Err(e),
                }
            }
        };
        let snapshot = match current {
            Some(snapshot) => snapshot,
            None => match Self::read(&self.previous_path()).await? {
                // Crash between the two renames of a save
                Some(snapshot) => snapshot,
                None => {
                    info!("No snapshot in {:?}, starting empty overlay", self.dir);
                    return Ok(None);
                }
            },
        };

        info!(
            "Restoring '{}' as of {}: {} node(s), {} chunk(s), {} name(s)",
            snapshot.cluster_name,
            snapshot.saved_at.to_rfc3339(),
            snapshot.nodes.len(),
            snapshot.directory.chunks.len(),
            snapshot.directory.names.len()
        );
        Ok(Some(snapshot))
    }

    async fn read(path: &Path) -> Result<Option<OverlaySnapshot>, StorageError> {
        match fs::read(path).await {
            Ok(bytes) => OverlaySnapshot::decode(path, &bytes).map(Some),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Stage the snapshot, move the current one to the previous slot, then
    /// promote the staged file
    pub async fn save(&self, snapshot: &OverlaySnapshot) -> Result<(), StorageError> {
        fs::create_dir_all(&self.dir).await?;

        let bytes = snapshot.encode()?;
        let staging = self.dir.join(STAGING_FILE);
        fs::write(&staging, &bytes).await?;

        let current = self.current_path();
        match fs::rename(&current, self.previous_path()).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        fs::rename(&staging, &current).await?;

        debug!(
            "Snapshot written to {:?}: {} node(s), {} chunk(s), {} bytes",
            current,
            snapshot.nodes.len(),
            snapshot.directory.chunks.len(),
            bytes.len()
        );
        Ok(())
    }
}
