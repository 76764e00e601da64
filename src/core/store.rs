//! Applied-state persistence
//!
//! After every pass the reconciler writes the published snapshot to
//! `<state dir>/applied_state.json` (mode 0600, atomic rename) next to a
//! SHA-256 checksum sidecar. On startup the stored snapshot becomes the
//! initial "current" state, so the first pass diffs against what is actually
//! installed instead of re-applying everything on top of it.
//!
//! Namespaces the last pass failed are stored with their [`Residual`]: the
//! published snapshot claims rules that were never installed there, so the
//! first pass after a restart tears them down and applies them again.

use crate::core::error::{Error, Result, SnapshotError};
use crate::core::state::StateSnapshot;
use crate::core::update::Residual;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

pub const STATE_FILE: &str = "applied_state.json";
pub const FORMAT_VERSION: u32 = 1;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredSnapshot {
    pub version: u32,
    pub saved_at: DateTime<Utc>,
    pub snapshot: StateSnapshot,
    #[serde(default, skip_serializing_if = "Residual::is_empty")]
    pub residual: Residual,
}

/// Computes the SHA-256 checksum of the stored bytes, hex encoded.
pub fn compute_checksum(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

#[derive(Debug, Clone)]
pub struct SnapshotStore {
    dir: PathBuf,
}

impl SnapshotStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Store rooted at the XDG state directory.
    pub fn from_state_dir() -> Result<Self> {
        crate::utils::get_state_dir()
            .map(Self::new)
            .ok_or(Error::Snapshot(SnapshotError::StateDirUnavailable))
    }

    pub fn path(&self) -> PathBuf {
        self.dir.join(STATE_FILE)
    }

    pub fn checksum_path(&self) -> PathBuf {
        self.dir.join(format!("{STATE_FILE}.sha256"))
    }

    /// Persists `snapshot` and the residual of its failed namespaces,
    /// replacing whatever was stored before.
    pub async fn save(&self, snapshot: &StateSnapshot, residual: &Residual) -> Result<PathBuf> {
        let stored = StoredSnapshot {
            version: FORMAT_VERSION,
            saved_at: Utc::now(),
            snapshot: snapshot.clone(),
            residual: residual.clone(),
        };
        let json = serde_json::to_vec_pretty(&stored)?;
        let checksum = compute_checksum(&json);

        tokio::fs::create_dir_all(&self.dir).await?;

        // Sidecar first; an interrupted save must read back as a mismatch
        crate::utils::write_atomic(&self.checksum_path(), checksum.as_bytes()).await?;
        crate::utils::write_atomic(&self.path(), &json).await?;

        Ok(self.path())
    }

    /// Loads and verifies the stored snapshot.
    ///
    /// # Errors
    ///
    /// - `SnapshotError::NotFound` if nothing was stored yet
    /// - `SnapshotError::ChecksumMismatch` if the file does not match its sidecar
    /// - `SnapshotError::VersionMismatch` for an unknown format version
    pub async fn load(&self) -> Result<StoredSnapshot> {
        let path = self.path();
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(SnapshotError::NotFound(path.display().to_string()).into());
            }
            Err(e) => return Err(e.into()),
        };

        let expected = read_checksum(&self.checksum_path()).await?;
        let actual = compute_checksum(&bytes);
        if expected != actual {
            return Err(SnapshotError::ChecksumMismatch { expected, actual }.into());
        }

        let stored: StoredSnapshot = serde_json::from_slice(&bytes)?;
        if stored.version != FORMAT_VERSION {
            return Err(SnapshotError::VersionMismatch {
                found: stored.version,
                expected: FORMAT_VERSION,
            }
            .into());
        }

        Ok(stored)
    }

    /// Loads the stored snapshot and residual, falling back to empty ones.
    pub async fn load_or_empty(&self) -> (StateSnapshot, Residual) {
        match self.load().await {
            Ok(stored) => {
                info!(
                    keys = stored.snapshot.len(),
                    failed_namespaces = stored.residual.len(),
                    saved_at = %stored.saved_at,
                    "Restored applied state"
                );
                (stored.snapshot, stored.residual)
            }
            Err(Error::Snapshot(SnapshotError::NotFound(_))) => Default::default(),
            Err(e) => {
                warn!(error = %e, "Ignoring stored applied state, starting from empty");
                Default::default()
            }
        }
    }
}

async fn read_checksum(path: &Path) -> Result<String> {
    match tokio::fs::read_to_string(path).await {
        Ok(text) => Ok(text.trim().to_string()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(String::new()),
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::test_helpers::{ingress_rules, nat_rules, snapshot};

    fn sample() -> StateSnapshot {
        snapshot(vec![ingress_rules("0", "host", 22), nat_rules("4", "eth0", 80, 4)])
    }

    #[test]
    fn test_compute_checksum_deterministic() {
        assert_eq!(compute_checksum(b"abc"), compute_checksum(b"abc"));
        assert_ne!(compute_checksum(b"abc"), compute_checksum(b"abd"));
        assert_eq!(compute_checksum(b"").len(), 64);
    }

    #[tokio::test]
    async fn test_save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let store = SnapshotStore::new(dir.path());

        store.save(&sample(), &Residual::new()).await.unwrap();
        let stored = store.load().await.unwrap();

        assert_eq!(stored.snapshot, sample());
        assert_eq!(stored.version, FORMAT_VERSION);
        assert!(stored.residual.is_empty());
        let text = std::fs::read_to_string(store.path()).unwrap();
        assert!(!text.contains("residual"));
    }

    #[tokio::test]
    async fn test_residual_survives_restart() {
        let dir = tempfile::tempdir().unwrap();
        let installed = ingress_rules("4", "eth0", 22);
        let residual = Residual::from([
            ("4".to_string(), vec![installed.clone()]),
            ("7".to_string(), Vec::new()),
        ]);
        SnapshotStore::new(dir.path())
            .save(&sample(), &residual)
            .await
            .unwrap();

        let (snapshot, restored) = SnapshotStore::new(dir.path()).load_or_empty().await;

        assert_eq!(snapshot, sample());
        assert_eq!(restored, residual);
        assert_eq!(restored["4"], vec![installed]);
    }

    #[tokio::test]
    async fn test_missing_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let store = SnapshotStore::new(dir.path());

        let err = store.load().await.unwrap_err();
        assert!(matches!(err, Error::Snapshot(SnapshotError::NotFound(_))));
        assert!(store.load_or_empty().await.0.is_empty());
    }

    #[tokio::test]
    async fn test_tampered_file_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store = SnapshotStore::new(dir.path());
        store.save(&sample(), &Residual::new()).await.unwrap();

        let mut text = std::fs::read_to_string(store.path()).unwrap();
        text = text.replace("\"22\"", "\"23\"");
        std::fs::write(store.path(), text).unwrap();

        let err = store.load().await.unwrap_err();
        assert!(matches!(
            err,
            Error::Snapshot(SnapshotError::ChecksumMismatch { .. })
        ));
        assert!(store.load_or_empty().await.0.is_empty());
    }

    #[tokio::test]
    async fn test_missing_sidecar_is_mismatch() {
        let dir = tempfile::tempdir().unwrap();
        let store = SnapshotStore::new(dir.path());
        store.save(&sample(), &Residual::new()).await.unwrap();
        std::fs::remove_file(store.checksum_path()).unwrap();

        assert!(matches!(
            store.load().await,
            Err(Error::Snapshot(SnapshotError::ChecksumMismatch { .. }))
        ));
    }

    #[tokio::test]
    async fn test_version_mismatch() {
        let dir = tempfile::tempdir().unwrap();
        let store = SnapshotStore::new(dir.path());

        let json = serde_json::to_vec(&StoredSnapshot {
            version: FORMAT_VERSION + 1,
            saved_at: Utc::now(),
            snapshot: StateSnapshot::empty(),
            residual: Residual::new(),
        })
        .unwrap();
        std::fs::write(store.path(), &json).unwrap();
        std::fs::write(store.checksum_path(), compute_checksum(&json)).unwrap();

        assert!(matches!(
            store.load().await,
            Err(Error::Snapshot(SnapshotError::VersionMismatch { found: 2, expected: 1 }))
        ));
    }
}
