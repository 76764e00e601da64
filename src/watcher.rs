//! Domain data source and periodic watcher
//!
//! [`FileSource`] reads the node's domain document (instances placed on this
//! node and firewall policy) from a JSON file written by the control plane.
//! [`Watcher`] periodically reloads it and drives a reconciliation pass with
//! recovery enabled.

use crate::core::desired::{DomainData, DomainSource};
use crate::core::error::{Error, Result};
use crate::core::kernel::Kernel;
use crate::core::reconciler::Reconciler;
use crate::core::update::PassReport;
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

/// Largest domain document accepted (16 MiB)
pub const MAX_DOCUMENT_BYTES: u64 = 16 * 1024 * 1024;

/// Most instances one node document may list
pub const MAX_INSTANCES: usize = 10_000;

/// Reads [`DomainData`] from a JSON file.
///
/// A `<file>.sha256` sidecar, when present, is verified; a mismatch is a
/// warning only since operators edit the document by hand.
#[derive(Debug, Clone)]
pub struct FileSource {
    path: PathBuf,
}

impl FileSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn checksum_path(&self) -> PathBuf {
        let mut name = self.path.as_os_str().to_owned();
        name.push(".sha256");
        PathBuf::from(name)
    }
}

impl DomainSource for FileSource {
    async fn load(&self) -> Result<DomainData> {
        let size = tokio::fs::metadata(&self.path).await?.len();
        if size > MAX_DOCUMENT_BYTES {
            return Err(Error::validation(
                "document",
                format!(
                    "{} is {size} bytes (max: {MAX_DOCUMENT_BYTES})",
                    self.path.display()
                ),
            ));
        }

        let json = tokio::fs::read_to_string(&self.path).await?;

        if let Ok(expected) = tokio::fs::read_to_string(self.checksum_path()).await {
            let mut hasher = Sha256::new();
            hasher.update(json.as_bytes());
            let actual = format!("{:x}", hasher.finalize());

            if expected.trim() != actual {
                warn!(
                    "Domain document {} checksum mismatch (expected: {}, got: {})",
                    self.path.display(),
                    expected.trim(),
                    actual
                );
            }
        }

        let data: DomainData = serde_json::from_str(&json)?;

        if data.instances.len() > MAX_INSTANCES {
            return Err(Error::validation(
                "instances",
                format!(
                    "{} instances listed (max: {MAX_INSTANCES})",
                    data.instances.len()
                ),
            ));
        }

        Ok(data)
    }
}

/// Periodic reconciliation driver
pub struct Watcher<K, S> {
    reconciler: Arc<Reconciler<K, S>>,
    interval: Duration,
}

impl<K: Kernel, S: DomainSource> Watcher<K, S> {
    pub fn new(reconciler: Arc<Reconciler<K, S>>, interval: Duration) -> Self {
        Self {
            reconciler,
            interval,
        }
    }

    /// Runs one pass: list namespaces, load domain data, reconcile with
    /// recovery.
    ///
    /// # Errors
    ///
    /// Returns `Err` if the namespace list or domain data cannot be fetched;
    /// no pass runs in that case.
    pub async fn tick(&self) -> Result<PassReport> {
        let namespaces = self.reconciler.kernel().list_namespaces().await?;
        let data = self.reconciler.source().load().await?;
        Ok(self
            .reconciler
            .update_state_recover(&data, namespaces)
            .await)
    }

    /// Ticks every interval until `shutdown` turns true or its sender drops.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(interval_secs = self.interval.as_secs(), "Watcher started");

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match self.tick().await {
                        Ok(report) => debug!(
                            applied = report.applied,
                            removed = report.removed,
                            failed = report.failed.len(),
                            "Watcher pass finished"
                        ),
                        Err(e) => warn!(error = %e, "Watcher pass skipped, retrying next tick"),
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("Watcher stopping");
                        break;
                    }
                }
            }
        }
    }
}
