//! Reconciliation orchestrator
//!
//! [`Reconciler`] owns the authoritative "current" snapshot. Every pass runs
//! with the snapshot lock held, so two passes never interleave kernel
//! operations and the last pass to take the lock publishes the final state.
//!
//! Recovery runs after the lock is released:
//!
//! - root namespace failed: run node recovery, backing off if that fails
//! - any namespace failed: back off, rebuild desired state from the domain
//!   source and run a full pass against it (reload)
//!
//! A reload never recovers recursively; the next scheduled pass is the
//! backstop. Every pass, reload or not, starts by tearing down the residual
//! of the namespaces the previous pass failed and applies them again from
//! scratch.

use crate::audit::AuditLog;
use crate::config::AppConfig;
use crate::core::desired::{DomainData, DomainSource};
use crate::core::error::{Error, Result};
use crate::core::kernel::Kernel;
use crate::core::rules::ROOT_NAMESPACE;
use crate::core::state::StateSnapshot;
use crate::core::store::SnapshotStore;
use crate::core::update::{PassReport, Residual, Update, clear_residual};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{error, info, warn};

#[derive(Debug, Clone)]
pub struct ReconcilerOptions {
    pub host_interface: String,
    pub recovery_backoff: Duration,
}

impl Default for ReconcilerOptions {
    fn default() -> Self {
        Self::from(&AppConfig::default())
    }
}

impl From<&AppConfig> for ReconcilerOptions {
    fn from(config: &AppConfig) -> Self {
        Self {
            host_interface: config.host_interface.clone(),
            recovery_backoff: config.recovery_backoff(),
        }
    }
}

/// Published snapshot and what the pass that published it left behind
#[derive(Debug, Default)]
struct Applied {
    snapshot: Arc<StateSnapshot>,
    residual: Residual,
}

pub struct Reconciler<K, S> {
    kernel: Arc<K>,
    source: Arc<S>,
    options: ReconcilerOptions,
    current: Mutex<Applied>,
    store: Option<SnapshotStore>,
    audit: Option<AuditLog>,
}

impl<K: Kernel, S: DomainSource> Reconciler<K, S> {
    pub fn new(kernel: Arc<K>, source: Arc<S>, options: ReconcilerOptions) -> Self {
        Self {
            kernel,
            source,
            options,
            current: Mutex::new(Applied::default()),
            store: None,
            audit: None,
        }
    }

    /// Starts from `snapshot` instead of an empty state.
    pub fn with_initial_state(mut self, snapshot: StateSnapshot) -> Self {
        self.current.get_mut().snapshot = Arc::new(snapshot);
        self
    }

    /// Namespaces a pass before a restart left failed, torn down and applied
    /// again by the first pass.
    pub fn with_residual(mut self, residual: Residual) -> Self {
        self.current.get_mut().residual = residual;
        self
    }

    /// Persists the published snapshot and its residual after every pass.
    pub fn with_store(mut self, store: SnapshotStore) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_audit(mut self, audit: AuditLog) -> Self {
        self.audit = Some(audit);
        self
    }

    pub fn kernel(&self) -> &Arc<K> {
        &self.kernel
    }

    pub fn source(&self) -> &Arc<S> {
        &self.source
    }

    /// The currently published snapshot. Waits for a running pass to finish.
    pub async fn current(&self) -> Arc<StateSnapshot> {
        Arc::clone(&self.current.lock().await.snapshot)
    }

    /// Reconciles from the current snapshot to `new` and publishes `new`.
    ///
    /// `namespaces` lists the namespaces that already exist on the host. With
    /// `recover` set, failed namespaces trigger [`Reconciler::recover`] once
    /// the lock is released.
    pub async fn apply_update(
        &self,
        new: StateSnapshot,
        namespaces: Vec<String>,
        recover: bool,
    ) -> PassReport {
        let report = self.pass(new, namespaces).await;

        if let Some(audit) = &self.audit {
            audit.log_pass(&report, recover).await;
        }

        if recover && !report.is_clean() {
            self.recover(&report.failed).await;
        }

        report
    }

    /// Builds the desired snapshot from `data` and applies it without recovery.
    pub async fn update_state(&self, data: &DomainData, namespaces: Vec<String>) -> PassReport {
        let new = data.desired_state(&self.options.host_interface);
        self.apply_update(new, namespaces, false).await
    }

    /// Like [`Reconciler::update_state`], escalating failures to recovery.
    pub async fn update_state_recover(
        &self,
        data: &DomainData,
        namespaces: Vec<String>,
    ) -> PassReport {
        let new = data.desired_state(&self.options.host_interface);
        self.apply_update(new, namespaces, true).await
    }

    /// Recovers from a pass that left `failed` namespaces behind.
    pub async fn recover(&self, failed: &BTreeSet<String>) {
        if failed.contains(ROOT_NAMESPACE) {
            match self.kernel.recover_node().await {
                Ok(()) => {
                    info!("Node recovery succeeded");
                    self.audit_node_recovery(None).await;
                }
                Err(e) => {
                    error!(error = %e, "Failed to recover node packet filter, retrying");
                    self.audit_node_recovery(Some(e.to_string())).await;
                    tokio::time::sleep(self.options.recovery_backoff).await;
                }
            }
        }

        if failed.is_empty() {
            return;
        }

        error!(failed = ?failed, "Failed to update packet filter, reloading state");
        tokio::time::sleep(self.options.recovery_backoff).await;

        match self.reload().await {
            Ok(report) => {
                if report.is_clean() {
                    info!(applied = report.applied, "Reload succeeded");
                } else {
                    warn!(failed = ?report.failed, "Reload left failed namespaces");
                }
                if let Some(audit) = &self.audit {
                    audit.log_reload(Some(&report), None).await;
                }
            }
            Err(e) => {
                error!(error = %e, "Failed to recover packet filter");
                if let Some(audit) = &self.audit {
                    audit.log_reload(None, Some(e.to_string())).await;
                }
            }
        }
    }

    /// Rebuilds desired state from scratch and runs a full pass.
    ///
    /// # Errors
    ///
    /// Returns `Error::Reload` if the namespace list or the domain data
    /// cannot be fetched. Per-namespace failures are in the report.
    pub async fn reload(&self) -> Result<PassReport> {
        let namespaces = self
            .kernel
            .list_namespaces()
            .await
            .map_err(|e| Error::Reload(format!("listing namespaces: {e}")))?;
        let data = self
            .source
            .load()
            .await
            .map_err(|e| Error::Reload(format!("loading domain data: {e}")))?;
        let new = data.desired_state(&self.options.host_interface);

        Ok(self.pass(new, namespaces).await)
    }

    /// Runs one pass under the lock and publishes `new`.
    ///
    /// The residual of the namespaces the previous pass failed is torn down
    /// first, and those namespaces are diffed against nothing so every key in
    /// them is applied again. Healthy namespaces are diffed as usual.
    async fn pass(&self, new: StateSnapshot, namespaces: Vec<String>) -> PassReport {
        let mut applied = self.current.lock().await;

        let base = if applied.residual.is_empty() {
            Arc::clone(&applied.snapshot)
        } else {
            info!(
                namespaces = ?applied.residual.keys().collect::<Vec<_>>(),
                "Tearing down namespaces left failed by the previous pass"
            );
            let base =
                clear_residual(self.kernel.as_ref(), &applied.snapshot, &applied.residual).await;
            Arc::new(base)
        };

        let report = Update::new(
            self.kernel.as_ref(),
            &base,
            &new,
            namespaces,
            &self.options.host_interface,
        )
        .apply()
        .await;

        *applied = Applied {
            snapshot: Arc::new(new),
            residual: report.residual.clone(),
        };
        self.persist(&applied).await;

        report
    }

    async fn persist(&self, applied: &Applied) {
        if let Some(store) = &self.store
            && let Err(e) = store.save(&applied.snapshot, &applied.residual).await
        {
            warn!(error = %e, "Failed to persist applied state");
        }
    }

    async fn audit_node_recovery(&self, error: Option<String>) {
        if let Some(audit) = &self.audit {
            audit.log_node_recovery(error).await;
        }
    }
}
