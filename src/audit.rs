/// Audit logging for privileged operations
///
/// Every reconciliation pass, node recovery and reload is recorded as one
/// JSON line in `<state dir>/audit.log`. Failing to write the audit log is a
/// warning, never a reconciliation failure.
use crate::core::update::PassReport;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tokio::io::AsyncWriteExt;

/// Types of auditable events
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    ReconcilePass,
    NodeRecovery,
    Reload,
    RestoreState,
}

/// A single audit log entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    /// When the event occurred (UTC)
    pub timestamp: chrono::DateTime<chrono::Utc>,

    pub event_type: EventType,

    /// Whether the operation succeeded
    pub success: bool,

    /// Additional structured data about the event
    pub details: serde_json::Value,

    /// Error message if operation failed
    pub error: Option<String>,
}

impl AuditEvent {
    pub fn new(
        event_type: EventType,
        success: bool,
        details: serde_json::Value,
        error: Option<String>,
    ) -> Self {
        Self {
            timestamp: chrono::Utc::now(),
            event_type,
            success,
            details,
            error,
        }
    }
}

/// Audit log writer
#[derive(Debug, Clone)]
pub struct AuditLog {
    log_path: PathBuf,
}

impl AuditLog {
    /// Creates an audit log in the state directory
    ///
    /// # Errors
    ///
    /// Returns `Err` if state directory cannot be determined
    pub fn new() -> std::io::Result<Self> {
        let mut log_path = crate::utils::get_state_dir().ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::NotFound, "State directory not found")
        })?;
        log_path.push("audit.log");

        Ok(Self { log_path })
    }

    pub fn at(log_path: impl Into<PathBuf>) -> Self {
        Self {
            log_path: log_path.into(),
        }
    }

    /// Appends an event to the audit log
    ///
    /// Events are written as JSON-lines format (one JSON object per line)
    ///
    /// # Errors
    ///
    /// Returns `Err` if file cannot be opened or written
    pub async fn log(&self, event: AuditEvent) -> std::io::Result<()> {
        let json = serde_json::to_string(&event)?;

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.log_path)
            .await?;

        file.write_all(json.as_bytes()).await?;
        file.write_all(b"\n").await?;
        file.sync_all().await?;

        Ok(())
    }

    /// Reads the most recent events from the log, newest first
    ///
    /// # Errors
    ///
    /// Returns `Err` if file cannot be read
    pub async fn read_recent(&self, count: usize) -> std::io::Result<Vec<AuditEvent>> {
        let content = tokio::fs::read_to_string(&self.log_path).await?;

        let events: Vec<AuditEvent> = content
            .lines()
            .rev()
            .take(count)
            .filter_map(|line| serde_json::from_str(line).ok())
            .collect();

        Ok(events)
    }

    pub fn path(&self) -> &PathBuf {
        &self.log_path
    }

    async fn record(&self, event: AuditEvent) {
        if let Err(e) = self.log(event).await {
            tracing::warn!("Failed to write audit log: {}", e);
        }
    }

    /// Logs a reconciliation pass
    pub async fn log_pass(&self, report: &PassReport, recover: bool) {
        let failed: Vec<&String> = report.failed.iter().collect();
        self.record(AuditEvent::new(
            EventType::ReconcilePass,
            report.is_clean(),
            serde_json::json!({
                "applied": report.applied,
                "removed": report.removed,
                "unchanged": report.unchanged,
                "nat_updated": report.nat_updated,
                "failed_namespaces": failed,
                "root_failed": report.root_failed(),
                "recover": recover,
            }),
            None,
        ))
        .await;
    }

    /// Logs a node-level recovery attempt
    pub async fn log_node_recovery(&self, error: Option<String>) {
        self.record(AuditEvent::new(
            EventType::NodeRecovery,
            error.is_none(),
            serde_json::json!({}),
            error,
        ))
        .await;
    }

    /// Logs a reload; `report` is `None` when the reload failed before a pass
    pub async fn log_reload(&self, report: Option<&PassReport>, error: Option<String>) {
        let details = report.map_or_else(
            || serde_json::json!({}),
            |report| {
                serde_json::json!({
                    "applied": report.applied,
                    "removed": report.removed,
                    "failed_namespaces": report.failed,
                })
            },
        );
        let success = error.is_none() && report.is_some_and(PassReport::is_clean);
        self.record(AuditEvent::new(EventType::Reload, success, details, error))
            .await;
    }

    /// Logs loading the persisted applied state at startup
    pub async fn log_restore_state(&self, keys: usize, error: Option<String>) {
        self.record(AuditEvent::new(
            EventType::RestoreState,
            error.is_none(),
            serde_json::json!({ "keys": keys }),
            error,
        ))
        .await;
    }
}
