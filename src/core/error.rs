use thiserror::Error;

/// Core error types for netrecon
#[derive(Debug, Error)]
pub enum Error {
    /// I/O operation failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization failed
    #[error("JSON error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// External command exited unsuccessfully
    #[error("{program} failed: {message}")]
    Command {
        program: String,
        message: String,
        output: String,
        exit_code: Option<i32>,
    },

    /// External command did not finish in time
    #[error("{program} timed out after {secs}s")]
    Timeout { program: String, secs: u64 },

    /// Namespace create found an existing namespace
    #[error("Namespace already exists: {0}")]
    AlreadyExists(String),

    /// Privilege escalation failed
    #[error("Elevation error: {0}")]
    Elevation(#[from] crate::elevation::ElevationError),

    /// Applied-state persistence failed
    #[error("Snapshot error: {0}")]
    Snapshot(#[from] SnapshotError),

    /// Input validation failed
    #[error("Validation error in {field}: {message}")]
    Validation { field: String, message: String },

    /// Domain data could not be rebuilt during recovery
    #[error("Reload error: {0}")]
    Reload(String),

    /// Startup plan could not be resolved or a step failed
    #[error("Init error: {0}")]
    Init(String),
}

impl Error {
    pub fn validation(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Validation {
            field: field.into(),
            message: message.into(),
        }
    }

    /// Classifies the captured output of a failed command, if any.
    pub fn failure_kind(&self) -> Option<FailureKind> {
        match self {
            Self::Command { output, .. } => Some(FailureKind::classify(output)),
            Self::AlreadyExists(_) => Some(FailureKind::AlreadyExists),
            Self::Timeout { .. } => Some(FailureKind::TimedOut),
            _ => None,
        }
    }
}

/// Applied-state persistence errors
#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("Snapshot checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch { expected: String, actual: String },

    #[error("Snapshot not found: {0}")]
    NotFound(String),

    #[error("Snapshot format version mismatch: found v{found}, expected v{expected}")]
    VersionMismatch { found: u32, expected: u32 },

    #[error("State directory not available")]
    StateDirUnavailable,
}

/// The reconciliation step a namespace failed at
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display, strum::AsRefStr)]
pub enum Step {
    #[strum(serialize = "namespace_add")]
    NamespaceAdd,
    #[strum(serialize = "remove_nat")]
    RemoveNat,
    #[strum(serialize = "apply_nat")]
    ApplyNat,
    #[strum(serialize = "hold")]
    Hold,
    #[strum(serialize = "remove")]
    Remove,
    #[strum(serialize = "apply")]
    Apply,
    #[strum(serialize = "remove_stale")]
    RemoveStale,
}

/// Broad category of a failed ip/iptables invocation
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
pub enum FailureKind {
    #[strum(serialize = "already exists")]
    AlreadyExists,
    #[strum(serialize = "rule missing")]
    RuleMissing,
    #[strum(serialize = "namespace missing")]
    NamespaceMissing,
    #[strum(serialize = "permission denied")]
    PermissionDenied,
    #[strum(serialize = "command not found")]
    CommandNotFound,
    #[strum(serialize = "resource busy")]
    ResourceBusy,
    #[strum(serialize = "timed out")]
    TimedOut,
    #[strum(serialize = "other")]
    Other,
}

impl FailureKind {
    /// Matches combined command output against known ip/iptables messages.
    pub fn classify(output: &str) -> Self {
        let lower = output.to_lowercase();

        if lower.contains("file exists") || lower.contains("chain already exists") {
            return Self::AlreadyExists;
        }

        // iptables -D on a rule that is not installed
        if lower.contains("does a matching rule exist")
            || lower.contains("bad rule")
            || lower.contains("no chain/target/match by that name")
        {
            return Self::RuleMissing;
        }

        if lower.contains("cannot open network namespace") {
            return Self::NamespaceMissing;
        }

        if lower.contains("permission denied") || lower.contains("operation not permitted") {
            return Self::PermissionDenied;
        }

        if lower.contains("command not found") || lower.contains("no such file") {
            return Self::CommandNotFound;
        }

        if lower.contains("resource busy") || lower.contains("xtables lock") {
            return Self::ResourceBusy;
        }

        Self::Other
    }

    /// Operator-facing hint logged next to the failure.
    pub fn hint(self) -> &'static str {
        match self {
            Self::AlreadyExists => "object already present",
            Self::RuleMissing => "rule was not installed, state may have drifted",
            Self::NamespaceMissing => "namespace vanished, the next pass will recreate it",
            Self::PermissionDenied => "CAP_NET_ADMIN is required, check the elevation setting",
            Self::CommandNotFound => "install iproute2 and iptables or fix the command paths",
            Self::ResourceBusy => "another process holds the xtables lock",
            Self::TimedOut => "raise command_timeout_secs or inspect the host",
            Self::Other => "see command output",
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
