use crate::core::kernel::KernelConfig;
use crate::core::rules::HOST_INTERFACE;
use crate::elevation::ElevationMethod;
use crate::utils::get_config_dir;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::warn;

/// Upper bound for every interval setting (one hour)
pub const MAX_INTERVAL_SECS: u64 = 3600;

/// Node agent configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppConfig {
    /// Interface name replaced without a hold (the physical host interface)
    #[serde(default = "default_host_interface")]
    pub host_interface: String,
    /// Wait before node recovery and before a reload (default: 10s)
    #[serde(default = "default_recovery_backoff")]
    pub recovery_backoff_secs: u64,
    /// Limit for every `ip`/`iptables` invocation (default: 30s)
    #[serde(default = "default_command_timeout")]
    pub command_timeout_secs: u64,
    /// Watcher tick (default: 30s)
    #[serde(default = "default_watch_interval")]
    pub watch_interval_secs: u64,
    #[serde(default = "default_ip_command")]
    pub ip_command: String,
    #[serde(default = "default_iptables_command")]
    pub iptables_command: String,
    #[serde(default = "default_ip6tables_command")]
    pub ip6tables_command: String,
    #[serde(default)]
    pub elevation: ElevationMethod,
    /// Persist the applied snapshot after every pass
    #[serde(default = "default_true")]
    pub persist_state: bool,
    #[serde(default = "default_true")]
    pub audit_enabled: bool,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            host_interface: default_host_interface(),
            recovery_backoff_secs: default_recovery_backoff(),
            command_timeout_secs: default_command_timeout(),
            watch_interval_secs: default_watch_interval(),
            ip_command: default_ip_command(),
            iptables_command: default_iptables_command(),
            ip6tables_command: default_ip6tables_command(),
            elevation: ElevationMethod::default(),
            persist_state: true,
            audit_enabled: true,
        }
    }
}

fn default_host_interface() -> String {
    HOST_INTERFACE.to_string()
}

fn default_recovery_backoff() -> u64 {
    10
}

fn default_command_timeout() -> u64 {
    30
}

fn default_watch_interval() -> u64 {
    30
}

fn default_ip_command() -> String {
    "ip".to_string()
}

fn default_iptables_command() -> String {
    "iptables".to_string()
}

fn default_ip6tables_command() -> String {
    "ip6tables".to_string()
}

fn default_true() -> bool {
    true
}

impl AppConfig {
    /// Clamps out-of-range values, logging each correction.
    ///
    /// Intervals are clamped to 1..=3600 seconds; an empty host interface or
    /// command falls back to its default.
    pub fn validate(&mut self) {
        for (name, value, default) in [
            (
                "recovery_backoff_secs",
                &mut self.recovery_backoff_secs,
                default_recovery_backoff(),
            ),
            (
                "command_timeout_secs",
                &mut self.command_timeout_secs,
                default_command_timeout(),
            ),
            (
                "watch_interval_secs",
                &mut self.watch_interval_secs,
                default_watch_interval(),
            ),
        ] {
            if *value == 0 {
                warn!("{name} must be positive, using {default}");
                *value = default;
            } else if *value > MAX_INTERVAL_SECS {
                warn!("{name} clamped to {MAX_INTERVAL_SECS}");
                *value = MAX_INTERVAL_SECS;
            }
        }

        for (name, value, default) in [
            ("host_interface", &mut self.host_interface, default_host_interface()),
            ("ip_command", &mut self.ip_command, default_ip_command()),
            (
                "iptables_command",
                &mut self.iptables_command,
                default_iptables_command(),
            ),
            (
                "ip6tables_command",
                &mut self.ip6tables_command,
                default_ip6tables_command(),
            ),
        ] {
            if value.trim().is_empty() {
                warn!("{name} is empty, using {default}");
                *value = default;
            }
        }
    }

    pub fn recovery_backoff(&self) -> Duration {
        Duration::from_secs(self.recovery_backoff_secs)
    }

    pub fn watch_interval(&self) -> Duration {
        Duration::from_secs(self.watch_interval_secs)
    }

    pub fn kernel_config(&self) -> KernelConfig {
        KernelConfig {
            ip_command: self.ip_command.clone(),
            iptables_command: self.iptables_command.clone(),
            ip6tables_command: self.ip6tables_command.clone(),
            elevation: self.elevation,
            timeout: Duration::from_secs(self.command_timeout_secs),
        }
    }
}

/// Default location: `<config dir>/config.json`
pub fn default_config_path() -> Option<PathBuf> {
    get_config_dir().map(|dir| dir.join("config.json"))
}

/// Saves the config atomically (temp file with mode 0o600, then rename).
pub async fn save_config(config: &AppConfig, path: &Path) -> std::io::Result<()> {
    let json = serde_json::to_string_pretty(config)?;
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    crate::utils::write_atomic(path, json.as_bytes()).await
}

/// Loads the config from `path`, or returns defaults if it does not exist.
///
/// # Errors
///
/// Returns `Err` if the file exists but cannot be read or parsed.
pub async fn load_config(path: &Path) -> crate::Result<AppConfig> {
    let mut config = match tokio::fs::read_to_string(path).await {
        Ok(json) => serde_json::from_str::<AppConfig>(&json)?,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => AppConfig::default(),
        Err(e) => return Err(e.into()),
    };
    config.validate();
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = AppConfig::default();
        assert_eq!(config.host_interface, "host");
        assert_eq!(config.recovery_backoff(), Duration::from_secs(10));
        assert_eq!(config.kernel_config().timeout, Duration::from_secs(30));
        assert!(config.persist_state);
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config: AppConfig =
            serde_json::from_str(r#"{"elevation": "none", "watch_interval_secs": 5}"#).unwrap();
        assert_eq!(config.elevation, ElevationMethod::None);
        assert_eq!(config.watch_interval_secs, 5);
        assert_eq!(config.iptables_command, "iptables");
    }

    #[test]
    fn test_validate_clamps() {
        let mut config = AppConfig {
            recovery_backoff_secs: 0,
            command_timeout_secs: 999_999,
            host_interface: "  ".to_string(),
            ..AppConfig::default()
        };
        config.validate();

        assert_eq!(config.recovery_backoff_secs, 10);
        assert_eq!(config.command_timeout_secs, MAX_INTERVAL_SECS);
        assert_eq!(config.host_interface, "host");
    }

    #[tokio::test]
    async fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.json");

        let config = AppConfig {
            ip_command: "/usr/sbin/ip".to_string(),
            audit_enabled: false,
            ..AppConfig::default()
        };
        save_config(&config, &path).await.unwrap();

        assert_eq!(load_config(&path).await.unwrap(), config);
    }

    #[tokio::test]
    async fn test_missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = load_config(&dir.path().join("absent.json")).await.unwrap();
        assert_eq!(config, AppConfig::default());
    }

    #[tokio::test]
    async fn test_broken_file_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, "{not json").unwrap();
        assert!(load_config(&path).await.is_err());
    }
}
