//! Startup plan
//!
//! Startup work is declared as named steps, each with an optional
//! predecessor, and resolved into one order before the first reconciliation
//! pass runs. Nothing registers itself; [`startup_plan`] is the whole list.

use crate::audit::AuditLog;
use crate::config::{self, AppConfig};
use crate::core::error::{Error, Result};
use crate::core::state::StateSnapshot;
use crate::core::store::SnapshotStore;
use crate::core::update::Residual;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

struct Planned<T> {
    name: &'static str,
    after: Option<&'static str>,
    step: T,
}

/// Named steps with declared predecessors
pub struct InitPlan<T> {
    steps: Vec<Planned<T>>,
}

impl<T> Default for InitPlan<T> {
    fn default() -> Self {
        Self { steps: Vec::new() }
    }
}

impl<T> InitPlan<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds `step` under `name`, to run after `after` if given.
    pub fn step(mut self, name: &'static str, after: Option<&'static str>, step: T) -> Self {
        self.steps.push(Planned { name, after, step });
        self
    }

    /// Orders the steps so every step runs after its predecessor. Steps that
    /// are ready at the same time keep their declaration order.
    ///
    /// # Errors
    ///
    /// Returns `Error::Init` on a duplicate name, an unknown predecessor or a
    /// cycle.
    pub fn resolve(self) -> Result<Vec<(&'static str, T)>> {
        let mut names = HashSet::new();
        for planned in &self.steps {
            if !names.insert(planned.name) {
                return Err(Error::Init(format!("duplicate step '{}'", planned.name)));
            }
        }
        for planned in &self.steps {
            if let Some(after) = planned.after
                && !names.contains(after)
            {
                return Err(Error::Init(format!(
                    "step '{}' runs after unknown step '{after}'",
                    planned.name
                )));
            }
        }

        let mut pending: Vec<Option<Planned<T>>> = self.steps.into_iter().map(Some).collect();
        let mut done: HashSet<&'static str> = HashSet::new();
        let mut order = Vec::with_capacity(pending.len());

        while order.len() < pending.len() {
            let ready = pending.iter().position(|slot| {
                slot.as_ref()
                    .is_some_and(|p| p.after.is_none_or(|after| done.contains(after)))
            });

            let Some(index) = ready else {
                let stuck: Vec<&str> = pending.iter().flatten().map(|p| p.name).collect();
                return Err(Error::Init(format!("cycle between steps {stuck:?}")));
            };

            if let Some(planned) = pending[index].take() {
                done.insert(planned.name);
                order.push((planned.name, planned.step));
            }
        }

        Ok(order)
    }
}

/// Work done before the watcher starts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartupStep {
    EnsureDirs,
    LoadConfig,
    CheckTools,
    RestoreState,
}

pub fn startup_plan() -> InitPlan<StartupStep> {
    InitPlan::new()
        .step("dirs", None, StartupStep::EnsureDirs)
        .step("config", Some("dirs"), StartupStep::LoadConfig)
        .step("tools", Some("config"), StartupStep::CheckTools)
        .step("restore-state", Some("config"), StartupStep::RestoreState)
}

/// Result of running the startup plan
#[derive(Debug, Clone)]
pub struct Startup {
    pub config: AppConfig,
    pub config_path: PathBuf,
    /// Snapshot the first pass diffs against
    pub initial_state: StateSnapshot,
    /// Namespaces the last pass before the restart left failed
    pub residual: Residual,
}

/// Returns true if `command` is an existing path or found in `PATH`.
pub fn command_available(command: &str) -> bool {
    if command.contains('/') {
        return Path::new(command).is_file();
    }
    crate::elevation::binary_exists(command)
}

/// Resolves and runs [`startup_plan`].
///
/// `config_path` overrides `<config dir>/config.json`.
///
/// # Errors
///
/// Returns `Err` if the plan cannot be resolved, the config cannot be read,
/// or a configured command is missing.
pub async fn run_startup(config_path: Option<PathBuf>) -> Result<Startup> {
    let config_path = config_path
        .or_else(config::default_config_path)
        .ok_or_else(|| Error::Init("no config directory available".to_string()))?;

    let mut config = AppConfig::default();
    let mut initial_state = StateSnapshot::empty();
    let mut residual = Residual::new();

    let order = startup_plan().resolve()?;
    debug!("Startup plan: {}", describe_plan(&order));

    for (name, step) in order {
        debug!(step = name, "Running startup step");
        match step {
            StartupStep::EnsureDirs => crate::utils::ensure_dirs()?,
            StartupStep::LoadConfig => {
                config = config::load_config(&config_path).await?;
                if !tokio::fs::try_exists(&config_path).await.unwrap_or(true)
                    && let Err(e) = config::save_config(&config, &config_path).await
                {
                    warn!("Failed to write default config to {}: {e}", config_path.display());
                }
            }
            StartupStep::CheckTools => {
                for command in [
                    &config.ip_command,
                    &config.iptables_command,
                    &config.ip6tables_command,
                ] {
                    if !command_available(command) {
                        return Err(Error::Init(format!("required command not found: {command}")));
                    }
                }
            }
            StartupStep::RestoreState => {
                if config.persist_state {
                    (initial_state, residual) = restore_state(config.audit_enabled).await;
                }
            }
        }
    }

    info!(
        config = %config_path.display(),
        restored_keys = initial_state.len(),
        failed_namespaces = residual.len(),
        "Startup complete"
    );

    Ok(Startup {
        config,
        config_path,
        initial_state,
        residual,
    })
}

async fn restore_state(audit_enabled: bool) -> (StateSnapshot, Residual) {
    let store = match SnapshotStore::from_state_dir() {
        Ok(store) => store,
        Err(e) => {
            warn!(error = %e, "Applied state cannot be restored");
            return (StateSnapshot::empty(), Residual::new());
        }
    };

    let (snapshot, residual) = store.load_or_empty().await;

    if audit_enabled && let Ok(audit) = AuditLog::new() {
        audit.log_restore_state(snapshot.len(), None).await;
    }

    (snapshot, residual)
}

/// Renders a resolved plan as `a -> b -> c`.
pub fn describe_plan<T>(order: &[(&'static str, T)]) -> String {
    order
        .iter()
        .map(|(name, _)| *name)
        .collect::<Vec<_>>()
        .join(" -> ")
}
