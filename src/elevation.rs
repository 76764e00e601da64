//! Privilege elevation for kernel-facing commands
//!
//! netrecon normally runs as root on the hypervisor node, in which case `ip`
//! and `iptables` are executed directly. When started as an unprivileged user
//! (development, dry runs against a test host) commands are wrapped in
//! `run0` or `sudo`.
//!
//! # Elevation Strategy
//!
//! - **Root**: run the program directly
//! - **Preferred**: `run0` when available (systemd v256+, no SUID)
//! - **Fallback**: `sudo`
//!
//! # Environment Variables
//!
//! - `NETRECON_ELEVATION_METHOD`: Force a specific method (`none`, `sudo`, `run0`),
//!   overriding the configured one. Useful with sudoers NOPASSWD rules.
//!
//! # Security
//!
//! - Only `ip`, `iptables` and `ip6tables` (as configured) are ever elevated
//! - Commands are constructed without shell interpolation
//! - Wrapper binaries are checked for availability

use serde::{Deserialize, Serialize};
use std::io;
use tokio::process::Command;

/// Error type for privilege elevation operations
#[derive(Debug, thiserror::Error)]
pub enum ElevationError {
    /// Requested elevation method is not available (binary not found)
    #[error("Elevation method '{0}' is not available (binary not found)")]
    MethodNotAvailable(String),

    /// Invalid value for `NETRECON_ELEVATION_METHOD`
    #[error("Invalid NETRECON_ELEVATION_METHOD '{0}'. Valid options: none, sudo, run0")]
    InvalidMethod(String),

    /// Not root and no wrapper binary found
    #[error("Not running as root and neither run0 nor sudo is available")]
    NoWrapper,

    /// Generic I/O error
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// How privileged commands are launched
#[derive(
    Debug,
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(ascii_case_insensitive)]
pub enum ElevationMethod {
    /// Direct when root, otherwise run0, otherwise sudo
    #[default]
    #[strum(serialize = "auto")]
    Auto,
    /// Never wrap (tests, containers with CAP_NET_ADMIN)
    #[strum(serialize = "none")]
    None,
    #[strum(serialize = "sudo")]
    Sudo,
    #[strum(serialize = "run0")]
    Run0,
}

/// Checks if a binary exists in PATH
pub(crate) fn binary_exists(name: &str) -> bool {
    std::env::var_os("PATH")
        .and_then(|paths| {
            std::env::split_paths(&paths).find_map(|dir| {
                let full_path = dir.join(name);
                if full_path.is_file() {
                    Some(full_path)
                } else {
                    None
                }
            })
        })
        .is_some()
}

/// Resolves the effective method from the configured one and the value of
/// `NETRECON_ELEVATION_METHOD`, if set.
fn effective_method(
    configured: ElevationMethod,
    env_override: Option<String>,
) -> Result<ElevationMethod, ElevationError> {
    match env_override {
        Some(value) if !value.is_empty() => value
            .parse::<ElevationMethod>()
            .map_err(|_| ElevationError::InvalidMethod(value.to_lowercase())),
        _ => Ok(configured),
    }
}

fn wrapped(wrapper: &str, program: &str, args: &[&str]) -> Command {
    let mut cmd = Command::new(wrapper);
    cmd.arg(program).args(args);
    cmd
}

fn direct(program: &str, args: &[&str]) -> Command {
    let mut cmd = Command::new(program);
    cmd.args(args);
    cmd
}

/// Builds a command for `program`, elevated according to `method`.
///
/// Arguments are passed without shell interpretation. Callers must validate
/// namespace and interface names before they reach this function.
///
/// # Errors
///
/// Returns `Err` if the method is invalid or its wrapper binary is missing.
pub fn privileged_command(
    method: ElevationMethod,
    program: &str,
    args: &[&str],
) -> Result<Command, ElevationError> {
    let env_override = std::env::var("NETRECON_ELEVATION_METHOD").ok();
    match effective_method(method, env_override)? {
        ElevationMethod::None => Ok(direct(program, args)),
        ElevationMethod::Sudo => {
            if !binary_exists("sudo") {
                return Err(ElevationError::MethodNotAvailable("sudo".into()));
            }
            Ok(wrapped("sudo", program, args))
        }
        ElevationMethod::Run0 => {
            if !binary_exists("run0") {
                return Err(ElevationError::MethodNotAvailable("run0".into()));
            }
            Ok(wrapped("run0", program, args))
        }
        ElevationMethod::Auto => {
            if nix::unistd::getuid().is_root() {
                return Ok(direct(program, args));
            }
            if binary_exists("run0") {
                return Ok(wrapped("run0", program, args));
            }
            if binary_exists("sudo") {
                return Ok(wrapped("sudo", program, args));
            }
            Err(ElevationError::NoWrapper)
        }
    }
}
