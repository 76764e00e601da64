//! netrecon - network state reconciliation for hypervisor nodes
//!
//! Keeps the kernel's network namespaces, NAT and packet filter rules in line
//! with the instances placed on a node, one interface at a time.
//!
//! # Architecture
//!
//! - [`core`] - Rule sets, snapshots, the reconciliation pass and the kernel backend
//! - [`watcher`] - Domain document source and the periodic driver
//! - [`init`] - Startup plan run before the first pass
//! - [`audit`] - Audit logging for every privileged pass
//! - [`validators`] - Input validation and sanitization
//! - [`config`] - Configuration persistence
//! - [`elevation`] - Privilege escalation for `ip`/`iptables`
//! - [`utils`] - Utility functions (XDG directories, atomic writes)
//!
//! # Safety Features
//!
//! - A failure in one namespace never stops the pass for the others
//! - Existing rules are held closed while they are replaced
//! - Node recovery and full reload after failed passes
//! - SHA-256 checksums on the persisted applied state
//! - Atomic file operations with secure permissions

// Allow pedantic clippy warnings that are not worth fixing for this codebase
#![allow(clippy::must_use_candidate)]
#![allow(clippy::return_self_not_must_use)]
#![allow(clippy::needless_lifetimes)]
#![allow(clippy::uninlined_format_args)]
#![allow(clippy::too_many_lines)]
#![allow(clippy::missing_errors_doc)]

pub mod audit;
pub mod config;
pub mod core;
pub mod elevation;
pub mod init;
pub mod utils;
pub mod validators;
pub mod watcher;

// Re-export commonly used types
pub use core::error::{Error, Result};
pub use core::rules::{RuleKey, RuleSet};
pub use core::state::StateSnapshot;
