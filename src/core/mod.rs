//! Core reconciliation functionality
//!
//! - [`rules`]: Per-interface rule sets and their keys
//! - [`state`]: Immutable snapshots of all rule sets on a node
//! - [`desired`]: Domain data and the desired-state builder
//! - [`kernel`]: The kernel backend trait, the `ip`/`iptables` backend and a dry-run recorder
//! - [`namespace`]: Namespace existence tracking within a pass
//! - [`update`]: One reconciliation pass with per-namespace failure isolation
//! - [`reconciler`]: Snapshot ownership, recovery and reload
//! - [`store`]: Persisted applied state
//! - [`plan`]: Dry-run planning and rule diffs
//! - [`error`]: Error types

pub mod desired;
pub mod error;
pub mod exec;
pub mod kernel;
pub mod namespace;
pub mod plan;
pub mod reconciler;
pub mod rules;
pub mod state;
pub mod store;
pub mod update;

#[cfg(test)]
pub mod test_helpers;
