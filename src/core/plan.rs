//! Dry-run planning
//!
//! Runs a full pass against a [`DryRunKernel`] so the operations a real pass
//! would issue can be shown without touching the kernel, including the
//! teardown of namespaces the last pass left failed.

use crate::core::kernel::{DryRunKernel, KernelOp};
use crate::core::state::StateSnapshot;
use crate::core::update::{PassReport, Residual, Update, clear_residual};
use similar::{ChangeTag, TextDiff};
use std::fmt::Write;

/// Operations and rule diff between two snapshots
#[derive(Debug, Clone)]
pub struct Plan {
    pub ops: Vec<KernelOp>,
    pub report: PassReport,
    /// Line diff of the rendered snapshots, `+`/`-` prefixed
    pub diff: String,
}

impl Plan {
    pub fn is_noop(&self) -> bool {
        self.ops.is_empty()
    }
}

/// Plans the pass from `current` to `desired`.
pub async fn plan(
    current: &StateSnapshot,
    residual: &Residual,
    desired: &StateSnapshot,
    namespaces: Vec<String>,
    host_interface: &str,
) -> Plan {
    let kernel = DryRunKernel::new(namespaces.clone());
    let base = clear_residual(&kernel, current, residual).await;
    let report = Update::new(&kernel, &base, desired, namespaces, host_interface)
        .apply()
        .await;

    Plan {
        ops: kernel.take_ops(),
        report,
        diff: render_diff(&base.render(), &desired.render()),
    }
}

/// Changed lines only; unchanged lines are dropped.
pub fn render_diff(old_text: &str, new_text: &str) -> String {
    let diff = TextDiff::from_lines(old_text, new_text);
    let mut out = String::new();

    for change in diff.iter_all_changes() {
        let sign = match change.tag() {
            ChangeTag::Delete => '-',
            ChangeTag::Insert => '+',
            ChangeTag::Equal => continue,
        };
        let _ = writeln!(out, "{sign} {}", change.value().trim_end_matches('\n'));
    }

    out
}
