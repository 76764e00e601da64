//! Diff & apply engine
//!
//! An [`Update`] compares the currently applied snapshot against a new one and
//! drives the kernel through the difference, one key at a time in key order:
//!
//! 1. Keys that disappeared are torn down, best effort.
//! 2. For every key of the new snapshot: skip it if its namespace already
//!    failed in this pass, ensure the namespace, update NAT, then update
//!    filter rules (hold, remove old, apply new).
//!
//! A failing step marks the namespace failed. The pass itself never returns an
//! error; the failed set in the [`PassReport`] drives recovery. The report
//! also carries the [`Residual`] of every failed namespace: the rule sets the
//! kernel may still hold there, which [`tear_down`] removes before the
//! namespace is applied again from scratch.

use crate::core::error::{Error, Step};
use crate::core::kernel::Kernel;
use crate::core::namespace::NamespaceManager;
use crate::core::rules::RuleSet;
use crate::core::state::StateSnapshot;
use serde::Serialize;
use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet, HashSet};
use tracing::{debug, error, info, warn};

/// Rule sets the kernel may still hold, per failed namespace
pub type Residual = BTreeMap<String, Vec<RuleSet>>;

/// Outcome of one reconciliation pass
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PassReport {
    /// Namespaces that failed at some step
    pub failed: BTreeSet<String>,
    /// Keys whose filter rules were (re)applied
    pub applied: usize,
    /// Stale keys torn down
    pub removed: usize,
    /// Keys whose filter rules needed no change
    pub unchanged: usize,
    /// Keys whose NAT configuration changed
    pub nat_updated: usize,
    /// What each failed namespace may still hold in the kernel
    #[serde(skip)]
    pub residual: Residual,
}

impl PassReport {
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }

    pub fn root_failed(&self) -> bool {
        self.failed.contains(crate::core::rules::ROOT_NAMESPACE)
    }
}

/// One reconciliation transaction: `old` to `new`
pub struct Update<'a, K> {
    kernel: &'a K,
    old: &'a StateSnapshot,
    new: &'a StateSnapshot,
    namespaces: NamespaceManager<'a, K>,
    host_interface: &'a str,
    report: PassReport,
}

impl<'a, K: Kernel> Update<'a, K> {
    /// `namespaces` lists the namespaces known to exist on the host.
    /// `host_interface` names the physical host interface, which is replaced
    /// without a hold.
    pub fn new(
        kernel: &'a K,
        old: &'a StateSnapshot,
        new: &'a StateSnapshot,
        namespaces: Vec<String>,
        host_interface: &'a str,
    ) -> Self {
        Self {
            kernel,
            old,
            new,
            namespaces: NamespaceManager::new(kernel, namespaces),
            host_interface,
            report: PassReport::default(),
        }
    }

    /// Runs the pass to completion.
    pub async fn apply(mut self) -> PassReport {
        self.remove_stale().await;

        let new = self.new;
        for rules in new.rule_sets() {
            self.apply_key(rules).await;
        }

        if self.report.is_clean() {
            debug!(
                applied = self.report.applied,
                removed = self.report.removed,
                unchanged = self.report.unchanged,
                "Reconciliation pass complete"
            );
        } else {
            warn!(
                failed = ?self.report.failed,
                applied = self.report.applied,
                "Reconciliation pass completed with failed namespaces"
            );
        }

        self.report
    }

    fn mark_failed(&mut self, rules: &RuleSet, step: Step, err: &Error) {
        let hint = err.failure_kind().map(|kind| kind.hint());
        error!(
            namespace = %rules.namespace,
            interface = %rules.interface,
            step = %step,
            error = %err,
            hint,
            "Namespace step failed"
        );

        let residual = self.residual(rules, step);
        self.report.residual.insert(rules.namespace.clone(), residual);
        self.report.failed.insert(rules.namespace.clone());
    }

    /// Rule sets left in `failing`'s namespace once the pass stops there:
    /// new rule sets for the keys already done, whatever the failed `step`
    /// left behind for `failing`, old rule sets for the keys not reached.
    fn residual(&self, failing: &RuleSet, step: Step) -> Vec<RuleSet> {
        // The namespace was never created
        if step == Step::NamespaceAdd {
            return Vec::new();
        }

        let failing_key = failing.key();
        let mut residual = Vec::new();

        for rules in self
            .new
            .rule_sets()
            .filter(|rules| rules.namespace == failing.namespace)
        {
            let key = rules.key();
            let old = self.old.get(&key).cloned();

            match key.cmp(&failing_key) {
                Ordering::Less => residual.push(rules.clone()),
                Ordering::Equal => match step {
                    Step::RemoveNat | Step::Hold | Step::Remove => residual.extend(old),
                    Step::ApplyNat => {
                        residual.extend(old);
                        residual.push(rules.clone());
                    }
                    _ => residual.push(rules.clone()),
                },
                Ordering::Greater => residual.extend(old),
            }
        }

        residual
    }

    async fn remove_stale(&mut self) {
        let old = self.old;
        for key in old.stale_keys(self.new) {
            let Some(rules) = old.get(key) else {
                continue;
            };

            info!(
                namespace = %key.namespace,
                interface = %key.interface,
                "Removing stale interface rules"
            );
            self.report.removed += 1;

            if let Err(e) = self.kernel.remove(rules).await {
                error!(
                    namespace = %key.namespace,
                    interface = %key.interface,
                    step = %Step::RemoveStale,
                    error = %e,
                    "Failed to remove stale interface rules"
                );
            }

            if rules.wants_nat()
                && let Err(e) = self.kernel.remove_nat(rules).await
            {
                error!(
                    namespace = %key.namespace,
                    interface = %key.interface,
                    step = %Step::RemoveStale,
                    error = %e,
                    "Failed to remove stale NAT rules"
                );
            }
        }
    }

    async fn apply_key(&mut self, rules: &RuleSet) {
        let namespace = rules.namespace.as_str();
        let interface = rules.interface.as_str();

        if self.report.failed.contains(namespace) {
            warn!(namespace, interface, "Skipping failed namespace");
            return;
        }

        if let Err(e) = self.namespaces.ensure(namespace).await {
            self.mark_failed(rules, Step::NamespaceAdd, &e);
            return;
        }

        let old_snapshot = self.old;
        let old = old_snapshot.get(&rules.key());

        if !self.update_nat(rules, old).await {
            return;
        }
        self.update_filter(rules, old).await;
    }

    /// Returns false if the namespace failed.
    async fn update_nat(&mut self, rules: &RuleSet, old: Option<&RuleSet>) -> bool {
        let namespace = rules.namespace.as_str();
        let interface = rules.interface.as_str();

        if rules.wants_nat() && old.is_none_or(|old| rules.nat_differs(old)) {
            info!(namespace, interface, "Updating NAT");

            if let Some(old) = old.filter(|old| old.wants_nat())
                && let Err(e) = self.kernel.remove_nat(old).await
            {
                self.mark_failed(rules, Step::RemoveNat, &e);
                return false;
            }

            if let Err(e) = self.kernel.apply_nat(rules).await {
                self.mark_failed(rules, Step::ApplyNat, &e);
                return false;
            }

            self.report.nat_updated += 1;
        } else if let Some(old) = old.filter(|old| old.wants_nat() && !rules.wants_nat()) {
            info!(namespace, interface, "Removing NAT");

            if let Err(e) = self.kernel.remove_nat(old).await {
                self.mark_failed(rules, Step::RemoveNat, &e);
                return false;
            }

            self.report.nat_updated += 1;
        }

        true
    }

    async fn update_filter(&mut self, rules: &RuleSet, old: Option<&RuleSet>) {
        let namespace = rules.namespace.as_str();
        let interface = rules.interface.as_str();

        if let Some(old) = old {
            if !rules.filter_differs(old) {
                self.report.unchanged += 1;
                return;
            }

            info!(namespace, interface, "Replacing filter rules");

            if interface != self.host_interface
                && let Err(e) = self.kernel.hold(rules).await
            {
                self.mark_failed(rules, Step::Hold, &e);
                return;
            }

            if let Err(e) = self.kernel.remove(old).await {
                self.mark_failed(rules, Step::Remove, &e);
                return;
            }
        } else {
            info!(
                namespace,
                interface,
                rules = rules.filter_rule_count(),
                "Applying filter rules"
            );
        }

        if let Err(e) = self.kernel.apply(rules).await {
            self.mark_failed(rules, Step::Apply, &e);
            return;
        }

        self.report.applied += 1;
    }
}

/// Removes the filter and NAT rules in `residual`, best effort.
///
/// Hold rules stay in place; applying the namespace again lifts them.
pub async fn tear_down<K: Kernel>(kernel: &K, residual: &Residual) {
    for rules in residual.values().flatten() {
        debug!(
            namespace = %rules.namespace,
            interface = %rules.interface,
            "Tearing down rules"
        );

        if let Err(e) = kernel.remove(rules).await {
            warn!(
                namespace = %rules.namespace,
                interface = %rules.interface,
                error = %e,
                "Teardown of failed namespace rules failed"
            );
        }

        if rules.wants_nat()
            && let Err(e) = kernel.remove_nat(rules).await
        {
            warn!(
                namespace = %rules.namespace,
                interface = %rules.interface,
                error = %e,
                "Teardown of failed namespace NAT failed"
            );
        }
    }
}

/// Tears down `residual` and returns `snapshot` without its namespaces: the
/// base a pass diffs against so those namespaces are applied from scratch.
pub async fn clear_residual<K: Kernel>(
    kernel: &K,
    snapshot: &StateSnapshot,
    residual: &Residual,
) -> StateSnapshot {
    tear_down(kernel, residual).await;
    let failed: HashSet<String> = residual.keys().cloned().collect();
    snapshot.without_namespaces(&failed)
}
