//! Shared test utilities for core module tests
//!
//! Provides a recording [`MockKernel`] with failure injection, an in-memory
//! [`MemorySource`], and rule set builders. This module is only compiled in
//! test mode.

use crate::core::desired::{DomainData, DomainSource};
use crate::core::error::{Error, Result};
use crate::core::kernel::{Kernel, KernelOp};
use crate::core::rules::{RuleSet, rule_args};
use crate::core::state::StateSnapshot;
use std::collections::HashSet;
use std::net::Ipv4Addr;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Operation names accepted by [`MockKernel::fail`], as in [`KernelOp::name`]
pub const OP_CREATE: &str = "create-namespace";

struct Failure {
    op: &'static str,
    namespace: String,
    output: String,
    /// `None` fails forever
    remaining: Option<usize>,
}

/// Kernel double that records every attempted operation.
///
/// An operation is recorded before its injected failure is evaluated, so a
/// failing call still shows up in [`MockKernel::ops`].
#[derive(Default)]
pub struct MockKernel {
    ops: Mutex<Vec<KernelOp>>,
    namespaces: Mutex<HashSet<String>>,
    failures: Mutex<Vec<Failure>>,
    yield_between_ops: bool,
    list_calls: AtomicUsize,
}

impl MockKernel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Yields to the scheduler inside every operation, for interleaving tests.
    pub fn yielding() -> Self {
        Self {
            yield_between_ops: true,
            ..Self::default()
        }
    }

    /// Namespaces reported by `list_namespaces` (and treated as existing).
    pub fn with_namespaces(self, namespaces: &[&str]) -> Self {
        lock(&self.namespaces).extend(namespaces.iter().map(|ns| (*ns).to_string()));
        self
    }

    /// Fails every `op` on `namespace` with `output` as the command output.
    pub fn fail(&self, op: &'static str, namespace: &str, output: &str) {
        self.push_failure(op, namespace, output, None);
    }

    /// Fails the next `times` matching calls, then succeeds.
    pub fn fail_times(&self, op: &'static str, namespace: &str, output: &str, times: usize) {
        self.push_failure(op, namespace, output, Some(times));
    }

    fn push_failure(
        &self,
        op: &'static str,
        namespace: &str,
        output: &str,
        remaining: Option<usize>,
    ) {
        lock(&self.failures).push(Failure {
            op,
            namespace: namespace.to_string(),
            output: output.to_string(),
            remaining,
        });
    }

    pub fn ops(&self) -> Vec<KernelOp> {
        lock(&self.ops).clone()
    }

    pub fn take_ops(&self) -> Vec<KernelOp> {
        std::mem::take(&mut *lock(&self.ops))
    }

    pub fn list_calls(&self) -> usize {
        self.list_calls.load(Ordering::SeqCst)
    }

    async fn record(&self, op: KernelOp) -> Result<()> {
        if self.yield_between_ops {
            tokio::task::yield_now().await;
        }

        let name = op.name();
        let namespace = op.namespace().to_string();
        lock(&self.ops).push(op);

        let mut failures = lock(&self.failures);
        let Some(failure) = failures
            .iter_mut()
            .find(|f| f.op == name && f.namespace == namespace && f.remaining != Some(0))
        else {
            return Ok(());
        };

        if let Some(remaining) = failure.remaining.as_mut() {
            *remaining -= 1;
        }

        if name == OP_CREATE && failure.output.contains("File exists") {
            return Err(Error::AlreadyExists(namespace));
        }

        Err(Error::Command {
            program: format!("mock {name}"),
            message: failure.output.clone(),
            output: failure.output.clone(),
            exit_code: Some(1),
        })
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex
        .lock()
        .unwrap_or_else(std::sync::PoisonError::into_inner)
}

impl Kernel for MockKernel {
    async fn list_namespaces(&self) -> Result<Vec<String>> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);
        let mut namespaces: Vec<String> = lock(&self.namespaces).iter().cloned().collect();
        namespaces.sort();
        Ok(namespaces)
    }

    async fn create_namespace(&self, namespace: &str) -> Result<()> {
        self.record(KernelOp::CreateNamespace(namespace.to_string()))
            .await?;
        lock(&self.namespaces).insert(namespace.to_string());
        Ok(())
    }

    async fn apply_nat(&self, rules: &RuleSet) -> Result<()> {
        self.record(KernelOp::ApplyNat(rules.clone())).await
    }

    async fn remove_nat(&self, rules: &RuleSet) -> Result<()> {
        self.record(KernelOp::RemoveNat(rules.clone())).await
    }

    async fn hold(&self, rules: &RuleSet) -> Result<()> {
        self.record(KernelOp::Hold(rules.clone())).await
    }

    async fn apply(&self, rules: &RuleSet) -> Result<()> {
        self.record(KernelOp::Apply(rules.clone())).await
    }

    async fn remove(&self, rules: &RuleSet) -> Result<()> {
        self.record(KernelOp::Remove(rules.clone())).await
    }

    async fn recover_node(&self) -> Result<()> {
        self.record(KernelOp::RecoverNode).await
    }
}

/// Domain source returning a fixed document, or failing
#[derive(Default)]
pub struct MemorySource {
    data: Mutex<Option<DomainData>>,
    loads: AtomicUsize,
}

impl MemorySource {
    pub fn new(data: DomainData) -> Self {
        Self {
            data: Mutex::new(Some(data)),
            loads: AtomicUsize::new(0),
        }
    }

    /// A source whose every load fails.
    pub fn failing() -> Self {
        Self::default()
    }

    pub fn set(&self, data: DomainData) {
        *lock(&self.data) = Some(data);
    }

    pub fn loads(&self) -> usize {
        self.loads.load(Ordering::SeqCst)
    }
}

impl DomainSource for MemorySource {
    async fn load(&self) -> Result<DomainData> {
        self.loads.fetch_add(1, Ordering::SeqCst);
        lock(&self.data)
            .clone()
            .ok_or_else(|| Error::Reload("domain data unavailable".to_string()))
    }
}

/// Rule set with a single ingress rule accepting `port`.
pub fn ingress_rules(namespace: &str, interface: &str, port: u16) -> RuleSet {
    let mut rules = RuleSet::new(namespace, interface);
    rules.ingress = vec![rule_args(&[
        "FORWARD",
        "-o",
        interface,
        "-p",
        "tcp",
        "--dport",
        &port.to_string(),
        "-j",
        "ACCEPT",
    ])];
    rules.holds = vec![rule_args(&["FORWARD", "-o", interface, "-j", "DROP"])];
    rules
}

/// Like [`ingress_rules`], with IPv4 NAT between `10.0.0.<host>` and
/// `203.0.113.<host>`.
pub fn nat_rules(namespace: &str, interface: &str, port: u16, host: u8) -> RuleSet {
    let mut rules = ingress_rules(namespace, interface, port);
    rules.nat = true;
    rules.nat_addr = Some(Ipv4Addr::new(10, 0, 0, host));
    rules.nat_pub_addr = Some(Ipv4Addr::new(203, 0, 113, host));
    rules
}

pub fn snapshot(rule_sets: Vec<RuleSet>) -> StateSnapshot {
    StateSnapshot::from_rule_sets(rule_sets).unwrap()
}
