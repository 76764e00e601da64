//! Kernel-facing primitives
//!
//! The reconciliation engine only talks to the host through [`Kernel`]. The
//! production backend, [`IptablesKernel`], drives iproute2 and
//! iptables/ip6tables; rules for a non-root namespace run under
//! `ip netns exec <namespace>`. [`DryRunKernel`] records the operations a pass
//! would perform without touching the host.
//!
//! # Filter replacement
//!
//! `hold` appends the new rule set's hold rules (allow established, drop the
//! rest). `remove` deletes the old filter rules. `apply` appends the new
//! filter rules and then deletes the hold rules, so traffic on the interface
//! is never unfiltered while rules are swapped.

use crate::core::error::{Error, FailureKind, Result};
use crate::core::exec;
use crate::core::rules::{ROOT_NAMESPACE, RuleArgs, RuleSet};
use crate::elevation::{ElevationMethod, privileged_command};
use std::fmt;
use std::future::Future;
use std::sync::Mutex;
use std::time::Duration;
use tracing::{debug, info};

/// Output fragments of `iptables -D` for a rule that is not installed
const MISSING_RULE_PATTERNS: &[&str] = &[
    "does a matching rule exist",
    "Bad rule",
    "No chain/target/match by that name",
];

pub trait Kernel: Send + Sync {
    /// Lists the network namespaces that currently exist on the host.
    fn list_namespaces(&self) -> impl Future<Output = Result<Vec<String>>> + Send;

    /// Creates a namespace. Returns `Error::AlreadyExists` if it is present.
    fn create_namespace(&self, namespace: &str) -> impl Future<Output = Result<()>> + Send;

    fn apply_nat(&self, rules: &RuleSet) -> impl Future<Output = Result<()>> + Send;

    fn remove_nat(&self, rules: &RuleSet) -> impl Future<Output = Result<()>> + Send;

    /// Installs the transitional hold rules of `rules`.
    fn hold(&self, rules: &RuleSet) -> impl Future<Output = Result<()>> + Send;

    /// Installs the filter rules of `rules` and lifts any hold.
    fn apply(&self, rules: &RuleSet) -> impl Future<Output = Result<()>> + Send;

    /// Deletes the filter rules of `rules`.
    fn remove(&self, rules: &RuleSet) -> impl Future<Output = Result<()>> + Send;

    /// Checks that the host's own (root namespace) packet filter is usable
    /// again. The reload that follows rebuilds the root rule set; chain
    /// policies are left as they are.
    fn recover_node(&self) -> impl Future<Output = Result<()>> + Send;
}

/// Settings for the iptables backend
#[derive(Debug, Clone)]
pub struct KernelConfig {
    pub ip_command: String,
    pub iptables_command: String,
    pub ip6tables_command: String,
    pub elevation: ElevationMethod,
    pub timeout: Duration,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            ip_command: "ip".to_string(),
            iptables_command: "iptables".to_string(),
            ip6tables_command: "ip6tables".to_string(),
            elevation: ElevationMethod::Auto,
            timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Family {
    V4,
    V6,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Verb {
    Append,
    Delete,
}

impl Verb {
    const fn flag(self) -> &'static str {
        match self {
            Verb::Append => "-A",
            Verb::Delete => "-D",
        }
    }
}

/// Builds the iptables argument list for one rule.
///
/// `["FORWARD", "-j", "DROP"]` with `Verb::Append` becomes
/// `["-w", "-A", "FORWARD", "-j", "DROP"]`, with an optional `-t <table>`.
fn iptables_args(table: Option<&str>, verb: Verb, rule: &[String]) -> Vec<String> {
    let mut args = vec!["-w".to_string()];
    if let Some(table) = table {
        args.push("-t".to_string());
        args.push(table.to_string());
    }
    args.push(verb.flag().to_string());
    args.extend(rule.iter().cloned());
    args
}

fn missing_field(rules: &RuleSet, field: &str) -> Error {
    Error::validation(field, format!("{} requests NAT without {field}", rules.key()))
}

/// NAT rules (`nat` table) for every NAT variant requested by `rules`.
///
/// # Errors
///
/// Returns `Err` if a requested variant is missing one of its addresses.
pub fn nat_rules(rules: &RuleSet) -> Result<Vec<(Family, RuleArgs)>> {
    let mut out = Vec::new();

    let mut pair = |family: Family, private: String, public: String| {
        out.push((
            family,
            vec![
                "POSTROUTING".to_string(),
                "-s".to_string(),
                private.clone(),
                "-j".to_string(),
                "SNAT".to_string(),
                "--to-source".to_string(),
                public.clone(),
            ],
        ));
        out.push((
            family,
            vec![
                "PREROUTING".to_string(),
                "-d".to_string(),
                public,
                "-j".to_string(),
                "DNAT".to_string(),
                "--to-destination".to_string(),
                private,
            ],
        ));
    };

    if rules.nat {
        let private = rules.nat_addr.ok_or_else(|| missing_field(rules, "nat_addr"))?;
        let public = rules
            .nat_pub_addr
            .ok_or_else(|| missing_field(rules, "nat_pub_addr"))?;
        pair(Family::V4, private.to_string(), public.to_string());
    }

    if rules.nat6 {
        let private = rules
            .nat_addr6
            .ok_or_else(|| missing_field(rules, "nat_addr6"))?;
        let public = rules
            .nat_pub_addr6
            .ok_or_else(|| missing_field(rules, "nat_pub_addr6"))?;
        pair(Family::V6, private.to_string(), public.to_string());
    }

    if rules.oracle_nat {
        let private = rules
            .oracle_nat_addr
            .ok_or_else(|| missing_field(rules, "oracle_nat_addr"))?;
        let public = rules
            .oracle_nat_pub_addr
            .ok_or_else(|| missing_field(rules, "oracle_nat_pub_addr"))?;
        pair(Family::V4, private.to_string(), public.to_string());
    }

    Ok(out)
}

/// Production backend driving iproute2 and iptables
#[derive(Debug, Clone)]
pub struct IptablesKernel {
    config: KernelConfig,
}

impl IptablesKernel {
    pub fn new(config: KernelConfig) -> Self {
        Self { config }
    }

    fn tool(&self, family: Family) -> &str {
        match family {
            Family::V4 => &self.config.iptables_command,
            Family::V6 => &self.config.ip6tables_command,
        }
    }

    async fn ip(&self, args: &[&str], ignore: &[&str]) -> Result<String> {
        let mut cmd = privileged_command(self.config.elevation, &self.config.ip_command, args)?;
        exec::run_combined(&mut cmd, ignore, self.config.timeout).await
    }

    /// Runs iptables/ip6tables inside `namespace`.
    async fn table(
        &self,
        namespace: &str,
        family: Family,
        args: &[String],
        ignore: &[&str],
    ) -> Result<()> {
        let tool = self.tool(family);
        let args: Vec<&str> = args.iter().map(String::as_str).collect();

        let mut cmd = if namespace == ROOT_NAMESPACE {
            privileged_command(self.config.elevation, tool, &args)?
        } else {
            let mut full = vec!["netns", "exec", namespace, tool];
            full.extend(args);
            privileged_command(self.config.elevation, &self.config.ip_command, &full)?
        };

        exec::run_combined(&mut cmd, ignore, self.config.timeout).await?;
        Ok(())
    }

    async fn rules(
        &self,
        namespace: &str,
        family: Family,
        verb: Verb,
        rules: &[RuleArgs],
    ) -> Result<()> {
        let ignore = match verb {
            Verb::Append => &[][..],
            Verb::Delete => MISSING_RULE_PATTERNS,
        };
        for rule in rules {
            self.table(namespace, family, &iptables_args(None, verb, rule), ignore)
                .await?;
        }
        Ok(())
    }

    async fn nat(&self, rules: &RuleSet, verb: Verb) -> Result<()> {
        let ignore = match verb {
            Verb::Append => &[][..],
            Verb::Delete => MISSING_RULE_PATTERNS,
        };
        for (family, rule) in nat_rules(rules)? {
            self.table(
                &rules.namespace,
                family,
                &iptables_args(Some("nat"), verb, &rule),
                ignore,
            )
            .await?;
        }
        Ok(())
    }
}

impl Kernel for IptablesKernel {
    async fn list_namespaces(&self) -> Result<Vec<String>> {
        let output = self.ip(&["netns", "list"], &[]).await?;
        Ok(parse_netns_list(&output))
    }

    async fn create_namespace(&self, namespace: &str) -> Result<()> {
        match self.ip(&["netns", "add", namespace], &[]).await {
            Ok(_) => {
                info!("Created network namespace {namespace}");
                Ok(())
            }
            Err(e) if e.failure_kind() == Some(FailureKind::AlreadyExists) => {
                Err(Error::AlreadyExists(namespace.to_string()))
            }
            Err(e) => Err(e),
        }
    }

    async fn apply_nat(&self, rules: &RuleSet) -> Result<()> {
        self.nat(rules, Verb::Append).await
    }

    async fn remove_nat(&self, rules: &RuleSet) -> Result<()> {
        self.nat(rules, Verb::Delete).await
    }

    async fn hold(&self, rules: &RuleSet) -> Result<()> {
        self.rules(&rules.namespace, Family::V4, Verb::Append, &rules.holds)
            .await?;
        self.rules(&rules.namespace, Family::V6, Verb::Append, &rules.holds6)
            .await
    }

    async fn apply(&self, rules: &RuleSet) -> Result<()> {
        let ns = &rules.namespace;
        self.rules(ns, Family::V4, Verb::Append, &rules.source_dest_check)
            .await?;
        self.rules(ns, Family::V6, Verb::Append, &rules.source_dest_check6)
            .await?;
        self.rules(ns, Family::V4, Verb::Append, &rules.ingress)
            .await?;
        self.rules(ns, Family::V6, Verb::Append, &rules.ingress6)
            .await?;

        // Lift the hold, if one was placed
        self.rules(ns, Family::V4, Verb::Delete, &rules.holds)
            .await?;
        self.rules(ns, Family::V6, Verb::Delete, &rules.holds6)
            .await
    }

    async fn remove(&self, rules: &RuleSet) -> Result<()> {
        let ns = &rules.namespace;
        self.rules(ns, Family::V4, Verb::Delete, &rules.source_dest_check)
            .await?;
        self.rules(ns, Family::V6, Verb::Delete, &rules.source_dest_check6)
            .await?;
        self.rules(ns, Family::V4, Verb::Delete, &rules.ingress)
            .await?;
        self.rules(ns, Family::V6, Verb::Delete, &rules.ingress6)
            .await
    }

    async fn recover_node(&self) -> Result<()> {
        let list = ["-w", "-S"].map(String::from);
        for family in [Family::V4, Family::V6] {
            // Fails fast when the xtables backend itself is broken
            self.table(ROOT_NAMESPACE, family, &list, &[]).await?;
        }
        info!("Node packet filter responds to both families");
        Ok(())
    }
}

/// Extracts namespace names from `ip netns list` output.
///
/// Lines look like `ns7 (id: 3)` or just `ns7`.
pub fn parse_netns_list(output: &str) -> Vec<String> {
    output
        .lines()
        .filter_map(|line| line.split_whitespace().next())
        .map(String::from)
        .collect()
}

/// One kernel operation, as recorded by [`DryRunKernel`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KernelOp {
    CreateNamespace(String),
    ApplyNat(RuleSet),
    RemoveNat(RuleSet),
    Hold(RuleSet),
    Apply(RuleSet),
    Remove(RuleSet),
    RecoverNode,
}

impl KernelOp {
    pub fn namespace(&self) -> &str {
        match self {
            Self::CreateNamespace(ns) => ns,
            Self::ApplyNat(r)
            | Self::RemoveNat(r)
            | Self::Hold(r)
            | Self::Apply(r)
            | Self::Remove(r) => &r.namespace,
            Self::RecoverNode => ROOT_NAMESPACE,
        }
    }

    pub const fn name(&self) -> &'static str {
        match self {
            Self::CreateNamespace(_) => "create-namespace",
            Self::ApplyNat(_) => "apply-nat",
            Self::RemoveNat(_) => "remove-nat",
            Self::Hold(_) => "hold",
            Self::Apply(_) => "apply",
            Self::Remove(_) => "remove",
            Self::RecoverNode => "recover-node",
        }
    }

    pub const fn is_nat(&self) -> bool {
        matches!(self, Self::ApplyNat(_) | Self::RemoveNat(_))
    }

    pub const fn is_filter(&self) -> bool {
        matches!(self, Self::Hold(_) | Self::Apply(_) | Self::Remove(_))
    }
}

impl fmt::Display for KernelOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::CreateNamespace(ns) => write!(f, "{} {ns}", self.name()),
            Self::ApplyNat(r)
            | Self::RemoveNat(r)
            | Self::Hold(r)
            | Self::Apply(r)
            | Self::Remove(r) => write!(f, "{} {}", self.name(), r.key()),
            Self::RecoverNode => f.write_str(self.name()),
        }
    }
}

/// Records operations instead of executing them
#[derive(Debug, Default)]
pub struct DryRunKernel {
    namespaces: Vec<String>,
    ops: Mutex<Vec<KernelOp>>,
}

impl DryRunKernel {
    /// Creates a recorder that reports `namespaces` as existing.
    pub fn new(namespaces: Vec<String>) -> Self {
        Self {
            namespaces,
            ops: Mutex::new(Vec::new()),
        }
    }

    fn record(&self, op: KernelOp) {
        debug!("dry run: {op}");
        self.ops
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .push(op);
    }

    /// Returns and clears the recorded operations.
    pub fn take_ops(&self) -> Vec<KernelOp> {
        std::mem::take(
            &mut *self
                .ops
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner),
        )
    }
}

impl Kernel for DryRunKernel {
    async fn list_namespaces(&self) -> Result<Vec<String>> {
        Ok(self.namespaces.clone())
    }

    async fn create_namespace(&self, namespace: &str) -> Result<()> {
        self.record(KernelOp::CreateNamespace(namespace.to_string()));
        Ok(())
    }

    async fn apply_nat(&self, rules: &RuleSet) -> Result<()> {
        self.record(KernelOp::ApplyNat(rules.clone()));
        Ok(())
    }

    async fn remove_nat(&self, rules: &RuleSet) -> Result<()> {
        self.record(KernelOp::RemoveNat(rules.clone()));
        Ok(())
    }

    async fn hold(&self, rules: &RuleSet) -> Result<()> {
        self.record(KernelOp::Hold(rules.clone()));
        Ok(())
    }

    async fn apply(&self, rules: &RuleSet) -> Result<()> {
        self.record(KernelOp::Apply(rules.clone()));
        Ok(())
    }

    async fn remove(&self, rules: &RuleSet) -> Result<()> {
        self.record(KernelOp::Remove(rules.clone()));
        Ok(())
    }

    async fn recover_node(&self) -> Result<()> {
        self.record(KernelOp::RecoverNode);
        Ok(())
    }
}
