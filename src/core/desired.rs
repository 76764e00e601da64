//! Desired-state builder
//!
//! Turns upstream domain data (this node's self-description, the instances
//! placed on it, and firewall policy) into a [`StateSnapshot`]. The builder is
//! pure: it never touches the kernel, and an instance that fails validation is
//! skipped with a warning rather than failing the whole snapshot.

use crate::core::error::{Error, Result};
use crate::core::rules::{ROOT_NAMESPACE, RuleArgs, RuleKey, RuleSet};
use crate::core::state::StateSnapshot;
use crate::validators;
use ipnetwork::IpNetwork;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::future::Future;
use std::net::{Ipv4Addr, Ipv6Addr};
use tracing::warn;

/// Comment attached to hold rules so they never match an ingress rule on delete
pub const HOLD_COMMENT: &str = "netrecon-hold";

/// Network protocol matched by a [`FirewallRule`]
#[derive(
    Debug,
    Clone,
    Copy,
    Default,
    Serialize,
    Deserialize,
    PartialEq,
    Eq,
    strum::Display,
    strum::EnumString,
    strum::EnumIter,
)]
#[serde(rename_all = "lowercase")]
#[strum(ascii_case_insensitive)]
pub enum Protocol {
    #[default]
    #[strum(serialize = "any")]
    Any,
    #[strum(serialize = "tcp")]
    Tcp,
    #[strum(serialize = "udp")]
    Udp,
    /// ICMP for IPv4, ICMPv6 for IPv6
    #[strum(serialize = "icmp")]
    Icmp,
}

impl Protocol {
    const fn takes_ports(self) -> bool {
        matches!(self, Protocol::Tcp | Protocol::Udp)
    }

    fn match_args(self, family: Family) -> Vec<&'static str> {
        match (self, family) {
            (Protocol::Any, _) => vec![],
            (Protocol::Tcp, _) => vec!["-p", "tcp"],
            (Protocol::Udp, _) => vec!["-p", "udp"],
            (Protocol::Icmp, Family::V4) => vec!["-p", "icmp"],
            (Protocol::Icmp, Family::V6) => vec!["-p", "ipv6-icmp"],
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct PortRange {
    pub start: u16,
    pub end: u16,
}

impl PortRange {
    pub fn single(port: u16) -> Self {
        Self {
            start: port,
            end: port,
        }
    }

    /// `--dport` argument: `80` or `8000:8080`
    fn iptables_arg(self) -> String {
        if self.start == self.end {
            self.start.to_string()
        } else {
            format!("{}:{}", self.start, self.end)
        }
    }
}

impl fmt::Display for PortRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.start == self.end {
            write!(f, "{}", self.start)
        } else {
            write!(f, "{}-{}", self.start, self.end)
        }
    }
}

/// One allow rule of a firewall policy
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FirewallRule {
    #[serde(default)]
    pub protocol: Protocol,
    #[serde(default)]
    pub ports: Option<PortRange>,
    /// Allowed source networks; empty means any source in both families
    #[serde(default)]
    pub sources: Vec<IpNetwork>,
}

impl FirewallRule {
    fn validate(&self) -> Result<()> {
        if let Some(ports) = self.ports {
            if !self.protocol.takes_ports() {
                return Err(Error::validation(
                    "ports",
                    format!("protocol {} does not take ports", self.protocol),
                ));
            }
            validators::validate_port_range(ports.start, ports.end)
                .map_err(|e| Error::validation("ports", e))?;
        }
        Ok(())
    }
}

/// This node's own description
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct NodeSelf {
    pub id: String,
    /// Enables the host firewall (root namespace rule set)
    #[serde(default)]
    pub firewall: bool,
}

#[derive(
    Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, strum::Display,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum InstanceState {
    #[default]
    Running,
    Provisioning,
    Stopped,
    Failed,
}

/// A virtual machine placed on this node
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Instance {
    pub id: String,
    pub namespace: String,
    /// Interface inside the namespace facing the VM
    pub interface: String,
    #[serde(default)]
    pub state: InstanceState,

    #[serde(default)]
    pub private_addr: Option<Ipv4Addr>,
    #[serde(default)]
    pub private_addr6: Option<Ipv6Addr>,
    #[serde(default)]
    pub public_addr: Option<Ipv4Addr>,
    #[serde(default)]
    pub public_addr6: Option<Ipv6Addr>,

    #[serde(default)]
    pub nat: bool,
    #[serde(default)]
    pub nat6: bool,
    #[serde(default)]
    pub oracle_private_addr: Option<Ipv4Addr>,
    #[serde(default)]
    pub oracle_public_addr: Option<Ipv4Addr>,

    /// Lets the VM forward traffic for other addresses (routers, VPN gateways)
    #[serde(default)]
    pub skip_source_dest_check: bool,
}

/// Everything the builder needs, as produced by a [`DomainSource`]
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct DomainData {
    pub node: NodeSelf,
    #[serde(default)]
    pub instances: Vec<Instance>,
    #[serde(default)]
    pub host_firewall: Vec<FirewallRule>,
    /// Firewall policy per instance namespace
    #[serde(default)]
    pub instance_firewalls: BTreeMap<String, Vec<FirewallRule>>,
}

impl DomainData {
    pub fn desired_state(&self, host_interface: &str) -> StateSnapshot {
        build_desired_state(
            &self.node,
            &self.instances,
            &self.host_firewall,
            &self.instance_firewalls,
            host_interface,
        )
    }
}

/// Upstream provider of domain data, consulted by the watcher and by reload
pub trait DomainSource: Send + Sync {
    fn load(&self) -> impl Future<Output = Result<DomainData>> + Send;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Family {
    V4,
    V6,
}

impl Family {
    fn matches(self, network: &IpNetwork) -> bool {
        match self {
            Family::V4 => network.is_ipv4(),
            Family::V6 => network.is_ipv6(),
        }
    }
}

fn args(parts: &[&str]) -> RuleArgs {
    parts.iter().map(|p| (*p).to_string()).collect()
}

/// Allow rules for one family, each prefixed by `prefix` (chain and direction).
fn allow_rules(prefix: &[&str], family: Family, policy: &[FirewallRule]) -> Vec<RuleArgs> {
    let mut out = Vec::new();

    for rule in policy {
        let sources: Vec<Option<String>> = if rule.sources.is_empty() {
            vec![None]
        } else {
            let matching: Vec<_> = rule
                .sources
                .iter()
                .filter(|net| family.matches(net))
                .map(|net| Some(net.to_string()))
                .collect();
            if matching.is_empty() {
                continue;
            }
            matching
        };

        for source in sources {
            let mut line = args(prefix);
            line.extend(args(&rule.protocol.match_args(family)));
            if let Some(source) = source {
                line.push("-s".to_string());
                line.push(source);
            }
            if let Some(ports) = rule.ports {
                line.push("--dport".to_string());
                line.push(ports.iptables_arg());
            }
            line.extend(args(&["-j", "ACCEPT"]));
            out.push(line);
        }
    }

    out
}

/// Full ingress chain for one direction: established traffic, the policy's
/// allow rules, then a final drop.
fn ingress_rules(prefix: &[&str], family: Family, policy: &[FirewallRule]) -> Vec<RuleArgs> {
    let mut out = Vec::new();

    let mut established = args(prefix);
    established.extend(args(&[
        "-m",
        "conntrack",
        "--ctstate",
        "RELATED,ESTABLISHED",
        "-j",
        "ACCEPT",
    ]));
    out.push(established);

    out.extend(allow_rules(prefix, family, policy));

    let mut drop = args(prefix);
    drop.extend(args(&["-j", "DROP"]));
    out.push(drop);

    out
}

fn hold_rules(interface: &str) -> Vec<RuleArgs> {
    vec![
        args(&[
            "FORWARD",
            "-o",
            interface,
            "-m",
            "comment",
            "--comment",
            HOLD_COMMENT,
            "-m",
            "conntrack",
            "--ctstate",
            "RELATED,ESTABLISHED",
            "-j",
            "ACCEPT",
        ]),
        args(&[
            "FORWARD",
            "-o",
            interface,
            "-m",
            "comment",
            "--comment",
            HOLD_COMMENT,
            "-j",
            "DROP",
        ]),
    ]
}

fn source_dest_exemptions(instance: &Instance) -> Vec<RuleArgs> {
    let mut rule = args(&["FORWARD", "-i", &instance.interface]);
    let comment = validators::sanitize_label(&instance.id);
    // iptables rejects an empty comment
    if !comment.is_empty() {
        rule.extend(args(&["-m", "comment", "--comment", &comment]));
    }
    rule.extend(args(&["-j", "ACCEPT"]));
    vec![rule]
}

fn validate_instance(instance: &Instance, policy: &[FirewallRule]) -> Result<()> {
    validators::validate_namespace(&instance.namespace)
        .map_err(|e| Error::validation("namespace", e))?;
    if instance.namespace == ROOT_NAMESPACE {
        return Err(Error::validation(
            "namespace",
            "instances cannot live in the root namespace",
        ));
    }
    validators::validate_interface(&instance.interface)
        .map_err(|e| Error::validation("interface", e))?;

    if instance.nat && (instance.private_addr.is_none() || instance.public_addr.is_none()) {
        return Err(Error::validation(
            "nat",
            "NAT requires private_addr and public_addr",
        ));
    }
    if instance.nat6 && (instance.private_addr6.is_none() || instance.public_addr6.is_none()) {
        return Err(Error::validation(
            "nat6",
            "NAT6 requires private_addr6 and public_addr6",
        ));
    }
    if instance.oracle_private_addr.is_some() != instance.oracle_public_addr.is_some() {
        return Err(Error::validation(
            "oracle_nat",
            "oracle NAT requires both addresses",
        ));
    }

    policy.iter().try_for_each(FirewallRule::validate)
}

fn instance_rules(instance: &Instance, policy: &[FirewallRule]) -> RuleSet {
    let mut rules = RuleSet::new(instance.namespace.clone(), instance.interface.clone());

    if instance.nat {
        rules.nat = true;
        rules.nat_addr = instance.private_addr;
        rules.nat_pub_addr = instance.public_addr;
    }
    if instance.nat6 {
        rules.nat6 = true;
        rules.nat_addr6 = instance.private_addr6;
        rules.nat_pub_addr6 = instance.public_addr6;
    }
    if let (Some(private), Some(public)) =
        (instance.oracle_private_addr, instance.oracle_public_addr)
    {
        rules.oracle_nat = true;
        rules.oracle_nat_addr = Some(private);
        rules.oracle_nat_pub_addr = Some(public);
    }

    if instance.skip_source_dest_check {
        rules.source_dest_check = source_dest_exemptions(instance);
        rules.source_dest_check6 = source_dest_exemptions(instance);
    }

    let prefix = ["FORWARD", "-o", instance.interface.as_str()];
    rules.ingress = ingress_rules(&prefix, Family::V4, policy);
    rules.ingress6 = ingress_rules(&prefix, Family::V6, policy);
    rules.holds = hold_rules(&instance.interface);
    rules.holds6 = hold_rules(&instance.interface);

    rules
}

fn host_rules(host_interface: &str, policy: &[FirewallRule]) -> RuleSet {
    let mut rules = RuleSet::new(ROOT_NAMESPACE, host_interface);

    let mut ingress = vec![args(&["INPUT", "-i", "lo", "-j", "ACCEPT"])];
    ingress.extend(ingress_rules(&["INPUT"], Family::V4, policy));
    rules.ingress = ingress;

    let mut ingress6 = vec![args(&["INPUT", "-i", "lo", "-j", "ACCEPT"])];
    ingress6.extend(ingress_rules(&["INPUT"], Family::V6, policy));
    rules.ingress6 = ingress6;

    rules
}

/// Builds the desired snapshot for this node.
///
/// - `("0", host_interface)` carries the host firewall when `node.firewall` is set
/// - one key per running instance carries its NAT, source/destination-check
///   exemptions, ingress from `instance_firewalls[namespace]` and hold rules
///
/// Invalid instances and duplicate keys are logged and skipped.
pub fn build_desired_state(
    node: &NodeSelf,
    instances: &[Instance],
    host_firewall: &[FirewallRule],
    instance_firewalls: &BTreeMap<String, Vec<FirewallRule>>,
    host_interface: &str,
) -> StateSnapshot {
    let mut rule_sets = Vec::new();
    let mut seen: HashSet<RuleKey> = HashSet::new();

    if node.firewall {
        match host_firewall.iter().try_for_each(FirewallRule::validate) {
            Ok(()) => {
                let rules = host_rules(host_interface, host_firewall);
                seen.insert(rules.key());
                rule_sets.push(rules);
            }
            Err(e) => {
                warn!(node = %node.id, error = %e, "Skipping invalid host firewall");
            }
        }
    }

    for instance in instances {
        if instance.state != InstanceState::Running {
            continue;
        }

        let policy = instance_firewalls
            .get(&instance.namespace)
            .map_or(&[][..], Vec::as_slice);

        if let Err(e) = validate_instance(instance, policy) {
            warn!(
                instance = %instance.id,
                namespace = %instance.namespace,
                error = %e,
                "Skipping invalid instance"
            );
            continue;
        }

        let rules = instance_rules(instance, policy);
        if !seen.insert(rules.key()) {
            warn!(
                instance = %instance.id,
                key = %rules.key(),
                "Skipping instance with duplicate namespace/interface"
            );
            continue;
        }
        rule_sets.push(rules);
    }

    // Keys are unique by construction
    StateSnapshot::from_rule_sets(rule_sets).unwrap_or_default()
}
