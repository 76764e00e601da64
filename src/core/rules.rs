//! Per-interface rule sets
//!
//! A [`RuleSet`] is the complete desired NAT/filter/hold configuration of one
//! interface inside one network namespace. Rule sets are immutable values:
//! the reconciliation engine compares them, it never edits them in place.
//!
//! Individual rules are opaque argument vectors. The first element names the
//! chain, the rest is passed to iptables verbatim after the verb (`-A`/`-D`).

use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::{Ipv4Addr, Ipv6Addr};

/// Identifier of the host's own (root) network namespace
pub const ROOT_NAMESPACE: &str = "0";

/// Default name of the reserved physical host interface
pub const HOST_INTERFACE: &str = "host";

/// A single rule: chain name followed by match/target arguments
pub type RuleArgs = Vec<String>;

/// Unique key of a rule set: `(namespace, interface)`
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RuleKey {
    pub namespace: String,
    pub interface: String,
}

impl RuleKey {
    pub fn new(namespace: impl Into<String>, interface: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            interface: interface.into(),
        }
    }
}

impl fmt::Display for RuleKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.namespace, self.interface)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleSet {
    pub namespace: String,
    pub interface: String,

    #[serde(default)]
    pub nat: bool,
    #[serde(default)]
    pub nat_addr: Option<Ipv4Addr>,
    #[serde(default)]
    pub nat_pub_addr: Option<Ipv4Addr>,
    #[serde(default)]
    pub nat6: bool,
    #[serde(default)]
    pub nat_addr6: Option<Ipv6Addr>,
    #[serde(default)]
    pub nat_pub_addr6: Option<Ipv6Addr>,

    /// NAT through the Oracle Cloud VNIC address pair
    #[serde(default)]
    pub oracle_nat: bool,
    #[serde(default)]
    pub oracle_nat_addr: Option<Ipv4Addr>,
    #[serde(default)]
    pub oracle_nat_pub_addr: Option<Ipv4Addr>,

    #[serde(default)]
    pub source_dest_check: Vec<RuleArgs>,
    #[serde(default)]
    pub source_dest_check6: Vec<RuleArgs>,
    #[serde(default)]
    pub ingress: Vec<RuleArgs>,
    #[serde(default)]
    pub ingress6: Vec<RuleArgs>,
    #[serde(default)]
    pub holds: Vec<RuleArgs>,
    #[serde(default)]
    pub holds6: Vec<RuleArgs>,
}

impl RuleSet {
    /// Creates an empty rule set (no NAT, no rules) for an interface.
    pub fn new(namespace: impl Into<String>, interface: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            interface: interface.into(),
            ..Self::default()
        }
    }

    pub fn key(&self) -> RuleKey {
        RuleKey::new(self.namespace.clone(), self.interface.clone())
    }

    pub fn is_root(&self) -> bool {
        self.namespace == ROOT_NAMESPACE
    }

    /// Returns true if any NAT variant is requested.
    pub fn wants_nat(&self) -> bool {
        self.nat || self.nat6 || self.oracle_nat
    }

    /// Compares only the NAT-relevant fields.
    pub fn nat_differs(&self, other: &Self) -> bool {
        self.nat != other.nat
            || self.nat_addr != other.nat_addr
            || self.nat_pub_addr != other.nat_pub_addr
            || self.nat6 != other.nat6
            || self.nat_addr6 != other.nat_addr6
            || self.nat_pub_addr6 != other.nat_pub_addr6
            || self.oracle_nat != other.oracle_nat
            || self.oracle_nat_addr != other.oracle_nat_addr
            || self.oracle_nat_pub_addr != other.oracle_nat_pub_addr
    }

    /// Compares the filter-relevant fields (ingress, source/destination
    /// check and the interface's hold configuration).
    pub fn filter_differs(&self, other: &Self) -> bool {
        self.namespace != other.namespace
            || self.interface != other.interface
            || self.source_dest_check != other.source_dest_check
            || self.source_dest_check6 != other.source_dest_check6
            || self.ingress != other.ingress
            || self.ingress6 != other.ingress6
            || self.holds != other.holds
            || self.holds6 != other.holds6
    }

    /// Number of filter rules across both families, holds excluded.
    pub fn filter_rule_count(&self) -> usize {
        self.source_dest_check.len()
            + self.source_dest_check6.len()
            + self.ingress.len()
            + self.ingress6.len()
    }

    /// Renders the rule set as stable text, one rule per line.
    ///
    /// Used for plan diffs; not consumed by the kernel backend.
    pub fn render(&self) -> String {
        use std::fmt::Write;

        let mut out = String::new();
        let _ = writeln!(out, "# {}", self.key());

        if self.nat {
            let _ = writeln!(
                out,
                "nat4 {} -> {}",
                display_opt(self.nat_addr),
                display_opt(self.nat_pub_addr)
            );
        }
        if self.nat6 {
            let _ = writeln!(
                out,
                "nat6 {} -> {}",
                display_opt(self.nat_addr6),
                display_opt(self.nat_pub_addr6)
            );
        }
        if self.oracle_nat {
            let _ = writeln!(
                out,
                "oracle-nat {} -> {}",
                display_opt(self.oracle_nat_addr),
                display_opt(self.oracle_nat_pub_addr)
            );
        }

        for (label, rules) in [
            ("sdc4", &self.source_dest_check),
            ("sdc6", &self.source_dest_check6),
            ("ingress4", &self.ingress),
            ("ingress6", &self.ingress6),
            ("hold4", &self.holds),
            ("hold6", &self.holds6),
        ] {
            for rule in rules {
                let _ = writeln!(out, "{label} {}", rule.join(" "));
            }
        }

        out
    }
}

fn display_opt<T: fmt::Display>(value: Option<T>) -> String {
    value.map_or_else(|| "-".to_string(), |v| v.to_string())
}

/// Builds a rule from string slices.
pub fn rule_args(args: &[&str]) -> RuleArgs {
    args.iter().map(|a| (*a).to_string()).collect()
}
