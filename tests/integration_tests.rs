//! Integration tests for netrecon
//!
//! These tests drive the real `ip`/`iptables` backend against a mock shell
//! script that records every invocation, so the exact command lines a pass
//! issues can be asserted without privileges.
//!
//! The mock reads three files from its own directory:
//!
//! - `netns`: namespaces reported by `ip netns list` (extended by `netns add`)
//! - `fail`: substrings that make a matching invocation fail
//! - `missing`: substrings that make a matching invocation fail the way
//!   `iptables -D` does for a rule that is not installed

#![allow(clippy::uninlined_format_args)]

use netrecon::core::desired::{DomainData, DomainSource, HOLD_COMMENT, Instance, NodeSelf};
use netrecon::core::kernel::{IptablesKernel, Kernel, KernelConfig};
use netrecon::core::reconciler::{Reconciler, ReconcilerOptions};
use netrecon::core::rules::rule_args;
use netrecon::elevation::ElevationMethod;
use netrecon::watcher::{FileSource, Watcher};
use netrecon::{Error, RuleSet, StateSnapshot};
use std::collections::BTreeSet;
use std::net::Ipv4Addr;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tempfile::TempDir;

const MOCK_SCRIPT: &str = r#"#!/bin/sh
dir=$(dirname "$0")
name=$(basename "$0")
line=$(printf '%s' "$name $*" | sed "s|$dir/||g")
echo "$line" >> "$dir/calls.log"

matches() {
    [ -f "$dir/$1" ] || return 1
    while IFS= read -r pattern; do
        [ -n "$pattern" ] || continue
        case "$line" in
            *"$pattern"*) return 0 ;;
        esac
    done < "$dir/$1"
    return 1
}

if matches fail; then
    echo "$name: Operation not permitted." >&2
    exit 1
fi
if matches missing; then
    echo "$name: Bad rule (does a matching rule exist in that chain?)." >&2
    exit 1
fi

if [ "$name" = ip ] && [ "$1" = netns ]; then
    case "$2" in
        list)
            [ -f "$dir/netns" ] && cat "$dir/netns"
            exit 0
            ;;
        add)
            if [ -f "$dir/netns" ] && grep -qx "$3" "$dir/netns"; then
                echo "Cannot create namespace file \"/run/netns/$3\": File exists" >&2
                exit 1
            fi
            echo "$3" >> "$dir/netns"
            exit 0
            ;;
    esac
fi
exit 0
"#;

/// The mock script, written once and shared through per-test symlinks
fn mock_script() -> &'static Path {
    static SCRIPT: OnceLock<(TempDir, PathBuf)> = OnceLock::new();
    let (_, path) = SCRIPT.get_or_init(|| {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mock.sh");
        std::fs::write(&path, MOCK_SCRIPT).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        (dir, path)
    });
    path
}

struct MockHost {
    dir: TempDir,
}

impl MockHost {
    fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        for name in ["ip", "iptables", "ip6tables"] {
            std::os::unix::fs::symlink(mock_script(), dir.path().join(name)).unwrap();
        }
        Self { dir }
    }

    fn command(&self, name: &str) -> String {
        self.dir.path().join(name).to_string_lossy().into_owned()
    }

    fn kernel(&self) -> IptablesKernel {
        IptablesKernel::new(KernelConfig {
            ip_command: self.command("ip"),
            iptables_command: self.command("iptables"),
            ip6tables_command: self.command("ip6tables"),
            elevation: ElevationMethod::None,
            timeout: Duration::from_secs(10),
        })
    }

    fn set_namespaces(&self, namespaces: &[&str]) {
        let mut content = namespaces.join("\n");
        content.push('\n');
        std::fs::write(self.dir.path().join("netns"), content).unwrap();
    }

    fn fail_on(&self, pattern: &str) {
        std::fs::write(self.dir.path().join("fail"), format!("{pattern}\n")).unwrap();
    }

    fn missing_on(&self, pattern: &str) {
        std::fs::write(self.dir.path().join("missing"), format!("{pattern}\n")).unwrap();
    }

    fn clear_failures(&self) {
        let _ = std::fs::remove_file(self.dir.path().join("fail"));
        let _ = std::fs::remove_file(self.dir.path().join("missing"));
    }

    fn calls(&self) -> Vec<String> {
        std::fs::read_to_string(self.dir.path().join("calls.log"))
            .unwrap_or_default()
            .lines()
            .map(String::from)
            .collect()
    }

    fn clear_calls(&self) {
        let _ = std::fs::remove_file(self.dir.path().join("calls.log"));
    }

    fn write_domain(&self, data: &DomainData) -> PathBuf {
        let path = self.dir.path().join("domain.json");
        std::fs::write(&path, serde_json::to_string_pretty(data).unwrap()).unwrap();
        path
    }

    fn reconciler(&self, domain: PathBuf) -> Reconciler<IptablesKernel, FileSource> {
        Reconciler::new(
            Arc::new(self.kernel()),
            Arc::new(FileSource::new(domain)),
            ReconcilerOptions {
                host_interface: "host".to_string(),
                recovery_backoff: Duration::ZERO,
            },
        )
    }
}

fn accept_port(namespace: &str, interface: &str, port: u16) -> RuleSet {
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

fn domain(namespaces: &[&str]) -> DomainData {
    DomainData {
        node: NodeSelf {
            id: "node-1".to_string(),
            firewall: false,
        },
        instances: namespaces
            .iter()
            .map(|ns| Instance {
                id: format!("i-{ns}"),
                namespace: (*ns).to_string(),
                interface: "eth0".to_string(),
                ..Instance::default()
            })
            .collect(),
        ..DomainData::default()
    }
}

/// Commands an instance without firewall policy gets on first apply
fn fresh_instance_calls(namespace: &str) -> Vec<String> {
    let mut calls = Vec::new();
    for tool in ["iptables", "ip6tables"] {
        calls.push(format!(
            "ip netns exec {namespace} {tool} -w -A FORWARD -o eth0 -m conntrack --ctstate RELATED,ESTABLISHED -j ACCEPT"
        ));
        calls.push(format!(
            "ip netns exec {namespace} {tool} -w -A FORWARD -o eth0 -j DROP"
        ));
    }
    for tool in ["iptables", "ip6tables"] {
        calls.push(format!(
            "ip netns exec {namespace} {tool} -w -D FORWARD -o eth0 -m comment --comment {HOLD_COMMENT} -m conntrack --ctstate RELATED,ESTABLISHED -j ACCEPT"
        ));
        calls.push(format!(
            "ip netns exec {namespace} {tool} -w -D FORWARD -o eth0 -m comment --comment {HOLD_COMMENT} -j DROP"
        ));
    }
    calls
}

#[tokio::test]
async fn test_list_namespaces() {
    let host = MockHost::new();
    host.set_namespaces(&["7 (id: 0)", "8"]);

    let namespaces = host.kernel().list_namespaces().await.unwrap();

    assert_eq!(namespaces, vec!["7".to_string(), "8".to_string()]);
    assert_eq!(host.calls(), vec!["ip netns list"]);
}

#[tokio::test]
async fn test_create_namespace_reports_existing() {
    let host = MockHost::new();
    host.set_namespaces(&["7"]);
    let kernel = host.kernel();

    let existing = kernel.create_namespace("7").await;
    assert!(matches!(existing, Err(Error::AlreadyExists(ref ns)) if ns == "7"));

    kernel.create_namespace("9").await.unwrap();
    assert_eq!(host.calls(), vec!["ip netns add 7", "ip netns add 9"]);
    assert_eq!(
        kernel.list_namespaces().await.unwrap(),
        vec!["7".to_string(), "9".to_string()]
    );
}

#[tokio::test]
async fn test_new_interface_in_missing_namespace() {
    let host = MockHost::new();
    let reconciler = host.reconciler(host.dir.path().join("domain.json"));

    let desired = StateSnapshot::from_rule_sets(vec![accept_port("9", "eth0", 22)]).unwrap();
    let report = reconciler.apply_update(desired, Vec::new(), false).await;

    assert!(report.is_clean());
    assert_eq!(
        host.calls(),
        vec![
            "ip netns add 9",
            "ip netns exec 9 iptables -w -A FORWARD -o eth0 -p tcp --dport 22 -j ACCEPT",
            "ip netns exec 9 iptables -w -D FORWARD -o eth0 -j DROP",
        ]
    );
}

#[tokio::test]
async fn test_changed_rules_are_held_then_swapped() {
    let host = MockHost::new();
    let old = StateSnapshot::from_rule_sets(vec![accept_port("5", "eth0", 22)]).unwrap();
    let reconciler = host
        .reconciler(host.dir.path().join("domain.json"))
        .with_initial_state(old);

    let desired = StateSnapshot::from_rule_sets(vec![accept_port("5", "eth0", 80)]).unwrap();
    let report = reconciler
        .apply_update(desired, vec!["5".to_string()], false)
        .await;

    assert!(report.is_clean());
    assert_eq!(
        host.calls(),
        vec![
            "ip netns exec 5 iptables -w -A FORWARD -o eth0 -j DROP",
            "ip netns exec 5 iptables -w -D FORWARD -o eth0 -p tcp --dport 22 -j ACCEPT",
            "ip netns exec 5 iptables -w -A FORWARD -o eth0 -p tcp --dport 80 -j ACCEPT",
            "ip netns exec 5 iptables -w -D FORWARD -o eth0 -j DROP",
        ]
    );
}

#[tokio::test]
async fn test_root_namespace_nat_runs_without_netns() {
    let host = MockHost::new();
    let reconciler = host.reconciler(host.dir.path().join("domain.json"));

    let mut rules = RuleSet::new("0", "host");
    rules.nat = true;
    rules.nat_addr = Some(Ipv4Addr::new(10, 0, 0, 5));
    rules.nat_pub_addr = Some(Ipv4Addr::new(203, 0, 113, 5));
    let desired = StateSnapshot::from_rule_sets(vec![rules]).unwrap();

    let report = reconciler.apply_update(desired, Vec::new(), false).await;

    assert!(report.is_clean());
    assert_eq!(
        host.calls(),
        vec![
            "iptables -w -t nat -A POSTROUTING -s 10.0.0.5 -j SNAT --to-source 203.0.113.5",
            "iptables -w -t nat -A PREROUTING -d 203.0.113.5 -j DNAT --to-destination 10.0.0.5",
        ]
    );
}

#[tokio::test]
async fn test_failure_is_isolated_to_its_namespace() {
    let host = MockHost::new();
    host.fail_on("netns exec 7 iptables -w -A");
    let reconciler = host.reconciler(host.dir.path().join("domain.json"));

    let desired = StateSnapshot::from_rule_sets(vec![
        accept_port("7", "eth0", 22),
        accept_port("7", "eth1", 22),
        accept_port("8", "eth0", 22),
    ])
    .unwrap();
    let report = reconciler
        .apply_update(desired, vec!["7".to_string(), "8".to_string()], false)
        .await;

    assert_eq!(report.failed, BTreeSet::from(["7".to_string()]));

    let calls = host.calls();
    let ns7: Vec<&String> = calls.iter().filter(|c| c.contains("exec 7 ")).collect();
    assert_eq!(
        ns7,
        vec!["ip netns exec 7 iptables -w -A FORWARD -o eth0 -p tcp --dport 22 -j ACCEPT"]
    );
    assert!(calls.contains(
        &"ip netns exec 8 iptables -w -A FORWARD -o eth0 -p tcp --dport 22 -j ACCEPT".to_string()
    ));
}

#[tokio::test]
async fn test_deleting_missing_rule_is_tolerated() {
    let host = MockHost::new();
    let kernel = host.kernel();
    let rules = accept_port("5", "eth0", 22);

    host.missing_on("-D FORWARD");
    kernel.remove(&rules).await.unwrap();

    host.clear_failures();
    host.fail_on("-D FORWARD");
    let err = kernel.remove(&rules).await.unwrap_err();
    assert!(matches!(err, Error::Command { .. }));
}

#[tokio::test]
async fn test_recover_node() {
    let host = MockHost::new();

    host.kernel().recover_node().await.unwrap();

    // Read-only, chain policies stay as they are
    assert_eq!(host.calls(), vec!["iptables -w -S", "ip6tables -w -S"]);
}

#[tokio::test]
async fn test_recover_node_stops_on_broken_backend() {
    let host = MockHost::new();
    host.fail_on("iptables -w -S");

    assert!(host.kernel().recover_node().await.is_err());
    assert_eq!(host.calls(), vec!["iptables -w -S"]);
}

#[tokio::test]
async fn test_watcher_tick_from_domain_document() {
    let host = MockHost::new();
    host.set_namespaces(&["11"]);
    let path = host.write_domain(&domain(&["11"]));
    let reconciler = Arc::new(host.reconciler(path));
    let watcher = Watcher::new(Arc::clone(&reconciler), Duration::from_secs(30));

    let report = watcher.tick().await.unwrap();

    assert!(report.is_clean());
    assert_eq!(report.applied, 1);

    let mut expected = vec!["ip netns list".to_string()];
    expected.extend(fresh_instance_calls("11"));
    assert_eq!(host.calls(), expected);

    // Nothing changed, nothing to run
    host.clear_calls();
    let report = watcher.tick().await.unwrap();
    assert_eq!(report.unchanged, 1);
    assert_eq!(host.calls(), vec!["ip netns list"]);
}

#[tokio::test]
async fn test_reload_reapplies_failed_namespace() {
    let host = MockHost::new();
    host.set_namespaces(&["7", "8"]);
    let path = host.write_domain(&domain(&["7", "8"]));
    let reconciler = host.reconciler(path.clone());

    host.fail_on("netns exec 7 ip6tables -w -A");
    let data = FileSource::new(&path).load().await.unwrap();
    let namespaces = reconciler.kernel().list_namespaces().await.unwrap();
    let report = reconciler.update_state(&data, namespaces).await;
    assert_eq!(report.failed, BTreeSet::from(["7".to_string()]));

    host.clear_failures();
    host.clear_calls();
    let report = reconciler.reload().await.unwrap();

    assert!(report.is_clean());
    assert_eq!(report.applied, 1);
    assert_eq!(report.unchanged, 1);

    let calls = host.calls();
    assert_eq!(calls[0], "ip netns list");
    // Teardown of the failed namespace comes first
    assert_eq!(
        calls[1],
        "ip netns exec 7 iptables -w -D FORWARD -o eth0 -m conntrack --ctstate RELATED,ESTABLISHED -j ACCEPT"
    );
    assert!(calls.ends_with(&fresh_instance_calls("7")));
    assert!(!calls.iter().any(|c| c.contains("exec 8 ")));
}
