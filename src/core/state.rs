//! State snapshots
//!
//! A [`StateSnapshot`] is the complete set of rule sets for one node at one
//! instant, either the configuration currently installed in the kernel or a
//! freshly computed desired configuration. Snapshots are built wholesale and
//! never mutated afterwards; the reconciler shares them behind `Arc`.

use crate::core::error::Error;
use crate::core::rules::{RuleKey, RuleSet};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashSet};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "Vec<RuleSet>", into = "Vec<RuleSet>")]
pub struct StateSnapshot {
    interfaces: BTreeMap<RuleKey, RuleSet>,
}

impl StateSnapshot {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Builds a snapshot from rule sets.
    ///
    /// # Errors
    ///
    /// Returns `Err` if two rule sets share a `(namespace, interface)` key.
    pub fn from_rule_sets(rule_sets: impl IntoIterator<Item = RuleSet>) -> Result<Self, Error> {
        let mut interfaces = BTreeMap::new();
        for rules in rule_sets {
            let key = rules.key();
            if interfaces.contains_key(&key) {
                return Err(Error::validation(
                    "interface",
                    format!("duplicate rule set for {key}"),
                ));
            }
            interfaces.insert(key, rules);
        }
        Ok(Self { interfaces })
    }

    pub fn get(&self, key: &RuleKey) -> Option<&RuleSet> {
        self.interfaces.get(key)
    }

    pub fn contains(&self, key: &RuleKey) -> bool {
        self.interfaces.contains_key(key)
    }

    /// Iterates rule sets in key order.
    pub fn iter(&self) -> impl Iterator<Item = (&RuleKey, &RuleSet)> {
        self.interfaces.iter()
    }

    pub fn rule_sets(&self) -> impl Iterator<Item = &RuleSet> {
        self.interfaces.values()
    }

    pub fn len(&self) -> usize {
        self.interfaces.len()
    }

    pub fn is_empty(&self) -> bool {
        self.interfaces.is_empty()
    }

    /// Distinct namespaces referenced by this snapshot.
    pub fn namespaces(&self) -> BTreeSet<&str> {
        self.interfaces
            .keys()
            .map(|key| key.namespace.as_str())
            .collect()
    }

    /// Keys present here but absent from `newer`, in key order.
    pub fn stale_keys<'a>(&'a self, newer: &Self) -> Vec<&'a RuleKey> {
        self.interfaces
            .keys()
            .filter(|key| !newer.contains(key))
            .collect()
    }

    /// Returns a copy without any rule set living in one of `namespaces`.
    pub fn without_namespaces(&self, namespaces: &HashSet<String>) -> Self {
        Self {
            interfaces: self
                .interfaces
                .iter()
                .filter(|(key, _)| !namespaces.contains(&key.namespace))
                .map(|(key, rules)| (key.clone(), rules.clone()))
                .collect(),
        }
    }

    /// Concatenated [`RuleSet::render`] output in key order.
    pub fn render(&self) -> String {
        self.rule_sets().map(RuleSet::render).collect()
    }
}

impl TryFrom<Vec<RuleSet>> for StateSnapshot {
    type Error = Error;

    fn try_from(rule_sets: Vec<RuleSet>) -> Result<Self, Self::Error> {
        Self::from_rule_sets(rule_sets)
    }
}

impl From<StateSnapshot> for Vec<RuleSet> {
    fn from(snapshot: StateSnapshot) -> Self {
        snapshot.interfaces.into_values().collect()
    }
}
