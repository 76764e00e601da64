//! Namespace lifecycle
//!
//! Makes sure the network namespace behind a rule set exists before any rule
//! is installed into it. The root namespace always exists; every other
//! namespace is created on first use in a pass unless the host already
//! reported it.

use crate::core::error::{Error, Result};
use crate::core::kernel::Kernel;
use crate::core::rules::ROOT_NAMESPACE;
use std::collections::HashSet;
use tracing::debug;

pub struct NamespaceManager<'a, K> {
    kernel: &'a K,
    known: HashSet<String>,
}

impl<'a, K: Kernel> NamespaceManager<'a, K> {
    /// `existing` is the namespace list reported by the host at pass start.
    pub fn new(kernel: &'a K, existing: impl IntoIterator<Item = String>) -> Self {
        Self {
            kernel,
            known: existing.into_iter().collect(),
        }
    }

    pub fn is_known(&self, namespace: &str) -> bool {
        namespace == ROOT_NAMESPACE || self.known.contains(namespace)
    }

    /// Creates `namespace` unless it is the root namespace or already known.
    ///
    /// An "already exists" answer from the kernel counts as success.
    ///
    /// # Errors
    ///
    /// Returns the kernel error for any other create failure.
    pub async fn ensure(&mut self, namespace: &str) -> Result<()> {
        if self.is_known(namespace) {
            return Ok(());
        }

        match self.kernel.create_namespace(namespace).await {
            Ok(()) => {}
            Err(Error::AlreadyExists(_)) => {
                debug!(namespace, "Namespace already present");
            }
            Err(e) => return Err(e),
        }

        self.known.insert(namespace.to_string());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::kernel::KernelOp;
    use crate::core::test_helpers::{MockKernel, OP_CREATE};

    #[tokio::test]
    async fn test_root_and_known_are_not_created() {
        let kernel = MockKernel::new();
        let mut manager = NamespaceManager::new(&kernel, vec!["4".to_string()]);

        manager.ensure("0").await.unwrap();
        manager.ensure("4").await.unwrap();

        assert!(kernel.ops().is_empty());
    }

    #[tokio::test]
    async fn test_creates_once() {
        let kernel = MockKernel::new();
        let mut manager = NamespaceManager::new(&kernel, Vec::new());

        manager.ensure("9").await.unwrap();
        manager.ensure("9").await.unwrap();

        assert_eq!(kernel.ops(), vec![KernelOp::CreateNamespace("9".to_string())]);
        assert!(manager.is_known("9"));
    }

    #[tokio::test]
    async fn test_already_exists_is_success() {
        let kernel = MockKernel::new();
        kernel.fail(OP_CREATE, "3", "Cannot create namespace file: File exists");
        let mut manager = NamespaceManager::new(&kernel, Vec::new());

        assert!(manager.ensure("3").await.is_ok());
        assert!(manager.is_known("3"));
    }

    #[tokio::test]
    async fn test_other_failure_propagates() {
        let kernel = MockKernel::new();
        kernel.fail(OP_CREATE, "7", "mount --make-shared /run/netns failed: Permission denied");
        let mut manager = NamespaceManager::new(&kernel, Vec::new());

        let err = manager.ensure("7").await.unwrap_err();
        assert!(matches!(err, Error::Command { .. }));
        assert!(!manager.is_known("7"));
    }
}
