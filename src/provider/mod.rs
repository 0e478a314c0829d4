//! Cluster provider abstraction
//!
//! A [`Provider`] is one backend able to create, list and delete clusters and to
//! manage their membership. Orchestration code only talks to the trait; adding a
//! backend means implementing the trait, never branching on a backend tag.
//!
//! # Supported Providers
//!
//! - [`LocalDockerProvider`] - k3s in containers on the local docker daemon

mod local;

pub use local::LocalDockerProvider;

use std::collections::BTreeSet;
use std::path::PathBuf;

#[cfg(test)]
use mockall::automock;
use serde::{Deserialize, Serialize};

use crate::teardown::TeardownReport;
use crate::{Error, Result};

/// Backend kinds add-ons can declare compatibility with
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    LocalDocker,
    Aws,
    Ibm,
}

impl std::fmt::Display for Backend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Backend::LocalDocker => write!(f, "localdocker"),
            Backend::Aws => write!(f, "aws"),
            Backend::Ibm => write!(f, "ibm"),
        }
    }
}

/// Capability set every cluster backend implements
#[cfg_attr(test, automock)]
pub trait Provider: Send + Sync {
    fn backend(&self) -> Backend;

    /// Bootstrap a new cluster. Fails if the name is taken.
    fn create_cluster(&self, name: &str) -> Result<()>;

    /// Names of existing clusters
    fn list_clusters(&self) -> Result<BTreeSet<String>>;

    /// Join a new worker to a running cluster
    fn add_node(&self, cluster: &str, node: &str) -> Result<()>;

    /// Drain, unregister and remove a worker. Succeeds if the node is already gone.
    fn remove_node(&self, cluster: &str, node: &str) -> Result<TeardownReport>;

    /// Tear the cluster down, continuing past failures of individual steps
    fn delete_cluster(&self, name: &str) -> Result<TeardownReport>;

    /// Runtime state of the cluster's master, e.g. `running`
    fn cluster_status(&self, name: &str) -> Result<String>;

    /// Regenerate the cluster's kubeconfig and return where it was written
    fn kubeconfig(&self, name: &str) -> Result<PathBuf>;
}

/// Check a cluster or node name is usable as container and node name
pub fn validate_name(name: &str) -> Result<()> {
    let invalid = |reason: &str| Error::InvalidName {
        name: name.to_string(),
        reason: reason.to_string(),
    };

    if name.is_empty() {
        return Err(invalid("name cannot be empty"));
    }
    if name.len() > 63 {
        return Err(invalid("name must be at most 63 characters"));
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
    {
        return Err(invalid("only lowercase letters, digits and '-' are allowed"));
    }
    if name.starts_with('-') || name.ends_with('-') {
        return Err(invalid("name must start and end with a letter or digit"));
    }
    Ok(())
}
