//! Cluster CLI (`kubectl`) client
//!
//! Every call is made against an explicit kubeconfig path, never the ambient
//! `KUBECONFIG`, so operations on one cluster cannot leak onto another.

use std::path::Path;
use std::time::Duration;

#[cfg(test)]
use mockall::automock;
use serde::{Deserialize, Serialize};

use crate::command::Invocation;
use crate::Result;

/// Where a manifest comes from
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Manifest {
    /// Fetched by the CLI from a URL
    Url(String),
    /// Literal YAML, piped through stdin
    Inline(String),
}

impl Manifest {
    pub fn url(url: impl Into<String>) -> Self {
        Manifest::Url(url.into())
    }

    pub fn inline(yaml: impl Into<String>) -> Self {
        Manifest::Inline(yaml.into())
    }

    /// Short description for logs
    pub fn describe(&self) -> String {
        match self {
            Manifest::Url(url) => url.clone(),
            Manifest::Inline(yaml) => format!("inline manifest ({} bytes)", yaml.len()),
        }
    }
}

/// Operations of the cluster-management CLI used by the orchestrator
#[cfg_attr(test, automock)]
pub trait ClusterCli: Send + Sync {
    fn apply(&self, kubeconfig: &Path, manifest: &Manifest) -> Result<()>;

    /// Phases of all pods in a namespace
    fn pod_phases(&self, kubeconfig: &Path, namespace: &str) -> Result<Vec<String>>;

    /// Names of registered nodes
    fn nodes(&self, kubeconfig: &Path) -> Result<Vec<String>>;

    fn namespaces(&self, kubeconfig: &Path) -> Result<Vec<String>>;

    /// Names of custom resource definitions
    fn crds(&self, kubeconfig: &Path) -> Result<Vec<String>>;

    /// Force-delete every standard workload resource in a namespace
    fn delete_all_in_namespace(&self, kubeconfig: &Path, namespace: &str) -> Result<()>;

    fn delete_crd(&self, kubeconfig: &Path, name: &str) -> Result<()>;

    /// Evict workloads from a node, forcing eviction after `timeout`
    fn drain(&self, kubeconfig: &Path, node: &str, timeout: Duration) -> Result<()>;

    /// Delete a node's cluster registration
    fn delete_node(&self, kubeconfig: &Path, node: &str) -> Result<()>;
}

#[derive(Debug, Deserialize)]
struct ItemList {
    #[serde(default)]
    items: Vec<Item>,
}

#[derive(Debug, Deserialize)]
struct Item {
    metadata: Metadata,
    #[serde(default)]
    status: Option<ItemStatus>,
}

#[derive(Debug, Deserialize)]
struct Metadata {
    name: String,
}

#[derive(Debug, Deserialize)]
struct ItemStatus {
    #[serde(default)]
    phase: Option<String>,
}

pub(crate) fn parse_names(json: &str) -> Result<Vec<String>> {
    let list: ItemList = serde_json::from_str(json)?;
    Ok(list.items.into_iter().map(|i| i.metadata.name).collect())
}

pub(crate) fn parse_phases(json: &str) -> Result<Vec<String>> {
    let list: ItemList = serde_json::from_str(json)?;
    Ok(list
        .items
        .into_iter()
        .filter_map(|i| i.status.and_then(|s| s.phase))
        .collect())
}

/// `kubectl` binary invoked with `--kubeconfig`
#[derive(Debug, Clone)]
pub struct Kubectl {
    binary: String,
}

impl Default for Kubectl {
    fn default() -> Self {
        Self::new()
    }
}

impl Kubectl {
    pub fn new() -> Self {
        Self::with_binary("kubectl")
    }

    pub fn with_binary(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    fn invocation<'a>(&'a self, kubeconfig: &Path, args: &[&str]) -> Invocation<'a> {
        Invocation::new(&self.binary)
            .args(["--kubeconfig".to_string(), kubeconfig.display().to_string()])
            .args(args.iter().copied())
    }

    fn get_json(&self, kubeconfig: &Path, args: &[&str]) -> Result<String> {
        let mut full = args.to_vec();
        full.extend(["-o", "json"]);
        Ok(self.invocation(kubeconfig, &full).run()?.stdout)
    }
}

impl ClusterCli for Kubectl {
    fn apply(&self, kubeconfig: &Path, manifest: &Manifest) -> Result<()> {
        match manifest {
            Manifest::Url(url) => {
                self.invocation(kubeconfig, &["apply", "-f", url.as_str()]).run()?;
            }
            Manifest::Inline(yaml) => {
                self.invocation(kubeconfig, &["apply", "-f", "-"])
                    .stdin(yaml)
                    .run()?;
            }
        }
        Ok(())
    }

    fn pod_phases(&self, kubeconfig: &Path, namespace: &str) -> Result<Vec<String>> {
        parse_phases(&self.get_json(kubeconfig, &["get", "pods", "-n", namespace])?)
    }

    fn nodes(&self, kubeconfig: &Path) -> Result<Vec<String>> {
        parse_names(&self.get_json(kubeconfig, &["get", "nodes"])?)
    }

    fn namespaces(&self, kubeconfig: &Path) -> Result<Vec<String>> {
        parse_names(&self.get_json(kubeconfig, &["get", "namespaces"])?)
    }

    fn crds(&self, kubeconfig: &Path) -> Result<Vec<String>> {
        parse_names(&self.get_json(kubeconfig, &["get", "crds"])?)
    }

    fn delete_all_in_namespace(&self, kubeconfig: &Path, namespace: &str) -> Result<()> {
        self.invocation(
            kubeconfig,
            &["delete", "all", "--all", "-n", namespace, "--force", "--grace-period=0"],
        )
        .run()?;
        Ok(())
    }

    fn delete_crd(&self, kubeconfig: &Path, name: &str) -> Result<()> {
        self.invocation(kubeconfig, &["delete", "crd", name, "--wait=false"])
            .run()?;
        Ok(())
    }

    fn drain(&self, kubeconfig: &Path, node: &str, timeout: Duration) -> Result<()> {
        let timeout = format!("--timeout={}s", timeout.as_secs());
        self.invocation(
            kubeconfig,
            &[
                "drain",
                node,
                "--ignore-daemonsets",
                "--delete-emptydir-data",
                "--force",
                timeout.as_str(),
            ],
        )
        .run()?;
        Ok(())
    }

    fn delete_node(&self, kubeconfig: &Path, node: &str) -> Result<()> {
        self.invocation(kubeconfig, &["delete", "node", node]).run()?;
        Ok(())
    }
}
