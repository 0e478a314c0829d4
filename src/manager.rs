//! Cluster manager: the entry point callers use

use std::collections::BTreeSet;
use std::path::PathBuf;

use tracing::info;

use crate::config::ProviderConfig;
use crate::plugins::{PluginExecutor, PluginRegistry};
use crate::provider::{Backend, LocalDockerProvider, Provider};
use crate::teardown::TeardownReport;
use crate::{Error, Result};

/// Owns one provider and forwards every lifecycle operation to it
pub struct ClusterManager {
    provider: Box<dyn Provider>,
}

impl ClusterManager {
    pub fn new(provider: impl Provider + 'static) -> Self {
        Self {
            provider: Box::new(provider),
        }
    }

    /// Manager backed by the local docker daemon
    pub fn local(config: ProviderConfig) -> Result<Self> {
        Ok(Self::new(LocalDockerProvider::new(config)?))
    }

    pub fn backend(&self) -> Backend {
        self.provider.backend()
    }

    pub fn create_cluster(&self, name: &str) -> Result<()> {
        self.provider.create_cluster(name)
    }

    pub fn list_clusters(&self) -> Result<BTreeSet<String>> {
        self.provider.list_clusters()
    }

    pub fn add_node(&self, cluster: &str, node: &str) -> Result<()> {
        self.provider.add_node(cluster, node)
    }

    pub fn remove_node(&self, cluster: &str, node: &str) -> Result<TeardownReport> {
        self.provider.remove_node(cluster, node)
    }

    pub fn delete_cluster(&self, name: &str) -> Result<TeardownReport> {
        self.provider.delete_cluster(name)
    }

    pub fn cluster_status(&self, name: &str) -> Result<String> {
        self.provider.cluster_status(name)
    }

    pub fn kubeconfig(&self, name: &str) -> Result<PathBuf> {
        self.provider.kubeconfig(name)
    }

    /// Install a registry plugin on a cluster
    pub fn install_plugin(&self, cluster: &str, registry: &PluginRegistry, plugin: &str) -> Result<()> {
        let plugin = registry.get(plugin)?;
        let backend = self.provider.backend();
        if !plugin.supports(backend) {
            return Err(Error::Plugin(format!(
                "plugin {} does not support the {} backend",
                plugin.name, backend
            )));
        }

        let kubeconfig = self.provider.kubeconfig(cluster)?;
        info!(cluster = %cluster, plugin = %plugin.name, "Installing plugin");
        PluginExecutor::new(kubeconfig).install(plugin)
    }
}
