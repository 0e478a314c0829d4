//! Add-on plugins declared in `plugins.yaml`
//!
//! A plugin is an ordered list of commands run on the host against a cluster, with
//! `KUBECONFIG` pointing at the cluster's stored kubeconfig:
//!
//! ```yaml
//! plugins:
//!   - name: cert-manager
//!     description: X.509 certificate management
//!     type: cluster
//!     allowed_adapters: [localdocker]
//!     commands:
//!       - name: install
//!         description: Apply the release manifest
//!         command: kubectl
//!         args: [apply, -f, "https://github.com/cert-manager/cert-manager/releases/download/v1.14.4/cert-manager.yaml"]
//! ```
//!
//! A plugin without commands but with a `manifest_url` is installed with
//! `kubectl apply -f <manifest_url>`.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::command::Invocation;
use crate::config::home_dir;
use crate::provider::Backend;
use crate::{Error, Result};

/// What a plugin acts on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PluginType {
    Cluster,
    Nodes,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PluginCommand {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    /// Piped to the command's standard input
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stdin: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Plugin {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(rename = "type")]
    pub plugin_type: PluginType,
    #[serde(default)]
    pub allowed_adapters: Vec<Backend>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub manifest_url: Option<String>,
    #[serde(default)]
    pub commands: Vec<PluginCommand>,
}

impl Plugin {
    pub fn supports(&self, backend: Backend) -> bool {
        self.allowed_adapters.contains(&backend)
    }

    /// Commands to run, in order
    pub fn install_steps(&self) -> Vec<PluginCommand> {
        match (&self.manifest_url, self.commands.is_empty()) {
            (Some(url), true) => vec![PluginCommand {
                name: "apply".to_string(),
                description: format!("Apply {}", url),
                command: "kubectl".to_string(),
                args: vec!["apply".into(), "-f".into(), url.clone()],
                stdin: None,
            }],
            _ => self.commands.clone(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PluginList {
    #[serde(default)]
    pub plugins: Vec<Plugin>,
}

/// Locations searched for `plugins.yaml`, in order
pub fn search_paths() -> Vec<PathBuf> {
    let mut paths = vec![
        PathBuf::from("plugins.yaml"),
        PathBuf::from("/etc/k3sctl/plugins.yaml"),
    ];
    if let Some(home) = home_dir() {
        paths.push(home.join(".k3sctl").join("plugins.yaml"));
    }
    paths
}

/// Plugins loaded from a declaration file
#[derive(Debug, Clone, Default)]
pub struct PluginRegistry {
    plugins: Vec<Plugin>,
    source: Option<PathBuf>,
}

impl PluginRegistry {
    /// Load from the first existing file among [`search_paths`]
    pub fn load() -> Result<Self> {
        Self::load_from(&search_paths())
    }

    /// Load from the first existing file among `paths`
    pub fn load_from(paths: &[PathBuf]) -> Result<Self> {
        match paths.iter().find(|p| p.is_file()) {
            Some(path) => Self::from_file(path),
            None => Err(Error::Plugin(format!(
                "no plugins.yaml found (searched {})",
                paths
                    .iter()
                    .map(|p| p.display().to_string())
                    .collect::<Vec<_>>()
                    .join(", ")
            ))),
        }
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)?;
        let mut registry = Self::from_yaml(&contents)
            .map_err(|e| Error::Plugin(format!("invalid {}: {}", path.display(), e)))?;
        registry.source = Some(path.to_path_buf());
        debug!(path = %path.display(), count = registry.plugins.len(), "Loaded plugins");
        Ok(registry)
    }

    pub fn from_yaml(contents: &str) -> Result<Self> {
        let list: PluginList = serde_yaml::from_str(contents)?;
        for (i, plugin) in list.plugins.iter().enumerate() {
            if plugin.name.is_empty() {
                return Err(Error::Plugin(format!("plugin #{} has no name", i + 1)));
            }
            if list.plugins[..i].iter().any(|p| p.name == plugin.name) {
                return Err(Error::Plugin(format!("duplicate plugin {}", plugin.name)));
            }
        }
        Ok(Self {
            plugins: list.plugins,
            source: None,
        })
    }

    /// File the plugins were read from
    pub fn source(&self) -> Option<&Path> {
        self.source.as_deref()
    }

    pub fn plugins(&self) -> &[Plugin] {
        &self.plugins
    }

    pub fn get(&self, name: &str) -> Result<&Plugin> {
        self.plugins
            .iter()
            .find(|p| p.name == name)
            .ok_or_else(|| Error::not_found("plugin", name))
    }

    pub fn by_type(&self, plugin_type: PluginType) -> Vec<&Plugin> {
        self.plugins
            .iter()
            .filter(|p| p.plugin_type == plugin_type)
            .collect()
    }

    pub fn for_backend(&self, backend: Backend) -> Vec<&Plugin> {
        self.plugins.iter().filter(|p| p.supports(backend)).collect()
    }

    /// False for unknown plugins
    pub fn is_compatible(&self, name: &str, backend: Backend) -> bool {
        self.get(name).map(|p| p.supports(backend)).unwrap_or(false)
    }
}

/// Runs plugin commands against one cluster
pub struct PluginExecutor {
    kubeconfig: PathBuf,
}

impl PluginExecutor {
    pub fn new(kubeconfig: impl Into<PathBuf>) -> Self {
        Self {
            kubeconfig: kubeconfig.into(),
        }
    }

    pub fn run_command(&self, command: &PluginCommand) -> Result<()> {
        let kubeconfig = self.kubeconfig.display().to_string();
        let mut invocation = Invocation::new(&command.command)
            .args(command.args.iter().cloned())
            .env("KUBECONFIG", kubeconfig);
        if let Some(input) = &command.stdin {
            invocation = invocation.stdin(input);
        }
        invocation
            .run()
            .map_err(|e| Error::step(format!("command {}", command.name), e))?;
        Ok(())
    }

    /// Run every install step in order, stopping at the first failure
    pub fn install(&self, plugin: &Plugin) -> Result<()> {
        for command in plugin.install_steps() {
            info!(plugin = %plugin.name, command = %command.name, "Running plugin command");
            self.run_command(&command)
                .map_err(|e| Error::Plugin(format!("failed to install {}: {}", plugin.name, e)))?;
        }
        Ok(())
    }
}
