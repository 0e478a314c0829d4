//! Container runtime abstraction
//!
//! The orchestrator only needs a handful of primitives from the container engine.
//! [`DockerCli`] provides them by shelling out to `docker`.

mod docker;

pub use docker::DockerCli;

#[cfg(test)]
use mockall::automock;

use crate::command::CommandOutput;
use crate::Result;

/// Label carrying the owning cluster's name
pub const CLUSTER_LABEL: &str = "io.k3sctl.cluster";
/// Label carrying the container's role (`server` or `agent`)
pub const ROLE_LABEL: &str = "io.k3sctl.role";

/// Role of a container within a cluster
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Server,
    Agent,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Server => "server",
            Role::Agent => "agent",
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A volume or bind mount
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mount {
    /// Named volume or absolute host path
    pub source: String,
    pub target: String,
}

/// Everything needed to start a detached container
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunSpec {
    pub name: String,
    pub image: String,
    pub privileged: bool,
    pub tmpfs: Vec<String>,
    pub env: Vec<(String, String)>,
    pub labels: Vec<(String, String)>,
    /// (host port, container port)
    pub ports: Vec<(u16, u16)>,
    pub mounts: Vec<Mount>,
    /// Arguments passed to the image entrypoint
    pub args: Vec<String>,
}

impl RunSpec {
    pub fn new(name: impl Into<String>, image: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            image: image.into(),
            ..Default::default()
        }
    }

    pub fn label(&self, key: &str) -> Option<&str> {
        self.labels
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn env_var(&self, key: &str) -> Option<&str> {
        self.env
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }
}

/// Container attribute queried through `inspect`
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InspectField {
    /// Runtime state such as `running` or `exited`
    Status,
    /// Address on the container's network(s)
    IpAddress,
    /// Value of a container label
    Label(String),
}

/// Selection of containers for `list`
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContainerFilter {
    /// Include stopped containers
    pub all: bool,
    /// Only containers created from this image
    pub ancestor: Option<String>,
    /// Only containers carrying every one of these labels
    pub labels: Vec<(String, String)>,
}

impl ContainerFilter {
    pub fn all() -> Self {
        Self {
            all: true,
            ..Default::default()
        }
    }

    pub fn ancestor(mut self, image: impl Into<String>) -> Self {
        self.ancestor = Some(image.into());
        self
    }

    pub fn label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.push((key.into(), value.into()));
        self
    }
}

/// Primitives of the container engine.
///
/// Operations on an absent container fail with `Error::NotFound`.
#[cfg_attr(test, automock)]
pub trait ContainerRuntime: Send + Sync {
    /// Start a detached container, returning its id
    fn run(&self, spec: &RunSpec) -> Result<String>;

    /// Run `argv` inside a container. A non-zero exit is returned, not raised.
    fn exec(&self, container: &str, argv: &[String]) -> Result<CommandOutput>;

    fn inspect(&self, container: &str, field: &InspectField) -> Result<String>;

    /// Remove a container (killing it first when `force`)
    fn remove(&self, container: &str, force: bool) -> Result<()>;

    /// Names of containers matching the filter
    fn list(&self, filter: &ContainerFilter) -> Result<Vec<String>>;

    /// Names of volumes whose name contains `name_filter`
    fn list_volumes(&self, name_filter: &str) -> Result<Vec<String>>;

    fn remove_volume(&self, name: &str) -> Result<()>;

    /// Names of networks whose name contains `name_filter`
    fn list_networks(&self, name_filter: &str) -> Result<Vec<String>>;

    fn remove_network(&self, name: &str) -> Result<()>;

    /// Remove all unused volumes
    fn prune_volumes(&self) -> Result<()>;

    /// Remove all unused networks
    fn prune_networks(&self) -> Result<()>;
}

/// Convert a list of string slices into an owned argv
pub fn argv(args: &[&str]) -> Vec<String> {
    args.iter().map(|a| a.to_string()).collect()
}
