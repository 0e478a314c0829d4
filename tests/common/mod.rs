//! In-memory docker daemon and cluster shared by the integration tests

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use k3sctl::command::CommandOutput;
use k3sctl::kubectl::{ClusterCli, Manifest};
use k3sctl::runtime::{ContainerFilter, ContainerRuntime, InspectField, RunSpec, CLUSTER_LABEL};
use k3sctl::{Error, Result};
use parking_lot::Mutex;

pub const JOIN_TOKEN: &str = "K10c0ffee::server:s3cret";

pub const K3S_KUBECONFIG: &str = r#"apiVersion: v1
clusters:
- cluster:
    certificate-authority-data: Y2EtY2VydA==
    server: https://127.0.0.1:6443
  name: default
contexts:
- context:
    cluster: default
    user: default
  name: default
current-context: default
kind: Config
preferences: {}
users:
- name: default
  user:
    client-certificate-data: Y2xpZW50LWNlcnQ=
    client-key-data: Y2xpZW50LWtleQ==
"#;

#[derive(Debug, Clone)]
pub struct Container {
    pub spec: RunSpec,
    pub state: String,
    pub ip: String,
}

#[derive(Debug, Default)]
pub struct World {
    pub containers: BTreeMap<String, Container>,
    /// Nodes registered with the cluster API
    pub registered: BTreeSet<String>,
    pub volumes: BTreeSet<String>,
    /// Manifests applied, in order
    pub applied: Vec<String>,
    /// Nodes whose drain fails
    pub drain_failures: BTreeSet<String>,
    /// Agents that start but never register
    pub never_join: BTreeSet<String>,
    /// Container removals that fail with a daemon error
    pub remove_failures: BTreeSet<String>,
    pub drained: Vec<String>,
    pub wiped_namespaces: Vec<String>,
    /// Readiness probes failing before the API server answers
    pub probes_until_ready: u32,
    next_ip: u8,
}

/// Shared handle to the fake world, cloned into each collaborator
#[derive(Clone, Default)]
pub struct Fake {
    pub world: Arc<Mutex<World>>,
}

impl Fake {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn docker(&self) -> FakeDocker {
        FakeDocker {
            world: self.world.clone(),
        }
    }

    pub fn kubectl(&self) -> FakeKubectl {
        FakeKubectl {
            world: self.world.clone(),
        }
    }
}

pub struct FakeDocker {
    world: Arc<Mutex<World>>,
}

fn daemon_error(command: &str, stderr: &str) -> Error {
    Error::Command {
        command: command.to_string(),
        code: Some(1),
        stdout: String::new(),
        stderr: stderr.to_string(),
    }
}

impl ContainerRuntime for FakeDocker {
    fn run(&self, spec: &RunSpec) -> Result<String> {
        let mut world = self.world.lock();
        if world.containers.contains_key(&spec.name) {
            return Err(daemon_error(
                "docker run",
                &format!("Conflict. The container name \"/{}\" is already in use", spec.name),
            ));
        }
        world.next_ip += 1;
        let ip = format!("172.17.0.{}", world.next_ip + 1);
        for mount in spec.mounts.iter().filter(|m| !m.source.starts_with('/')) {
            world.volumes.insert(mount.source.clone());
        }
        match spec.args.first().map(String::as_str) {
            Some("server") => {
                world.registered.insert(spec.name.clone());
            }
            Some("agent")
                if spec.env_var("K3S_TOKEN") == Some(JOIN_TOKEN)
                    && !world.never_join.contains(&spec.name) =>
            {
                world.registered.insert(spec.name.clone());
            }
            _ => {}
        }
        world.containers.insert(
            spec.name.clone(),
            Container {
                spec: spec.clone(),
                state: "running".into(),
                ip,
            },
        );
        Ok(format!("{:0>12}", world.containers.len()))
    }

    fn exec(&self, container: &str, argv: &[String]) -> Result<CommandOutput> {
        let mut world = self.world.lock();
        if !world.containers.contains_key(container) {
            return Err(Error::not_found("container", container));
        }
        let argv: Vec<&str> = argv.iter().map(String::as_str).collect();
        Ok(match argv.as_slice() {
            ["kubectl", "get", "nodes"] => {
                if world.probes_until_ready > 0 {
                    world.probes_until_ready -= 1;
                    CommandOutput::failed(1, "The connection to the server was refused")
                } else {
                    CommandOutput::ok("NAME   STATUS   ROLES\n")
                }
            }
            ["cat", "/etc/rancher/k3s/k3s.yaml"] => CommandOutput::ok(K3S_KUBECONFIG),
            ["cat", "/var/lib/rancher/k3s/server/node-token"] => {
                CommandOutput::ok(format!("{}\n", JOIN_TOKEN))
            }
            other => CommandOutput::failed(127, format!("unknown command {:?}", other)),
        })
    }

    fn inspect(&self, container: &str, field: &InspectField) -> Result<String> {
        let world = self.world.lock();
        let c = world
            .containers
            .get(container)
            .ok_or_else(|| Error::not_found("container", container))?;
        Ok(match field {
            InspectField::Status => c.state.clone(),
            InspectField::IpAddress => c.ip.clone(),
            InspectField::Label(key) => c.spec.label(key).unwrap_or_default().to_string(),
        })
    }

    fn remove(&self, container: &str, _force: bool) -> Result<()> {
        let mut world = self.world.lock();
        if world.remove_failures.contains(container) {
            return Err(daemon_error("docker rm -f", "Error response from daemon: device or resource busy"));
        }
        world
            .containers
            .remove(container)
            .map(|_| ())
            .ok_or_else(|| Error::not_found("container", container))
    }

    fn list(&self, filter: &ContainerFilter) -> Result<Vec<String>> {
        let world = self.world.lock();
        Ok(world
            .containers
            .values()
            .filter(|c| filter.all || c.state == "running")
            .filter(|c| filter.ancestor.as_ref().map_or(true, |i| *i == c.spec.image))
            .filter(|c| {
                filter
                    .labels
                    .iter()
                    .all(|(k, v)| c.spec.label(k) == Some(v.as_str()))
            })
            .map(|c| c.spec.name.clone())
            .collect())
    }

    fn list_volumes(&self, name_filter: &str) -> Result<Vec<String>> {
        let world = self.world.lock();
        Ok(world
            .volumes
            .iter()
            .filter(|v| v.contains(name_filter))
            .cloned()
            .collect())
    }

    fn remove_volume(&self, name: &str) -> Result<()> {
        let mut world = self.world.lock();
        if world.volumes.remove(name) {
            Ok(())
        } else {
            Err(Error::not_found("volume", name))
        }
    }

    fn list_networks(&self, _name_filter: &str) -> Result<Vec<String>> {
        Ok(Vec::new())
    }

    fn remove_network(&self, name: &str) -> Result<()> {
        Err(Error::not_found("network", name))
    }

    fn prune_volumes(&self) -> Result<()> {
        Ok(())
    }

    fn prune_networks(&self) -> Result<()> {
        Ok(())
    }
}

pub struct FakeKubectl {
    world: Arc<Mutex<World>>,
}

impl ClusterCli for FakeKubectl {
    fn apply(&self, _kubeconfig: &Path, manifest: &Manifest) -> Result<()> {
        let entry = match manifest {
            Manifest::Url(url) => url.clone(),
            Manifest::Inline(yaml) if yaml.contains("kind: IPAddressPool") => "lb-pool".to_string(),
            Manifest::Inline(yaml) if yaml.contains("calico") => "calico".to_string(),
            Manifest::Inline(_) => "inline".to_string(),
        };
        self.world.lock().applied.push(entry);
        Ok(())
    }

    fn pod_phases(&self, _kubeconfig: &Path, _namespace: &str) -> Result<Vec<String>> {
        Ok(vec!["Pending".into(), "Running".into()])
    }

    fn nodes(&self, _kubeconfig: &Path) -> Result<Vec<String>> {
        Ok(self.world.lock().registered.iter().cloned().collect())
    }

    fn namespaces(&self, _kubeconfig: &Path) -> Result<Vec<String>> {
        Ok(["default", "kube-system", "kube-public", "kube-node-lease", "apps"]
            .iter()
            .map(|s| s.to_string())
            .collect())
    }

    fn crds(&self, _kubeconfig: &Path) -> Result<Vec<String>> {
        Ok(vec!["ipaddresspools.metallb.io".into()])
    }

    fn delete_all_in_namespace(&self, _kubeconfig: &Path, namespace: &str) -> Result<()> {
        self.world.lock().wiped_namespaces.push(namespace.to_string());
        Ok(())
    }

    fn delete_crd(&self, _kubeconfig: &Path, _name: &str) -> Result<()> {
        Ok(())
    }

    fn drain(&self, _kubeconfig: &Path, node: &str, _timeout: Duration) -> Result<()> {
        let mut world = self.world.lock();
        if world.drain_failures.contains(node) {
            return Err(daemon_error(
                "kubectl drain",
                "error when evicting pods: Cannot evict pod as it would violate the pod's disruption budget",
            ));
        }
        world.drained.push(node.to_string());
        Ok(())
    }

    fn delete_node(&self, _kubeconfig: &Path, node: &str) -> Result<()> {
        if self.world.lock().registered.remove(node) {
            Ok(())
        } else {
            Err(Error::not_found("node", node))
        }
    }
}

/// Add a worker container that never joined the cluster
pub fn orphan_worker(world: &Arc<Mutex<World>>, cluster: &str, node: &str) {
    let mut spec = RunSpec::new(node, k3sctl::config::DEFAULT_IMAGE);
    spec.labels = vec![
        (CLUSTER_LABEL.to_string(), cluster.to_string()),
        (k3sctl::runtime::ROLE_LABEL.to_string(), "agent".to_string()),
    ];
    spec.args = vec!["agent".into()];
    world.lock().containers.insert(
        node.to_string(),
        Container {
            spec,
            state: "exited".into(),
            ip: String::new(),
        },
    );
}

/// Add an unlabelled container and a volume of the same name, as another tool would
pub fn foreign_container(world: &Arc<Mutex<World>>, name: &str, image: &str) {
    let mut world = world.lock();
    world.containers.insert(
        name.to_string(),
        Container {
            spec: RunSpec::new(name, image),
            state: "running".into(),
            ip: "172.17.0.50".into(),
        },
    );
    world.volumes.insert(name.to_string());
}
