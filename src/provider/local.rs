//! k3s-in-docker provider
//!
//! The master container runs `k3s server` with the default overlay network,
//! network policy controller, load balancer and ingress disabled; the bootstrap
//! sequence installs Calico, MetalLB and ingress-nginx in their place. Workers run
//! `k3s agent` pointed at the master's container address.
//!
//! Bootstrap fails fast: the first failing step aborts the sequence and nothing is
//! rolled back. Teardown is the opposite: every action is attempted, failures are
//! collected into a [`TeardownReport`], and only failing to remove the master (or,
//! for node removal, the node's container) fails the operation.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{info, info_span, warn};

use crate::addons::{builtin_addons, pods_running, BuiltinAddOn};
use crate::config::ProviderConfig;
use crate::kubeconfig::{self, KubeconfigStore};
use crate::kubectl::{ClusterCli, Kubectl};
use crate::progress::{NoProgress, Progress};
use crate::provider::{validate_name, Backend, Provider};
use crate::retry::{poll_until, CancelToken, Clock, SystemClock};
use crate::runtime::{
    argv, ContainerFilter, ContainerRuntime, DockerCli, InspectField, Mount, RunSpec,
    CLUSTER_LABEL, ROLE_LABEL, Role,
};
use crate::teardown::{Outcome, TeardownReport};
use crate::{Error, Result};

/// Kubeconfig generated by k3s inside the master
const K3S_KUBECONFIG_PATH: &str = "/etc/rancher/k3s/k3s.yaml";
/// Join token generated by k3s inside the master
const K3S_TOKEN_PATH: &str = "/var/lib/rancher/k3s/server/node-token";
const K3S_DATA_DIR: &str = "/var/lib/rancher/k3s";
const K3S_CONFIG_DIR: &str = "/etc/rancher/k3s";
/// API server port inside the container
const K3S_API_PORT: u16 = 6443;

/// Namespaces left alone when wiping workloads
const SYSTEM_NAMESPACES: &[&str] = &["kube-system", "kube-public", "kube-node-lease"];

const CREATE_STEPS: usize = 9;
const ADD_NODE_STEPS: usize = 5;
const REMOVE_NODE_STEPS: usize = 4;
const DELETE_STEPS: usize = 7;

/// Provider running every cluster node as a container on the local docker daemon
pub struct LocalDockerProvider {
    config: ProviderConfig,
    runtime: Box<dyn ContainerRuntime>,
    cli: Box<dyn ClusterCli>,
    clock: Arc<dyn Clock>,
    progress: Arc<dyn Progress>,
    cancel: CancelToken,
    store: KubeconfigStore,
}

impl LocalDockerProvider {
    /// Provider using the `docker` and `kubectl` binaries
    pub fn new(config: ProviderConfig) -> Result<Self> {
        config.validate()?;
        let store = KubeconfigStore::new(config.kubeconfig_dir.clone());
        Ok(Self {
            config,
            runtime: Box::new(DockerCli::new()),
            cli: Box::new(Kubectl::new()),
            clock: Arc::new(SystemClock),
            progress: Arc::new(NoProgress),
            cancel: CancelToken::new(),
            store,
        })
    }

    pub fn with_runtime(mut self, runtime: impl ContainerRuntime + 'static) -> Self {
        self.runtime = Box::new(runtime);
        self
    }

    pub fn with_cluster_cli(mut self, cli: impl ClusterCli + 'static) -> Self {
        self.cli = Box::new(cli);
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_progress(mut self, progress: Arc<dyn Progress>) -> Self {
        self.progress = progress;
        self
    }

    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn config(&self) -> &ProviderConfig {
        &self.config
    }

    /// Where the cluster's kubeconfig is stored
    pub fn kubeconfig_path(&self, cluster: &str) -> PathBuf {
        self.store.path_for(cluster)
    }

    /// Persistent state mounts of a master container
    fn state_mounts(&self, cluster: &str) -> Vec<Mount> {
        match &self.config.state_dir {
            Some(dir) => {
                let base = dir.join(cluster);
                vec![
                    Mount {
                        source: base.join("data").display().to_string(),
                        target: K3S_DATA_DIR.to_string(),
                    },
                    Mount {
                        source: base.join("config").display().to_string(),
                        target: K3S_CONFIG_DIR.to_string(),
                    },
                ]
            }
            None => cluster_volumes(cluster)
                .into_iter()
                .zip([K3S_DATA_DIR, K3S_CONFIG_DIR])
                .map(|(source, target)| Mount {
                    source,
                    target: target.to_string(),
                })
                .collect(),
        }
    }

    pub(crate) fn master_spec(&self, cluster: &str) -> RunSpec {
        RunSpec {
            name: cluster.to_string(),
            image: self.config.image.clone(),
            privileged: true,
            tmpfs: vec!["/run".into(), "/var/run".into()],
            env: vec![
                ("K3S_KUBECONFIG_MODE".into(), "644".into()),
                ("K3S_CLUSTER_INIT".into(), "true".into()),
                ("K3S_NODE_NAME".into(), cluster.to_string()),
            ],
            labels: labels(cluster, Role::Server),
            ports: vec![
                (self.config.api_port, K3S_API_PORT),
                (self.config.http_port, 80),
                (self.config.https_port, 443),
            ],
            mounts: self.state_mounts(cluster),
            args: vec![
                "server".into(),
                "--flannel-backend=none".into(),
                "--disable-network-policy".into(),
                "--disable=traefik".into(),
                "--disable=servicelb".into(),
                format!("--tls-san={}", self.config.api_host),
            ],
        }
    }

    pub(crate) fn worker_spec(&self, cluster: &str, node: &str, master_ip: &str, token: &str) -> RunSpec {
        RunSpec {
            name: node.to_string(),
            image: self.config.image.clone(),
            privileged: true,
            tmpfs: vec!["/run".into(), "/var/run".into()],
            env: vec![
                ("K3S_URL".into(), format!("https://{}:{}", master_ip, K3S_API_PORT)),
                ("K3S_TOKEN".into(), token.to_string()),
                ("K3S_NODE_NAME".into(), node.to_string()),
            ],
            labels: labels(cluster, Role::Agent),
            ports: Vec::new(),
            mounts: Vec::new(),
            args: vec!["agent".into()],
        }
    }

    /// Report progress for the next step, aborting if cancelled
    fn begin_step(&self, message: &str) -> Result<()> {
        self.cancel.check(message)?;
        info!("{}", message);
        self.progress.step(message);
        Ok(())
    }

    /// Run `f` as a tracked operation of `total` steps
    fn tracked<T>(&self, operation: &str, total: usize, f: impl FnOnce() -> Result<T>) -> Result<T> {
        self.progress.start(operation, total);
        let result = f();
        match &result {
            Ok(_) => self.progress.finish(true, operation),
            Err(e) => self.progress.finish(false, &e.to_string()),
        }
        result
    }

    /// Record a best-effort action, surfacing failures as progress warnings
    fn attempt(
        &self,
        report: &mut TeardownReport,
        step: &str,
        subject: Option<&str>,
        result: Result<()>,
    ) -> bool {
        let ok = report.attempt(step, subject, result);
        if !ok {
            let msg = match subject {
                Some(s) => format!("{} ({}) failed", step, s),
                None => format!("{} failed", step),
            };
            self.progress.warn(&msg);
        }
        ok
    }

    fn status_of(&self, cluster: &str) -> Result<String> {
        self.runtime
            .inspect(cluster, &InspectField::Status)
            .map_err(|e| cluster_not_found(e, cluster))
    }

    fn require_running(&self, cluster: &str) -> Result<()> {
        let state = self.status_of(cluster)?;
        if state != "running" {
            return Err(Error::NotRunning {
                name: cluster.to_string(),
                state,
            });
        }
        Ok(())
    }

    /// Pull the master's kubeconfig, rewrite it for the host and store it
    fn fetch_kubeconfig(&self, cluster: &str) -> Result<PathBuf> {
        let cat = argv(&["cat", K3S_KUBECONFIG_PATH]);
        let output = self
            .runtime
            .exec(cluster, &cat)
            .map_err(|e| cluster_not_found(e, cluster))?
            .into_result(format!("docker exec {} cat {}", cluster, K3S_KUBECONFIG_PATH))?;

        let contents = kubeconfig::rewrite(
            &output.stdout,
            cluster,
            &self.config.api_host,
            self.config.api_port,
        )?;
        kubeconfig::validate(&contents)?;
        self.store.write(cluster, &contents)
    }

    fn wait_for_api(&self, cluster: &str) -> Result<()> {
        let probe = argv(&["kubectl", "get", "nodes"]);
        let outcome = poll_until(
            &self.config.readiness,
            self.clock.as_ref(),
            &self.cancel,
            &format!("API server of {}", cluster),
            |_| Ok(self.runtime.exec(cluster, &probe)?.success()),
        )?;
        info!(cluster = %cluster, attempts = outcome.attempts, "API server ready");
        Ok(())
    }

    fn install_addon(&self, kubeconfig: &Path, addon: &BuiltinAddOn) -> Result<()> {
        let install_failed = |e: Error| Error::AddOnInstall {
            addon: addon.name.to_string(),
            source: Box::new(e),
        };

        self.begin_step(&format!("Installing {}", addon.name))?;
        info!(addon = addon.name, manifest = %addon.manifest.describe(), "Applying add-on");
        self.cli
            .apply(kubeconfig, &addon.manifest)
            .map_err(install_failed)?;

        if let Some(namespace) = addon.wait_namespace {
            let step = format!("Waiting for {} to be ready", addon.name);
            self.begin_step(&step)?;
            poll_until(
                &self.config.addon_readiness,
                self.clock.as_ref(),
                &self.cancel,
                &format!("{} pods in {}", addon.name, namespace),
                |_| Ok(pods_running(&self.cli.pod_phases(kubeconfig, namespace)?)),
            )
            .map_err(|e| Error::step(step.as_str(), e))?;
        }

        if let Some(post) = &addon.post_install {
            self.begin_step(&format!("Configuring {}", addon.name))?;
            self.cli.apply(kubeconfig, post).map_err(install_failed)?;
        }
        Ok(())
    }

    fn bootstrap_master(&self, cluster: &str) -> Result<()> {
        self.begin_step("Creating master node container")?;
        let id = self
            .runtime
            .run(&self.master_spec(cluster))
            .map_err(|e| Error::Provision {
                unit: cluster.to_string(),
                source: Box::new(e),
            })?;
        info!(cluster = %cluster, container = %id, "Master container started");

        let step = "Waiting for cluster to be ready";
        self.begin_step(step)?;
        self.wait_for_api(cluster).map_err(|e| Error::step(step, e))?;

        let step = "Getting kubeconfig";
        self.begin_step(step)?;
        let kubeconfig = self
            .fetch_kubeconfig(cluster)
            .map_err(|e| Error::step(step, e))?;

        for addon in builtin_addons(&self.config) {
            self.install_addon(&kubeconfig, &addon)?;
        }

        info!(cluster = %cluster, endpoint = %self.config.endpoint(), "Cluster ready");
        Ok(())
    }

    fn join_worker(&self, cluster: &str, node: &str) -> Result<()> {
        let step = "Checking master node";
        self.begin_step(step)?;
        self.require_running(cluster)?;

        let step = "Getting token from master node";
        self.begin_step(step)?;
        let token = self
            .runtime
            .exec(cluster, &argv(&["cat", K3S_TOKEN_PATH]))
            .and_then(|out| out.into_result(format!("docker exec {} cat {}", cluster, K3S_TOKEN_PATH)))
            .map_err(|e| Error::step(step, e))?
            .stdout
            .trim()
            .to_string();
        if token.is_empty() {
            return Err(Error::step(step, Error::Config("master returned an empty join token".into())));
        }

        let step = "Getting master node IP";
        self.begin_step(step)?;
        let master_ip = self
            .runtime
            .inspect(cluster, &InspectField::IpAddress)
            .map_err(|e| Error::step(step, e))?;
        if master_ip.is_empty() {
            return Err(Error::step(step, Error::Config(format!("master {} has no network address", cluster))));
        }

        self.begin_step("Creating worker node container")?;
        let id = self
            .runtime
            .run(&self.worker_spec(cluster, node, &master_ip, &token))
            .map_err(|e| Error::Provision {
                unit: node.to_string(),
                source: Box::new(e),
            })?;
        info!(cluster = %cluster, node = %node, container = %id, "Worker container started");

        let step = "Waiting for node to join the cluster";
        self.begin_step(step)?;
        let kubeconfig = self
            .fetch_kubeconfig(cluster)
            .map_err(|e| Error::step(step, e))?;
        poll_until(
            &self.config.join,
            self.clock.as_ref(),
            &self.cancel,
            &format!("node {} to register", node),
            |_| Ok(self.cli.nodes(&kubeconfig)?.iter().any(|n| n == node)),
        )
        .map_err(|e| Error::step(step, e))?;

        info!(cluster = %cluster, node = %node, "Node joined");
        Ok(())
    }

    /// Credentials for teardown; a failure is recorded, not raised
    fn teardown_kubeconfig(&self, report: &mut TeardownReport, cluster: &str) -> Option<PathBuf> {
        match self.fetch_kubeconfig(cluster) {
            Ok(path) => {
                report.record("Get kubeconfig", None, Outcome::Done);
                Some(path)
            }
            Err(e) => {
                warn!(cluster = %cluster, error = %e, "Cluster unreachable, skipping cluster-level cleanup");
                let outcome = if e.is_not_found() {
                    Outcome::Absent
                } else {
                    Outcome::Warning(e.to_string())
                };
                report.record("Get kubeconfig", None, outcome);
                self.progress.warn("cluster unreachable, skipping cluster-level cleanup");
                None
            }
        }
    }

    fn remove_workloads(&self, report: &mut TeardownReport, kubeconfig: &Path) {
        match self.cli.namespaces(kubeconfig) {
            Ok(namespaces) => {
                for ns in namespaces
                    .iter()
                    .filter(|ns| !SYSTEM_NAMESPACES.contains(&ns.as_str()))
                {
                    let result = self.cli.delete_all_in_namespace(kubeconfig, ns);
                    self.attempt(report, "Delete namespace resources", Some(ns.as_str()), result);
                }
            }
            Err(e) => {
                self.attempt(report, "List namespaces", None, Err(e));
            }
        }
    }

    fn remove_crds(&self, report: &mut TeardownReport, kubeconfig: &Path) {
        match self.cli.crds(kubeconfig) {
            Ok(crds) => {
                for crd in &crds {
                    let result = self.cli.delete_crd(kubeconfig, crd);
                    self.attempt(report, "Delete CRD", Some(crd.as_str()), result);
                }
            }
            Err(e) => {
                self.attempt(report, "List CRDs", None, Err(e));
            }
        }
    }

    /// Registered nodes, or an empty set if they cannot be listed
    fn registered_nodes(&self, report: &mut TeardownReport, kubeconfig: Option<&Path>) -> BTreeSet<String> {
        let Some(kubeconfig) = kubeconfig else {
            return BTreeSet::new();
        };
        match self.cli.nodes(kubeconfig) {
            Ok(nodes) => nodes.into_iter().collect(),
            Err(e) => {
                self.attempt(report, "List nodes", None, Err(e));
                BTreeSet::new()
            }
        }
    }

    fn worker_containers(&self, report: &mut TeardownReport, cluster: &str) -> BTreeSet<String> {
        let filter = ContainerFilter::all()
            .label(CLUSTER_LABEL, cluster)
            .label(ROLE_LABEL, Role::Agent.as_str());
        match self.runtime.list(&filter) {
            Ok(names) => names.into_iter().collect(),
            Err(e) => {
                self.attempt(report, "List worker containers", None, Err(e));
                BTreeSet::new()
            }
        }
    }

    /// Drain and unregister a node, then remove its container
    fn teardown_worker(
        &self,
        report: &mut TeardownReport,
        kubeconfig: Option<&Path>,
        registered: bool,
        node: &str,
    ) {
        if let (Some(kubeconfig), true) = (kubeconfig, registered) {
            let result = self.cli.drain(kubeconfig, node, self.config.drain_timeout);
            self.attempt(report, "Drain node", Some(node), result);
            let result = self.cli.delete_node(kubeconfig, node);
            self.attempt(report, "Unregister node", Some(node), result);
        }
        let result = self.runtime.remove(node, true);
        self.attempt(report, "Remove node container", Some(node), result);
    }

    fn remove_local_state(&self, report: &mut TeardownReport, cluster: &str) {
        let path = self.store.path_for(cluster).display().to_string();
        match self.store.remove(cluster) {
            Ok(true) => report.record("Remove kubeconfig", Some(path.as_str()), Outcome::Done),
            Ok(false) => report.record("Remove kubeconfig", Some(path.as_str()), Outcome::Absent),
            Err(e) => {
                self.attempt(report, "Remove kubeconfig", Some(path.as_str()), Err(e));
            }
        }

        if let Some(dir) = &self.config.state_dir {
            let state = dir.join(cluster);
            let subject = state.display().to_string();
            let result = match std::fs::remove_dir_all(&state) {
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    Err(Error::not_found("state directory", subject.clone()))
                }
                other => other.map_err(Error::from),
            };
            self.attempt(report, "Remove state directory", Some(subject.as_str()), result);
        }
    }

    fn prune_runtime_leftovers(&self, report: &mut TeardownReport, cluster: &str) {
        let volumes = cluster_volumes(cluster);
        match self.runtime.list_volumes(cluster) {
            Ok(found) => {
                for volume in found.iter().filter(|v| volumes.contains(v)) {
                    let result = self.runtime.remove_volume(volume);
                    self.attempt(report, "Remove volume", Some(volume.as_str()), result);
                }
            }
            Err(e) => {
                self.attempt(report, "List volumes", None, Err(e));
            }
        }

        match self.runtime.list_networks(cluster) {
            Ok(found) => {
                for network in found.iter().filter(|n| *n == cluster) {
                    let result = self.runtime.remove_network(network);
                    self.attempt(report, "Remove network", Some(network.as_str()), result);
                }
            }
            Err(e) => {
                self.attempt(report, "List networks", None, Err(e));
            }
        }

        if self.config.prune_dangling {
            let result = self.runtime.prune_volumes();
            self.attempt(report, "Prune dangling volumes", None, result);
            let result = self.runtime.prune_networks();
            self.attempt(report, "Prune dangling networks", None, result);
        }
    }

    /// Refuse to tear down a container that is not a k3sctl master. An absent container passes.
    fn ensure_master(&self, cluster: &str) -> Result<()> {
        match self.runtime.inspect(cluster, &InspectField::Label(ROLE_LABEL.to_string())) {
            Ok(role) if role == Role::Server.as_str() => Ok(()),
            Ok(role) if role == Role::Agent.as_str() => Err(Error::Config(format!(
                "{} is a worker node, not a cluster; use `node remove` instead",
                cluster
            ))),
            Ok(_) => Err(Error::Config(format!(
                "container {} is not a k3sctl cluster",
                cluster
            ))),
            Err(e) if e.is_not_found() => Ok(()),
            Err(e) => Err(e),
        }
    }

    fn teardown_cluster(&self, cluster: &str) -> Result<TeardownReport> {
        self.ensure_master(cluster)?;
        let mut report = TeardownReport::new(cluster);

        self.progress.step("Getting kubeconfig");
        let kubeconfig = self.teardown_kubeconfig(&mut report, cluster);

        self.progress.step("Removing all resources from the cluster");
        match &kubeconfig {
            Some(kc) => self.remove_workloads(&mut report, kc),
            None => report.record("Delete namespace resources", None, Outcome::Skipped("cluster unreachable".into())),
        }

        self.progress.step("Removing custom resource definitions");
        match &kubeconfig {
            Some(kc) => self.remove_crds(&mut report, kc),
            None => report.record("Delete CRDs", None, Outcome::Skipped("cluster unreachable".into())),
        }

        self.progress.step("Removing worker nodes");
        let registered = self.registered_nodes(&mut report, kubeconfig.as_deref());
        let containers = self.worker_containers(&mut report, cluster);
        for node in registered.union(&containers).filter(|n| n.as_str() != cluster) {
            self.teardown_worker(&mut report, kubeconfig.as_deref(), registered.contains(node), node);
        }

        self.progress.step("Removing master node container");
        match self.runtime.remove(cluster, true) {
            Ok(()) => report.record("Remove master container", Some(cluster), Outcome::Done),
            Err(e) if e.is_not_found() => {
                info!(cluster = %cluster, "Master container already absent");
                report.record("Remove master container", Some(cluster), Outcome::Absent)
            }
            Err(e) => {
                report.record("Remove master container", Some(cluster), Outcome::Warning(e.to_string()));
                return Err(Error::Teardown {
                    target: cluster.to_string(),
                    source: Box::new(e),
                    report,
                });
            }
        }

        self.progress.step("Cleaning up configuration files");
        self.remove_local_state(&mut report, cluster);

        self.progress.step("Removing volumes and networks");
        self.prune_runtime_leftovers(&mut report, cluster);

        if report.is_clean() {
            info!(cluster = %cluster, "Cluster deleted");
        } else {
            warn!(cluster = %cluster, warnings = report.warnings().count(), "Cluster deleted with warnings");
        }
        Ok(report)
    }

    fn teardown_node(&self, cluster: &str, node: &str) -> Result<TeardownReport> {
        let mut report = TeardownReport::new(format!("{}/{}", cluster, node));

        match self.runtime.inspect(node, &InspectField::Label(CLUSTER_LABEL.to_string())) {
            Ok(owner) if !owner.is_empty() && owner != cluster => {
                return Err(Error::Config(format!(
                    "node {} belongs to cluster {}, not {}",
                    node, owner, cluster
                )));
            }
            _ => {}
        }

        self.progress.step("Getting kubeconfig");
        let kubeconfig = self.teardown_kubeconfig(&mut report, cluster);

        self.progress.step("Checking if node is registered");
        let registered = self.registered_nodes(&mut report, kubeconfig.as_deref());
        let is_registered = registered.contains(node);
        if kubeconfig.is_some() && !is_registered {
            info!(cluster = %cluster, node = %node, "Node not registered in cluster");
            report.record("Unregister node", Some(node), Outcome::Skipped("not registered".into()));
        }

        self.progress.step("Draining and unregistering node");
        if let (Some(kubeconfig), true) = (kubeconfig.as_deref(), is_registered) {
            let result = self.cli.drain(kubeconfig, node, self.config.drain_timeout);
            self.attempt(&mut report, "Drain node", Some(node), result);
            let result = self.cli.delete_node(kubeconfig, node);
            self.attempt(&mut report, "Unregister node", Some(node), result);
        }

        self.progress.step("Removing node container");
        match self.runtime.remove(node, true) {
            Ok(()) => report.record("Remove node container", Some(node), Outcome::Done),
            Err(e) if e.is_not_found() => {
                report.record("Remove node container", Some(node), Outcome::Absent)
            }
            Err(e) => {
                report.record("Remove node container", Some(node), Outcome::Warning(e.to_string()));
                return Err(Error::Teardown {
                    target: report.target.clone(),
                    source: Box::new(e),
                    report,
                });
            }
        }

        info!(cluster = %cluster, node = %node, "Node removed");
        Ok(report)
    }
}

impl Provider for LocalDockerProvider {
    fn backend(&self) -> Backend {
        Backend::LocalDocker
    }

    fn create_cluster(&self, name: &str) -> Result<()> {
        validate_name(name)?;
        let span = info_span!("create_cluster", cluster = %name, op = %uuid::Uuid::new_v4());
        let _enter = span.enter();

        self.tracked(&format!("Cluster {} created", name), CREATE_STEPS, || {
            self.bootstrap_master(name)
        })
    }

    fn list_clusters(&self) -> Result<BTreeSet<String>> {
        let filter = ContainerFilter::all()
            .ancestor(self.config.image.as_str())
            .label(ROLE_LABEL, Role::Server.as_str());
        Ok(self.runtime.list(&filter)?.into_iter().collect())
    }

    fn add_node(&self, cluster: &str, node: &str) -> Result<()> {
        validate_name(cluster)?;
        validate_name(node)?;
        if node == cluster {
            return Err(Error::InvalidName {
                name: node.to_string(),
                reason: "a worker cannot share its cluster's name".into(),
            });
        }
        let span = info_span!("add_node", cluster = %cluster, node = %node, op = %uuid::Uuid::new_v4());
        let _enter = span.enter();

        self.tracked(&format!("Node {} added to {}", node, cluster), ADD_NODE_STEPS, || {
            self.join_worker(cluster, node)
        })
    }

    fn remove_node(&self, cluster: &str, node: &str) -> Result<TeardownReport> {
        validate_name(cluster)?;
        validate_name(node)?;
        if node == cluster {
            return Err(Error::InvalidName {
                name: node.to_string(),
                reason: "this is the master node; delete the cluster instead".into(),
            });
        }
        let span = info_span!("remove_node", cluster = %cluster, node = %node, op = %uuid::Uuid::new_v4());
        let _enter = span.enter();

        self.tracked(&format!("Node {} removed from {}", node, cluster), REMOVE_NODE_STEPS, || {
            self.teardown_node(cluster, node)
        })
    }

    fn delete_cluster(&self, name: &str) -> Result<TeardownReport> {
        validate_name(name)?;
        let span = info_span!("delete_cluster", cluster = %name, op = %uuid::Uuid::new_v4());
        let _enter = span.enter();

        self.tracked(&format!("Cluster {} deleted", name), DELETE_STEPS, || {
            self.teardown_cluster(name)
        })
    }

    fn cluster_status(&self, name: &str) -> Result<String> {
        validate_name(name)?;
        self.status_of(name)
    }

    fn kubeconfig(&self, name: &str) -> Result<PathBuf> {
        validate_name(name)?;
        self.fetch_kubeconfig(name)
    }
}

/// Named volumes holding a cluster's k3s data and config
fn cluster_volumes(cluster: &str) -> Vec<String> {
    vec![format!("{}-k3s-data", cluster), format!("{}-k3s-config", cluster)]
}

fn labels(cluster: &str, role: Role) -> Vec<(String, String)> {
    vec![
        (CLUSTER_LABEL.to_string(), cluster.to_string()),
        (ROLE_LABEL.to_string(), role.as_str().to_string()),
    ]
}

/// Report a missing master container as a missing cluster
fn cluster_not_found(e: Error, cluster: &str) -> Error {
    if matches!(e, Error::NotFound { .. }) {
        Error::not_found("cluster", cluster)
    } else {
        e
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::CommandOutput;
    use crate::kubeconfig::SAMPLE_K3S_KUBECONFIG;
    use crate::kubectl::{Manifest, MockClusterCli};
    use crate::progress::RecordingProgress;
    use crate::retry::{ManualClock, RetryPolicy};
    use crate::runtime::MockContainerRuntime;
    use std::time::Duration;

    fn config(dir: &Path) -> ProviderConfig {
        ProviderConfig::builder()
            .kubeconfig_dir(dir)
            .readiness(RetryPolicy::fixed(3, Duration::from_secs(10)))
            .addon_readiness(RetryPolicy::fixed(3, Duration::from_secs(5)))
            .join(RetryPolicy::fixed(3, Duration::from_secs(2)))
            .build()
    }

    fn provider(
        dir: &Path,
        runtime: MockContainerRuntime,
        cli: MockClusterCli,
    ) -> (LocalDockerProvider, Arc<ManualClock>, Arc<RecordingProgress>) {
        let clock = Arc::new(ManualClock::new());
        let progress = Arc::new(RecordingProgress::new());
        let p = LocalDockerProvider::new(config(dir))
            .unwrap()
            .with_runtime(runtime)
            .with_cluster_cli(cli)
            .with_clock(clock.clone())
            .with_progress(progress.clone());
        (p, clock, progress)
    }

    fn is_cat(argv: &[String], path: &str) -> bool {
        argv.len() == 2 && argv[0] == "cat" && argv[1] == path
    }

    #[test]
    fn test_master_spec() {
        let dir = tempfile::tempdir().unwrap();
        let p = LocalDockerProvider::new(config(dir.path())).unwrap();
        let spec = p.master_spec("demo");

        assert_eq!(spec.name, "demo");
        assert!(spec.privileged);
        assert_eq!(spec.args[0], "server");
        assert!(spec.args.contains(&"--flannel-backend=none".to_string()));
        assert!(spec.args.contains(&"--disable=traefik".to_string()));
        assert!(spec.args.contains(&"--disable=servicelb".to_string()));
        assert_eq!(spec.env_var("K3S_NODE_NAME"), Some("demo"));
        assert_eq!(spec.label(ROLE_LABEL), Some("server"));
        assert_eq!(spec.label(CLUSTER_LABEL), Some("demo"));
        assert!(spec.ports.contains(&(6443, 6443)));
        assert_eq!(spec.mounts[0].source, "demo-k3s-data");
        assert_eq!(spec.mounts[1].target, K3S_CONFIG_DIR);
    }

    #[test]
    fn test_state_dir_mounts() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = config(dir.path());
        cfg.state_dir = Some(PathBuf::from("/srv/k3s"));
        let p = LocalDockerProvider::new(cfg).unwrap();
        let spec = p.master_spec("demo");
        assert_eq!(spec.mounts[0].source, "/srv/k3s/demo/data");
        assert_eq!(spec.mounts[0].target, K3S_DATA_DIR);
    }

    #[test]
    fn test_worker_spec() {
        let dir = tempfile::tempdir().unwrap();
        let p = LocalDockerProvider::new(config(dir.path())).unwrap();
        let spec = p.worker_spec("demo", "w1", "172.17.0.2", "secret");
        assert_eq!(spec.args, vec!["agent"]);
        assert_eq!(spec.env_var("K3S_URL"), Some("https://172.17.0.2:6443"));
        assert_eq!(spec.env_var("K3S_TOKEN"), Some("secret"));
        assert_eq!(spec.label(ROLE_LABEL), Some("agent"));
        assert!(spec.ports.is_empty());
    }

    #[test]
    fn test_provision_failure_aborts_bootstrap() {
        let dir = tempfile::tempdir().unwrap();
        let mut runtime = MockContainerRuntime::new();
        runtime.expect_run().times(1).returning(|_| {
            Err(Error::Command {
                command: "docker run".into(),
                code: Some(125),
                stdout: String::new(),
                stderr: "Conflict. The container name \"/demo\" is already in use".into(),
            })
        });
        runtime.expect_exec().never();
        let (p, _, progress) = provider(dir.path(), runtime, MockClusterCli::new());

        let err = p.create_cluster("demo").unwrap_err();
        assert!(matches!(err, Error::Provision { ref unit, .. } if unit == "demo"));
        assert!(err.to_string().contains("already in use"));
        assert_eq!(progress.steps(), vec!["Creating master node container"]);
    }

    #[test]
    fn test_readiness_timeout_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let mut runtime = MockContainerRuntime::new();
        runtime.expect_run().returning(|_| Ok("abc123".into()));
        runtime
            .expect_exec()
            .times(3)
            .returning(|_, _| Ok(CommandOutput::failed(1, "connection refused")));
        let mut cli = MockClusterCli::new();
        cli.expect_apply().never();
        let (p, clock, _) = provider(dir.path(), runtime, cli);

        let err = p.create_cluster("demo").unwrap_err();
        match err {
            Error::Step { step, source } => {
                assert_eq!(step, "Waiting for cluster to be ready");
                assert!(matches!(*source, Error::ReadinessTimeout { attempts: 3, .. }));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(clock.elapsed(), Duration::from_secs(20));
    }

    #[test]
    fn test_addon_apply_failure_stops_sequence() {
        let dir = tempfile::tempdir().unwrap();
        let mut runtime = MockContainerRuntime::new();
        runtime.expect_run().returning(|_| Ok("abc123".into()));
        runtime.expect_exec().returning(|_, argv| {
            if is_cat(argv, K3S_KUBECONFIG_PATH) {
                Ok(CommandOutput::ok(SAMPLE_K3S_KUBECONFIG))
            } else {
                Ok(CommandOutput::ok("NAME STATUS"))
            }
        });
        let mut cli = MockClusterCli::new();
        cli.expect_apply()
            .withf(|_, m| matches!(m, Manifest::Inline(_)))
            .times(1)
            .returning(|_, _| Err(Error::Config("apply rejected".into())));
        cli.expect_pod_phases().never();
        let (p, _, _) = provider(dir.path(), runtime, cli);

        let err = p.create_cluster("demo").unwrap_err();
        assert!(matches!(err, Error::AddOnInstall { ref addon, .. } if addon == "calico"));
        // Credentials were persisted before the failure
        assert!(p.kubeconfig_path("demo").exists());
    }

    #[test]
    fn test_cancel_before_start() {
        let dir = tempfile::tempdir().unwrap();
        let mut runtime = MockContainerRuntime::new();
        runtime.expect_run().never();
        let cancel = CancelToken::new();
        cancel.cancel();
        let (p, _, _) = provider(dir.path(), runtime, MockClusterCli::new());
        let p = p.with_cancel(cancel);

        assert!(p.create_cluster("demo").unwrap_err().is_cancelled());
    }

    #[test]
    fn test_add_node_requires_running_master() {
        let dir = tempfile::tempdir().unwrap();
        let mut runtime = MockContainerRuntime::new();
        runtime
            .expect_inspect()
            .withf(|name, field| name == "demo" && *field == InspectField::Status)
            .returning(|_, _| Ok("exited".into()));
        runtime.expect_run().never();
        let (p, _, _) = provider(dir.path(), runtime, MockClusterCli::new());

        let err = p.add_node("demo", "w1").unwrap_err();
        assert!(matches!(err, Error::NotRunning { ref state, .. } if state == "exited"));
    }

    #[test]
    fn test_add_node_missing_cluster() {
        let dir = tempfile::tempdir().unwrap();
        let mut runtime = MockContainerRuntime::new();
        runtime
            .expect_inspect()
            .returning(|name, _| Err(Error::not_found("container", name)));
        let (p, _, _) = provider(dir.path(), runtime, MockClusterCli::new());

        let err = p.add_node("ghost", "w1").unwrap_err();
        assert!(err.is_not_found());
        assert!(err.to_string().contains("cluster not found: ghost"));
    }

    #[test]
    fn test_join_confirms_registration() {
        let dir = tempfile::tempdir().unwrap();
        let mut runtime = MockContainerRuntime::new();
        runtime.expect_inspect().returning(|_, field| match field {
            InspectField::Status => Ok("running".into()),
            InspectField::IpAddress => Ok("172.17.0.2".into()),
            InspectField::Label(_) => Ok(String::new()),
        });
        runtime.expect_exec().returning(|_, argv| {
            if is_cat(argv, K3S_TOKEN_PATH) {
                Ok(CommandOutput::ok("K10abc::server:secret\n"))
            } else {
                Ok(CommandOutput::ok(SAMPLE_K3S_KUBECONFIG))
            }
        });
        runtime
            .expect_run()
            .withf(|spec| spec.name == "w1" && spec.env_var("K3S_TOKEN") == Some("K10abc::server:secret"))
            .times(1)
            .returning(|_| Ok("def456".into()));

        let mut cli = MockClusterCli::new();
        let mut calls = 0;
        cli.expect_nodes().times(2).returning(move |_| {
            calls += 1;
            if calls == 1 {
                Ok(vec!["demo".into()])
            } else {
                Ok(vec!["demo".into(), "w1".into()])
            }
        });
        let (p, clock, _) = provider(dir.path(), runtime, cli);

        p.add_node("demo", "w1").unwrap();
        assert_eq!(clock.elapsed(), Duration::from_secs(2));
    }

    #[test]
    fn test_remove_node_rejects_master() {
        let dir = tempfile::tempdir().unwrap();
        let (p, _, _) = provider(dir.path(), MockContainerRuntime::new(), MockClusterCli::new());
        assert!(matches!(
            p.remove_node("demo", "demo").unwrap_err(),
            Error::InvalidName { .. }
        ));
    }

    #[test]
    fn test_remove_node_reports_container_failure() {
        let dir = tempfile::tempdir().unwrap();
        let mut runtime = MockContainerRuntime::new();
        runtime.expect_inspect().returning(|_, _| Ok("demo".into()));
        runtime
            .expect_exec()
            .returning(|_, _| Ok(CommandOutput::ok(SAMPLE_K3S_KUBECONFIG)));
        runtime.expect_remove().returning(|_, _| {
            Err(Error::Command {
                command: "docker rm -f w1".into(),
                code: Some(1),
                stdout: String::new(),
                stderr: "device or resource busy".into(),
            })
        });
        let mut cli = MockClusterCli::new();
        cli.expect_nodes().returning(|_| Ok(vec!["demo".into(), "w1".into()]));
        cli.expect_drain()
            .returning(|_, _, _| Err(Error::Config("eviction blocked".into())));
        cli.expect_delete_node().times(1).returning(|_, _| Ok(()));
        let (p, _, progress) = provider(dir.path(), runtime, cli);

        let err = p.remove_node("demo", "w1").unwrap_err();
        let report = err.teardown_report().unwrap();
        assert_eq!(report.warnings().count(), 2);
        assert!(err.to_string().contains("device or resource busy"));
        assert_eq!(progress.warnings().len(), 1);
    }

    #[test]
    fn test_remove_node_of_other_cluster() {
        let dir = tempfile::tempdir().unwrap();
        let mut runtime = MockContainerRuntime::new();
        runtime.expect_inspect().returning(|_, _| Ok("other".into()));
        runtime.expect_remove().never();
        let (p, _, _) = provider(dir.path(), runtime, MockClusterCli::new());

        assert!(p.remove_node("demo", "w1").is_err());
    }

    #[test]
    fn test_delete_fails_when_master_cannot_be_removed() {
        let dir = tempfile::tempdir().unwrap();
        let mut runtime = MockContainerRuntime::new();
        runtime
            .expect_exec()
            .returning(|_, _| Ok(CommandOutput::failed(1, "container is restarting")));
        runtime.expect_list().returning(|_| Ok(vec![]));
        runtime
            .expect_inspect()
            .returning(|_, _| Ok(Role::Server.as_str().to_string()));
        runtime.expect_remove().returning(|_, _| {
            Err(Error::Config("daemon unavailable".into()))
        });
        runtime.expect_list_volumes().never();
        let (p, _, _) = provider(dir.path(), runtime, MockClusterCli::new());

        let err = p.delete_cluster("demo").unwrap_err();
        let report = err.teardown_report().unwrap();
        assert!(report
            .steps
            .iter()
            .any(|s| s.step == "Delete CRDs" && matches!(s.outcome, Outcome::Skipped(_))));
        assert!(report.steps.last().unwrap().step == "Remove master container");
    }

    #[test]
    fn test_delete_only_removes_owned_volumes() {
        let dir = tempfile::tempdir().unwrap();
        let mut runtime = MockContainerRuntime::new();
        runtime
            .expect_exec()
            .returning(|name, _| Err(Error::not_found("container", name)));
        runtime.expect_list().returning(|_| Ok(vec![]));
        runtime
            .expect_inspect()
            .returning(|name, _| Err(Error::not_found("container", name)));
        runtime
            .expect_remove()
            .returning(|name, _| Err(Error::not_found("container", name)));
        runtime.expect_list_volumes().returning(|_| {
            Ok(vec![
                "demo-k3s-data".into(),
                "demo-k3s-config".into(),
                "demo-x-k3s-data".into(),
                "demo".into(),
            ])
        });
        runtime
            .expect_remove_volume()
            .withf(|v| v.starts_with("demo-k3s-"))
            .times(2)
            .returning(|_| Ok(()));
        runtime
            .expect_list_networks()
            .returning(|_| Ok(vec!["demo-x".into()]));
        runtime.expect_remove_network().never();
        let (p, _, _) = provider(dir.path(), runtime, MockClusterCli::new());

        let report = p.delete_cluster("demo").unwrap();
        assert!(report.is_clean());
    }

    #[test]
    fn test_delete_refuses_foreign_container() {
        let dir = tempfile::tempdir().unwrap();
        let mut runtime = MockContainerRuntime::new();
        runtime
            .expect_inspect()
            .withf(|name, field| {
                name == "postgres" && *field == InspectField::Label(ROLE_LABEL.to_string())
            })
            .returning(|_, _| Ok(String::new()));
        runtime.expect_remove().never();
        runtime.expect_remove_volume().never();
        let (p, _, _) = provider(dir.path(), runtime, MockClusterCli::new());

        let err = p.delete_cluster("postgres").unwrap_err();
        assert!(matches!(err, Error::Config(_)));
        assert!(err.to_string().contains("not a k3sctl cluster"));
    }

    #[test]
    fn test_delete_refuses_worker_name() {
        let dir = tempfile::tempdir().unwrap();
        let mut runtime = MockContainerRuntime::new();
        runtime
            .expect_inspect()
            .returning(|_, _| Ok(Role::Agent.as_str().to_string()));
        runtime.expect_remove().never();
        let mut cli = MockClusterCli::new();
        cli.expect_drain().never();
        cli.expect_delete_node().never();
        let (p, _, _) = provider(dir.path(), runtime, cli);

        let err = p.delete_cluster("demo-w1").unwrap_err();
        assert!(err.to_string().contains("node remove"));
    }
}
