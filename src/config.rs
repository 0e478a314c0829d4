//! Provider configuration with builder pattern

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::kubectl::Manifest;
use crate::retry::RetryPolicy;
use crate::{Error, Result};

/// k3s image used for every container
pub const DEFAULT_IMAGE: &str = "rancher/k3s:v1.32.3-k3s1";

pub const DEFAULT_METALLB_MANIFEST: &str =
    "https://raw.githubusercontent.com/metallb/metallb/v0.13.12/config/manifests/metallb-native.yaml";

pub const DEFAULT_INGRESS_MANIFEST: &str =
    "https://raw.githubusercontent.com/kubernetes/ingress-nginx/controller-v1.9.4/deploy/static/provider/cloud/deploy.yaml";

/// Address range handed out by the load balancer
pub const DEFAULT_LB_RANGE: &str = "172.18.255.200-172.18.255.250";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderConfig {
    pub image: String,
    /// Host name written into kubeconfigs, reachable from the caller.
    /// The `localhost` default only works for callers on the docker host itself.
    pub api_host: String,
    /// Host port published for the API server
    pub api_port: u16,
    pub http_port: u16,
    pub https_port: u16,
    /// Directory holding one kubeconfig per cluster
    pub kubeconfig_dir: PathBuf,
    /// Bind-mount cluster state below `<state_dir>/<cluster>/` instead of named volumes
    pub state_dir: Option<PathBuf>,
    /// Wait for the API server inside a new master
    pub readiness: RetryPolicy,
    /// Wait for add-on pods to run
    pub addon_readiness: RetryPolicy,
    /// Wait for a new worker to register
    pub join: RetryPolicy,
    #[serde(with = "duration_secs", rename = "drain_timeout_secs")]
    pub drain_timeout: Duration,
    pub lb_address_range: String,
    /// `None` installs the bundled Calico manifest
    pub cni_manifest: Option<Manifest>,
    pub lb_manifest: Manifest,
    pub ingress_manifest: Manifest,
    /// Also prune every dangling volume and network on cluster deletion
    pub prune_dangling: bool,
}

/// `$HOME/.kube/k3sctl`, or `./.kube/k3sctl` without a home directory
pub fn default_kubeconfig_dir() -> PathBuf {
    home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".kube")
        .join("k3sctl")
}

pub(crate) fn home_dir() -> Option<PathBuf> {
    std::env::var_os("HOME")
        .filter(|h| !h.is_empty())
        .map(PathBuf::from)
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            image: DEFAULT_IMAGE.to_string(),
            api_host: "localhost".to_string(),
            api_port: 6443,
            http_port: 80,
            https_port: 443,
            kubeconfig_dir: default_kubeconfig_dir(),
            state_dir: None,
            readiness: RetryPolicy::fixed(30, Duration::from_secs(10)),
            addon_readiness: RetryPolicy::fixed(30, Duration::from_secs(10)),
            join: RetryPolicy::fixed(30, Duration::from_secs(2)),
            drain_timeout: Duration::from_secs(60),
            lb_address_range: DEFAULT_LB_RANGE.to_string(),
            cni_manifest: None,
            lb_manifest: Manifest::url(DEFAULT_METALLB_MANIFEST),
            ingress_manifest: Manifest::url(DEFAULT_INGRESS_MANIFEST),
            prune_dangling: false,
        }
    }
}

impl ProviderConfig {
    pub fn builder() -> ProviderConfigBuilder {
        ProviderConfigBuilder::default()
    }

    /// Load from a YAML file. Missing keys take their defaults.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("cannot read {}: {}", path.display(), e))
        })?;
        let config: Self = serde_yaml::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.image.is_empty() {
            return Err(Error::Config("image cannot be empty".into()));
        }
        if self.api_host.is_empty() {
            return Err(Error::Config("api_host cannot be empty".into()));
        }
        if self.api_port == 0 || self.http_port == 0 || self.https_port == 0 {
            return Err(Error::Config("ports must be non-zero".into()));
        }
        if self.api_port == self.http_port
            || self.api_port == self.https_port
            || self.http_port == self.https_port
        {
            return Err(Error::Config("api, http and https ports must differ".into()));
        }
        if !self.lb_address_range.contains('-') && !self.lb_address_range.contains('/') {
            return Err(Error::Config(format!(
                "lb_address_range {:?} must be a range (a-b) or a CIDR",
                self.lb_address_range
            )));
        }
        self.readiness.validate()?;
        self.addon_readiness.validate()?;
        self.join.validate()?;
        if self.api_is_loopback() {
            tracing::warn!(
                api_host = %self.api_host,
                "Kubeconfigs will point at a loopback address, usable from this host only"
            );
        }
        Ok(())
    }

    /// True if the published API endpoint resolves to this host only
    pub fn api_is_loopback(&self) -> bool {
        crate::kubeconfig::is_loopback(&format!("https://{}", self.endpoint()))
    }

    /// `host:port` at which the API server is published
    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.api_host, self.api_port)
    }
}

#[derive(Default)]
pub struct ProviderConfigBuilder {
    config: ProviderConfig,
}

impl ProviderConfigBuilder {
    pub fn image(mut self, image: impl Into<String>) -> Self {
        self.config.image = image.into();
        self
    }

    pub fn api_host(mut self, host: impl Into<String>) -> Self {
        self.config.api_host = host.into();
        self
    }

    pub fn ports(mut self, api: u16, http: u16, https: u16) -> Self {
        self.config.api_port = api;
        self.config.http_port = http;
        self.config.https_port = https;
        self
    }

    pub fn kubeconfig_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.kubeconfig_dir = dir.into();
        self
    }

    pub fn state_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.state_dir = Some(dir.into());
        self
    }

    pub fn readiness(mut self, policy: RetryPolicy) -> Self {
        self.config.readiness = policy;
        self
    }

    pub fn addon_readiness(mut self, policy: RetryPolicy) -> Self {
        self.config.addon_readiness = policy;
        self
    }

    pub fn join(mut self, policy: RetryPolicy) -> Self {
        self.config.join = policy;
        self
    }

    pub fn drain_timeout(mut self, timeout: Duration) -> Self {
        self.config.drain_timeout = timeout;
        self
    }

    pub fn lb_address_range(mut self, range: impl Into<String>) -> Self {
        self.config.lb_address_range = range.into();
        self
    }

    pub fn cni_manifest(mut self, manifest: Manifest) -> Self {
        self.config.cni_manifest = Some(manifest);
        self
    }

    pub fn prune_dangling(mut self, prune: bool) -> Self {
        self.config.prune_dangling = prune;
        self
    }

    pub fn build(self) -> ProviderConfig {
        self.config
    }

    pub fn build_validated(self) -> Result<ProviderConfig> {
        let config = self.build();
        config.validate()?;
        Ok(config)
    }
}

mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_secs(u64::deserialize(d)?))
    }
}
