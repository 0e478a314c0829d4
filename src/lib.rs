//! k3sctl
//!
//! Provision and tear down k3s clusters whose nodes run as containers on the local
//! docker daemon. A cluster is a privileged `k3s server` container named after the
//! cluster; workers are `k3s agent` containers joined with the master's token.
//!
//! # Key Features
//!
//! - **One-shot bootstrap** - master, Calico, MetalLB and ingress-nginx in one call
//! - **Best-effort teardown** - every cleanup step is attempted and reported
//! - **Per-cluster kubeconfigs** - stored at `<kubeconfig_dir>/<cluster>.yaml`
//! - **Pluggable backends** - orchestration only sees the [`Provider`] trait
//!
//! # Example
//!
//! ```no_run
//! use k3sctl::{ClusterManager, ProviderConfig};
//!
//! let config = ProviderConfig::builder()
//!     .api_host("localhost")
//!     .ports(6443, 8080, 8443)
//!     .build_validated()?;
//!
//! let manager = ClusterManager::local(config)?;
//! manager.create_cluster("demo")?;
//! manager.add_node("demo", "demo-w1")?;
//!
//! let kubeconfig = manager.kubeconfig("demo")?;
//! println!("export KUBECONFIG={}", kubeconfig.display());
//!
//! let report = manager.delete_cluster("demo")?;
//! for warning in report.warnings() {
//!     eprintln!("{}", warning);
//! }
//! # Ok::<(), k3sctl::Error>(())
//! ```

pub mod addons;
pub mod command;
pub mod config;
pub mod error;
pub mod kubeconfig;
pub mod kubectl;
pub mod manager;
pub mod plugins;
pub mod progress;
pub mod provider;
pub mod retry;
pub mod runtime;
pub mod teardown;

pub use config::ProviderConfig;
pub use error::{Error, Result};
pub use manager::ClusterManager;
pub use plugins::{PluginExecutor, PluginRegistry};
pub use provider::{Backend, LocalDockerProvider, Provider};
pub use retry::{CancelToken, RetryPolicy};
pub use teardown::{Outcome, TeardownReport};
