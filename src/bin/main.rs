//! k3sctl CLI - k3s clusters in local docker containers

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use k3sctl::plugins::Plugin;
use k3sctl::progress::{ConsoleProgress, NoProgress, Progress};
use k3sctl::runtime::DockerCli;
use k3sctl::{
    CancelToken, ClusterManager, Error, LocalDockerProvider, PluginRegistry, ProviderConfig,
    Result,
};
use tabled::{Table, Tabled};

#[derive(Parser)]
#[command(name = "k3sctl")]
#[command(about = "Create and manage k3s clusters running in docker containers")]
#[command(version)]
struct Cli {
    /// Provider configuration file (YAML)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// No progress bar
    #[arg(short, long, global = true)]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Cluster lifecycle
    Cluster {
        #[command(subcommand)]
        action: ClusterAction,
    },
    /// Worker node membership
    Node {
        #[command(subcommand)]
        action: NodeAction,
    },
    /// Add-ons declared in plugins.yaml
    Plugin {
        #[command(subcommand)]
        action: PluginAction,
    },
}

#[derive(Subcommand)]
enum ClusterAction {
    /// Create a cluster with networking, load balancer and ingress
    Create {
        /// Cluster name
        name: String,
    },
    /// List clusters
    List,
    /// Delete a cluster and everything it created
    Delete {
        /// Cluster name
        name: String,
    },
    /// Write the cluster's kubeconfig and print how to use it
    Access {
        /// Cluster name
        name: String,
    },
    /// Show the state of the cluster's master container
    Status {
        /// Cluster name
        name: String,
    },
}

#[derive(Subcommand)]
enum NodeAction {
    /// Join a new worker node
    Add {
        /// Cluster name
        cluster: String,
        /// Node name
        node: String,
    },
    /// Drain and remove a worker node
    Remove {
        /// Cluster name
        cluster: String,
        /// Node name
        node: String,
    },
}

#[derive(Subcommand)]
enum PluginAction {
    /// List available plugins
    List,
    /// Install a plugin on a cluster
    Install {
        /// Cluster name
        cluster: String,
        /// Plugin name
        plugin: String,
    },
}

#[derive(Tabled)]
struct ClusterRow {
    #[tabled(rename = "Name")]
    name: String,
    #[tabled(rename = "Status")]
    status: String,
}

#[derive(Tabled)]
struct PluginRow {
    #[tabled(rename = "Name")]
    name: String,
    #[tabled(rename = "Type")]
    plugin_type: String,
    #[tabled(rename = "Adapters")]
    adapters: String,
    #[tabled(rename = "Description")]
    description: String,
}

impl From<&Plugin> for PluginRow {
    fn from(p: &Plugin) -> Self {
        Self {
            name: p.name.clone(),
            plugin_type: format!("{:?}", p.plugin_type).to_lowercase(),
            adapters: p
                .allowed_adapters
                .iter()
                .map(|a| a.to_string())
                .collect::<Vec<_>>()
                .join(", "),
            description: p.description.clone(),
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let default_directive = if cli.verbose { "k3sctl=debug" } else { "k3sctl=info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_directive)),
        )
        .with_writer(std::io::stderr)
        .init();

    let cancel = CancelToken::new();
    let on_interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Interrupted, stopping at the next step");
            on_interrupt.cancel();
        }
    });

    // Orchestration blocks on child processes and sleeps
    match tokio::task::spawn_blocking(move || run(cli, cancel)).await {
        Ok(Ok(())) => ExitCode::SUCCESS,
        Ok(Err(e)) => {
            eprintln!("Error: {}", e);
            ExitCode::FAILURE
        }
        Err(e) => {
            eprintln!("Error: {}", e);
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli, cancel: CancelToken) -> Result<()> {
    let config = match &cli.config {
        Some(path) => ProviderConfig::from_file(path)?,
        None => ProviderConfig::default(),
    };
    let progress: Arc<dyn Progress> = if cli.quiet || cli.verbose {
        Arc::new(NoProgress)
    } else {
        Arc::new(ConsoleProgress::new())
    };

    match cli.command {
        Commands::Plugin {
            action: PluginAction::List,
        } => list_plugins(),
        command => {
            if !DockerCli::new().is_available() {
                return Err(Error::Config(
                    "docker is not available; is the daemon running?".into(),
                ));
            }
            let provider = LocalDockerProvider::new(config)?
                .with_progress(progress)
                .with_cancel(cancel);
            let manager = ClusterManager::new(provider);
            match command {
                Commands::Cluster { action } => handle_cluster(&manager, action),
                Commands::Node { action } => handle_node(&manager, action),
                Commands::Plugin { action } => handle_plugin(&manager, action),
            }
        }
    }
}

fn handle_cluster(manager: &ClusterManager, action: ClusterAction) -> Result<()> {
    match action {
        ClusterAction::Create { name } => {
            manager
                .create_cluster(&name)
                .map_err(|e| failed(&format!("create cluster {}", name), e))?;
            let kubeconfig = manager.kubeconfig(&name)?;
            println!("Cluster {} created successfully", name);
            println!("  export KUBECONFIG={}", kubeconfig.display());
        }
        ClusterAction::List => {
            let rows: Vec<ClusterRow> = manager
                .list_clusters()?
                .into_iter()
                .map(|name| ClusterRow {
                    status: manager
                        .cluster_status(&name)
                        .unwrap_or_else(|_| "unknown".to_string()),
                    name,
                })
                .collect();
            if rows.is_empty() {
                println!("No clusters found.");
            } else {
                println!("{}", Table::new(rows));
            }
        }
        ClusterAction::Delete { name } => {
            let report = manager
                .delete_cluster(&name)
                .map_err(|e| failed(&format!("delete cluster {}", name), e))?;
            println!("Cluster {} deleted successfully", name);
            print_warnings(&report);
        }
        ClusterAction::Access { name } => {
            let path = manager.kubeconfig(&name)?;
            println!("Kubeconfig for {} written to {}", name, path.display());
            println!("  export KUBECONFIG={}", path.display());
        }
        ClusterAction::Status { name } => {
            println!("{}", manager.cluster_status(&name)?);
        }
    }
    Ok(())
}

fn handle_node(manager: &ClusterManager, action: NodeAction) -> Result<()> {
    match action {
        NodeAction::Add { cluster, node } => {
            manager
                .add_node(&cluster, &node)
                .map_err(|e| failed(&format!("add node {} to {}", node, cluster), e))?;
            println!("Node {} added to cluster {} successfully", node, cluster);
        }
        NodeAction::Remove { cluster, node } => {
            let report = manager
                .remove_node(&cluster, &node)
                .map_err(|e| failed(&format!("remove node {} from {}", node, cluster), e))?;
            println!("Node {} removed from cluster {} successfully", node, cluster);
            print_warnings(&report);
        }
    }
    Ok(())
}

fn handle_plugin(manager: &ClusterManager, action: PluginAction) -> Result<()> {
    match action {
        PluginAction::List => list_plugins(),
        PluginAction::Install { cluster, plugin } => {
            let registry = PluginRegistry::load()?;
            manager
                .install_plugin(&cluster, &registry, &plugin)
                .map_err(|e| failed(&format!("install {} on {}", plugin, cluster), e))?;
            println!("Plugin {} installed on cluster {} successfully", plugin, cluster);
            Ok(())
        }
    }
}

fn list_plugins() -> Result<()> {
    let registry = PluginRegistry::load()?;
    let rows: Vec<PluginRow> = registry.plugins().iter().map(PluginRow::from).collect();
    if rows.is_empty() {
        println!("No plugins declared.");
    } else {
        println!("{}", Table::new(rows));
    }
    Ok(())
}

fn print_warnings(report: &k3sctl::TeardownReport) {
    let warnings: Vec<_> = report.warnings().collect();
    if !warnings.is_empty() {
        println!("{} cleanup step(s) failed:", warnings.len());
        for w in warnings {
            println!("  {}", w);
        }
    }
}

/// Print the teardown report of a failed teardown before returning the error
fn failed(what: &str, e: Error) -> Error {
    if let Some(report) = e.teardown_report() {
        eprint!("{}", report);
    }
    Error::step(format!("failed to {}", what), e)
}
