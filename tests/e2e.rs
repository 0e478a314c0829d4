//! End-to-end tests against the local docker daemon
//! Run with: cargo test --test e2e -- --ignored --test-threads=1 (requires docker and kubectl)
//!
//! Each test creates real k3s containers and pulls add-on manifests from the
//! network; expect several minutes per test.

use std::time::Duration;

use k3sctl::runtime::{ContainerRuntime, DockerCli, InspectField};
use k3sctl::{ClusterManager, ProviderConfig};

fn manager(kube_dir: &std::path::Path) -> ClusterManager {
    let config = ProviderConfig::builder()
        .ports(16443, 18080, 18443)
        .kubeconfig_dir(kube_dir)
        .drain_timeout(Duration::from_secs(30))
        .build_validated()
        .unwrap();
    ClusterManager::local(config).unwrap()
}

/// Remove leftovers of an earlier failed run
fn cleanup(manager: &ClusterManager, name: &str) {
    if let Err(e) = manager.delete_cluster(name) {
        println!("cleanup of {} failed: {}", name, e);
    }
}

#[test]
#[ignore] // Run manually: cargo test --test e2e -- --ignored
fn test_docker_available() {
    assert!(DockerCli::new().is_available());
}

#[test]
#[ignore]
fn test_cluster_lifecycle() {
    let dir = tempfile::tempdir().unwrap();
    let m = manager(dir.path());
    let name = "k3sctl-e2e";
    cleanup(&m, name);

    m.create_cluster(name).unwrap();
    assert_eq!(m.cluster_status(name).unwrap(), "running");
    assert!(m.list_clusters().unwrap().contains(name));

    let path = m.kubeconfig(name).unwrap();
    let contents = std::fs::read_to_string(&path).unwrap();
    assert!(contents.contains("https://localhost:16443"));
    println!("Kubeconfig at {}", path.display());

    let report = m.delete_cluster(name).unwrap();
    println!("{}", report);
    assert!(!m.list_clusters().unwrap().contains(name));
    assert!(m.cluster_status(name).unwrap_err().is_not_found());
    assert!(!path.exists());
}

#[test]
#[ignore]
fn test_worker_join_and_removal() {
    let dir = tempfile::tempdir().unwrap();
    let m = manager(dir.path());
    let name = "k3sctl-e2e-nodes";
    let worker = "k3sctl-e2e-nodes-w1";
    cleanup(&m, name);

    m.create_cluster(name).unwrap();
    m.add_node(name, worker).unwrap();

    let docker = DockerCli::new();
    assert_eq!(docker.inspect(worker, &InspectField::Status).unwrap(), "running");

    let report = m.remove_node(name, worker).unwrap();
    println!("{}", report);
    assert!(docker.inspect(worker, &InspectField::Status).unwrap_err().is_not_found());

    // Already gone
    m.remove_node(name, worker).unwrap();

    m.delete_cluster(name).unwrap();
}

#[test]
#[ignore]
fn test_delete_unknown_cluster() {
    let dir = tempfile::tempdir().unwrap();
    let m = manager(dir.path());

    let report = m.delete_cluster("k3sctl-e2e-missing").unwrap();
    assert!(report.is_clean(), "{}", report);
}
