//! Built-in cluster add-ons installed during bootstrap

use crate::config::ProviderConfig;
use crate::kubectl::Manifest;

/// Calico manifest shipped with the binary
pub const CALICO_MANIFEST: &str = include_str!("manifests/calico.yaml");

/// An add-on applied unconditionally by the bootstrap sequence
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuiltinAddOn {
    pub name: &'static str,
    pub manifest: Manifest,
    /// Namespace whose pods must reach `Running` before continuing
    pub wait_namespace: Option<&'static str>,
    /// Applied once the pods are running
    pub post_install: Option<Manifest>,
}

/// MetalLB address pool and L2 announcement for `range`
pub fn lb_pool_manifest(range: &str) -> String {
    format!(
        r#"apiVersion: metallb.io/v1beta1
kind: IPAddressPool
metadata:
  name: default
  namespace: metallb-system
spec:
  addresses:
  - {}
---
apiVersion: metallb.io/v1beta1
kind: L2Advertisement
metadata:
  name: default
  namespace: metallb-system
spec:
  ipAddressPools:
  - default
"#,
        range
    )
}

/// Network, load balancer and ingress, in installation order
pub fn builtin_addons(config: &ProviderConfig) -> Vec<BuiltinAddOn> {
    vec![
        BuiltinAddOn {
            name: "calico",
            manifest: config
                .cni_manifest
                .clone()
                .unwrap_or_else(|| Manifest::inline(CALICO_MANIFEST)),
            wait_namespace: Some("calico-system"),
            post_install: None,
        },
        BuiltinAddOn {
            name: "metallb",
            manifest: config.lb_manifest.clone(),
            wait_namespace: Some("metallb-system"),
            post_install: Some(Manifest::inline(lb_pool_manifest(&config.lb_address_range))),
        },
        BuiltinAddOn {
            name: "ingress-nginx",
            manifest: config.ingress_manifest.clone(),
            wait_namespace: None,
            post_install: None,
        },
    ]
}

/// True once the phase listing shows a running pod
pub fn pods_running(phases: &[String]) -> bool {
    phases.iter().any(|p| p == "Running")
}
