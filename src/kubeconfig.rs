//! Credential bundle (kubeconfig) handling
//!
//! k3s writes a kubeconfig whose server points at the loopback address inside the
//! container and whose entries are all called `default`. Before the bundle is
//! usable from the host it is rewritten to the published endpoint and its entries
//! renamed after the cluster, then stored under a path keyed by the cluster name.

use std::io::Write;
use std::path::{Path, PathBuf};

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde_yaml::{Mapping, Value};

use crate::{Error, Result};

const LOOPBACK_HOSTS: &[&str] = &["127.0.0.1", "localhost", "0.0.0.0", "[::1]"];

/// Split `https://host:port/path` into (scheme, host, port, rest)
fn split_server(server: &str) -> Option<(&str, &str, Option<&str>, &str)> {
    let (scheme, rest) = server.split_once("://")?;
    let (authority, path) = match rest.find('/') {
        Some(i) => (&rest[..i], &rest[i..]),
        None => (rest, ""),
    };
    let (host, port) = if authority.starts_with('[') {
        let end = authority.find(']')?;
        let host = &authority[..=end];
        let port = authority[end + 1..].strip_prefix(':');
        (host, port)
    } else {
        match authority.rsplit_once(':') {
            Some((h, p)) => (h, Some(p)),
            None => (authority, None),
        }
    };
    Some((scheme, host, port, path))
}

/// Point a loopback server URL at `host:port`. Non-loopback URLs are kept.
pub fn rewrite_server(server: &str, host: &str, port: u16) -> String {
    match split_server(server) {
        Some((scheme, h, _, path)) if LOOPBACK_HOSTS.contains(&h) => {
            format!("{}://{}:{}{}", scheme, host, port, path)
        }
        _ => server.to_string(),
    }
}

/// True if the server URL targets a loopback address
pub fn is_loopback(server: &str) -> bool {
    split_server(server)
        .map(|(_, h, _, _)| LOOPBACK_HOSTS.contains(&h))
        .unwrap_or(false)
}

fn entries_mut<'a>(doc: &'a mut Value, key: &str) -> impl Iterator<Item = &'a mut Mapping> {
    doc.get_mut(key)
        .and_then(Value::as_sequence_mut)
        .into_iter()
        .flat_map(|seq| seq.iter_mut())
        .filter_map(Value::as_mapping_mut)
}

fn rename(map: &mut Mapping, key: &str, from: &str, to: &str) {
    if let Some(v) = map.get_mut(key) {
        if v.as_str() == Some(from) {
            *v = Value::String(to.to_string());
        }
    }
}

/// Rewrite a raw k3s kubeconfig for use from the host
pub fn rewrite(raw: &str, cluster: &str, host: &str, port: u16) -> Result<String> {
    let mut doc: Value = serde_yaml::from_str(raw)?;
    if !doc.is_mapping() {
        return Err(Error::Config("kubeconfig is not a YAML mapping".into()));
    }

    for entry in entries_mut(&mut doc, "clusters") {
        rename(entry, "name", "default", cluster);
        if let Some(inner) = entry.get_mut("cluster").and_then(Value::as_mapping_mut) {
            if let Some(server) = inner.get_mut("server") {
                if let Some(s) = server.as_str() {
                    *server = Value::String(rewrite_server(s, host, port));
                }
            }
        }
    }
    for entry in entries_mut(&mut doc, "users") {
        rename(entry, "name", "default", cluster);
    }
    for entry in entries_mut(&mut doc, "contexts") {
        rename(entry, "name", "default", cluster);
        if let Some(inner) = entry.get_mut("context").and_then(Value::as_mapping_mut) {
            rename(inner, "cluster", "default", cluster);
            rename(inner, "user", "default", cluster);
        }
    }
    if let Some(map) = doc.as_mapping_mut() {
        rename(map, "current-context", "default", cluster);
    }

    Ok(serde_yaml::to_string(&doc)?)
}

/// Server URLs of every cluster entry
pub fn servers(contents: &str) -> Result<Vec<String>> {
    let doc: Value = serde_yaml::from_str(contents)?;
    Ok(doc
        .get("clusters")
        .and_then(Value::as_sequence)
        .into_iter()
        .flatten()
        .filter_map(|c| c.get("cluster")?.get("server")?.as_str().map(String::from))
        .collect())
}

fn check_base64(field: &str, value: Option<&Value>) -> Result<()> {
    if let Some(v) = value.and_then(Value::as_str) {
        STANDARD
            .decode(v.trim())
            .map_err(|e| Error::Config(format!("kubeconfig {} is not valid base64: {}", field, e)))?;
    }
    Ok(())
}

/// Check the bundle has an endpoint and well-formed embedded auth material
pub fn validate(contents: &str) -> Result<()> {
    let doc: Value = serde_yaml::from_str(contents)?;

    let servers = servers(contents)?;
    if servers.is_empty() {
        return Err(Error::Config("kubeconfig has no cluster server".into()));
    }

    for cluster in doc.get("clusters").and_then(Value::as_sequence).into_iter().flatten() {
        check_base64(
            "certificate-authority-data",
            cluster.get("cluster").and_then(|c| c.get("certificate-authority-data")),
        )?;
    }

    let users: Vec<&Value> = doc
        .get("users")
        .and_then(Value::as_sequence)
        .into_iter()
        .flatten()
        .filter_map(|u| u.get("user"))
        .collect();
    if users.is_empty() {
        return Err(Error::Config("kubeconfig has no user credentials".into()));
    }
    for user in users {
        let has_cert = user.get("client-certificate-data").is_some();
        let has_token = user.get("token").is_some();
        if !has_cert && !has_token {
            return Err(Error::Config(
                "kubeconfig user has neither a client certificate nor a token".into(),
            ));
        }
        check_base64("client-certificate-data", user.get("client-certificate-data"))?;
        check_base64("client-key-data", user.get("client-key-data"))?;
    }
    Ok(())
}

/// Kubeconfig files stored one per cluster
#[derive(Debug, Clone)]
pub struct KubeconfigStore {
    dir: PathBuf,
}

impl KubeconfigStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, cluster: &str) -> PathBuf {
        self.dir.join(format!("{}.yaml", cluster))
    }

    /// Atomically replace the cluster's kubeconfig, readable by the owner only
    pub fn write(&self, cluster: &str, contents: &str) -> Result<PathBuf> {
        std::fs::create_dir_all(&self.dir)?;
        let path = self.path_for(cluster);

        let mut tmp = tempfile::NamedTempFile::new_in(&self.dir)?;
        tmp.write_all(contents.as_bytes())?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            tmp.as_file()
                .set_permissions(std::fs::Permissions::from_mode(0o600))?;
        }
        tmp.persist(&path).map_err(|e| Error::Io(e.error))?;

        tracing::debug!(cluster = %cluster, path = %path.display(), "Kubeconfig written");
        Ok(path)
    }

    pub fn read(&self, cluster: &str) -> Result<String> {
        let path = self.path_for(cluster);
        match std::fs::read_to_string(&path) {
            Ok(s) => Ok(s),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(Error::not_found("kubeconfig", path.display().to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Delete the cluster's kubeconfig. Returns false if there was none.
    pub fn remove(&self, cluster: &str) -> Result<bool> {
        match std::fs::remove_file(self.path_for(cluster)) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
pub(crate) const SAMPLE_K3S_KUBECONFIG: &str = r#"apiVersion: v1
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
