//! `docker` CLI wrapper

use crate::command::{CommandOutput, Invocation};
use crate::runtime::{ContainerFilter, ContainerRuntime, InspectField, RunSpec};
use crate::{Error, Result};

/// Container runtime backed by the `docker` binary
#[derive(Debug, Clone)]
pub struct DockerCli {
    binary: String,
}

impl Default for DockerCli {
    fn default() -> Self {
        Self::new()
    }
}

impl DockerCli {
    pub fn new() -> Self {
        Self::with_binary("docker")
    }

    /// Use another docker-compatible binary (e.g. `podman`)
    pub fn with_binary(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    /// Check the daemon is reachable
    pub fn is_available(&self) -> bool {
        self.docker(
            "daemon",
            vec!["version".into(), "--format".into(), "{{.Server.Version}}".into()],
        )
        .is_ok()
    }

    /// Run a docker command acting on an object of `kind` named by the last argument
    fn docker(&self, kind: &'static str, args: Vec<String>) -> Result<CommandOutput> {
        let inv = Invocation::new(&self.binary).args(args);
        let output = inv.output()?;
        check(kind, &inv, output)
    }
}

/// Map a missing object to `Error::NotFound` of `kind`, other failures to `Error::Command`
fn check(kind: &'static str, inv: &Invocation<'_>, output: CommandOutput) -> Result<CommandOutput> {
    if output.success() {
        return Ok(output);
    }
    if is_missing_object(&output.stderr) {
        let name = inv.args.last().cloned().unwrap_or_default();
        return Err(Error::not_found(kind, name));
    }
    output.into_result(inv.display())
}

/// `docker run` arguments for a spec
pub(crate) fn run_args(spec: &RunSpec) -> Vec<String> {
    let mut args = vec!["run".to_string(), "-d".into(), "--name".into(), spec.name.clone()];
    if spec.privileged {
        args.push("--privileged".into());
    }
    for path in &spec.tmpfs {
        args.push("--tmpfs".into());
        args.push(path.clone());
    }
    for (k, v) in &spec.env {
        args.push("-e".into());
        args.push(format!("{}={}", k, v));
    }
    for (k, v) in &spec.labels {
        args.push("--label".into());
        args.push(format!("{}={}", k, v));
    }
    for (host, container) in &spec.ports {
        args.push("-p".into());
        args.push(format!("{}:{}", host, container));
    }
    for m in &spec.mounts {
        args.push("-v".into());
        args.push(format!("{}:{}", m.source, m.target));
    }
    args.push(spec.image.clone());
    args.extend(spec.args.iter().cloned());
    args
}

/// `docker ps` arguments for a filter
pub(crate) fn list_args(filter: &ContainerFilter) -> Vec<String> {
    let mut args = vec!["ps".to_string()];
    if filter.all {
        args.push("-a".into());
    }
    if let Some(image) = &filter.ancestor {
        args.push("--filter".into());
        args.push(format!("ancestor={}", image));
    }
    for (k, v) in &filter.labels {
        args.push("--filter".into());
        args.push(format!("label={}={}", k, v));
    }
    args.push("--format".into());
    args.push("{{.Names}}".into());
    args
}

pub(crate) fn inspect_format(field: &InspectField) -> String {
    match field {
        InspectField::Status => "{{.State.Status}}".to_string(),
        InspectField::IpAddress => {
            "{{range .NetworkSettings.Networks}}{{.IPAddress}}{{end}}".to_string()
        }
        InspectField::Label(key) => format!("{{{{index .Config.Labels \"{}\"}}}}", key),
    }
}

/// Split command output into non-empty trimmed lines
pub(crate) fn lines(output: &str) -> Vec<String> {
    output
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(String::from)
        .collect()
}

fn is_missing_object(stderr: &str) -> bool {
    stderr.contains("No such container")
        || stderr.contains("No such object")
        || stderr.contains("no such volume")
        || (stderr.contains("network") && stderr.contains("not found"))
}

impl ContainerRuntime for DockerCli {
    fn run(&self, spec: &RunSpec) -> Result<String> {
        let output = self.docker("container", run_args(spec))?;
        Ok(output.stdout.trim().to_string())
    }

    fn exec(&self, container: &str, argv: &[String]) -> Result<CommandOutput> {
        let mut args = vec!["exec".to_string(), container.to_string()];
        args.extend(argv.iter().cloned());
        let output = Invocation::new(&self.binary).args(args).output()?;
        if !output.success() && is_missing_object(&output.stderr) {
            return Err(Error::not_found("container", container));
        }
        Ok(output)
    }

    fn inspect(&self, container: &str, field: &InspectField) -> Result<String> {
        let output = self.docker("container", vec![
            "inspect".into(),
            "-f".into(),
            inspect_format(field),
            container.into(),
        ])?;
        let value = output.stdout.trim();
        // Missing labels render as "<no value>"
        Ok(if value == "<no value>" { String::new() } else { value.to_string() })
    }

    fn remove(&self, container: &str, force: bool) -> Result<()> {
        let mut args = vec!["rm".to_string()];
        if force {
            args.push("-f".into());
        }
        args.push(container.into());
        self.docker("container", args)?;
        Ok(())
    }

    fn list(&self, filter: &ContainerFilter) -> Result<Vec<String>> {
        let output = self.docker("container", list_args(filter))?;
        Ok(lines(&output.stdout))
    }

    fn list_volumes(&self, name_filter: &str) -> Result<Vec<String>> {
        let output = self.docker("volume", vec![
            "volume".into(),
            "ls".into(),
            "-q".into(),
            "--filter".into(),
            format!("name={}", name_filter),
        ])?;
        Ok(lines(&output.stdout))
    }

    fn remove_volume(&self, name: &str) -> Result<()> {
        self.docker("volume", vec!["volume".into(), "rm".into(), "-f".into(), name.into()])?;
        Ok(())
    }

    fn list_networks(&self, name_filter: &str) -> Result<Vec<String>> {
        let output = self.docker("network", vec![
            "network".into(),
            "ls".into(),
            "--format".into(),
            "{{.Name}}".into(),
            "--filter".into(),
            format!("name={}", name_filter),
        ])?;
        Ok(lines(&output.stdout))
    }

    fn remove_network(&self, name: &str) -> Result<()> {
        self.docker("network", vec!["network".into(), "rm".into(), name.into()])?;
        Ok(())
    }

    fn prune_volumes(&self) -> Result<()> {
        self.docker("volume", vec!["volume".into(), "prune".into(), "-f".into()])?;
        Ok(())
    }

    fn prune_networks(&self) -> Result<()> {
        self.docker("network", vec!["network".into(), "prune".into(), "-f".into()])?;
        Ok(())
    }
}
