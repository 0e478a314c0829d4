//! Error types for k3sctl

use thiserror::Error;

use crate::teardown::TeardownReport;

#[derive(Error, Debug)]
pub enum Error {
    #[error("failed to provision container {unit}: {source}")]
    Provision {
        unit: String,
        #[source]
        source: Box<Error>,
    },

    #[error("timed out waiting for {what} after {attempts} attempts{}", last_error_suffix(.last_error))]
    ReadinessTimeout {
        what: String,
        attempts: u32,
        last_error: Option<String>,
    },

    #[error("failed to install add-on {addon}: {source}")]
    AddOnInstall {
        addon: String,
        #[source]
        source: Box<Error>,
    },

    #[error("{step}: {source}")]
    Step {
        step: String,
        #[source]
        source: Box<Error>,
    },

    #[error("teardown of {target} failed: {source}")]
    Teardown {
        target: String,
        #[source]
        source: Box<Error>,
        report: TeardownReport,
    },

    #[error("{kind} not found: {name}")]
    NotFound { kind: &'static str, name: String },

    #[error("cluster {name} is not running (state: {state})")]
    NotRunning { name: String, state: String },

    #[error("`{command}` exited with {}\nstdout: {stdout}\nstderr: {stderr}", exit_code_str(.code))]
    Command {
        command: String,
        code: Option<i32>,
        stdout: String,
        stderr: String,
    },

    #[error("invalid name {name:?}: {reason}")]
    InvalidName { name: String, reason: String },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Plugin error: {0}")]
    Plugin(String),

    #[error("operation cancelled while {0}")]
    Cancelled(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

fn last_error_suffix(last: &Option<String>) -> String {
    match last {
        Some(e) => format!(" (last error: {})", e),
        None => String::new(),
    }
}

fn exit_code_str(code: &Option<i32>) -> String {
    match code {
        Some(c) => format!("status {}", c),
        None => "no status (terminated by signal)".to_string(),
    }
}

impl Error {
    pub fn not_found(kind: &'static str, name: impl Into<String>) -> Self {
        Error::NotFound {
            kind,
            name: name.into(),
        }
    }

    /// Wrap an error with the description of the step that produced it
    pub fn step(step: impl Into<String>, source: Error) -> Self {
        Error::Step {
            step: step.into(),
            source: Box::new(source),
        }
    }

    /// True if this error, or the error it wraps, means the target is absent
    pub fn is_not_found(&self) -> bool {
        match self {
            Error::NotFound { .. } => true,
            Error::Step { source, .. }
            | Error::Provision { source, .. }
            | Error::AddOnInstall { source, .. } => source.is_not_found(),
            _ => false,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        match self {
            Error::Cancelled(_) => true,
            Error::Step { source, .. } | Error::AddOnInstall { source, .. } => {
                source.is_cancelled()
            }
            _ => false,
        }
    }

    /// The report attached to a failed teardown
    pub fn teardown_report(&self) -> Option<&TeardownReport> {
        match self {
            Error::Teardown { report, .. } => Some(report),
            _ => None,
        }
    }
}
