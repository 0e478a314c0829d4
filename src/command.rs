//! Spawning external collaborator processes

use std::io::{ErrorKind, Write};
use std::process::{Command, Stdio};

use crate::{Error, Result};

/// Captured result of a finished process
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    pub code: Option<i32>,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }

    /// Build a successful output carrying `stdout`
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            stdout: stdout.into(),
            stderr: String::new(),
            code: Some(0),
        }
    }

    /// Build a failed output with exit status `code`
    pub fn failed(code: i32, stderr: impl Into<String>) -> Self {
        Self {
            stdout: String::new(),
            stderr: stderr.into(),
            code: Some(code),
        }
    }

    /// Turn a non-zero exit into `Error::Command`
    pub fn into_result(self, command: impl Into<String>) -> Result<Self> {
        if self.success() {
            Ok(self)
        } else {
            Err(Error::Command {
                command: command.into(),
                code: self.code,
                stdout: self.stdout,
                stderr: self.stderr,
            })
        }
    }
}

/// A process invocation
#[derive(Debug, Clone)]
pub struct Invocation<'a> {
    pub program: &'a str,
    pub args: Vec<String>,
    pub stdin: Option<&'a str>,
    pub env: Vec<(String, String)>,
}

impl<'a> Invocation<'a> {
    pub fn new(program: &'a str) -> Self {
        Self {
            program,
            args: Vec::new(),
            stdin: None,
            env: Vec::new(),
        }
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn stdin(mut self, input: &'a str) -> Self {
        self.stdin = Some(input);
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    /// Command line used in logs and error messages
    pub fn display(&self) -> String {
        std::iter::once(self.program.to_string())
            .chain(self.args.iter().cloned())
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// Run to completion and capture output. A non-zero exit is not an error here.
    pub fn output(&self) -> Result<CommandOutput> {
        tracing::debug!(command = %self.display(), "Running command");

        let mut cmd = Command::new(self.program);
        cmd.args(&self.args)
            .envs(self.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .stdin(if self.stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            });

        let mut child = cmd.spawn()?;
        let stdin = child.stdin.take();
        // Feed stdin while the output pipes drain; a child may exit without reading it
        let output = std::thread::scope(|scope| {
            if let (Some(input), Some(mut pipe)) = (self.stdin, stdin) {
                scope.spawn(move || {
                    if let Err(e) = pipe.write_all(input.as_bytes()) {
                        if e.kind() != ErrorKind::BrokenPipe {
                            tracing::warn!(error = %e, "Failed to write command input");
                        }
                    }
                });
            }
            child.wait_with_output()
        })?;

        Ok(CommandOutput {
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            code: output.status.code(),
        })
    }

    /// Run and fail with `Error::Command` on non-zero exit
    pub fn run(&self) -> Result<CommandOutput> {
        self.output()?.into_result(self.display())
    }
}
