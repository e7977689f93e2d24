//! Remote side plumbing of dsync
//!
//! - [`protocol`]: commands, responses and relay events
//! - [`streams`]: the decimal-length framing and the relay multiplex
//! - [`deploy`]: shipping the running executable to a remote host
//! - [`launcher`]: starting a remote agent over the remote shell

use std::process::Stdio;

use common::error::SyncError;

pub mod deploy;
pub mod launcher;
pub mod protocol;
pub mod streams;

pub use deploy::shell_escape;

/// Remote shell used to reach other hosts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteShell {
    pub program: String,
    /// Passed verbatim before the host name.
    pub extra_args: Vec<String>,
}

impl Default for RemoteShell {
    fn default() -> Self {
        Self {
            program: "ssh".to_string(),
            extra_args: Vec::new(),
        }
    }
}

impl RemoteShell {
    #[must_use]
    pub fn is_ssh(&self) -> bool {
        std::path::Path::new(&self.program)
            .file_name()
            .is_some_and(|name| name == "ssh")
    }

    /// Arguments for running `remote_command` on `host` (`[user@]host`).
    #[must_use]
    pub fn args(&self, host: &str, remote_command: &str) -> Vec<String> {
        let mut args = Vec::new();
        if self.is_ssh() {
            args.extend(
                ["-o", "BatchMode=yes", "-o", "StrictHostKeyChecking=no"]
                    .iter()
                    .map(|arg| arg.to_string()),
            );
        }
        args.extend(self.extra_args.iter().cloned());
        args.push(host.to_string());
        args.push(remote_command.to_string());
        args
    }

    /// Spawns the remote shell with piped stdin/stdout.
    ///
    /// Stderr is piped when `capture_stderr` is set and inherited otherwise.
    pub fn spawn(
        &self,
        host: &str,
        remote_command: &str,
        capture_stderr: bool,
    ) -> Result<RemoteProcess, SyncError> {
        let args = self.args(host, remote_command);
        tracing::debug!("running {} {:?}", self.program, args);
        let mut child = tokio::process::Command::new(&self.program)
            .args(&args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(if capture_stderr {
                Stdio::piped()
            } else {
                Stdio::inherit()
            })
            .spawn()
            .map_err(|error| {
                SyncError::transport(format!("failed to start {}: {error}", self.program))
            })?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| SyncError::transport("remote shell stdin is not available"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| SyncError::transport("remote shell stdout is not available"))?;
        let stderr = child.stderr.take();
        Ok(RemoteProcess {
            child,
            stdin,
            stdout,
            stderr,
        })
    }
}

/// A running remote shell whose stdio carries an agent session.
#[derive(Debug)]
pub struct RemoteProcess {
    pub child: tokio::process::Child,
    pub stdin: tokio::process::ChildStdin,
    pub stdout: tokio::process::ChildStdout,
    pub stderr: Option<tokio::process::ChildStderr>,
}
