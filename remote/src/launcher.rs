//! Starting the agent on the far end of the remote shell

use std::future::Future;
use std::path::PathBuf;
use tokio::io::AsyncWriteExt;

use common::error::SyncError;
use common::version::ProtocolVersion;

use crate::{deploy, RemoteProcess, RemoteShell};

pub trait RemoteAgentLauncher {
    /// Starts an agent on `host` with `args`; its stdin/stdout carry the session.
    fn launch(
        &self,
        host: &str,
        args: &[String],
        capture_stderr: bool,
    ) -> impl Future<Output = Result<RemoteProcess, SyncError>> + Send;
}

/// Ships the local executable with every launch.
#[derive(Debug, Clone)]
pub struct ShippingLauncher {
    pub shell: RemoteShell,
    pub payload: PathBuf,
}

impl ShippingLauncher {
    pub fn new(shell: RemoteShell) -> Result<Self, SyncError> {
        Ok(Self {
            shell,
            payload: deploy::local_payload()?,
        })
    }
}

impl RemoteAgentLauncher for ShippingLauncher {
    async fn launch(
        &self,
        host: &str,
        args: &[String],
        capture_stderr: bool,
    ) -> Result<RemoteProcess, SyncError> {
        let payload = deploy::read_payload(&self.payload).await?;
        let command = deploy::bootstrap_command(args);
        let mut process = self.shell.spawn(host, &command, capture_stderr)?;
        let write_failed = |error: std::io::Error| {
            SyncError::transport(format!("failed to ship agent to {host}: {error}"))
        };
        process
            .stdin
            .write_all(&deploy::payload_header(payload.len()))
            .await
            .map_err(write_failed)?;
        process.stdin.write_all(&payload).await.map_err(write_failed)?;
        process.stdin.flush().await.map_err(write_failed)?;
        tracing::debug!("agent shipped to {host}");
        Ok(process)
    }
}

/// Runs an agent binary already present on the remote host.
#[derive(Debug, Clone)]
pub struct InstalledLauncher {
    pub shell: RemoteShell,
    pub binary: String,
}

impl InstalledLauncher {
    async fn check_version(&self, host: &str) -> Result<(), SyncError> {
        let command = deploy::command_line(
            &deploy::shell_escape(&self.binary),
            &["--protocol-version".to_string()],
        );
        let output = tokio::process::Command::new(&self.shell.program)
            .args(self.shell.args(host, &command))
            .stdin(std::process::Stdio::null())
            .output()
            .await
            .map_err(|error| {
                SyncError::transport(format!("failed to start {}: {error}", self.shell.program))
            })?;
        if !output.status.success() {
            return Err(SyncError::transport(format!(
                "{} --protocol-version failed on {host}: {}",
                self.binary,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        let remote = ProtocolVersion::from_json(&String::from_utf8_lossy(&output.stdout))
            .map_err(|error| SyncError::framing(format!("{host}: {error:#}")))?;
        let local = ProtocolVersion::current();
        if !local.is_compatible_with(&remote) {
            return Err(SyncError::framing(format!(
                "agent on {host} speaks {remote}, this is {local}"
            )));
        }
        tracing::info!("using installed agent {} on {host} ({remote})", self.binary);
        Ok(())
    }
}

impl RemoteAgentLauncher for InstalledLauncher {
    async fn launch(
        &self,
        host: &str,
        args: &[String],
        capture_stderr: bool,
    ) -> Result<RemoteProcess, SyncError> {
        self.check_version(host).await?;
        let command = deploy::command_line(&deploy::shell_escape(&self.binary), args);
        self.shell.spawn(host, &command, capture_stderr)
    }
}

#[derive(Debug, Clone)]
pub enum Launcher {
    Shipping(ShippingLauncher),
    Installed(InstalledLauncher),
}

impl Launcher {
    /// Ships the running executable unless `remote_binary` names an installed one.
    pub fn new(shell: RemoteShell, remote_binary: Option<String>) -> Result<Self, SyncError> {
        Ok(match remote_binary {
            Some(binary) => Launcher::Installed(InstalledLauncher { shell, binary }),
            None => Launcher::Shipping(ShippingLauncher::new(shell)?),
        })
    }

    #[must_use]
    pub fn shell(&self) -> &RemoteShell {
        match self {
            Launcher::Shipping(launcher) => &launcher.shell,
            Launcher::Installed(launcher) => &launcher.shell,
        }
    }
}

impl RemoteAgentLauncher for Launcher {
    async fn launch(
        &self,
        host: &str,
        args: &[String],
        capture_stderr: bool,
    ) -> Result<RemoteProcess, SyncError> {
        match self {
            Launcher::Shipping(launcher) => launcher.launch(host, args, capture_stderr).await,
            Launcher::Installed(launcher) => launcher.launch(host, args, capture_stderr).await,
        }
    }
}
