//! Process supervision: pidfiles, cancellation and subprocess teardown
//!
//! A run is cancelled cooperatively: the protocol loops ask a
//! [`CancellationContext`] before every blocking read and bail out with
//! [`SyncError::Cancelled`] once the controlling process is gone.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead};
use tracing::{event, Level};

use crate::error::SyncError;

/// Grace period between the end of a session and the SIGHUP sent to a lingering
/// remote shell.
pub const TEARDOWN_GRACE: Duration = Duration::from_secs(2);

pub trait CancellationContext: Send + Sync {
    fn is_cancelled(&self) -> bool;

    fn check(&self) -> Result<(), SyncError> {
        if self.is_cancelled() {
            event!(Level::INFO, "controlling process is gone, stopping");
            return Err(SyncError::Cancelled);
        }
        Ok(())
    }
}

/// Probes a recorded controller pid with the null signal.
#[derive(Debug, Clone, Copy)]
pub struct ControllerLiveness {
    pid: nix::unistd::Pid,
}

impl ControllerLiveness {
    #[must_use]
    pub fn new(pid: i32) -> Self {
        Self {
            pid: nix::unistd::Pid::from_raw(pid),
        }
    }

    /// Watches the process that started us.
    #[must_use]
    pub fn parent() -> Self {
        Self {
            pid: nix::unistd::getppid(),
        }
    }
}

impl CancellationContext for ControllerLiveness {
    fn is_cancelled(&self) -> bool {
        match nix::sys::signal::kill(self.pid, None) {
            Ok(()) => false,
            // exists, but owned by someone else
            Err(nix::errno::Errno::EPERM) => false,
            Err(errno) => {
                event!(Level::DEBUG, "liveness probe of {} failed: {errno}", self.pid);
                true
            }
        }
    }
}

/// Manually triggered cancellation; never cancelled unless [`cancel`](Self::cancel) is called.
#[derive(Debug, Clone, Default)]
pub struct CancellationFlag(Arc<AtomicBool>);

impl CancellationFlag {
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }
}

impl CancellationContext for CancellationFlag {
    fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// `/tmp/dsync[.<host>].<dir with '/' replaced by '_'>.ppid`
#[must_use]
pub fn pidfile_path(dest_host: Option<&str>, dest_dir: &str) -> PathBuf {
    let dir = dest_dir.replace('/', "_");
    let name = match dest_host {
        Some(host) => format!("dsync.{host}.{dir}.ppid"),
        None => format!("dsync.{dir}.ppid"),
    };
    Path::new("/tmp").join(name)
}

/// Pid file removed when dropped.
#[derive(Debug)]
pub struct PidFile {
    path: PathBuf,
}

impl PidFile {
    pub fn create(path: PathBuf, pid: u32) -> std::io::Result<Self> {
        std::fs::write(&path, format!("{pid}\n"))?;
        event!(Level::DEBUG, "wrote pid {pid} to {path:?}");
        Ok(Self { path })
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for PidFile {
    fn drop(&mut self) {
        if let Err(error) = std::fs::remove_file(&self.path) {
            event!(Level::WARN, "failed to remove pid file {:?}: {error}", self.path);
        }
    }
}

/// Lines of diagnostic text collected from a subprocess.
#[derive(Debug, Clone, Default)]
pub struct DiagnosticBuffer {
    lines: Arc<Mutex<Vec<String>>>,
}

impl DiagnosticBuffer {
    pub fn append(&self, line: String) {
        match self.lines.lock() {
            Ok(mut lines) => lines.push(line),
            Err(poisoned) => poisoned.into_inner().push(line),
        }
    }

    pub fn drain(&self) -> Vec<String> {
        match self.lines.lock() {
            Ok(mut lines) => std::mem::take(&mut *lines),
            Err(poisoned) => std::mem::take(&mut *poisoned.into_inner()),
        }
    }
}

/// Copies every line of `reader` into `buffer` until end-of-stream.
pub fn spawn_line_reader<R>(reader: R, buffer: DiagnosticBuffer) -> tokio::task::JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = tokio::io::BufReader::new(reader).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => buffer.append(line),
                Ok(None) => break,
                Err(error) => {
                    event!(Level::DEBUG, "diagnostic reader stopped: {error}");
                    break;
                }
            }
        }
    })
}

/// Waits up to `grace` for a reader started by [`spawn_line_reader`], then
/// abandons it; a stream held open by a lingering grandchild never ends.
pub async fn finish_line_reader(mut reader: tokio::task::JoinHandle<()>, grace: Duration) {
    match tokio::time::timeout(grace, &mut reader).await {
        Ok(Ok(())) => {}
        Ok(Err(error)) => event!(Level::DEBUG, "diagnostic reader failed: {error}"),
        Err(_) => {
            event!(Level::DEBUG, "diagnostic stream still open after {grace:?}, abandoning it");
            reader.abort();
        }
    }
}

/// Waits for `child`; sends SIGHUP if it is still running after `grace`.
pub async fn terminate_after(
    child: &mut tokio::process::Child,
    grace: Duration,
) -> std::io::Result<std::process::ExitStatus> {
    if let Ok(status) = tokio::time::timeout(grace, child.wait()).await {
        return status;
    }
    if let Some(pid) = child.id() {
        event!(Level::INFO, "remote shell {pid} still running, sending SIGHUP");
        let pid = nix::unistd::Pid::from_raw(pid as i32);
        if let Err(errno) = nix::sys::signal::kill(pid, nix::sys::signal::Signal::SIGHUP) {
            event!(Level::DEBUG, "SIGHUP to {pid} failed: {errno}");
        }
    }
    child.wait().await
}
