//! Three-host relay
//!
//! When the source itself lives on a remote host, the invoker only supervises:
//! the [`ProxyRelay`] starts a source agent there in `--proxy` mode, which runs
//! its own session against the destination and reports back on stdout using the
//! `pKl:` multiplex. Plain lines are buffered, progress events are handed to the
//! callbacks and `quit(code)` becomes the relay's result.

use futures::StreamExt;
use tokio::io::AsyncRead;
use tokio_util::codec::FramedRead;
use tracing::{event, instrument, Level};

use common::error::{SyncError, EXIT_UNEXPECTED_EOF};
use common::options::Options;
use common::progress::ProgressUpdate;
use common::supervisor::{self, CancellationContext, DiagnosticBuffer, PidFile};
use remote::launcher::{Launcher, RemoteAgentLauncher};
use remote::protocol::RelayEvent;
use remote::streams::{decode_event, MuxCodec, MuxItem};
use remote::RemoteProcess;

use crate::path::RemotePath;

type ProgressCallback = Box<dyn FnMut(&str) + Send>;
type RawProgressCallback = Box<dyn FnMut(&ProgressUpdate) + Send>;

/// Arguments starting the relayed source agent.
#[must_use]
pub fn relayed_args(
    options: &Options,
    launcher: &Launcher,
    source: &RemotePath,
    dest: &RemotePath,
) -> Vec<String> {
    let mut args = vec!["--proxy".to_string()];
    args.extend(options.to_args());
    args.push(format!("--rsh={}", launcher.shell().program));
    if let Launcher::Installed(installed) = launcher {
        args.push(format!("--remote-binary={}", installed.binary));
    }
    if !options.progress_timestamp {
        args.push("--omit-progress-timestamp".to_string());
    }
    args.push(local_form(&source.path));
    args.push(dest.to_string());
    args
}

/// `path` spelled so that the relayed agent never reads it as `host:dir`.
fn local_form(path: &str) -> String {
    if path.starts_with('/') || path.starts_with("./") {
        path.to_string()
    } else {
        format!("./{path}")
    }
}

#[derive(Default)]
pub struct ProxyRelay {
    on_progress: Option<ProgressCallback>,
    on_raw_progress: Option<RawProgressCallback>,
    stdout: Vec<String>,
    progress: Vec<String>,
    raw_progress: Vec<ProgressUpdate>,
    stderr: DiagnosticBuffer,
}

impl std::fmt::Debug for ProxyRelay {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProxyRelay")
            .field("stdout", &self.stdout.len())
            .field("progress", &self.progress.len())
            .field("raw_progress", &self.raw_progress.len())
            .finish_non_exhaustive()
    }
}

impl ProxyRelay {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn on_progress(mut self, callback: impl FnMut(&str) + Send + 'static) -> Self {
        self.on_progress = Some(Box::new(callback));
        self
    }

    #[must_use]
    pub fn on_raw_progress(
        mut self,
        callback: impl FnMut(&ProgressUpdate) + Send + 'static,
    ) -> Self {
        self.on_raw_progress = Some(Box::new(callback));
        self
    }

    /// Plain output of the relayed agent, in arrival order.
    #[must_use]
    pub fn stdout_text(&self) -> String {
        self.stdout.join("\n")
    }

    /// Everything the relayed agent wrote on stderr so far, plus relay
    /// diagnostics. Taken lines are not returned again.
    #[must_use]
    pub fn take_stderr(&mut self) -> String {
        self.stderr.drain().join("\n")
    }

    /// Progress messages received while no callback was installed.
    #[must_use]
    pub fn progress(&self) -> &[String] {
        &self.progress
    }

    #[must_use]
    pub fn raw_progress(&self) -> &[ProgressUpdate] {
        &self.raw_progress
    }

    fn dispatch(&mut self, event: RelayEvent) -> Option<i32> {
        match event {
            RelayEvent::Progress(text) => match self.on_progress.as_mut() {
                Some(callback) => callback(&text),
                None => self.progress.push(text),
            },
            RelayEvent::RawProgress(update) => match self.on_raw_progress.as_mut() {
                Some(callback) => callback(&update),
                None => self.raw_progress.push(update),
            },
            RelayEvent::Quit(code) => return Some(code),
        }
        None
    }

    /// Consumes relay output until `quit`, returning its code.
    ///
    /// End-of-stream before `quit` yields the unexpected-EOF code with a fatal
    /// message in the stderr buffer.
    pub async fn process_stream<R, C>(&mut self, reader: R, cancel: &C) -> Result<i32, SyncError>
    where
        R: AsyncRead + Unpin,
        C: CancellationContext,
    {
        let mut frames = FramedRead::new(reader, MuxCodec::default());
        loop {
            cancel.check()?;
            match frames.next().await.transpose()? {
                Some(MuxItem::Line(line)) => self.stdout.push(line),
                Some(MuxItem::Event(payload)) => {
                    if let Some(code) = self.dispatch(decode_event(&payload)?) {
                        event!(Level::DEBUG, "relayed agent quit with code {code}");
                        return Ok(code);
                    }
                }
                None => {
                    self.stderr
                        .append("fatal: relayed agent ended without reporting a result".to_string());
                    return Ok(EXIT_UNEXPECTED_EOF);
                }
            }
        }
    }

    /// Runs the synchronization from `source` to `dest` through an agent on the
    /// source host.
    #[instrument(skip_all, fields(source = %source, dest = %dest))]
    pub async fn run<C: CancellationContext>(
        &mut self,
        launcher: &Launcher,
        source: &RemotePath,
        dest: &RemotePath,
        options: &Options,
        cancel: &C,
    ) -> Result<i32, SyncError> {
        let _pidfile = PidFile::create(
            supervisor::pidfile_path(Some(&dest.host), &dest.path),
            std::os::unix::process::parent_id(),
        )?;
        let args = relayed_args(options, launcher, source, dest);
        let RemoteProcess {
            mut child,
            stdin,
            stdout,
            stderr,
        } = launcher.launch(&source.login(), &args, true).await?;
        drop(stdin);
        let reader = stderr.map(|stderr| supervisor::spawn_line_reader(stderr, self.stderr.clone()));
        let result = self.process_stream(stdout, cancel).await;
        match supervisor::terminate_after(&mut child, supervisor::TEARDOWN_GRACE).await {
            Ok(status) => event!(Level::DEBUG, "relayed agent exited: {status}"),
            Err(error) => event!(Level::WARN, "failed to reap relayed agent: {error}"),
        }
        if let Some(reader) = reader {
            supervisor::finish_line_reader(reader, supervisor::TEARDOWN_GRACE).await;
        }
        result
    }
}
