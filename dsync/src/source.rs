//! Source-side agent
//!
//! The [`LocalAgent`] answers the destination agent's queries about the source
//! tree and streams file contents over the data channel. It never decides what to
//! copy; that is the destination's job.

use sha2::Digest;
use std::io::Write;
use std::path::{Component, Path, PathBuf};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncSeekExt, AsyncWrite, AsyncWriteExt};
use tracing::{event, instrument, Level};

use common::error::SyncError;
use common::options::Options;
use common::progress::ProgressUpdate;
use common::supervisor::{self, CancellationContext, PidFile};
use common::version::ProtocolVersion;
use remote::launcher::RemoteAgentLauncher;
use remote::protocol::{Command, RelayEvent, Response};
use remote::streams::{CommandChannel, RelayWriter};
use remote::RemoteProcess;

use crate::path::RemotePath;

/// Resolves a `./`-rooted name received from the peer under `root`.
///
/// Only plain components are accepted, so a peer cannot reach outside the tree.
pub fn resolve(root: &Path, relative: &str) -> Result<PathBuf, SyncError> {
    let path = Path::new(relative);
    let mut resolved = root.to_path_buf();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::Normal(name) => resolved.push(name),
            _ => {
                return Err(SyncError::integrity(format!(
                    "refusing path {relative:?} outside the sync root"
                )))
            }
        }
    }
    Ok(resolved)
}

/// Reads exactly `size` bytes at `offset`; the file is opened for this call only.
pub async fn read_chunk(path: &Path, offset: u64, size: u64) -> Result<Vec<u8>, SyncError> {
    let failed = |error: std::io::Error| {
        SyncError::integrity(format!(
            "cannot read {size} bytes at offset {offset} of {}: {error}",
            path.display()
        ))
    };
    let mut file = tokio::fs::File::open(path).await.map_err(failed)?;
    file.seek(std::io::SeekFrom::Start(offset))
        .await
        .map_err(failed)?;
    let mut buffer = vec![0u8; size as usize];
    file.read_exact(&mut buffer).await.map_err(failed)?;
    Ok(buffer)
}

#[must_use]
pub fn sha256(bytes: &[u8]) -> [u8; 32] {
    sha2::Sha256::digest(bytes).into()
}

/// zlib at the fastest level.
pub fn compress(bytes: &[u8]) -> Result<Vec<u8>, SyncError> {
    let mut encoder = flate2::write::ZlibEncoder::new(
        Vec::with_capacity(bytes.len() / 2),
        flate2::Compression::new(1),
    );
    encoder.write_all(bytes)?;
    Ok(encoder.finish()?)
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct ChunkKey {
    path: String,
    offset: u64,
    size: u64,
}

/// Remembers the most recently read chunk only.
///
/// A `getData` is normally followed by a `getDigest` of the same chunk; the
/// second request is served without touching the disk again.
#[derive(Debug, Default)]
pub struct ChunkCache {
    slot: Option<(ChunkKey, Vec<u8>)>,
    physical_reads: u64,
}

impl ChunkCache {
    pub async fn read(
        &mut self,
        root: &Path,
        relative: &str,
        offset: u64,
        size: u64,
    ) -> Result<&[u8], SyncError> {
        let key = ChunkKey {
            path: relative.to_string(),
            offset,
            size,
        };
        let hit = matches!(&self.slot, Some((cached, _)) if *cached == key);
        if !hit {
            self.slot = None;
            let bytes = read_chunk(&resolve(root, relative)?, offset, size).await?;
            self.physical_reads += 1;
            self.slot = Some((key, bytes));
        }
        match &self.slot {
            Some((_, bytes)) => Ok(bytes),
            None => Err(SyncError::integrity("chunk cache is empty")),
        }
    }

    #[must_use]
    pub fn physical_reads(&self) -> u64 {
        self.physical_reads
    }
}

/// Where `recordProgress`/`recordRawProgress` end up.
pub enum ProgressSink {
    /// Printed on stdout; structured updates are rendered as `raw: <update>`.
    Stdout,
    /// Forwarded as relay events (the agent runs behind a relay).
    Relay(RelayWriter),
    Callback(Box<dyn FnMut(RelayEvent) + Send>),
}

impl std::fmt::Debug for ProgressSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProgressSink::Stdout => write!(f, "Stdout"),
            ProgressSink::Relay(_) => write!(f, "Relay"),
            ProgressSink::Callback(_) => write!(f, "Callback"),
        }
    }
}

impl ProgressSink {
    fn text(&mut self, text: String) -> Result<(), SyncError> {
        match self {
            ProgressSink::Stdout => println!("{text}"),
            ProgressSink::Relay(writer) => writer.emit(&RelayEvent::Progress(text))?,
            ProgressSink::Callback(callback) => callback(RelayEvent::Progress(text)),
        }
        Ok(())
    }

    fn raw(&mut self, update: ProgressUpdate) -> Result<(), SyncError> {
        match self {
            ProgressSink::Stdout => println!("{}", raw_line(&update)),
            ProgressSink::Relay(writer) => writer.emit(&RelayEvent::RawProgress(update))?,
            ProgressSink::Callback(callback) => callback(RelayEvent::RawProgress(update)),
        }
        Ok(())
    }
}

fn raw_line(update: &ProgressUpdate) -> String {
    format!("raw: {}", update.message(false))
}

/// Counters describing what the agent served.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ServeStats {
    pub data_requests: u64,
    pub digest_requests: u64,
    pub failed_requests: u64,
    pub bytes_sent: u64,
}

#[derive(Debug)]
pub struct LocalAgent<C> {
    root: PathBuf,
    dest_dir: String,
    options: Options,
    cancel: C,
    sink: ProgressSink,
    cache: ChunkCache,
    data: Option<tokio::net::TcpStream>,
    stats: ServeStats,
}

impl<C: CancellationContext> LocalAgent<C> {
    pub fn new(
        root: PathBuf,
        dest_dir: String,
        options: Options,
        cancel: C,
        sink: ProgressSink,
    ) -> Self {
        Self {
            root,
            dest_dir,
            options,
            cancel,
            sink,
            cache: ChunkCache::default(),
            data: None,
            stats: ServeStats::default(),
        }
    }

    #[must_use]
    pub fn stats(&self) -> ServeStats {
        self.stats
    }

    #[must_use]
    pub fn physical_reads(&self) -> u64 {
        self.cache.physical_reads()
    }

    /// Answers commands until `quit`, returning its code.
    ///
    /// The controller is probed before every read; end-of-stream before `quit` is
    /// [`SyncError::UnexpectedEof`].
    #[instrument(skip_all, fields(root = %self.root.display()))]
    pub async fn serve<R, W>(&mut self, channel: &mut CommandChannel<R, W>) -> Result<i32, SyncError>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        loop {
            self.cancel.check()?;
            let Some(command) = channel.receive::<Command>().await? else {
                event!(Level::ERROR, "destination agent closed the session without quit");
                return Err(SyncError::UnexpectedEof);
            };
            event!(Level::TRACE, "received {}", command.name());
            if let Some(code) = self.dispatch(command, channel).await? {
                event!(Level::INFO, "destination agent finished with code {code}");
                return Ok(code);
            }
        }
    }

    async fn dispatch<R, W>(
        &mut self,
        command: Command,
        channel: &mut CommandChannel<R, W>,
    ) -> Result<Option<i32>, SyncError>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        match command {
            Command::Hello(theirs) => {
                let ours = ProtocolVersion::current();
                channel.send(&Response::Hello(ours.clone())).await?;
                if !ours.is_compatible_with(&theirs) {
                    return Err(SyncError::framing(format!(
                        "destination agent speaks {theirs}, this is {ours}"
                    )));
                }
            }
            Command::Connect(addr) => {
                event!(Level::DEBUG, "opening data channel to {addr}");
                let stream = tokio::net::TcpStream::connect(addr).await.map_err(|error| {
                    SyncError::transport(format!("cannot open data channel to {addr}: {error}"))
                })?;
                stream.set_nodelay(true)?;
                self.data = Some(stream);
            }
            Command::GetOptions => {
                channel.send(&Response::Options(self.options.clone())).await?;
            }
            Command::GetDestDir => {
                channel.send(&Response::DestDir(self.dest_dir.clone())).await?;
            }
            Command::GetList => {
                let root = self.root.clone();
                let filter = self.options.filter();
                let listing = tokio::task::spawn_blocking(move || {
                    common::listing::enumerate(&root, &filter)
                })
                .await
                .map_err(|error| SyncError::transport(format!("enumeration task failed: {error}")))??;
                event!(Level::INFO, "listing {} source entries", listing.len());
                channel.send(&Response::List(listing)).await?;
            }
            Command::GetDigest { path, offset, size } => {
                self.stats.digest_requests += 1;
                let response = match self.cache.read(&self.root, &path, offset, size).await {
                    Ok(bytes) => Response::Digest(sha256(bytes)),
                    Err(error) => {
                        self.stats.failed_requests += 1;
                        event!(Level::WARN, "getDigest {path}: {error}");
                        Response::Failed(error.to_string())
                    }
                };
                channel.send(&response).await?;
            }
            Command::GetData { path, offset, size } => {
                self.stats.data_requests += 1;
                let payload = match self.cache.read(&self.root, &path, offset, size).await {
                    Ok(bytes) if self.options.compress => Ok(compress(bytes)?),
                    Ok(bytes) => Ok(bytes.to_vec()),
                    Err(error) => Err(error),
                };
                match payload {
                    Ok(payload) => {
                        let data = self.data.as_mut().ok_or_else(|| {
                            SyncError::transport("getData received before the data channel was opened")
                        })?;
                        channel.send(&Response::DataLength(payload.len() as u64)).await?;
                        data.write_all(&payload).await.map_err(|error| {
                            SyncError::transport(format!("data channel write failed: {error}"))
                        })?;
                        self.stats.bytes_sent += payload.len() as u64;
                    }
                    Err(error) => {
                        self.stats.failed_requests += 1;
                        event!(Level::WARN, "getData {path}: {error}");
                        channel.send(&Response::Failed(error.to_string())).await?;
                    }
                }
            }
            Command::RecordProgress(text) => self.sink.text(text)?,
            Command::RecordRawProgress(update) => self.sink.raw(update)?,
            Command::Quit(code) => return Ok(Some(code)),
        }
        Ok(None)
    }
}

fn validate_source(source: &Path) -> Result<(), SyncError> {
    let metadata = std::fs::metadata(source).map_err(|error| {
        SyncError::config(format!("source {}: {error}", source.display()))
    })?;
    if !metadata.is_dir() {
        return Err(SyncError::config(format!(
            "source {} is not a directory",
            source.display()
        )));
    }
    std::fs::read_dir(source).map_err(|error| {
        SyncError::config(format!("source {} is not readable: {error}", source.display()))
    })?;
    Ok(())
}

/// Address of `host`, IPv4 preferred.
pub async fn resolve_host(host: &str) -> Result<std::net::IpAddr, SyncError> {
    let addrs: Vec<_> = tokio::net::lookup_host((host, 0))
        .await
        .map_err(|error| SyncError::transport(format!("cannot resolve {host}: {error}")))?
        .collect();
    addrs
        .iter()
        .find(|addr| addr.is_ipv4())
        .or_else(|| addrs.first())
        .map(|addr| addr.ip())
        .ok_or_else(|| SyncError::transport(format!("{host} has no addresses")))
}

/// Arguments starting the destination agent.
#[must_use]
pub fn destination_args(options: &Options) -> Vec<String> {
    let mut args = vec!["--destination-agent".to_string()];
    if options.verbose > 0 {
        args.push(format!("-{}", "v".repeat(options.verbose as usize)));
    }
    args
}

/// Synchronizes the local `source` directory into `dest`.
///
/// Resolves the destination host, records the controller pid, starts the
/// destination agent through `launcher` and serves it until it quits. The pid
/// file is removed and the remote shell reaped on every path.
pub async fn run_source<L, C>(
    source: &Path,
    dest: &RemotePath,
    mut options: Options,
    launcher: &L,
    cancel: C,
    sink: ProgressSink,
) -> Result<i32, SyncError>
where
    L: RemoteAgentLauncher,
    C: CancellationContext,
{
    validate_source(source)?;
    options.dest_addr = Some(resolve_host(&dest.host).await?);
    event!(
        Level::INFO,
        "synchronizing {} to {dest} ({:?})",
        source.display(),
        options.dest_addr
    );
    let _pidfile = PidFile::create(
        supervisor::pidfile_path(None, &dest.path),
        std::os::unix::process::parent_id(),
    )?;
    let RemoteProcess {
        mut child,
        stdin,
        stdout,
        ..
    } = launcher
        .launch(&dest.login(), &destination_args(&options), false)
        .await?;
    let mut channel = CommandChannel::new(stdout, stdin);
    let mut agent = LocalAgent::new(
        source.to_path_buf(),
        dest.path.clone(),
        options,
        cancel,
        sink,
    );
    let result = agent.serve(&mut channel).await;
    drop(channel);
    match supervisor::terminate_after(&mut child, supervisor::TEARDOWN_GRACE).await {
        Ok(status) => event!(Level::DEBUG, "remote shell exited: {status}"),
        Err(error) => event!(Level::WARN, "failed to reap remote shell: {error}"),
    }
    let stats = agent.stats();
    event!(
        Level::INFO,
        "served {} data and {} digest requests, {} sent",
        stats.data_requests,
        stats.digest_requests,
        bytesize::ByteSize(stats.bytes_sent)
    );
    result
}
