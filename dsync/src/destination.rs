//! Destination-side agent
//!
//! The [`RemoteAgent`] drives the session: it asks the source agent for the run
//! options and the source listing, compares it with the destination tree and
//! pulls whatever is missing or stale. Changes are applied in a fixed order:
//!
//! 1. entries whose kind changed are removed,
//! 2. missing directories are created, parents first,
//! 3. regular files are fetched or verified,
//! 4. symlinks are created,
//! 5. hard links are (re)linked to their already synchronized targets,
//! 6. destination-only entries are deleted, deepest first (with `delete`),
//! 7. directory attributes are set, deepest first.

use std::collections::{BTreeMap, HashSet};
use std::io::Read;
use std::os::unix::fs::{MetadataExt, PermissionsExt};
use std::path::{Path, PathBuf};
use std::time::Instant;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncSeekExt, AsyncWrite, AsyncWriteExt};
use tracing::{event, instrument, Level};

use common::error::{SyncError, EXIT_FAILURE, EXIT_OK};
use common::filter::self_and_ancestors;
use common::listing::{DirectoryListing, FileRecord, Stat};
use common::options::Options;
use common::progress::{ProgressUpdate, SyncProgress};
use common::version::ProtocolVersion;
use remote::protocol::{Command, Response, CHUNK_SIZE};
use remote::streams::{CommandChannel, MAX_FRAME_SIZE};

use crate::source::{read_chunk, resolve, sha256};

/// `(offset, size)` of every chunk of a file of `size` bytes.
fn chunks(size: u64) -> impl Iterator<Item = (u64, u64)> {
    (0..size.div_ceil(CHUNK_SIZE)).map(move |index| {
        let offset = index * CHUNK_SIZE;
        (offset, CHUNK_SIZE.min(size - offset))
    })
}

/// Whether the destination entry has to go before the source entry can take its place.
fn needs_removal(source: &FileRecord, existing: &FileRecord) -> bool {
    match (source, existing) {
        (FileRecord::Directory(_), existing) => !existing.is_dir(),
        (FileRecord::Symlink { target, .. }, FileRecord::Symlink { target: current, .. }) => {
            target != current
        }
        (FileRecord::Symlink { .. }, _) => true,
        (FileRecord::Regular(_) | FileRecord::Alias { .. }, existing) => matches!(
            existing,
            FileRecord::Directory(_) | FileRecord::Symlink { .. }
        ),
    }
}

/// What the destination holds at `path`, unless it or an ancestor was removed.
fn existing<'a>(
    dest: &'a DirectoryListing,
    removed: &HashSet<&str>,
    path: &str,
) -> Option<&'a FileRecord> {
    if self_and_ancestors(path).any(|entry| removed.contains(entry)) {
        return None;
    }
    dest.get(path)
}

/// Destination paths sharing an inode with another destination path.
fn shared_paths(listing: &DirectoryListing) -> HashSet<&str> {
    let mut shared = HashSet::new();
    for (path, record) in listing {
        if let FileRecord::Alias { target } = record {
            shared.insert(path.as_str());
            shared.insert(target.as_str());
        }
    }
    shared
}

fn temp_sibling(target: &Path) -> Result<PathBuf, SyncError> {
    let name = target.file_name().ok_or_else(|| {
        SyncError::integrity(format!("{} has no file name", target.display()))
    })?;
    Ok(target.with_file_name(format!(".{}.dsync-tmp", name.to_string_lossy())))
}

fn same_inode(first: &Path, second: &Path) -> bool {
    match (
        std::fs::symlink_metadata(first),
        std::fs::symlink_metadata(second),
    ) {
        (Ok(first), Ok(second)) => first.dev() == second.dev() && first.ino() == second.ino(),
        _ => false,
    }
}

fn decompress(bytes: &[u8], expected: u64) -> Result<Vec<u8>, SyncError> {
    let mut restored = Vec::with_capacity(expected as usize);
    flate2::read::ZlibDecoder::new(bytes)
        .take(expected + 1)
        .read_to_end(&mut restored)
        .map_err(|error| SyncError::integrity(format!("corrupt compressed chunk: {error}")))?;
    Ok(restored)
}

/// Removes whatever is at `path`, recursively for directories.
async fn remove_path(path: &Path) -> Result<(), SyncError> {
    match tokio::fs::symlink_metadata(path).await {
        Ok(metadata) if metadata.is_dir() => tokio::fs::remove_dir_all(path).await?,
        Ok(_) => tokio::fs::remove_file(path).await?,
        Err(error) if error.kind() == std::io::ErrorKind::NotFound => {}
        Err(error) => return Err(error.into()),
    }
    Ok(())
}

fn response_name(response: &Response) -> &'static str {
    match response {
        Response::Hello(_) => "hello",
        Response::Options(_) => "options",
        Response::DestDir(_) => "destDir",
        Response::List(_) => "list",
        Response::Digest(_) => "digest",
        Response::DataLength(_) => "dataLength",
        Response::Failed(_) => "failed",
    }
}

fn unexpected(command: &str, response: &Response) -> SyncError {
    SyncError::framing(format!(
        "unexpected {} response to {command}",
        response_name(response)
    ))
}

#[derive(Debug)]
pub struct RemoteAgent<R, W> {
    channel: CommandChannel<R, W>,
    options: Options,
    root: PathBuf,
    data: Option<tokio::net::TcpStream>,
    progress: Option<SyncProgress>,
    /// Files skipped after a per-file error, with the reason.
    failures: BTreeMap<String, String>,
    is_root: bool,
}

impl<R: AsyncRead + Unpin, W: AsyncWrite + Unpin> RemoteAgent<R, W> {
    pub fn new(channel: CommandChannel<R, W>) -> Self {
        Self {
            channel,
            options: Options::default(),
            root: PathBuf::new(),
            data: None,
            progress: None,
            failures: BTreeMap::new(),
            is_root: nix::unistd::geteuid().is_root(),
        }
    }

    /// Runs the whole session and ends it with `quit(code)`.
    pub async fn run(mut self) -> i32 {
        let code = match self.session().await {
            Ok(code) => code,
            Err(error) => {
                event!(Level::ERROR, "{error}");
                error.exit_code()
            }
        };
        if let Err(error) = self.channel.send(&Command::Quit(code)).await {
            event!(Level::DEBUG, "cannot deliver quit({code}): {error}");
        }
        code
    }

    async fn request(&mut self, command: &Command) -> Result<Response, SyncError> {
        self.channel.send(command).await?;
        self.channel.expect::<Response>().await
    }

    #[instrument(skip_all)]
    async fn session(&mut self) -> Result<i32, SyncError> {
        let ours = ProtocolVersion::current();
        match self.request(&Command::Hello(ours.clone())).await? {
            Response::Hello(theirs) if ours.is_compatible_with(&theirs) => {
                event!(Level::DEBUG, "source agent version {theirs}");
            }
            Response::Hello(theirs) => {
                return Err(SyncError::framing(format!(
                    "source agent speaks {theirs}, this is {ours}"
                )));
            }
            other => return Err(unexpected("hello", &other)),
        }
        self.options = match self.request(&Command::GetOptions).await? {
            Response::Options(options) => options,
            other => return Err(unexpected("getOptions", &other)),
        };
        self.root = match self.request(&Command::GetDestDir).await? {
            Response::DestDir(dir) => PathBuf::from(dir),
            other => return Err(unexpected("getDestDir", &other)),
        };
        event!(Level::INFO, "synchronizing into {}", self.root.display());
        if !self.options.dry_run {
            tokio::fs::create_dir_all(&self.root).await?;
            self.open_data_channel().await?;
        }
        let source = match self.request(&Command::GetList).await? {
            Response::List(listing) => listing,
            other => return Err(unexpected("getList", &other)),
        };
        let dest = self.enumerate_destination().await?;
        event!(
            Level::INFO,
            "{} source entries, {} destination entries",
            source.len(),
            dest.len()
        );
        if self.options.dry_run {
            self.report_dry_run(&source, &dest).await?;
            return Ok(EXIT_OK);
        }
        self.apply(&source, &dest).await?;
        if self.failures.is_empty() {
            Ok(EXIT_OK)
        } else {
            event!(
                Level::ERROR,
                "{} file(s) could not be synchronized",
                self.failures.len()
            );
            Ok(EXIT_FAILURE)
        }
    }

    async fn enumerate_destination(&self) -> Result<DirectoryListing, SyncError> {
        if !self.root.is_dir() {
            return Ok(DirectoryListing::new());
        }
        let root = self.root.clone();
        let filter = self.options.filter();
        tokio::task::spawn_blocking(move || common::listing::enumerate(&root, &filter))
            .await
            .map_err(|error| SyncError::transport(format!("enumeration task failed: {error}")))?
    }

    async fn open_data_channel(&mut self) -> Result<(), SyncError> {
        let addr = self
            .options
            .dest_addr
            .ok_or_else(|| SyncError::config("source agent did not send the destination address"))?;
        let unspecified = match addr {
            std::net::IpAddr::V4(_) => std::net::IpAddr::V4(std::net::Ipv4Addr::UNSPECIFIED),
            std::net::IpAddr::V6(_) => std::net::IpAddr::V6(std::net::Ipv6Addr::UNSPECIFIED),
        };
        let listener = tokio::net::TcpListener::bind((unspecified, 0))
            .await
            .map_err(|error| SyncError::transport(format!("cannot listen for data: {error}")))?;
        let advertised = std::net::SocketAddr::new(addr, listener.local_addr()?.port());
        self.channel.send(&Command::Connect(advertised)).await?;
        let (stream, peer) = listener
            .accept()
            .await
            .map_err(|error| SyncError::transport(format!("data channel accept failed: {error}")))?;
        event!(Level::DEBUG, "data channel {advertised} connected from {peer}");
        self.data = Some(stream);
        Ok(())
    }

    async fn report(&mut self, update: ProgressUpdate) -> Result<(), SyncError> {
        event!(Level::INFO, "{}", update.message(false));
        if self.options.send_progress {
            let text = update.message(self.options.progress_timestamp);
            self.channel.send(&Command::RecordProgress(text)).await?;
        }
        if self.options.send_raw_progress {
            self.channel.send(&Command::RecordRawProgress(update)).await?;
        }
        Ok(())
    }

    async fn report_due(&mut self) -> Result<(), SyncError> {
        let update = self
            .progress
            .as_mut()
            .and_then(|progress| progress.due(Instant::now()));
        match update {
            Some(update) => self.report(update).await,
            None => Ok(()),
        }
    }

    fn processed(&mut self, bytes: u64) {
        if let Some(progress) = self.progress.as_mut() {
            progress.processed(bytes);
        }
    }

    async fn report_dry_run(
        &mut self,
        source: &DirectoryListing,
        dest: &DirectoryListing,
    ) -> Result<(), SyncError> {
        let mut files = 0u64;
        let mut bytes = 0u64;
        for (path, record) in source {
            let FileRecord::Regular(stat) = record else {
                continue;
            };
            let stale = match dest.get(path) {
                Some(FileRecord::Regular(existing)) => !stat.looks_unchanged(existing),
                _ => true,
            };
            if stale {
                files += 1;
                bytes += stat.size;
                let text = format!("would transfer {path} ({} bytes)", stat.size);
                self.channel.send(&Command::RecordProgress(text)).await?;
            }
        }
        if self.options.delete {
            for path in dest.keys().rev().filter(|path| !source.contains_key(*path)) {
                let text = format!("would delete {path}");
                self.channel.send(&Command::RecordProgress(text)).await?;
            }
        }
        let text = format!(
            "dry run: {files} file(s), {bytes} bytes ({}) would be transferred",
            bytesize::ByteSize(bytes)
        );
        self.channel.send(&Command::RecordProgress(text)).await
    }

    fn apply_attributes(&self, path: &Path, stat: &Stat) -> Result<(), SyncError> {
        if self.is_root {
            std::os::unix::fs::lchown(path, Some(stat.uid), Some(stat.gid))?;
        }
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(stat.permissions()))?;
        filetime::set_file_mtime(path, stat.mtime())?;
        Ok(())
    }

    fn record_failure(&mut self, path: &str, reason: String) {
        event!(Level::ERROR, "skipping {path}: {reason}");
        self.failures.insert(path.to_string(), reason);
    }

    /// Pulls one chunk over the data channel and checks it.
    async fn fetch_chunk(&mut self, path: &str, offset: u64, size: u64) -> Result<Vec<u8>, SyncError> {
        let command = Command::GetData {
            path: path.to_string(),
            offset,
            size,
        };
        let length = match self.request(&command).await? {
            Response::DataLength(length) => length,
            Response::Failed(reason) => return Err(SyncError::Integrity(reason)),
            other => return Err(unexpected("getData", &other)),
        };
        if length > MAX_FRAME_SIZE as u64 {
            return Err(SyncError::framing(format!("announced chunk of {length} bytes")));
        }
        let data = self
            .data
            .as_mut()
            .ok_or_else(|| SyncError::transport("data channel is not open"))?;
        let mut wire = vec![0u8; length as usize];
        data.read_exact(&mut wire)
            .await
            .map_err(|error| SyncError::transport(format!("data channel read failed: {error}")))?;
        if let Some(progress) = self.progress.as_mut() {
            progress.transferred(length);
        }
        let bytes = if self.options.compress {
            decompress(&wire, size)?
        } else {
            wire
        };
        if bytes.len() as u64 != size {
            return Err(SyncError::integrity(format!(
                "received {} bytes at offset {offset}, expected {size}",
                bytes.len()
            )));
        }
        if !self.options.insecure {
            let expected = self.remote_digest(path, offset, size).await?;
            let actual = sha256(&bytes);
            if actual != expected {
                return Err(SyncError::integrity(format!(
                    "digest mismatch at offset {offset}: received {}, expected {}",
                    hex::encode(actual),
                    hex::encode(expected)
                )));
            }
        }
        Ok(bytes)
    }

    async fn remote_digest(&mut self, path: &str, offset: u64, size: u64) -> Result<[u8; 32], SyncError> {
        let command = Command::GetDigest {
            path: path.to_string(),
            offset,
            size,
        };
        match self.request(&command).await? {
            Response::Digest(digest) => Ok(digest),
            Response::Failed(reason) => Err(SyncError::Integrity(reason)),
            other => Err(unexpected("getDigest", &other)),
        }
    }

    /// Copies the whole file into a temporary sibling and renames it into place.
    async fn fetch_file(&mut self, path: &str, stat: &Stat) -> Result<bool, SyncError> {
        let target = resolve(&self.root, path)?;
        let temp = temp_sibling(&target)?;
        let result = self.fetch_into(path, stat, &temp).await;
        let result = match result {
            Ok(()) => match self.apply_attributes(&temp, stat) {
                Ok(()) => tokio::fs::rename(&temp, &target).await.map_err(SyncError::from),
                Err(error) => Err(error),
            },
            Err(error) => Err(error),
        };
        if result.is_err() {
            if let Err(error) = tokio::fs::remove_file(&temp).await {
                event!(Level::DEBUG, "cannot remove {}: {error}", temp.display());
            }
        }
        result.map(|()| true)
    }

    async fn fetch_into(&mut self, path: &str, stat: &Stat, temp: &Path) -> Result<(), SyncError> {
        event!(Level::DEBUG, "fetching {path} ({} bytes)", stat.size);
        let mut file = tokio::fs::File::create(temp).await?;
        for (offset, size) in chunks(stat.size) {
            let bytes = self.fetch_chunk(path, offset, size).await?;
            file.write_all(&bytes).await?;
            self.processed(size);
            self.report_due().await?;
        }
        file.flush().await?;
        Ok(())
    }

    /// Checks a file that looks unchanged chunk by chunk, re-fetching what differs.
    ///
    /// Files sharing their inode with other destination paths are never patched in
    /// place; a mismatch there replaces the whole file.
    async fn verify_file(&mut self, path: &str, stat: &Stat, shared: bool) -> Result<bool, SyncError> {
        let target = resolve(&self.root, path)?;
        if self.options.insecure {
            self.processed(stat.size);
            self.apply_attributes(&target, stat)?;
            return Ok(false);
        }
        let mut patched: Option<tokio::fs::File> = None;
        for (offset, size) in chunks(stat.size) {
            let local = read_chunk(&target, offset, size)
                .await
                .ok()
                .map(|bytes| sha256(&bytes));
            let remote = self.remote_digest(path, offset, size).await?;
            if local != Some(remote) {
                if shared {
                    event!(Level::INFO, "{path} differs and is hard linked, replacing it");
                    return self.fetch_file(path, stat).await;
                }
                event!(Level::INFO, "{path} differs at offset {offset}, patching");
                let bytes = self.fetch_chunk(path, offset, size).await?;
                let mut file = match patched.take() {
                    Some(file) => file,
                    None => {
                        tokio::fs::OpenOptions::new()
                            .write(true)
                            .open(&target)
                            .await?
                    }
                };
                file.seek(std::io::SeekFrom::Start(offset)).await?;
                file.write_all(&bytes).await?;
                patched = Some(file);
            }
            self.processed(size);
            self.report_due().await?;
        }
        let transferred = match patched {
            Some(mut file) => {
                file.flush().await?;
                true
            }
            None => false,
        };
        self.apply_attributes(&target, stat)?;
        Ok(transferred)
    }

    #[instrument(skip_all)]
    async fn apply(&mut self, source: &DirectoryListing, dest: &DirectoryListing) -> Result<(), SyncError> {
        let (bytes_total, files_total) = source
            .values()
            .filter_map(|record| match record {
                FileRecord::Regular(stat) => Some(stat.size),
                _ => None,
            })
            .fold((0u64, 0u64), |(bytes, files), size| (bytes + size, files + 1));
        self.progress = Some(SyncProgress::new(
            &self.options,
            bytes_total,
            files_total,
            Instant::now(),
        ));
        let mut removed: HashSet<&str> = HashSet::new();
        let current = |removed: &HashSet<&str>, path: &str| existing(dest, removed, path);
        // kind changes
        for (path, record) in source {
            let Some(existing) = current(&removed, path) else {
                continue;
            };
            if needs_removal(record, existing) {
                event!(
                    Level::DEBUG,
                    "replacing {} {path} with a {}",
                    existing.kind(),
                    record.kind()
                );
                remove_path(&resolve(&self.root, path)?).await?;
                removed.insert(path.as_str());
            }
        }
        // directories, parents first
        for (path, record) in source {
            if record.is_dir() && current(&removed, path).is_none() {
                match tokio::fs::create_dir(resolve(&self.root, path)?).await {
                    Ok(()) => {}
                    Err(error) if error.kind() == std::io::ErrorKind::AlreadyExists => {}
                    Err(error) => return Err(error.into()),
                }
            }
        }
        // regular files
        let shared = shared_paths(dest);
        for (path, record) in source {
            let FileRecord::Regular(stat) = record else {
                continue;
            };
            let outcome = match current(&removed, path) {
                Some(FileRecord::Regular(existing)) if stat.looks_unchanged(existing) => {
                    self.verify_file(path, stat, shared.contains(path.as_str()))
                        .await
                }
                _ => self.fetch_file(path, stat).await,
            };
            match outcome {
                Ok(transferred) => {
                    if let Some(progress) = self.progress.as_mut() {
                        progress.file_done(transferred);
                    }
                }
                Err(SyncError::Integrity(reason)) => {
                    self.record_failure(path, reason);
                    if let Some(progress) = self.progress.as_mut() {
                        progress.file_done(false);
                    }
                }
                Err(error) => return Err(error),
            }
            self.report_due().await?;
        }
        // symlinks
        for (path, record) in source {
            let FileRecord::Symlink { stat, target } = record else {
                continue;
            };
            let link = resolve(&self.root, path)?;
            if current(&removed, path).is_none() {
                remove_path(&link).await?;
                tokio::fs::symlink(target, &link).await?;
            }
            if self.is_root {
                std::os::unix::fs::lchown(&link, Some(stat.uid), Some(stat.gid))?;
            }
            filetime::set_symlink_file_times(&link, stat.mtime(), stat.mtime())?;
        }
        // hard links
        for (path, record) in source {
            let FileRecord::Alias { target } = record else {
                continue;
            };
            if let Some(reason) = self.failures.get(target) {
                event!(Level::WARN, "not linking {path}: {target} was skipped ({reason})");
                continue;
            }
            let target_path = resolve(&self.root, target)?;
            let link = resolve(&self.root, path)?;
            if same_inode(&target_path, &link) {
                continue;
            }
            let temp = temp_sibling(&link)?;
            remove_path(&temp).await?;
            tokio::fs::hard_link(&target_path, &temp).await?;
            tokio::fs::rename(&temp, &link).await?;
            event!(Level::DEBUG, "linked {path} to {target}");
        }
        // destination-only entries
        if self.options.delete {
            for (path, existing) in dest.iter().rev() {
                if source.contains_key(path) || current(&removed, path).is_none() {
                    continue;
                }
                let full = resolve(&self.root, path)?;
                let result = if existing.is_dir() {
                    tokio::fs::remove_dir(&full).await
                } else {
                    tokio::fs::remove_file(&full).await
                };
                match result {
                    Ok(()) => event!(Level::DEBUG, "deleted {path}"),
                    Err(error) if error.kind() == std::io::ErrorKind::NotFound => {}
                    Err(error) => event!(Level::WARN, "cannot delete {path}: {error}"),
                }
            }
        }
        // directory attributes, deepest first
        for (path, record) in source.iter().rev() {
            if let FileRecord::Directory(stat) = record {
                self.apply_attributes(&resolve(&self.root, path)?, stat)?;
            }
        }
        if let Some(progress) = self.progress.as_ref() {
            let update = progress.finish();
            event!(
                Level::INFO,
                "{} file(s) transferred, {} over the data channel",
                update.files_transferred,
                bytesize::ByteSize(update.bytes_transferred)
            );
            self.report(update).await?;
        }
        Ok(())
    }
}

/// Serves as the destination agent on this process' stdin/stdout.
pub async fn run_destination() -> i32 {
    let channel = CommandChannel::new(tokio::io::stdin(), tokio::io::stdout());
    RemoteAgent::new(channel).run().await
}
