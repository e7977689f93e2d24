use anyhow::Context;
use clap::Parser;

use common::error::{SyncError, EXIT_CONFIG};
use common::options::{parse_progress_time, Options, ProgressVolume};
use common::supervisor::ControllerLiveness;
use dsync_tools_dsync::path::{parse_endpoint, Endpoint, RemotePath};
use dsync_tools_dsync::relay::ProxyRelay;
use dsync_tools_dsync::source::{self, ProgressSink};
use remote::launcher::Launcher;
use remote::protocol::RelayEvent;
use remote::streams::RelayWriter;
use remote::RemoteShell;

#[derive(Parser, Debug, Clone)]
#[command(
    name = "dsync",
    version,
    about = "Synchronize a directory tree to another host, transferring only what changed",
    long_about = "`dsync` mirrors a source directory into a destination directory on another host.

Only the data that differs is transferred. Nothing needs to be installed on the remote hosts: \
the running executable is shipped over the remote shell and removed once started.

EXAMPLES:
    # Local source to a remote destination
    dsync /data/projects backup@archive:/srv/projects

    # Remote source to a remote destination, removing extra files
    dsync --delete -z build@src-host:/out [fd00::7]:/mirror/out

    # Preview what would change, reporting progress every 5%
    dsync -n --progress-bytes 5% /data archive:/srv/data"
)]
struct Args {
    // Sync options
    /// Compress file data on the wire (zlib)
    #[arg(short = 'z', long, help_heading = "Sync options")]
    compress: bool,

    /// Only report what would be transferred or deleted
    #[arg(short = 'n', long, help_heading = "Sync options")]
    dry_run: bool,

    /// Skip the digest verification of transferred and unchanged-looking files
    #[arg(long, help_heading = "Sync options")]
    insecure: bool,

    /// Delete destination entries missing from the source
    #[arg(long, help_heading = "Sync options")]
    delete: bool,

    /// Exclude a path, relative to the source directory (repeatable)
    #[arg(short = 'x', long, value_name = "PATH", help_heading = "Sync options")]
    exclude: Vec<String>,

    /// Only synchronize this path, relative to the source directory (repeatable)
    #[arg(short = 'i', long, value_name = "PATH", help_heading = "Sync options")]
    include: Vec<String>,

    // Progress & output
    /// Report progress every N bytes processed
    ///
    /// Accepts plain bytes, a percentage of the total ("5%") or a binary-scaled value ("512M"). Minimum 1 MiB.
    #[arg(long, value_name = "N", help_heading = "Progress & output")]
    progress_bytes: Option<String>,

    /// Report progress every N minutes (fractions allowed, minimum 10 seconds)
    #[arg(long, value_name = "MINUTES", help_heading = "Progress & output")]
    progress_time: Option<String>,

    /// Do not prefix progress messages with a timestamp
    #[arg(long, help_heading = "Progress & output")]
    omit_progress_timestamp: bool,

    /// Verbose level: -v INFO / -vv DEBUG / -vvv TRACE (default: ERROR)
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count, help_heading = "Progress & output")]
    verbose: u8,

    /// Quiet mode, don't report errors
    #[arg(short = 'q', long = "quiet", help_heading = "Progress & output")]
    quiet: bool,

    // Remote shell
    /// Remote shell program
    #[arg(
        long,
        default_value = "ssh",
        value_name = "PROGRAM",
        help_heading = "Remote shell"
    )]
    rsh: String,

    /// Extra argument for the remote shell (repeatable)
    #[arg(long, value_name = "ARG", allow_hyphen_values = true, help_heading = "Remote shell")]
    ssharg: Vec<String>,

    /// Use a dsync binary installed on the remote hosts instead of shipping this one
    #[arg(long, value_name = "PATH", help_heading = "Remote shell")]
    remote_binary: Option<String>,

    // Advanced settings
    /// Number of worker threads (0 = number of CPU cores)
    #[arg(
        long,
        default_value = "0",
        value_name = "N",
        help_heading = "Advanced settings"
    )]
    max_workers: usize,

    /// Number of blocking worker threads (0 = Tokio default of 512)
    #[arg(
        long,
        default_value = "0",
        value_name = "N",
        help_heading = "Advanced settings"
    )]
    max_blocking_threads: usize,

    /// Print protocol version information as JSON and exit
    #[arg(long, hide = true)]
    protocol_version: bool,

    /// Run as a relayed source agent, reporting status in the relay format
    #[arg(long, hide = true)]
    proxy: bool,

    /// Run as the destination agent on stdin/stdout
    #[arg(long, hide = true)]
    destination_agent: bool,

    /// Remove our own executable first (set by the bootstrap stub)
    #[arg(long, hide = true)]
    unlink_self: bool,

    // ARGUMENTS
    /// Source directory and destination directory
    #[arg()]
    paths: Vec<String>,
}

fn build_options(args: &Args) -> Result<Options, SyncError> {
    let mut options = Options {
        verbose: args.verbose,
        compress: args.compress,
        dry_run: args.dry_run,
        insecure: args.insecure,
        delete: args.delete,
        ssh_args: args.ssharg.clone(),
        proxy: args.proxy,
        progress_timestamp: !args.omit_progress_timestamp,
        ..Default::default()
    };
    for name in &args.exclude {
        options.add_exclude(name)?;
    }
    for name in &args.include {
        options.add_include(name)?;
    }
    options.progress_bytes = args
        .progress_bytes
        .as_deref()
        .map(ProgressVolume::parse)
        .transpose()?;
    options.progress_time = args
        .progress_time
        .as_deref()
        .map(parse_progress_time)
        .transpose()?;
    options.send_progress =
        args.proxy || options.progress_bytes.is_some() || options.progress_time.is_some();
    options.send_raw_progress = args.proxy;
    Ok(options)
}

fn endpoints(args: &Args) -> Result<(Endpoint, RemotePath), SyncError> {
    let [source, dest] = args.paths.as_slice() else {
        return Err(SyncError::config(format!(
            "expected a source and a destination, got {} path(s)",
            args.paths.len()
        )));
    };
    let source = parse_endpoint(source)?;
    let Endpoint::Remote(dest) = parse_endpoint(dest)? else {
        return Err(SyncError::config(format!(
            "destination {dest:?} must be of the form [user@]host:dir"
        )));
    };
    if args.proxy && matches!(source, Endpoint::Remote(_)) {
        return Err(SyncError::config("a relayed agent needs a local source"));
    }
    Ok((source, dest))
}

async fn sync(args: Args) -> Result<i32, SyncError> {
    let options = build_options(&args)?;
    let (source, dest) = endpoints(&args)?;
    let shell = RemoteShell {
        program: args.rsh.clone(),
        extra_args: args.ssharg.clone(),
    };
    let launcher = Launcher::new(shell, args.remote_binary.clone())?;
    let cancel = ControllerLiveness::parent();
    match source {
        Endpoint::Remote(source) => {
            let mut relay = ProxyRelay::new()
                .on_progress(|text| println!("{text}"))
                .on_raw_progress(|update| tracing::debug!("progress: {}", update.message(false)));
            let result = relay.run(&launcher, &source, &dest, &options, &cancel).await;
            let stdout = relay.stdout_text();
            if !stdout.is_empty() {
                println!("{stdout}");
            }
            let stderr = relay.take_stderr();
            if !stderr.is_empty() {
                eprintln!("{stderr}");
            }
            result
        }
        Endpoint::Local(source) if options.proxy => {
            let sink = ProgressSink::Relay(RelayWriter::stdout());
            let result =
                source::run_source(&source, &dest, options, &launcher, cancel, sink).await;
            // last thing on stdout
            let writer = RelayWriter::stdout();
            let code = match &result {
                Ok(code) => *code,
                Err(error) => error.exit_code(),
            };
            if let Err(error) = writer.emit(&RelayEvent::Quit(code)) {
                tracing::error!("cannot report the result to the relay: {error}");
            }
            result
        }
        Endpoint::Local(source) => {
            source::run_source(&source, &dest, options, &launcher, cancel, ProgressSink::Stdout)
                .await
        }
    }
}

async fn async_main(args: Args) -> i32 {
    if args.destination_agent {
        return dsync_tools_dsync::destination::run_destination().await;
    }
    match sync(args).await {
        Ok(code) => code,
        Err(error) => {
            tracing::error!("{error}");
            error.exit_code()
        }
    }
}

fn main() -> anyhow::Result<()> {
    // handled before parsing so that it works without paths
    let raw: Vec<String> = std::env::args().collect();
    if raw
        .iter()
        .take_while(|arg| *arg != "--")
        .any(|arg| arg == "--protocol-version")
    {
        let json = common::version::ProtocolVersion::current()
            .to_json()
            .context("failed to encode the protocol version")?;
        println!("{json}");
        return Ok(());
    }
    let args = Args::parse();
    if args.unlink_self {
        if let Err(error) = remote::deploy::unlink_self() {
            eprintln!("{error}");
        }
    }
    // configuration problems are reported before any remote work
    if !args.destination_agent {
        if let Err(error) = build_options(&args).and_then(|_| endpoints(&args).map(|_| ())) {
            if !args.quiet {
                eprintln!("dsync: {error}");
            }
            if args.proxy {
                if let Err(error) = RelayWriter::stdout().emit(&RelayEvent::Quit(EXIT_CONFIG)) {
                    eprintln!("dsync: cannot report the result to the relay: {error}");
                }
            }
            std::process::exit(EXIT_CONFIG);
        }
    }
    let output = common::OutputConfig {
        quiet: args.quiet,
        verbose: args.verbose,
        target: if args.destination_agent {
            common::LogTarget::Stderr
        } else {
            common::LogTarget::Stdout
        },
    };
    let runtime = common::RuntimeConfig {
        max_workers: args.max_workers,
        max_blocking_threads: args.max_blocking_threads,
    };
    let func = {
        let args = args.clone();
        || async_main(args)
    };
    let code = common::run(output, runtime, func).context("dsync failed to start")?;
    std::process::exit(code);
}
