//! Shared building blocks of the dsync tools
//!
//! - [`options`]: run configuration exchanged between the agents
//! - [`filter`]: exact-path include/exclude rules
//! - [`listing`]: directory enumeration with hard-link detection
//! - [`progress`]: progress counters and report throttling
//! - [`supervisor`]: pidfiles, cooperative cancellation, subprocess teardown
//! - [`error`]: the error taxonomy and the process exit codes it maps onto
//!
//! Binaries start through [`run`], which sets up logging and the tokio runtime.

pub mod config;
pub mod error;
pub mod filter;
pub mod listing;
pub mod options;
pub mod progress;
pub mod supervisor;
#[cfg(any(test, feature = "testutils"))]
pub mod testutils;
pub mod version;

pub use config::{LogTarget, OutputConfig, RuntimeConfig};
pub use error::SyncError;

/// Installs the global tracing subscriber.
///
/// `RUST_LOG` overrides the level derived from the verbosity flags. Calling it more
/// than once is harmless.
pub fn setup_tracing(output: &OutputConfig) {
    use std::io::IsTerminal;
    let filter = tracing_subscriber::EnvFilter::builder()
        .with_default_directive(output.level().into())
        .from_env_lossy();
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false);
    let result = match output.target {
        LogTarget::Stdout => builder
            .with_ansi(std::io::stdout().is_terminal())
            .with_writer(std::io::stdout)
            .try_init(),
        LogTarget::Stderr => builder
            .with_ansi(std::io::stderr().is_terminal())
            .with_writer(std::io::stderr)
            .try_init(),
    };
    if let Err(error) = result {
        tracing::debug!("tracing subscriber already installed: {error}");
    }
}

/// Runs `func` to completion on a freshly built tokio runtime.
pub fn run<Fut>(
    output: OutputConfig,
    runtime: RuntimeConfig,
    func: impl FnOnce() -> Fut,
) -> anyhow::Result<Fut::Output>
where
    Fut: std::future::Future,
{
    setup_tracing(&output);
    let mut builder = tokio::runtime::Builder::new_multi_thread();
    builder.enable_all();
    if runtime.max_workers > 0 {
        builder.worker_threads(runtime.max_workers);
    }
    if runtime.max_blocking_threads > 0 {
        builder.max_blocking_threads(runtime.max_blocking_threads);
    }
    let runtime = builder
        .build()
        .map_err(|error| anyhow::anyhow!("failed to start tokio runtime: {error}"))?;
    Ok(runtime.block_on(func()))
}
