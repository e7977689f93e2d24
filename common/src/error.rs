//! Error taxonomy shared by every dsync role
//!
//! Each variant maps onto a process exit code, so an error raised deep inside an
//! agent can be turned into the code reported to the invoker (directly, or via a
//! `quit` message when running behind a relay).

/// Synchronization completed successfully.
pub const EXIT_OK: i32 = 0;
/// Application-level failure, including files skipped after integrity errors.
pub const EXIT_FAILURE: i32 = 1;
/// The controlling process vanished; the run was abandoned, not failed.
pub const EXIT_CANCELLED: i32 = 2;
/// The peer closed the command channel without sending `quit`.
pub const EXIT_UNEXPECTED_EOF: i32 = 3;
/// A malformed or truncated frame was received.
pub const EXIT_FRAMING: i32 = 4;
/// The remote shell could not be started or died unexpectedly.
pub const EXIT_TRANSPORT: i32 = 5;
/// Invalid run configuration, detected before any remote work.
pub const EXIT_CONFIG: i32 = 6;

#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("framing error: {0}")]
    Framing(String),

    #[error("unexpected end of stream on the command channel")]
    UnexpectedEof,

    #[error("integrity error: {0}")]
    Integrity(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("controlling process is gone")]
    Cancelled,

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl SyncError {
    pub fn transport(msg: impl Into<String>) -> Self {
        SyncError::Transport(msg.into())
    }

    pub fn framing(msg: impl Into<String>) -> Self {
        SyncError::Framing(msg.into())
    }

    pub fn integrity(msg: impl Into<String>) -> Self {
        SyncError::Integrity(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        SyncError::Config(msg.into())
    }

    #[must_use]
    pub fn exit_code(&self) -> i32 {
        match self {
            SyncError::Transport(_) => EXIT_TRANSPORT,
            SyncError::Framing(_) => EXIT_FRAMING,
            SyncError::UnexpectedEof => EXIT_UNEXPECTED_EOF,
            SyncError::Config(_) => EXIT_CONFIG,
            SyncError::Cancelled => EXIT_CANCELLED,
            SyncError::Integrity(_) | SyncError::Io(_) => EXIT_FAILURE,
        }
    }
}
