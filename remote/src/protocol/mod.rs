use serde::{Deserialize, Serialize};

use common::listing::DirectoryListing;
use common::options::Options;
use common::progress::ProgressUpdate;
use common::version::ProtocolVersion;

/// Size of a `getDigest`/`getData` chunk.
pub const CHUNK_SIZE: u64 = 1024 * 1024;

/// Requests sent by the destination agent to the source agent.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub enum Command {
    // must be the first command of a session
    Hello(ProtocolVersion),
    /// Open the data channel to the given listener.
    Connect(std::net::SocketAddr),
    GetOptions,
    GetDestDir,
    GetList,
    GetDigest {
        path: String,
        offset: u64,
        size: u64,
    },
    /// The payload follows the `DataLength` response on the data channel.
    GetData {
        path: String,
        offset: u64,
        size: u64,
    },
    RecordProgress(String),
    RecordRawProgress(ProgressUpdate),
    Quit(i32),
}

impl Command {
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Command::Hello(_) => "hello",
            Command::Connect(_) => "connect",
            Command::GetOptions => "getOptions",
            Command::GetDestDir => "getDestDir",
            Command::GetList => "getList",
            Command::GetDigest { .. } => "getDigest",
            Command::GetData { .. } => "getData",
            Command::RecordProgress(_) => "recordProgress",
            Command::RecordRawProgress(_) => "recordRawProgress",
            Command::Quit(_) => "quit",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub enum Response {
    Hello(ProtocolVersion),
    Options(Options),
    DestDir(String),
    List(DirectoryListing),
    Digest([u8; 32]),
    /// Number of bytes about to be written on the data channel.
    DataLength(u64),
    /// Per-file failure (missing file, short read).
    Failed(String),
}

/// Structured status written by an agent running behind a relay.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub enum RelayEvent {
    Progress(String),
    RawProgress(ProgressUpdate),
    Quit(i32),
}
