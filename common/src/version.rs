// version information exchanged when two agents meet

use serde::{Deserialize, Serialize};

/// Revision of the command protocol; bumped whenever a command or response changes shape.
pub const WIRE_VERSION: u32 = 1;

/// Protocol version information
///
/// Sent in the `hello` exchange and printed by `dsync --protocol-version`.
/// Compatibility is decided by the wire revision alone; the package version and
/// git information are carried for diagnostics.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProtocolVersion {
    pub wire: u32,

    /// Semantic version from Cargo.toml (e.g., "0.1.0")
    pub semantic: String,

    /// Git describe output (e.g., "v0.1.0-7-g644da27"), absent when built outside git
    #[serde(default)]
    pub git_describe: Option<String>,

    #[serde(default)]
    pub git_hash: Option<String>,
}

impl ProtocolVersion {
    pub fn current() -> Self {
        Self {
            wire: WIRE_VERSION,
            semantic: env!("CARGO_PKG_VERSION").to_string(),
            git_describe: option_env!("DSYNC_GIT_DESCRIBE").map(String::from),
            git_hash: option_env!("DSYNC_GIT_HASH").map(String::from),
        }
    }

    /// # Examples
    ///
    /// ```
    /// use common::version::ProtocolVersion;
    ///
    /// let mine = ProtocolVersion::current();
    /// let mut theirs = mine.clone();
    /// theirs.semantic = "9.9.9".to_string();
    /// assert!(mine.is_compatible_with(&theirs));
    ///
    /// theirs.wire += 1;
    /// assert!(!mine.is_compatible_with(&theirs));
    /// ```
    pub fn is_compatible_with(&self, other: &Self) -> bool {
        self.wire == other.wire
    }

    pub fn display(&self) -> String {
        match self.git_describe {
            Some(ref git_describe) => {
                format!("{} ({}, wire {})", self.semantic, git_describe, self.wire)
            }
            None => format!("{} (wire {})", self.semantic, self.wire),
        }
    }

    pub fn to_json(&self) -> anyhow::Result<String> {
        serde_json::to_string(self)
            .map_err(|e| anyhow::anyhow!("failed to serialize version: {:#}", e))
    }

    pub fn from_json(json: &str) -> anyhow::Result<Self> {
        serde_json::from_str(json.trim())
            .map_err(|e| anyhow::anyhow!("failed to parse version JSON: {:#}", e))
    }
}

impl std::fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.display())
    }
}
