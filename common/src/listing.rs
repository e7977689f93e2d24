//! Directory enumeration
//!
//! Both agents describe their side of the transfer with a [`DirectoryListing`]:
//! an ordered map from `./`-rooted relative paths to [`FileRecord`]s.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::os::unix::fs::MetadataExt;
use std::path::Path;
use tracing::{event, instrument, Level};

use crate::error::SyncError;
use crate::filter::FilterSettings;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stat {
    pub mode: u32,
    pub size: u64,
    pub mtime: i64,
    pub mtime_nsec: i64,
    pub uid: u32,
    pub gid: u32,
}

impl From<&std::fs::Metadata> for Stat {
    fn from(metadata: &std::fs::Metadata) -> Self {
        Stat {
            mode: metadata.mode(),
            size: metadata.size(),
            mtime: metadata.mtime(),
            mtime_nsec: metadata.mtime_nsec(),
            uid: metadata.uid(),
            gid: metadata.gid(),
        }
    }
}

impl Stat {
    /// Permission bits, without the file type.
    #[must_use]
    pub fn permissions(&self) -> u32 {
        self.mode & 0o7777
    }

    /// Size and modification time agree, so the content is presumed equal.
    #[must_use]
    pub fn looks_unchanged(&self, other: &Stat) -> bool {
        self.size == other.size && self.mtime == other.mtime && self.mtime_nsec == other.mtime_nsec
    }

    #[must_use]
    pub fn mtime(&self) -> filetime::FileTime {
        filetime::FileTime::from_unix_time(self.mtime, self.mtime_nsec as u32)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum FileRecord {
    Regular(Stat),
    Directory(Stat),
    Symlink { stat: Stat, target: String },
    /// Shares its inode with the earlier `target` path of the same listing.
    Alias { target: String },
}

impl FileRecord {
    #[must_use]
    pub fn stat(&self) -> Option<&Stat> {
        match self {
            FileRecord::Regular(stat) | FileRecord::Directory(stat) => Some(stat),
            FileRecord::Symlink { stat, .. } => Some(stat),
            FileRecord::Alias { .. } => None,
        }
    }

    #[must_use]
    pub fn is_dir(&self) -> bool {
        matches!(self, FileRecord::Directory(_))
    }

    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            FileRecord::Regular(_) => "file",
            FileRecord::Directory(_) => "directory",
            FileRecord::Symlink { .. } => "symlink",
            FileRecord::Alias { .. } => "hard link",
        }
    }
}

pub type DirectoryListing = BTreeMap<String, FileRecord>;

/// `./`-rooted name of `path`, or `None` when it is not valid UTF-8.
fn relative_name(root: &Path, path: &Path) -> Option<String> {
    let relative = path.strip_prefix(root).ok()?;
    Some(format!("./{}", relative.to_str()?))
}

/// Walks `root` without following symlinks, siblings in file-name order.
///
/// Filtered-out entries are pruned before descent. Non-directories sharing an
/// inode are recorded once in full; later occurrences become
/// [`FileRecord::Alias`] entries pointing at the first one. Special files
/// (sockets, fifos, devices) and names that are not valid UTF-8 are skipped.
#[instrument(skip(filter))]
pub fn enumerate(root: &Path, filter: &FilterSettings) -> Result<DirectoryListing, SyncError> {
    let mut listing = DirectoryListing::new();
    let mut inodes: HashMap<(u64, u64), String> = HashMap::new();
    let walker = walkdir::WalkDir::new(root)
        .min_depth(1)
        .follow_links(false)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|entry| match relative_name(root, entry.path()) {
            Some(relative) => match filter.should_include(&relative) {
                crate::filter::FilterResult::Included => true,
                rejected => {
                    event!(Level::DEBUG, "skipping {relative}: {rejected:?}");
                    false
                }
            },
            None => {
                event!(
                    Level::WARN,
                    "skipping {:?}: name is not valid UTF-8",
                    entry.path()
                );
                false
            }
        });
    for entry in walker {
        let entry = entry.map_err(std::io::Error::from)?;
        let Some(relative) = relative_name(root, entry.path()) else {
            continue;
        };
        let metadata = entry.metadata().map_err(std::io::Error::from)?;
        let stat = Stat::from(&metadata);
        if !metadata.is_dir() && metadata.nlink() > 1 {
            let inode = (metadata.dev(), metadata.ino());
            if let Some(first) = inodes.get(&inode) {
                listing.insert(
                    relative,
                    FileRecord::Alias {
                        target: first.clone(),
                    },
                );
                continue;
            }
            inodes.insert(inode, relative.clone());
        }
        let file_type = metadata.file_type();
        let record = if file_type.is_dir() {
            FileRecord::Directory(stat)
        } else if file_type.is_symlink() {
            let target = std::fs::read_link(entry.path())?;
            let Some(target) = target.to_str() else {
                event!(Level::WARN, "skipping {relative}: link target is not valid UTF-8");
                continue;
            };
            FileRecord::Symlink {
                stat,
                target: target.to_string(),
            }
        } else if file_type.is_file() {
            FileRecord::Regular(stat)
        } else {
            event!(Level::DEBUG, "skipping special file {relative}");
            continue;
        };
        listing.insert(relative, record);
    }
    event!(Level::DEBUG, "enumerated {} entries", listing.len());
    Ok(listing)
}
