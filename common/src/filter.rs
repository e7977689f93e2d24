//! Exact-path include/exclude filtering
//!
//! Entries are `./`-rooted relative paths (see
//! [`normalize_filter_entry`](crate::options::normalize_filter_entry)). A path is
//! matched against an entry when it equals the entry or is nested under it; there is
//! no glob syntax.
//!
//! # Examples
//!
//! ```
//! use common::filter::{FilterResult, FilterSettings};
//!
//! let mut settings = FilterSettings::default();
//! settings.excludes.insert("./a/b".to_string());
//!
//! assert!(matches!(
//!     settings.should_include("./a/b/c.txt"),
//!     FilterResult::ExcludedByPattern(_)
//! ));
//! assert!(settings.should_include("./a/c.txt").is_included());
//! ```

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Result of checking a path against the filter settings
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FilterResult {
    Included,
    /// The include set is non-empty and no include entry covers the path.
    ExcludedByDefault,
    /// The path is, or is nested under, the given exclude entry.
    ExcludedByPattern(String),
}

impl FilterResult {
    #[must_use]
    pub fn is_included(&self) -> bool {
        matches!(self, FilterResult::Included)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilterSettings {
    pub excludes: BTreeSet<String>,
    pub includes: BTreeSet<String>,
}

/// Yields `relative` followed by each of its ancestors, stopping before the root.
pub fn self_and_ancestors(relative: &str) -> impl Iterator<Item = &str> {
    std::iter::successors(Some(relative), |&path| {
        let (parent, _) = path.rsplit_once('/')?;
        (parent != "." && !parent.is_empty()).then_some(parent)
    })
}

impl FilterSettings {
    /// Checks a `./`-rooted relative path.
    ///
    /// Excludes win over includes. With a non-empty include set, directories that
    /// merely lead to an included path are themselves excluded, so callers pruning
    /// on this result never descend into them.
    #[must_use]
    pub fn should_include(&self, relative: &str) -> FilterResult {
        if let Some(entry) =
            self_and_ancestors(relative).find(|path| self.excludes.contains(*path))
        {
            return FilterResult::ExcludedByPattern(entry.to_string());
        }
        if self.includes.is_empty()
            || self_and_ancestors(relative).any(|path| self.includes.contains(path))
        {
            FilterResult::Included
        } else {
            FilterResult::ExcludedByDefault
        }
    }
}
