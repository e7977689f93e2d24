//! Run configuration shared by the agents
//!
//! [`Options`] is created once by the invoker, handed to the destination agent in
//! response to `getOptions`, and forwarded as command-line arguments to the agent
//! started by a relay.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use crate::error::SyncError;
use crate::filter::FilterSettings;

/// Smallest accepted volume-based progress interval (bytes).
pub const MINIMUM_VOLUME_INTERVAL: u64 = 1024 * 1024;
/// Smallest accepted time-based progress interval (seconds).
pub const MINIMUM_TIME_INTERVAL_SECS: u64 = 10;

const NUMBER_SCALES: [(char, u64); 4] = [
    ('K', 1024),
    ('M', 1024 * 1024),
    ('G', 1024 * 1024 * 1024),
    ('T', 1024 * 1024 * 1024 * 1024),
];

/// Volume of processed data between two progress reports.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum ProgressVolume {
    Bytes(u64),
    /// Percentage of the total number of bytes expected to be processed.
    Percent(f64),
}

impl ProgressVolume {
    /// Parses `--progress-bytes`: an integer byte count, a percentage (`5%`) or a
    /// number with a binary-scale suffix (`1.5G`).
    pub fn parse(value: &str) -> Result<Self, SyncError> {
        let value = value.trim();
        let unsupported = || SyncError::config(format!("--progress-bytes value {value:?} is not supported"));
        let last = value.chars().last().ok_or_else(unsupported)?;
        let number = &value[..value.len() - last.len_utf8()];
        if last == '%' {
            let percent: f64 = number.parse().map_err(|_| unsupported())?;
            if !(percent > 0.0 && percent <= 100.0) {
                return Err(SyncError::config(format!(
                    "--progress-bytes percentage must be within (0, 100], got {value:?}"
                )));
            }
            return Ok(ProgressVolume::Percent(percent));
        }
        let bytes = match NUMBER_SCALES
            .iter()
            .find(|(suffix, _)| *suffix == last.to_ascii_uppercase())
        {
            Some((_, scale)) => {
                let amount: f64 = number.parse().map_err(|_| unsupported())?;
                if !amount.is_finite() || amount < 0.0 {
                    return Err(unsupported());
                }
                (amount * *scale as f64) as u64
            }
            None => value.parse::<u64>().map_err(|_| unsupported())?,
        };
        if bytes < MINIMUM_VOLUME_INTERVAL {
            return Err(SyncError::config(format!(
                "--progress-bytes value must be at least {MINIMUM_VOLUME_INTERVAL}, got {value:?}"
            )));
        }
        Ok(ProgressVolume::Bytes(bytes))
    }

    /// Turns the threshold into a byte count given the total volume of the run.
    #[must_use]
    pub fn resolve(&self, total_bytes: u64) -> u64 {
        match self {
            ProgressVolume::Bytes(bytes) => *bytes,
            ProgressVolume::Percent(percent) => {
                ((total_bytes as f64 * percent / 100.0) as u64).max(1)
            }
        }
    }

    fn to_arg(&self) -> String {
        match self {
            ProgressVolume::Bytes(bytes) => bytes.to_string(),
            ProgressVolume::Percent(percent) => format!("{percent}%"),
        }
    }
}

/// Parses `--progress-time` (minutes, fractional allowed) into whole seconds.
pub fn parse_progress_time(minutes: &str) -> Result<u64, SyncError> {
    let parsed: f64 = minutes.trim().parse().map_err(|_| {
        SyncError::config(format!("--progress-time value {minutes:?} is not supported"))
    })?;
    if !parsed.is_finite() || parsed < 0.0 {
        return Err(SyncError::config(format!(
            "--progress-time value {minutes:?} is not supported"
        )));
    }
    let seconds = (parsed * 60.0).round() as u64;
    if seconds < MINIMUM_TIME_INTERVAL_SECS {
        return Err(SyncError::config(format!(
            "--progress-time value must be at least {:.3} minutes",
            MINIMUM_TIME_INTERVAL_SECS as f64 / 60.0
        )));
    }
    Ok(seconds)
}

/// Normalizes an exclude/include entry to the `./`-rooted form used in listings.
///
/// Absolute paths are rejected: entries are always relative to the sync root.
pub fn normalize_filter_entry(flag: &str, name: &str) -> Result<String, SyncError> {
    if name.is_empty() {
        return Err(SyncError::config(format!("empty path given to {flag}")));
    }
    if name.starts_with('/') {
        return Err(SyncError::config(format!(
            "please do not use an absolute path with {flag}: {name:?}"
        )));
    }
    let trimmed = name.trim_end_matches('/');
    let relative = trimmed.strip_prefix("./").unwrap_or(trimmed);
    if relative.is_empty() || relative == "." {
        return Err(SyncError::config(format!(
            "{flag} entry {name:?} names the sync root itself"
        )));
    }
    Ok(format!("./{relative}"))
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Options {
    pub verbose: u8,
    pub compress: bool,
    pub dry_run: bool,
    /// Skip the post-transfer digest check.
    pub insecure: bool,
    /// Remove destination entries that do not exist at the source.
    pub delete: bool,
    pub exclude: BTreeSet<String>,
    pub include: BTreeSet<String>,
    pub progress_bytes: Option<ProgressVolume>,
    /// Seconds between time-based progress reports.
    pub progress_time: Option<u64>,
    /// Extra arguments passed verbatim to the remote shell.
    pub ssh_args: Vec<String>,
    /// The agent runs behind a relay and reports status on stdout.
    pub proxy: bool,
    pub progress_timestamp: bool,
    pub send_progress: bool,
    pub send_raw_progress: bool,
    /// Address of the destination host as resolved by the source side; the
    /// destination agent advertises its data channel on it.
    pub dest_addr: Option<std::net::IpAddr>,
}

impl Options {
    pub fn add_exclude(&mut self, name: &str) -> Result<(), SyncError> {
        self.exclude.insert(normalize_filter_entry("--exclude", name)?);
        Ok(())
    }

    pub fn add_include(&mut self, name: &str) -> Result<(), SyncError> {
        self.include.insert(normalize_filter_entry("--include", name)?);
        Ok(())
    }

    #[must_use]
    pub fn filter(&self) -> FilterSettings {
        FilterSettings {
            excludes: self.exclude.clone(),
            includes: self.include.clone(),
        }
    }

    /// Arguments reproducing these options for an agent started behind a relay.
    ///
    /// Relay-specific flags (`--proxy`, `--omit-progress-timestamp`) are added by
    /// the relay itself.
    #[must_use]
    pub fn to_args(&self) -> Vec<String> {
        let mut args = Vec::new();
        if self.verbose > 0 {
            args.push(format!("-{}", "v".repeat(self.verbose as usize)));
        }
        if self.compress {
            args.push("--compress".to_string());
        }
        if self.dry_run {
            args.push("--dry-run".to_string());
        }
        if self.insecure {
            args.push("--insecure".to_string());
        }
        if self.delete {
            args.push("--delete".to_string());
        }
        for name in &self.exclude {
            args.push(format!("--exclude={name}"));
        }
        for name in &self.include {
            args.push(format!("--include={name}"));
        }
        if let Some(volume) = &self.progress_bytes {
            args.push(format!("--progress-bytes={}", volume.to_arg()));
        }
        if let Some(seconds) = self.progress_time {
            args.push(format!("--progress-time={}", seconds as f64 / 60.0));
        }
        for arg in &self.ssh_args {
            args.push(format!("--ssharg={arg}"));
        }
        args
    }
}
