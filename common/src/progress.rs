//! Progress accounting for a synchronization run
//!
//! [`SyncProgress`] accumulates counters while the destination agent applies a
//! diff and decides when the next report is due. Reports are plain
//! [`ProgressUpdate`] values; they are rendered to text with
//! [`ProgressUpdate::message`] or forwarded as-is.

use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant, SystemTime};
use tracing::{event, Level};

use crate::options::Options;

/// Reporting interval used when progress is requested without any threshold.
pub const DEFAULT_TIME_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ProgressUpdate {
    pub observed_at: SystemTime,
    pub bytes_processed: u64,
    pub bytes_total: u64,
    pub files_processed: u64,
    pub files_total: u64,
    pub bytes_transferred: u64,
    pub files_transferred: u64,
    /// Last report of the run.
    pub done: bool,
}

impl ProgressUpdate {
    #[must_use]
    pub fn percent(&self) -> f64 {
        if self.bytes_total == 0 {
            100.0
        } else {
            self.bytes_processed as f64 * 100.0 / self.bytes_total as f64
        }
    }

    /// `[<timestamp> ]<processed>/<total> (<pct>%) bytes, <n>/<m> files, <transferred> transferred`
    #[must_use]
    pub fn message(&self, with_timestamp: bool) -> String {
        let prefix = if with_timestamp {
            let observed: chrono::DateTime<chrono::Local> = self.observed_at.into();
            format!("{} ", observed.format("%Y-%m-%d %H:%M:%S"))
        } else {
            String::new()
        };
        format!(
            "{prefix}{}/{} ({:.1}%) bytes, {}/{} files, {} transferred",
            self.bytes_processed,
            self.bytes_total,
            self.percent(),
            self.files_processed,
            self.files_total,
            bytesize::ByteSize(self.bytes_transferred),
        )
    }
}

#[derive(Debug)]
pub struct SyncProgress {
    volume_interval: Option<u64>,
    time_interval: Option<Duration>,
    bytes_total: u64,
    files_total: u64,
    bytes_processed: u64,
    files_processed: u64,
    bytes_transferred: u64,
    files_transferred: u64,
    last_bytes: u64,
    last_report: Instant,
}

impl SyncProgress {
    /// Thresholds come from `options`; a percentage volume is resolved against
    /// `bytes_total`.
    #[must_use]
    pub fn new(options: &Options, bytes_total: u64, files_total: u64, now: Instant) -> Self {
        let volume_interval = options
            .progress_bytes
            .as_ref()
            .map(|volume| volume.resolve(bytes_total));
        let time_interval = match (options.progress_time, volume_interval) {
            (Some(seconds), _) => Some(Duration::from_secs(seconds)),
            (None, None) => Some(DEFAULT_TIME_INTERVAL),
            (None, Some(_)) => None,
        };
        Self {
            volume_interval,
            time_interval,
            bytes_total,
            files_total,
            bytes_processed: 0,
            files_processed: 0,
            bytes_transferred: 0,
            files_transferred: 0,
            last_bytes: 0,
            last_report: now,
        }
    }

    /// Bytes examined (compared, verified or copied).
    pub fn processed(&mut self, bytes: u64) {
        self.bytes_processed += bytes;
    }

    /// Bytes that actually crossed the data channel.
    pub fn transferred(&mut self, bytes: u64) {
        self.bytes_transferred += bytes;
    }

    pub fn file_done(&mut self, transferred: bool) {
        self.files_processed += 1;
        if transferred {
            self.files_transferred += 1;
        }
    }

    fn snapshot(&self, done: bool) -> ProgressUpdate {
        ProgressUpdate {
            observed_at: SystemTime::now(),
            bytes_processed: self.bytes_processed,
            bytes_total: self.bytes_total,
            files_processed: self.files_processed,
            files_total: self.files_total,
            bytes_transferred: self.bytes_transferred,
            files_transferred: self.files_transferred,
            done,
        }
    }

    /// Returns an update when either threshold was crossed since the previous one.
    pub fn due(&mut self, now: Instant) -> Option<ProgressUpdate> {
        let volume_crossed = self
            .volume_interval
            .is_some_and(|interval| self.bytes_processed - self.last_bytes >= interval);
        let time_crossed = self
            .time_interval
            .is_some_and(|interval| now.duration_since(self.last_report) >= interval);
        if !volume_crossed && !time_crossed {
            return None;
        }
        event!(
            Level::TRACE,
            "progress report due (volume: {volume_crossed}, time: {time_crossed})"
        );
        self.last_bytes = self.bytes_processed;
        self.last_report = now;
        Some(self.snapshot(false))
    }

    #[must_use]
    pub fn finish(&self) -> ProgressUpdate {
        self.snapshot(true)
    }
}
