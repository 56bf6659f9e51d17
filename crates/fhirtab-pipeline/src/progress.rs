//! Progress accounting for a streaming run.

use std::time::Instant;

use tracing::info;

use crate::stream::StreamStats;

/// Tracks throughput over one input file and emits periodic progress
/// events with records-per-second and an estimated time remaining derived
/// from the byte fraction consumed so far.
pub struct ProgressTracker {
    started: Instant,
    file_size: u64,
    bytes_seen: u64,
}

impl ProgressTracker {
    /// Start tracking a file of the given size.
    pub fn new(file_size: u64) -> Self {
        Self {
            started: Instant::now(),
            file_size,
            bytes_seen: 0,
        }
    }

    /// Account bytes consumed from the input.
    pub fn add_bytes(&mut self, bytes: u64) {
        self.bytes_seen += bytes;
    }

    /// Records per second since the start of the run.
    pub fn records_per_sec(&self, records: u64) -> f64 {
        let elapsed = self.started.elapsed().as_secs_f64();
        if elapsed <= 0.0 {
            return 0.0;
        }
        records as f64 / elapsed
    }

    /// Estimated seconds remaining, from the byte fraction consumed.
    /// `None` until any bytes have been seen.
    pub fn eta_seconds(&self) -> Option<f64> {
        if self.bytes_seen == 0 || self.file_size == 0 {
            return None;
        }
        let elapsed = self.started.elapsed().as_secs_f64();
        let remaining = self.file_size.saturating_sub(self.bytes_seen) as f64;
        Some(remaining * elapsed / self.bytes_seen as f64)
    }

    /// Emit a progress event for the current counters.
    pub fn emit(&self, stats: &StreamStats) {
        info!(
            total_records = stats.total_records,
            parsed_records = stats.parsed_records,
            invalid_records = stats.invalid_records,
            records_per_sec = format!("{:.1}", self.records_per_sec(stats.total_records)),
            eta_seconds = self.eta_seconds().map(|eta| format!("{eta:.1}")),
            "progress"
        );
    }
}
