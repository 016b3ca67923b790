//! Throughput and ETA sampling for in-flight transfers.

use std::time::{Duration, Instant};

use serde::Serialize;

/// Shortest interval between throughput samples. Differences over shorter
/// windows are too noisy to report.
pub const SAMPLE_FLOOR: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Send,
    Receive,
}

#[derive(Debug, Clone, Serialize)]
pub struct ProgressReport {
    #[serde(rename = "fileId")]
    pub file_id: String,
    pub direction: Direction,
    #[serde(rename = "bytesTransferred")]
    pub bytes_transferred: u64,
    #[serde(rename = "bytesTotal")]
    pub bytes_total: u64,
    /// Instantaneous throughput in bytes per second; absent until the first
    /// full sampling window has elapsed.
    #[serde(rename = "throughputBps")]
    pub throughput_bps: Option<u64>,
    /// Remaining seconds at the current rate; undefined at zero throughput.
    #[serde(rename = "etaSecs")]
    pub eta_secs: Option<u64>,
}

/// Tracks cumulative bytes for one file and emits rate-limited reports.
pub struct ProgressTracker {
    file_id: String,
    direction: Direction,
    total: u64,
    transferred: u64,
    window_started: Instant,
    window_bytes: u64,
    throughput_bps: Option<u64>,
}

impl ProgressTracker {
    pub fn new(file_id: String, direction: Direction, total: u64) -> Self {
        Self {
            file_id,
            direction,
            total,
            transferred: 0,
            window_started: Instant::now(),
            window_bytes: 0,
            throughput_bps: None,
        }
    }

    pub fn transferred(&self) -> u64 {
        self.transferred
    }

    /// Account `delta` bytes. Returns a report when at least one sampling
    /// window has passed since the previous one, otherwise `None`.
    pub fn record(&mut self, delta: u64) -> Option<ProgressReport> {
        self.transferred += delta;
        self.window_bytes += delta;
        let elapsed = self.window_started.elapsed();
        if elapsed < SAMPLE_FLOOR {
            return None;
        }
        let rate = (self.window_bytes as f64 / elapsed.as_secs_f64()) as u64;
        self.throughput_bps = Some(rate);
        self.window_started = Instant::now();
        self.window_bytes = 0;
        Some(self.report())
    }

    /// Final report regardless of sampling cadence.
    pub fn report(&self) -> ProgressReport {
        let remaining = self.total.saturating_sub(self.transferred);
        let eta_secs = match self.throughput_bps {
            Some(rate) if rate > 0 => Some(remaining / rate),
            _ => None,
        };
        ProgressReport {
            file_id: self.file_id.clone(),
            direction: self.direction,
            bytes_transferred: self.transferred,
            bytes_total: self.total,
            throughput_bps: self.throughput_bps,
            eta_secs,
        }
    }
}
