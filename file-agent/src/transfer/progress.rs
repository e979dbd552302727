//! Byte-level progress for streamed transfers (remote downloads).

use std::time::{Duration, Instant};

/// How often a long transfer logs its progress
pub const REPORT_INTERVAL: Duration = Duration::from_secs(5);

/// Progress tracker with time-based speed calculation
pub struct ProgressTracker {
    start_time: Instant,
    last_report: Instant,
    /// Expected size, when the peer announced one
    total_bytes: Option<u64>,
    transferred_bytes: u64,
}

impl ProgressTracker {
    pub fn new(total_bytes: Option<u64>) -> Self {
        let now = Instant::now();
        Self {
            start_time: now,
            last_report: now,
            total_bytes,
            transferred_bytes: 0,
        }
    }

    /// Account for `n` more bytes. Returns true when a report is due.
    pub fn advance(&mut self, n: u64) -> bool {
        self.transferred_bytes += n;
        if self.last_report.elapsed() >= REPORT_INTERVAL {
            self.last_report = Instant::now();
            return true;
        }
        false
    }

    pub fn transferred_bytes(&self) -> u64 {
        self.transferred_bytes
    }

    /// Percentage complete, if the total is known
    pub fn percent_complete(&self) -> Option<f64> {
        match self.total_bytes {
            Some(0) | None => None,
            Some(total) => Some((self.transferred_bytes as f64 / total as f64) * 100.0),
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.start_time.elapsed()
    }

    /// Average speed since start
    pub fn average_speed(&self) -> u64 {
        let elapsed = self.elapsed().as_secs_f64();
        if elapsed > 0.0 {
            (self.transferred_bytes as f64 / elapsed) as u64
        } else {
            0
        }
    }

    /// One-line status for logs
    pub fn summary(&self) -> String {
        let done = format_bytes(self.transferred_bytes);
        let speed = format_speed(self.average_speed());
        match (self.total_bytes, self.percent_complete()) {
            (Some(total), Some(pct)) => {
                format!("{} of {} ({:.1}%) at {}", done, format_bytes(total), pct, speed)
            }
            _ => format!("{} at {}", done, speed),
        }
    }
}

/// Format bytes as human-readable string
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];
    let mut size = bytes as f64;
    let mut unit_index = 0;

    while size >= 1024.0 && unit_index < UNITS.len() - 1 {
        size /= 1024.0;
        unit_index += 1;
    }

    format!("{:.2} {}", size, UNITS[unit_index])
}

/// Format speed as human-readable string
pub fn format_speed(bytes_per_second: u64) -> String {
    format!("{}/s", format_bytes(bytes_per_second))
}
