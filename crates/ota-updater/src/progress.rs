//! Download progress throttling.

use std::time::{Duration, Instant};

use crate::backend::FileInfo;

/// Minimum number of downloaded bytes between two progress reports.
pub const PROGRESS_REPORT_BYTES: u64 = 50_000;
/// Maximum time between two progress reports.
pub const PROGRESS_REPORT_INTERVAL: Duration = Duration::from_secs(5);

/// Tracks downloaded bytes and decides when a progress report is due.
#[derive(Debug, Clone)]
pub struct ProgressTracker {
    total_bytes: Option<u64>,
    downloaded: u64,
    last_reported_bytes: u64,
    last_reported_at: Option<Instant>,
}

impl ProgressTracker {
    /// `total_bytes` is the archive size when known (e.g. from Content-Length).
    pub fn new(total_bytes: Option<u64>) -> Self {
        Self {
            total_bytes: total_bytes.filter(|&t| t > 0),
            downloaded: 0,
            last_reported_bytes: 0,
            last_reported_at: None,
        }
    }

    pub fn record_download(&mut self, bytes: usize) {
        self.downloaded += bytes as u64;
    }

    pub fn downloaded(&self) -> u64 {
        self.downloaded
    }

    /// Make the next check report unconditionally (new entry).
    pub fn reset_for_entry(&mut self) {
        self.last_reported_bytes = 0;
    }

    pub fn should_report_at(&self, now: Instant) -> bool {
        self.last_reported_bytes == 0
            || self.downloaded.saturating_sub(self.last_reported_bytes) >= PROGRESS_REPORT_BYTES
            || self
                .last_reported_at
                .map_or(true, |at| now.duration_since(at) > PROGRESS_REPORT_INTERVAL)
    }

    pub fn mark_reported_at(&mut self, now: Instant) {
        self.last_reported_bytes = self.downloaded;
        self.last_reported_at = Some(now);
    }

    /// Overall completion, if the archive size is known.
    pub fn percent(&self) -> Option<f64> {
        self.total_bytes
            .map(|total| self.downloaded as f64 * 100.0 / total as f64)
    }

    pub fn message(&self, entry: &FileInfo) -> String {
        match self.percent() {
            Some(pct) => format!(
                "{:.2}% total, {} {} of {}",
                pct, entry.name, entry.processed, entry.size
            ),
            None => format!("{} {} of {}", entry.name, entry.processed, entry.size),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry() -> FileInfo {
        FileInfo {
            name: "fw.bin".to_string(),
            size: 200,
            processed: 50,
        }
    }

    #[test]
    fn test_first_report_is_always_due() {
        let tracker = ProgressTracker::new(None);
        assert!(tracker.should_report_at(Instant::now()));
    }

    #[test]
    fn test_byte_threshold() {
        let now = Instant::now();
        let mut tracker = ProgressTracker::new(None);
        tracker.record_download(100);
        tracker.mark_reported_at(now);
        assert!(!tracker.should_report_at(now));

        tracker.record_download(PROGRESS_REPORT_BYTES as usize - 1);
        assert!(!tracker.should_report_at(now));
        tracker.record_download(1);
        assert!(tracker.should_report_at(now));
    }

    #[test]
    fn test_time_threshold() {
        let start = Instant::now();
        let mut tracker = ProgressTracker::new(None);
        tracker.record_download(10);
        tracker.mark_reported_at(start);
        assert!(!tracker.should_report_at(start + PROGRESS_REPORT_INTERVAL));
        assert!(tracker.should_report_at(start + PROGRESS_REPORT_INTERVAL + Duration::from_millis(1)));
    }

    #[test]
    fn test_reset_for_entry() {
        let now = Instant::now();
        let mut tracker = ProgressTracker::new(None);
        tracker.record_download(10);
        tracker.mark_reported_at(now);
        tracker.reset_for_entry();
        assert!(tracker.should_report_at(now));
    }

    #[test]
    fn test_messages() {
        let mut tracker = ProgressTracker::new(None);
        assert_eq!(tracker.message(&entry()), "fw.bin 50 of 200");

        tracker = ProgressTracker::new(Some(400));
        tracker.record_download(100);
        assert_eq!(tracker.message(&entry()), "25.00% total, fw.bin 50 of 200");
    }

    #[test]
    fn test_zero_total_is_unknown() {
        let tracker = ProgressTracker::new(Some(0));
        assert!(tracker.percent().is_none());
    }
}
