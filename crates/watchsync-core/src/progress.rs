use std::collections::HashMap;
use std::time::Instant;
use tracing::{info, warn};

/// Per-user progress over a batch of records.
///
/// Logs a progress line every `interval` records and a summary at the end,
/// so large libraries do not produce one log line per item.
pub struct ProgressTracker {
    label: String,
    total: usize,
    applied: usize,
    unchanged: usize,
    failed: usize,
    skipped: usize,
    start_time: Instant,
    interval: usize,
    last_logged: usize,
    error_counts: HashMap<String, usize>,
}

impl ProgressTracker {
    pub fn new(label: impl Into<String>, total: usize, interval: usize) -> Self {
        let label = label.into();
        if total > 10 {
            info!("{}: {} items to process", label, total);
        }
        Self {
            label,
            total,
            applied: 0,
            unchanged: 0,
            failed: 0,
            skipped: 0,
            start_time: Instant::now(),
            interval: interval.max(1),
            last_logged: 0,
            error_counts: HashMap::new(),
        }
    }

    pub fn record_applied(&mut self) {
        self.applied += 1;
    }

    pub fn record_unchanged(&mut self) {
        self.unchanged += 1;
    }

    /// A failure, grouped by `category` in the summary.
    pub fn record_failed(&mut self, category: &str) {
        self.failed += 1;
        *self.error_counts.entry(category.to_string()).or_insert(0) += 1;
    }

    pub fn record_skipped(&mut self) {
        self.skipped += 1;
    }

    pub fn processed(&self) -> usize {
        self.applied + self.unchanged + self.failed + self.skipped
    }

    /// Call after each record.
    pub fn log_progress(&mut self) {
        let current = self.processed();
        if current - self.last_logged < self.interval && current != self.total {
            return;
        }
        let elapsed = self.start_time.elapsed().as_secs_f64();
        // Fast batches (mostly unchanged items) are not worth a line
        if elapsed < 0.5 && current < self.total {
            return;
        }
        let rate = if elapsed > 0.0 { current as f64 / elapsed } else { 0.0 };
        info!(
            "{}: {}/{} ({:.1} items/sec) | Applied: {} | Unchanged: {} | Failed: {} | Skipped: {}",
            self.label, current, self.total, rate, self.applied, self.unchanged, self.failed, self.skipped
        );
        self.last_logged = current;
    }

    pub fn log_summary(&self) {
        let elapsed = self.start_time.elapsed().as_secs_f64();
        if self.failed > 0 {
            warn!(
                "{} completed: {} total in {:.1}s | Applied: {} | Unchanged: {} | Failed: {} | Skipped: {}",
                self.label, self.total, elapsed, self.applied, self.unchanged, self.failed, self.skipped
            );
            let mut entries: Vec<_> = self.error_counts.iter().collect();
            entries.sort_by(|a, b| b.1.cmp(a.1).then_with(|| a.0.cmp(b.0)));
            let breakdown: Vec<String> = entries
                .iter()
                .map(|(category, count)| format!("{}: {}", category, count))
                .collect();
            info!("Error breakdown: {}", breakdown.join(", "));
        } else if elapsed > 0.1 || self.skipped > 0 {
            info!(
                "{} completed: {} total in {:.1}s | Applied: {} | Unchanged: {} | Skipped: {}",
                self.label, self.total, elapsed, self.applied, self.unchanged, self.skipped
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counts() {
        let mut tracker = ProgressTracker::new("alice", 4, 2);
        tracker.record_applied();
        tracker.record_unchanged();
        tracker.record_failed("not found");
        tracker.record_skipped();
        tracker.log_progress();
        tracker.log_summary();
        assert_eq!(tracker.processed(), 4);
        assert_eq!(tracker.error_counts["not found"], 1);
    }
}
