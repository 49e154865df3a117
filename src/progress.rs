//! Pass observers and progress bars.
//!
//! Long passes (reconciliation, fetch dispatch) report their progress to a
//! [`PassObserver`] handed in by the caller. The CLI uses a progress bar,
//! with a log-only mode where the bar is hidden for tail-friendly output.

use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
use std::cell::RefCell;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::info;

/// Global flag for log-only mode (set from args in main)
pub static LOG_ONLY: AtomicBool = AtomicBool::new(false);

/// Set log-only mode globally
pub fn set_log_only(value: bool) {
    LOG_ONLY.store(value, Ordering::Relaxed);
}

/// Check if log-only mode is enabled
pub fn is_log_only() -> bool {
    LOG_ONLY.load(Ordering::Relaxed)
}

/// Format duration in human-readable format
pub fn format_duration(d: Duration) -> String {
    let secs = d.as_secs_f64();
    if secs < 60.0 {
        format!("{:.1}s", secs)
    } else {
        let mins = secs / 60.0;
        format!("{:.1}m", mins)
    }
}

/// Create a progress bar with consistent styling.
/// In log-only mode, the progress bar is hidden.
pub fn create_progress_bar(len: u64, msg: &str) -> ProgressBar {
    let pb = ProgressBar::new(len);
    if is_log_only() {
        pb.set_draw_target(ProgressDrawTarget::hidden());
    } else {
        pb.set_style(
            ProgressStyle::default_bar()
                .template("{msg} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({per_sec}, ETA: {eta})")
                .unwrap_or_else(|_| ProgressStyle::default_bar())
                .progress_chars("=> "),
        );
    }
    pb.set_message(msg.to_string());
    pb
}

/// Log progress periodically for tail-friendly output.
/// Only logs when in log-only mode and at specified intervals.
pub fn log_progress(phase: &str, current: u64, total: u64, interval: u64) {
    if is_log_only() && total > 0 && (current % interval == 0 || current == total) {
        let pct = 100.0 * current as f64 / total as f64;
        info!("[{}] {}/{} ({:.1}%)", phase, current, total, pct);
    }
}

// ============================================================================
// Observers
// ============================================================================

/// Receives progress of a pass over a known number of items.
pub trait PassObserver {
    fn start(&self, phase: &str, total: u64);
    fn step(&self);
    fn finish(&self, summary: &str);
}

/// Ignores everything. For library callers and tests.
pub struct NoopObserver;

impl PassObserver for NoopObserver {
    fn start(&self, _phase: &str, _total: u64) {}
    fn step(&self) {}
    fn finish(&self, _summary: &str) {}
}

/// Drives one progress bar per phase. Passes are single-threaded, so the
/// observer is not `Sync`.
pub struct ProgressObserver {
    current: RefCell<Option<(String, ProgressBar)>>,
    log_interval: u64,
}

impl ProgressObserver {
    pub fn new(log_interval: u64) -> Self {
        Self {
            current: RefCell::new(None),
            log_interval: log_interval.max(1),
        }
    }
}

impl Default for ProgressObserver {
    fn default() -> Self {
        Self::new(50)
    }
}

impl PassObserver for ProgressObserver {
    fn start(&self, phase: &str, total: u64) {
        let pb = create_progress_bar(total, phase);
        *self.current.borrow_mut() = Some((phase.to_string(), pb));
    }

    fn step(&self) {
        if let Some((phase, pb)) = self.current.borrow().as_ref() {
            pb.inc(1);
            log_progress(phase, pb.position(), pb.length().unwrap_or(0), self.log_interval);
        }
    }

    fn finish(&self, summary: &str) {
        let finished = self.current.borrow_mut().take();
        if let Some((_, pb)) = finished {
            pb.finish_with_message(summary.to_string());
        }
    }
}
