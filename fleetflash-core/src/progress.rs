//! Progress reporting for long-running stages.
//!
//! A stage drives a [`ProgressTracker`] with byte counts; the tracker turns
//! them into percentages and forwards them to the caller's
//! [`ProgressReporter`]. Each run ends with exactly one call to
//! [`ProgressReporter::finish`].
use std::time::{Duration, Instant};

/// Receives progress for one stage of a run.
///
/// Percentages are in `0.0..=100.0` and rounded to two decimal places.
pub trait ProgressReporter {
    /// Called once before any progress, with the number of bytes expected.
    fn start(&mut self, _total_bytes: u64) {}

    fn progress(&mut self, percentage: f64);

    /// Terminal signal. `success` is `false` if the stage failed.
    fn finish(&mut self, _success: bool) {}
}

/// A reporter that discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoProgress;

impl ProgressReporter for NoProgress {
    fn progress(&mut self, _percentage: f64) {}
}

/// Converts a byte count into a percentage of `total`, rounded to two
/// decimals and clamped to 100.
pub fn percentage(done: u64, total: u64) -> f64 {
    if total == 0 {
        return 0.0;
    }
    let pct = (done as f64 / total as f64 * 100.0).min(100.0);
    (pct * 100.0).round() / 100.0
}

/// Tracks bytes transferred for one stage and samples them into a reporter.
///
/// Progress is forwarded at most once per `interval`. The tracker is consumed
/// by [`complete`](Self::complete) or [`fail`](Self::fail); dropping it
/// without either reports a failure.
pub struct ProgressTracker<'a> {
    reporter: &'a mut dyn ProgressReporter,
    total: u64,
    done: u64,
    interval: Duration,
    last_report: Option<Instant>,
    finished: bool,
}

impl<'a> ProgressTracker<'a> {
    pub fn start(reporter: &'a mut dyn ProgressReporter, total: u64, interval: Duration) -> Self {
        reporter.start(total);
        reporter.progress(0.0);
        Self {
            reporter,
            total,
            done: 0,
            interval,
            last_report: None,
            finished: false,
        }
    }

    pub fn advance(&mut self, bytes: u64) {
        self.done += bytes;

        let due = match self.last_report {
            Some(at) => at.elapsed() >= self.interval,
            None => true,
        };
        if due {
            self.reporter.progress(percentage(self.done, self.total));
            self.last_report = Some(Instant::now());
        }
    }

    /// Bytes seen so far.
    pub fn position(&self) -> u64 {
        self.done
    }

    /// Forces the indicator to 100 and signals success.
    pub fn complete(mut self) {
        self.reporter.progress(100.0);
        self.reporter.finish(true);
        self.finished = true;
    }

    pub fn fail(mut self) {
        self.reporter.finish(false);
        self.finished = true;
    }
}

impl Drop for ProgressTracker<'_> {
    fn drop(&mut self) {
        if !self.finished {
            self.reporter.finish(false);
        }
    }
}
