//! Observability metrics for cluster orchestration.
//!
//! Metrics are recorded through the `metrics` crate facade. The library never
//! installs a recorder; the host application chooses an exporter.
//!
//! ## Metrics Exported
//!
//! | Metric | Type | Labels | Description |
//! |--------|------|--------|-------------|
//! | `mb_flow_jobs_total` | Counter | `kind`, `state` | Jobs reaching a terminal state |
//! | `mb_flow_active_jobs` | Gauge | - | Jobs currently running |
//! | `mb_flow_stage_duration_seconds` | Histogram | `kind` | Wall time of one routine stage |
//! | `mb_flow_host_failures_total` | Counter | `group` | Hosts that failed a remote action |
//! | `mb_flow_lock_wait_seconds` | Histogram | `outcome` | Time spent waiting for an environment lock |
//! | `mb_flow_lock_preemptions_total` | Counter | - | Forced lock takeovers |
//!
//! ## Usage
//!
//! ```rust,no_run
//! use mb_flow::metrics::FlowMetrics;
//!
//! let metrics = FlowMetrics::new();
//! metrics.record_job_finished("bootstrap", "SUCCESS");
//! metrics.record_host_failure("app::web");
//! ```

use std::time::{Duration, Instant};

use metrics::{counter, gauge, histogram};

/// Metric names as constants for consistency.
pub mod names {
    /// Counter: Jobs reaching a terminal state.
    pub const JOBS_TOTAL: &str = "mb_flow_jobs_total";
    /// Gauge: Jobs currently running.
    pub const ACTIVE_JOBS: &str = "mb_flow_active_jobs";
    /// Histogram: Stage wall time in seconds.
    pub const STAGE_DURATION_SECONDS: &str = "mb_flow_stage_duration_seconds";
    /// Counter: Hosts that failed a remote action.
    pub const HOST_FAILURES_TOTAL: &str = "mb_flow_host_failures_total";
    /// Histogram: Lock wait time in seconds.
    pub const LOCK_WAIT_SECONDS: &str = "mb_flow_lock_wait_seconds";
    /// Counter: Forced lock takeovers.
    pub const LOCK_PREEMPTIONS_TOTAL: &str = "mb_flow_lock_preemptions_total";
}

/// Label keys used across metrics.
pub mod labels {
    /// Job type (bootstrap, upgrade, provision, destroy).
    pub const KIND: &str = "kind";
    /// Terminal job state.
    pub const STATE: &str = "state";
    /// Node group id.
    pub const GROUP: &str = "group";
    /// Lock wait outcome (granted, timeout, conflict).
    pub const OUTCOME: &str = "outcome";
}

/// High-level interface for recording orchestration metrics.
#[derive(Debug, Clone, Copy, Default)]
pub struct FlowMetrics;

impl FlowMetrics {
    /// Creates a new metrics recorder.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Records a job reaching a terminal state.
    pub fn record_job_finished(&self, kind: &str, state: &str) {
        counter!(
            names::JOBS_TOTAL,
            labels::KIND => kind.to_string(),
            labels::STATE => state.to_string(),
        )
        .increment(1);
    }

    /// Marks a job as started.
    pub fn job_started(&self) {
        gauge!(names::ACTIVE_JOBS).increment(1.0);
    }

    /// Marks a running job as finished.
    pub fn job_stopped(&self) {
        gauge!(names::ACTIVE_JOBS).decrement(1.0);
    }

    /// Records the wall time of one stage.
    pub fn observe_stage_duration(&self, kind: &str, duration: Duration) {
        histogram!(
            names::STAGE_DURATION_SECONDS,
            labels::KIND => kind.to_string(),
        )
        .record(duration.as_secs_f64());
    }

    /// Records one failed host.
    pub fn record_host_failure(&self, group: &str) {
        counter!(
            names::HOST_FAILURES_TOTAL,
            labels::GROUP => group.to_string(),
        )
        .increment(1);
    }

    /// Records time spent waiting for an environment lock.
    pub fn observe_lock_wait(&self, outcome: &'static str, duration: Duration) {
        histogram!(
            names::LOCK_WAIT_SECONDS,
            labels::OUTCOME => outcome,
        )
        .record(duration.as_secs_f64());
    }

    /// Records a forced lock takeover.
    pub fn record_lock_preemption(&self) {
        counter!(names::LOCK_PREEMPTIONS_TOTAL).increment(1);
    }
}

/// RAII guard for timing operations.
///
/// Calls its callback with the elapsed duration when dropped, so early
/// returns are timed too.
pub struct TimingGuard<F>
where
    F: FnOnce(Duration),
{
    start: Instant,
    on_drop: Option<F>,
}

impl<F> TimingGuard<F>
where
    F: FnOnce(Duration),
{
    /// Creates a guard that reports to `on_drop`.
    pub fn new(on_drop: F) -> Self {
        Self {
            start: Instant::now(),
            on_drop: Some(on_drop),
        }
    }

    /// Returns the elapsed time since the guard was created.
    #[must_use]
    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }
}

impl<F> Drop for TimingGuard<F>
where
    F: FnOnce(Duration),
{
    fn drop(&mut self) {
        if let Some(f) = self.on_drop.take() {
            f(self.start.elapsed());
        }
    }
}

/// Creates a timing guard that records one stage's duration.
#[must_use]
pub fn time_stage(kind: &'static str) -> TimingGuard<impl FnOnce(Duration)> {
    TimingGuard::new(move |duration| FlowMetrics::new().observe_stage_duration(kind, duration))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn records_without_a_recorder_installed() {
        let metrics = FlowMetrics::new();
        metrics.record_job_finished("bootstrap", "SUCCESS");
        metrics.job_started();
        metrics.job_stopped();
        metrics.record_host_failure("app::web");
        metrics.observe_lock_wait("granted", Duration::from_millis(3));
        metrics.record_lock_preemption();
    }

    #[test]
    fn timing_guard_reports_on_drop() {
        let mut recorded = None;
        {
            let _guard = TimingGuard::new(|d| recorded = Some(d));
            std::thread::sleep(Duration::from_millis(5));
        }
        assert!(recorded.is_some_and(|d| d >= Duration::from_millis(5)));
    }

    #[test]
    fn stage_timer_records() {
        let guard = time_stage("bootstrap");
        assert!(guard.elapsed() < Duration::from_secs(60));
    }
}
