//! Pipeline metrics for Prometheus
//!
//! Process-global counters updated by the state machine and the import
//! fan-out, exported in the Prometheus text format.

use std::fmt::Write;
use std::sync::OnceLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// Counters for the change aggregation pipeline
#[derive(Debug)]
pub struct PipelineMetrics {
    signals_received: AtomicU64,
    signals_malformed: AtomicU64,
    batches: AtomicU64,
    full_scans: AtomicU64,
    full_scan_failures: AtomicU64,
    runs_dispatched: AtomicU64,
    run_import_failures: AtomicU64,
    orphans_dropped: AtomicU64,
    obsolete_objects: AtomicU64,
    cache_evictions: AtomicU64,
    iteration_failures: AtomicU64,
    /// Gauge
    cached_runs: AtomicU64,
    start_time: Instant,
}

impl Default for PipelineMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl PipelineMetrics {
    #[must_use]
    pub fn new() -> Self {
        Self {
            signals_received: AtomicU64::new(0),
            signals_malformed: AtomicU64::new(0),
            batches: AtomicU64::new(0),
            full_scans: AtomicU64::new(0),
            full_scan_failures: AtomicU64::new(0),
            runs_dispatched: AtomicU64::new(0),
            run_import_failures: AtomicU64::new(0),
            orphans_dropped: AtomicU64::new(0),
            obsolete_objects: AtomicU64::new(0),
            cache_evictions: AtomicU64::new(0),
            iteration_failures: AtomicU64::new(0),
            cached_runs: AtomicU64::new(0),
            start_time: Instant::now(),
        }
    }

    pub fn record_signal(&self) {
        self.signals_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_malformed_signal(&self) {
        self.signals_malformed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_batch(&self) {
        self.batches.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_full_scan(&self, ok: bool) {
        self.full_scans.fetch_add(1, Ordering::Relaxed);
        if !ok {
            self.full_scan_failures.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Record the outcome of one import fan-out
    pub fn record_dispatch(&self, runs: u64, failures: u64) {
        self.runs_dispatched.fetch_add(runs, Ordering::Relaxed);
        self.run_import_failures
            .fetch_add(failures, Ordering::Relaxed);
    }

    pub fn record_orphan(&self) {
        self.orphans_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_obsolete(&self, count: u64) {
        self.obsolete_objects.fetch_add(count, Ordering::Relaxed);
    }

    pub fn record_evictions(&self, count: u64) {
        self.cache_evictions.fetch_add(count, Ordering::Relaxed);
    }

    pub fn record_iteration_failure(&self) {
        self.iteration_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn set_cached_runs(&self, count: u64) {
        self.cached_runs.store(count, Ordering::Relaxed);
    }

    /// Export all metrics in Prometheus text format
    #[must_use]
    pub fn export_prometheus(&self) -> String {
        let mut output = String::with_capacity(2 * 1024);

        counter(
            &mut output,
            "runsync_uptime_seconds",
            "Daemon uptime in seconds",
            self.start_time.elapsed().as_secs(),
        );
        counter(
            &mut output,
            "runsync_signals_received_total",
            "Signals read from the journal",
            self.signals_received.load(Ordering::Relaxed),
        );
        counter(
            &mut output,
            "runsync_signals_malformed_total",
            "Journal entries that did not decode as a signal",
            self.signals_malformed.load(Ordering::Relaxed),
        );
        counter(
            &mut output,
            "runsync_batches_total",
            "Change batches processed",
            self.batches.load(Ordering::Relaxed),
        );
        counter(
            &mut output,
            "runsync_full_scans_total",
            "Full reconciliation passes",
            self.full_scans.load(Ordering::Relaxed),
        );
        counter(
            &mut output,
            "runsync_full_scan_failures_total",
            "Full reconciliation passes that failed",
            self.full_scan_failures.load(Ordering::Relaxed),
        );
        counter(
            &mut output,
            "runsync_runs_dispatched_total",
            "Per-run imports dispatched",
            self.runs_dispatched.load(Ordering::Relaxed),
        );
        counter(
            &mut output,
            "runsync_run_import_failures_total",
            "Per-run imports that failed",
            self.run_import_failures.load(Ordering::Relaxed),
        );
        counter(
            &mut output,
            "runsync_orphans_dropped_total",
            "Data file changes dropped because no run owns them",
            self.orphans_dropped.load(Ordering::Relaxed),
        );
        counter(
            &mut output,
            "runsync_obsolete_objects_total",
            "Indexed objects found without a matching store file",
            self.obsolete_objects.load(Ordering::Relaxed),
        );
        counter(
            &mut output,
            "runsync_run_cache_evictions_total",
            "Run cache entries evicted after their lifetime",
            self.cache_evictions.load(Ordering::Relaxed),
        );
        counter(
            &mut output,
            "runsync_iteration_failures_total",
            "Iterations abandoned on a journal error and retried",
            self.iteration_failures.load(Ordering::Relaxed),
        );

        let _ = writeln!(
            output,
            "# HELP runsync_run_cache_entries Runs currently held in the run cache"
        );
        let _ = writeln!(output, "# TYPE runsync_run_cache_entries gauge");
        let _ = writeln!(
            output,
            "runsync_run_cache_entries {}",
            self.cached_runs.load(Ordering::Relaxed)
        );

        output
    }
}

fn counter(output: &mut String, name: &str, help: &str, value: u64) {
    let _ = writeln!(output, "# HELP {name} {help}");
    let _ = writeln!(output, "# TYPE {name} counter");
    let _ = writeln!(output, "{name} {value}");
}

static PIPELINE_METRICS: OnceLock<PipelineMetrics> = OnceLock::new();

/// Get the global pipeline metrics instance
pub fn pipeline_metrics() -> &'static PipelineMetrics {
    PIPELINE_METRICS.get_or_init(PipelineMetrics::new)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_export_prometheus() {
        let metrics = PipelineMetrics::new();
        metrics.record_signal();
        metrics.record_signal();
        metrics.record_dispatch(3, 1);
        metrics.record_full_scan(false);
        metrics.set_cached_runs(7);
        metrics.record_iteration_failure();

        let text = metrics.export_prometheus();
        assert!(text.contains("runsync_signals_received_total 2"));
        assert!(text.contains("runsync_runs_dispatched_total 3"));
        assert!(text.contains("runsync_run_import_failures_total 1"));
        assert!(text.contains("runsync_full_scan_failures_total 1"));
        assert!(text.contains("runsync_iteration_failures_total 1"));
        assert!(text.contains("# TYPE runsync_run_cache_entries gauge"));
        assert!(text.contains("runsync_run_cache_entries 7"));
    }
}
