//! Engine counters and the Prometheus text exposition.

use std::fmt::Write;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::Serialize;

/// Upper bounds, in seconds, of the step run-duration histogram.
pub const DURATION_BUCKETS: [f64; 10] = [0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 15.0, 60.0, 300.0];

#[derive(Debug, Default)]
pub struct Counter(AtomicU64);

impl Counter {
    pub fn inc(&self) {
        self.add(1);
    }

    pub fn add(&self, n: u64) {
        self.0.fetch_add(n, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

#[derive(Debug)]
pub struct DurationHistogram {
    buckets: [AtomicU64; DURATION_BUCKETS.len()],
    count: AtomicU64,
    sum_micros: AtomicU64,
}

impl Default for DurationHistogram {
    fn default() -> Self {
        Self {
            buckets: std::array::from_fn(|_| AtomicU64::new(0)),
            count: AtomicU64::new(0),
            sum_micros: AtomicU64::new(0),
        }
    }
}

impl DurationHistogram {
    pub fn observe(&self, duration: Duration) {
        let seconds = duration.as_secs_f64();
        for (bound, bucket) in DURATION_BUCKETS.iter().zip(&self.buckets) {
            if seconds <= *bound {
                bucket.fetch_add(1, Ordering::Relaxed);
            }
        }
        let micros = u64::try_from(duration.as_micros()).unwrap_or(u64::MAX);
        self.sum_micros.fetch_add(micros, Ordering::Relaxed);
        self.count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    pub fn sum_seconds(&self) -> f64 {
        self.sum_micros.load(Ordering::Relaxed) as f64 / 1_000_000.0
    }

    /// Cumulative bucket counts, one per entry of [`DURATION_BUCKETS`].
    pub fn cumulative(&self) -> Vec<u64> {
        self.buckets.iter().map(|bucket| bucket.load(Ordering::Relaxed)).collect()
    }
}

#[derive(Debug, Default)]
pub struct EngineMetrics {
    pub steps_enqueued: Counter,
    pub steps_dequeued: Counter,
    pub steps_finished: Counter,
    pub steps_failed: Counter,
    pub steps_reclaimed: Counter,
    pub heartbeats: Counter,
    pub store_conflicts: Counter,
    pub step_duration: DurationHistogram,
}

/// Point-in-time step counts summed over every task aggregate.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct StepGauges {
    pub queued: u64,
    pub running: u64,
    pub done: u64,
    pub failed: u64,
}

impl EngineMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn render_prometheus(&self, gauges: &StepGauges) -> String {
        let mut out = String::new();
        let counters = [
            ("stepledger_steps_enqueued_total", "Steps persisted as pending.", &self.steps_enqueued),
            ("stepledger_steps_dequeued_total", "Steps claimed by a worker.", &self.steps_dequeued),
            ("stepledger_steps_finished_total", "Steps marked done.", &self.steps_finished),
            ("stepledger_steps_failed_total", "Steps marked failed.", &self.steps_failed),
            (
                "stepledger_steps_reclaimed_total",
                "Running steps returned to pending after lease expiry.",
                &self.steps_reclaimed,
            ),
            ("stepledger_heartbeats_total", "Accepted lease heartbeats.", &self.heartbeats),
            (
                "stepledger_store_conflicts_total",
                "Store transactions retried after a write conflict.",
                &self.store_conflicts,
            ),
        ];
        for (name, help, counter) in counters {
            let _ = writeln!(out, "# HELP {name} {help}");
            let _ = writeln!(out, "# TYPE {name} counter");
            let _ = writeln!(out, "{name} {}", counter.get());
        }

        let _ = writeln!(out, "# HELP stepledger_steps Steps by current status.");
        let _ = writeln!(out, "# TYPE stepledger_steps gauge");
        for (status, value) in [
            ("pending", gauges.queued),
            ("running", gauges.running),
            ("done", gauges.done),
            ("failed", gauges.failed),
        ] {
            let _ = writeln!(out, "stepledger_steps{{status=\"{status}\"}} {value}");
        }

        let name = "stepledger_step_duration_seconds";
        let _ = writeln!(out, "# HELP {name} Step run time from claim to terminal state.");
        let _ = writeln!(out, "# TYPE {name} histogram");
        for (bound, count) in DURATION_BUCKETS.iter().zip(self.step_duration.cumulative()) {
            let _ = writeln!(out, "{name}_bucket{{le=\"{bound}\"}} {count}");
        }
        let _ = writeln!(out, "{name}_bucket{{le=\"+Inf\"}} {}", self.step_duration.count());
        let _ = writeln!(out, "{name}_sum {}", self.step_duration.sum_seconds());
        let _ = writeln!(out, "{name}_count {}", self.step_duration.count());
        out
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::{EngineMetrics, StepGauges};

    #[test]
    fn histogram_buckets_are_cumulative() {
        let metrics = EngineMetrics::new();
        metrics.step_duration.observe(Duration::from_millis(30));
        metrics.step_duration.observe(Duration::from_secs(2));

        let buckets = metrics.step_duration.cumulative();
        assert_eq!(buckets[0], 1, "0.05s bucket");
        assert_eq!(buckets[5], 2, "2.5s bucket");
        assert_eq!(metrics.step_duration.count(), 2);
        assert!((metrics.step_duration.sum_seconds() - 2.03).abs() < 1e-9);
    }

    #[test]
    fn exposition_contains_counters_gauges_and_histogram() {
        let metrics = EngineMetrics::new();
        metrics.steps_enqueued.add(3);
        metrics.steps_reclaimed.inc();

        let text = metrics.render_prometheus(&StepGauges { queued: 2, running: 1, done: 0, failed: 0 });
        assert!(text.contains("# TYPE stepledger_steps_enqueued_total counter"));
        assert!(text.contains("stepledger_steps_enqueued_total 3"));
        assert!(text.contains("stepledger_steps_reclaimed_total 1"));
        assert!(text.contains("stepledger_steps{status=\"pending\"} 2"));
        assert!(text.contains("stepledger_step_duration_seconds_bucket{le=\"+Inf\"} 0"));
    }
}
