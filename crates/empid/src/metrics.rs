//! Prometheus metrics for the matching worker.

use prometheus_client::encoding::text::encode;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::metrics::histogram::{exponential_buckets, Histogram};
use prometheus_client::registry::Registry;
use std::sync::Arc;

#[derive(Clone)]
pub struct MatcherMetrics {
    pub jobs_succeeded: Counter,
    pub jobs_failed: Counter,
    pub active_job: Gauge,
    pub job_duration_seconds: Histogram,
    pub registry: Arc<Registry>,
}

impl MatcherMetrics {
    pub fn new() -> Self {
        let mut registry = Registry::default();

        let jobs_succeeded = Counter::default();
        registry.register(
            "empi_matcher_jobs_succeeded",
            "Matching jobs that completed successfully",
            jobs_succeeded.clone(),
        );

        let jobs_failed = Counter::default();
        registry.register(
            "empi_matcher_jobs_failed",
            "Matching jobs that terminated in failure",
            jobs_failed.clone(),
        );

        let active_job = Gauge::default();
        registry.register(
            "empi_matcher_active_job",
            "Whether a matching job is currently being processed",
            active_job.clone(),
        );

        // Batch jobs range from seconds to tens of minutes.
        let job_duration_seconds = Histogram::new(exponential_buckets(1.0, 2.0, 12));
        registry.register(
            "empi_matcher_job_duration_seconds",
            "Wall-clock duration of matching jobs",
            job_duration_seconds.clone(),
        );

        Self {
            jobs_succeeded,
            jobs_failed,
            active_job,
            job_duration_seconds,
            registry: Arc::new(registry),
        }
    }

    /// Encode all metrics as Prometheus text format.
    pub fn encode(&self) -> String {
        let mut buf = String::new();
        encode(&mut buf, &self.registry).unwrap();
        buf
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_creates_all_metrics() {
        let metrics = MatcherMetrics::new();
        let output = metrics.encode();

        assert!(output.contains("empi_matcher_jobs_succeeded"));
        assert!(output.contains("empi_matcher_jobs_failed"));
        assert!(output.contains("empi_matcher_active_job"));
        assert!(output.contains("empi_matcher_job_duration_seconds"));
    }

    #[test]
    fn counters_reflect_increments() {
        let metrics = MatcherMetrics::new();
        metrics.jobs_succeeded.inc();
        metrics.jobs_succeeded.inc();
        metrics.jobs_failed.inc();

        let output = metrics.encode();
        assert!(output.contains("empi_matcher_jobs_succeeded_total 2"));
        assert!(output.contains("empi_matcher_jobs_failed_total 1"));
    }

    #[test]
    fn gauge_set_reflected_in_encode() {
        let metrics = MatcherMetrics::new();
        metrics.active_job.set(1);

        let output = metrics.encode();
        assert!(output.contains("empi_matcher_active_job 1"));
    }
}
