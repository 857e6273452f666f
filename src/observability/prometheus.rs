//! Prometheus-backed [`Metrics`] sink.
//!
//! Core metric names contain dots (`cmd.pending`), which Prometheus does not
//! allow in metric names, so every sample lands in one counter vector and one
//! histogram vector labelled by the dotted name.

use std::time::Duration;

use prometheus::{Encoder, HistogramOpts, HistogramVec, IntCounterVec, Opts, Registry, TextEncoder};

use super::Metrics;
use crate::error::{FmdError, FmdResult};

/// Metrics sink exporting to a private Prometheus registry.
pub struct PrometheusMetrics {
    registry: Registry,
    counters: IntCounterVec,
    timers: HistogramVec,
}

impl PrometheusMetrics {
    pub fn new() -> FmdResult<Self> {
        Self::build().map_err(registry_error)
    }

    fn build() -> prometheus::Result<Self> {
        let registry = Registry::new();
        let counters = IntCounterVec::new(
            Opts::new("fmd_events_total", "Find-my-device event counters"),
            &["name"],
        )?;
        let timers = HistogramVec::new(
            HistogramOpts::new("fmd_timer_seconds", "Find-my-device timers").buckets(vec![
                0.01, 0.1, 1.0, 10.0, 60.0, 300.0, 3600.0, 86400.0,
            ]),
            &["name"],
        )?;
        registry.register(Box::new(counters.clone()))?;
        registry.register(Box::new(timers.clone()))?;
        Ok(Self {
            registry,
            counters,
            timers,
        })
    }

    /// Render all samples in the Prometheus text exposition format.
    pub fn render(&self) -> String {
        let mut buf = Vec::new();
        if let Err(e) = TextEncoder::new().encode(&self.registry.gather(), &mut buf) {
            tracing::warn!(error = %e, "Failed to encode metrics");
            return String::new();
        }
        String::from_utf8(buf).unwrap_or_default()
    }

    pub fn counter_value(&self, name: &str) -> u64 {
        self.counters.with_label_values(&[name]).get()
    }

    pub fn timer_count(&self, name: &str) -> u64 {
        self.timers.with_label_values(&[name]).get_sample_count()
    }
}

fn registry_error(e: prometheus::Error) -> FmdError {
    FmdError::Config {
        message: format!("Failed to build metrics registry: {e}"),
    }
}

impl Metrics for PrometheusMetrics {
    fn increment_by(&self, name: &str, n: u64) {
        self.counters.with_label_values(&[name]).inc_by(n);
    }

    fn timer(&self, name: &str, value: Duration) {
        self.timers
            .with_label_values(&[name])
            .observe(value.as_secs_f64());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_failures_are_config_errors() {
        let err = registry_error(prometheus::Error::AlreadyReg);
        assert!(matches!(err, FmdError::Config { ref message } if message.contains("metrics")));
        assert!(err.is_fatal());
    }

    #[test]
    fn counters_accumulate_per_name() {
        let metrics = PrometheusMetrics::new().unwrap();
        metrics.increment("nonce.issued");
        metrics.increment_by("nonce.issued", 2);
        metrics.increment("db.UserID.Updated");
        assert_eq!(metrics.counter_value("nonce.issued"), 3);
        assert_eq!(metrics.counter_value("db.UserID.Updated"), 1);
    }

    #[test]
    fn timers_record_samples() {
        let metrics = PrometheusMetrics::new().unwrap();
        metrics.timer("cmd.pending", Duration::from_secs(3));
        metrics.timer("cmd.pending", Duration::from_millis(20));
        assert_eq!(metrics.timer_count("cmd.pending"), 2);
    }

    #[test]
    fn render_contains_labelled_samples() {
        let metrics = PrometheusMetrics::new().unwrap();
        metrics.increment("position.gc");
        let text = metrics.render();
        assert!(text.contains("fmd_events_total"));
        assert!(text.contains("name=\"position.gc\""));
    }
}
