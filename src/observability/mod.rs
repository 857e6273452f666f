//! Logging and metrics sinks.
//!
//! Logging goes straight through `tracing`; the subscriber is installed once
//! by the binary. Metrics are consumed through the [`Metrics`] trait so the
//! core never depends on a concrete exporter.

pub mod metrics;
pub mod prometheus;

pub use metrics::{Metrics, NoopMetrics};
pub use self::prometheus::PrometheusMetrics;

use tracing_subscriber::EnvFilter;

/// Install the global fmt subscriber.
///
/// `RUST_LOG` wins over `default_level` when set. Calling this twice is a
/// no-op rather than a panic.
pub fn init_tracing(default_level: &str) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init();
}
