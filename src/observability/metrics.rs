use std::time::Duration;

/// Fire-and-forget metrics sink.
///
/// Implementations must never block or fail the calling operation.
pub trait Metrics: Send + Sync {
    /// Add `n` to the counter `name`.
    fn increment_by(&self, name: &str, n: u64);

    /// Record a duration sample for the timer `name`.
    fn timer(&self, name: &str, value: Duration);

    fn increment(&self, name: &str) {
        self.increment_by(name, 1);
    }
}

/// Metrics sink that drops everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopMetrics;

impl Metrics for NoopMetrics {
    fn increment_by(&self, _name: &str, _n: u64) {}

    fn timer(&self, _name: &str, _value: Duration) {}
}
