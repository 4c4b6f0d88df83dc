//! Outcome counters and latency timers.

use tracing::{debug, trace};

/// Counter for admitted requests.
pub const ALLOWED: &str = "rate_limit.allowed";
/// Counter for rejected requests.
pub const DENIED: &str = "rate_limit.denied";
/// Counter for limiter failures that were let through.
pub const ERROR: &str = "rate_limit.error";
/// Timer for the limiter's share of request latency.
pub const DURATION: &str = "rate_limit.duration";

pub type Tags<'a> = &'a [(&'a str, &'a str)];

/// Destination for rate limiting metrics.
pub trait MetricsSink: Send + Sync {
    fn record_counter(&self, name: &str, tags: Tags<'_>);

    fn record_timer(&self, name: &str, millis: f64, tags: Tags<'_>);
}

/// Emits every metric as a `tracing` event on the `ratewarden::metrics` target.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingMetrics;

impl MetricsSink for TracingMetrics {
    fn record_counter(&self, name: &str, tags: Tags<'_>) {
        debug!(target: "ratewarden::metrics", metric = name, tags = ?tags, "counter");
    }

    fn record_timer(&self, name: &str, millis: f64, tags: Tags<'_>) {
        trace!(target: "ratewarden::metrics", metric = name, millis, tags = ?tags, "timer");
    }
}

/// Discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopMetrics;

impl MetricsSink for NoopMetrics {
    fn record_counter(&self, _name: &str, _tags: Tags<'_>) {}

    fn record_timer(&self, _name: &str, _millis: f64, _tags: Tags<'_>) {}
}
