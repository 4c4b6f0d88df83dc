//! Request and result types shared by the engine, the batch processor and the façade.

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize, Serializer};

/// Longest key accepted by the engine.
pub const MAX_KEY_LENGTH: usize = 250;
/// Largest quota a single request may ask for.
pub const MAX_REQUESTS_LIMIT: u32 = 10_000;
/// Longest window a single request may ask for (one day).
pub const MAX_WINDOW_MS: u64 = 86_400_000;

/// Windowing algorithm used to evaluate a key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Algorithm {
    /// Counts hits over a continuously moving interval ending at "now"
    #[default]
    SlidingWindow,
    /// Continuous refill, one token drained per admitted call
    TokenBucket,
    /// Discrete, non-overlapping buckets aligned to the epoch
    FixedWindow,
}

impl Algorithm {
    pub fn as_str(&self) -> &'static str {
        match self {
            Algorithm::SlidingWindow => "sliding_window",
            Algorithm::TokenBucket => "token_bucket",
            Algorithm::FixedWindow => "fixed_window",
        }
    }
}

impl fmt::Display for Algorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Scheduling priority inside a batch. Higher priorities are evaluated first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    High,
    #[default]
    Normal,
    Low,
}

/// A single rate limit evaluation request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitRequest {
    /// Strategy-produced key, without the store prefix
    pub key: String,
    /// Maximum hits admitted per window
    pub max_requests: u32,
    /// Window length in milliseconds
    pub window_ms: u64,
    #[serde(default)]
    pub priority: Priority,
}

impl RateLimitRequest {
    pub fn new(key: impl Into<String>, max_requests: u32, window_ms: u64) -> Self {
        Self {
            key: key.into(),
            max_requests,
            window_ms,
            priority: Priority::Normal,
        }
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// Check the request against the engine's bounds.
    ///
    /// Returns a human readable reason on failure.
    pub fn validate(&self) -> Result<(), String> {
        if self.key.is_empty() {
            return Err("key must not be empty".to_string());
        }
        if self.key.chars().count() > MAX_KEY_LENGTH {
            return Err(format!("key exceeds {} characters", MAX_KEY_LENGTH));
        }
        if self.max_requests == 0 {
            return Err("maxRequests must be positive".to_string());
        }
        if self.max_requests > MAX_REQUESTS_LIMIT {
            return Err(format!("maxRequests exceeds {}", MAX_REQUESTS_LIMIT));
        }
        if self.window_ms == 0 {
            return Err("windowMs must be positive".to_string());
        }
        if self.window_ms > MAX_WINDOW_MS {
            return Err(format!("windowMs exceeds {}", MAX_WINDOW_MS));
        }
        Ok(())
    }
}

/// Outcome of evaluating one key.
///
/// For every non-error result `remaining == max(0, limit - total_hits)`.
/// Error results carry `total_hits == -1` and `allowed == false`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitResult {
    pub key: String,
    pub allowed: bool,
    pub total_hits: i64,
    pub remaining: u64,
    pub reset_time: DateTime<Utc>,
    #[serde(serialize_with = "serialize_secs")]
    pub retry_after: Duration,
    pub algorithm: Algorithm,
    pub window_start: DateTime<Utc>,
    pub window_end: DateTime<Utc>,
    pub limit: u32,
    pub cached: bool,
    #[serde(serialize_with = "serialize_millis")]
    pub response_time: Duration,
}

/// Sentinel hit count marking a result whose store command failed.
pub const ERROR_HITS: i64 = -1;

impl RateLimitResult {
    /// Build the per-key result reported when a store command fails inside a batch.
    pub fn error(request: &RateLimitRequest, algorithm: Algorithm, now_ms: i64) -> Self {
        let now = timestamp(now_ms);
        Self {
            key: request.key.clone(),
            allowed: false,
            total_hits: ERROR_HITS,
            remaining: 0,
            reset_time: now,
            retry_after: Duration::ZERO,
            algorithm,
            window_start: now,
            window_end: now,
            limit: request.max_requests,
            cached: false,
            response_time: Duration::ZERO,
        }
    }

    /// Whether this result stands for a failed store command.
    pub fn is_error(&self) -> bool {
        self.total_hits == ERROR_HITS
    }

    /// `retry_after` rounded up to whole seconds, as sent in `Retry-After`.
    pub fn retry_after_secs(&self) -> u64 {
        let millis = self.retry_after.as_millis() as u64;
        millis.div_ceil(1000)
    }
}

/// Convert epoch milliseconds to a UTC timestamp, clamping out-of-range values.
pub(crate) fn timestamp(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms)
        .single()
        .unwrap_or_default()
}

fn serialize_secs<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_f64(value.as_secs_f64())
}

fn serialize_millis<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_f64(value.as_secs_f64() * 1000.0)
}
