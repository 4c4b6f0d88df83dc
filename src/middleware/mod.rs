//! HTTP middleware around the rate limiter.
//!
//! Checks the quota before the protected handler runs, answers denials with
//! `429 Too Many Requests`, and counts completed requests afterwards. A
//! limiter failure never blocks a request: it is logged, counted, and the
//! handler runs as if no limiter were configured.

pub mod metrics;

use std::future::Future;
use std::sync::Arc;
use std::time::Instant;

use http::header::{HeaderName, HeaderValue, RETRY_AFTER};
use http::{HeaderMap, Response, StatusCode};
use serde::Serialize;
use tracing::{debug, warn};

use crate::ratelimit::{
    mask_credential, KeyStrategy, KeyStrategyKind, RateLimitResult, RateLimiter, RequestContext,
};
use self::metrics::{MetricsSink, TracingMetrics};

const LIMIT_HEADER: HeaderName = HeaderName::from_static("x-ratelimit-limit");
const REMAINING_HEADER: HeaderName = HeaderName::from_static("x-ratelimit-remaining");
const RESET_HEADER: HeaderName = HeaderName::from_static("x-ratelimit-reset");
const WINDOW_HEADER: HeaderName = HeaderName::from_static("x-ratelimit-window");

/// Error code carried in every rejection body.
pub const RATE_LIMIT_EXCEEDED: &str = "RATE_LIMIT_EXCEEDED";
/// Default rejection message.
pub const DEFAULT_MESSAGE: &str = "Too many requests, please try again later.";

/// Behavior switches for [`RateLimitMiddleware`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MiddlewareOptions {
    /// Do not count requests whose response status is below 400
    pub skip_successful_requests: bool,
    /// Do not count requests whose response status is 400 or above
    pub skip_failed_requests: bool,
    /// Emit `X-RateLimit-*` headers on admitted requests
    pub standard_headers: bool,
    pub message: String,
}

impl Default for MiddlewareOptions {
    fn default() -> Self {
        Self {
            skip_successful_requests: false,
            skip_failed_requests: false,
            standard_headers: true,
            message: DEFAULT_MESSAGE.to_string(),
        }
    }
}

/// JSON body of a rejection.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct Rejection<'a> {
    error: &'static str,
    message: &'a str,
    retry_after: u64,
    code: &'static str,
    max_requests: u32,
    remaining: u64,
}

/// Applies a [`RateLimiter`] to HTTP handlers.
pub struct RateLimitMiddleware {
    limiter: Arc<RateLimiter>,
    strategy: KeyStrategy,
    options: MiddlewareOptions,
    metrics: Arc<dyn MetricsSink>,
}

impl RateLimitMiddleware {
    pub fn new(
        limiter: Arc<RateLimiter>,
        strategy: KeyStrategy,
        options: MiddlewareOptions,
    ) -> Self {
        Self {
            limiter,
            strategy,
            options,
            metrics: Arc::new(TracingMetrics),
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<dyn MetricsSink>) -> Self {
        self.metrics = metrics;
        self
    }

    /// Run `next` under the rate limit and return its response.
    ///
    /// Denied requests never reach `next`.
    pub async fn handle<B, F, Fut>(&self, ctx: &RequestContext, next: F) -> Response<B>
    where
        B: From<String>,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Response<B>>,
    {
        let key = self.strategy.generate_key(ctx);
        let algorithm = self.limiter.limits().algorithm;
        let strategy = self.strategy.kind();
        let tags = [
            ("algorithm", algorithm.as_str()),
            ("strategy", strategy.as_str()),
        ];

        let started = Instant::now();
        let checked = self.limiter.check(&key).await;
        let mut limiter_ms = elapsed_ms(started);

        let checked = match checked {
            Ok(result) => result,
            Err(err) => {
                warn!(
                    key = %self.loggable(&key),
                    error = %err,
                    "Rate limiter unavailable, allowing request"
                );
                self.metrics.record_counter(metrics::ERROR, &tags);
                return next().await;
            }
        };

        if !checked.allowed {
            debug!(
                key = %self.loggable(&key),
                retry_after = checked.retry_after_secs(),
                cached = checked.cached,
                "Request rate limited"
            );
            self.metrics.record_counter(metrics::DENIED, &tags);
            self.metrics.record_timer(metrics::DURATION, limiter_ms, &tags);
            return self.reject(&checked);
        }

        self.metrics.record_counter(metrics::ALLOWED, &tags);
        let mut response = next().await;

        let succeeded = response.status().as_u16() < 400;
        let skip = if succeeded {
            self.options.skip_successful_requests
        } else {
            self.options.skip_failed_requests
        };

        let reported = if skip {
            Some(checked)
        } else {
            let started = Instant::now();
            let counted = self.limiter.increment(&key).await;
            limiter_ms += elapsed_ms(started);
            match counted {
                Ok(result) => Some(result),
                Err(err) => {
                    warn!(
                        key = %self.loggable(&key),
                        error = %err,
                        "Failed to record request against rate limit"
                    );
                    self.metrics.record_counter(metrics::ERROR, &tags);
                    None
                }
            }
        };

        self.metrics.record_timer(metrics::DURATION, limiter_ms, &tags);
        if let (true, Some(result)) = (self.options.standard_headers, reported) {
            let window_ms = self.limiter.limits().window_ms;
            set_standard_headers(response.headers_mut(), &result, window_ms);
        }
        response
    }

    fn reject<B: From<String>>(&self, result: &RateLimitResult) -> Response<B> {
        let retry_after = result.retry_after_secs();
        let body = Rejection {
            error: "Too Many Requests",
            message: &self.options.message,
            retry_after,
            code: RATE_LIMIT_EXCEEDED,
            max_requests: result.limit,
            remaining: result.remaining,
        };
        let body = serde_json::to_string(&body).unwrap_or_default();

        let mut response = Response::new(B::from(body));
        *response.status_mut() = StatusCode::TOO_MANY_REQUESTS;
        let headers = response.headers_mut();
        headers.insert(RETRY_AFTER, HeaderValue::from(retry_after));
        headers.insert(
            http::header::CONTENT_TYPE,
            HeaderValue::from_static("application/json"),
        );
        if self.options.standard_headers {
            set_standard_headers(headers, result, self.limiter.limits().window_ms);
        }
        response
    }

    /// The key as it may appear in logs.
    fn loggable(&self, key: &str) -> String {
        match self.strategy.kind() {
            KeyStrategyKind::ApiKey => match key.strip_prefix("api:") {
                Some(credential) => format!("api:{}", mask_credential(credential)),
                None => key.to_string(),
            },
            _ => key.to_string(),
        }
    }
}

fn set_standard_headers(headers: &mut HeaderMap, result: &RateLimitResult, window_ms: u64) {
    let reset = result.reset_time.timestamp().max(0) as u64;
    headers.insert(LIMIT_HEADER, HeaderValue::from(result.limit));
    headers.insert(REMAINING_HEADER, HeaderValue::from(result.remaining));
    headers.insert(RESET_HEADER, HeaderValue::from(reset));
    headers.insert(WINDOW_HEADER, HeaderValue::from(window_ms));
}

fn elapsed_ms(started: Instant) -> f64 {
    started.elapsed().as_secs_f64() * 1000.0
}
