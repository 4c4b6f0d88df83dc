//! Rate limiter façade.
//!
//! Binds one algorithm and one limit to the engine and exposes the
//! per-key operations used by the middleware and the CLI.

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tracing::{debug, warn};

use super::batch::{BatchOptions, BatchProcessor};
use super::cache::DenialCache;
use super::engine::{Observation, RateLimitEngine};
use super::types::{Algorithm, RateLimitRequest, RateLimitResult};
use crate::error::{LimiterError, Result};

/// Default maximum requests per window.
const DEFAULT_MAX_REQUESTS: u32 = 100;
/// Default window length.
const DEFAULT_WINDOW_MS: u64 = 60_000;

/// The limit applied to every key of a [`RateLimiter`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LimitConfig {
    pub window_ms: u64,
    pub max_requests: u32,
    pub algorithm: Algorithm,
}

impl Default for LimitConfig {
    fn default() -> Self {
        Self {
            window_ms: DEFAULT_WINDOW_MS,
            max_requests: DEFAULT_MAX_REQUESTS,
            algorithm: Algorithm::default(),
        }
    }
}

/// Retries for read-only calls that failed to reach the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 0,
            backoff: Duration::from_millis(50),
        }
    }
}

impl RetryPolicy {
    /// Linear back-off with up to 50% jitter.
    fn delay(&self, attempt: u32) -> Duration {
        let base = self.backoff.as_millis() as u64 * u64::from(attempt + 1);
        let jitter = if base > 1 {
            rand::thread_rng().gen_range(0..=base / 2)
        } else {
            0
        };
        Duration::from_millis(base + jitter)
    }
}

/// Distributed rate limiter for one limit configuration.
pub struct RateLimiter {
    engine: Arc<RateLimitEngine>,
    limits: LimitConfig,
    retry: RetryPolicy,
    cache: Option<DenialCache>,
    batch: BatchProcessor,
}

impl RateLimiter {
    pub fn new(engine: Arc<RateLimitEngine>, limits: LimitConfig) -> Self {
        Self {
            batch: BatchProcessor::new(engine.clone(), BatchOptions::default()),
            engine,
            limits,
            retry: RetryPolicy::default(),
            cache: None,
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_batch_options(mut self, options: BatchOptions) -> Self {
        self.batch = BatchProcessor::new(self.engine.clone(), options);
        self
    }

    /// Answer repeated checks of a denied key locally until it may retry.
    ///
    /// Has no effect for the token bucket.
    pub fn with_denial_cache(mut self) -> Self {
        if self.limits.algorithm != Algorithm::TokenBucket {
            self.cache = Some(DenialCache::new());
        }
        self
    }

    pub fn limits(&self) -> LimitConfig {
        self.limits
    }

    pub fn engine(&self) -> &Arc<RateLimitEngine> {
        &self.engine
    }

    /// Register the programs with the store ahead of the first request.
    pub async fn initialize(&self) -> Result<()> {
        self.engine.initialize().await
    }

    /// Whether one more hit for `key` would be admitted. Records nothing.
    pub async fn check(&self, key: &str) -> Result<RateLimitResult> {
        let request = self.request(key)?;
        if let Some(cache) = &self.cache {
            if let Some(hit) = cache.lookup(key, self.engine.now_ms()) {
                debug!(key = %key, "Serving cached denial");
                return Ok(hit);
            }
        }

        let observation = self.peek_with_retry(&request).await?;
        self.remember(&observation.result);
        Ok(observation.result)
    }

    /// Record one hit for `key` and return the decision.
    pub async fn increment(&self, key: &str) -> Result<RateLimitResult> {
        let request = self.request(key)?;
        let result = self.engine.evaluate(self.limits.algorithm, &request).await?;
        self.remember(&result);
        Ok(result)
    }

    /// Current state of `key`, or `None` if the store holds nothing for it.
    pub async fn get_status(&self, key: &str) -> Result<Option<RateLimitResult>> {
        let request = self.request(key)?;
        let observation = self.peek_with_retry(&request).await?;
        Ok(observation.exists.then_some(observation.result))
    }

    /// Forget all state for `key`. Returns whether anything was removed.
    pub async fn reset(&self, key: &str) -> Result<bool> {
        let request = self.request(key)?;
        if let Some(cache) = &self.cache {
            cache.evict(key);
        }
        self.engine.reset(self.limits.algorithm, &request).await
    }

    /// Record one hit for each key, in order, with this limiter's configuration.
    pub async fn increment_many(&self, keys: &[String]) -> Result<Vec<RateLimitResult>> {
        let requests: Vec<_> = keys
            .iter()
            .map(|key| {
                RateLimitRequest::new(key.as_str(), self.limits.max_requests, self.limits.window_ms)
            })
            .collect();
        self.process_batch(&requests).await
    }

    /// Evaluate explicit requests with this limiter's algorithm.
    pub async fn process_batch(
        &self,
        requests: &[RateLimitRequest],
    ) -> Result<Vec<RateLimitResult>> {
        let results = self.batch.process_batch(requests, self.limits.algorithm).await?;
        for result in &results {
            self.remember(result);
        }
        Ok(results)
    }

    fn request(&self, key: &str) -> Result<RateLimitRequest> {
        let request = RateLimitRequest::new(key, self.limits.max_requests, self.limits.window_ms);
        request
            .validate()
            .map_err(|reason| LimiterError::validation(0, reason))?;
        Ok(request)
    }

    fn remember(&self, result: &RateLimitResult) {
        if let Some(cache) = &self.cache {
            if result.limit == self.limits.max_requests {
                cache.remember(result, self.engine.now_ms());
            }
        }
    }

    async fn peek_with_retry(&self, request: &RateLimitRequest) -> Result<Observation> {
        let mut attempt = 0;
        loop {
            match self.engine.peek(self.limits.algorithm, request).await {
                Err(LimiterError::Store(err))
                    if err.is_connection() && attempt < self.retry.max_retries =>
                {
                    let delay = self.retry.delay(attempt);
                    warn!(
                        key = %request.key,
                        attempt = attempt + 1,
                        delay = ?delay,
                        error = %err,
                        "Retrying rate limit read"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                other => return other,
            }
        }
    }
}
