//! Algorithm engine.
//!
//! Each decision is one atomic program evaluation inside the store: the
//! read, the decision and the write happen as a single step, so concurrent
//! callers in any number of processes can never both take the last slot.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, trace, warn};

use super::clock::Clock;
use super::types::{timestamp, Algorithm, RateLimitRequest, RateLimitResult};
use crate::error::{LimiterError, Result};
use crate::store::{ScriptCall, ScriptHandle, ScriptName, ScriptRegistry, ScriptReply, Store};

/// Whether an evaluation records a hit or only observes state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Mode {
    Consume,
    Peek,
}

impl Mode {
    fn script(self, algorithm: Algorithm) -> ScriptName {
        match (algorithm, self) {
            (Algorithm::SlidingWindow, Mode::Consume) => ScriptName::SlidingWindow,
            (Algorithm::SlidingWindow, Mode::Peek) => ScriptName::SlidingWindowPeek,
            (Algorithm::TokenBucket, Mode::Consume) => ScriptName::TokenBucket,
            (Algorithm::TokenBucket, Mode::Peek) => ScriptName::TokenBucketPeek,
            (Algorithm::FixedWindow, Mode::Consume) => ScriptName::FixedWindow,
            (Algorithm::FixedWindow, Mode::Peek) => ScriptName::FixedWindowPeek,
        }
    }
}

/// Current state of a key as seen by a non-mutating read.
#[derive(Debug, Clone, PartialEq)]
pub struct Observation {
    pub result: RateLimitResult,
    /// Whether the store held any state for the key
    pub exists: bool,
}

/// Window boundaries in epoch milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Bounds {
    pub start: i64,
    pub end: i64,
}

/// Runs the rate limiting programs against a store.
pub struct RateLimitEngine {
    store: Arc<dyn Store>,
    registry: Arc<ScriptRegistry>,
    clock: Arc<dyn Clock>,
    key_prefix: String,
    /// Added to every entry's lifetime to absorb clock skew
    ttl_buffer_ms: i64,
}

impl RateLimitEngine {
    pub fn new(
        store: Arc<dyn Store>,
        registry: Arc<ScriptRegistry>,
        clock: Arc<dyn Clock>,
        key_prefix: impl Into<String>,
        ttl_buffer: Duration,
    ) -> Self {
        Self {
            store,
            registry,
            clock,
            key_prefix: key_prefix.into(),
            ttl_buffer_ms: ttl_buffer.as_millis() as i64,
        }
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    pub fn registry(&self) -> &Arc<ScriptRegistry> {
        &self.registry
    }

    pub fn now_ms(&self) -> i64 {
        self.clock.now_ms()
    }

    /// Register the programs with the store.
    pub async fn initialize(&self) -> Result<()> {
        self.registry.initialize(self.store.as_ref()).await?;
        Ok(())
    }

    /// Record a hit for the request and return the decision.
    pub async fn evaluate(
        &self,
        algorithm: Algorithm,
        request: &RateLimitRequest,
    ) -> Result<RateLimitResult> {
        let (result, _) = self.run_single(algorithm, Mode::Consume, request).await?;

        if !result.allowed {
            debug!(
                key = %request.key,
                algorithm = %algorithm,
                total_hits = result.total_hits,
                limit = result.limit,
                "Rate limit exceeded"
            );
        }
        Ok(result)
    }

    /// Read the current state of the key without recording a hit.
    ///
    /// `allowed` reports whether one more hit would currently be admitted.
    pub async fn peek(
        &self,
        algorithm: Algorithm,
        request: &RateLimitRequest,
    ) -> Result<Observation> {
        let (result, exists) = self.run_single(algorithm, Mode::Peek, request).await?;
        Ok(Observation { result, exists })
    }

    /// Delete all state for the key. Returns whether anything was removed.
    pub async fn reset(&self, algorithm: Algorithm, request: &RateLimitRequest) -> Result<bool> {
        let mut keys = vec![self.store_key(&request.key)];
        if algorithm == Algorithm::FixedWindow {
            let now = self.clock.now_ms();
            keys.push(self.fixed_window_key(&request.key, now, request.window_ms));
        }
        let removed = self.store.delete(&keys).await?;
        debug!(key = %request.key, removed, "Rate limit state reset");
        Ok(removed > 0)
    }

    async fn run_single(
        &self,
        algorithm: Algorithm,
        mode: Mode,
        request: &RateLimitRequest,
    ) -> Result<(RateLimitResult, bool)> {
        let started = Instant::now();
        let now = self.clock.now_ms();

        trace!(
            key = %request.key,
            algorithm = %algorithm,
            mode = ?mode,
            "Evaluating rate limit"
        );

        let generation = self.registry.generation();
        let (call, bounds) = self.plan(algorithm, mode, request, now).await?;
        let values = match self.store.eval(&call).await {
            Err(err) if err.is_no_script() => {
                warn!(
                    script = %call.handle.name,
                    "Store does not know the script, re-registering"
                );
                self.registry
                    .reinitialize_if_stale(self.store.as_ref(), generation)
                    .await?;
                let (call, _) = self.plan(algorithm, mode, request, now).await?;
                self.store.eval(&call).await?
            }
            other => other?,
        };

        let reply = ScriptReply::parse(&values)?;
        let result = self.to_result(algorithm, request, bounds, reply, started);
        Ok((result, reply.exists))
    }

    /// Resolve a handle, registering the programs first if the registry is empty.
    pub(crate) async fn handle(&self, name: ScriptName) -> Result<ScriptHandle> {
        if let Some(handle) = self.registry.handle(name) {
            return Ok(handle);
        }
        debug!(script = %name, "Script handle missing, initializing registry");
        if let Err(err) = self.registry.initialize(self.store.as_ref()).await {
            warn!(error = %err, "Script registration failed");
            return Err(LimiterError::HandleNotReady(name));
        }
        self.registry
            .handle(name)
            .ok_or(LimiterError::HandleNotReady(name))
    }

    /// Build the program call for one request.
    pub(crate) async fn plan(
        &self,
        algorithm: Algorithm,
        mode: Mode,
        request: &RateLimitRequest,
        now: i64,
    ) -> Result<(ScriptCall, Bounds)> {
        let handle = self.handle(mode.script(algorithm)).await?;
        let window = request.window_ms as i64;
        let limit = request.max_requests.to_string();
        let ttl = (window + self.ttl_buffer_ms).to_string();

        let (key, args, bounds) = match algorithm {
            Algorithm::SlidingWindow => {
                let mut args = vec![now.to_string(), window.to_string(), limit];
                if mode == Mode::Consume {
                    args.push(ttl);
                    args.push(hit_member(now));
                }
                (self.store_key(&request.key), args, rolling_bounds(now, window))
            }
            Algorithm::TokenBucket => {
                let mut args = vec![now.to_string(), limit, window.to_string()];
                if mode == Mode::Consume {
                    args.push(ttl);
                }
                (self.store_key(&request.key), args, rolling_bounds(now, window))
            }
            Algorithm::FixedWindow => {
                let bounds = fixed_bounds(now, window);
                let mut args = vec![now.to_string(), bounds.end.to_string(), limit];
                if mode == Mode::Consume {
                    args.push(ttl);
                }
                (
                    self.fixed_window_key(&request.key, now, request.window_ms),
                    args,
                    bounds,
                )
            }
        };

        Ok((ScriptCall::new(handle, vec![key], args), bounds))
    }

    /// Build one multi-key sliding window call.
    ///
    /// Every request must share `max_requests` and `window_ms` with the first.
    pub(crate) async fn plan_sliding_batch(
        &self,
        requests: &[&RateLimitRequest],
        now: i64,
    ) -> Result<(ScriptCall, Bounds)> {
        let handle = self.handle(ScriptName::SlidingWindowBatch).await?;
        let first = requests
            .first()
            .ok_or_else(|| LimiterError::validation(0, "empty sliding window batch"))?;
        let window = first.window_ms as i64;

        let keys = requests.iter().map(|r| self.store_key(&r.key)).collect();
        let args = vec![
            now.to_string(),
            window.to_string(),
            first.max_requests.to_string(),
            (window + self.ttl_buffer_ms).to_string(),
            hit_member(now),
        ];
        Ok((ScriptCall::new(handle, keys, args), rolling_bounds(now, window)))
    }

    pub(crate) fn to_result(
        &self,
        algorithm: Algorithm,
        request: &RateLimitRequest,
        bounds: Bounds,
        reply: ScriptReply,
        started: Instant,
    ) -> RateLimitResult {
        RateLimitResult {
            key: request.key.clone(),
            allowed: reply.allowed,
            total_hits: reply.total_hits,
            remaining: reply.remaining,
            reset_time: timestamp(reply.reset_ms),
            retry_after: Duration::from_millis(reply.retry_after_ms as u64),
            algorithm,
            window_start: timestamp(bounds.start),
            window_end: timestamp(bounds.end),
            limit: request.max_requests,
            cached: false,
            response_time: started.elapsed(),
        }
    }

    /// Full store key for a strategy-produced key.
    pub fn store_key(&self, key: &str) -> String {
        format!("{}:{}", self.key_prefix, key)
    }

    fn fixed_window_key(&self, key: &str, now: i64, window_ms: u64) -> String {
        format!("{}:{}", self.store_key(key), now.div_euclid(window_ms as i64))
    }
}

/// Unique sorted-set member for a hit recorded at `now`.
fn hit_member(now: i64) -> String {
    format!("{}-{}", now, uuid::Uuid::new_v4().simple())
}

fn rolling_bounds(now: i64, window: i64) -> Bounds {
    Bounds {
        start: now - window,
        end: now,
    }
}

fn fixed_bounds(now: i64, window: i64) -> Bounds {
    let index = now.div_euclid(window);
    Bounds {
        start: index * window,
        end: (index + 1) * window,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::ManualClock;
    use crate::store::MemoryStore;
    use tokio_test::{assert_err, assert_ok};

    struct Harness {
        clock: Arc<ManualClock>,
        store: Arc<MemoryStore>,
        engine: Arc<RateLimitEngine>,
    }

    async fn harness(start_ms: i64) -> Harness {
        let clock = Arc::new(ManualClock::new(start_ms));
        let store = Arc::new(MemoryStore::new(clock.clone()));
        let engine = Arc::new(RateLimitEngine::new(
            store.clone(),
            Arc::new(ScriptRegistry::new()),
            clock.clone(),
            "rl",
            Duration::from_secs(10),
        ));
        engine.initialize().await.unwrap();
        Harness {
            clock,
            store,
            engine,
        }
    }

    impl Harness {
        async fn hit(&self, algorithm: Algorithm, request: &RateLimitRequest) -> RateLimitResult {
            self.engine.evaluate(algorithm, request).await.unwrap()
        }
    }

    fn assert_remaining_invariant(result: &RateLimitResult) {
        let expected = (result.limit as i64 - result.total_hits).max(0) as u64;
        assert_eq!(result.remaining, expected, "remaining invariant broken: {:?}", result);
    }

    #[tokio::test]
    async fn test_sliding_window_scenario() {
        let h = harness(0).await;
        let request = RateLimitRequest::new("ip:1.2.3.4", 3, 1000);

        for (t, remaining) in [(0, 2), (100, 1), (200, 0)] {
            h.clock.set(t);
            let result = h.hit(Algorithm::SlidingWindow, &request).await;
            assert!(result.allowed, "call at t={} should be allowed", t);
            assert_eq!(result.remaining, remaining);
            assert_remaining_invariant(&result);
        }

        h.clock.set(300);
        let result = h.hit(Algorithm::SlidingWindow, &request).await;
        assert!(!result.allowed);
        assert_eq!(result.retry_after, Duration::from_millis(700));
        assert_eq!(result.reset_time, timestamp(1_300));
        assert_remaining_invariant(&result);
    }

    #[tokio::test]
    async fn test_sliding_window_slides() {
        let h = harness(0).await;
        let request = RateLimitRequest::new("k", 2, 1000);

        h.hit(Algorithm::SlidingWindow, &request).await;
        h.clock.set(500);
        h.hit(Algorithm::SlidingWindow, &request).await;
        h.clock.set(900);
        assert!(!h.hit(Algorithm::SlidingWindow, &request).await.allowed);

        // The hit at t=0 leaves the window at t=1000
        h.clock.set(1_000);
        let result = h.hit(Algorithm::SlidingWindow, &request).await;
        assert!(result.allowed);
        assert_eq!(result.total_hits, 2);
    }

    #[tokio::test]
    async fn test_nth_plus_one_denied_for_every_algorithm() {
        for algorithm in [
            Algorithm::SlidingWindow,
            Algorithm::TokenBucket,
            Algorithm::FixedWindow,
        ] {
            let h = harness(5_000).await;
            let request = RateLimitRequest::new("user:9", 5, 60_000);

            for i in 1..=5 {
                let result = h.hit(algorithm, &request).await;
                assert!(result.allowed, "{} request {} should be allowed", algorithm, i);
                assert_remaining_invariant(&result);
            }
            let result = h.hit(algorithm, &request).await;
            assert!(!result.allowed, "{} request 6 should be denied", algorithm);
            assert!(result.retry_after > Duration::ZERO);
            assert_remaining_invariant(&result);
        }
    }

    #[tokio::test]
    async fn test_fixed_window_reset_is_window_multiple() {
        let h = harness(1_234_567).await;
        let request = RateLimitRequest::new("k", 10, 60_000);

        for step in [0, 17_000, 45_000, 91_000] {
            h.clock.advance(step);
            let result = h.hit(Algorithm::FixedWindow, &request).await;
            let reset_ms = result.reset_time.timestamp_millis();
            assert_eq!(reset_ms % 60_000, 0);
            assert_eq!(result.window_end, result.reset_time);
            assert_eq!(
                result.window_end.timestamp_millis() - result.window_start.timestamp_millis(),
                60_000
            );
        }
    }

    #[tokio::test]
    async fn test_fixed_window_starts_fresh_each_window() {
        let h = harness(0).await;
        let request = RateLimitRequest::new("k", 1, 1000);

        assert!(h.hit(Algorithm::FixedWindow, &request).await.allowed);
        h.clock.set(999);
        let denied = h.hit(Algorithm::FixedWindow, &request).await;
        assert!(!denied.allowed);
        assert_eq!(denied.total_hits, 2);
        assert_eq!(denied.retry_after, Duration::from_millis(1));

        h.clock.set(1_000);
        assert!(h.hit(Algorithm::FixedWindow, &request).await.allowed);
        assert!(h.store.contains_key("rl:k:1"));
    }

    #[tokio::test]
    async fn test_token_bucket_refills() {
        let h = harness(0).await;
        // 2 tokens per second
        let request = RateLimitRequest::new("k", 2, 1000);

        assert!(h.hit(Algorithm::TokenBucket, &request).await.allowed);
        assert!(h.hit(Algorithm::TokenBucket, &request).await.allowed);
        let denied = h.hit(Algorithm::TokenBucket, &request).await;
        assert!(!denied.allowed);
        assert_eq!(denied.retry_after, Duration::from_millis(500));
        assert_eq!(denied.remaining, 0);
        assert_eq!(denied.total_hits, 2);

        h.clock.set(500);
        let result = h.hit(Algorithm::TokenBucket, &request).await;
        assert!(result.allowed);
        assert_eq!(result.remaining, 0);
    }

    #[tokio::test]
    async fn test_token_bucket_caps_at_capacity() {
        let h = harness(0).await;
        let request = RateLimitRequest::new("k", 3, 1000);

        h.hit(Algorithm::TokenBucket, &request).await;
        h.clock.set(60_000);
        let result = h.hit(Algorithm::TokenBucket, &request).await;
        assert_eq!(result.remaining, 2);
        assert_eq!(result.total_hits, 1);
    }

    #[tokio::test]
    async fn test_peek_does_not_consume() {
        let h = harness(0).await;
        let request = RateLimitRequest::new("k", 2, 1000);

        for algorithm in [
            Algorithm::SlidingWindow,
            Algorithm::TokenBucket,
            Algorithm::FixedWindow,
        ] {
            let fresh = h.engine.peek(algorithm, &request).await.unwrap();
            assert!(!fresh.exists);
            assert!(fresh.result.allowed);
            assert_eq!(fresh.result.remaining, 2);

            h.hit(algorithm, &request).await;
            for _ in 0..3 {
                let seen = h.engine.peek(algorithm, &request).await.unwrap();
                assert!(seen.exists);
                assert!(seen.result.allowed);
                assert_eq!(seen.result.remaining, 1);
                assert_remaining_invariant(&seen.result);
            }

            h.hit(algorithm, &request).await;
            let full = h.engine.peek(algorithm, &request).await.unwrap();
            assert!(!full.result.allowed);
            assert_eq!(full.result.remaining, 0);

            h.engine.reset(algorithm, &request).await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_entries_carry_ttl_buffer() {
        let h = harness(0).await;
        let request = RateLimitRequest::new("k", 5, 1000);

        h.hit(Algorithm::SlidingWindow, &request).await;
        assert_eq!(h.store.ttl_ms("rl:k"), Some(11_000));
    }

    #[tokio::test]
    async fn test_reset_clears_state() {
        let h = harness(0).await;
        let request = RateLimitRequest::new("k", 1, 1000);

        for algorithm in [
            Algorithm::SlidingWindow,
            Algorithm::TokenBucket,
            Algorithm::FixedWindow,
        ] {
            h.hit(algorithm, &request).await;
            assert!(!h.hit(algorithm, &request).await.allowed);

            assert!(h.engine.reset(algorithm, &request).await.unwrap());
            assert!(h.hit(algorithm, &request).await.allowed);
            h.engine.reset(algorithm, &request).await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_reregisters_after_script_flush() {
        let h = harness(0).await;
        let request = RateLimitRequest::new("k", 5, 1000);
        let loads_before = h.store.script_loads();

        h.store.flush_scripts();
        let result = h.engine.evaluate(Algorithm::FixedWindow, &request).await;

        assert_ok!(&result);
        assert!(h.store.script_loads() > loads_before);
        assert_eq!(h.engine.registry().generation(), 2);
    }

    #[tokio::test]
    async fn test_store_failure_is_an_error_not_a_denial() {
        let h = harness(0).await;
        let request = RateLimitRequest::new("k", 5, 1000);

        h.store.set_unreachable(true);
        let result = h.engine.evaluate(Algorithm::SlidingWindow, &request).await;
        assert!(matches!(result, Err(LimiterError::Store(_))));
    }

    #[tokio::test]
    async fn test_unready_registry_fails_closed() {
        let clock = Arc::new(ManualClock::new(0));
        let store = Arc::new(MemoryStore::new(clock.clone()));
        store.set_unreachable(true);
        let engine = RateLimitEngine::new(
            store,
            Arc::new(ScriptRegistry::new()),
            clock,
            "rl",
            Duration::from_secs(10),
        );

        let result = engine
            .evaluate(Algorithm::TokenBucket, &RateLimitRequest::new("k", 1, 1000))
            .await;
        assert_err!(&result);
        assert!(matches!(
            result,
            Err(LimiterError::HandleNotReady(ScriptName::TokenBucket))
        ));
    }

    #[tokio::test]
    async fn test_registry_initializes_lazily() {
        let clock = Arc::new(ManualClock::new(0));
        let store = Arc::new(MemoryStore::new(clock.clone()));
        let engine = RateLimitEngine::new(
            store,
            Arc::new(ScriptRegistry::new()),
            clock,
            "rl",
            Duration::from_secs(10),
        );

        let result = engine
            .evaluate(Algorithm::SlidingWindow, &RateLimitRequest::new("k", 1, 1000))
            .await
            .unwrap();
        assert!(result.allowed);
        assert!(engine.registry().is_ready());
    }

    #[tokio::test]
    async fn test_concurrent_increments_admit_exactly_limit() {
        for algorithm in [
            Algorithm::SlidingWindow,
            Algorithm::TokenBucket,
            Algorithm::FixedWindow,
        ] {
            let h = harness(0).await;
            let limit = 25;
            let request = RateLimitRequest::new("hot", limit, 60_000);

            let tasks: Vec<_> = (0..limit * 2)
                .map(|_| {
                    let engine = h.engine.clone();
                    let request = request.clone();
                    tokio::spawn(async move { engine.evaluate(algorithm, &request).await })
                })
                .collect();

            let mut admitted = 0;
            for task in tasks {
                if task.await.unwrap().unwrap().allowed {
                    admitted += 1;
                }
            }
            assert_eq!(admitted, limit, "{} admitted {} of {}", algorithm, admitted, limit);
        }
    }
}
