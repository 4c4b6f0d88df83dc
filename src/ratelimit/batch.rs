//! Batch processor.
//!
//! Evaluates many independent requests with as few store round trips as
//! possible while keeping every per-key decision atomic.

use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::join_all;
use tokio::sync::Semaphore;
use tracing::{debug, warn};

use super::engine::{Bounds, Mode, RateLimitEngine};
use super::types::{Algorithm, Priority, RateLimitRequest, RateLimitResult};
use crate::error::{LimiterError, Result};
use crate::store::{ScriptReply, StoreError};

/// Default number of requests per chunk.
pub const DEFAULT_MAX_BATCH_SIZE: usize = 100;
/// Default number of chunks in flight at once.
pub const DEFAULT_CONCURRENCY: usize = 10;
/// Default deadline for a whole batch.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(5000);

/// Tuning for [`BatchProcessor`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchOptions {
    pub max_batch_size: usize,
    pub concurrency: usize,
    pub timeout: Duration,
}

impl Default for BatchOptions {
    fn default() -> Self {
        Self {
            max_batch_size: DEFAULT_MAX_BATCH_SIZE,
            concurrency: DEFAULT_CONCURRENCY,
            timeout: DEFAULT_TIMEOUT,
        }
    }
}

/// Indices of the requests evaluated together in one round trip.
type Chunk = Vec<usize>;

/// Evaluates batches of requests against one algorithm.
pub struct BatchProcessor {
    engine: Arc<RateLimitEngine>,
    options: BatchOptions,
}

impl BatchProcessor {
    pub fn new(engine: Arc<RateLimitEngine>, options: BatchOptions) -> Self {
        Self { engine, options }
    }

    pub fn options(&self) -> BatchOptions {
        self.options
    }

    /// Record one hit for every request and return the decisions in input order.
    ///
    /// The batch is validated before any I/O; one invalid entry rejects it
    /// all. Store failures only affect the results of the keys involved,
    /// which come back with `total_hits == -1`. Exceeding the deadline fails
    /// the call, but work already sent to the store still completes there.
    pub async fn process_batch(
        &self,
        requests: &[RateLimitRequest],
        algorithm: Algorithm,
    ) -> Result<Vec<RateLimitResult>> {
        for (index, request) in requests.iter().enumerate() {
            request
                .validate()
                .map_err(|reason| LimiterError::validation(index, reason))?;
        }
        if requests.is_empty() {
            return Ok(Vec::new());
        }

        let started = Instant::now();
        let chunks = plan_chunks(requests, algorithm, self.options.max_batch_size);
        debug!(
            requests = requests.len(),
            chunks = chunks.len(),
            algorithm = %algorithm,
            "Processing rate limit batch"
        );

        let requests: Arc<[RateLimitRequest]> = requests.into();
        let gate = Arc::new(Semaphore::new(self.options.concurrency.max(1)));

        let tasks: Vec<_> = chunks
            .into_iter()
            .map(|chunk| {
                let engine = self.engine.clone();
                let requests = requests.clone();
                let gate = gate.clone();
                let indices = chunk.clone();
                let handle = tokio::spawn(async move {
                    // The gate is never closed, so acquiring cannot fail.
                    let _permit = gate.acquire().await;
                    run_chunk(&engine, &requests, algorithm, &chunk).await
                });
                (indices, handle)
            })
            .collect();

        let collect = async {
            let mut slots: Vec<Option<RateLimitResult>> = vec![None; requests.len()];
            let (indices, handles): (Vec<Chunk>, Vec<_>) = tasks.into_iter().unzip();

            for (chunk, joined) in indices.iter().zip(join_all(handles).await) {
                let results = match joined {
                    Ok(outcome) => outcome?,
                    Err(err) => {
                        warn!(error = %err, "Batch chunk task failed");
                        let now = self.engine.now_ms();
                        chunk
                            .iter()
                            .map(|&i| (i, RateLimitResult::error(&requests[i], algorithm, now)))
                            .collect()
                    }
                };
                for (index, result) in results {
                    slots[index] = Some(result);
                }
            }

            slots
                .into_iter()
                .collect::<Option<Vec<_>>>()
                .ok_or_else(|| {
                    LimiterError::Store(StoreError::Protocol("batch result missing".to_string()))
                })
        };

        let results = tokio::time::timeout(self.options.timeout, collect)
            .await
            .map_err(|_| {
                warn!(timeout = ?self.options.timeout, "Rate limit batch timed out");
                LimiterError::Timeout(self.options.timeout)
            })??;

        debug!(
            requests = results.len(),
            denied = results.iter().filter(|r| !r.allowed).count(),
            errors = results.iter().filter(|r| r.is_error()).count(),
            elapsed = ?started.elapsed(),
            "Rate limit batch complete"
        );
        Ok(results)
    }
}

/// Order by priority, group where a shared call needs uniform parameters, and chunk.
fn plan_chunks(requests: &[RateLimitRequest], algorithm: Algorithm, max_size: usize) -> Vec<Chunk> {
    let max_size = max_size.max(1);
    let mut order: Vec<usize> = (0..requests.len()).collect();
    order.sort_by_key(|&i| requests[i].priority);

    if algorithm != Algorithm::SlidingWindow {
        return order.chunks(max_size).map(<[usize]>::to_vec).collect();
    }

    // A multi-key sliding window call applies one limit and window to every
    // key, so only requests with identical parameters may share a chunk.
    let mut groups: Vec<((Priority, u32, u64), Chunk)> = Vec::new();
    for i in order {
        let request = &requests[i];
        let params = (request.priority, request.max_requests, request.window_ms);
        match groups.iter_mut().find(|(p, _)| *p == params) {
            Some((_, members)) => members.push(i),
            None => groups.push((params, vec![i])),
        }
    }

    groups
        .into_iter()
        .flat_map(|(_, members)| {
            members
                .chunks(max_size)
                .map(<[usize]>::to_vec)
                .collect::<Vec<_>>()
        })
        .collect()
}

async fn run_chunk(
    engine: &RateLimitEngine,
    requests: &[RateLimitRequest],
    algorithm: Algorithm,
    chunk: &[usize],
) -> Result<Vec<(usize, RateLimitResult)>> {
    if algorithm == Algorithm::SlidingWindow && chunk.len() > 1 {
        run_multi_key(engine, requests, chunk).await
    } else {
        run_pipeline(engine, requests, algorithm, chunk).await
    }
}

fn error_results(
    requests: &[RateLimitRequest],
    algorithm: Algorithm,
    chunk: &[usize],
    now: i64,
) -> Vec<(usize, RateLimitResult)> {
    chunk
        .iter()
        .map(|&i| (i, RateLimitResult::error(&requests[i], algorithm, now)))
        .collect()
}

/// One atomic sliding window evaluation covering every key of the chunk.
async fn run_multi_key(
    engine: &RateLimitEngine,
    requests: &[RateLimitRequest],
    chunk: &[usize],
) -> Result<Vec<(usize, RateLimitResult)>> {
    let algorithm = Algorithm::SlidingWindow;
    let started = Instant::now();
    let now = engine.now_ms();
    let members: Vec<&RateLimitRequest> = chunk.iter().map(|&i| &requests[i]).collect();

    let generation = engine.registry().generation();
    let (call, bounds) = engine.plan_sliding_batch(&members, now).await?;
    let outcome = match engine.store().eval(&call).await {
        Err(err) if err.is_no_script() => {
            warn!("Store does not know the batch script, re-registering");
            engine
                .registry()
                .reinitialize_if_stale(engine.store().as_ref(), generation)
                .await?;
            let (call, _) = engine.plan_sliding_batch(&members, now).await?;
            engine.store().eval(&call).await
        }
        other => other,
    };

    let replies = match outcome.and_then(|values| ScriptReply::parse_many(&values, chunk.len())) {
        Ok(replies) => replies,
        Err(err) => {
            warn!(error = %err, keys = chunk.len(), "Batched sliding window call failed");
            return Ok(error_results(requests, algorithm, chunk, now));
        }
    };

    Ok(chunk
        .iter()
        .zip(replies)
        .map(|(&i, reply)| (i, engine.to_result(algorithm, &requests[i], bounds, reply, started)))
        .collect())
}

/// One round trip carrying one evaluation per request, in order.
async fn run_pipeline(
    engine: &RateLimitEngine,
    requests: &[RateLimitRequest],
    algorithm: Algorithm,
    chunk: &[usize],
) -> Result<Vec<(usize, RateLimitResult)>> {
    let started = Instant::now();
    let now = engine.now_ms();

    let generation = engine.registry().generation();
    let mut calls = Vec::with_capacity(chunk.len());
    let mut bounds: Vec<Bounds> = Vec::with_capacity(chunk.len());
    for &i in chunk {
        let (call, b) = engine.plan(algorithm, Mode::Consume, &requests[i], now).await?;
        calls.push(call);
        bounds.push(b);
    }

    let mut outcomes = match engine.store().eval_pipeline(&calls).await {
        Ok(outcomes) => outcomes,
        Err(err) => {
            warn!(error = %err, commands = calls.len(), "Rate limit pipeline failed");
            return Ok(error_results(requests, algorithm, chunk, now));
        }
    };

    // A command rejected for an unknown script never ran, so it is safe to resend.
    let stale: Vec<usize> = outcomes
        .iter()
        .enumerate()
        .filter(|(_, o)| matches!(o, Err(e) if e.is_no_script()))
        .map(|(slot, _)| slot)
        .collect();
    if !stale.is_empty() {
        warn!(commands = stale.len(), "Store does not know the scripts, re-registering");
        engine
            .registry()
            .reinitialize_if_stale(engine.store().as_ref(), generation)
            .await?;

        let mut retry = Vec::with_capacity(stale.len());
        for &slot in &stale {
            let (call, _) = engine
                .plan(algorithm, Mode::Consume, &requests[chunk[slot]], now)
                .await?;
            retry.push(call);
        }
        match engine.store().eval_pipeline(&retry).await {
            Ok(retried) => {
                for (slot, outcome) in stale.into_iter().zip(retried) {
                    outcomes[slot] = outcome;
                }
            }
            Err(err) => {
                warn!(error = %err, "Rate limit pipeline retry failed");
                for slot in stale {
                    outcomes[slot] = Err(StoreError::Connection(err.to_string()));
                }
            }
        }
    }

    Ok(chunk
        .iter()
        .zip(outcomes)
        .zip(bounds)
        .map(|((&i, outcome), b)| {
            let request = &requests[i];
            match outcome.and_then(|values| ScriptReply::parse(&values)) {
                Ok(reply) => (i, engine.to_result(algorithm, request, b, reply, started)),
                Err(err) => {
                    warn!(key = %request.key, error = %err, "Rate limit command failed");
                    (i, RateLimitResult::error(request, algorithm, now))
                }
            }
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::{ManualClock, Priority};
    use crate::store::{MemoryStore, ScriptRegistry};

    struct Harness {
        store: Arc<MemoryStore>,
        engine: Arc<RateLimitEngine>,
    }

    async fn harness() -> Harness {
        let clock = Arc::new(ManualClock::new(50_000));
        let store = Arc::new(MemoryStore::new(clock.clone()));
        let engine = Arc::new(RateLimitEngine::new(
            store.clone(),
            Arc::new(ScriptRegistry::new()),
            clock,
            "rl",
            Duration::from_secs(10),
        ));
        engine.initialize().await.unwrap();
        Harness { store, engine }
    }

    fn processor(h: &Harness, max_batch_size: usize) -> BatchProcessor {
        BatchProcessor::new(
            h.engine.clone(),
            BatchOptions {
                max_batch_size,
                ..BatchOptions::default()
            },
        )
    }

    #[test]
    fn test_plan_orders_by_priority_and_chunks() {
        let requests = vec![
            RateLimitRequest::new("a", 1, 1000).with_priority(Priority::Low),
            RateLimitRequest::new("b", 1, 1000),
            RateLimitRequest::new("c", 1, 1000).with_priority(Priority::High),
            RateLimitRequest::new("d", 1, 1000),
            RateLimitRequest::new("e", 1, 1000).with_priority(Priority::High),
        ];

        let chunks = plan_chunks(&requests, Algorithm::FixedWindow, 2);
        assert_eq!(chunks, vec![vec![2, 4], vec![1, 3], vec![0]]);
    }

    #[test]
    fn test_plan_groups_sliding_window_parameters() {
        let requests = vec![
            RateLimitRequest::new("a", 5, 1000),
            RateLimitRequest::new("b", 10, 1000),
            RateLimitRequest::new("c", 5, 1000),
            RateLimitRequest::new("d", 5, 2000),
        ];

        let chunks = plan_chunks(&requests, Algorithm::SlidingWindow, 100);
        assert_eq!(chunks, vec![vec![0, 2], vec![1], vec![3]]);

        let chunks = plan_chunks(&requests, Algorithm::TokenBucket, 100);
        assert_eq!(chunks, vec![vec![0, 1, 2, 3]]);
    }

    #[tokio::test]
    async fn test_invalid_batch_makes_no_store_calls() {
        let h = harness().await;
        let processor = processor(&h, 100);
        let long_key = "k".repeat(251);

        let invalid = [
            RateLimitRequest::new("k", 0, 1000),
            RateLimitRequest::new("k", 1, 0),
            RateLimitRequest::new("k", 1, 86_400_001),
            RateLimitRequest::new(long_key.as_str(), 1, 1000),
        ];

        for bad in invalid {
            let before = h.store.round_trips();
            let batch = vec![
                RateLimitRequest::new("ok1", 1, 1000),
                bad,
                RateLimitRequest::new("ok2", 1, 1000),
            ];

            let result = processor.process_batch(&batch, Algorithm::SlidingWindow).await;
            match result {
                Err(LimiterError::Validation { index, .. }) => assert_eq!(index, 1),
                other => panic!("expected validation error, got {:?}", other),
            }
            assert_eq!(h.store.round_trips(), before);
        }
    }

    #[tokio::test]
    async fn test_empty_batch() {
        let h = harness().await;
        let results = processor(&h, 100)
            .process_batch(&[], Algorithm::FixedWindow)
            .await
            .unwrap();
        assert!(results.is_empty());
    }

    #[tokio::test]
    async fn test_results_follow_input_order() {
        let requests: Vec<_> = (0..7)
            .map(|i| {
                let priority = if i % 2 == 0 { Priority::Low } else { Priority::High };
                RateLimitRequest::new(format!("key{}", i), 3, 1000).with_priority(priority)
            })
            .collect();

        for algorithm in [
            Algorithm::SlidingWindow,
            Algorithm::TokenBucket,
            Algorithm::FixedWindow,
        ] {
            let h = harness().await;
            let results = processor(&h, 3)
                .process_batch(&requests, algorithm)
                .await
                .unwrap();
            let keys: Vec<_> = results.iter().map(|r| r.key.as_str()).collect();
            assert_eq!(keys, ["key0", "key1", "key2", "key3", "key4", "key5", "key6"]);
            assert!(results.iter().all(|r| r.allowed && r.algorithm == algorithm));
        }
    }

    #[tokio::test]
    async fn test_high_priority_goes_first() {
        let h = harness().await;
        let requests = vec![
            RateLimitRequest::new("shared", 1, 60_000).with_priority(Priority::Low),
            RateLimitRequest::new("shared", 1, 60_000),
            RateLimitRequest::new("shared", 1, 60_000).with_priority(Priority::High),
        ];

        let results = processor(&h, 100)
            .process_batch(&requests, Algorithm::FixedWindow)
            .await
            .unwrap();
        assert!(!results[0].allowed);
        assert!(!results[1].allowed);
        assert!(results[2].allowed);
    }

    #[tokio::test]
    async fn test_batch_matches_individual_decisions() {
        let requests: Vec<_> = (0..30)
            .map(|i| RateLimitRequest::new(format!("user:{}", i % 4), 5, 10_000))
            .collect();

        for algorithm in [
            Algorithm::SlidingWindow,
            Algorithm::TokenBucket,
            Algorithm::FixedWindow,
        ] {
            let single = harness().await;
            let mut expected = Vec::new();
            for request in &requests {
                expected.push(single.engine.evaluate(algorithm, request).await.unwrap().allowed);
            }

            let batched = harness().await;
            let results = processor(&batched, 100)
                .process_batch(&requests, algorithm)
                .await
                .unwrap();
            let actual: Vec<_> = results.iter().map(|r| r.allowed).collect();

            assert_eq!(actual, expected, "{} decisions differ", algorithm);
            assert_eq!(actual.iter().filter(|a| **a).count(), 20);
        }
    }

    #[tokio::test]
    async fn test_sliding_window_single_multi_key_call() {
        let h = harness().await;
        let requests: Vec<_> = (0..10)
            .map(|i| RateLimitRequest::new(format!("k{}", i), 2, 1000))
            .collect();

        let before = h.store.round_trips();
        processor(&h, 100)
            .process_batch(&requests, Algorithm::SlidingWindow)
            .await
            .unwrap();
        assert_eq!(h.store.round_trips() - before, 1);
    }

    #[tokio::test]
    async fn test_mixed_parameters_keep_their_own_limits() {
        let h = harness().await;
        let mut requests = Vec::new();
        for _ in 0..3 {
            requests.push(RateLimitRequest::new("small", 1, 1000));
            requests.push(RateLimitRequest::new("large", 3, 1000));
        }

        let results = processor(&h, 100)
            .process_batch(&requests, Algorithm::SlidingWindow)
            .await
            .unwrap();
        let small: Vec<_> = results.iter().step_by(2).map(|r| r.allowed).collect();
        let large: Vec<_> = results.iter().skip(1).step_by(2).map(|r| r.allowed).collect();
        assert_eq!(small, [true, false, false]);
        assert_eq!(large, [true, true, true]);
        assert!(results.iter().skip(1).step_by(2).all(|r| r.limit == 3));
    }

    #[tokio::test]
    async fn test_pipeline_failure_is_isolated_per_key() {
        let h = harness().await;
        h.store.fail_key("rl:bad");
        let requests = vec![
            RateLimitRequest::new("good", 5, 1000),
            RateLimitRequest::new("bad", 5, 1000),
            RateLimitRequest::new("fine", 5, 1000),
        ];

        let results = processor(&h, 100)
            .process_batch(&requests, Algorithm::TokenBucket)
            .await
            .unwrap();
        assert!(results[0].allowed && !results[0].is_error());
        assert!(results[1].is_error());
        assert!(!results[1].allowed);
        assert_eq!(results[1].total_hits, -1);
        assert!(results[2].allowed && !results[2].is_error());
    }

    #[tokio::test]
    async fn test_multi_key_failure_is_isolated_per_chunk() {
        let h = harness().await;
        h.store.fail_key("rl:k1");
        let requests: Vec<_> = (0..4)
            .map(|i| RateLimitRequest::new(format!("k{}", i), 5, 1000))
            .collect();

        let results = processor(&h, 2)
            .process_batch(&requests, Algorithm::SlidingWindow)
            .await
            .unwrap();
        assert!(results[0].is_error());
        assert!(results[1].is_error());
        assert!(results[2].allowed);
        assert!(results[3].allowed);
    }

    #[tokio::test]
    async fn test_unreachable_store_yields_error_results() {
        let h = harness().await;
        h.store.set_unreachable(true);
        let requests: Vec<_> = (0..3)
            .map(|i| RateLimitRequest::new(format!("k{}", i), 5, 1000))
            .collect();

        let results = processor(&h, 100)
            .process_batch(&requests, Algorithm::FixedWindow)
            .await
            .unwrap();
        assert!(results.iter().all(RateLimitResult::is_error));
    }

    #[tokio::test]
    async fn test_recovers_from_script_flush() {
        let h = harness().await;
        h.store.flush_scripts();
        let requests: Vec<_> = (0..3)
            .map(|i| RateLimitRequest::new(format!("k{}", i), 5, 1000))
            .collect();

        for algorithm in [Algorithm::FixedWindow, Algorithm::SlidingWindow] {
            let results = processor(&h, 100)
                .process_batch(&requests, algorithm)
                .await
                .unwrap();
            assert!(results.iter().all(|r| r.allowed && !r.is_error()));
            h.store.flush_scripts();
        }
    }

    #[tokio::test]
    async fn test_batch_timeout() {
        let h = harness().await;
        h.store.set_latency(Some(Duration::from_millis(200)));
        let processor = BatchProcessor::new(
            h.engine.clone(),
            BatchOptions {
                timeout: Duration::from_millis(20),
                ..BatchOptions::default()
            },
        );

        let result = processor
            .process_batch(&[RateLimitRequest::new("k", 1, 1000)], Algorithm::FixedWindow)
            .await;
        assert!(matches!(result, Err(LimiterError::Timeout(_))));
    }
}
