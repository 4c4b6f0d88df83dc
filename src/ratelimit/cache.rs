//! Local cache of recent denials.
//!
//! A denied key stays denied until its `retry_after` elapses (barring an
//! explicit reset), so repeated checks in that interval can be answered
//! without a store round trip.

use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

use dashmap::DashMap;

use super::types::RateLimitResult;

/// Entry count above which `remember` sweeps out expired denials.
const SWEEP_THRESHOLD: usize = 1024;
/// Minimum time between two sweeps.
const SWEEP_INTERVAL_MS: i64 = 1_000;

#[derive(Debug, Clone)]
struct CachedDenial {
    result: RateLimitResult,
    until_ms: i64,
}

/// Per-process map from key to its most recent denial.
#[derive(Debug, Default)]
pub struct DenialCache {
    entries: DashMap<String, CachedDenial>,
    next_sweep_ms: AtomicI64,
}

impl DenialCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Remember a denial observed at `now_ms`. Allowed and error results are ignored.
    pub fn remember(&self, result: &RateLimitResult, now_ms: i64) {
        if result.allowed || result.is_error() || result.retry_after.is_zero() {
            return;
        }
        if self.entries.len() >= SWEEP_THRESHOLD {
            self.sweep(now_ms);
        }
        let until_ms = now_ms + result.retry_after.as_millis() as i64;
        self.entries.insert(
            result.key.clone(),
            CachedDenial {
                result: result.clone(),
                until_ms,
            },
        );
    }

    /// Return the cached denial for `key` if it is still in force.
    pub fn lookup(&self, key: &str, now_ms: i64) -> Option<RateLimitResult> {
        let hit = {
            let entry = self.entries.get(key)?;
            if entry.until_ms > now_ms {
                let mut result = entry.result.clone();
                result.cached = true;
                result.retry_after = Duration::from_millis((entry.until_ms - now_ms) as u64);
                result.response_time = Duration::ZERO;
                Some(result)
            } else {
                None
            }
        };

        if hit.is_none() {
            self.entries.remove_if(key, |_, entry| entry.until_ms <= now_ms);
        }
        hit
    }

    /// Drop every denial that has expired by `now_ms`, at most once per interval.
    fn sweep(&self, now_ms: i64) {
        if now_ms < self.next_sweep_ms.load(Ordering::Relaxed) {
            return;
        }
        self.next_sweep_ms.store(now_ms + SWEEP_INTERVAL_MS, Ordering::Relaxed);
        self.entries.retain(|_, entry| entry.until_ms > now_ms);
    }

    pub fn evict(&self, key: &str) {
        self.entries.remove(key);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
