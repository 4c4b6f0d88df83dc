//! In-process store.
//!
//! Runs the same programs as the Redis store, natively, under a single lock so
//! each evaluation is atomic with respect to every other. Expiration is
//! checked lazily against the injected clock. Fault injection hooks let tests
//! simulate outages, script cache flushes, slow round trips and failing keys.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use sha2::{Digest, Sha256};
use tracing::trace;

use super::scripts::{ScriptName, ScriptReply, REPLY_WIDTH};
use super::{ScriptCall, Store, StoreError};
use crate::ratelimit::Clock;

#[derive(Debug, Clone)]
enum Value {
    /// Sliding window hits as `(score, member)`, oldest first
    Hits(Vec<(i64, String)>),
    Bucket { tokens: f64, last_refill: i64 },
    Counter(i64),
}

#[derive(Debug, Clone)]
struct Entry {
    value: Value,
    expires_at: Option<i64>,
}

/// Keyspace view bound to one instant.
struct Keyspace<'a> {
    entries: &'a mut HashMap<String, Entry>,
    now: i64,
}

impl Keyspace<'_> {
    fn purge(&mut self, key: &str) {
        let expired = self
            .entries
            .get(key)
            .and_then(|e| e.expires_at)
            .is_some_and(|at| at <= self.now);
        if expired {
            self.entries.remove(key);
        }
    }

    fn get(&mut self, key: &str) -> Option<&Entry> {
        self.purge(key);
        self.entries.get(key)
    }

    fn get_mut(&mut self, key: &str) -> Option<&mut Entry> {
        self.purge(key);
        self.entries.get_mut(key)
    }

    fn expire(&mut self, key: &str, ttl_ms: i64) {
        let at = self.now + ttl_ms;
        if let Some(entry) = self.entries.get_mut(key) {
            entry.expires_at = Some(at);
        }
    }
}

fn wrong_type(key: &str) -> StoreError {
    StoreError::Script(format!(
        "WRONGTYPE Operation against a key holding the wrong kind of value: {}",
        key
    ))
}

/// Positional program arguments.
struct Args<'a>(&'a [String]);

impl Args<'_> {
    fn raw(&self, index: usize) -> Result<&str, StoreError> {
        self.0
            .get(index)
            .map(String::as_str)
            .ok_or_else(|| StoreError::Script(format!("missing argument {}", index + 1)))
    }

    fn int(&self, index: usize) -> Result<i64, StoreError> {
        let raw = self.raw(index)?;
        raw.parse().map_err(|_| {
            StoreError::Script(format!("argument {} is not an integer: {}", index + 1, raw))
        })
    }
}

fn single_key(keys: &[String]) -> Result<&str, StoreError> {
    match keys {
        [key] => Ok(key),
        _ => Err(StoreError::Script(format!(
            "expected exactly one key, got {}",
            keys.len()
        ))),
    }
}

fn sliding_window(
    space: &mut Keyspace<'_>,
    key: &str,
    now: i64,
    window: i64,
    limit: i64,
    ttl: i64,
    member: String,
) -> Result<ScriptReply, StoreError> {
    let hits = match space.get_mut(key) {
        Some(Entry {
            value: Value::Hits(hits),
            ..
        }) => {
            hits.retain(|(score, _)| *score > now - window);
            hits.clone()
        }
        Some(_) => return Err(wrong_type(key)),
        None => Vec::new(),
    };

    let count = hits.len() as i64;
    let mut allowed = false;
    let mut retry = 0;
    if count < limit {
        let mut hits = hits;
        hits.push((now, member));
        hits.sort_by_key(|(score, _)| *score);
        space.entries.insert(
            key.to_string(),
            Entry {
                value: Value::Hits(hits),
                expires_at: None,
            },
        );
        space.expire(key, ttl);
        allowed = true;
    } else if let Some((oldest, _)) = hits.first() {
        retry = (oldest + window - now).max(0);
    }

    let total = count + 1;
    Ok(ScriptReply {
        allowed,
        remaining: (limit - total).max(0) as u64,
        reset_ms: now + window,
        total_hits: total,
        exists: true,
        retry_after_ms: retry,
    })
}

fn sliding_window_peek(
    space: &mut Keyspace<'_>,
    key: &str,
    now: i64,
    window: i64,
    limit: i64,
) -> Result<ScriptReply, StoreError> {
    let (exists, in_window) = match space.get(key) {
        Some(Entry {
            value: Value::Hits(hits),
            ..
        }) => {
            let in_window: Vec<i64> = hits
                .iter()
                .map(|(score, _)| *score)
                .filter(|score| *score > now - window)
                .collect();
            (true, in_window)
        }
        Some(_) => return Err(wrong_type(key)),
        None => (false, Vec::new()),
    };

    let count = in_window.len() as i64;
    let allowed = count < limit;
    let retry = match in_window.first() {
        Some(oldest) if !allowed => (oldest + window - now).max(0),
        _ => 0,
    };

    Ok(ScriptReply {
        allowed,
        remaining: (limit - count).max(0) as u64,
        reset_ms: now + window,
        total_hits: count,
        exists,
        retry_after_ms: retry,
    })
}

/// Refill the bucket state up to `now`. Returns `(tokens, existed)`.
fn refill(
    space: &mut Keyspace<'_>,
    key: &str,
    now: i64,
    capacity: f64,
    rate: f64,
) -> Result<(f64, bool), StoreError> {
    let (tokens, last, existed) = match space.get(key) {
        Some(Entry {
            value: Value::Bucket {
                tokens,
                last_refill,
            },
            ..
        }) => (*tokens, *last_refill, true),
        Some(_) => return Err(wrong_type(key)),
        None => (capacity, now, false),
    };
    let elapsed = (now - last).max(0) as f64;
    Ok((capacity.min(tokens + elapsed * rate), existed))
}

fn token_wait(tokens: f64, rate: f64) -> i64 {
    if tokens < 1.0 {
        ((1.0 - tokens) / rate).ceil() as i64
    } else {
        0
    }
}

fn token_bucket(
    space: &mut Keyspace<'_>,
    key: &str,
    now: i64,
    capacity: i64,
    window: i64,
    ttl: i64,
) -> Result<ScriptReply, StoreError> {
    let rate = capacity as f64 / window as f64;
    let (mut tokens, _) = refill(space, key, now, capacity as f64, rate)?;

    let allowed = tokens >= 1.0;
    if allowed {
        tokens -= 1.0;
    }

    space.entries.insert(
        key.to_string(),
        Entry {
            value: Value::Bucket {
                tokens,
                last_refill: now,
            },
            expires_at: None,
        },
    );
    space.expire(key, ttl);

    let wait = token_wait(tokens, rate);
    let remaining = tokens.floor() as i64;
    Ok(ScriptReply {
        allowed,
        remaining: remaining as u64,
        reset_ms: now + wait,
        total_hits: capacity - remaining,
        exists: true,
        retry_after_ms: if allowed { 0 } else { wait },
    })
}

fn token_bucket_peek(
    space: &mut Keyspace<'_>,
    key: &str,
    now: i64,
    capacity: i64,
    window: i64,
) -> Result<ScriptReply, StoreError> {
    let rate = capacity as f64 / window as f64;
    let (tokens, exists) = refill(space, key, now, capacity as f64, rate)?;

    let wait = token_wait(tokens, rate);
    let remaining = tokens.floor() as i64;
    Ok(ScriptReply {
        allowed: tokens >= 1.0,
        remaining: remaining as u64,
        reset_ms: now + wait,
        total_hits: capacity - remaining,
        exists,
        retry_after_ms: wait,
    })
}

fn fixed_window(
    space: &mut Keyspace<'_>,
    key: &str,
    now: i64,
    window_end: i64,
    limit: i64,
    ttl: i64,
) -> Result<ScriptReply, StoreError> {
    let count = match space.get_mut(key) {
        Some(Entry {
            value: Value::Counter(count),
            ..
        }) => {
            *count += 1;
            *count
        }
        Some(_) => return Err(wrong_type(key)),
        None => {
            space.entries.insert(
                key.to_string(),
                Entry {
                    value: Value::Counter(1),
                    expires_at: None,
                },
            );
            space.expire(key, ttl);
            1
        }
    };

    let allowed = count <= limit;
    Ok(ScriptReply {
        allowed,
        remaining: (limit - count).max(0) as u64,
        reset_ms: window_end,
        total_hits: count,
        exists: true,
        retry_after_ms: if allowed { 0 } else { (window_end - now).max(0) },
    })
}

fn fixed_window_peek(
    space: &mut Keyspace<'_>,
    key: &str,
    now: i64,
    window_end: i64,
    limit: i64,
) -> Result<ScriptReply, StoreError> {
    let (count, exists) = match space.get(key) {
        Some(Entry {
            value: Value::Counter(count),
            ..
        }) => (*count, true),
        Some(_) => return Err(wrong_type(key)),
        None => (0, false),
    };

    let allowed = count < limit;
    Ok(ScriptReply {
        allowed,
        remaining: (limit - count).max(0) as u64,
        reset_ms: window_end,
        total_hits: count,
        exists,
        retry_after_ms: if allowed { 0 } else { (window_end - now).max(0) },
    })
}

/// Execute one program against the keyspace.
fn run(
    space: &mut Keyspace<'_>,
    name: ScriptName,
    keys: &[String],
    args: &[String],
) -> Result<Vec<i64>, StoreError> {
    let args = Args(args);
    let reply = match name {
        ScriptName::SlidingWindow => sliding_window(
            space,
            single_key(keys)?,
            args.int(0)?,
            args.int(1)?,
            args.int(2)?,
            args.int(3)?,
            args.raw(4)?.to_string(),
        )?,
        ScriptName::SlidingWindowBatch => {
            let (now, window, limit, ttl) =
                (args.int(0)?, args.int(1)?, args.int(2)?, args.int(3)?);
            let nonce = args.raw(4)?;
            let mut out = Vec::with_capacity(keys.len() * REPLY_WIDTH);
            for (i, key) in keys.iter().enumerate() {
                let member = format!("{}:{}", nonce, i + 1);
                let reply = sliding_window(space, key, now, window, limit, ttl, member)?;
                out.extend_from_slice(&reply.to_values());
            }
            return Ok(out);
        }
        ScriptName::SlidingWindowPeek => sliding_window_peek(
            space,
            single_key(keys)?,
            args.int(0)?,
            args.int(1)?,
            args.int(2)?,
        )?,
        ScriptName::TokenBucket => token_bucket(
            space,
            single_key(keys)?,
            args.int(0)?,
            args.int(1)?,
            args.int(2)?,
            args.int(3)?,
        )?,
        ScriptName::TokenBucketPeek => token_bucket_peek(
            space,
            single_key(keys)?,
            args.int(0)?,
            args.int(1)?,
            args.int(2)?,
        )?,
        ScriptName::FixedWindow => fixed_window(
            space,
            single_key(keys)?,
            args.int(0)?,
            args.int(1)?,
            args.int(2)?,
            args.int(3)?,
        )?,
        ScriptName::FixedWindowPeek => fixed_window_peek(
            space,
            single_key(keys)?,
            args.int(0)?,
            args.int(1)?,
            args.int(2)?,
        )?,
    };
    Ok(reply.to_values().to_vec())
}

/// A store that keeps all state in process memory.
pub struct MemoryStore {
    clock: Arc<dyn Clock>,
    entries: Mutex<HashMap<String, Entry>>,
    scripts: RwLock<HashMap<String, ScriptName>>,
    round_trips: AtomicU64,
    script_loads: AtomicU64,
    unreachable: AtomicBool,
    latency: Mutex<Option<Duration>>,
    failing_keys: RwLock<HashSet<String>>,
}

impl MemoryStore {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            entries: Mutex::new(HashMap::new()),
            scripts: RwLock::new(HashMap::new()),
            round_trips: AtomicU64::new(0),
            script_loads: AtomicU64::new(0),
            unreachable: AtomicBool::new(false),
            latency: Mutex::new(None),
            failing_keys: RwLock::new(HashSet::new()),
        }
    }

    /// Number of round trips served, including failed ones.
    pub fn round_trips(&self) -> u64 {
        self.round_trips.load(Ordering::SeqCst)
    }

    /// Number of programs registered since creation.
    pub fn script_loads(&self) -> u64 {
        self.script_loads.load(Ordering::SeqCst)
    }

    /// Make every call fail with a connection error.
    pub fn set_unreachable(&self, unreachable: bool) {
        self.unreachable.store(unreachable, Ordering::SeqCst);
    }

    /// Delay every round trip.
    pub fn set_latency(&self, latency: Option<Duration>) {
        *self.latency.lock() = latency;
    }

    /// Forget every registered program, as a restarted Redis would.
    pub fn flush_scripts(&self) {
        self.scripts.write().clear();
    }

    /// Make any program touching `key` fail.
    pub fn fail_key(&self, key: impl Into<String>) {
        self.failing_keys.write().insert(key.into());
    }

    /// Whether `key` currently holds live state.
    pub fn contains_key(&self, key: &str) -> bool {
        let mut entries = self.entries.lock();
        let mut space = Keyspace {
            entries: &mut *entries,
            now: self.clock.now_ms(),
        };
        space.get(key).is_some()
    }

    /// Remaining time to live of `key`, if it has one.
    pub fn ttl_ms(&self, key: &str) -> Option<i64> {
        let now = self.clock.now_ms();
        let mut entries = self.entries.lock();
        let mut space = Keyspace {
            entries: &mut *entries,
            now,
        };
        space.get(key).and_then(|e| e.expires_at).map(|at| at - now)
    }

    async fn round_trip(&self) -> Result<(), StoreError> {
        self.round_trips.fetch_add(1, Ordering::SeqCst);
        let latency = *self.latency.lock();
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
        if self.unreachable.load(Ordering::SeqCst) {
            return Err(StoreError::Connection("store unreachable".to_string()));
        }
        Ok(())
    }

    fn execute(&self, call: &ScriptCall) -> Result<Vec<i64>, StoreError> {
        let name = self
            .scripts
            .read()
            .get(&call.handle.sha)
            .copied()
            .ok_or_else(|| StoreError::NoScript(call.handle.sha.clone()))?;

        {
            let failing = self.failing_keys.read();
            if let Some(key) = call.keys.iter().find(|k| failing.contains(*k)) {
                return Err(StoreError::Script(format!("injected failure for {}", key)));
            }
        }

        trace!(script = %name, keys = call.keys.len(), "Evaluating script in memory");
        let mut entries = self.entries.lock();
        let mut space = Keyspace {
            entries: &mut *entries,
            now: self.clock.now_ms(),
        };
        run(&mut space, name, &call.keys, &call.args)
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn load_script(&self, name: ScriptName) -> Result<String, StoreError> {
        self.round_trip().await?;
        let sha = format!("{:x}", Sha256::digest(name.source().as_bytes()));
        self.scripts.write().insert(sha.clone(), name);
        self.script_loads.fetch_add(1, Ordering::SeqCst);
        Ok(sha)
    }

    async fn eval(&self, call: &ScriptCall) -> Result<Vec<i64>, StoreError> {
        self.round_trip().await?;
        self.execute(call)
    }

    async fn eval_pipeline(
        &self,
        calls: &[ScriptCall],
    ) -> Result<Vec<Result<Vec<i64>, StoreError>>, StoreError> {
        self.round_trip().await?;
        Ok(calls.iter().map(|call| self.execute(call)).collect())
    }

    async fn delete(&self, keys: &[String]) -> Result<u64, StoreError> {
        self.round_trip().await?;
        let mut entries = self.entries.lock();
        let mut space = Keyspace {
            entries: &mut *entries,
            now: self.clock.now_ms(),
        };
        let mut removed = 0;
        for key in keys {
            space.purge(key);
            if space.entries.remove(key).is_some() {
                removed += 1;
            }
        }
        Ok(removed)
    }
}
