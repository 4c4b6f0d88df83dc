//! Redis-backed store.

use std::collections::HashMap;

use async_trait::async_trait;
use futures::future::join_all;
use redis::aio::ConnectionManager;
use redis::{Client, ErrorKind, RedisError};
use tracing::{debug, info};

use super::scripts::ScriptName;
use super::{ScriptCall, Store, StoreError};

impl From<RedisError> for StoreError {
    fn from(err: RedisError) -> Self {
        if err.kind() == ErrorKind::NoScriptError {
            StoreError::NoScript(err.to_string())
        } else if err.is_io_error()
            || err.is_timeout()
            || err.is_connection_dropped()
            || err.is_connection_refusal()
        {
            StoreError::Connection(err.to_string())
        } else if err.kind() == ErrorKind::TypeError {
            StoreError::Protocol(err.to_string())
        } else {
            StoreError::Script(err.to_string())
        }
    }
}

/// A store backed by a Redis server.
///
/// Uses one multiplexed, auto-reconnecting connection shared by every caller.
#[derive(Clone)]
pub struct RedisStore {
    connection: ConnectionManager,
}

impl RedisStore {
    /// Connect to the server at `url`.
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let client = Client::open(url)?;
        let connection = ConnectionManager::new(client).await?;
        info!("Connected to Redis");
        Ok(Self { connection })
    }

    fn evalsha(call: &ScriptCall) -> redis::Cmd {
        let mut cmd = redis::cmd("EVALSHA");
        cmd.arg(&call.handle.sha).arg(call.keys.len());
        for key in &call.keys {
            cmd.arg(key);
        }
        for arg in &call.args {
            cmd.arg(arg);
        }
        cmd
    }
}

/// Split call indices into lanes of calls that touch the same keys, in input order.
fn key_lanes(calls: &[ScriptCall]) -> Vec<Vec<usize>> {
    let mut lanes: Vec<Vec<usize>> = Vec::new();
    let mut lane_of: HashMap<&[String], usize> = HashMap::new();
    for (index, call) in calls.iter().enumerate() {
        let lane = *lane_of.entry(call.keys.as_slice()).or_insert_with(|| {
            lanes.push(Vec::new());
            lanes.len() - 1
        });
        lanes[lane].push(index);
    }
    lanes
}

#[async_trait]
impl Store for RedisStore {
    async fn load_script(&self, name: ScriptName) -> Result<String, StoreError> {
        let mut conn = self.connection.clone();
        let sha: String = redis::cmd("SCRIPT")
            .arg("LOAD")
            .arg(name.source())
            .query_async(&mut conn)
            .await?;
        debug!(script = %name, sha = %sha, "Loaded script into Redis");
        Ok(sha)
    }

    async fn eval(&self, call: &ScriptCall) -> Result<Vec<i64>, StoreError> {
        let mut conn = self.connection.clone();
        let reply: Vec<i64> = Self::evalsha(call).query_async(&mut conn).await?;
        Ok(reply)
    }

    async fn eval_pipeline(
        &self,
        calls: &[ScriptCall],
    ) -> Result<Vec<Result<Vec<i64>, StoreError>>, StoreError> {
        // Each call is its own request on the shared multiplexed connection,
        // so a failing call reports its own error without failing the rest.
        // Calls on the same keys are awaited in input order; other calls
        // overlap.
        let pending = key_lanes(calls).into_iter().map(|lane| {
            let mut conn = self.connection.clone();
            async move {
                let mut replies = Vec::with_capacity(lane.len());
                for index in lane {
                    let reply: Result<Vec<i64>, RedisError> =
                        Self::evalsha(&calls[index]).query_async(&mut conn).await;
                    replies.push((index, reply.map_err(StoreError::from)));
                }
                replies
            }
        });
        let mut slots: Vec<Option<Result<Vec<i64>, StoreError>>> =
            calls.iter().map(|_| None).collect();
        for (index, reply) in join_all(pending).await.into_iter().flatten() {
            slots[index] = Some(reply);
        }
        let results: Vec<_> = slots
            .into_iter()
            .map(|slot| {
                slot.unwrap_or_else(|| Err(StoreError::Protocol("missing reply".to_string())))
            })
            .collect();

        // A dropped connection fails every slot; report it once for the whole trip.
        let all_dropped = results
            .iter()
            .all(|r| matches!(r, Err(StoreError::Connection(_))));
        if !results.is_empty() && all_dropped {
            if let Some(Err(err)) = results.into_iter().next() {
                return Err(err);
            }
            return Err(StoreError::Connection("pipeline failed".to_string()));
        }
        Ok(results)
    }

    async fn delete(&self, keys: &[String]) -> Result<u64, StoreError> {
        if keys.is_empty() {
            return Ok(0);
        }
        let mut conn = self.connection.clone();
        let mut cmd = redis::cmd("DEL");
        for key in keys {
            cmd.arg(key);
        }
        let removed: u64 = cmd.query_async(&mut conn).await?;
        Ok(removed)
    }
}
