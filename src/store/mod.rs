//! Backing store abstraction.
//!
//! The engine needs two things from a store: atomic server-side evaluation of
//! a small program against one or more keys, and per-key expiration. Every
//! decision the limiter makes happens inside one such evaluation, so callers
//! never read-then-write from their own process.

mod memory;
mod redis;
mod registry;
mod scripts;

use async_trait::async_trait;
use thiserror::Error;

pub use self::memory::MemoryStore;
pub use self::redis::RedisStore;
pub use self::registry::ScriptRegistry;
pub use self::scripts::{ScriptHandle, ScriptName, ScriptReply, REPLY_WIDTH};

/// Errors reported by a backing store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The store does not know the handle, e.g. after a restart flushed its script cache
    #[error("Script not loaded: {0}")]
    NoScript(String),

    /// Connection failures and timeouts
    #[error("Connection error: {0}")]
    Connection(String),

    /// The program raised an error while running
    #[error("Script error: {0}")]
    Script(String),

    /// The reply did not have the expected shape
    #[error("Unexpected reply: {0}")]
    Protocol(String),
}

impl StoreError {
    /// Whether the store forgot a registered program.
    pub fn is_no_script(&self) -> bool {
        matches!(self, StoreError::NoScript(_))
    }

    /// Whether the failure came from the transport rather than the program.
    pub fn is_connection(&self) -> bool {
        matches!(self, StoreError::Connection(_))
    }
}

/// One program invocation: a handle, the keys it touches and its arguments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScriptCall {
    pub handle: ScriptHandle,
    pub keys: Vec<String>,
    pub args: Vec<String>,
}

impl ScriptCall {
    pub fn new(handle: ScriptHandle, keys: Vec<String>, args: Vec<String>) -> Self {
        Self { handle, keys, args }
    }
}

/// Trait for backing store implementations.
///
/// This trait abstracts over the Redis store used in production and the
/// in-process store used by tests and local runs.
#[async_trait]
pub trait Store: Send + Sync {
    /// Register a program and return the handle the store knows it by.
    async fn load_script(&self, name: ScriptName) -> Result<String, StoreError>;

    /// Atomically evaluate one registered program.
    async fn eval(&self, call: &ScriptCall) -> Result<Vec<i64>, StoreError>;

    /// Evaluate several programs in one round trip.
    ///
    /// The outer error is reserved for failures of the round trip as a whole;
    /// a failing command only fails its own slot.
    async fn eval_pipeline(
        &self,
        calls: &[ScriptCall],
    ) -> Result<Vec<Result<Vec<i64>, StoreError>>, StoreError>;

    /// Remove keys, returning how many existed.
    async fn delete(&self, keys: &[String]) -> Result<u64, StoreError>;
}
