//! Script registry.
//!
//! Loads every program into the store once per process and caches the
//! returned handles. Reads never block; loads are single-flight.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::Mutex;
use tracing::{debug, info};

use super::scripts::{ScriptHandle, ScriptName};
use super::{Store, StoreError};

type HandleMap = HashMap<ScriptName, ScriptHandle>;

/// Process-wide cache of program handles.
///
/// Construct one at startup and share it by `Arc` with every consumer.
#[derive(Default)]
pub struct ScriptRegistry {
    handles: RwLock<Option<Arc<HandleMap>>>,
    /// Bumped after every successful load
    generation: AtomicU64,
    load_gate: Mutex<()>,
}

impl ScriptRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether handles are available.
    pub fn is_ready(&self) -> bool {
        self.handles.read().is_some()
    }

    /// Number of completed loads. Used to coalesce reloads.
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    /// Look up a handle without waiting.
    ///
    /// `None` means the registry is not ready; callers must fail the operation.
    pub fn handle(&self, name: ScriptName) -> Option<ScriptHandle> {
        self.handles
            .read()
            .as_ref()
            .and_then(|handles| handles.get(&name).cloned())
    }

    /// Load all programs if that has not happened yet.
    ///
    /// Concurrent callers wait for the one load in flight instead of issuing
    /// their own.
    pub async fn initialize(&self, store: &dyn Store) -> Result<(), StoreError> {
        if self.is_ready() {
            return Ok(());
        }

        let _gate = self.load_gate.lock().await;
        if self.is_ready() {
            return Ok(());
        }

        self.load_all(store).await
    }

    /// Re-register every program, e.g. after the store lost its script cache.
    pub async fn force_reinitialize(&self, store: &dyn Store) -> Result<(), StoreError> {
        let _gate = self.load_gate.lock().await;
        self.load_all(store).await
    }

    /// Re-register unless another caller already did so since `observed`.
    pub async fn reinitialize_if_stale(
        &self,
        store: &dyn Store,
        observed: u64,
    ) -> Result<(), StoreError> {
        let _gate = self.load_gate.lock().await;
        if self.generation() != observed {
            debug!(observed, current = self.generation(), "Scripts already reloaded");
            return Ok(());
        }
        self.load_all(store).await
    }

    async fn load_all(&self, store: &dyn Store) -> Result<(), StoreError> {
        let mut handles = HashMap::with_capacity(ScriptName::ALL.len());
        for name in ScriptName::ALL {
            let sha = store.load_script(name).await?;
            debug!(script = %name, sha = %sha, "Registered script");
            handles.insert(name, ScriptHandle { name, sha });
        }

        *self.handles.write() = Some(Arc::new(handles));
        let generation = self.generation.fetch_add(1, Ordering::AcqRel) + 1;
        info!(
            scripts = ScriptName::ALL.len(),
            generation, "Script registry loaded"
        );
        Ok(())
    }
}
