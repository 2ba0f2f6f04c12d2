//! Engines attached to live jobs, by configuration name.
//!
//! Several jobs may run the same configuration. Each install pushes a lease
//! onto that name's stack; lookups see the most recent one, and releasing a
//! lease removes exactly that entry so the previous engine becomes visible
//! again.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::aggregator::AggregationEngine;

type Stack = Vec<(u64, Arc<AggregationEngine>)>;

/// Shared name → engine map. Cloning shares the map.
#[derive(Clone, Default)]
pub struct EngineRegistry {
    entries: Arc<RwLock<HashMap<String, Stack>>>,
    next_lease: Arc<AtomicU64>,
}

impl EngineRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `engine` the visible one for `config_name` until the lease is
    /// released.
    pub async fn install(
        &self,
        config_name: impl Into<String>,
        engine: Arc<AggregationEngine>,
    ) -> EngineLease {
        let config_name = config_name.into();
        let id = self.next_lease.fetch_add(1, Ordering::Relaxed);
        let mut entries = self.entries.write().await;
        let stack = entries.entry(config_name.clone()).or_default();
        stack.push((id, engine));
        debug!(config = %config_name, lease = id, depth = stack.len(), "engine installed");
        EngineLease {
            registry: self.clone(),
            config_name,
            id,
            released: AtomicBool::new(false),
        }
    }

    /// The most recently installed engine still leased under this name.
    pub async fn get(&self, config_name: &str) -> Option<Arc<AggregationEngine>> {
        self.entries
            .read()
            .await
            .get(config_name)
            .and_then(|stack| stack.last())
            .map(|(_, engine)| engine.clone())
    }

    pub async fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.entries.read().await.keys().cloned().collect();
        names.sort();
        names
    }

    async fn remove(&self, config_name: &str, id: u64) -> bool {
        let mut entries = self.entries.write().await;
        let Some(stack) = entries.get_mut(config_name) else {
            return false;
        };
        let before = stack.len();
        stack.retain(|(lease, _)| *lease != id);
        let removed = stack.len() != before;
        if stack.is_empty() {
            entries.remove(config_name);
        }
        removed
    }
}

/// One installed engine. Release it when its job ends.
pub struct EngineLease {
    registry: EngineRegistry,
    config_name: String,
    id: u64,
    released: AtomicBool,
}

impl EngineLease {
    pub fn config_name(&self) -> &str {
        &self.config_name
    }

    /// Remove this lease's entry. Later calls do nothing.
    pub async fn release(&self) -> bool {
        if self.released.swap(true, Ordering::SeqCst) {
            return false;
        }
        let removed = self.registry.remove(&self.config_name, self.id).await;
        debug!(config = %self.config_name, lease = self.id, removed, "engine released");
        removed
    }

    /// Release after `grace`, so late status readers still find the engine.
    pub fn release_after(self: Arc<Self>, grace: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            if !grace.is_zero() {
                tokio::time::sleep(grace).await;
            }
            self.release().await;
        })
    }
}
