//! Race-free "last child wins" join barrier
//!
//! Siblings completing on different workers serialize their read-then-remove
//! step on a completion lock scoped to the parent key. Exactly one of them
//! sees itself as the sole remaining child.

use crate::core::config::EngineConfig;
use crate::core::errors::Result;
use crate::identity::NodeKey;
use crate::storage::{GraphStore, KvStore};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace, warn};
use uuid::Uuid;

/// Mutual-exclusion marker `<parent>:lock` in the shared store
pub struct CompletionLock {
    store: Arc<dyn KvStore>,
    key: String,
    token: String,
}

impl CompletionLock {
    /// Spin until the marker is ours. There is no retry bound; the lease
    /// lets a marker left behind by a crashed holder be taken over.
    pub async fn acquire(
        store: Arc<dyn KvStore>,
        parent: &NodeKey,
        config: &EngineConfig,
    ) -> Result<Self> {
        let key = parent.lock_key();
        let token = Uuid::new_v4().to_string();
        let mut attempts: u64 = 0;
        while !store.set_nx(&key, &token, config.lock_lease()).await? {
            attempts += 1;
            trace!(lock = %key, attempts, "Completion lock busy");
            tokio::time::sleep(backoff(config)).await;
        }
        debug!(lock = %key, attempts, "Acquired completion lock");
        Ok(Self { store, key, token })
    }

    pub async fn release(self) -> Result<()> {
        if !self.store.del_if_value(&self.key, &self.token).await? {
            warn!(lock = %self.key, "Completion lock lease ran out before release");
        }
        Ok(())
    }
}

fn backoff(config: &EngineConfig) -> Duration {
    let base = config.lock_retry_interval();
    let jitter = base.mul_f64(config.lock_jitter * fastrand::f64());
    base + jitter
}

pub struct JoinBarrier<'a> {
    graph: &'a GraphStore,
    config: &'a EngineConfig,
}

impl<'a> JoinBarrier<'a> {
    pub fn new(graph: &'a GraphStore, config: &'a EngineConfig) -> Self {
        Self { graph, config }
    }

    /// Remove `child`'s edge and report whether it was the last pending child
    /// of `parent`. The edge is removed whatever the answer.
    pub async fn arrive(&self, child: &NodeKey, parent: &NodeKey) -> Result<bool> {
        let lock = CompletionLock::acquire(self.graph.kv().clone(), parent, self.config).await?;
        let decision = self.decide(child, parent).await;
        let released = lock.release().await;
        let last = decision?;
        released?;
        debug!(child = %child, parent = %parent, last, "Child arrived at barrier");
        Ok(last)
    }

    async fn decide(&self, child: &NodeKey, parent: &NodeKey) -> Result<bool> {
        let last = self.graph.is_sole_remaining_child(child, parent).await?;
        self.graph.remove_edge(child, parent).await?;
        Ok(last)
    }
}
