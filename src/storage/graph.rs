//! Parent/child edges and tree liveness on top of a [`KvStore`]
//!
//! Layout:
//! - `jobtree:node:parents` hash, child key -> parent key
//! - `<parent key>:children` set of pending child keys
//! - `jobtree:tree:launched` set of root keys in flight

use super::KvStore;
use crate::core::errors::{Result, TreeError};
use crate::identity::{NodeKey, LAUNCHED_TREES_KEY, PARENTS_KEY};
use crate::node::Node;
use std::sync::Arc;
use tracing::debug;

#[derive(Clone)]
pub struct GraphStore {
    store: Arc<dyn KvStore>,
}

impl GraphStore {
    pub fn new(store: Arc<dyn KvStore>) -> Self {
        Self { store }
    }

    pub fn kv(&self) -> &Arc<dyn KvStore> {
        &self.store
    }

    pub async fn register_edge(&self, child: &Node, parent: &NodeKey) -> Result<()> {
        if child.is_root() {
            return Err(TreeError::RootRegistration {
                key: child.key().to_string(),
            });
        }
        let added = self
            .store
            .sadd(&parent.children_key(), child.key().as_str())
            .await?;
        if !added {
            return Err(TreeError::duplicate_child(parent.as_str(), child.key().as_str()));
        }
        self.store
            .hset(PARENTS_KEY, child.key().as_str(), parent.as_str())
            .await?;
        debug!(child = %child.key(), parent = %parent, "Registered edge");
        Ok(())
    }

    /// Idempotent
    pub async fn remove_edge(&self, child: &NodeKey, parent: &NodeKey) -> Result<()> {
        self.store
            .srem(&parent.children_key(), child.as_str())
            .await?;
        self.store.hdel(PARENTS_KEY, child.as_str()).await?;
        debug!(child = %child, parent = %parent, "Removed edge");
        Ok(())
    }

    pub async fn child_set_size(&self, parent: &NodeKey) -> Result<usize> {
        self.store.scard(&parent.children_key()).await
    }

    pub async fn child_set_members(&self, parent: &NodeKey) -> Result<Vec<NodeKey>> {
        Ok(self
            .store
            .smembers(&parent.children_key())
            .await?
            .into_iter()
            .map(NodeKey::from_raw)
            .collect())
    }

    pub async fn remove_child(&self, parent: &NodeKey, child: &NodeKey) -> Result<()> {
        self.store
            .srem(&parent.children_key(), child.as_str())
            .await?;
        debug!(child = %child, parent = %parent, "Dropped child from set");
        Ok(())
    }

    pub async fn delete_child_set(&self, parent: &NodeKey) -> Result<()> {
        self.store.del(&parent.children_key()).await?;
        Ok(())
    }

    /// True when `child` is the only key left in the parent's child-set. A
    /// child that is no longer a member is never the last one.
    pub async fn is_sole_remaining_child(
        &self,
        child: &NodeKey,
        parent: &NodeKey,
    ) -> Result<bool> {
        let members = self.store.smembers(&parent.children_key()).await?;
        Ok(matches!(members.as_slice(), [only] if only == child.as_str()))
    }

    pub async fn parent_of(&self, child: &NodeKey) -> Result<Option<NodeKey>> {
        Ok(self
            .store
            .hget(PARENTS_KEY, child.as_str())
            .await?
            .map(NodeKey::from_raw))
    }

    pub async fn remove_parent_entry(&self, child: &NodeKey) -> Result<()> {
        self.store.hdel(PARENTS_KEY, child.as_str()).await?;
        Ok(())
    }

    /// Roots live through the launched set; other nodes through their own
    /// child-set or their parent index entry.
    pub async fn exists(&self, node: &Node) -> Result<bool> {
        if node.is_root() {
            return self.is_tree_launched(node.key()).await;
        }
        if self.store.exists(&node.key().children_key()).await? {
            return Ok(true);
        }
        self.store.hexists(PARENTS_KEY, node.key().as_str()).await
    }

    /// False when the tree was already in flight
    pub async fn mark_tree_launched(&self, root: &NodeKey) -> Result<bool> {
        self.store.sadd(LAUNCHED_TREES_KEY, root.as_str()).await
    }

    pub async fn unmark_tree_launched(&self, root: &NodeKey) -> Result<()> {
        self.store.srem(LAUNCHED_TREES_KEY, root.as_str()).await?;
        Ok(())
    }

    pub async fn is_tree_launched(&self, root: &NodeKey) -> Result<bool> {
        self.store.sismember(LAUNCHED_TREES_KEY, root.as_str()).await
    }

    pub async fn launched_trees(&self) -> Result<Vec<NodeKey>> {
        Ok(self
            .store
            .smembers(LAUNCHED_TREES_KEY)
            .await?
            .into_iter()
            .map(NodeKey::from_raw)
            .collect())
    }

    /// Every (child, parent) pair in the parent index
    pub async fn edges(&self) -> Result<Vec<(NodeKey, NodeKey)>> {
        Ok(self
            .store
            .hgetall(PARENTS_KEY)
            .await?
            .into_iter()
            .map(|(child, parent)| (NodeKey::from_raw(child), NodeKey::from_raw(parent)))
            .collect())
    }
}
