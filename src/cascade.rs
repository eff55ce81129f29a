//! Subtree teardown
//!
//! Removes every persisted trace of a subtree: child-sets, parent index
//! entries and, for a root, the launched marker. Safe on partial or absent
//! state, so it doubles as the guard for stale queue deliveries.

use crate::core::errors::Result;
use crate::node::Node;
use crate::resources::ResourceCodec;
use crate::storage::GraphStore;
use tracing::{debug, warn};

pub struct Cascade<'a> {
    graph: &'a GraphStore,
    codec: &'a dyn ResourceCodec,
}

impl<'a> Cascade<'a> {
    pub fn new(graph: &'a GraphStore, codec: &'a dyn ResourceCodec) -> Self {
        Self { graph, codec }
    }

    pub async fn cleanup(&self, node: &Node) -> Result<()> {
        // pre-order walk; tearing down in reverse handles children before parents
        let mut order = Vec::new();
        let mut frontier = self.stored_children(node).await?;
        while let Some(child) = frontier.pop() {
            frontier.extend(self.stored_children(&child).await?);
            order.push(child);
        }
        for descendant in order.iter().rev() {
            self.teardown(descendant).await?;
        }
        self.teardown(node).await?;
        debug!(key = %node.key(), descendants = order.len(), "Cleaned up subtree");
        Ok(())
    }

    async fn stored_children(&self, node: &Node) -> Result<Vec<Node>> {
        if node.is_leaf() {
            return Ok(Vec::new());
        }
        let mut children = Vec::new();
        for key in self.graph.child_set_members(node.key()).await? {
            match Node::from_key(node.tree().clone(), &key, self.codec) {
                Ok(child) => children.push(child),
                Err(e) => {
                    warn!(
                        parent = %node.key(),
                        child = %key,
                        error = %e,
                        "Dropping undecodable child"
                    );
                    self.graph.remove_child(node.key(), &key).await?;
                }
            }
        }
        Ok(children)
    }

    async fn teardown(&self, node: &Node) -> Result<()> {
        if !node.is_leaf() {
            self.graph.delete_child_set(node.key()).await?;
        }
        self.graph.remove_parent_entry(node.key()).await?;
        if node.is_root() {
            self.graph.unmark_tree_launched(node.key()).await?;
        }
        Ok(())
    }
}
