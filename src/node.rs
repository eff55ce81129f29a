//! Node instances: a definition bound to resources

use crate::core::errors::{Result, TreeError};
use crate::definition::{NodeDefinition, TreeDefinition};
use crate::identity::NodeKey;
use crate::resources::{ResourceCodec, ResourceSet};
use crate::storage::GraphStore;
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use tokio::sync::OnceCell;

/// One concrete task. Has no storage of its own until its edge is registered.
///
/// The parent is never owned: only its key is cached, either handed over at
/// spawn time or read from the parent index on first use.
pub struct Node {
    tree: Arc<TreeDefinition>,
    definition: NodeDefinition,
    resources: ResourceSet,
    args: Vec<Value>,
    key: NodeKey,
    parent_key: OnceCell<NodeKey>,
}

impl Node {
    pub fn spawn(
        tree: Arc<TreeDefinition>,
        name: &str,
        resources: ResourceSet,
        codec: &dyn ResourceCodec,
        parent: Option<&Node>,
    ) -> Result<Self> {
        let args = codec.serialize(&resources)?;
        let node = Self::assemble(tree, name, resources, args)?;
        if let Some(parent) = parent {
            if node.definition.parent() != Some(parent.name()) {
                return Err(TreeError::Definition(format!(
                    "{} is not a child of {} in tree {}",
                    name,
                    parent.name(),
                    node.tree.name()
                )));
            }
            // freshly created cell, cannot already be set
            let _ = node.parent_key.set(parent.key.clone());
        }
        Ok(node)
    }

    /// Re-spawn from the primitive arguments a queue or key carried
    pub fn from_args(
        tree: Arc<TreeDefinition>,
        name: &str,
        args: Vec<Value>,
        codec: &dyn ResourceCodec,
    ) -> Result<Self> {
        let resources = codec.deserialize(&args)?;
        Self::assemble(tree, name, resources, args)
    }

    pub fn from_key(
        tree: Arc<TreeDefinition>,
        key: &NodeKey,
        codec: &dyn ResourceCodec,
    ) -> Result<Self> {
        let parts = key.decode()?;
        if parts.tree != tree.name() {
            return Err(TreeError::malformed_key(
                key.as_str(),
                format!("belongs to tree {}, not {}", parts.tree, tree.name()),
            ));
        }
        Self::from_args(tree, &parts.node, parts.args, codec)
    }

    fn assemble(
        tree: Arc<TreeDefinition>,
        name: &str,
        resources: ResourceSet,
        args: Vec<Value>,
    ) -> Result<Self> {
        let definition = tree.find(name)?.clone();
        let key = NodeKey::encode(tree.name(), name, &args)?;
        Ok(Self {
            tree,
            definition,
            resources,
            args,
            key,
            parent_key: OnceCell::new(),
        })
    }

    pub fn tree(&self) -> &Arc<TreeDefinition> {
        &self.tree
    }

    pub fn definition(&self) -> &NodeDefinition {
        &self.definition
    }

    pub fn name(&self) -> &str {
        self.definition.name()
    }

    pub fn resources(&self) -> &ResourceSet {
        &self.resources
    }

    pub fn args(&self) -> &[Value] {
        &self.args
    }

    pub fn key(&self) -> &NodeKey {
        &self.key
    }

    pub fn is_root(&self) -> bool {
        self.definition.is_root()
    }

    pub fn is_leaf(&self) -> bool {
        self.definition.is_leaf()
    }

    /// Key of the parent instance; `None` for the root
    pub async fn parent_key(&self, graph: &GraphStore) -> Result<Option<NodeKey>> {
        if self.is_root() {
            return Ok(None);
        }
        let key = self
            .parent_key
            .get_or_try_init(|| async {
                graph
                    .parent_of(&self.key)
                    .await?
                    .ok_or_else(|| TreeError::Detached(self.key.to_string()))
            })
            .await?;
        Ok(Some(key.clone()))
    }

    pub async fn parent(
        &self,
        graph: &GraphStore,
        codec: &dyn ResourceCodec,
    ) -> Result<Option<Node>> {
        let Some(parent_key) = self.parent_key(graph).await? else {
            return Ok(None);
        };
        let parent = Node::from_key(self.tree.clone(), &parent_key, codec)?;
        if self.definition.parent() != Some(parent.name()) {
            return Err(TreeError::malformed_key(
                parent_key.as_str(),
                format!("is not a {} parent", self.name()),
            ));
        }
        Ok(Some(parent))
    }
}

impl Clone for Node {
    fn clone(&self) -> Self {
        let parent_key = OnceCell::new();
        if let Some(key) = self.parent_key.get() {
            let _ = parent_key.set(key.clone());
        }
        Self {
            tree: self.tree.clone(),
            definition: self.definition.clone(),
            resources: self.resources.clone(),
            args: self.args.clone(),
            key: self.key.clone(),
            parent_key,
        }
    }
}

impl fmt::Debug for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Node").field("key", &self.key).finish()
    }
}
