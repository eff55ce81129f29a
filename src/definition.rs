//! Static tree and node templates
//!
//! A [`TreeDefinition`] names a tree, its root [`NodeDefinition`] and every
//! descendant definition, plus an optional tree-level failure handler.
//! Definitions are authored once and never change after `build()`.

use crate::core::errors::{Result, TreeError};
use crate::identity::NodeKey;
use crate::resources::ResourceSet;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

/// Where a node's action runs
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    /// Synchronously, in the call stack of whoever triggered it
    #[default]
    Inline,
    /// Submitted to the work queue for a worker to pick up
    Detached,
}

/// The work a node does once all of its children are done
#[async_trait]
pub trait NodeAction: Send + Sync {
    async fn perform(&self, resources: &ResourceSet) -> anyhow::Result<()>;
}

/// Action that does nothing
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopAction;

#[async_trait]
impl NodeAction for NoopAction {
    async fn perform(&self, _resources: &ResourceSet) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Wraps an async closure as a [`NodeAction`]
pub struct ActionFn<F>(F);

#[async_trait]
impl<F, Fut> NodeAction for ActionFn<F>
where
    F: Fn(ResourceSet) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<()>> + Send,
{
    async fn perform(&self, resources: &ResourceSet) -> anyhow::Result<()> {
        (self.0)(resources.clone()).await
    }
}

pub fn action_fn<F, Fut>(f: F) -> Arc<dyn NodeAction>
where
    F: Fn(ResourceSet) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    Arc::new(ActionFn(f))
}

/// One child produced by a children generator
#[derive(Debug, Clone)]
pub struct ChildSpec {
    pub name: String,
    pub resources: ResourceSet,
}

impl ChildSpec {
    pub fn new(name: impl Into<String>, resources: ResourceSet) -> Self {
        Self {
            name: name.into(),
            resources,
        }
    }

    /// Child without resources
    pub fn bare(name: impl Into<String>) -> Self {
        Self::new(name, ResourceSet::new())
    }
}

pub type ChildrenFn = Arc<dyn Fn(&ResourceSet) -> anyhow::Result<Vec<ChildSpec>> + Send + Sync>;

/// What the tree-level failure handler gets to see
#[derive(Debug, Clone)]
pub struct NodeFailure {
    pub tree: String,
    pub node: String,
    pub key: NodeKey,
    pub resources: ResourceSet,
    pub message: String,
}

#[async_trait]
pub trait FailureHandler: Send + Sync {
    async fn on_failure(&self, failure: &NodeFailure) -> anyhow::Result<()>;
}

pub struct HandlerFn<F>(F);

#[async_trait]
impl<F, Fut> FailureHandler for HandlerFn<F>
where
    F: Fn(NodeFailure) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<()>> + Send,
{
    async fn on_failure(&self, failure: &NodeFailure) -> anyhow::Result<()> {
        (self.0)(failure.clone()).await
    }
}

pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn FailureHandler>
where
    F: Fn(NodeFailure) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    Arc::new(HandlerFn(f))
}

/// Template for one position in the tree
#[derive(Clone)]
pub struct NodeDefinition {
    name: String,
    action: Arc<dyn NodeAction>,
    children: Option<ChildrenFn>,
    mode: ExecutionMode,
    continue_on_failure: bool,
    parent: Option<String>,
    child_definitions: Vec<String>,
}

impl NodeDefinition {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn action(&self) -> &Arc<dyn NodeAction> {
        &self.action
    }

    pub fn mode(&self) -> ExecutionMode {
        self.mode
    }

    pub fn is_detached(&self) -> bool {
        self.mode == ExecutionMode::Detached
    }

    pub fn continue_on_failure(&self) -> bool {
        self.continue_on_failure
    }

    pub fn parent(&self) -> Option<&str> {
        self.parent.as_deref()
    }

    pub fn is_root(&self) -> bool {
        self.parent.is_none()
    }

    /// A leaf definition declares no children generator at all
    pub fn is_leaf(&self) -> bool {
        self.children.is_none()
    }

    pub fn child_definitions(&self) -> &[String] {
        &self.child_definitions
    }

    pub fn generate_children(&self, resources: &ResourceSet) -> anyhow::Result<Vec<ChildSpec>> {
        match &self.children {
            Some(generator) => generator(resources),
            None => Ok(Vec::new()),
        }
    }
}

impl std::fmt::Debug for NodeDefinition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeDefinition")
            .field("name", &self.name)
            .field("mode", &self.mode)
            .field("continue_on_failure", &self.continue_on_failure)
            .field("parent", &self.parent)
            .field("child_definitions", &self.child_definitions)
            .finish()
    }
}

/// Static template of a whole tree
pub struct TreeDefinition {
    name: String,
    root: String,
    nodes: HashMap<String, NodeDefinition>,
    on_failure: Option<Arc<dyn FailureHandler>>,
}

impl TreeDefinition {
    pub fn builder(name: impl Into<String>) -> TreeBuilder {
        TreeBuilder {
            name: name.into(),
            root: None,
            on_failure: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn root(&self) -> &NodeDefinition {
        // build() guarantees the root is present
        &self.nodes[&self.root]
    }

    pub fn find(&self, node: &str) -> Result<&NodeDefinition> {
        self.nodes.get(node).ok_or_else(|| TreeError::UnknownNode {
            tree: self.name.clone(),
            node: node.to_string(),
        })
    }

    pub fn on_failure(&self) -> Option<&Arc<dyn FailureHandler>> {
        self.on_failure.as_ref()
    }
}

impl std::fmt::Debug for TreeDefinition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TreeDefinition")
            .field("name", &self.name)
            .field("root", &self.root)
            .field("nodes", &self.nodes.len())
            .field("on_failure", &self.on_failure.is_some())
            .finish()
    }
}

/// Builder for [`TreeDefinition`]
pub struct TreeBuilder {
    name: String,
    root: Option<NodeBuilder>,
    on_failure: Option<Arc<dyn FailureHandler>>,
}

impl TreeBuilder {
    pub fn root<F>(
        mut self,
        name: impl Into<String>,
        action: Arc<dyn NodeAction>,
        configure: F,
    ) -> Self
    where
        F: FnOnce(NodeBuilder) -> NodeBuilder,
    {
        self.root = Some(configure(NodeBuilder::new(name, action)));
        self
    }

    pub fn on_failure(mut self, handler: Arc<dyn FailureHandler>) -> Self {
        self.on_failure = Some(handler);
        self
    }

    pub fn build(self) -> Result<TreeDefinition> {
        if self.name.is_empty() {
            return Err(TreeError::Definition("tree name cannot be empty".to_string()));
        }
        let root = self
            .root
            .ok_or_else(|| TreeError::Definition(format!("tree {} has no root", self.name)))?;
        let root_name = root.name.clone();

        let mut nodes = HashMap::new();
        let mut pending = vec![(root, None::<String>)];
        while let Some((builder, parent)) = pending.pop() {
            let child_definitions: Vec<String> =
                builder.nodes.iter().map(|child| child.name.clone()).collect();
            if builder.children.is_none() && !child_definitions.is_empty() {
                return Err(TreeError::Definition(format!(
                    "node {} declares child definitions but no children generator",
                    builder.name
                )));
            }
            let definition = NodeDefinition {
                name: builder.name.clone(),
                action: builder.action,
                children: builder.children,
                mode: builder.mode,
                continue_on_failure: builder.continue_on_failure,
                parent,
                child_definitions,
            };
            if nodes.insert(builder.name.clone(), definition).is_some() {
                return Err(TreeError::Definition(format!(
                    "node {} is defined twice in tree {}",
                    builder.name, self.name
                )));
            }
            for child in builder.nodes {
                pending.push((child, Some(builder.name.clone())));
            }
        }

        Ok(TreeDefinition {
            name: self.name,
            root: root_name,
            nodes,
            on_failure: self.on_failure,
        })
    }
}

/// Builder for one node definition and its nested child definitions
pub struct NodeBuilder {
    name: String,
    action: Arc<dyn NodeAction>,
    children: Option<ChildrenFn>,
    mode: ExecutionMode,
    continue_on_failure: bool,
    nodes: Vec<NodeBuilder>,
}

impl NodeBuilder {
    fn new(name: impl Into<String>, action: Arc<dyn NodeAction>) -> Self {
        Self {
            name: name.into(),
            action,
            children: None,
            mode: ExecutionMode::Inline,
            continue_on_failure: false,
            nodes: Vec::new(),
        }
    }

    pub fn children<F>(mut self, generator: F) -> Self
    where
        F: Fn(&ResourceSet) -> anyhow::Result<Vec<ChildSpec>> + Send + Sync + 'static,
    {
        self.children = Some(Arc::new(generator));
        self
    }

    pub fn mode(mut self, mode: ExecutionMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn detached(self) -> Self {
        self.mode(ExecutionMode::Detached)
    }

    pub fn continue_on_failure(mut self) -> Self {
        self.continue_on_failure = true;
        self
    }

    /// Declare a child definition
    pub fn node<F>(
        mut self,
        name: impl Into<String>,
        action: Arc<dyn NodeAction>,
        configure: F,
    ) -> Self
    where
        F: FnOnce(NodeBuilder) -> NodeBuilder,
    {
        self.nodes.push(configure(NodeBuilder::new(name, action)));
        self
    }
}
