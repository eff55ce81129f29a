//! Launch and dispatch of node instances
//!
//! [`Engine::launch`] registers a tree's whole structure depth-first, every
//! node's child edges before any of those children runs, then starts the
//! nodes that have no children: inline ones run right away, detached ones go
//! to the work queue. Each completed node arrives at its parent's join
//! barrier; the last child to arrive runs the parent (or queues it when the
//! parent is detached), and so on up to the root, whose completion clears
//! the tree from the store.
//!
//! A node whose action fails tears the whole tree down, runs the tree's
//! failure handler and reports the failure exactly once. Nodes marked
//! continue-on-failure advance the barrier anyway and still report their
//! error to whoever invoked them.

use crate::barrier::JoinBarrier;
use crate::cascade::Cascade;
use crate::core::config::EngineConfig;
use crate::core::errors::{Result, TreeError};
use crate::definition::NodeFailure;
use crate::diagnostics::Snapshot;
use crate::identity::KEY_NAMESPACE;
use crate::node::Node;
use crate::queue::{QueuedJob, WorkQueue};
use crate::registry::TreeRegistry;
use crate::resources::{PrimitiveCodec, ResourceCodec, ResourceSet};
use crate::storage::{GraphStore, KvStore};
use futures::future::BoxFuture;
use futures::FutureExt;
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// What a queue delivery amounted to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    /// The node ran and arrived at its parent's barrier
    Performed,
    /// The node was gone from the store; nothing ran
    Stale,
}

enum Arrival {
    /// Siblings are still pending
    Waiting,
    /// The root finished and the tree was cleared
    TreeComplete,
    /// Every child of this parent is done
    Ready(Node),
}

pub struct Engine {
    registry: Arc<TreeRegistry>,
    graph: GraphStore,
    queue: Arc<dyn WorkQueue>,
    codec: Arc<dyn ResourceCodec>,
    config: EngineConfig,
}

impl Engine {
    pub fn new(
        registry: Arc<TreeRegistry>,
        store: Arc<dyn KvStore>,
        queue: Arc<dyn WorkQueue>,
    ) -> Self {
        Self {
            registry,
            graph: GraphStore::new(store),
            queue,
            codec: Arc::new(PrimitiveCodec),
            config: EngineConfig::default(),
        }
    }

    pub fn with_codec(mut self, codec: Arc<dyn ResourceCodec>) -> Self {
        self.codec = codec;
        self
    }

    pub fn with_config(mut self, config: EngineConfig) -> Result<Self> {
        config.validate()?;
        self.config = config;
        Ok(self)
    }

    pub fn registry(&self) -> &Arc<TreeRegistry> {
        &self.registry
    }

    pub fn graph(&self) -> &GraphStore {
        &self.graph
    }

    pub fn codec(&self) -> &dyn ResourceCodec {
        self.codec.as_ref()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn spawn_root(&self, tree: &str, resources: ResourceSet) -> Result<Node> {
        let definition = self.registry.find_tree(tree)?;
        let root = definition.root().name().to_string();
        Node::spawn(definition, &root, resources, self.codec.as_ref(), None)
    }

    /// Launch tree `tree` with the root bound to `resources`
    pub async fn launch(&self, tree: &str, resources: ResourceSet) -> Result<()> {
        let root = self.spawn_root(tree, resources)?;
        info!(tree = %tree, key = %root.key(), "Launching tree");
        self.launch_node(&root).await
    }

    /// Register `node`'s subtree and start whatever has nothing left to wait for.
    ///
    /// Inline children are launched one after the other in generator order.
    /// A suppressed failure of one child does not stop its siblings; the
    /// first one is returned once all of them were launched. Any other error
    /// returns immediately.
    pub fn launch_node<'a>(&'a self, node: &'a Node) -> BoxFuture<'a, Result<()>> {
        async move {
            let marked = if node.is_root() {
                let marked = self.graph.mark_tree_launched(node.key()).await?;
                if !marked {
                    debug!(key = %node.key(), "Tree was already launched");
                }
                marked
            } else {
                false
            };

            let children = self.register_children(node, marked).await?;
            if children.is_empty() {
                return self.start(node).await;
            }

            let mut suppressed = None;
            for child in &children {
                match self.launch_node(child).await {
                    Ok(()) => {}
                    Err(e) if e.is_suppressed() => {
                        suppressed.get_or_insert(e);
                    }
                    Err(e) => return Err(e),
                }
            }
            suppressed.map_or(Ok(()), Err)
        }
        .boxed()
    }

    /// Node-execution entry point for queue deliveries
    pub async fn perform(&self, tree: &str, node: &str, args: Vec<Value>) -> Result<Dispatch> {
        let definition = self.registry.find_tree(tree)?;
        let node = Node::from_args(definition, node, args, self.codec.as_ref())?;
        if !self.graph.exists(&node).await? {
            warn!(key = %node.key(), "Node no longer exists, cleaning up");
            if let Err(e) = self.cascade().cleanup(&node).await {
                warn!(key = %node.key(), error = %e, "Cleanup of stale node failed");
            }
            return Ok(Dispatch::Stale);
        }
        self.execute(node).await?;
        Ok(Dispatch::Performed)
    }

    pub async fn perform_job(&self, job: &QueuedJob) -> Result<Dispatch> {
        self.perform(&job.tree, &job.node, job.args.clone()).await
    }

    /// Tear a launched tree down without running anything
    pub async fn abort(&self, tree: &str, resources: ResourceSet) -> Result<()> {
        let root = self.spawn_root(tree, resources)?;
        self.cascade().cleanup(&root).await?;
        info!(tree = %tree, key = %root.key(), "Aborted tree");
        Ok(())
    }

    /// Every key this crate currently holds in the store
    pub async fn residual_keys(&self) -> Result<Vec<String>> {
        self.graph.kv().keys(KEY_NAMESPACE).await
    }

    pub async fn snapshot(&self) -> Result<Snapshot> {
        Snapshot::capture(&self.graph).await
    }

    fn cascade(&self) -> Cascade<'_> {
        Cascade::new(&self.graph, self.codec.as_ref())
    }

    async fn register_children(&self, node: &Node, marked: bool) -> Result<Vec<Node>> {
        let mut registered = Vec::new();
        if let Err(e) = self.spawn_children(node, &mut registered).await {
            self.roll_back(node, &registered, marked).await?;
            return Err(e);
        }
        if !registered.is_empty() {
            debug!(key = %node.key(), children = registered.len(), "Registered children");
        }
        Ok(registered)
    }

    async fn spawn_children(&self, node: &Node, registered: &mut Vec<Node>) -> Result<()> {
        let specs = node
            .definition()
            .generate_children(node.resources())
            .map_err(|source| TreeError::ChildrenGenerator {
                key: node.key().to_string(),
                source,
            })?;
        for spec in specs {
            let child = Node::spawn(
                node.tree().clone(),
                &spec.name,
                spec.resources,
                self.codec.as_ref(),
                Some(node),
            )?;
            self.graph.register_edge(&child, node.key()).await?;
            registered.push(child);
        }
        Ok(())
    }

    async fn roll_back(&self, node: &Node, registered: &[Node], marked: bool) -> Result<()> {
        for child in registered {
            self.graph.remove_edge(child.key(), node.key()).await?;
        }
        if marked {
            self.graph.unmark_tree_launched(node.key()).await?;
        }
        warn!(key = %node.key(), removed = registered.len(), "Rolled back child registration");
        Ok(())
    }

    /// A node with nothing to wait for: run it here or hand it to a worker
    async fn start(&self, node: &Node) -> Result<()> {
        if node.definition().is_detached() {
            self.submit(node).await
        } else {
            self.execute(node.clone()).await
        }
    }

    async fn submit(&self, node: &Node) -> Result<()> {
        let job = QueuedJob::new(node.tree().name(), node.name(), node.args().to_vec());
        self.queue.submit(job).await?;
        debug!(key = %node.key(), "Submitted detached node");
        Ok(())
    }

    /// Run `node`, then walk the join barriers upward for as long as each
    /// arrival completes its parent.
    async fn execute(&self, node: Node) -> Result<()> {
        let barrier = JoinBarrier::new(&self.graph, &self.config);
        let mut suppressed = None;
        let mut current = node;
        loop {
            match current.definition().action().perform(current.resources()).await {
                Ok(()) => debug!(key = %current.key(), "Performed node"),
                Err(source) if current.definition().continue_on_failure() => {
                    warn!(key = %current.key(), error = %source, "Node failed, continuing");
                    suppressed.get_or_insert(TreeError::SuppressedFailure {
                        key: current.key().to_string(),
                        source,
                    });
                }
                Err(source) => return Err(self.fail(&current, source).await),
            }

            match self.arrive(&barrier, &current).await? {
                Arrival::Waiting | Arrival::TreeComplete => break,
                Arrival::Ready(parent) if parent.definition().is_detached() => {
                    self.submit(&parent).await?;
                    break;
                }
                Arrival::Ready(parent) => current = parent,
            }
        }
        suppressed.map_or(Ok(()), Err)
    }

    async fn arrive(&self, barrier: &JoinBarrier<'_>, node: &Node) -> Result<Arrival> {
        let parent_key = match node.parent_key(&self.graph).await {
            Ok(Some(parent_key)) => parent_key,
            Ok(None) => {
                self.cascade().cleanup(node).await?;
                info!(tree = %node.tree().name(), key = %node.key(), "Tree completed");
                return Ok(Arrival::TreeComplete);
            }
            // the tree was torn down while this node ran
            Err(TreeError::Detached(_)) => {
                debug!(key = %node.key(), "Parent gone after perform, cleaning up");
                if let Err(e) = self.cascade().cleanup(node).await {
                    warn!(key = %node.key(), error = %e, "Cleanup of orphaned node failed");
                }
                return Ok(Arrival::Waiting);
            }
            Err(e) => return Err(e),
        };
        if !barrier.arrive(node.key(), &parent_key).await? {
            debug!(key = %node.key(), parent = %parent_key, "Waiting for siblings");
            return Ok(Arrival::Waiting);
        }
        let parent = Node::from_key(node.tree().clone(), &parent_key, self.codec.as_ref())?;
        Ok(Arrival::Ready(parent))
    }

    /// Hard failure: clear the tree, give the failure handler a look, and
    /// build the one error that is reported.
    async fn fail(&self, node: &Node, source: anyhow::Error) -> TreeError {
        error!(
            tree = %node.tree().name(),
            key = %node.key(),
            error = %source,
            "Node failed, tearing down tree"
        );
        if let Err(e) = self.tear_down_tree(node).await {
            error!(key = %node.key(), error = %e, "Tear-down after failure failed");
            return e;
        }

        if let Some(handler) = node.tree().on_failure() {
            let failure = NodeFailure {
                tree: node.tree().name().to_string(),
                node: node.name().to_string(),
                key: node.key().clone(),
                resources: node.resources().clone(),
                message: format!("{:#}", source),
            };
            if let Err(handler_error) = handler.on_failure(&failure).await {
                error!(
                    tree = %node.tree().name(),
                    error = %handler_error,
                    "Failure handler failed"
                );
                return TreeError::FailureHandler {
                    tree: node.tree().name().to_string(),
                    source: handler_error,
                };
            }
        }

        TreeError::NodeFailed {
            key: node.key().to_string(),
            source,
        }
    }

    async fn tear_down_tree(&self, node: &Node) -> Result<()> {
        let mut top = node.clone();
        loop {
            let step = top.parent(&self.graph, self.codec.as_ref()).await;
            match step {
                Ok(Some(parent)) => top = parent,
                Ok(None) => break,
                Err(TreeError::Detached(key)) => {
                    warn!(key = %key, "Ancestry ends below the root");
                    break;
                }
                Err(e) => return Err(e),
            }
        }
        self.cascade().cleanup(&top).await
    }
}
