//! Bottom-up job trees over a shared key-value store.
//!
//! A tree definition names a root node, the nodes below it and, for every
//! non-leaf node, a generator producing that node's children from its
//! resources. Launching a tree spawns the whole instance tree, runs leaves
//! first and runs every parent exactly once, after the last of its children
//! finished, wherever those children ran. Coordination between workers goes
//! through a [`storage::KvStore`] only.
//!
//! ```no_run
//! use jobtree::{
//!     action_fn, ChildSpec, Engine, MemoryQueue, MemoryStore, ResourceSet, TreeDefinition,
//!     TreeRegistry, Worker,
//! };
//! use std::sync::Arc;
//!
//! # async fn run() -> jobtree::Result<()> {
//! let tree = TreeDefinition::builder("reports")
//!     .root("publish", action_fn(|_| async { Ok(()) }), |root| {
//!         root.children(|r| Ok(vec![ChildSpec::new("render", r.clone())]))
//!             .node("render", action_fn(|_| async { Ok(()) }), |n| n.detached())
//!     })
//!     .build()?;
//!
//! let registry = Arc::new(TreeRegistry::new());
//! registry.register(tree)?;
//! let queue = Arc::new(MemoryQueue::new());
//! let engine = Arc::new(Engine::new(registry, Arc::new(MemoryStore::new()), queue.clone()));
//!
//! engine.launch("reports", ResourceSet::new().with(42i64)).await?;
//! Worker::new(engine, queue).run_until_idle().await;
//! # Ok(())
//! # }
//! ```

// Core infrastructure modules
pub mod core {
    pub mod config;
    pub mod errors;
}

pub mod barrier;
pub mod cascade;
pub mod definition;
pub mod diagnostics;
pub mod dispatch;
pub mod identity;
pub mod node;
pub mod queue;
pub mod registry;
pub mod resources;
pub mod storage;

// Re-exports for convenience
pub use core::config::EngineConfig;
pub use core::errors::{Result, TreeError};
pub use definition::{
    action_fn, handler_fn, ChildSpec, ExecutionMode, FailureHandler, NodeAction, NodeDefinition,
    NodeFailure, NoopAction, TreeDefinition,
};
pub use diagnostics::Snapshot;
pub use dispatch::{Dispatch, Engine};
pub use identity::NodeKey;
pub use node::Node;
pub use queue::{MemoryQueue, QueuedJob, WorkQueue, Worker};
pub use registry::TreeRegistry;
pub use resources::{PrimitiveCodec, ResourceCodec, ResourceSet};
pub use storage::{GraphStore, KvStore, MemoryStore, SledStore};
