//! Work queue seam for detached nodes
//!
//! The engine only ever submits `(tree, node, args)` triples. Whoever drains
//! the queue hands each triple back to [`Engine::perform`]. [`MemoryQueue`]
//! and [`Worker`] cover the single-process case and the tests; real queue
//! backends implement [`WorkQueue`] themselves.

use crate::core::errors::{Result, TreeError};
use crate::dispatch::{Dispatch, Engine};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::{Mutex, Notify};
use tracing::{debug, error, info};

/// One unit of detached work
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueuedJob {
    pub tree: String,
    pub node: String,
    pub args: Vec<Value>,
}

impl QueuedJob {
    pub fn new(tree: impl Into<String>, node: impl Into<String>, args: Vec<Value>) -> Self {
        Self {
            tree: tree.into(),
            node: node.into(),
            args,
        }
    }
}

#[async_trait]
pub trait WorkQueue: Send + Sync {
    async fn submit(&self, job: QueuedJob) -> Result<()>;
}

/// In-process FIFO queue
#[derive(Default)]
pub struct MemoryQueue {
    jobs: Mutex<VecDeque<QueuedJob>>,
    ready: Notify,
}

impl MemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn pop(&self) -> Option<QueuedJob> {
        self.jobs.lock().await.pop_front()
    }

    /// Wait until a job is available
    pub async fn wait_pop(&self) -> QueuedJob {
        loop {
            if let Some(job) = self.pop().await {
                return job;
            }
            self.ready.notified().await;
        }
    }

    pub async fn len(&self) -> usize {
        self.jobs.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.jobs.lock().await.is_empty()
    }

    /// Take every pending job, leaving the queue empty
    pub async fn drain(&self) -> Vec<QueuedJob> {
        self.jobs.lock().await.drain(..).collect()
    }
}

#[async_trait]
impl WorkQueue for MemoryQueue {
    async fn submit(&self, job: QueuedJob) -> Result<()> {
        debug!(tree = %job.tree, node = %job.node, "Queued job");
        self.jobs.lock().await.push_back(job);
        self.ready.notify_one();
        Ok(())
    }
}

/// Feeds jobs from a [`MemoryQueue`] into an [`Engine`]
pub struct Worker {
    engine: Arc<Engine>,
    queue: Arc<MemoryQueue>,
}

impl Worker {
    pub fn new(engine: Arc<Engine>, queue: Arc<MemoryQueue>) -> Self {
        Self { engine, queue }
    }

    /// Perform the next pending job; `None` when the queue is empty
    pub async fn run_once(&self) -> Option<Result<Dispatch>> {
        let job = self.queue.pop().await?;
        Some(self.engine.perform_job(&job).await)
    }

    /// Wait for the next job and perform it
    pub async fn next(&self) -> Result<Dispatch> {
        let job = self.queue.wait_pop().await;
        self.engine.perform_job(&job).await
    }

    /// Perform jobs until the queue is empty, including jobs queued along the
    /// way. Failures are logged and collected, they do not stop the worker.
    pub async fn run_until_idle(&self) -> Vec<TreeError> {
        let mut errors = Vec::new();
        let mut performed = 0usize;
        while let Some(outcome) = self.run_once().await {
            performed += 1;
            if let Err(e) = outcome {
                error!(category = e.category(), error = %e, "Job failed");
                errors.push(e);
            }
        }
        info!(performed, failed = errors.len(), "Worker idle");
        errors
    }
}
