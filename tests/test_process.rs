//! End-to-end runs of job trees through the engine, the in-memory queue and
//! a worker.

use anyhow::anyhow;
use async_trait::async_trait;
use jobtree::{
    action_fn, ChildSpec, Dispatch, Engine, EngineConfig, FailureHandler, KvStore, MemoryQueue,
    MemoryStore, NodeAction, NodeFailure, NodeKey, QueuedJob, ResourceCodec, ResourceSet,
    SledStore, TreeDefinition, TreeError, TreeRegistry, WorkQueue, Worker,
};
use pretty_assertions::assert_eq;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, Semaphore};

type History = Arc<Mutex<Vec<String>>>;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_test_writer()
        .try_init();
}

/// Appends its entry to the history, then optionally fails
struct Record {
    history: History,
    entry: String,
    failure: Option<&'static str>,
}

#[async_trait]
impl NodeAction for Record {
    async fn perform(&self, _resources: &ResourceSet) -> anyhow::Result<()> {
        self.history.lock().unwrap().push(self.entry.clone());
        match self.failure {
            Some(message) => Err(anyhow!(message)),
            None => Ok(()),
        }
    }
}

fn record(history: &History, entry: &str) -> Arc<dyn NodeAction> {
    Arc::new(Record {
        history: history.clone(),
        entry: entry.to_string(),
        failure: None,
    })
}

fn record_then_fail(history: &History, entry: &str, message: &'static str) -> Arc<dyn NodeAction> {
    Arc::new(Record {
        history: history.clone(),
        entry: entry.to_string(),
        failure: Some(message),
    })
}

fn fail(message: &'static str) -> Arc<dyn NodeAction> {
    record_then_fail(&History::default(), "", message)
}

fn count(counter: &Arc<AtomicUsize>) -> Arc<dyn NodeAction> {
    let counter = counter.clone();
    action_fn(move |_| {
        let counter = counter.clone();
        async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    })
}

/// Holds every run open until `release` gets a permit
struct Gate {
    started: mpsc::UnboundedSender<()>,
    release: Arc<Semaphore>,
    runs: Arc<AtomicUsize>,
}

#[async_trait]
impl NodeAction for Gate {
    async fn perform(&self, _resources: &ResourceSet) -> anyhow::Result<()> {
        self.runs.fetch_add(1, Ordering::SeqCst);
        let _ = self.started.send(());
        let _permit = self.release.acquire().await?;
        Ok(())
    }
}

fn gate() -> (Arc<Gate>, mpsc::UnboundedReceiver<()>) {
    let (started, rx) = mpsc::unbounded_channel();
    let gate = Gate {
        started,
        release: Arc::new(Semaphore::new(0)),
        runs: Arc::new(AtomicUsize::new(0)),
    };
    (Arc::new(gate), rx)
}

struct Harness {
    engine: Arc<Engine>,
    store: Arc<dyn KvStore>,
    worker: Worker,
    queue: Arc<MemoryQueue>,
}

fn harness(tree: TreeDefinition) -> Harness {
    harness_on(tree, Arc::new(MemoryStore::new()))
}

fn harness_on(tree: TreeDefinition, store: Arc<dyn KvStore>) -> Harness {
    init_tracing();
    let registry = Arc::new(TreeRegistry::new());
    registry.register(tree).unwrap();
    let queue = Arc::new(MemoryQueue::new());
    let config = EngineConfig::default().with_lock_retry(Duration::from_millis(2));
    let engine = Arc::new(
        Engine::new(registry, store.clone(), queue.clone())
            .with_config(config)
            .unwrap(),
    );
    let worker = Worker::new(engine.clone(), queue.clone());
    Harness {
        engine,
        store,
        worker,
        queue,
    }
}

impl Harness {
    async fn assert_store_empty(&self) {
        assert_eq!(self.store.keys("").await.unwrap(), Vec::<String>::new());
    }
}

fn key(tree: &str, node: &str) -> NodeKey {
    NodeKey::encode(tree, node, &[]).unwrap()
}

fn one_child_per_resource(resources: &ResourceSet) -> anyhow::Result<Vec<ChildSpec>> {
    Ok((0..resources.len())
        .filter_map(|i| resources.get::<i64>(i))
        .map(|value| ChildSpec::new("job2", ResourceSet::new().with(*value)))
        .collect())
}

#[tokio::test]
async fn test_launch() {
    let history = History::default();
    let leaf_history = history.clone();
    let leaf = action_fn(move |resources: ResourceSet| {
        let history = leaf_history.clone();
        async move {
            let value = resources.get::<i64>(0).copied().unwrap_or_default();
            history.lock().unwrap().push(format!("tree1 job2 {}", value));
            Ok(())
        }
    });
    let tree = TreeDefinition::builder("tree1")
        .root("job1", record(&history, "tree1 job1"), |root| {
            root.children(one_child_per_resource)
                .node("job2", leaf, |n| n)
        })
        .build()
        .unwrap();
    let h = harness(tree);

    h.engine
        .launch("tree1", ResourceSet::from_values([1i64, 2, 3]))
        .await
        .unwrap();

    assert_eq!(
        *history.lock().unwrap(),
        vec!["tree1 job2 1", "tree1 job2 2", "tree1 job2 3", "tree1 job1"]
    );
    h.assert_store_empty().await;
}

#[tokio::test]
async fn test_launch_with_no_resources() {
    let history = History::default();
    let tree = TreeDefinition::builder("tree1")
        .root("job1", record(&history, "tree1 job1"), |root| {
            root.children(one_child_per_resource)
                .node("job2", record(&history, "tree1 job2"), |n| n)
        })
        .build()
        .unwrap();
    let h = harness(tree);

    h.engine.launch("tree1", ResourceSet::new()).await.unwrap();
    assert_eq!(*history.lock().unwrap(), vec!["tree1 job1"]);
    h.assert_store_empty().await;
}

#[tokio::test]
async fn test_nested_inline_levels_run_depth_first() {
    let history = History::default();
    let tree = TreeDefinition::builder("tree1")
        .root("job1", record(&history, "job1"), |root| {
            root.children(|_| Ok(vec![ChildSpec::bare("job2"), ChildSpec::bare("job4")]))
                .node("job2", record(&history, "job2"), |n| {
                    n.children(|_| Ok(vec![ChildSpec::bare("job3")]))
                        .node("job3", record(&history, "job3"), |n| n)
                })
                .node("job4", record(&history, "job4"), |n| n)
        })
        .build()
        .unwrap();
    let h = harness(tree);

    h.engine.launch("tree1", ResourceSet::new()).await.unwrap();
    assert_eq!(*history.lock().unwrap(), vec!["job3", "job2", "job4", "job1"]);
    h.assert_store_empty().await;
}

#[tokio::test]
async fn test_leaf_failure() {
    let tree = TreeDefinition::builder("tree1")
        .root("job1", record(&History::default(), "tree1 job1"), |root| {
            root.children(|_| Ok(vec![ChildSpec::bare("job2")]))
                .node("job2", fail("an expected exception"), |n| n)
        })
        .build()
        .unwrap();
    let h = harness(tree);

    let err = h
        .engine
        .launch("tree1", ResourceSet::from_values([1i64, 2, 3]))
        .await
        .unwrap_err();
    assert!(matches!(err, TreeError::NodeFailed { .. }));
    assert_eq!(
        err.action_error().map(|e| e.to_string()).as_deref(),
        Some("an expected exception")
    );
    h.assert_store_empty().await;
}

#[tokio::test]
async fn test_failure_deep_in_tree_clears_everything() {
    let tree = TreeDefinition::builder("tree1")
        .root("job1", Arc::new(jobtree::NoopAction), |root| {
            root.children(|_| Ok(vec![ChildSpec::bare("job2"), ChildSpec::bare("job4")]))
                .node("job2", Arc::new(jobtree::NoopAction), |n| {
                    n.children(|_| Ok(vec![ChildSpec::bare("job3")]))
                        .node("job3", fail("deep failure"), |n| n)
                })
                .node("job4", Arc::new(jobtree::NoopAction), |n| n.detached())
        })
        .build()
        .unwrap();
    let h = harness(tree);

    let err = h.engine.launch("tree1", ResourceSet::new()).await.unwrap_err();
    assert!(matches!(err, TreeError::NodeFailed { .. }));
    h.assert_store_empty().await;
    // the failure stopped the launch before job4 was started
    assert!(h.queue.is_empty().await);
}

#[tokio::test]
async fn test_launch_async() {
    let history = History::default();
    let tree = TreeDefinition::builder("tree1")
        .root("job1", record(&history, "tree1 job1"), |root| {
            root.children(|_| Ok(vec![ChildSpec::bare("job2")]))
                .node("job2", record(&history, "tree1 job2"), |n| n.detached())
        })
        .build()
        .unwrap();
    let h = harness(tree);

    h.engine.launch("tree1", ResourceSet::new()).await.unwrap();
    assert!(history.lock().unwrap().is_empty());
    assert_eq!(
        h.engine.graph().child_set_members(&key("tree1", "job1")).await.unwrap(),
        vec![key("tree1", "job2")]
    );
    assert_eq!(
        h.engine.graph().edges().await.unwrap(),
        vec![(key("tree1", "job2"), key("tree1", "job1"))]
    );
    assert_eq!(h.queue.len().await, 1);

    assert_eq!(h.worker.run_once().await.unwrap().unwrap(), Dispatch::Performed);
    assert_eq!(*history.lock().unwrap(), vec!["tree1 job2", "tree1 job1"]);
    h.assert_store_empty().await;
}

#[tokio::test]
async fn test_launch_continue_on_failure() {
    let history = History::default();
    let tree = TreeDefinition::builder("tree1")
        .root(
            "job1",
            record_then_fail(&history, "tree1 job1", "an expected failure"),
            |root| {
                root.children(|_| Ok(vec![ChildSpec::bare("job2")])).node(
                    "job2",
                    record_then_fail(&history, "tree1 job2", "a suppressed failure"),
                    |n| n.continue_on_failure(),
                )
            },
        )
        .build()
        .unwrap();
    let h = harness(tree);

    let err = h
        .engine
        .launch("tree1", ResourceSet::from_values([1i64, 2, 3]))
        .await
        .unwrap_err();
    assert!(matches!(err, TreeError::NodeFailed { .. }));
    assert_eq!(
        err.action_error().map(|e| e.to_string()).as_deref(),
        Some("an expected failure")
    );
    assert_eq!(*history.lock().unwrap(), vec!["tree1 job2", "tree1 job1"]);
    h.assert_store_empty().await;
}

#[tokio::test]
async fn test_suppressed_failure_still_reaches_caller() {
    let history = History::default();
    let tree = TreeDefinition::builder("tree1")
        .root("job1", record(&history, "tree1 job1"), |root| {
            root.children(|_| Ok(vec![ChildSpec::bare("job2"), ChildSpec::bare("job3")]))
                .node(
                    "job2",
                    record_then_fail(&history, "tree1 job2", "a suppressed failure"),
                    |n| n.continue_on_failure(),
                )
                .node("job3", record(&history, "tree1 job3"), |n| n)
        })
        .build()
        .unwrap();
    let h = harness(tree);

    let err = h.engine.launch("tree1", ResourceSet::new()).await.unwrap_err();
    assert!(err.is_suppressed());
    assert_eq!(
        *history.lock().unwrap(),
        vec!["tree1 job2", "tree1 job3", "tree1 job1"]
    );
    h.assert_store_empty().await;
}

#[tokio::test]
async fn test_root_failure() {
    let history = History::default();
    let tree = TreeDefinition::builder("tree1")
        .root(
            "job1",
            record_then_fail(&history, "tree1 job1", "an expected exception"),
            |root| {
                root.detached()
                    .children(|_| Ok(vec![ChildSpec::bare("job2")]))
                    .node("job2", record(&history, "tree1 job2"), |n| n.detached())
            },
        )
        .build()
        .unwrap();
    let h = harness(tree);

    h.engine
        .launch("tree1", ResourceSet::from_values([1i64, 2, 3]))
        .await
        .unwrap();
    assert_eq!(h.worker.run_once().await.unwrap().unwrap(), Dispatch::Performed);
    let err = h.worker.run_once().await.unwrap().unwrap_err();
    assert!(matches!(err, TreeError::NodeFailed { .. }));
    assert!(h.worker.run_once().await.is_none());

    assert_eq!(*history.lock().unwrap(), vec!["tree1 job2", "tree1 job1"]);
    h.assert_store_empty().await;
}

#[tokio::test]
async fn test_store_already_stored() {
    let tree = TreeDefinition::builder("tree1")
        .root("job1", Arc::new(jobtree::NoopAction), |root| {
            root.children(|_| Ok(vec![ChildSpec::bare("job2"), ChildSpec::bare("job2")]))
                .node("job2", Arc::new(jobtree::NoopAction), |n| n)
        })
        .build()
        .unwrap();
    let h = harness(tree);

    let err = h
        .engine
        .launch("tree1", ResourceSet::new().with(1i64))
        .await
        .unwrap_err();
    assert!(matches!(err, TreeError::DuplicateChild { .. }));
    h.assert_store_empty().await;
}

struct RaisingHandler;

#[async_trait]
impl FailureHandler for RaisingHandler {
    async fn on_failure(&self, _failure: &NodeFailure) -> anyhow::Result<()> {
        Err(anyhow!("called from on_failure block"))
    }
}

#[tokio::test]
async fn test_on_failure() {
    let tree = TreeDefinition::builder("tree1")
        .root("job1", fail("root failure"), |root| root)
        .on_failure(Arc::new(RaisingHandler))
        .build()
        .unwrap();
    let h = harness(tree);

    let err = h
        .engine
        .launch("tree1", ResourceSet::new().with(1i64))
        .await
        .unwrap_err();
    match &err {
        TreeError::FailureHandler { tree, source } => {
            assert_eq!(tree, "tree1");
            assert_eq!(source.to_string(), "called from on_failure block");
        }
        other => panic!("unexpected error: {other}"),
    }
    h.assert_store_empty().await;
}

#[derive(Default)]
struct CollectingHandler {
    seen: Mutex<Vec<NodeFailure>>,
    residual_keys_seen: Mutex<Vec<usize>>,
    store: Option<Arc<dyn KvStore>>,
}

#[async_trait]
impl FailureHandler for CollectingHandler {
    async fn on_failure(&self, failure: &NodeFailure) -> anyhow::Result<()> {
        if let Some(store) = &self.store {
            let keys = store.keys("").await?;
            self.residual_keys_seen.lock().unwrap().push(keys.len());
        }
        self.seen.lock().unwrap().push(failure.clone());
        Ok(())
    }
}

#[tokio::test]
async fn test_failure_handler_runs_after_cleanup() {
    let store: Arc<dyn KvStore> = Arc::new(MemoryStore::new());
    let handler = Arc::new(CollectingHandler {
        store: Some(store.clone()),
        ..Default::default()
    });
    let tree = TreeDefinition::builder("tree1")
        .root("job1", Arc::new(jobtree::NoopAction), |root| {
            root.children(|_| Ok(vec![ChildSpec::new("job2", ResourceSet::new().with(5i64))]))
                .node("job2", fail("leaf broke"), |n| n)
        })
        .on_failure(handler.clone())
        .build()
        .unwrap();
    let h = harness_on(tree, store);

    let err = h.engine.launch("tree1", ResourceSet::new()).await.unwrap_err();
    assert!(matches!(err, TreeError::NodeFailed { .. }));

    let seen = handler.seen.lock().unwrap();
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].tree, "tree1");
    assert_eq!(seen[0].node, "job2");
    assert_eq!(seen[0].key.as_str(), r#"jobtree:node:["tree1","job2",5]"#);
    assert_eq!(seen[0].resources.get::<i64>(0), Some(&5));
    assert_eq!(seen[0].message, "leaf broke");
    assert_eq!(*handler.residual_keys_seen.lock().unwrap(), vec![0]);
}

#[derive(Debug, PartialEq)]
struct Model {
    id: i64,
}

/// Models travel as `["Model", id]`, integers as themselves
struct ModelCodec;

impl ResourceCodec for ModelCodec {
    fn serialize(&self, resources: &ResourceSet) -> jobtree::Result<Vec<Value>> {
        let mut args = Vec::new();
        for resource in resources.iter() {
            if let Some(model) = resource.downcast_ref::<Model>() {
                args.push(json!("Model"));
                args.push(json!(model.id));
            } else if let Some(number) = resource.downcast_ref::<i64>() {
                args.push(json!(number));
            } else {
                return Err(TreeError::codec("unsupported resource"));
            }
        }
        Ok(args)
    }

    fn deserialize(&self, args: &[Value]) -> jobtree::Result<ResourceSet> {
        let mut resources = ResourceSet::new();
        let mut args = args.iter();
        while let Some(arg) = args.next() {
            resources = match arg {
                Value::String(kind) if kind == "Model" => {
                    let id = args
                        .next()
                        .and_then(Value::as_i64)
                        .ok_or_else(|| TreeError::codec("model without id"))?;
                    resources.with(Model { id })
                }
                other => resources.with(
                    other
                        .as_i64()
                        .ok_or_else(|| TreeError::codec(format!("unsupported argument {other}")))?,
                ),
            };
        }
        Ok(resources)
    }
}

#[tokio::test]
async fn test_tree_with_resource() {
    let checked = Arc::new(AtomicUsize::new(0));
    let counter = checked.clone();
    let check = action_fn(move |resources: ResourceSet| {
        let counter = counter.clone();
        async move {
            if resources.get::<Model>(0).is_none() || resources.get::<i64>(1).is_none() {
                return Err(anyhow!("unknown resource"));
            }
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    });
    let tree = TreeDefinition::builder("tree1")
        .root("job1", check.clone(), |root| {
            root.children(|r| Ok(vec![ChildSpec::new("job2", r.clone())]))
                .node("job2", check, |n| n.detached())
        })
        .build()
        .unwrap();
    let mut h = harness(tree);
    h.engine = Arc::new(
        Engine::new(h.engine.registry().clone(), h.store.clone(), h.queue.clone())
            .with_codec(Arc::new(ModelCodec)),
    );
    h.worker = Worker::new(h.engine.clone(), h.queue.clone());

    h.engine
        .launch("tree1", ResourceSet::new().with(Model { id: 1 }).with(1i64))
        .await
        .unwrap();
    let job = h.queue.pop().await.unwrap();
    assert_eq!(job, QueuedJob::new("tree1", "job2", vec![json!("Model"), json!(1), json!(1)]));
    assert_eq!(h.engine.perform_job(&job).await.unwrap(), Dispatch::Performed);
    assert_eq!(checked.load(Ordering::SeqCst), 2);
    h.assert_store_empty().await;
}

#[tokio::test]
async fn test_nested_tree() {
    let history = History::default();
    let tree = TreeDefinition::builder("tree1")
        .root("job1", record(&history, "job1"), |root| {
            root.children(|_| Ok(vec![ChildSpec::bare("job2")])).node(
                "job2",
                record(&history, "job2"),
                |n| {
                    n.detached()
                        .children(|_| Ok(vec![ChildSpec::bare("job3"), ChildSpec::bare("job4")]))
                        .node("job3", record(&history, "job3"), |n| n)
                        .node(
                            "job4",
                            record_then_fail(&history, "job4", "job4 failed"),
                            |n| n.detached().continue_on_failure(),
                        )
                },
            )
        })
        .build()
        .unwrap();
    let h = harness(tree);

    h.engine.launch("tree1", ResourceSet::new()).await.unwrap();
    assert_eq!(*history.lock().unwrap(), vec!["job3"]);
    assert_eq!(h.queue.len().await, 1);

    // job4 fails but still unblocks job2, which goes to the queue
    let err = h.worker.run_once().await.unwrap().unwrap_err();
    assert!(err.is_suppressed());
    assert_eq!(h.queue.len().await, 1);

    assert_eq!(h.worker.run_once().await.unwrap().unwrap(), Dispatch::Performed);
    assert_eq!(*history.lock().unwrap(), vec!["job3", "job4", "job2", "job1"]);
    h.assert_store_empty().await;
}

#[tokio::test]
async fn test_async_tree() {
    let tree = TreeDefinition::builder("tree1")
        .root("job1", fail("should not arrive here"), |root| {
            root.children(|_| Ok(vec![ChildSpec::bare("job2"), ChildSpec::bare("job3")]))
                .node("job2", Arc::new(jobtree::NoopAction), |n| n.detached())
                .node("job3", Arc::new(jobtree::NoopAction), |n| n)
        })
        .build()
        .unwrap();
    let h = harness(tree);

    h.engine.launch("tree1", ResourceSet::new()).await.unwrap();
    assert_eq!(
        h.store
            .smembers(r#"jobtree:node:["tree1","job1"]:children"#)
            .await
            .unwrap(),
        vec![r#"jobtree:node:["tree1","job2"]"#.to_string()]
    );
    assert_eq!(
        h.store.hgetall("jobtree:node:parents").await.unwrap(),
        vec![(
            r#"jobtree:node:["tree1","job2"]"#.to_string(),
            r#"jobtree:node:["tree1","job1"]"#.to_string()
        )]
    );
}

#[tokio::test]
async fn test_async_tree_with_fail() {
    let tree = TreeDefinition::builder("tree1")
        .root("job1", fail("should not arrive here"), |root| {
            root.children(|_| Ok(vec![ChildSpec::bare("job2"), ChildSpec::bare("job3")]))
                .node("job2", Arc::new(jobtree::NoopAction), |n| n.detached())
                .node("job3", fail("an expected failure"), |n| n.continue_on_failure())
        })
        .build()
        .unwrap();
    let h = harness(tree);

    let err = h.engine.launch("tree1", ResourceSet::new()).await.unwrap_err();
    assert!(err.is_suppressed());
    assert_eq!(
        h.engine.graph().child_set_members(&key("tree1", "job1")).await.unwrap(),
        vec![key("tree1", "job2")]
    );

    let err = h.worker.run_once().await.unwrap().unwrap_err();
    assert_eq!(
        err.action_error().map(|e| e.to_string()).as_deref(),
        Some("should not arrive here")
    );
    h.assert_store_empty().await;
}

#[tokio::test]
async fn test_stale_delivery_is_a_no_op() {
    let history = History::default();
    let tree = TreeDefinition::builder("tree1")
        .root("job1", record(&history, "job1"), |root| {
            root.children(|_| Ok(vec![ChildSpec::bare("job2")]))
                .node("job2", record(&history, "job2"), |n| n.detached())
        })
        .build()
        .unwrap();
    let h = harness(tree);

    // never launched
    assert_eq!(
        h.engine.perform("tree1", "job2", vec![]).await.unwrap(),
        Dispatch::Stale
    );
    h.assert_store_empty().await;

    // delivered twice
    h.engine.launch("tree1", ResourceSet::new()).await.unwrap();
    let job = h.queue.pop().await.unwrap();
    assert_eq!(h.engine.perform_job(&job).await.unwrap(), Dispatch::Performed);
    assert_eq!(h.engine.perform_job(&job).await.unwrap(), Dispatch::Stale);
    assert_eq!(*history.lock().unwrap(), vec!["job2", "job1"]);
    h.assert_store_empty().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_workers_run_parent_once() {
    let leaves = Arc::new(AtomicUsize::new(0));
    let roots = Arc::new(AtomicUsize::new(0));
    let leaf_counter = leaves.clone();
    let root_counter = roots.clone();
    let tree = TreeDefinition::builder("fanout")
        .root(
            "collect",
            action_fn(move |_| {
                let counter = root_counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            }),
            |root| {
                root.children(|_| {
                    Ok((0..24i64)
                        .map(|i| ChildSpec::new("part", ResourceSet::new().with(i)))
                        .collect())
                })
                .node(
                    "part",
                    action_fn(move |_| {
                        let counter = leaf_counter.clone();
                        async move {
                            tokio::task::yield_now().await;
                            counter.fetch_add(1, Ordering::SeqCst);
                            Ok(())
                        }
                    }),
                    |n| n.detached(),
                )
            },
        )
        .build()
        .unwrap();
    let h = harness(tree);
    h.engine.launch("fanout", ResourceSet::new()).await.unwrap();
    assert_eq!(h.queue.len().await, 24);

    let workers = (0..4).map(|_| {
        let worker = Worker::new(h.engine.clone(), h.queue.clone());
        tokio::spawn(async move { worker.run_until_idle().await })
    });
    for errors in futures::future::join_all(workers).await {
        assert!(errors.unwrap().is_empty());
    }

    assert_eq!(leaves.load(Ordering::SeqCst), 24);
    assert_eq!(roots.load(Ordering::SeqCst), 1);
    h.assert_store_empty().await;
}

#[tokio::test]
async fn test_runs_on_sled_store() {
    let history = History::default();
    let tree = TreeDefinition::builder("tree1")
        .root("job1", record(&history, "job1"), |root| {
            root.children(one_child_per_resource)
                .node("job2", record(&history, "job2"), |n| n.detached())
        })
        .build()
        .unwrap();
    let store: Arc<dyn KvStore> = Arc::new(SledStore::temporary().unwrap());
    let h = harness_on(tree, store);

    h.engine
        .launch("tree1", ResourceSet::from_values([1i64, 2]))
        .await
        .unwrap();
    assert!(!h.engine.snapshot().await.unwrap().is_empty());
    assert!(h.worker.run_until_idle().await.is_empty());
    assert_eq!(*history.lock().unwrap(), vec!["job2", "job2", "job1"]);
    assert!(h.engine.residual_keys().await.unwrap().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_hard_failure_while_inline_sibling_runs() {
    let roots = Arc::new(AtomicUsize::new(0));
    let (ok, mut started) = gate();
    let tree = TreeDefinition::builder("t")
        .root("r", count(&roots), |root| {
            root.children(|_| Ok(vec![ChildSpec::bare("bad"), ChildSpec::bare("ok")]))
                .node("bad", fail("bad failed"), |n| n.detached())
                .node("ok", ok.clone(), |n| n)
        })
        .build()
        .unwrap();
    let h = harness(tree);

    let engine = h.engine.clone();
    let launch = tokio::spawn(async move { engine.launch("t", ResourceSet::new()).await });
    started.recv().await.unwrap();

    let err = h.worker.run_once().await.unwrap().unwrap_err();
    assert!(matches!(err, TreeError::NodeFailed { .. }));
    h.assert_store_empty().await;

    ok.release.add_permits(1);
    launch.await.unwrap().unwrap();
    assert_eq!(roots.load(Ordering::SeqCst), 0);
    assert!(h.queue.is_empty().await);
    h.assert_store_empty().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_detached_sibling_finishing_after_tear_down() {
    let roots = Arc::new(AtomicUsize::new(0));
    let (ok, mut started) = gate();
    let tree = TreeDefinition::builder("t")
        .root("r", count(&roots), |root| {
            root.children(|_| Ok(vec![ChildSpec::bare("ok"), ChildSpec::bare("bad")]))
                .node("ok", ok.clone(), |n| n.detached())
                .node("bad", fail("bad failed"), |n| n.detached())
        })
        .build()
        .unwrap();
    let h = harness(tree);
    h.engine.launch("t", ResourceSet::new()).await.unwrap();

    let ok_job = h.queue.pop().await.unwrap();
    assert_eq!(ok_job.node, "ok");
    let engine = h.engine.clone();
    let in_flight = tokio::spawn(async move { engine.perform_job(&ok_job).await });
    started.recv().await.unwrap();

    let err = h.worker.run_once().await.unwrap().unwrap_err();
    assert!(matches!(err, TreeError::NodeFailed { .. }));

    ok.release.add_permits(1);
    assert_eq!(in_flight.await.unwrap().unwrap(), Dispatch::Performed);
    assert_eq!(roots.load(Ordering::SeqCst), 0);
    h.assert_store_empty().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_duplicate_delivery_of_sole_child_runs_parent_once() {
    let roots = Arc::new(AtomicUsize::new(0));
    let (only, mut started) = gate();
    let tree = TreeDefinition::builder("t")
        .root("r", count(&roots), |root| {
            root.children(|_| Ok(vec![ChildSpec::bare("only")]))
                .node("only", only.clone(), |n| n.detached())
        })
        .build()
        .unwrap();
    let h = harness(tree);
    h.engine.launch("t", ResourceSet::new()).await.unwrap();
    let job = h.queue.pop().await.unwrap();

    let deliveries: Vec<_> = (0..2)
        .map(|_| {
            let engine = h.engine.clone();
            let job = job.clone();
            tokio::spawn(async move { engine.perform_job(&job).await })
        })
        .collect();
    // both deliveries are inside the action before either finishes
    started.recv().await.unwrap();
    started.recv().await.unwrap();
    only.release.add_permits(1);

    for delivery in deliveries {
        assert_eq!(delivery.await.unwrap().unwrap(), Dispatch::Performed);
    }
    assert_eq!(only.runs.load(Ordering::SeqCst), 2);
    assert_eq!(roots.load(Ordering::SeqCst), 1);
    h.assert_store_empty().await;

    // a third copy arriving late finds nothing left
    h.queue.submit(job).await.unwrap();
    assert_eq!(h.worker.run_once().await.unwrap().unwrap(), Dispatch::Stale);
}
