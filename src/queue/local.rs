use std::panic::AssertUnwindSafe;
use std::sync::{Arc, OnceLock, Weak};
use std::time::Instant;

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use futures::FutureExt;
use tokio::sync::{Semaphore, mpsc};
use tracing::{debug, warn};
use uuid::Uuid;

use super::{
    IdempotencyKey, SlotLease, TaskContext, TaskFailure, TaskHandle, TaskKind, TaskOutput,
    TaskPayload, TaskQueue, TaskResult, TaskRunner,
};
use crate::config::{QueueConfig, WorkerConfig};
use crate::error::{SweepError, is_retryable};
use crate::telemetry::TelemetryEvent;

/// In-process task queue
///
/// Honors the contract of a durable queue within one process: tasks are
/// remembered by idempotency key (running or finished), retryable failures
/// are retried with exponential backoff, every attempt runs under a
/// kind-specific timeout, and leaves and nodes draw from separate slot pools
/// so nodes waiting on children never starve the leaves they wait for.
/// A node suspending on its children through [`SlotLease::suspend`] frees
/// its node slot for the wait.
#[derive(Clone)]
pub struct LocalQueue {
    inner: Arc<QueueInner>,
}

struct QueueInner {
    config: QueueConfig,
    tasks: DashMap<IdempotencyKey, TaskHandle>,
    leaf_slots: Arc<Semaphore>,
    node_slots: Arc<Semaphore>,
    runner: OnceLock<Weak<dyn TaskRunner>>,
    telemetry_tx: Option<mpsc::UnboundedSender<TelemetryEvent>>,
}

impl LocalQueue {
    pub fn new(config: QueueConfig, worker: &WorkerConfig) -> Self {
        Self::build(config, worker, None)
    }

    /// Create a queue that reports task lifecycle events on `telemetry_tx`
    pub fn with_telemetry(
        config: QueueConfig,
        worker: &WorkerConfig,
        telemetry_tx: mpsc::UnboundedSender<TelemetryEvent>,
    ) -> Self {
        Self::build(config, worker, Some(telemetry_tx))
    }

    fn build(
        config: QueueConfig,
        worker: &WorkerConfig,
        telemetry_tx: Option<mpsc::UnboundedSender<TelemetryEvent>>,
    ) -> Self {
        Self {
            inner: Arc::new(QueueInner {
                config,
                tasks: DashMap::new(),
                leaf_slots: Arc::new(Semaphore::new(worker.slots.max(1))),
                node_slots: Arc::new(Semaphore::new(worker.durable_slots.max(1))),
                runner: OnceLock::new(),
                telemetry_tx,
            }),
        }
    }

    /// Attach the worker that executes tasks; only the first call takes effect
    ///
    /// The queue keeps a weak reference, so the caller owns the worker.
    pub fn attach(&self, runner: &Arc<dyn TaskRunner>) {
        if self.inner.runner.set(Arc::downgrade(runner)).is_err() {
            warn!("A task runner is already attached to this queue");
        }
    }

    /// Number of distinct tasks ever submitted
    pub fn task_count(&self) -> usize {
        self.inner.tasks.len()
    }

    pub fn config(&self) -> &QueueConfig {
        &self.inner.config
    }
}

#[async_trait]
impl TaskQueue for LocalQueue {
    async fn submit(&self, payload: TaskPayload, key: IdempotencyKey) -> Result<TaskHandle> {
        let size = serde_json::to_vec(&payload)?.len();
        let limit = self.inner.config.max_payload_bytes;
        if size > limit {
            return Err(SweepError::PayloadTooLarge { size, limit }.into());
        }

        let kind = payload.kind();
        let handle = match self.inner.tasks.entry(key.clone()) {
            Entry::Occupied(existing) => {
                debug!("Task {} already submitted, reusing it", key);
                self.inner.send(TelemetryEvent::TaskDeduplicated { kind });
                return Ok(existing.get().clone());
            }
            Entry::Vacant(slot) => {
                let inner = self.inner.clone();
                let run_id = Uuid::new_v4().to_string();
                let handle = TaskHandle::new(
                    key.clone(),
                    kind,
                    async move { inner.execute(payload, run_id).await },
                );
                slot.insert(handle.clone());
                handle
            }
        };

        self.inner.send(TelemetryEvent::TaskSubmitted { kind });
        // Run eagerly, whether or not anyone awaits the handle
        tokio::spawn(handle.driver());
        Ok(handle)
    }
}

impl QueueInner {
    fn send(&self, event: TelemetryEvent) {
        if let Some(tx) = &self.telemetry_tx {
            let _ = tx.send(event);
        }
    }

    /// Run a task to completion, retrying retryable failures
    async fn execute(self: Arc<Self>, payload: TaskPayload, run_id: String) -> TaskResult {
        let kind = payload.kind();
        let (slots, timeout) = match kind {
            TaskKind::Leaf => (self.leaf_slots.clone(), self.config.leaf_timeout),
            TaskKind::Node => (self.node_slots.clone(), self.config.node_timeout),
        };
        let max_attempts = self.config.max_attempts.max(1);
        let mut attempt = 0;

        loop {
            attempt += 1;
            let err = match self
                .attempt(&payload, &run_id, attempt, &slots, timeout)
                .await
            {
                Ok(output) => return Ok(output),
                Err(err) => err,
            };

            let retryable = is_retryable(&err);
            let will_retry = retryable && attempt < max_attempts;
            self.send(TelemetryEvent::TaskFailed {
                kind,
                will_retry,
            });

            if !will_retry {
                warn!(
                    "Task {} failed permanently after {} attempt(s): {:#}",
                    run_id, attempt, err
                );
                return Err(TaskFailure::from_error(&err, attempt));
            }

            let delay = self.config.retry_delay(attempt);
            warn!(
                "Task {} attempt {} failed, retrying in {:?}: {:#}",
                run_id, attempt, delay, err
            );
            tokio::time::sleep(delay).await;
        }
    }

    async fn attempt(
        &self,
        payload: &TaskPayload,
        run_id: &str,
        attempt: u32,
        slots: &Arc<Semaphore>,
        timeout: std::time::Duration,
    ) -> Result<TaskOutput> {
        let runner = self
            .runner
            .get()
            .and_then(Weak::upgrade)
            .ok_or_else(|| SweepError::InvalidConfig("no task runner attached to the queue".to_string()))?;

        let permit = slots
            .clone()
            .acquire_owned()
            .await
            .map_err(|e| anyhow!("Task slots closed: {}", e))?;
        // Released when the attempt ends, or for as long as the task suspends itself
        let slot = SlotLease::hold(slots.clone(), permit);

        let kind = payload.kind();
        self.send(TelemetryEvent::TaskStarted { kind, attempt });
        let started = Instant::now();

        let ctx = TaskContext {
            run_id: run_id.to_string(),
            attempt,
            slot: slot.clone(),
        };
        let run = AssertUnwindSafe(runner.run(payload.clone(), ctx)).catch_unwind();
        let output = match tokio::time::timeout(timeout, run).await {
            Ok(Ok(result)) => result?,
            Ok(Err(_)) => return Err(anyhow!("Task panicked")),
            Err(_) => return Err(SweepError::TaskTimeout(timeout).into()),
        };

        let size = serde_json::to_vec(&output)?.len();
        let limit = self.config.max_payload_bytes;
        if size > limit {
            return Err(SweepError::PayloadTooLarge { size, limit }.into());
        }

        self.send(TelemetryEvent::TaskCompleted {
            kind,
            duration_ms: started.elapsed().as_millis() as u64,
        });
        Ok(output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::QueueConfigBuilder;
    use crate::coordination::partition::IndexRange;
    use crate::io::ObjectUri;
    use crate::queue::{LeafPayload, NodePayload, ThinPayload};
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    /// Runner that fails a configurable number of times before succeeding
    struct FlakyRunner {
        calls: AtomicU32,
        failures: u32,
        fatal: bool,
        delay: Duration,
    }

    impl FlakyRunner {
        fn new(failures: u32) -> Self {
            Self {
                calls: AtomicU32::new(0),
                failures,
                fatal: false,
                delay: Duration::ZERO,
            }
        }
    }

    #[async_trait]
    impl TaskRunner for FlakyRunner {
        async fn run(&self, _payload: TaskPayload, ctx: TaskContext) -> Result<TaskOutput> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            assert_eq!(call, ctx.attempt);
            tokio::time::sleep(self.delay).await;
            if call <= self.failures {
                if self.fatal {
                    return Err(SweepError::UnknownTask {
                        name: "missing".to_string(),
                    }
                    .into());
                }
                return Err(anyhow!("transient failure {}", call));
            }
            Ok(TaskOutput::Node(ThinPayload::default()))
        }
    }

    fn fast_config() -> QueueConfig {
        QueueConfigBuilder::default()
            .retry_base_delay(Duration::from_millis(1))
            .max_attempts(3)
            .leaf_timeout(Duration::from_millis(200))
            .node_timeout(Duration::from_millis(200))
            .build()
            .unwrap()
    }

    fn worker_config() -> WorkerConfig {
        WorkerConfig {
            name: "test".to_string(),
            slots: 2,
            durable_slots: 2,
        }
    }

    fn node_payload() -> TaskPayload {
        TaskPayload::Node(NodePayload {
            specs_uri: ObjectUri::new("bucket", "exp/specs.pq"),
            range: IndexRange { start: 0, end: 1 },
            depth: 0,
            task_name: "task".to_string(),
            fanout: Default::default(),
            root_workflow_run_id: None,
        })
    }

    fn queue_with(runner: FlakyRunner, config: QueueConfig) -> (LocalQueue, Arc<FlakyRunner>) {
        let queue = LocalQueue::new(config, &worker_config());
        let runner = Arc::new(runner);
        let dyn_runner: Arc<dyn TaskRunner> = runner.clone();
        queue.attach(&dyn_runner);
        // keep the runner alive through the returned Arc
        drop(dyn_runner);
        (queue, runner)
    }

    #[tokio::test]
    async fn test_retries_transient_failures() {
        let (queue, runner) = queue_with(FlakyRunner::new(2), fast_config());
        let handle = queue
            .submit(node_payload(), IdempotencyKey::new("k"))
            .await
            .unwrap();
        assert!(handle.result().await.is_ok());
        assert_eq!(runner.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_gives_up_after_max_attempts() {
        let (queue, runner) = queue_with(FlakyRunner::new(10), fast_config());
        let handle = queue
            .submit(node_payload(), IdempotencyKey::new("k"))
            .await
            .unwrap();
        let failure = handle.result().await.unwrap_err();
        assert_eq!(failure.attempts, 3);
        assert!(failure.retryable);
        assert!(failure.message.contains("transient failure 3"));
        assert_eq!(runner.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_fatal_failures_not_retried() {
        let mut flaky = FlakyRunner::new(10);
        flaky.fatal = true;
        let (queue, runner) = queue_with(flaky, fast_config());
        let handle = queue
            .submit(node_payload(), IdempotencyKey::new("k"))
            .await
            .unwrap();
        let failure = handle.result().await.unwrap_err();
        assert!(!failure.retryable);
        assert_eq!(runner.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_duplicate_keys_execute_once() {
        let mut flaky = FlakyRunner::new(0);
        flaky.delay = Duration::from_millis(20);
        let (queue, runner) = queue_with(flaky, fast_config());

        let first = queue
            .submit(node_payload(), IdempotencyKey::new("same"))
            .await
            .unwrap();
        let second = queue
            .submit(node_payload(), IdempotencyKey::new("same"))
            .await
            .unwrap();
        assert!(first.result().await.is_ok());
        assert!(second.result().await.is_ok());

        // also after completion
        let third = queue
            .submit(node_payload(), IdempotencyKey::new("same"))
            .await
            .unwrap();
        assert!(third.peek().is_some());
        assert_eq!(runner.calls.load(Ordering::SeqCst), 1);
        assert_eq!(queue.task_count(), 1);
    }

    #[tokio::test]
    async fn test_timeout_is_retried_then_fails() {
        let mut flaky = FlakyRunner::new(0);
        flaky.delay = Duration::from_secs(5);
        let (queue, runner) = queue_with(flaky, fast_config());

        let handle = queue
            .submit(node_payload(), IdempotencyKey::new("slow"))
            .await
            .unwrap();
        let failure = handle.result().await.unwrap_err();
        assert!(failure.message.contains("timeout"));
        assert_eq!(runner.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_oversized_payload_rejected() {
        let config = QueueConfigBuilder::default()
            .max_payload_bytes(64)
            .build()
            .unwrap();
        let (queue, _runner) = queue_with(FlakyRunner::new(0), config);

        let mut record = crate::schema::Row::new();
        record.insert("blob".to_string(), "x".repeat(1024).into());
        let payload = TaskPayload::Leaf(LeafPayload {
            task_name: "task".to_string(),
            record,
            artifact_prefix: ObjectUri::new("bucket", "out"),
        });

        let err = queue
            .submit(payload, IdempotencyKey::new("big"))
            .await
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<SweepError>(),
            Some(SweepError::PayloadTooLarge { .. })
        ));
        assert_eq!(queue.task_count(), 0);
    }

    /// Runner whose depth-0 node submits one depth-1 child and waits for it
    struct NestingRunner {
        queue: LocalQueue,
        suspend: bool,
        child_saw_slot: AtomicU32,
    }

    #[async_trait]
    impl TaskRunner for NestingRunner {
        async fn run(&self, payload: TaskPayload, ctx: TaskContext) -> Result<TaskOutput> {
            let TaskPayload::Node(node) = payload else {
                return Err(anyhow!("unexpected leaf"));
            };
            if node.depth > 0 {
                if ctx.slot.is_held() {
                    self.child_saw_slot.fetch_add(1, Ordering::SeqCst);
                }
                return Ok(TaskOutput::Node(ThinPayload::default()));
            }

            let mut child = node.clone();
            child.depth = 1;
            let handle = self
                .queue
                .submit(TaskPayload::Node(child), IdempotencyKey::new("child"))
                .await?;
            let result = if self.suspend {
                ctx.slot.suspend(handle.result()).await?
            } else {
                handle.result().await
            };
            assert!(ctx.slot.is_held());
            result.map_err(|failure| anyhow!("child failed: {}", failure))
        }
    }

    fn nesting_queue(suspend: bool) -> (LocalQueue, Arc<NestingRunner>) {
        let worker = WorkerConfig {
            name: "test".to_string(),
            slots: 1,
            durable_slots: 1,
        };
        let config = QueueConfigBuilder::default()
            .retry_base_delay(Duration::from_millis(1))
            .max_attempts(1)
            .node_timeout(Duration::from_millis(300))
            .build()
            .unwrap();
        let queue = LocalQueue::new(config, &worker);
        let runner = Arc::new(NestingRunner {
            queue: queue.clone(),
            suspend,
            child_saw_slot: AtomicU32::new(0),
        });
        let dyn_runner: Arc<dyn TaskRunner> = runner.clone();
        queue.attach(&dyn_runner);
        (queue, runner)
    }

    #[tokio::test]
    async fn test_waiting_parent_frees_its_slot() {
        let (queue, runner) = nesting_queue(true);
        let handle = queue
            .submit(node_payload(), IdempotencyKey::new("parent"))
            .await
            .unwrap();
        assert!(handle.result().await.is_ok());
        assert_eq!(runner.child_saw_slot.load(Ordering::SeqCst), 1);
        assert_eq!(queue.task_count(), 2);
    }

    #[tokio::test]
    async fn test_parent_holding_its_slot_starves_child() {
        let (queue, _runner) = nesting_queue(false);
        let handle = queue
            .submit(node_payload(), IdempotencyKey::new("parent"))
            .await
            .unwrap();
        let failure = handle.result().await.unwrap_err();
        assert!(failure.message.contains("timeout"));
    }

    #[tokio::test]
    async fn test_missing_runner_fails_fast() {
        let queue = LocalQueue::new(fast_config(), &worker_config());
        let handle = queue
            .submit(node_payload(), IdempotencyKey::new("orphan"))
            .await
            .unwrap();
        let failure = handle.result().await.unwrap_err();
        assert!(!failure.retryable);
        assert_eq!(failure.attempts, 1);
    }
}
