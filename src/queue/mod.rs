//! Task queue contracts.
//!
//! The durable queue is an external collaborator: it delivers payloads to
//! workers, retries failed attempts and remembers results by idempotency key.
//! [`TaskQueue`] is the client side used to submit work, [`TaskRunner`] the
//! worker side that executes it. [`LocalQueue`] implements both ends in
//! process.

pub mod local;
pub mod payload;

use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex};

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::coordination::partition::IndexRange;
use crate::error::is_retryable;
use crate::io::ObjectUri;

pub use local::LocalQueue;
pub use payload::{
    LeafOutcome, LeafPayload, NodePayload, TaskKind, TaskOutput, TaskPayload, ThinPayload,
};

/// Stable identity of a unit of work, derived from its logical content
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct IdempotencyKey(String);

impl IdempotencyKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    /// Key of a scatter/gather node
    pub fn for_node(specs_uri: &ObjectUri, range: IndexRange, depth: u32) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(specs_uri.to_string().as_bytes());
        hasher.update(b"\n");
        hasher.update(format!("{}:{}:{}", range.start, range.end, depth).as_bytes());
        Self(format!("node-{}", hex::encode(hasher.finalize())))
    }

    /// Key of a leaf experiment
    pub fn for_leaf(experiment_id: &str, sort_index: u64) -> Self {
        Self(format!("leaf-{}-{}", experiment_id, sort_index))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for IdempotencyKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Per-execution information handed to a task body
#[derive(Debug, Clone)]
pub struct TaskContext {
    /// Identifier of the run, stable across retries of the same task
    pub run_id: String,
    /// Attempt number, starting at 1
    pub attempt: u32,
    /// Execution slot this attempt occupies
    pub slot: SlotLease,
}

impl TaskContext {
    /// Context of an attempt that occupies no bounded slot
    pub fn new(run_id: impl Into<String>, attempt: u32) -> Self {
        Self {
            run_id: run_id.into(),
            attempt,
            slot: SlotLease::unbounded(),
        }
    }
}

/// Execution slot held by a running attempt
///
/// A task that waits on tasks it submitted gives its slot back for the
/// duration of the wait, so waiting parents never hold the capacity their
/// children need to start.
#[derive(Clone, Default)]
pub struct SlotLease {
    inner: Option<Arc<LeaseInner>>,
}

struct LeaseInner {
    slots: Arc<Semaphore>,
    permit: Mutex<Option<OwnedSemaphorePermit>>,
}

impl SlotLease {
    pub fn unbounded() -> Self {
        Self::default()
    }

    pub(crate) fn hold(slots: Arc<Semaphore>, permit: OwnedSemaphorePermit) -> Self {
        Self {
            inner: Some(Arc::new(LeaseInner {
                slots,
                permit: Mutex::new(Some(permit)),
            })),
        }
    }

    /// Whether a bounded slot is currently held
    pub fn is_held(&self) -> bool {
        self.inner.as_ref().is_some_and(|inner| {
            inner
                .permit
                .lock()
                .map(|permit| permit.is_some())
                .unwrap_or(false)
        })
    }

    /// Release the slot while `future` runs, then wait for a slot again
    pub async fn suspend<F: Future>(&self, future: F) -> Result<F::Output> {
        let Some(inner) = &self.inner else {
            return Ok(future.await);
        };

        let released = inner.permit.lock().ok().and_then(|mut permit| permit.take());
        drop(released);

        let output = future.await;

        let permit = inner
            .slots
            .clone()
            .acquire_owned()
            .await
            .map_err(|e| anyhow!("Task slots closed: {}", e))?;
        if let Ok(mut held) = inner.permit.lock() {
            *held = Some(permit);
        }
        Ok(output)
    }
}

impl fmt::Debug for SlotLease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SlotLease")
            .field("bounded", &self.inner.is_some())
            .field("held", &self.is_held())
            .finish()
    }
}

/// Terminal failure of a task, after the queue gave up on it
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message} (after {attempts} attempt(s))")]
pub struct TaskFailure {
    pub message: String,
    pub retryable: bool,
    pub attempts: u32,
}

impl TaskFailure {
    pub fn from_error(err: &anyhow::Error, attempts: u32) -> Self {
        Self {
            message: format!("{:#}", err),
            retryable: is_retryable(err),
            attempts,
        }
    }
}

pub type TaskResult = std::result::Result<TaskOutput, TaskFailure>;

/// Handle on a submitted task; clones share one result
#[derive(Clone)]
pub struct TaskHandle {
    key: IdempotencyKey,
    kind: TaskKind,
    result: Shared<BoxFuture<'static, TaskResult>>,
}

impl TaskHandle {
    pub fn new(
        key: IdempotencyKey,
        kind: TaskKind,
        result: impl Future<Output = TaskResult> + Send + 'static,
    ) -> Self {
        Self {
            key,
            kind,
            result: result.boxed().shared(),
        }
    }

    pub fn key(&self) -> &IdempotencyKey {
        &self.key
    }

    pub fn kind(&self) -> TaskKind {
        self.kind
    }

    /// Wait for the task to finish
    pub async fn result(&self) -> TaskResult {
        self.result.clone().await
    }

    /// The result, if the task has already finished
    pub fn peek(&self) -> Option<TaskResult> {
        self.result.peek().cloned()
    }

    /// Future that drives the task to completion
    pub(crate) fn driver(&self) -> Shared<BoxFuture<'static, TaskResult>> {
        self.result.clone()
    }
}

impl fmt::Debug for TaskHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskHandle")
            .field("key", &self.key)
            .field("kind", &self.kind)
            .field("finished", &self.result.peek().is_some())
            .finish()
    }
}

/// Client side of the queue
#[async_trait]
pub trait TaskQueue: Send + Sync {
    /// Submit a payload; submitting an existing key returns the existing task
    async fn submit(&self, payload: TaskPayload, key: IdempotencyKey) -> Result<TaskHandle>;
}

/// Worker side of the queue: executes one attempt of one task
#[async_trait]
pub trait TaskRunner: Send + Sync {
    async fn run(&self, payload: TaskPayload, ctx: TaskContext) -> Result<TaskOutput>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_key_is_stable() {
        let specs = ObjectUri::new("bucket", "sweep/task/v1.0.0/ts/specs.pq");
        let range = IndexRange { start: 0, end: 5 };

        let a = IdempotencyKey::for_node(&specs, range, 1);
        let b = IdempotencyKey::for_node(&specs.clone(), range, 1);
        assert_eq!(a, b);
        assert!(a.as_str().starts_with("node-"));
        assert_eq!(a.as_str().len(), "node-".len() + 64);
    }

    #[test]
    fn test_node_key_depends_on_identity() {
        let specs = ObjectUri::new("bucket", "a/specs.pq");
        let other = ObjectUri::new("bucket", "b/specs.pq");
        let range = IndexRange { start: 0, end: 5 };
        let shifted = IndexRange { start: 5, end: 10 };

        let base = IdempotencyKey::for_node(&specs, range, 1);
        assert_ne!(base, IdempotencyKey::for_node(&other, range, 1));
        assert_ne!(base, IdempotencyKey::for_node(&specs, shifted, 1));
        assert_ne!(base, IdempotencyKey::for_node(&specs, range, 2));
    }

    #[test]
    fn test_leaf_key() {
        let key = IdempotencyKey::for_leaf("task/v1.0.0/ts", 7);
        assert_eq!(key.to_string(), "leaf-task/v1.0.0/ts-7");
        assert_eq!(key, IdempotencyKey::for_leaf("task/v1.0.0/ts", 7));
    }

    #[tokio::test]
    async fn test_handle_shares_result() {
        let handle = TaskHandle::new(IdempotencyKey::new("k"), TaskKind::Node, async {
            Ok(TaskOutput::Node(ThinPayload::default()))
        });
        assert!(handle.peek().is_none());

        let clone = handle.clone();
        assert_eq!(
            clone.result().await.unwrap(),
            TaskOutput::Node(ThinPayload::default())
        );
        assert!(handle.peek().is_some());
    }
}
