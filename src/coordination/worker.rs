use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;

use super::executor::LeafExecutor;
use super::node::ScatterGatherNode;
use crate::config::{MERGE_CONCURRENCY, WorkerConfig};
use crate::io::ArtifactStore;
use crate::queue::{TaskContext, TaskOutput, TaskPayload, TaskQueue, TaskRunner};
use crate::registry::ExperimentRegistry;

/// Task body the queue invokes for every delivered payload
///
/// Routes leaf payloads to the [`LeafExecutor`] and node payloads to the
/// [`ScatterGatherNode`]. One worker holds the registry and the artifact cache
/// shared by every task it runs.
pub struct Worker {
    pub config: WorkerConfig,
    executor: LeafExecutor,
    node: ScatterGatherNode,
}

impl Worker {
    pub fn new(
        config: WorkerConfig,
        registry: Arc<ExperimentRegistry>,
        artifacts: Arc<ArtifactStore>,
        queue: Arc<dyn TaskQueue>,
    ) -> Self {
        Self {
            config,
            executor: LeafExecutor::new(Arc::clone(&registry), Arc::clone(&artifacts)),
            node: ScatterGatherNode::new(queue, artifacts, registry, MERGE_CONCURRENCY),
        }
    }
}

#[async_trait]
impl TaskRunner for Worker {
    async fn run(&self, payload: TaskPayload, ctx: TaskContext) -> Result<TaskOutput> {
        match payload {
            TaskPayload::Leaf(leaf) => {
                let task_name = leaf.task_name.clone();
                let outcome = self
                    .executor
                    .execute(leaf, &ctx)
                    .await
                    .with_context(|| format!("{}: leaf of {} failed", self.config.name, task_name))?;
                Ok(TaskOutput::Leaf(outcome))
            }
            TaskPayload::Node(node) => {
                let range = node.range;
                let depth = node.depth;
                let thin = self.node.run(node, &ctx).await.with_context(|| {
                    format!("{}: node {} at depth {} failed", self.config.name, range, depth)
                })?;
                Ok(TaskOutput::Node(thin))
            }
        }
    }
}
