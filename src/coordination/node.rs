use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use anyhow::{Context, Result, anyhow};
use futures::future::join_all;
use serde_json::Value;
use tokio::task::JoinSet;
use tracing::{debug, info};

use super::partition::{IndexRange, is_base_case, split_range, verify_partition};
use crate::allocation::layout::ExperimentLayout;
use crate::error::SweepError;
use crate::io::{ArtifactStore, FileReference, ObjectUri};
use crate::queue::{
    IdempotencyKey, LeafOutcome, LeafPayload, NodePayload, TaskContext, TaskHandle, TaskOutput,
    TaskPayload, TaskQueue, ThinPayload,
};
use crate::registry::ExperimentRegistry;
use crate::schema::record::{EXPERIMENT_ID, ROOT_WORKFLOW_RUN_ID};
use crate::schema::{
    FILE_REFS_TABLE, RecordSchema, Row, SCALARS_TABLE, SORT_INDEX, SORT_SUBINDEX, ValidationError,
};
use crate::table::Table;

/// The recursive scatter/gather unit
///
/// A node owns a contiguous range of an experiment's spec table. Small ranges
/// (or nodes at the maximum depth) submit one leaf task per record; larger
/// ranges are split into child nodes submitted through the same queue. Either
/// way the node waits for everything it submitted, merges the results into
/// tables ordered by `sort_index`, writes them under its own deterministic
/// namespace and returns their URIs. Nothing is returned unless every child
/// succeeded.
pub struct ScatterGatherNode {
    queue: Arc<dyn TaskQueue>,
    artifacts: Arc<ArtifactStore>,
    registry: Arc<ExperimentRegistry>,
    merge_concurrency: usize,
}

impl ScatterGatherNode {
    pub fn new(
        queue: Arc<dyn TaskQueue>,
        artifacts: Arc<ArtifactStore>,
        registry: Arc<ExperimentRegistry>,
        merge_concurrency: usize,
    ) -> Self {
        Self {
            queue,
            artifacts,
            registry,
            merge_concurrency: merge_concurrency.max(1),
        }
    }

    pub async fn run(&self, mut payload: NodePayload, ctx: &TaskContext) -> Result<ThinPayload> {
        payload.fanout.validate()?;
        if payload.range.is_empty() {
            return Err(SweepError::PartitionInvariant(format!(
                "node at depth {} received the empty range {}",
                payload.depth, payload.range
            ))
            .into());
        }

        // The root names the whole tree after its own run
        let root_run_id = payload
            .root_workflow_run_id
            .get_or_insert_with(|| ctx.run_id.clone())
            .clone();
        let layout = ExperimentLayout::from_specs_uri(&payload.specs_uri)?;

        let tables = if is_base_case(payload.range, payload.depth, &payload.fanout) {
            debug!(
                "Node {} at depth {} running {} leaves",
                payload.range,
                payload.depth,
                payload.range.len()
            );
            self.run_leaves(&payload, &layout, &root_run_id, ctx).await?
        } else {
            self.run_children(&payload, root_run_id, ctx).await?
        };

        let thin = self.publish(&layout, &payload, tables).await?;
        info!(
            "Node {} at depth {} published {} table(s)",
            payload.range,
            payload.depth,
            thin.tables.len()
        );
        Ok(thin)
    }

    /// Base case: one leaf per record, results assembled into tables
    async fn run_leaves(
        &self,
        payload: &NodePayload,
        layout: &ExperimentLayout,
        root_run_id: &str,
        ctx: &TaskContext,
    ) -> Result<BTreeMap<String, Table>> {
        let entry = self.registry.lookup(&payload.task_name)?;
        let rows = self.load_spec_rows(&payload.specs_uri, payload.range).await?;

        let mut handles = Vec::with_capacity(rows.len());
        for (offset, mut row) in rows.into_iter().enumerate() {
            let sort_index = payload.range.start + offset as u64;
            let experiment_id = row
                .get(EXPERIMENT_ID)
                .and_then(Value::as_str)
                .with_context(|| format!("Spec row {} has no experiment_id", sort_index))?
                .to_string();
            row.insert(ROOT_WORKFLOW_RUN_ID.to_string(), Value::from(root_run_id));

            let leaf = LeafPayload {
                task_name: payload.task_name.clone(),
                record: row,
                artifact_prefix: layout.leaf_prefix(sort_index),
            };
            let handle = self
                .queue
                .submit(
                    TaskPayload::Leaf(leaf),
                    IdempotencyKey::for_leaf(&experiment_id, sort_index),
                )
                .await
                .with_context(|| format!("Failed to submit leaf {}", sort_index))?;
            handles.push((sort_index.to_string(), handle));
        }

        let outcomes: Vec<LeafOutcome> = self
            .await_all(payload, handles, "sort_index", ctx)
            .await?
            .into_iter()
            .map(|output| output.into_leaf().context("Leaf task returned a node result"))
            .collect::<Result<_>>()?;

        leaf_tables(&entry.output_schema, &outcomes)
    }

    /// Recursive case: split the range, submit child nodes, merge their tables in range order
    async fn run_children(
        &self,
        payload: &NodePayload,
        root_run_id: String,
        ctx: &TaskContext,
    ) -> Result<BTreeMap<String, Table>> {
        let children = split_range(payload.range, payload.fanout.branching_factor);
        verify_partition(payload.range, &children)?;
        let depth = payload.depth + 1;

        debug!(
            "Node {} at depth {} splitting into {} children",
            payload.range,
            payload.depth,
            children.len()
        );

        let mut handles = Vec::with_capacity(children.len());
        for child in &children {
            let child_payload = NodePayload {
                specs_uri: payload.specs_uri.clone(),
                range: *child,
                depth,
                task_name: payload.task_name.clone(),
                fanout: payload.fanout,
                root_workflow_run_id: Some(root_run_id.clone()),
            };
            let key = IdempotencyKey::for_node(&payload.specs_uri, *child, depth);
            let handle = self
                .queue
                .submit(TaskPayload::Node(child_payload), key)
                .await
                .with_context(|| format!("Failed to submit child node {}", child))?;
            handles.push((child.to_string(), handle));
        }

        let thins: Vec<ThinPayload> = self
            .await_all(payload, handles, "child", ctx)
            .await?
            .into_iter()
            .map(|output| output.into_thin().context("Child node returned a leaf result"))
            .collect::<Result<_>>()?;

        let names: BTreeSet<&String> = thins.iter().flat_map(|t| t.tables.keys()).collect();
        let mut tables = BTreeMap::new();
        for name in names {
            let table = self.merge_table(name, &thins).await?;
            tables.insert(name.clone(), table);
        }
        Ok(tables)
    }

    /// Wait for every handle; any failure withholds the whole node
    async fn await_all(
        &self,
        payload: &NodePayload,
        handles: Vec<(String, TaskHandle)>,
        label: &str,
        ctx: &TaskContext,
    ) -> Result<Vec<TaskOutput>> {
        // Children may need the very slot this node occupies
        let results = ctx
            .slot
            .suspend(join_all(handles.iter().map(|(_, handle)| handle.result())))
            .await?;

        let mut outputs = Vec::with_capacity(results.len());
        let mut failures = Vec::new();
        for ((name, _), result) in handles.iter().zip(results) {
            match result {
                Ok(output) => outputs.push(output),
                Err(failure) => failures.push(format!("{} {}: {}", label, name, failure)),
            }
        }

        if !failures.is_empty() {
            return Err(SweepError::ChildFailed {
                scope: format!("node {} at depth {}", payload.range, payload.depth),
                failures,
            }
            .into());
        }
        Ok(outputs)
    }

    /// Rows of the spec table for `range`, checked to carry exactly its sort indexes
    async fn load_spec_rows(
        &self,
        specs_uri: &ObjectUri,
        range: IndexRange,
    ) -> Result<Vec<Row>> {
        let local = self
            .artifacts
            .fetch(&FileReference::ObjectUri(specs_uri.clone()))
            .await
            .context("Failed to fetch spec table")?;
        let data = tokio::fs::read(&local)
            .await
            .with_context(|| format!("Failed to read cached spec table {}", local.display()))?;
        let specs = Table::from_parquet(data.into())?;

        let slice = specs.slice(range.start as usize, range.len() as usize)?;
        let indexes = slice.int_column(SORT_INDEX)?;
        for (offset, index) in indexes.iter().enumerate() {
            let expected = range.start + offset as u64;
            if *index < 0 || *index as u64 != expected {
                return Err(SweepError::PartitionInvariant(format!(
                    "spec row at position {} has sort_index {}",
                    expected, index
                ))
                .into());
            }
        }
        slice.to_rows()
    }

    /// Fetch one table from every child that has it and concatenate in child order
    async fn merge_table(&self, name: &str, thins: &[ThinPayload]) -> Result<Table> {
        let sources: Vec<(usize, ObjectUri)> = thins
            .iter()
            .enumerate()
            .filter_map(|(position, thin)| thin.tables.get(name).map(|uri| (position, uri.clone())))
            .collect();

        let mut join_set: JoinSet<(usize, Result<Table>)> = JoinSet::new();
        let mut fetched: Vec<Option<Table>> = vec![None; thins.len()];

        for (position, uri) in sources {
            // Wait if we've reached concurrency limit
            while join_set.len() >= self.merge_concurrency {
                if let Some(result) = join_set.join_next().await {
                    let (position, table) = result.map_err(|e| anyhow!("Task panicked: {}", e))?;
                    fetched[position] = Some(table?);
                }
            }

            let artifacts = Arc::clone(&self.artifacts);
            join_set.spawn(async move {
                let table = match artifacts.get_bytes(&uri).await {
                    Ok(data) => Table::from_parquet(data)
                        .with_context(|| format!("Failed to decode child table {}", uri)),
                    Err(e) => Err(e),
                };
                (position, table)
            });
        }

        while let Some(result) = join_set.join_next().await {
            let (position, table) = result.map_err(|e| anyhow!("Task panicked: {}", e))?;
            fetched[position] = Some(table?);
        }

        let ordered: Vec<Table> = fetched.into_iter().flatten().collect();
        Table::concat(&ordered).with_context(|| format!("Failed to merge table {}", name))
    }

    async fn publish(
        &self,
        layout: &ExperimentLayout,
        payload: &NodePayload,
        tables: BTreeMap<String, Table>,
    ) -> Result<ThinPayload> {
        let mut thin = ThinPayload::default();
        for (name, table) in tables {
            table
                .check_sorted(SORT_INDEX)
                .with_context(|| format!("Table {} of node {}", name, payload.range))?;
            let uri = layout.node_table(payload.depth, payload.range, &name);
            self.artifacts
                .put_bytes(&uri, table.to_parquet()?)
                .await
                .with_context(|| format!("Failed to write table {}", name))?;
            thin.tables.insert(name, uri);
        }
        Ok(thin)
    }
}

/// Assemble the tables of a base-case node from its leaves, in sort_index order
///
/// Every row starts with the leaf's index columns. Auxiliary rows also carry
/// their position within the leaf as `sort_subindex`.
fn leaf_tables(schema: &RecordSchema, outcomes: &[LeafOutcome]) -> Result<BTreeMap<String, Table>> {
    let mut scalars = Vec::with_capacity(outcomes.len());
    let mut file_refs = Vec::with_capacity(outcomes.len());
    let mut auxiliary: BTreeMap<String, Vec<Row>> = BTreeMap::new();

    for outcome in outcomes {
        let mut row = outcome.index.clone();
        row.extend(outcome.scalars.clone());
        scalars.push(row);

        if schema.has_file_refs() {
            let mut row = outcome.index.clone();
            row.extend(outcome.file_refs.clone());
            file_refs.push(row);
        }

        for (name, rows) in &outcome.tables {
            let target = auxiliary.entry(name.clone()).or_default();
            for (subindex, aux_row) in rows.iter().enumerate() {
                let mut row = outcome.index.clone();
                row.insert(SORT_SUBINDEX.to_string(), Value::from(subindex));
                for (column, value) in aux_row {
                    if row.contains_key(column) {
                        return Err(SweepError::from(ValidationError::single(
                            name.as_str(),
                            column.as_str(),
                            "auxiliary column collides with an index column",
                        ))
                        .into());
                    }
                    row.insert(column.clone(), value.clone());
                }
                target.push(row);
            }
        }
    }

    let mut tables = BTreeMap::new();
    tables.insert(SCALARS_TABLE.to_string(), Table::from_rows(&scalars)?);
    if schema.has_file_refs() {
        tables.insert(FILE_REFS_TABLE.to_string(), Table::from_rows(&file_refs)?);
    }
    for (name, rows) in auxiliary {
        // A declared table no leaf wrote rows to has nothing to publish
        if !rows.is_empty() {
            tables.insert(name, Table::from_rows(&rows)?);
        }
    }
    Ok(tables)
}
