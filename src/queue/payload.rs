//! Wire payloads exchanged with the task queue.
//!
//! Payloads only ever carry row-sized data or object URIs; tables travel
//! through the object store.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::config::FanoutConfig;
use crate::coordination::partition::IndexRange;
use crate::io::ObjectUri;
use crate::schema::Row;

/// One scatter/gather node: a contiguous slice of an experiment's spec table
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodePayload {
    pub specs_uri: ObjectUri,
    pub range: IndexRange,
    pub depth: u32,
    pub task_name: String,
    pub fanout: FanoutConfig,
    /// Unset on the root; the root fills it in from its own run id
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub root_workflow_run_id: Option<String>,
}

/// One leaf experiment: a single input row
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LeafPayload {
    pub task_name: String,
    pub record: Row,
    /// Where output files of this leaf are uploaded
    pub artifact_prefix: ObjectUri,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TaskPayload {
    Node(NodePayload),
    Leaf(LeafPayload),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskKind {
    Node,
    Leaf,
}

impl TaskPayload {
    pub fn kind(&self) -> TaskKind {
        match self {
            TaskPayload::Node(_) => TaskKind::Node,
            TaskPayload::Leaf(_) => TaskKind::Leaf,
        }
    }
}

/// Table name to the URI of the fully written table
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThinPayload {
    pub tables: BTreeMap<String, ObjectUri>,
}

/// The result of one leaf
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LeafOutcome {
    pub sort_index: u64,
    pub workflow_run_id: String,
    /// The input row as executed, system fields included
    pub index: Row,
    pub scalars: Row,
    pub file_refs: Row,
    #[serde(default)]
    pub tables: BTreeMap<String, Vec<Row>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TaskOutput {
    Node(ThinPayload),
    Leaf(LeafOutcome),
}

impl TaskOutput {
    pub fn into_thin(self) -> Option<ThinPayload> {
        match self {
            TaskOutput::Node(thin) => Some(thin),
            TaskOutput::Leaf(_) => None,
        }
    }

    pub fn into_leaf(self) -> Option<LeafOutcome> {
        match self {
            TaskOutput::Leaf(outcome) => Some(outcome),
            TaskOutput::Node(_) => None,
        }
    }
}
