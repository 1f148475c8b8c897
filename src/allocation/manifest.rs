//! YAML documents persisted with every experiment run

use std::collections::BTreeMap;

use anyhow::{Context, Result};
use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use super::version::SemVer;
use crate::config::FanoutConfig;
use crate::io::{ArtifactStore, ObjectUri};
use crate::schema::SchemaDocument;

/// Top-level description of an allocated run (`manifest.yml`)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunManifest {
    pub experiment_id: String,
    pub name: String,
    pub version: SemVer,
    pub timestamp: String,
    pub task_name: String,
    pub created_at: String,
    pub record_count: u64,
    pub fanout: FanoutConfig,
    /// Idempotency key of the root scatter/gather node
    pub root_key: String,
    pub specs_uri: ObjectUri,
    pub io_spec_uri: ObjectUri,
    pub input_artifacts_uri: ObjectUri,
    #[serde(default)]
    pub artifacts: Vec<ObjectUri>,
}

/// Input and output schemas of the experiment (`experiment_io_spec.yml`)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IoSpecDocument {
    pub task_name: String,
    pub input: SchemaDocument,
    pub output: SchemaDocument,
}

/// Uploaded input files (`input_artifacts.yml`): field name to its distinct URIs, sorted
pub type InputArtifacts = BTreeMap<String, Vec<ObjectUri>>;

pub async fn write_yaml<T: Serialize>(artifacts: &ArtifactStore, uri: &ObjectUri, document: &T) -> Result<()> {
    let yaml = serde_yaml::to_string(document).with_context(|| format!("Failed to serialize {}", uri))?;
    artifacts
        .put_bytes(uri, Bytes::from(yaml))
        .await
        .with_context(|| format!("Failed to write {}", uri))?;
    Ok(())
}

pub async fn read_yaml<T: DeserializeOwned>(artifacts: &ArtifactStore, uri: &ObjectUri) -> Result<T> {
    let body = artifacts
        .get_bytes(uri)
        .await
        .with_context(|| format!("Failed to read {}", uri))?;
    serde_yaml::from_slice(&body).with_context(|| format!("Failed to parse {}", uri))
}
