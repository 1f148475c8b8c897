use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result, anyhow};
use chrono::Utc;
use derive_builder::Builder;
use tokio::task::JoinSet;
use tracing::{debug, info};

use super::layout::ExperimentLayout;
use super::manifest::{InputArtifacts, IoSpecDocument, RunManifest, read_yaml, write_yaml};
use super::version::{SemVer, VersionMode, discover_versions};
use crate::config::{FanoutConfig, UPLOAD_CONCURRENCY};
use crate::coordination::partition::IndexRange;
use crate::error::SweepError;
use crate::io::{ArtifactStore, FileReference, ObjectUri};
use crate::queue::{IdempotencyKey, NodePayload, TaskHandle, TaskPayload, TaskQueue};
use crate::registry::{ExperimentRegistry, RegisteredExperiment};
use crate::schema::record::SYSTEM_FIELDS;
use crate::schema::{
    FieldValue, FieldViolation, InputRecord, Record, Row, SCALARS_TABLE, ValidationError,
};
use crate::table::Table;

/// Format of the timestamp path segment (UTC, millisecond precision)
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d_%H-%M-%S-%3f";

/// What to allocate
#[derive(Debug, Clone, Builder)]
#[builder(setter(into))]
pub struct AllocationRequest {
    /// Registered task that runs every record
    pub task_name: String,
    /// Experiment name in the storage layout; defaults to the task name
    #[builder(default, setter(strip_option))]
    pub experiment_name: Option<String>,
    /// Input rows without system fields, in sort order
    pub records: Vec<Row>,
    #[builder(default)]
    pub version: VersionMode,
    #[builder(default)]
    pub fanout: FanoutConfig,
}

/// A persisted, immutable experiment run
#[derive(Debug, Clone, PartialEq)]
pub struct ExperimentRun {
    pub experiment_id: String,
    pub name: String,
    pub version: SemVer,
    pub timestamp: String,
    pub record_count: u64,
    pub layout: ExperimentLayout,
    pub manifest_uri: ObjectUri,
    pub io_spec_uri: ObjectUri,
    pub input_artifacts_uri: ObjectUri,
    pub specs_uri: ObjectUri,
}

impl ExperimentRun {
    /// Re-open a run from its manifest
    pub async fn open(artifacts: &ArtifactStore, layout: ExperimentLayout) -> Result<(Self, RunManifest)> {
        let manifest: RunManifest = read_yaml(artifacts, &layout.manifest()).await?;
        let run = Self {
            experiment_id: manifest.experiment_id.clone(),
            name: manifest.name.clone(),
            version: manifest.version,
            timestamp: manifest.timestamp.clone(),
            record_count: manifest.record_count,
            manifest_uri: layout.manifest(),
            io_spec_uri: manifest.io_spec_uri.clone(),
            input_artifacts_uri: manifest.input_artifacts_uri.clone(),
            specs_uri: manifest.specs_uri.clone(),
            layout,
        };
        Ok((run, manifest))
    }
}

/// An allocated run and the handle of its root node
#[derive(Debug, Clone)]
pub struct Allocation {
    pub run: ExperimentRun,
    pub root: TaskHandle,
}

/// Tables of a finished run, read back from `final/`
#[derive(Debug, Clone)]
pub struct FinalResults {
    pub tables: BTreeMap<String, Table>,
}

impl FinalResults {
    /// Load every table under the run's `final/` directory
    pub async fn load(artifacts: &ArtifactStore, layout: &ExperimentLayout) -> Result<Self> {
        let final_dir = layout.final_dir();
        let mut tables = BTreeMap::new();
        for uri in artifacts.list(&final_dir).await? {
            let Some(name) = uri
                .strip_prefix(&final_dir)
                .and_then(|relative| relative.strip_suffix(".pq"))
                .map(str::to_string)
            else {
                continue;
            };
            let data = artifacts.get_bytes(&uri).await?;
            let table = Table::from_parquet(data).with_context(|| format!("Failed to decode {}", uri))?;
            tables.insert(name, table);
        }

        if !tables.contains_key(SCALARS_TABLE) {
            return Err(anyhow!("{} has no final results", layout.root()));
        }
        Ok(Self { tables })
    }

    pub fn scalars(&self) -> &Table {
        &self.tables[SCALARS_TABLE]
    }

    pub fn table(&self, name: &str) -> Option<&Table> {
        self.tables.get(name)
    }
}

/// Turns input rows into persisted experiment runs and submits their root node
pub struct Allocator {
    artifacts: Arc<ArtifactStore>,
    queue: Arc<dyn TaskQueue>,
    registry: Arc<ExperimentRegistry>,
    storage_root: ObjectUri,
}

impl Allocator {
    pub fn new(
        artifacts: Arc<ArtifactStore>,
        queue: Arc<dyn TaskQueue>,
        registry: Arc<ExperimentRegistry>,
        storage_root: ObjectUri,
    ) -> Self {
        Self {
            artifacts,
            queue,
            registry,
            storage_root,
        }
    }

    /// Allocate an experiment run
    ///
    /// This method orchestrates the allocation process:
    /// 1. Validate every record against the task's input schema
    /// 2. Collect local input files, deduplicated by file identity
    /// 3. Resolve the version and create the run directory
    /// 4. Upload the unique input files and rewrite their references
    /// 5. Write the spec table, schema document, artifact map and manifest
    /// 6. Submit the root scatter/gather node over `[0, N)`
    pub async fn allocate(&self, request: AllocationRequest) -> Result<Allocation> {
        request.fanout.validate()?;
        let entry = self.registry.lookup(&request.task_name)?;
        let name = request
            .experiment_name
            .clone()
            .unwrap_or_else(|| request.task_name.clone());
        if name.trim_matches('/').is_empty() {
            return Err(SweepError::InvalidConfig("experiment name must not be empty".to_string()).into());
        }

        // 1. Validate
        let mut records = validate_records(&entry, &request.records)?;
        let record_count = records.len() as u64;
        info!(
            "Allocating {} records of {} for experiment {}",
            record_count, request.task_name, name
        );

        // 2. Collect local files
        let local_files = collect_local_files(&entry, &records).await?;

        // 3. Resolve version and run directory
        let experiment_root = self.storage_root.join(&name);
        let existing = discover_versions(&self.artifacts, &experiment_root).await?;
        let version = request.version.resolve(&existing);
        let timestamp = Utc::now().format(TIMESTAMP_FORMAT).to_string();
        let experiment_id = format!("{}/{}/{}", name.trim_matches('/'), version, timestamp);
        let layout = ExperimentLayout::new(&self.storage_root, &experiment_id);

        if self.artifacts.exists(&layout.manifest()).await? {
            return Err(SweepError::ExperimentExists { experiment_id }.into());
        }

        // 4. Upload input files
        let uploaded = self.upload_local_files(&layout, local_files).await?;
        let input_artifacts = input_artifacts_by_field(&uploaded);
        for record in &mut records {
            rewrite_local_refs(record, &uploaded)?;
        }

        // 5. Persist run documents
        let rows: Vec<Row> = records
            .into_iter()
            .enumerate()
            .map(|(sort_index, fields)| {
                InputRecord::new(experiment_id.clone(), sort_index as u64, fields).to_row()
            })
            .collect();
        let specs = Table::from_rows(&rows)?;
        self.artifacts
            .put_bytes(&layout.specs(), specs.to_parquet()?)
            .await
            .context("Failed to write spec table")?;

        let io_spec = IoSpecDocument {
            task_name: request.task_name.clone(),
            input: entry.input_schema.document(),
            output: entry.output_schema.document(),
        };
        write_yaml(&self.artifacts, &layout.io_spec(), &io_spec).await?;
        write_yaml(&self.artifacts, &layout.input_artifacts(), &input_artifacts).await?;

        let range = IndexRange::new(0, record_count)?;
        let root_key = IdempotencyKey::for_node(&layout.specs(), range, 0);
        let manifest = RunManifest {
            experiment_id: experiment_id.clone(),
            name: name.clone(),
            version,
            timestamp: timestamp.clone(),
            task_name: request.task_name.clone(),
            created_at: Utc::now().to_rfc3339(),
            record_count,
            fanout: request.fanout,
            root_key: root_key.to_string(),
            specs_uri: layout.specs(),
            io_spec_uri: layout.io_spec(),
            input_artifacts_uri: layout.input_artifacts(),
            artifacts: uploaded.values().cloned().collect(),
        };
        write_yaml(&self.artifacts, &layout.manifest(), &manifest).await?;
        info!("Manifest written for experiment: {}", experiment_id);

        // 6. Submit the root node
        let root_payload = NodePayload {
            specs_uri: layout.specs(),
            range,
            depth: 0,
            task_name: request.task_name.clone(),
            fanout: request.fanout,
            root_workflow_run_id: None,
        };
        let root = self
            .queue
            .submit(TaskPayload::Node(root_payload), root_key)
            .await
            .context("Failed to submit root node")?;

        let run = ExperimentRun {
            experiment_id,
            name,
            version,
            timestamp,
            record_count,
            manifest_uri: layout.manifest(),
            io_spec_uri: layout.io_spec(),
            input_artifacts_uri: layout.input_artifacts(),
            specs_uri: layout.specs(),
            layout,
        };
        Ok(Allocation { run, root })
    }

    /// Wait for the root node and copy its tables into `final/`
    ///
    /// Nothing is written unless the root succeeded and its scalars table
    /// holds exactly one row per record. The scalars table is written last.
    pub async fn finalize(&self, allocation: &Allocation) -> Result<BTreeMap<String, ObjectUri>> {
        let run = &allocation.run;
        let output = allocation
            .root
            .result()
            .await
            .with_context(|| format!("Experiment {} failed", run.experiment_id))?;
        let thin = output
            .into_thin()
            .context("Root task returned a leaf result")?;

        let scalars_uri = thin
            .tables
            .get(SCALARS_TABLE)
            .with_context(|| format!("Root of {} produced no scalars table", run.experiment_id))?;
        let scalars = self.artifacts.get_bytes(scalars_uri).await?;
        let rows = Table::from_parquet(scalars.clone())?.num_rows() as u64;
        if rows != run.record_count {
            return Err(SweepError::PartitionInvariant(format!(
                "{} has {} result rows for {} records",
                run.experiment_id, rows, run.record_count
            ))
            .into());
        }

        let mut finals = BTreeMap::new();
        for (name, uri) in thin.tables.iter().filter(|(name, _)| name.as_str() != SCALARS_TABLE) {
            let body = self.artifacts.get_bytes(uri).await?;
            let destination = run.layout.final_table(name);
            self.artifacts
                .put_bytes(&destination, body)
                .await
                .with_context(|| format!("Failed to finalize table {}", name))?;
            finals.insert(name.clone(), destination);
        }

        let destination = run.layout.final_table(SCALARS_TABLE);
        self.artifacts
            .put_bytes(&destination, scalars)
            .await
            .context("Failed to finalize scalars table")?;
        finals.insert(SCALARS_TABLE.to_string(), destination);

        info!(
            "Experiment {} finalized with {} table(s)",
            run.experiment_id,
            finals.len()
        );
        Ok(finals)
    }

    /// Upload each unique local file once, with bounded concurrency
    async fn upload_local_files(
        &self,
        layout: &ExperimentLayout,
        files: Vec<(String, PathBuf)>,
    ) -> Result<BTreeMap<(String, PathBuf), ObjectUri>> {
        let mut join_set: JoinSet<Result<((String, PathBuf), ObjectUri)>> = JoinSet::new();
        let mut uploaded = BTreeMap::new();

        for (field, path) in files {
            // Wait if we've reached concurrency limit
            while join_set.len() >= UPLOAD_CONCURRENCY {
                if let Some(result) = join_set.join_next().await {
                    let (key, uri) = result.map_err(|e| anyhow!("Task panicked: {}", e))??;
                    uploaded.insert(key, uri);
                }
            }

            let artifacts = Arc::clone(&self.artifacts);
            let prefix = layout.artifacts(&field);
            join_set.spawn(async move {
                let uri = artifacts
                    .upload(&path, &prefix)
                    .await
                    .with_context(|| format!("Failed to upload input artifact {}", path.display()))?;
                Ok(((field, path), uri))
            });
        }

        while let Some(result) = join_set.join_next().await {
            let (key, uri) = result.map_err(|e| anyhow!("Task panicked: {}", e))??;
            uploaded.insert(key, uri);
        }

        debug!("Uploaded {} unique input artifact(s)", uploaded.len());
        Ok(uploaded)
    }
}

/// Distinct uploaded URIs per field, sorted
fn input_artifacts_by_field(uploaded: &BTreeMap<(String, PathBuf), ObjectUri>) -> InputArtifacts {
    let mut by_field: BTreeMap<String, BTreeSet<ObjectUri>> = BTreeMap::new();
    for ((field, _), uri) in uploaded {
        by_field.entry(field.clone()).or_default().insert(uri.clone());
    }
    by_field
        .into_iter()
        .map(|(field, uris)| (field, uris.into_iter().collect()))
        .collect()
}

/// Validate every row, reporting all violations of all rows together
fn validate_records(entry: &RegisteredExperiment, rows: &[Row]) -> Result<Vec<Record>> {
    let schema = &entry.input_schema;
    if rows.is_empty() {
        return Err(SweepError::from(ValidationError::single(
            schema.name(),
            "records",
            "at least one record is required",
        ))
        .into());
    }

    let mut records = Vec::with_capacity(rows.len());
    let mut violations = Vec::new();
    for (position, row) in rows.iter().enumerate() {
        for system in SYSTEM_FIELDS {
            if row.contains_key(system) {
                violations.push(FieldViolation {
                    row: Some(position),
                    field: system.to_string(),
                    message: "system fields are assigned at allocation".to_string(),
                });
            }
        }
        let mut user_row = row.clone();
        for system in SYSTEM_FIELDS {
            user_row.remove(system);
        }
        match schema.validate(&user_row) {
            Ok(record) => records.push(record),
            Err(e) => violations.extend(e.at_row(position).violations),
        }
    }

    if !violations.is_empty() {
        return Err(SweepError::from(ValidationError::new(schema.name(), violations)).into());
    }
    Ok(records)
}

/// Canonical local files per field, failing on name collisions within a field
async fn collect_local_files(
    entry: &RegisteredExperiment,
    records: &[Record],
) -> Result<Vec<(String, PathBuf)>> {
    let mut by_name: BTreeMap<(String, String), Vec<PathBuf>> = BTreeMap::new();
    let mut violations = Vec::new();

    for (position, record) in records.iter().enumerate() {
        for field in entry.input_schema.file_ref_fields() {
            let Some(FieldValue::FileRef(FileReference::LocalPath(path))) = record.get(&field.name)
            else {
                continue;
            };
            let canonical = match tokio::fs::canonicalize(path).await {
                Ok(canonical) if canonical.is_file() => canonical,
                _ => {
                    violations.push(FieldViolation {
                        row: Some(position),
                        field: field.name.clone(),
                        message: format!("local file {} does not exist", path.display()),
                    });
                    continue;
                }
            };
            let file_name = canonical
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            let paths = by_name.entry((field.name.clone(), file_name)).or_default();
            if !paths.contains(&canonical) {
                paths.push(canonical);
            }
        }
    }

    if !violations.is_empty() {
        return Err(SweepError::from(ValidationError::new(entry.input_schema.name(), violations)).into());
    }

    let mut files = Vec::with_capacity(by_name.len());
    for ((field, file_name), mut paths) in by_name {
        if paths.len() > 1 {
            paths.sort();
            return Err(SweepError::DuplicateInputArtifacts {
                field,
                file_name,
                paths,
            }
            .into());
        }
        files.extend(paths.into_iter().map(|path| (field.clone(), path)));
    }
    Ok(files)
}

/// Point local file references at their uploaded copies
fn rewrite_local_refs(
    record: &mut Record,
    uploaded: &BTreeMap<(String, PathBuf), ObjectUri>,
) -> Result<()> {
    let local: Vec<(String, PathBuf)> = record
        .iter()
        .filter_map(|(name, value)| match value {
            FieldValue::FileRef(FileReference::LocalPath(path)) => {
                Some((name.to_string(), path.clone()))
            }
            _ => None,
        })
        .collect();

    for (name, path) in local {
        let canonical = std::fs::canonicalize(&path)
            .with_context(|| format!("Input file {} disappeared during allocation", path.display()))?;
        let uri = uploaded
            .get(&(name.clone(), canonical))
            .with_context(|| format!("Input file {} was not uploaded", path.display()))?;
        record.set(&name, FieldValue::FileRef(FileReference::ObjectUri(uri.clone())));
    }
    Ok(())
}
