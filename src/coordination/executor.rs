use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result, anyhow};
use tempfile::TempDir;
use tracing::{debug, info};

use crate::error::SweepError;
use crate::io::{ArtifactStore, FileReference, ObjectUri};
use crate::queue::{LeafOutcome, LeafPayload, TaskContext};
use crate::registry::ExperimentRegistry;
use crate::schema::{FieldValue, InputRecord, OutputRecord, RecordSchema, ValidationError};

/// Runs one experiment on one input record
///
/// Steps:
/// 1. Look up the experiment and validate the record against its input schema
/// 2. Download remote file references through the shared artifact cache
/// 3. Run the compute function on a blocking thread inside a fresh working directory
/// 4. Validate the returned values against the output schema
/// 5. Upload output files written to the working directory
pub struct LeafExecutor {
    registry: Arc<ExperimentRegistry>,
    artifacts: Arc<ArtifactStore>,
}

impl LeafExecutor {
    pub fn new(registry: Arc<ExperimentRegistry>, artifacts: Arc<ArtifactStore>) -> Self {
        Self {
            registry,
            artifacts,
        }
    }

    pub async fn execute(&self, payload: LeafPayload, ctx: &TaskContext) -> Result<LeafOutcome> {
        let started = Instant::now();
        let entry = self.registry.lookup(&payload.task_name)?;

        let mut input = InputRecord::from_row(&entry.input_schema, &payload.record)
            .map_err(SweepError::from)?;
        input.workflow_run_id = Some(ctx.run_id.clone());

        debug!(
            "Running {} sort_index {} (attempt {})",
            input.experiment_id, input.sort_index, ctx.attempt
        );

        let references: Vec<(String, FileReference)> = input
            .file_refs()
            .map(|(name, reference)| (name.to_string(), reference.clone()))
            .collect();
        for (name, reference) in references {
            if reference.is_local() {
                return Err(SweepError::from(ValidationError::single(
                    entry.input_schema.name(),
                    name,
                    "local paths cannot be resolved on a worker",
                ))
                .into());
            }
            let path = self
                .artifacts
                .fetch(&reference)
                .await
                .with_context(|| format!("Failed to fetch input artifact {} for field {}", reference, name))?;
            input.set_local_file(&name, path);
        }

        let workdir = TempDir::new().context("Failed to create experiment working directory")?;
        let work_path = workdir.path().to_path_buf();

        // The blocking task owns the directory, so an abandoned attempt never
        // loses it while the experiment is still running
        let experiment = entry.experiment.clone();
        let run_input = input.clone();
        let (_workdir, result) = tokio::task::spawn_blocking(move || {
            let result = experiment.run(&run_input, workdir.path());
            (workdir, result)
        })
        .await
        .map_err(|e| anyhow!("Experiment panicked: {}", e))?;
        let values = result.with_context(|| {
            format!(
                "Experiment {} failed on sort_index {}",
                payload.task_name, input.sort_index
            )
        })?;

        let mut output = entry
            .output_schema
            .validate_output(values)
            .map_err(SweepError::from)?;

        self.publish_output_files(&mut output, &entry.output_schema, &work_path, &payload.artifact_prefix)
            .await?;

        let outcome = LeafOutcome {
            sort_index: input.sort_index,
            workflow_run_id: ctx.run_id.clone(),
            index: input.to_row(),
            scalars: output.scalars(&entry.output_schema),
            file_refs: output.file_refs(&entry.output_schema),
            tables: output.tables,
        };

        info!(
            "Completed {} sort_index {} in {}ms",
            input.experiment_id,
            input.sort_index,
            started.elapsed().as_millis()
        );
        Ok(outcome)
    }

    /// Replace local output paths with the URIs they were uploaded to
    async fn publish_output_files(
        &self,
        output: &mut OutputRecord,
        schema: &RecordSchema,
        workdir: &Path,
        artifact_prefix: &ObjectUri,
    ) -> Result<()> {
        let local_outputs: Vec<(String, PathBuf)> = schema
            .file_ref_fields()
            .filter_map(|field| match output.fields.get(&field.name) {
                Some(FieldValue::FileRef(FileReference::LocalPath(path))) => {
                    Some((field.name.clone(), path.clone()))
                }
                _ => None,
            })
            .collect();

        for (name, path) in local_outputs {
            let resolved = resolve_in_workdir(workdir, &path).map_err(|message| {
                SweepError::from(ValidationError::single(schema.name(), &name, message))
            })?;
            let uri = self
                .artifacts
                .upload(&resolved, &artifact_prefix.join(&name))
                .await
                .with_context(|| format!("Failed to upload output file for field {}", name))?;
            output
                .fields
                .set(&name, FieldValue::FileRef(FileReference::ObjectUri(uri)));
        }
        Ok(())
    }
}

/// Resolve an output path, which must name an existing file inside the working directory
fn resolve_in_workdir(workdir: &Path, path: &Path) -> std::result::Result<PathBuf, String> {
    let joined = if path.is_absolute() {
        path.to_path_buf()
    } else {
        workdir.join(path)
    };

    let root = workdir
        .canonicalize()
        .map_err(|e| format!("working directory is unavailable: {e}"))?;
    let resolved = joined
        .canonicalize()
        .map_err(|_| format!("output file {} does not exist", path.display()))?;

    if !resolved.starts_with(&root) {
        return Err(format!(
            "output file {} is outside the working directory",
            path.display()
        ));
    }
    if !resolved.is_file() {
        return Err(format!("output path {} is not a file", path.display()));
    }
    Ok(resolved)
}
