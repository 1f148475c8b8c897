//! Error taxonomy for sweeps.
//!
//! Components propagate `anyhow::Error` with context, like the rest of the
//! crate. The variants below are the failures callers (and the task queue)
//! need to tell apart: whether a failure is worth retrying is decided by
//! looking for a `SweepError` in the error chain.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::schema::ValidationError;

#[derive(Debug, Error)]
pub enum SweepError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("no experiment registered under task name '{name}'")]
    UnknownTask { name: String },

    #[error("an experiment is already registered under task name '{name}'")]
    DuplicateRegistration { name: String },

    #[error("invalid schema: {0}")]
    InvalidSchema(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("artifact transfer failed for {uri}: {reason}")]
    ArtifactTransfer { uri: String, reason: String },

    #[error("partition invariant violated: {0}")]
    PartitionInvariant(String),

    #[error(
        "field '{field}' references {} different files named '{file_name}': {paths:?}",
        .paths.len()
    )]
    DuplicateInputArtifacts {
        field: String,
        file_name: String,
        paths: Vec<PathBuf>,
    },

    #[error("experiment {experiment_id} already exists")]
    ExperimentExists { experiment_id: String },

    #[error("payload of {size} bytes exceeds the {limit} byte limit")]
    PayloadTooLarge { size: usize, limit: usize },

    #[error("{scope}: {} task(s) failed: {}", .failures.len(), .failures.join("; "))]
    ChildFailed { scope: String, failures: Vec<String> },

    #[error("task exceeded its execution timeout of {0:?}")]
    TaskTimeout(Duration),
}

impl SweepError {
    /// Transient failures that may succeed on another attempt
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SweepError::ArtifactTransfer { .. } | SweepError::TaskTimeout(_)
        )
    }

    pub fn artifact_transfer(uri: impl ToString, err: impl std::fmt::Display) -> Self {
        SweepError::ArtifactTransfer {
            uri: uri.to_string(),
            reason: format!("{err:#}"),
        }
    }
}

/// Classify an arbitrary error for retry purposes.
///
/// Errors that carry no `SweepError` come from user compute functions and are
/// treated as transient.
pub fn is_retryable(err: &anyhow::Error) -> bool {
    err.chain()
        .find_map(|cause| {
            if let Some(sweep) = cause.downcast_ref::<SweepError>() {
                Some(sweep.is_retryable())
            } else if cause.downcast_ref::<ValidationError>().is_some() {
                Some(false)
            } else {
                None
            }
        })
        .unwrap_or(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Context;

    #[test]
    fn test_user_errors_are_retryable() {
        let err = anyhow::anyhow!("simulation diverged");
        assert!(is_retryable(&err));
    }

    #[test]
    fn test_fatal_variants_survive_context() {
        let err: anyhow::Error = SweepError::UnknownTask {
            name: "missing".to_string(),
        }
        .into();
        let err = err.context("Failed to run leaf");
        assert!(!is_retryable(&err));
    }

    #[test]
    fn test_transfer_failures_are_retryable() {
        let result: Result<(), SweepError> = Err(SweepError::artifact_transfer(
            "s3://bucket/key",
            "connection reset",
        ));
        let err = result.context("Failed to upload").unwrap_err();
        assert!(is_retryable(&err));
        assert!(format!("{err:#}").contains("connection reset"));
    }

    #[test]
    fn test_child_failed_message_lists_failures() {
        let err = SweepError::ChildFailed {
            scope: "node [0, 10)".to_string(),
            failures: vec!["leaf 3: boom".to_string(), "leaf 7: bang".to_string()],
        };
        let message = err.to_string();
        assert!(message.contains("2 task(s) failed"));
        assert!(message.contains("leaf 3: boom; leaf 7: bang"));
        assert!(!err.is_retryable());
    }
}
