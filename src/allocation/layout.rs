//! Object layout of one experiment run
//!
//! ```text
//! <prefix>/<name>/<version>/<timestamp>/
//!   manifest.yml
//!   experiment_io_spec.yml
//!   input_artifacts.yml
//!   specs.pq
//!   artifacts/<field>/...
//!   scatter-gather/d<depth>/r<start>-<end>/<table>.pq
//!   scatter-gather/leaves/<sort_index>/<field>/...
//!   final/<table>.pq
//! ```

use anyhow::{Context, Result};

use crate::coordination::partition::IndexRange;
use crate::io::ObjectUri;

pub const MANIFEST_FILE: &str = "manifest.yml";
pub const IO_SPEC_FILE: &str = "experiment_io_spec.yml";
pub const INPUT_ARTIFACTS_FILE: &str = "input_artifacts.yml";
pub const SPECS_FILE: &str = "specs.pq";

const ARTIFACTS_DIR: &str = "artifacts";
const SCATTER_GATHER_DIR: &str = "scatter-gather";
const LEAVES_DIR: &str = "leaves";
const FINAL_DIR: &str = "final";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExperimentLayout {
    root: ObjectUri,
}

impl ExperimentLayout {
    /// Layout of `experiment_id` (`name/version/timestamp`) under the storage root
    pub fn new(storage_root: &ObjectUri, experiment_id: &str) -> Self {
        Self {
            root: storage_root.join(experiment_id),
        }
    }

    /// Recover the layout from the URI of its spec table
    pub fn from_specs_uri(specs_uri: &ObjectUri) -> Result<Self> {
        let root = specs_uri
            .parent()
            .with_context(|| format!("Spec table {} has no parent directory", specs_uri))?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &ObjectUri {
        &self.root
    }

    pub fn manifest(&self) -> ObjectUri {
        self.root.join(MANIFEST_FILE)
    }

    pub fn io_spec(&self) -> ObjectUri {
        self.root.join(IO_SPEC_FILE)
    }

    pub fn input_artifacts(&self) -> ObjectUri {
        self.root.join(INPUT_ARTIFACTS_FILE)
    }

    pub fn specs(&self) -> ObjectUri {
        self.root.join(SPECS_FILE)
    }

    /// Prefix for the uploaded input files of one field
    pub fn artifacts(&self, field: &str) -> ObjectUri {
        self.root.join(ARTIFACTS_DIR).join(field)
    }

    /// Namespace of one scatter/gather node
    pub fn node_dir(&self, depth: u32, range: IndexRange) -> ObjectUri {
        self.root
            .join(SCATTER_GATHER_DIR)
            .join(format!("d{}", depth))
            .join(format!("r{}-{}", range.start, range.end))
    }

    pub fn node_table(&self, depth: u32, range: IndexRange, table: &str) -> ObjectUri {
        self.node_dir(depth, range).join(format!("{}.pq", table))
    }

    /// Prefix for the output files of one leaf
    pub fn leaf_prefix(&self, sort_index: u64) -> ObjectUri {
        self.root
            .join(SCATTER_GATHER_DIR)
            .join(LEAVES_DIR)
            .join(sort_index.to_string())
    }

    pub fn final_dir(&self) -> ObjectUri {
        self.root.join(FINAL_DIR)
    }

    pub fn final_table(&self, table: &str) -> ObjectUri {
        self.final_dir().join(format!("{}.pq", table))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_paths() {
        let layout = ExperimentLayout::new(
            &ObjectUri::new("bucket", "sweep"),
            "task/v1.0.0/2024-01-02_03-04-05-006",
        );
        let root = "s3://bucket/sweep/task/v1.0.0/2024-01-02_03-04-05-006";
        assert_eq!(layout.root().to_string(), root);
        assert_eq!(layout.specs().to_string(), format!("{root}/specs.pq"));
        assert_eq!(
            layout.artifacts("weather").to_string(),
            format!("{root}/artifacts/weather")
        );
        assert_eq!(
            layout
                .node_table(1, IndexRange { start: 5, end: 10 }, "scalars")
                .to_string(),
            format!("{root}/scatter-gather/d1/r5-10/scalars.pq")
        );
        assert_eq!(
            layout.leaf_prefix(7).to_string(),
            format!("{root}/scatter-gather/leaves/7")
        );
        assert_eq!(
            layout.final_table("result_file_refs").to_string(),
            format!("{root}/final/result_file_refs.pq")
        );
    }

    #[test]
    fn test_from_specs_uri() {
        let layout = ExperimentLayout::new(&ObjectUri::new("bucket", ""), "task/v2.0.0/ts");
        let recovered = ExperimentLayout::from_specs_uri(&layout.specs()).unwrap();
        assert_eq!(recovered, layout);
    }
}
