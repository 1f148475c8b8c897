//! Allocation of experiment runs: versioned storage layout, persisted run
//! documents and submission of the root scatter/gather node

pub mod allocator;
pub mod layout;
pub mod manifest;
pub mod version;

pub use allocator::{
    Allocation, AllocationRequest, AllocationRequestBuilder, Allocator, ExperimentRun,
    FinalResults,
};
pub use layout::ExperimentLayout;
pub use manifest::{InputArtifacts, IoSpecDocument, RunManifest};
pub use version::{SemVer, VersionMode};
