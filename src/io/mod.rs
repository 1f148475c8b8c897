//! Object storage and artifact transfer

pub mod artifacts;
pub mod object_store;
pub mod s3_store;
pub mod uri;

pub use artifacts::ArtifactStore;
pub use object_store::{LocalObjectStore, ObjectStore};
pub use s3_store::S3ObjectStore;
pub use uri::{FileReference, ObjectUri};
