//! Recursive scatter/gather engine for experiment sweeps.
//!
//! Register experiments in a [`registry::RegistryBuilder`], then hand input
//! rows to [`runner::LocalSweep`] to fan them out, run every record and gather
//! the sorted result tables.

// Public API - the runner plus the types it exchanges
pub mod allocation;
pub mod config;
pub mod error;
pub mod registry;
pub mod runner;
pub mod schema;
pub mod table;

// Execution machinery - public for embedding in an external queue
pub mod coordination;
pub mod io;
pub mod queue;
pub mod telemetry;

pub use error::SweepError;
pub use runner::{LocalSweep, SweepConfig, SweepConfigBuilder, SweepResult, init_tracing};
