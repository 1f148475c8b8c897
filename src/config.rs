//! Configuration constants and settings for sweeps
//!
//! This module centralizes the tunable parameters used throughout the crate,
//! plus the settings structs that are read from the environment at startup.

use std::time::Duration;

use derive_builder::Builder;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::SweepError;
use crate::io::ObjectUri;

// ============================================================================
// Fan-out Configuration
// ============================================================================

/// Ranges at or below this many records are executed directly as leaves
pub const DEFAULT_LEAF_BATCH_SIZE: usize = 100;

/// Number of children a recursive node splits its range into
pub const DEFAULT_BRANCHING_FACTOR: usize = 100;

/// Depth at which a node executes its range directly regardless of size
///
/// With the default batch size and branching factor, three levels cover a
/// million records while no node submits more than a hundred tasks.
pub const DEFAULT_MAX_DEPTH: u32 = 3;

// ============================================================================
// Queue Configuration
// ============================================================================

/// Attempts per task, including the first one
pub const MAX_ATTEMPTS: u32 = 3;

/// Base delay of the exponential retry backoff
pub const RETRY_BASE_DELAY: Duration = Duration::from_millis(100);

/// Execution timeout for a single scatter/gather node attempt
///
/// Covers the whole subtree below the node, so it is generous.
pub const SCATTER_GATHER_EXECUTION_TIMEOUT: Duration = Duration::from_secs(3600); // 1 hour

/// Execution timeout for a single leaf experiment attempt
pub const EXPERIMENT_EXECUTION_TIMEOUT: Duration = Duration::from_secs(60);

/// Largest serialized task payload or result the queue accepts
///
/// Matches the 4 MB message limit common to gRPC-based task engines.
pub const MAX_PAYLOAD_BYTES: usize = 4 * 1024 * 1024; // 4 MB

/// Node slots per worker; nodes mostly wait on children
pub const DEFAULT_DURABLE_SLOTS: usize = 1000;

// ============================================================================
// Transfer Configuration
// ============================================================================

/// Concurrent child-table fetches during a merge
pub const MERGE_CONCURRENCY: usize = 8;

/// Concurrent artifact uploads during allocation
pub const UPLOAD_CONCURRENCY: usize = 8;

/// Timeout for fetching an artifact over HTTP
pub const HTTP_FETCH_TIMEOUT: Duration = Duration::from_secs(60);

// ============================================================================
// Environment
// ============================================================================

pub const STORAGE_BUCKET_ENV: &str = "SWEEP_STORAGE_BUCKET";
pub const STORAGE_BUCKET_PREFIX_ENV: &str = "SWEEP_STORAGE_BUCKET_PREFIX";
pub const DEFAULT_BUCKET_PREFIX: &str = "sweep";

pub const WORKER_NAME_ENV: &str = "SWEEP_WORKER_NAME";
pub const WORKER_SLOTS_ENV: &str = "SWEEP_WORKER_SLOTS";
pub const WORKER_DURABLE_SLOTS_ENV: &str = "SWEEP_WORKER_DURABLE_SLOTS";

pub const EXPERIMENT_TIMEOUT_ENV: &str = "SWEEP_TIMEOUT_EXPERIMENT_EXECUTION";
pub const SCATTER_GATHER_TIMEOUT_ENV: &str = "SWEEP_TIMEOUT_SCATTER_GATHER_EXECUTION";

/// Parameters that shape the scatter/gather tree
///
/// Carried inside every node payload so all nodes of one tree decide with the
/// same values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Builder)]
#[builder(build_fn(validate = "Self::validate"))]
pub struct FanoutConfig {
    #[builder(default = "DEFAULT_LEAF_BATCH_SIZE")]
    pub leaf_batch_size: usize,
    #[builder(default = "DEFAULT_BRANCHING_FACTOR")]
    pub branching_factor: usize,
    #[builder(default = "DEFAULT_MAX_DEPTH")]
    pub max_depth: u32,
}

impl FanoutConfigBuilder {
    fn validate(&self) -> Result<(), String> {
        check_fanout(
            self.leaf_batch_size.unwrap_or(DEFAULT_LEAF_BATCH_SIZE),
            self.branching_factor.unwrap_or(DEFAULT_BRANCHING_FACTOR),
        )
    }
}

fn check_fanout(leaf_batch_size: usize, branching_factor: usize) -> Result<(), String> {
    if leaf_batch_size == 0 {
        return Err("leaf_batch_size must be at least 1".to_string());
    }
    if branching_factor < 2 {
        return Err(format!(
            "branching_factor must be at least 2, got {branching_factor}"
        ));
    }
    Ok(())
}

impl FanoutConfig {
    pub fn validate(&self) -> Result<(), SweepError> {
        check_fanout(self.leaf_batch_size, self.branching_factor).map_err(SweepError::InvalidConfig)
    }
}

impl Default for FanoutConfig {
    fn default() -> Self {
        Self {
            leaf_batch_size: DEFAULT_LEAF_BATCH_SIZE,
            branching_factor: DEFAULT_BRANCHING_FACTOR,
            max_depth: DEFAULT_MAX_DEPTH,
        }
    }
}

/// Retry, timeout and size policy of the task queue
#[derive(Debug, Clone, Builder)]
pub struct QueueConfig {
    #[builder(default = "MAX_ATTEMPTS")]
    pub max_attempts: u32,
    #[builder(default = "RETRY_BASE_DELAY")]
    pub retry_base_delay: Duration,
    #[builder(default = "EXPERIMENT_EXECUTION_TIMEOUT")]
    pub leaf_timeout: Duration,
    #[builder(default = "SCATTER_GATHER_EXECUTION_TIMEOUT")]
    pub node_timeout: Duration,
    #[builder(default = "MAX_PAYLOAD_BYTES")]
    pub max_payload_bytes: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_attempts: MAX_ATTEMPTS,
            retry_base_delay: RETRY_BASE_DELAY,
            leaf_timeout: EXPERIMENT_EXECUTION_TIMEOUT,
            node_timeout: SCATTER_GATHER_EXECUTION_TIMEOUT,
            max_payload_bytes: MAX_PAYLOAD_BYTES,
        }
    }
}

impl QueueConfig {
    /// Defaults, with execution timeouts (in seconds) overridable from the environment
    pub fn from_env() -> Result<Self, SweepError> {
        let mut config = Self::default();
        if let Some(secs) = env_parse::<u64>(EXPERIMENT_TIMEOUT_ENV)? {
            config.leaf_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = env_parse::<u64>(SCATTER_GATHER_TIMEOUT_ENV)? {
            config.node_timeout = Duration::from_secs(secs);
        }
        Ok(config)
    }

    /// Backoff before the given retry (attempt numbers start at 1)
    pub fn retry_delay(&self, attempt: u32) -> Duration {
        self.retry_base_delay * 2u32.saturating_pow(attempt.saturating_sub(1))
    }
}

/// Where experiments are stored
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageSettings {
    pub bucket: String,
    pub bucket_prefix: String,
}

impl StorageSettings {
    pub fn new(bucket: impl Into<String>, bucket_prefix: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            bucket_prefix: bucket_prefix.into(),
        }
    }

    /// Read settings from the environment; the bucket is required
    pub fn from_env() -> Result<Self, SweepError> {
        let bucket = std::env::var(STORAGE_BUCKET_ENV).map_err(|_| {
            SweepError::InvalidConfig(format!("{STORAGE_BUCKET_ENV} must be set"))
        })?;
        let bucket_prefix = std::env::var(STORAGE_BUCKET_PREFIX_ENV)
            .unwrap_or_else(|_| DEFAULT_BUCKET_PREFIX.to_string());
        Ok(Self::new(bucket, bucket_prefix))
    }

    /// Root under which every experiment name lives
    pub fn root(&self) -> ObjectUri {
        ObjectUri::new(&self.bucket, self.bucket_prefix.trim_matches('/'))
    }
}

/// Identity and capacity of a worker process
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerConfig {
    pub name: String,
    /// Concurrent leaf experiments
    pub slots: usize,
    /// Concurrent scatter/gather nodes
    pub durable_slots: usize,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            name: default_worker_name(|key| std::env::var(key).ok()),
            slots: default_slots(),
            durable_slots: DEFAULT_DURABLE_SLOTS,
        }
    }
}

impl WorkerConfig {
    pub fn from_env() -> Result<Self, SweepError> {
        let mut config = Self::default();
        if let Ok(name) = std::env::var(WORKER_NAME_ENV) {
            config.name = name;
        }
        if let Some(slots) = env_parse::<usize>(WORKER_SLOTS_ENV)? {
            config.slots = slots;
        }
        if let Some(durable_slots) = env_parse::<usize>(WORKER_DURABLE_SLOTS_ENV)? {
            config.durable_slots = durable_slots;
        }
        if config.slots == 0 || config.durable_slots == 0 {
            return Err(SweepError::InvalidConfig(
                "worker slots and durable slots must be at least 1".to_string(),
            ));
        }
        Ok(config)
    }
}

fn default_slots() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

/// Name a worker after the platform hosting it, falling back to a random suffix
fn default_worker_name(lookup: impl Fn(&str) -> Option<String>) -> String {
    if let Some(region) = lookup("FLY_REGION") {
        return format!("SweepWorkerFly{}", region.to_uppercase());
    }
    if let Some(index) = lookup("AWS_BATCH_JOB_ARRAY_INDEX")
        && let Ok(index) = index.parse::<u32>()
    {
        return format!("SweepWorkerAwsBatch{index:04}");
    }
    let id = Uuid::new_v4().simple().to_string();
    format!("SweepWorker-{}", &id[..8])
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Result<Option<T>, SweepError> {
    match std::env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|_| SweepError::InvalidConfig(format!("{key} has invalid value '{raw}'"))),
        Err(_) => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fanout_builder_defaults() {
        let config = FanoutConfigBuilder::default().build().unwrap();
        assert_eq!(config, FanoutConfig::default());
    }

    #[test]
    fn test_fanout_builder_rejects_degenerate_factor() {
        let result = FanoutConfigBuilder::default().branching_factor(1).build();
        assert!(result.is_err());

        let result = FanoutConfigBuilder::default().leaf_batch_size(0).build();
        assert!(result.is_err());
    }

    #[test]
    fn test_fanout_validate() {
        let config = FanoutConfig {
            leaf_batch_size: 5,
            branching_factor: 1,
            max_depth: 2,
        };
        assert!(matches!(
            config.validate(),
            Err(SweepError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_retry_delay_doubles() {
        let config = QueueConfig::default();
        assert_eq!(config.retry_delay(1), Duration::from_millis(100));
        assert_eq!(config.retry_delay(2), Duration::from_millis(200));
        assert_eq!(config.retry_delay(3), Duration::from_millis(400));
    }

    #[test]
    fn test_worker_name_from_fly_region() {
        let name = default_worker_name(|key| (key == "FLY_REGION").then(|| "dfw".to_string()));
        assert_eq!(name, "SweepWorkerFlyDFW");
    }

    #[test]
    fn test_worker_name_from_batch_index() {
        let name = default_worker_name(|key| {
            (key == "AWS_BATCH_JOB_ARRAY_INDEX").then(|| "7".to_string())
        });
        assert_eq!(name, "SweepWorkerAwsBatch0007");
    }

    #[test]
    fn test_worker_name_fallback() {
        let name = default_worker_name(|_| None);
        assert!(name.starts_with("SweepWorker-"));
        assert_eq!(name.len(), "SweepWorker-".len() + 8);
    }

    #[test]
    fn test_storage_root() {
        let settings = StorageSettings::new("bucket", "/sweeps/");
        assert_eq!(settings.root().to_string(), "s3://bucket/sweeps");
    }
}
