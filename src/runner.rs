//! High-level runner API for experiment sweeps.
//!
//! This module wires the object store, artifact cache, registry, task queue and
//! worker together so a caller only supplies registered experiments and input
//! rows. It runs the whole tree in one process on [`LocalQueue`].
//!
//! This is the primary API for external users.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use derive_builder::Builder;
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use tokio::sync::mpsc;
use tracing::info;

use crate::allocation::{Allocation, AllocationRequest, Allocator, ExperimentRun, FinalResults};
use crate::config::{QueueConfig, StorageSettings, WorkerConfig};
use crate::coordination::Worker;
use crate::io::{ArtifactStore, LocalObjectStore, ObjectStore, ObjectUri, S3ObjectStore};
use crate::queue::{LocalQueue, TaskQueue, TaskRunner};
use crate::registry::ExperimentRegistry;
use crate::telemetry::{ProgressStats, TelemetryEvent};

/// Settings of a sweep runner
#[derive(Debug, Clone, Builder)]
#[builder(setter(into))]
pub struct SweepConfig {
    pub storage: StorageSettings,
    #[builder(default)]
    pub queue: QueueConfig,
    #[builder(default)]
    pub worker: WorkerConfig,
    /// Serve the object store from this directory instead of S3
    #[builder(default, setter(strip_option))]
    pub local_store_dir: Option<PathBuf>,
    /// Persistent artifact cache; a temporary directory when unset
    #[builder(default, setter(strip_option))]
    pub cache_dir: Option<PathBuf>,
    #[builder(default)]
    pub quiet: bool,
}

/// Result of a completed sweep
#[derive(Debug)]
pub struct SweepResult {
    pub run: ExperimentRun,
    /// URIs of the tables under `final/`
    pub final_tables: BTreeMap<String, ObjectUri>,
    pub results: FinalResults,
    pub duration: Duration,
    pub stats: ProgressStats,
}

/// Runs experiment sweeps end to end in the current process
pub struct LocalSweep {
    artifacts: Arc<ArtifactStore>,
    queue: LocalQueue,
    allocator: Allocator,
    stats: Arc<Mutex<ProgressStats>>,
    quiet: bool,
    // The queue only holds a weak reference to its runner
    _worker: Arc<dyn TaskRunner>,
}

impl LocalSweep {
    /// Build a runner from explicit settings
    pub async fn new(config: SweepConfig, registry: Arc<ExperimentRegistry>) -> Result<Self> {
        let store: Arc<dyn ObjectStore> = match &config.local_store_dir {
            Some(dir) => Arc::new(LocalObjectStore::new(dir)),
            None => Arc::new(S3ObjectStore::from_env().await),
        };
        Self::with_store(config, registry, store)
    }

    /// Build a runner from `SWEEP_*` environment variables, storing to S3
    pub async fn from_env(registry: Arc<ExperimentRegistry>) -> Result<Self> {
        let config = SweepConfig {
            storage: StorageSettings::from_env()?,
            queue: QueueConfig::from_env()?,
            worker: WorkerConfig::from_env()?,
            local_store_dir: None,
            cache_dir: None,
            quiet: false,
        };
        Self::new(config, registry).await
    }

    /// Build a runner over an existing object store
    pub fn with_store(
        config: SweepConfig,
        registry: Arc<ExperimentRegistry>,
        store: Arc<dyn ObjectStore>,
    ) -> Result<Self> {
        let artifacts = Arc::new(match &config.cache_dir {
            Some(dir) => ArtifactStore::with_cache_dir(store, dir),
            None => ArtifactStore::new(store)?,
        });

        // Telemetry flows from the queue into shared stats until every task is gone
        let (telemetry_tx, mut telemetry_rx) = mpsc::unbounded_channel::<TelemetryEvent>();
        let stats = Arc::new(Mutex::new(ProgressStats::new()));
        let collector_stats = Arc::clone(&stats);
        tokio::spawn(async move {
            while let Some(event) = telemetry_rx.recv().await {
                if let Ok(mut stats) = collector_stats.lock() {
                    stats.update(&event);
                }
            }
        });

        let queue = LocalQueue::with_telemetry(config.queue.clone(), &config.worker, telemetry_tx);
        let queue_client: Arc<dyn TaskQueue> = Arc::new(queue.clone());
        let worker: Arc<dyn TaskRunner> = Arc::new(Worker::new(
            config.worker.clone(),
            Arc::clone(&registry),
            Arc::clone(&artifacts),
            Arc::clone(&queue_client),
        ));
        queue.attach(&worker);

        info!(
            "Worker {} ready with {} slots and {} durable slots",
            config.worker.name, config.worker.slots, config.worker.durable_slots
        );

        let allocator = Allocator::new(
            Arc::clone(&artifacts),
            queue_client,
            registry,
            config.storage.root(),
        );

        Ok(Self {
            artifacts,
            queue,
            allocator,
            stats,
            quiet: config.quiet,
            _worker: worker,
        })
    }

    pub fn artifacts(&self) -> &Arc<ArtifactStore> {
        &self.artifacts
    }

    pub fn queue(&self) -> &LocalQueue {
        &self.queue
    }

    pub fn allocator(&self) -> &Allocator {
        &self.allocator
    }

    /// Snapshot of the queue statistics so far
    pub fn stats(&self) -> ProgressStats {
        self.stats
            .lock()
            .map(|stats| stats.clone())
            .unwrap_or_default()
    }

    /// Allocate a run and submit its root node without waiting for it
    pub async fn allocate(&self, request: AllocationRequest) -> Result<Allocation> {
        self.allocator.allocate(request).await
    }

    /// Wait for an allocated run and publish its final tables
    pub async fn finalize(&self, allocation: &Allocation) -> Result<BTreeMap<String, ObjectUri>> {
        self.allocator.finalize(allocation).await
    }

    /// Run an experiment to completion
    ///
    /// # Example
    ///
    /// ```no_run
    /// use std::path::Path;
    /// use experiment_sweep::allocation::AllocationRequestBuilder;
    /// use experiment_sweep::registry::RegistryBuilder;
    /// use experiment_sweep::runner::{LocalSweep, SweepConfigBuilder};
    /// use experiment_sweep::config::StorageSettings;
    /// use experiment_sweep::schema::{FieldSpec, InputRecord, OutputValues, RecordSchema};
    ///
    /// # async fn example() -> anyhow::Result<()> {
    /// let mut registry = RegistryBuilder::new();
    /// registry.register(
    ///     "square",
    ///     RecordSchema::input("SquareSpec", vec![FieldSpec::int("n")])?,
    ///     RecordSchema::output("SquareResult", vec![FieldSpec::int("squared")], Vec::<String>::new())?,
    ///     |input: &InputRecord, _workdir: &Path| -> anyhow::Result<OutputValues> {
    ///         let n = input.get("n").and_then(|v| v.as_i64()).unwrap_or_default();
    ///         Ok(OutputValues::new().set("squared", n * n))
    ///     },
    /// )?;
    ///
    /// let config = SweepConfigBuilder::default()
    ///     .storage(StorageSettings::new("my-bucket", "sweeps"))
    ///     .build()?;
    /// let sweep = LocalSweep::new(config, registry.build()).await?;
    ///
    /// let records = (0..1000)
    ///     .map(|n| serde_json::json!({ "n": n }).as_object().cloned().unwrap_or_default())
    ///     .collect::<Vec<_>>();
    /// let request = AllocationRequestBuilder::default()
    ///     .task_name("square")
    ///     .records(records)
    ///     .build()?;
    ///
    /// let result = sweep.run(request).await?;
    /// println!("{} rows in {:?}", result.results.scalars().num_rows(), result.duration);
    /// # Ok(())
    /// # }
    /// ```
    pub async fn run(&self, request: AllocationRequest) -> Result<SweepResult> {
        let start_time = Instant::now();
        let total = request.records.len() as u64;

        let allocation = self.allocate(request).await?;
        info!(
            "Experiment {} allocated with {} records",
            allocation.run.experiment_id, total
        );

        let progress = self.setup_progress_tracking(total);
        let finalized = self.finalize(&allocation).await;
        if let Some((handle, bar)) = progress {
            handle.abort();
            bar.finish();
        }
        let final_tables = finalized?;

        let results = FinalResults::load(&self.artifacts, &allocation.run.layout)
            .await
            .context("Failed to load final results")?;
        let duration = start_time.elapsed();
        let stats = self.stats();

        let (p50, p90, p99) = stats.get_percentiles();
        info!(
            "Experiment {} complete: {} rows in {:.2}s (leaf p50 {:?}ms, p90 {:?}ms, p99 {:?}ms, {} retries)",
            allocation.run.experiment_id,
            results.scalars().num_rows(),
            duration.as_secs_f64(),
            p50,
            p90,
            p99,
            stats.retries
        );

        Ok(SweepResult {
            run: allocation.run,
            final_tables,
            results,
            duration,
            stats,
        })
    }

    /// Setup progress tracking with progress bars
    fn setup_progress_tracking(
        &self,
        total: u64,
    ) -> Option<(tokio::task::JoinHandle<()>, ProgressBar)> {
        if self.quiet {
            return None;
        }

        let multi_progress = MultiProgress::new();
        let leaf_bar = multi_progress.add(ProgressBar::new(total));
        if let Ok(style) = ProgressStyle::default_bar()
            .template("[{elapsed_precise}] Leaves: [{bar:30.cyan/blue}] {pos}/{len} ({percent}%) {msg}")
        {
            leaf_bar.set_style(style.progress_chars("=>-"));
        }

        let baseline = self.stats().leaves_completed;
        let stats = Arc::clone(&self.stats);
        let bar = leaf_bar.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_millis(200));
            loop {
                ticker.tick().await;
                let Ok(stats) = stats.lock().map(|s| s.clone()) else {
                    break;
                };
                bar.set_position(stats.leaves_completed.saturating_sub(baseline) as u64);
                if let (Some(p50), Some(p90), Some(p99)) = stats.get_percentiles() {
                    bar.set_message(format!("p50: {}ms, p90: {}ms, p99: {}ms", p50, p90, p99));
                }
            }
        });

        Some((handle, leaf_bar))
    }
}

/// Install a global tracing subscriber; later calls are no-ops
pub fn init_tracing(quiet: bool) {
    use tracing_subscriber::{EnvFilter, FmtSubscriber};
    let filter = if quiet {
        EnvFilter::new("experiment_sweep=warn")
    } else {
        EnvFilter::new("experiment_sweep=info")
    };
    let subscriber = FmtSubscriber::builder().with_env_filter(filter).finish();
    let _ = tracing::subscriber::set_global_default(subscriber);
}
