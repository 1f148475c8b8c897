use crate::queue::TaskKind;

/// Telemetry events sent from the task queue to the sweep runner for progress tracking
#[derive(Debug, Clone)]
pub enum TelemetryEvent {
    /// A new task was accepted by the queue
    TaskSubmitted { kind: TaskKind },
    /// A submission matched an existing idempotency key
    TaskDeduplicated { kind: TaskKind },
    /// An attempt acquired a slot and began executing
    TaskStarted { kind: TaskKind, attempt: u32 },
    /// An attempt finished successfully
    TaskCompleted { kind: TaskKind, duration_ms: u64 },
    /// An attempt failed
    TaskFailed { kind: TaskKind, will_retry: bool },
}

/// Statistics aggregated from telemetry events
#[derive(Debug, Default, Clone)]
pub struct ProgressStats {
    pub nodes_submitted: usize,
    pub leaves_submitted: usize,
    pub deduplicated: usize,
    pub leaves_completed: usize,
    pub nodes_completed: usize,
    pub retries: usize,
    pub leaves_failed: usize,
    pub nodes_failed: usize,
    pub leaf_durations_ms: Vec<u64>,
}

impl ProgressStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Update stats with a telemetry event
    pub fn update(&mut self, event: &TelemetryEvent) {
        match event {
            TelemetryEvent::TaskSubmitted { kind } => match kind {
                TaskKind::Node => self.nodes_submitted += 1,
                TaskKind::Leaf => self.leaves_submitted += 1,
            },
            TelemetryEvent::TaskDeduplicated { .. } => {
                self.deduplicated += 1;
            }
            TelemetryEvent::TaskStarted { .. } => {}
            TelemetryEvent::TaskCompleted { kind, duration_ms } => match kind {
                TaskKind::Node => self.nodes_completed += 1,
                TaskKind::Leaf => {
                    self.leaves_completed += 1;
                    self.leaf_durations_ms.push(*duration_ms);
                }
            },
            TelemetryEvent::TaskFailed { kind, will_retry } => {
                if *will_retry {
                    self.retries += 1;
                } else {
                    match kind {
                        TaskKind::Node => self.nodes_failed += 1,
                        TaskKind::Leaf => self.leaves_failed += 1,
                    }
                }
            }
        }
    }

    /// Calculate percentile from leaf durations
    pub fn percentile(&self, p: f64) -> Option<u64> {
        if self.leaf_durations_ms.is_empty() {
            return None;
        }

        let mut sorted = self.leaf_durations_ms.clone();
        sorted.sort_unstable();

        let index = ((p / 100.0) * sorted.len() as f64).ceil() as usize;
        let index = index.saturating_sub(1).min(sorted.len() - 1);

        Some(sorted[index])
    }

    /// Get p50, p90, p99 percentiles
    pub fn get_percentiles(&self) -> (Option<u64>, Option<u64>, Option<u64>) {
        (
            self.percentile(50.0),
            self.percentile(90.0),
            self.percentile(99.0),
        )
    }
}
