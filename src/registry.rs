//! Process-wide registry of experiments.
//!
//! Workers build the registry once at startup with [`RegistryBuilder`] and
//! share the frozen [`ExperimentRegistry`] read-only from then on.

use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::sync::Arc;

use tracing::info;

use crate::error::SweepError;
use crate::schema::{InputRecord, OutputValues, RecordFamily, RecordSchema};

/// A compute function run once per input record
///
/// Runs on a blocking thread with a private working directory that is
/// deleted when the call returns. Closures with the matching signature
/// implement this trait.
pub trait Experiment: Send + Sync + 'static {
    fn run(&self, input: &InputRecord, workdir: &Path) -> anyhow::Result<OutputValues>;
}

impl<F> Experiment for F
where
    F: Fn(&InputRecord, &Path) -> anyhow::Result<OutputValues> + Send + Sync + 'static,
{
    fn run(&self, input: &InputRecord, workdir: &Path) -> anyhow::Result<OutputValues> {
        self(input, workdir)
    }
}

/// A registered experiment and its schemas
pub struct RegisteredExperiment {
    pub name: String,
    pub input_schema: RecordSchema,
    pub output_schema: RecordSchema,
    pub experiment: Arc<dyn Experiment>,
}

impl fmt::Debug for RegisteredExperiment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegisteredExperiment")
            .field("name", &self.name)
            .field("input_schema", &self.input_schema.name())
            .field("output_schema", &self.output_schema.name())
            .finish()
    }
}

#[derive(Debug, Default)]
pub struct RegistryBuilder {
    experiments: BTreeMap<String, Arc<RegisteredExperiment>>,
}

impl RegistryBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an experiment under a task name
    pub fn register(
        &mut self,
        name: impl Into<String>,
        input_schema: RecordSchema,
        output_schema: RecordSchema,
        experiment: impl Experiment,
    ) -> Result<&mut Self, SweepError> {
        let name = name.into();
        if name.is_empty() || name.contains('/') {
            return Err(SweepError::InvalidConfig(format!(
                "'{}' is not a valid task name",
                name
            )));
        }
        if self.experiments.contains_key(&name) {
            return Err(SweepError::DuplicateRegistration { name });
        }

        if input_schema.family() != RecordFamily::Input {
            return Err(SweepError::InvalidSchema(format!(
                "{}: {} is not an input schema",
                name,
                input_schema.name()
            )));
        }
        if output_schema.family() != RecordFamily::Output {
            return Err(SweepError::InvalidSchema(format!(
                "{}: {} is not an output schema",
                name,
                output_schema.name()
            )));
        }
        // Results are keyed by the input columns, so output names must not shadow them
        if let Some(clash) = output_schema
            .fields()
            .iter()
            .find(|f| input_schema.field(&f.name).is_some())
        {
            return Err(SweepError::InvalidSchema(format!(
                "{}: output field '{}' shadows an input field",
                name, clash.name
            )));
        }

        info!("Registered experiment {}", name);
        self.experiments.insert(
            name.clone(),
            Arc::new(RegisteredExperiment {
                name,
                input_schema,
                output_schema,
                experiment: Arc::new(experiment),
            }),
        );
        Ok(self)
    }

    pub fn build(self) -> Arc<ExperimentRegistry> {
        Arc::new(ExperimentRegistry {
            experiments: self.experiments,
        })
    }
}

/// Immutable mapping from task name to experiment
#[derive(Debug)]
pub struct ExperimentRegistry {
    experiments: BTreeMap<String, Arc<RegisteredExperiment>>,
}

impl ExperimentRegistry {
    pub fn lookup(&self, name: &str) -> Result<Arc<RegisteredExperiment>, SweepError> {
        self.experiments
            .get(name)
            .cloned()
            .ok_or_else(|| SweepError::UnknownTask {
                name: name.to_string(),
            })
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.experiments.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.experiments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.experiments.is_empty()
    }
}
