//! Jobs, their definitions and the factory that instantiates them per firing.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use jobmesh_core::{JobKey, Partitioning};
use jobmesh_schedule::TriggerKey;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::EngineError;
use crate::store::FiredBundle;

/// Error type for job execution.
#[derive(Debug, thiserror::Error)]
pub enum JobError {
    #[error("Job failed: {0}")]
    Failed(String),
    #[error("Invalid job data: {0}")]
    InvalidData(String),
    #[error("Unknown job kind '{0}'")]
    UnknownKind(String),
    #[error("Job panicked: {0}")]
    Panicked(String),
}

/// Executable job logic, instantiated once per firing.
///
/// Partitioned jobs can briefly run on two nodes while membership converges,
/// so implementations should keep their effects idempotent.
pub trait Job: Send + Sync {
    fn execute(&self, ctx: &JobContext) -> Result<(), JobError>;
}

/// What the store records about a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobDefinition {
    pub key: JobKey,
    /// Selects the constructor in the [`JobFactory`].
    pub kind: String,
    #[serde(default)]
    pub partitioning: Partitioning,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub data: Map<String, Value>,
}

impl JobDefinition {
    pub fn new(key: JobKey, kind: impl Into<String>) -> Self {
        Self {
            key,
            kind: kind.into(),
            partitioning: Partitioning::Partitioned,
            description: None,
            data: Map::new(),
        }
    }

    pub fn generic(mut self) -> Self {
        self.partitioning = Partitioning::Generic;
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_data(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.data.insert(key.into(), value.into());
        self
    }
}

/// Per-firing view handed to [`Job::execute`].
#[derive(Debug, Clone)]
pub struct JobContext {
    pub job_key: JobKey,
    pub trigger_key: TriggerKey,
    pub fire_instance_id: Uuid,
    pub scheduled_fire_time: DateTime<Utc>,
    pub fire_time: DateTime<Utc>,
    pub previous_fire_time: Option<DateTime<Utc>>,
    pub next_fire_time: Option<DateTime<Utc>>,
    pub data: Map<String, Value>,
}

impl JobContext {
    pub fn from_bundle(bundle: &FiredBundle) -> Self {
        Self {
            job_key: bundle.job.key.clone(),
            trigger_key: bundle.trigger.key().clone(),
            fire_instance_id: bundle.fire_instance_id,
            scheduled_fire_time: bundle.scheduled_fire_time,
            fire_time: bundle.fire_time,
            previous_fire_time: bundle.previous_fire_time,
            next_fire_time: bundle.trigger.next_fire_time(),
            data: bundle.job.data.clone(),
        }
    }

    /// String value from the job data.
    pub fn str_data(&self, key: &str) -> Option<&str> {
        self.data.get(key).and_then(Value::as_str)
    }
}

/// Turns a job definition into an executable job.
pub trait JobFactory: Send + Sync {
    fn new_job(&self, definition: &JobDefinition) -> Result<Box<dyn Job>, JobError>;

    /// Kinds this factory can instantiate, if it knows them up front.
    fn known_kinds(&self) -> Vec<String> {
        Vec::new()
    }
}

type JobConstructor = Arc<dyn Fn(&JobDefinition) -> Result<Box<dyn Job>, JobError> + Send + Sync>;

/// [`JobFactory`] keyed by [`JobDefinition::kind`].
#[derive(Default)]
pub struct JobRegistry {
    constructors: HashMap<String, JobConstructor>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry with the built-in `log` kind.
    pub fn with_builtin_kinds() -> Self {
        let mut constructors: HashMap<String, JobConstructor> = HashMap::new();
        constructors.insert(
            LogJob::KIND.to_string(),
            Arc::new(|_: &JobDefinition| Ok(Box::new(LogJob) as Box<dyn Job>)),
        );
        Self { constructors }
    }

    pub fn register<F>(&mut self, kind: &str, constructor: F) -> Result<(), EngineError>
    where
        F: Fn(&JobDefinition) -> Result<Box<dyn Job>, JobError> + Send + Sync + 'static,
    {
        if self.constructors.contains_key(kind) {
            return Err(EngineError::DuplicateJobKind(kind.to_string()));
        }
        debug!(kind = kind, "registered job kind");
        self.constructors.insert(kind.to_string(), Arc::new(constructor));
        Ok(())
    }

    pub fn contains(&self, kind: &str) -> bool {
        self.constructors.contains_key(kind)
    }

    pub fn kinds(&self) -> Vec<&str> {
        let mut kinds: Vec<&str> = self.constructors.keys().map(String::as_str).collect();
        kinds.sort_unstable();
        kinds
    }
}

impl JobFactory for JobRegistry {
    fn new_job(&self, definition: &JobDefinition) -> Result<Box<dyn Job>, JobError> {
        let constructor = self
            .constructors
            .get(&definition.kind)
            .ok_or_else(|| JobError::UnknownKind(definition.kind.clone()))?;
        constructor(definition)
    }

    fn known_kinds(&self) -> Vec<String> {
        self.kinds().into_iter().map(str::to_string).collect()
    }
}

impl fmt::Debug for JobRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobRegistry").field("kinds", &self.kinds()).finish()
    }
}

/// Logs the `message` data entry on every firing.
pub struct LogJob;

impl LogJob {
    pub const KIND: &'static str = "log";
}

impl Job for LogJob {
    fn execute(&self, ctx: &JobContext) -> Result<(), JobError> {
        let message = ctx.str_data("message").unwrap_or("tick");
        info!(
            job = %ctx.job_key,
            trigger = %ctx.trigger_key,
            scheduled = %ctx.scheduled_fire_time,
            "{message}"
        );
        Ok(())
    }
}
