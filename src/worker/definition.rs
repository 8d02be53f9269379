//! Worker definitions and their normalized, durable form.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::config::BackgroundWorkerConfig;
use crate::error::DefinitionError;
use crate::worker::workflow::{PeriodicWorkflow, QueueWorkflow};

/// One-shot payload-driven work, or recurring work without a payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerKind {
    Queue,
    Periodic,
}

impl std::fmt::Display for WorkerKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Queue => write!(f, "queue"),
            Self::Periodic => write!(f, "periodic"),
        }
    }
}

impl std::str::FromStr for WorkerKind {
    type Err = DefinitionError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queue" => Ok(Self::Queue),
            "periodic" => Ok(Self::Periodic),
            other => Err(DefinitionError::UnknownType {
                type_name: other.to_string(),
            }),
        }
    }
}

/// How an invocation is run while the app is in the foreground.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ForegroundBehaviour {
    /// Always run in a headless context with a notification.
    HeadlessTask,
    /// Run in-process while foregrounded.
    Foreground,
    /// Never compete with interactive use; retry later.
    Blocking,
}

impl std::fmt::Display for ForegroundBehaviour {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::HeadlessTask => write!(f, "headless_task"),
            Self::Foreground => write!(f, "foreground"),
            Self::Blocking => write!(f, "blocking"),
        }
    }
}

/// Network requirement passed through to the scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NetworkRequirement {
    NotRequired,
    Connected,
    Unmetered,
    NotRoaming,
    Metered,
}

/// Execution constraints. Never interpreted here.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Constraints {
    pub network: Option<NetworkRequirement>,
    pub battery_not_low: bool,
    pub requires_charging: bool,
    pub storage_not_low: bool,
    pub device_idle: bool,
}

impl Constraints {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

/// Text attached to the notification shown during headless execution.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Notification {
    pub title: String,
    pub text: String,
}

impl Notification {
    pub fn new(title: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            text: text.into(),
        }
    }
}

/// The work logic, one variant per worker kind.
#[derive(Clone)]
pub enum Workflow {
    Queue(Arc<dyn QueueWorkflow>),
    Periodic(Arc<dyn PeriodicWorkflow>),
}

impl Workflow {
    pub fn kind(&self) -> WorkerKind {
        match self {
            Self::Queue(_) => WorkerKind::Queue,
            Self::Periodic(_) => WorkerKind::Periodic,
        }
    }
}

impl std::fmt::Debug for Workflow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Workflow::{}", self.kind())
    }
}

/// A worker as the application declares it. Optional fields take defaults
/// when the definition is normalized.
#[derive(Debug, Clone)]
pub struct WorkerDefinition {
    pub name: String,
    pub timeout_seconds: Option<u64>,
    pub foreground_behaviour: Option<ForegroundBehaviour>,
    /// Periodic workers only.
    pub repeat_interval_minutes: Option<u32>,
    pub constraints: Option<Constraints>,
    pub notification: Notification,
    pub workflow: Workflow,
}

impl WorkerDefinition {
    pub fn queue(name: impl Into<String>, workflow: impl QueueWorkflow + 'static) -> Self {
        Self::with_workflow(name, Workflow::Queue(Arc::new(workflow)))
    }

    pub fn periodic(
        name: impl Into<String>,
        repeat_interval_minutes: u32,
        workflow: impl PeriodicWorkflow + 'static,
    ) -> Self {
        let mut definition = Self::with_workflow(name, Workflow::Periodic(Arc::new(workflow)));
        definition.repeat_interval_minutes = Some(repeat_interval_minutes);
        definition
    }

    pub fn with_workflow(name: impl Into<String>, workflow: Workflow) -> Self {
        Self {
            name: name.into(),
            timeout_seconds: None,
            foreground_behaviour: None,
            repeat_interval_minutes: None,
            constraints: None,
            notification: Notification::default(),
            workflow,
        }
    }

    pub fn timeout_seconds(mut self, timeout_seconds: u64) -> Self {
        self.timeout_seconds = Some(timeout_seconds);
        self
    }

    pub fn foreground_behaviour(mut self, behaviour: ForegroundBehaviour) -> Self {
        self.foreground_behaviour = Some(behaviour);
        self
    }

    pub fn constraints(mut self, constraints: Constraints) -> Self {
        self.constraints = Some(constraints);
        self
    }

    pub fn notification(mut self, title: impl Into<String>, text: impl Into<String>) -> Self {
        self.notification = Notification::new(title, text);
        self
    }

    pub fn kind(&self) -> WorkerKind {
        self.workflow.kind()
    }

    /// Validate and apply defaults.
    pub fn normalize(
        self,
        config: &BackgroundWorkerConfig,
    ) -> Result<RegisteredWorker, DefinitionError> {
        let name = self.name.trim().to_string();
        if name.is_empty() {
            return Err(DefinitionError::MissingName);
        }

        let kind = self.workflow.kind();
        let repeat_interval_minutes = match kind {
            WorkerKind::Queue => {
                if self.repeat_interval_minutes.is_some() {
                    tracing::debug!(worker = %name, "Ignoring repeat interval on queue worker");
                }
                None
            }
            WorkerKind::Periodic => {
                let requested = self
                    .repeat_interval_minutes
                    .ok_or_else(|| DefinitionError::MissingRepeatInterval { name: name.clone() })?;
                let effective = requested.max(config.min_repeat_interval_minutes);
                if effective != requested {
                    tracing::info!(
                        worker = %name,
                        requested,
                        effective,
                        "Raised periodic interval to scheduler minimum"
                    );
                }
                Some(effective)
            }
        };

        let constraints = self.constraints.filter(|c| !c.is_empty());

        Ok(RegisteredWorker {
            config: WorkerConfig {
                name,
                kind,
                timeout_seconds: self.timeout_seconds.unwrap_or(config.default_timeout_seconds),
                foreground_behaviour: self
                    .foreground_behaviour
                    .unwrap_or(config.default_foreground_behaviour),
                repeat_interval_minutes,
                notification: self.notification,
            },
            constraints,
            workflow: self.workflow,
        })
    }
}

/// Untyped worker description, e.g. loaded from JSON. The `type` field is a
/// string so unknown kinds can be rejected as invalid definitions.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct WorkerDescriptor {
    pub name: Option<String>,
    #[serde(rename = "type")]
    pub kind: Option<String>,
    pub timeout_seconds: Option<u64>,
    pub foreground_behaviour: Option<ForegroundBehaviour>,
    pub repeat_interval_minutes: Option<u32>,
    pub constraints: Option<Constraints>,
    pub notification: Option<Notification>,
}

impl WorkerDescriptor {
    /// Attach the work logic. The declared type must match the workflow.
    pub fn into_definition(self, workflow: Workflow) -> Result<WorkerDefinition, DefinitionError> {
        let name = self
            .name
            .filter(|n| !n.trim().is_empty())
            .ok_or(DefinitionError::MissingName)?;
        let declared: WorkerKind = self
            .kind
            .ok_or_else(|| DefinitionError::MissingType { name: name.clone() })?
            .parse()?;

        if declared != workflow.kind() {
            return Err(DefinitionError::WorkflowMismatch {
                name,
                declared: declared.to_string(),
                actual: workflow.kind().to_string(),
            });
        }

        Ok(WorkerDefinition {
            name,
            timeout_seconds: self.timeout_seconds,
            foreground_behaviour: self.foreground_behaviour,
            repeat_interval_minutes: self.repeat_interval_minutes,
            constraints: self.constraints,
            notification: self.notification.unwrap_or_default(),
            workflow,
        })
    }
}

/// Normalized, constraint-stripped configuration handed to the scheduler.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerConfig {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: WorkerKind,
    pub timeout_seconds: u64,
    pub foreground_behaviour: ForegroundBehaviour,
    pub repeat_interval_minutes: Option<u32>,
    pub notification: Notification,
}

/// A validated worker: durable config, constraints, and work logic.
#[derive(Debug, Clone)]
pub struct RegisteredWorker {
    pub config: WorkerConfig,
    pub constraints: Option<Constraints>,
    pub workflow: Workflow,
}

impl RegisteredWorker {
    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn kind(&self) -> WorkerKind {
        self.config.kind
    }
}
