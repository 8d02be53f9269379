//! Host scheduler interface.
//!
//! The durable scheduler lives outside this crate. It accepts worker
//! registrations, assigns job ids, evaluates constraints, and later delivers
//! [`HostEvent`]s when a job may run. Every call into it goes through the
//! [`HostCoordinator`](crate::coordinator::HostCoordinator).

pub mod memory;

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::SchedulerError;
use crate::worker::{Constraints, Notification, WorkerConfig, WorkerKind};

pub use memory::InMemoryScheduler;

/// Opaque, scheduler-assigned job identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(String);

impl JobId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for JobId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl From<&str> for JobId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

/// Lifecycle state of enqueued work, as tracked by the scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkState {
    Enqueued,
    Running,
    Succeeded,
    Failed,
    RetryPending,
    Cancelled,
    Blocked,
    Unknown,
}

impl WorkState {
    /// Whether the scheduler will never run this job again.
    pub fn is_finished(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Cancelled)
    }

    /// Whether the scheduler actually knows the state.
    pub fn is_resolved(&self) -> bool {
        !matches!(self, Self::Unknown)
    }
}

impl std::fmt::Display for WorkState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Enqueued => "enqueued",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::RetryPending => "retry_pending",
            Self::Cancelled => "cancelled",
            Self::Blocked => "blocked",
            Self::Unknown => "unknown",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for WorkState {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "enqueued" => Ok(Self::Enqueued),
            "running" => Ok(Self::Running),
            "succeeded" => Ok(Self::Succeeded),
            "failed" => Ok(Self::Failed),
            "retry_pending" => Ok(Self::RetryPending),
            "cancelled" => Ok(Self::Cancelled),
            "blocked" => Ok(Self::Blocked),
            "unknown" => Ok(Self::Unknown),
            other => Err(format!("unknown work state: {other}")),
        }
    }
}

/// The only vocabulary the scheduler understands for closing out an attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkResult {
    Success,
    Failure,
    Retry,
}

impl std::fmt::Display for WorkResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Success => write!(f, "success"),
            Self::Failure => write!(f, "failure"),
            Self::Retry => write!(f, "retry"),
        }
    }
}

impl std::str::FromStr for WorkResult {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "success" => Ok(Self::Success),
            "failure" => Ok(Self::Failure),
            "retry" => Ok(Self::Retry),
            other => Err(format!("unknown result type: {other}")),
        }
    }
}

/// Point-in-time job record as the scheduler reports it. `value` is the
/// serialized result value, opaque at this layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkInfo {
    pub id: JobId,
    pub worker_name: String,
    pub state: WorkState,
    pub attempt_count: u32,
    pub value: Option<String>,
}

/// The scheduler has decided a job may run now. `kind` is the worker kind
/// the job was enqueued under.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvocationEvent {
    pub id: JobId,
    pub worker_name: String,
    pub kind: WorkerKind,
    pub payload: Option<String>,
}

/// Everything needed to run a job outside the interactive context.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeadlessDescriptor {
    pub id: JobId,
    pub worker_name: String,
    pub kind: WorkerKind,
    pub payload: Option<String>,
    pub notification: Notification,
    pub timeout_seconds: u64,
}

/// Inbound events from the scheduler to the dispatcher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostEvent {
    /// A job became eligible to run.
    Invocation(InvocationEvent),
    /// A previously requested headless context is ready to run the job.
    Headless(HeadlessDescriptor),
}

/// Callback registered with [`HostScheduler::observe`].
pub type WorkInfoListener = Arc<dyn Fn(WorkInfo) + Send + Sync>;

/// Identifies one observer registration on the scheduler side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObserverToken(pub u64);

/// Durable scheduler adapter.
#[async_trait]
pub trait HostScheduler: Send + Sync {
    /// Register a worker. Queue workers return `None`; periodic workers are
    /// scheduled immediately and return their job id.
    async fn register_durable(
        &self,
        config: &WorkerConfig,
        constraints: Option<&Constraints>,
    ) -> Result<Option<JobId>, SchedulerError>;

    /// Enqueue a payload for a registered queue worker.
    async fn enqueue(
        &self,
        worker_name: &str,
        payload: Option<String>,
    ) -> Result<JobId, SchedulerError>;

    /// Stop future invocations of a job. Returns whether pending work was
    /// actually cancelled.
    async fn cancel(&self, id: &JobId) -> Result<bool, SchedulerError>;

    /// Close out the current attempt of a job.
    async fn report_result(&self, id: &JobId, value: Option<String>, result: WorkResult);

    /// Ask the host to run a job in a headless context. The host answers
    /// later with [`HostEvent::Headless`].
    async fn start_headless_execution(
        &self,
        descriptor: HeadlessDescriptor,
    ) -> Result<(), SchedulerError>;

    async fn get_info(&self, id: &JobId) -> Result<WorkInfo, SchedulerError>;

    /// Register a state-change listener for a job.
    async fn observe(
        &self,
        id: &JobId,
        listener: WorkInfoListener,
    ) -> Result<ObserverToken, SchedulerError>;

    /// Remove a listener. Unknown tokens are ignored.
    async fn unobserve(&self, id: &JobId, token: ObserverToken);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn work_state_wire_names() {
        assert_eq!(
            serde_json::to_string(&WorkState::RetryPending).unwrap(),
            "\"retry_pending\""
        );
        assert_eq!("succeeded".parse::<WorkState>().unwrap(), WorkState::Succeeded);
        assert!("done".parse::<WorkState>().is_err());
    }

    #[test]
    fn finished_states() {
        assert!(WorkState::Succeeded.is_finished());
        assert!(WorkState::Failed.is_finished());
        assert!(WorkState::Cancelled.is_finished());
        assert!(!WorkState::RetryPending.is_finished());
        assert!(!WorkState::Blocked.is_finished());
        assert!(!WorkState::Unknown.is_resolved());
    }

    #[test]
    fn work_result_parses_vocabulary() {
        assert_eq!("retry".parse::<WorkResult>().unwrap(), WorkResult::Retry);
        assert_eq!(WorkResult::Failure.to_string(), "failure");
        assert!("maybe".parse::<WorkResult>().is_err());
    }

    #[test]
    fn work_info_wire_shape() {
        let info = WorkInfo {
            id: JobId::from("j-1"),
            worker_name: "upload".into(),
            state: WorkState::Succeeded,
            attempt_count: 1,
            value: Some("{\"bytes\":42}".into()),
        };
        let json = serde_json::to_value(&info).unwrap();
        assert_eq!(json["id"], "j-1");
        assert_eq!(json["state"], "succeeded");
        assert_eq!(json["attempt_count"], 1);
    }
}
