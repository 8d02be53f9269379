//! Execution bridge between the host scheduler and the engine.
//!
//! Every engine call gets a fresh correlation id and a one-shot reply slot.
//! The engine side answers through [`ExecutionBridge::complete`]; the host side
//! awaits the slot and forwards exactly one report to the scheduler.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::Value;
use tokio::sync::oneshot;
use uuid::Uuid;

use crate::coordinator::HostCoordinator;
use crate::host::{JobId, WorkResult};
use crate::payload;
use crate::worker::{RegisteredWorker, Workflow};

/// What the engine receives for one invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkDescriptor {
    pub id: JobId,
    pub payload: Option<String>,
}

/// The single report closing out one invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Report {
    pub id: JobId,
    pub value: Option<String>,
    pub result: WorkResult,
}

impl Report {
    /// A failure report carrying `message` as a JSON string value.
    pub fn failure(id: JobId, message: &str) -> Self {
        Self {
            id,
            value: Some(error_value(message)),
            result: WorkResult::Failure,
        }
    }

    pub fn retry(id: JobId) -> Self {
        Self {
            id,
            value: None,
            result: WorkResult::Retry,
        }
    }
}

struct PendingReply {
    job_id: JobId,
    tx: oneshot::Sender<Report>,
}

type PendingMap = Arc<Mutex<HashMap<Uuid, PendingReply>>>;

/// Closes the reply slot when the engine task ends, however it ends.
struct SlotGuard {
    pending: PendingMap,
    correlation_id: Uuid,
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
        if pending.remove(&self.correlation_id).is_some() {
            tracing::warn!(correlation_id = %self.correlation_id, "Engine call ended without a reply");
        }
    }
}

/// Carries invocations to the engine and their outcomes back to the host.
pub struct ExecutionBridge {
    coordinator: HostCoordinator,
    pending: PendingMap,
}

impl ExecutionBridge {
    pub fn new(coordinator: HostCoordinator) -> Self {
        Self {
            coordinator,
            pending: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Run `worker`'s workflow for `descriptor` and report the outcome to the
    /// host exactly once. `timeout` bounds the engine call.
    pub async fn invoke(
        self: &Arc<Self>,
        worker: Arc<RegisteredWorker>,
        descriptor: WorkDescriptor,
        timeout: Option<Duration>,
    ) -> Report {
        let (correlation_id, reply) = self.open_slot(&descriptor.id);
        tracing::debug!(
            worker = %worker.name(),
            job_id = %descriptor.id,
            %correlation_id,
            "Invoking workflow"
        );

        let bridge = Arc::clone(self);
        let guard = SlotGuard {
            pending: Arc::clone(&self.pending),
            correlation_id,
        };
        let workflow = worker.workflow.clone();
        let payload = descriptor.payload.clone();
        let engine = tokio::spawn(async move {
            let _guard = guard;
            let reply = execute(workflow, payload).await;
            bridge.complete(correlation_id, reply.value, Some(&reply.result));
        });

        let outcome = match timeout {
            Some(limit) => match tokio::time::timeout(limit, reply).await {
                Ok(received) => received.ok(),
                Err(_) => {
                    self.close_slot(&correlation_id);
                    engine.abort();
                    tracing::warn!(
                        worker = %worker.name(),
                        job_id = %descriptor.id,
                        timeout_secs = limit.as_secs(),
                        "Workflow timed out"
                    );
                    Some(Report::failure(
                        descriptor.id.clone(),
                        &format!("timed out after {}s", limit.as_secs()),
                    ))
                }
            },
            None => reply.await.ok(),
        };

        let report = outcome.unwrap_or_else(|| {
            Report::failure(descriptor.id.clone(), "engine call ended without a result")
        });
        self.report(report.clone()).await;
        report
    }

    /// Engine-facing completion with the text result vocabulary. A missing or
    /// unknown result is treated as `failure`. Returns false when the slot is
    /// already closed.
    pub fn complete(
        &self,
        correlation_id: Uuid,
        value: Option<String>,
        result: Option<&str>,
    ) -> bool {
        let result = match result.map(str::parse::<WorkResult>) {
            Some(Ok(result)) => result,
            Some(Err(err)) => {
                tracing::warn!(%correlation_id, error = %err, "Treating result as failure");
                WorkResult::Failure
            }
            None => WorkResult::Failure,
        };
        self.fulfil(correlation_id, value, result)
    }

    /// Forward a report to the host through the coordinator.
    pub async fn report(&self, report: Report) {
        let id = report.id.clone();
        let result = report.result;
        let delivered = self
            .coordinator
            .call(move |host| async move {
                host.report_result(&report.id, report.value, report.result)
                    .await
            })
            .await;

        match delivered {
            Ok(()) => tracing::info!(job_id = %id, %result, "Reported work result"),
            Err(err) => tracing::error!(job_id = %id, %result, error = %err, "Lost work result"),
        }
    }

    /// Correlation id of the engine call in flight for `job_id`.
    pub fn pending_for(&self, job_id: &JobId) -> Option<Uuid> {
        self.pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .find(|(_, slot)| &slot.job_id == job_id)
            .map(|(correlation_id, _)| *correlation_id)
    }

    /// Number of invocations still waiting on the engine.
    pub fn pending_count(&self) -> usize {
        self.pending.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    fn open_slot(&self, job_id: &JobId) -> (Uuid, oneshot::Receiver<Report>) {
        let correlation_id = Uuid::new_v4();
        let (tx, rx) = oneshot::channel();
        self.pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(
                correlation_id,
                PendingReply {
                    job_id: job_id.clone(),
                    tx,
                },
            );
        (correlation_id, rx)
    }

    fn close_slot(&self, correlation_id: &Uuid) -> Option<PendingReply> {
        self.pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(correlation_id)
    }

    fn fulfil(&self, correlation_id: Uuid, value: Option<String>, result: WorkResult) -> bool {
        let Some(slot) = self.close_slot(&correlation_id) else {
            tracing::warn!(%correlation_id, "Reply for closed correlation slot ignored");
            return false;
        };
        let report = Report {
            id: slot.job_id,
            value,
            result,
        };
        if slot.tx.send(report).is_err() {
            tracing::warn!(%correlation_id, "Invocation stopped waiting before reply");
        }
        true
    }
}

/// What the engine sends back: the serialized value and the result word.
struct EngineReply {
    value: Option<String>,
    result: String,
}

impl EngineReply {
    fn new(value: Option<String>, result: WorkResult) -> Self {
        Self {
            value,
            result: result.to_string(),
        }
    }

    fn error(message: &str) -> Self {
        Self::new(Some(error_value(message)), WorkResult::Failure)
    }
}

/// Run the workflow on the engine side and serialize its outcome.
async fn execute(workflow: Workflow, payload: Option<String>) -> EngineReply {
    match workflow {
        Workflow::Queue(workflow) => {
            let input = match payload::decode_opt(payload.as_deref()) {
                Ok(input) => input,
                Err(err) => return EngineReply::error(&err.to_string()),
            };
            match workflow.run(input).await {
                Ok(outcome) => match payload::encode(&outcome.value) {
                    Ok(text) => EngineReply::new(Some(text), outcome.result),
                    Err(err) => EngineReply::error(&err.to_string()),
                },
                Err(err) => EngineReply::error(&err.message),
            }
        }
        Workflow::Periodic(workflow) => match workflow.run().await {
            Ok(()) => EngineReply::new(None, WorkResult::Success),
            Err(err) => EngineReply::error(&err.message),
        },
    }
}

fn error_value(message: &str) -> String {
    Value::String(message.to_string()).to_string()
}
