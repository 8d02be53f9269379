//! In-memory host scheduler.
//!
//! Keeps registrations and job records in process memory. Nothing survives a
//! restart and constraints are recorded but never evaluated; jobs run only
//! when [`InMemoryScheduler::fire`] is called.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, mpsc};
use uuid::Uuid;

use crate::error::SchedulerError;
use crate::host::{
    HeadlessDescriptor, HostEvent, HostScheduler, InvocationEvent, JobId, ObserverToken,
    WorkInfo, WorkInfoListener, WorkResult, WorkState,
};
use crate::worker::{Constraints, WorkerConfig, WorkerKind};

/// A stored job.
#[derive(Debug, Clone)]
struct JobRecord {
    id: JobId,
    worker_name: String,
    kind: WorkerKind,
    payload: Option<String>,
    state: WorkState,
    attempt_count: u32,
    value: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl JobRecord {
    fn new(id: JobId, worker_name: &str, kind: WorkerKind, payload: Option<String>) -> Self {
        let now = Utc::now();
        Self {
            id,
            worker_name: worker_name.to_string(),
            kind,
            payload,
            state: WorkState::Enqueued,
            attempt_count: 0,
            value: None,
            created_at: now,
            updated_at: now,
        }
    }

    fn info(&self) -> WorkInfo {
        WorkInfo {
            id: self.id.clone(),
            worker_name: self.worker_name.clone(),
            state: self.state,
            attempt_count: self.attempt_count,
            value: self.value.clone(),
        }
    }

    fn set_state(&mut self, state: WorkState) {
        self.state = state;
        self.updated_at = Utc::now();
    }
}

/// A result report as the scheduler received it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedReport {
    pub id: JobId,
    pub value: Option<String>,
    pub result: WorkResult,
}

/// A registration as the scheduler received it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Registration {
    pub config: WorkerConfig,
    pub constraints: Option<Constraints>,
}

#[derive(Default)]
struct SchedulerState {
    registrations: HashMap<String, Registration>,
    /// Live periodic job per worker name.
    periodic_jobs: HashMap<String, JobId>,
    jobs: HashMap<JobId, JobRecord>,
    observers: HashMap<JobId, Vec<(ObserverToken, WorkInfoListener)>>,
    reports: Vec<ReceivedReport>,
    headless: Vec<HeadlessDescriptor>,
}

impl SchedulerState {
    /// Snapshot of a job and its listeners, for notification outside the lock.
    fn pending_notification(&self, id: &JobId) -> Option<(WorkInfo, Vec<WorkInfoListener>)> {
        let info = self.jobs.get(id)?.info();
        let listeners = self
            .observers
            .get(id)
            .map(|entries| entries.iter().map(|(_, l)| Arc::clone(l)).collect())
            .unwrap_or_default();
        Some((info, listeners))
    }
}

/// Process-local [`HostScheduler`].
pub struct InMemoryScheduler {
    state: Mutex<SchedulerState>,
    events: mpsc::UnboundedSender<HostEvent>,
    next_token: AtomicU64,
    unavailable: AtomicBool,
}

impl InMemoryScheduler {
    /// Create a scheduler and the receiving end of its event stream.
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<HostEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        let scheduler = Arc::new(Self {
            state: Mutex::new(SchedulerState::default()),
            events,
            next_token: AtomicU64::new(1),
            unavailable: AtomicBool::new(false),
        });
        (scheduler, rx)
    }

    /// Make registration and enqueue calls fail with `Rejected`.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Decide that a job may run now: mark it running, count the attempt and
    /// emit an invocation event.
    pub async fn fire(&self, id: &JobId) -> Result<(), SchedulerError> {
        let (event, notification) = {
            let mut state = self.state.lock().await;
            let job = state
                .jobs
                .get_mut(id)
                .ok_or_else(|| SchedulerError::NotFound { id: id.to_string() })?;
            if job.state.is_finished() {
                return Err(SchedulerError::Rejected {
                    reason: format!("job {id} is {} and cannot run", job.state),
                });
            }
            job.set_state(WorkState::Running);
            job.attempt_count += 1;
            let event = InvocationEvent {
                id: job.id.clone(),
                worker_name: job.worker_name.clone(),
                kind: job.kind,
                payload: job.payload.clone(),
            };
            (event, state.pending_notification(id))
        };

        Self::notify(notification);
        tracing::debug!(job_id = %id, worker = %event.worker_name, "Firing job");
        self.events
            .send(HostEvent::Invocation(event))
            .map_err(|_| SchedulerError::Rejected {
                reason: "no dispatcher is listening".to_string(),
            })
    }

    /// Hold a job back, as the scheduler does while prerequisites are unmet.
    pub async fn block(&self, id: &JobId) -> Result<(), SchedulerError> {
        let notification = {
            let mut state = self.state.lock().await;
            let job = state
                .jobs
                .get_mut(id)
                .ok_or_else(|| SchedulerError::NotFound { id: id.to_string() })?;
            job.set_state(WorkState::Blocked);
            state.pending_notification(id)
        };
        Self::notify(notification);
        Ok(())
    }

    pub async fn registration(&self, name: &str) -> Option<Registration> {
        self.state.lock().await.registrations.get(name).cloned()
    }

    /// Every report received so far, in arrival order.
    pub async fn reports(&self) -> Vec<ReceivedReport> {
        self.state.lock().await.reports.clone()
    }

    /// Headless executions requested so far.
    pub async fn headless_requests(&self) -> Vec<HeadlessDescriptor> {
        self.state.lock().await.headless.clone()
    }

    pub async fn job_count(&self) -> usize {
        self.state.lock().await.jobs.len()
    }

    pub async fn observer_count(&self, id: &JobId) -> usize {
        self.state
            .lock()
            .await
            .observers
            .get(id)
            .map_or(0, Vec::len)
    }

    /// When the job record was created and last changed.
    pub async fn timestamps(&self, id: &JobId) -> Option<(DateTime<Utc>, DateTime<Utc>)> {
        self.state
            .lock()
            .await
            .jobs
            .get(id)
            .map(|job| (job.created_at, job.updated_at))
    }

    fn notify(notification: Option<(WorkInfo, Vec<WorkInfoListener>)>) {
        if let Some((info, listeners)) = notification {
            for listener in listeners {
                listener(info.clone());
            }
        }
    }

    fn ensure_available(&self) -> Result<(), SchedulerError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(SchedulerError::Rejected {
                reason: "scheduler unavailable".to_string(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl HostScheduler for InMemoryScheduler {
    async fn register_durable(
        &self,
        config: &WorkerConfig,
        constraints: Option<&Constraints>,
    ) -> Result<Option<JobId>, SchedulerError> {
        self.ensure_available()?;

        let mut state = self.state.lock().await;
        state.registrations.insert(
            config.name.clone(),
            Registration {
                config: config.clone(),
                constraints: constraints.cloned(),
            },
        );

        match config.kind {
            WorkerKind::Queue => {
                tracing::debug!(worker = %config.name, "Stored queue registration");
                Ok(None)
            }
            WorkerKind::Periodic => {
                let id = JobId::new(Uuid::new_v4().to_string());
                let replaced = state.periodic_jobs.insert(config.name.clone(), id.clone());
                let mut notification = None;
                if let Some(previous) = replaced
                    && let Some(job) = state.jobs.get_mut(&previous)
                    && !job.state.is_finished()
                {
                    job.set_state(WorkState::Cancelled);
                    notification = state.pending_notification(&previous);
                }
                state.jobs.insert(
                    id.clone(),
                    JobRecord::new(id.clone(), &config.name, WorkerKind::Periodic, None),
                );
                drop(state);

                Self::notify(notification);
                tracing::info!(worker = %config.name, job_id = %id, "Scheduled periodic work");
                Ok(Some(id))
            }
        }
    }

    async fn enqueue(
        &self,
        worker_name: &str,
        payload: Option<String>,
    ) -> Result<JobId, SchedulerError> {
        self.ensure_available()?;

        let mut state = self.state.lock().await;
        match state.registrations.get(worker_name) {
            Some(registration) if registration.config.kind == WorkerKind::Queue => {}
            _ => {
                return Err(SchedulerError::UnknownWorker {
                    name: worker_name.to_string(),
                });
            }
        }

        let id = JobId::new(Uuid::new_v4().to_string());
        state.jobs.insert(
            id.clone(),
            JobRecord::new(id.clone(), worker_name, WorkerKind::Queue, payload),
        );
        Ok(id)
    }

    async fn cancel(&self, id: &JobId) -> Result<bool, SchedulerError> {
        let notification = {
            let mut state = self.state.lock().await;
            let job = state
                .jobs
                .get_mut(id)
                .ok_or_else(|| SchedulerError::NotFound { id: id.to_string() })?;
            if job.state.is_finished() {
                return Ok(false);
            }
            job.set_state(WorkState::Cancelled);
            state.pending_notification(id)
        };
        Self::notify(notification);
        Ok(true)
    }

    async fn report_result(&self, id: &JobId, value: Option<String>, result: WorkResult) {
        let notification = {
            let mut state = self.state.lock().await;
            state.reports.push(ReceivedReport {
                id: id.clone(),
                value: value.clone(),
                result,
            });
            let Some(job) = state.jobs.get_mut(id) else {
                tracing::warn!(job_id = %id, "Result reported for unknown job");
                return;
            };

            job.value = value;
            if job.state == WorkState::Cancelled {
                tracing::debug!(job_id = %id, "Recorded late result for cancelled job");
            } else {
                let next = match (job.kind, result) {
                    (_, WorkResult::Retry) => WorkState::RetryPending,
                    (WorkerKind::Periodic, _) => WorkState::Enqueued,
                    (WorkerKind::Queue, WorkResult::Success) => WorkState::Succeeded,
                    (WorkerKind::Queue, WorkResult::Failure) => WorkState::Failed,
                };
                job.set_state(next);
            }
            state.pending_notification(id)
        };
        Self::notify(notification);
    }

    async fn start_headless_execution(
        &self,
        descriptor: HeadlessDescriptor,
    ) -> Result<(), SchedulerError> {
        self.state.lock().await.headless.push(descriptor.clone());
        tracing::debug!(
            job_id = %descriptor.id,
            title = %descriptor.notification.title,
            "Starting headless execution"
        );
        self.events
            .send(HostEvent::Headless(descriptor))
            .map_err(|_| SchedulerError::Rejected {
                reason: "headless context unavailable".to_string(),
            })
    }

    async fn get_info(&self, id: &JobId) -> Result<WorkInfo, SchedulerError> {
        self.state
            .lock()
            .await
            .jobs
            .get(id)
            .map(JobRecord::info)
            .ok_or_else(|| SchedulerError::NotFound { id: id.to_string() })
    }

    async fn observe(
        &self,
        id: &JobId,
        listener: WorkInfoListener,
    ) -> Result<ObserverToken, SchedulerError> {
        let mut state = self.state.lock().await;
        if !state.jobs.contains_key(id) {
            return Err(SchedulerError::NotFound { id: id.to_string() });
        }
        let token = ObserverToken(self.next_token.fetch_add(1, Ordering::SeqCst));
        state
            .observers
            .entry(id.clone())
            .or_default()
            .push((token, listener));
        Ok(token)
    }

    async fn unobserve(&self, id: &JobId, token: ObserverToken) {
        let mut state = self.state.lock().await;
        if let Some(entries) = state.observers.get_mut(id) {
            entries.retain(|(t, _)| *t != token);
            if entries.is_empty() {
                state.observers.remove(id);
            }
        }
    }
}
