//! The public entry point: registry, dispatch, bridge and state sync wired to
//! one host scheduler.

use std::sync::Arc;

use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::app_state::{AppState, AppStateMonitor};
use crate::bridge::ExecutionBridge;
use crate::config::BackgroundWorkerConfig;
use crate::coordinator::HostCoordinator;
use crate::dispatch::Dispatcher;
use crate::error::{Result, SchedulerError};
use crate::host::{HostEvent, HostScheduler, JobId};
use crate::payload;
use crate::state_sync::{JobInfo, StateSynchronizer, SubscriptionHandle};
use crate::worker::{
    RegistrationHandle, WorkerDefinition, WorkerDescriptor, WorkerRegistry, Workflow,
};

/// Background work bridge for one host scheduler.
pub struct BackgroundWorker {
    coordinator: HostCoordinator,
    dispatcher: Arc<Dispatcher>,
    registry: WorkerRegistry,
    sync: Arc<StateSynchronizer>,
}

impl BackgroundWorker {
    /// Wire up the bridge. Must be called inside a tokio runtime; the app
    /// starts out backgrounded.
    pub fn new(host: Arc<dyn HostScheduler>, config: BackgroundWorkerConfig) -> Result<Self> {
        Self::with_app_state(host, config, AppState::Background)
    }

    pub fn with_app_state(
        host: Arc<dyn HostScheduler>,
        config: BackgroundWorkerConfig,
        initial: AppState,
    ) -> Result<Self> {
        config.validate()?;

        let (coordinator, _task) = HostCoordinator::spawn(host);
        let bridge = Arc::new(ExecutionBridge::new(coordinator.clone()));
        let dispatcher = Arc::new(Dispatcher::new(
            bridge,
            coordinator.clone(),
            AppStateMonitor::new(initial),
        ));
        let registry =
            WorkerRegistry::new(config, coordinator.clone(), Arc::clone(&dispatcher));
        let sync = Arc::new(StateSynchronizer::new(coordinator.clone()));

        Ok(Self {
            coordinator,
            dispatcher,
            registry,
            sync,
        })
    }

    pub async fn define(&self, definition: WorkerDefinition) -> Result<RegistrationHandle> {
        self.registry.define(definition).await
    }

    /// Define a worker from an untyped descriptor plus its work logic.
    pub async fn define_from(
        &self,
        descriptor: WorkerDescriptor,
        workflow: Workflow,
    ) -> Result<RegistrationHandle> {
        let definition = descriptor.into_definition(workflow)?;
        self.registry.define(definition).await
    }

    /// Enqueue a payload for a defined queue worker.
    pub async fn enqueue(&self, worker_name: &str, payload: &Value) -> Result<JobId> {
        if !self.registry.contains(worker_name).await {
            return Err(SchedulerError::UnknownWorker {
                name: worker_name.to_string(),
            }
            .into());
        }

        let payload = payload::encode(payload)?;
        let name = worker_name.to_string();
        let id = self
            .coordinator
            .call(move |host| async move { host.enqueue(&name, Some(payload)).await })
            .await??;
        tracing::info!(worker = %worker_name, job_id = %id, "Enqueued work");
        Ok(id)
    }

    /// Ask the scheduler to stop a job. An in-flight run is not interrupted.
    pub async fn cancel(&self, id: &JobId) -> Result<bool> {
        let job_id = id.clone();
        let cancelled = self
            .coordinator
            .call(move |host| async move { host.cancel(&job_id).await })
            .await??;
        tracing::info!(job_id = %id, cancelled, "Cancel requested");
        Ok(cancelled)
    }

    pub async fn info(&self, id: &JobId) -> Result<JobInfo> {
        self.sync.info(id).await
    }

    pub async fn subscribe<F>(&self, id: &JobId, listener: F) -> Result<SubscriptionHandle>
    where
        F: Fn(JobInfo) + Send + Sync + 'static,
    {
        self.sync.subscribe(id, listener).await
    }

    /// Record a foreground/background transition. Returns the previous state.
    pub fn set_app_state(&self, state: AppState) -> AppState {
        self.dispatcher.app_state().set(state)
    }

    pub fn app_state(&self) -> AppState {
        self.dispatcher.app_state().current()
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    pub fn registry(&self) -> &WorkerRegistry {
        &self.registry
    }

    /// Dispatch host events until the channel closes.
    pub async fn run(&self, events: mpsc::UnboundedReceiver<HostEvent>) {
        Arc::clone(&self.dispatcher).run(events).await;
    }

    /// Dispatch host events on a background task.
    pub fn spawn_event_loop(&self, events: mpsc::UnboundedReceiver<HostEvent>) -> JoinHandle<()> {
        tokio::spawn(Arc::clone(&self.dispatcher).run(events))
    }

    /// Remove every state listener and detach dispatch. Invocations arriving
    /// afterwards are answered with `retry`, including those for workers
    /// defined after shutdown, until [`resume`](Self::resume).
    pub async fn shutdown(&self) {
        self.sync.unsubscribe_all().await;
        self.dispatcher.detach_all();
        tracing::info!("Background worker shut down");
    }

    /// Route invocations to workflows again after [`shutdown`](Self::shutdown).
    pub fn resume(&self) {
        self.dispatcher.reattach();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    use crate::error::{ConfigError, DefinitionError, Error};
    use crate::host::{InMemoryScheduler, WorkState};
    use crate::worker::{WorkflowOutcome, queue_fn};

    fn echo() -> Workflow {
        Workflow::Queue(Arc::new(queue_fn(|payload: Value| async move {
            Ok(WorkflowOutcome::success(payload))
        })))
    }

    #[tokio::test]
    async fn invalid_config_rejected() {
        let (host, _events) = InMemoryScheduler::new();
        let config = BackgroundWorkerConfig {
            default_timeout_seconds: 0,
            ..Default::default()
        };
        assert!(matches!(
            BackgroundWorker::new(host, config),
            Err(Error::Config(ConfigError::InvalidValue { .. }))
        ));
    }

    #[tokio::test]
    async fn enqueue_unknown_worker_creates_no_job() {
        let (host, _events) = InMemoryScheduler::new();
        let worker = BackgroundWorker::new(host.clone(), Default::default()).unwrap();
        let err = worker.enqueue("ghost", &json!({})).await.unwrap_err();
        assert!(matches!(
            err,
            Error::Scheduler(SchedulerError::UnknownWorker { .. })
        ));
        assert_eq!(err.to_string(), "Scheduler error: worker not registered: ghost");
        assert_eq!(host.job_count().await, 0);
    }

    #[tokio::test]
    async fn define_from_descriptor() {
        let (host, _events) = InMemoryScheduler::new();
        let worker = BackgroundWorker::new(host.clone(), Default::default()).unwrap();
        let descriptor: WorkerDescriptor =
            serde_json::from_value(json!({"name": "upload", "type": "queue"})).unwrap();
        worker.define_from(descriptor, echo()).await.unwrap();

        let id = worker.enqueue("upload", &json!([1, 2])).await.unwrap();
        let info = worker.info(&id).await.unwrap();
        assert_eq!(info.state, WorkState::Enqueued);
        assert_eq!(info.value, Value::Null);

        let bad: WorkerDescriptor =
            serde_json::from_value(json!({"name": "x", "type": "oneshot"})).unwrap();
        let err = worker.define_from(bad, echo()).await.unwrap_err();
        assert!(matches!(
            err,
            Error::InvalidDefinition(DefinitionError::UnknownType { .. })
        ));
    }

    #[tokio::test]
    async fn cancel_pending_and_unknown() {
        let (host, _events) = InMemoryScheduler::new();
        let worker = BackgroundWorker::new(host, Default::default()).unwrap();
        worker
            .define(WorkerDefinition::with_workflow("upload", echo()))
            .await
            .unwrap();
        let id = worker.enqueue("upload", &json!(null)).await.unwrap();

        assert!(worker.cancel(&id).await.unwrap());
        assert!(!worker.cancel(&id).await.unwrap());
        assert_eq!(worker.info(&id).await.unwrap().state, WorkState::Cancelled);
        assert!(worker.cancel(&JobId::from("missing")).await.is_err());
    }

    #[tokio::test]
    async fn app_state_transitions() {
        let (host, _events) = InMemoryScheduler::new();
        let worker = BackgroundWorker::new(host, Default::default()).unwrap();
        assert_eq!(worker.app_state(), AppState::Background);
        assert_eq!(worker.set_app_state(AppState::Foreground), AppState::Background);
        assert_eq!(worker.app_state(), AppState::Foreground);
    }
}
