//! Dispatch coordinator.
//!
//! Turns scheduler events into workflow runs. Holds at most one live
//! subscription per worker name; attaching a new one revokes the previous
//! subscription before the new one is visible.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use tokio::sync::{RwLock, mpsc};

use crate::app_state::{AppState, AppStateMonitor};
use crate::bridge::{ExecutionBridge, Report, WorkDescriptor};
use crate::coordinator::HostCoordinator;
use crate::error::SchedulerError;
use crate::host::{HeadlessDescriptor, HostEvent, InvocationEvent, JobId};
use crate::worker::{ForegroundBehaviour, RegisteredWorker, WorkerKind};

/// How an invocation is carried out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchPath {
    /// Report `retry` without running the workflow.
    Retry,
    /// Run the workflow in-process.
    InProcess,
    /// Hand the job to a headless context.
    Headless,
}

/// Pick the dispatch path for a worker given the current app state.
pub fn decide(behaviour: ForegroundBehaviour, app_state: AppState) -> DispatchPath {
    match (app_state, behaviour) {
        (AppState::Foreground, ForegroundBehaviour::Blocking) => DispatchPath::Retry,
        (AppState::Foreground, ForegroundBehaviour::Foreground) => DispatchPath::InProcess,
        _ => DispatchPath::Headless,
    }
}

/// What happened to one inbound event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Disposition {
    Dispatched(DispatchPath),
    /// No live definition for the worker name; reported as failure.
    MissingWorker,
    /// The live definition is of another kind than the job; reported as
    /// failure.
    KindMismatch,
    /// The engine is detached; reported as retry.
    Detached,
}

/// The live dispatch subscription for one worker name.
#[derive(Debug)]
pub struct DispatchSubscription {
    generation: u64,
    worker: Arc<RegisteredWorker>,
    active: AtomicBool,
}

impl DispatchSubscription {
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn worker(&self) -> &Arc<RegisteredWorker> {
        &self.worker
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    fn revoke(&self) {
        self.active.store(false, Ordering::SeqCst);
    }
}

pub struct Dispatcher {
    subscriptions: RwLock<HashMap<String, Arc<DispatchSubscription>>>,
    next_generation: AtomicU64,
    app_state: AppStateMonitor,
    bridge: Arc<ExecutionBridge>,
    coordinator: HostCoordinator,
    attached: AtomicBool,
}

impl Dispatcher {
    pub fn new(
        bridge: Arc<ExecutionBridge>,
        coordinator: HostCoordinator,
        app_state: AppStateMonitor,
    ) -> Self {
        Self {
            subscriptions: RwLock::new(HashMap::new()),
            next_generation: AtomicU64::new(1),
            app_state,
            bridge,
            coordinator,
            attached: AtomicBool::new(true),
        }
    }

    pub fn app_state(&self) -> &AppStateMonitor {
        &self.app_state
    }

    pub fn is_attached(&self) -> bool {
        self.attached.load(Ordering::SeqCst)
    }

    /// Route invocations for `worker` to its workflow. Returns the revoked
    /// subscription, if one was live. Does not undo [`detach_all`](Self::detach_all).
    pub async fn attach(&self, worker: Arc<RegisteredWorker>) -> Option<Arc<DispatchSubscription>> {
        let name = worker.name().to_string();
        let subscription = Arc::new(DispatchSubscription {
            generation: self.next_generation.fetch_add(1, Ordering::SeqCst),
            worker,
            active: AtomicBool::new(true),
        });

        let mut subscriptions = self.subscriptions.write().await;
        let previous = subscriptions.remove(&name);
        if let Some(previous) = &previous {
            previous.revoke();
            tracing::debug!(
                worker = %name,
                generation = previous.generation,
                "Revoked dispatch subscription"
            );
        }
        subscriptions.insert(name, subscription);
        previous
    }

    /// Stop running workflows. Subscriptions stay in place and every later
    /// event is answered with `retry` until [`reattach`](Self::reattach).
    pub fn detach_all(&self) {
        if self.attached.swap(false, Ordering::SeqCst) {
            tracing::info!("Dispatcher detached");
        }
    }

    /// Resume routing events to the live subscriptions.
    pub fn reattach(&self) {
        if !self.attached.swap(true, Ordering::SeqCst) {
            tracing::info!("Dispatcher reattached");
        }
    }

    /// The live subscription for `name`.
    pub async fn handler(&self, name: &str) -> Option<Arc<DispatchSubscription>> {
        self.subscriptions.read().await.get(name).cloned()
    }

    pub async fn handle(&self, event: HostEvent) -> Disposition {
        match event {
            HostEvent::Invocation(event) => self.handle_invocation(event).await,
            HostEvent::Headless(descriptor) => self.handle_headless(descriptor).await,
        }
    }

    pub async fn handle_invocation(&self, event: InvocationEvent) -> Disposition {
        let subscription = match self.resolve(&event.id, &event.worker_name, event.kind).await {
            Ok(subscription) => subscription,
            Err(disposition) => return disposition,
        };

        let worker = Arc::clone(subscription.worker());
        let app_state = self.app_state.current();
        let path = decide(worker.config.foreground_behaviour, app_state);
        tracing::debug!(
            worker = %event.worker_name,
            job_id = %event.id,
            %app_state,
            ?path,
            "Dispatching invocation"
        );

        match path {
            DispatchPath::Retry => self.bridge.report(Report::retry(event.id)).await,
            DispatchPath::InProcess => {
                let descriptor = WorkDescriptor {
                    id: event.id,
                    payload: event.payload,
                };
                self.bridge.invoke(worker, descriptor, None).await;
            }
            DispatchPath::Headless => {
                let descriptor = HeadlessDescriptor {
                    id: event.id.clone(),
                    worker_name: event.worker_name,
                    kind: event.kind,
                    payload: event.payload,
                    notification: worker.config.notification.clone(),
                    timeout_seconds: worker.config.timeout_seconds,
                };
                let started = self
                    .coordinator
                    .call(move |host| async move { host.start_headless_execution(descriptor).await })
                    .await;
                let failure = match started {
                    Ok(Ok(())) => None,
                    Ok(Err(err)) => Some(err.to_string()),
                    Err(err) => Some(err.to_string()),
                };
                if let Some(message) = failure {
                    tracing::warn!(job_id = %event.id, error = %message, "Headless start failed");
                    self.bridge.report(Report::failure(event.id, &message)).await;
                }
            }
        }
        Disposition::Dispatched(path)
    }

    /// Run a job the host has handed to a headless context.
    pub async fn handle_headless(&self, descriptor: HeadlessDescriptor) -> Disposition {
        let subscription = match self
            .resolve(&descriptor.id, &descriptor.worker_name, descriptor.kind)
            .await
        {
            Ok(subscription) => subscription,
            Err(disposition) => return disposition,
        };

        let timeout = Duration::from_secs(descriptor.timeout_seconds);
        let work = WorkDescriptor {
            id: descriptor.id,
            payload: descriptor.payload,
        };
        self.bridge
            .invoke(Arc::clone(subscription.worker()), work, Some(timeout))
            .await;
        Disposition::Dispatched(DispatchPath::Headless)
    }

    /// Consume scheduler events until the channel closes. Each event runs on
    /// its own task so a slow workflow does not hold up other workers.
    pub async fn run(self: Arc<Self>, mut events: mpsc::UnboundedReceiver<HostEvent>) {
        while let Some(event) = events.recv().await {
            let dispatcher = Arc::clone(&self);
            tokio::spawn(async move {
                dispatcher.handle(event).await;
            });
        }
        tracing::debug!("Host event stream closed");
    }

    /// Find the live subscription for an event, answering the host directly
    /// when the event cannot run.
    async fn resolve(
        &self,
        id: &JobId,
        worker_name: &str,
        kind: WorkerKind,
    ) -> Result<Arc<DispatchSubscription>, Disposition> {
        if !self.is_attached() {
            tracing::debug!(job_id = %id, worker = %worker_name, "Engine detached, retrying later");
            self.bridge.report(Report::retry(id.clone())).await;
            return Err(Disposition::Detached);
        }

        let Some(subscription) = self.handler(worker_name).await else {
            let err = SchedulerError::UnknownWorker {
                name: worker_name.to_string(),
            };
            tracing::warn!(job_id = %id, worker = %worker_name, "No live definition for invocation");
            self.bridge
                .report(Report::failure(id.clone(), &err.to_string()))
                .await;
            return Err(Disposition::MissingWorker);
        };

        let live = subscription.worker().kind();
        if live != kind {
            let message = format!("worker {worker_name} is now {live}, job was enqueued as {kind}");
            tracing::warn!(job_id = %id, worker = %worker_name, %live, %kind, "Worker kind changed");
            self.bridge.report(Report::failure(id.clone(), &message)).await;
            return Err(Disposition::KindMismatch);
        }
        Ok(subscription)
    }
}
