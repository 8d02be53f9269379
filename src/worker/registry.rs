//! Registry of live worker definitions.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;

use crate::config::BackgroundWorkerConfig;
use crate::coordinator::HostCoordinator;
use crate::dispatch::Dispatcher;
use crate::error::Result;
use crate::host::JobId;
use crate::worker::definition::{RegisteredWorker, WorkerDefinition, WorkerKind};

/// Returned by [`WorkerRegistry::define`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistrationHandle {
    pub name: String,
    pub kind: WorkerKind,
    /// Scheduled job for periodic workers. Queue workers get ids on enqueue.
    pub job_id: Option<JobId>,
}

/// One live definition per worker name.
pub struct WorkerRegistry {
    config: BackgroundWorkerConfig,
    coordinator: HostCoordinator,
    dispatcher: Arc<Dispatcher>,
    workers: RwLock<HashMap<String, Arc<RegisteredWorker>>>,
}

impl WorkerRegistry {
    pub fn new(
        config: BackgroundWorkerConfig,
        coordinator: HostCoordinator,
        dispatcher: Arc<Dispatcher>,
    ) -> Self {
        Self {
            config,
            coordinator,
            dispatcher,
            workers: RwLock::new(HashMap::new()),
        }
    }

    /// Validate a definition, register it durably, then make it the live
    /// handler for its name. Invalid definitions never reach the scheduler.
    pub async fn define(&self, definition: WorkerDefinition) -> Result<RegistrationHandle> {
        let worker = Arc::new(definition.normalize(&self.config)?);

        let config = worker.config.clone();
        let constraints = worker.constraints.clone();
        let job_id = self
            .coordinator
            .call(move |host| async move {
                host.register_durable(&config, constraints.as_ref()).await
            })
            .await??;

        let handle = RegistrationHandle {
            name: worker.name().to_string(),
            kind: worker.kind(),
            job_id,
        };

        {
            let mut workers = self.workers.write().await;
            workers.insert(handle.name.clone(), Arc::clone(&worker));
            self.dispatcher.attach(Arc::clone(&worker)).await;
        }

        tracing::info!(
            worker = %handle.name,
            kind = %handle.kind,
            timeout_secs = worker.config.timeout_seconds,
            foreground_behaviour = %worker.config.foreground_behaviour,
            "Registered worker"
        );
        Ok(handle)
    }

    pub async fn get(&self, name: &str) -> Option<Arc<RegisteredWorker>> {
        self.workers.read().await.get(name).cloned()
    }

    pub async fn contains(&self, name: &str) -> bool {
        self.workers.read().await.contains_key(name)
    }

    /// Registered names, sorted.
    pub async fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.workers.read().await.keys().cloned().collect();
        names.sort();
        names
    }

    pub async fn len(&self) -> usize {
        self.workers.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.workers.read().await.is_empty()
    }
}
