//! Job state queries and change subscriptions.
//!
//! At most one listener is live per job id. A new subscription replaces the
//! previous one, and a listener sees the already-resolved state as a snapshot
//! before any change event.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use serde::Serialize;
use serde_json::Value;
use tokio::sync::RwLock;

use crate::coordinator::HostCoordinator;
use crate::error::Result;
use crate::host::{JobId, ObserverToken, WorkInfo, WorkInfoListener, WorkState};
use crate::payload;

/// Job state with the result value decoded to a native value.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobInfo {
    pub id: JobId,
    pub worker_name: String,
    pub state: WorkState,
    pub attempt_count: u32,
    pub value: Value,
}

impl From<WorkInfo> for JobInfo {
    fn from(info: WorkInfo) -> Self {
        Self {
            value: payload::decode_lenient(info.value.as_deref()),
            id: info.id,
            worker_name: info.worker_name,
            state: info.state,
            attempt_count: info.attempt_count,
        }
    }
}

/// Callback for job state changes.
pub type JobListener = Arc<dyn Fn(JobInfo) + Send + Sync>;

#[derive(Default)]
struct Held {
    open: bool,
    events: Vec<WorkInfo>,
}

/// Feeds one listener. Change events that arrive before the snapshot is
/// delivered are held back and released after it.
struct Delivery {
    listener: JobListener,
    active: AtomicBool,
    held: Mutex<Held>,
}

impl Delivery {
    fn new(listener: JobListener) -> Self {
        Self {
            listener,
            active: AtomicBool::new(true),
            held: Mutex::new(Held::default()),
        }
    }

    fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    fn deactivate(&self) {
        self.active.store(false, Ordering::SeqCst);
    }

    fn emit(&self, info: WorkInfo) {
        if self.is_active() {
            (self.listener)(info.into());
        }
    }

    fn on_change(&self, info: WorkInfo) {
        {
            let mut held = self.held.lock().unwrap_or_else(|e| e.into_inner());
            if !held.open {
                held.events.push(info);
                return;
            }
        }
        self.emit(info);
    }

    /// Deliver the snapshot, then every held change the snapshot does not
    /// already cover, then let live changes through.
    fn open(&self, snapshot: Option<WorkInfo>) {
        let mut skip_through = None;
        if let Some(snapshot) = snapshot {
            let held = self.held.lock().unwrap_or_else(|e| e.into_inner());
            skip_through = held.events.iter().rposition(|info| *info == snapshot);
            drop(held);
            self.emit(snapshot);
        }

        let mut first = true;
        loop {
            let batch = {
                let mut held = self.held.lock().unwrap_or_else(|e| e.into_inner());
                if held.events.is_empty() {
                    held.open = true;
                    return;
                }
                std::mem::take(&mut held.events)
            };
            let start = match (first, skip_through) {
                (true, Some(index)) => index + 1,
                _ => 0,
            };
            first = false;
            for info in batch.into_iter().skip(start) {
                self.emit(info);
            }
        }
    }
}

struct StateSubscription {
    generation: u64,
    token: ObserverToken,
    delivery: Arc<Delivery>,
}

pub struct StateSynchronizer {
    coordinator: HostCoordinator,
    subscriptions: RwLock<HashMap<JobId, StateSubscription>>,
    next_generation: AtomicU64,
}

impl StateSynchronizer {
    pub fn new(coordinator: HostCoordinator) -> Self {
        Self {
            coordinator,
            subscriptions: RwLock::new(HashMap::new()),
            next_generation: AtomicU64::new(1),
        }
    }

    /// Current state of a job.
    pub async fn info(&self, id: &JobId) -> Result<JobInfo> {
        let id = id.clone();
        let info = self
            .coordinator
            .call(move |host| async move { host.get_info(&id).await })
            .await??;
        Ok(info.into())
    }

    /// Listen for state changes of `id`, replacing any previous listener for
    /// it. A resolved state is delivered immediately, ahead of any change.
    pub async fn subscribe<F>(self: &Arc<Self>, id: &JobId, listener: F) -> Result<SubscriptionHandle>
    where
        F: Fn(JobInfo) + Send + Sync + 'static,
    {
        let generation = self.next_generation.fetch_add(1, Ordering::SeqCst);
        let delivery = Arc::new(Delivery::new(Arc::new(listener)));

        let previous = self.subscriptions.write().await.remove(id);
        if let Some(previous) = &previous {
            previous.delivery.deactivate();
            tracing::debug!(job_id = %id, generation = previous.generation, "Replacing state subscription");
        }
        let previous_token = previous.map(|p| p.token);

        // Observe before reading the snapshot so no change falls between them.
        let job_id = id.clone();
        let feed = Arc::clone(&delivery);
        let token = self
            .coordinator
            .call(move |host| async move {
                if let Some(token) = previous_token {
                    host.unobserve(&job_id, token).await;
                }
                let observer: WorkInfoListener = {
                    let feed = Arc::clone(&feed);
                    Arc::new(move |info: WorkInfo| feed.on_change(info))
                };
                let token = match host.observe(&job_id, observer).await {
                    Ok(token) => token,
                    Err(err) => return Err(err),
                };
                match host.get_info(&job_id).await {
                    Ok(info) => {
                        feed.open(info.state.is_resolved().then_some(info));
                        Ok(token)
                    }
                    Err(err) => {
                        feed.deactivate();
                        host.unobserve(&job_id, token).await;
                        Err(err)
                    }
                }
            })
            .await??;

        let displaced = self.subscriptions.write().await.insert(
            id.clone(),
            StateSubscription {
                generation,
                token,
                delivery: Arc::clone(&delivery),
            },
        );
        if let Some(displaced) = displaced {
            // A concurrent subscribe for the same job finished first.
            displaced.delivery.deactivate();
            let job_id = id.clone();
            let stale = displaced.token;
            if let Err(e) = self
                .coordinator
                .post(move |host| async move { host.unobserve(&job_id, stale).await })
            {
                tracing::warn!(job_id = %id, error = %e, "Could not remove host observer");
            }
        }
        tracing::debug!(job_id = %id, generation, "Subscribed to job state");

        Ok(SubscriptionHandle {
            id: id.clone(),
            generation,
            delivery,
            done: AtomicBool::new(false),
            synchronizer: Arc::downgrade(self),
        })
    }

    /// Remove every listener, locally and from the host.
    pub async fn unsubscribe_all(&self) {
        let removed: Vec<(JobId, ObserverToken)> = {
            let mut subscriptions = self.subscriptions.write().await;
            subscriptions
                .drain()
                .map(|(id, subscription)| {
                    subscription.delivery.deactivate();
                    (id, subscription.token)
                })
                .collect()
        };
        if removed.is_empty() {
            return;
        }

        let count = removed.len();
        let result = self
            .coordinator
            .call(move |host| async move {
                for (id, token) in removed {
                    host.unobserve(&id, token).await;
                }
            })
            .await;
        match result {
            Ok(()) => tracing::debug!(count, "Removed all state subscriptions"),
            Err(e) => tracing::warn!(error = %e, "Could not remove host observers"),
        }
    }

    pub async fn subscription_count(&self) -> usize {
        self.subscriptions.read().await.len()
    }

    async fn remove(&self, id: &JobId, generation: u64) {
        let token = {
            let mut subscriptions = self.subscriptions.write().await;
            let current = subscriptions
                .get(id)
                .is_some_and(|s| s.generation == generation);
            if current {
                subscriptions.remove(id).map(|s| s.token)
            } else {
                None
            }
        };
        let Some(token) = token else {
            return;
        };

        let job_id = id.clone();
        if let Err(e) = self
            .coordinator
            .call(move |host| async move { host.unobserve(&job_id, token).await })
            .await
        {
            tracing::warn!(job_id = %id, error = %e, "Could not remove host observer");
        }
    }
}

/// Ends one subscription. Unsubscribing twice is a no-op, as is
/// unsubscribing after the subscription was replaced.
pub struct SubscriptionHandle {
    id: JobId,
    generation: u64,
    delivery: Arc<Delivery>,
    done: AtomicBool,
    synchronizer: Weak<StateSynchronizer>,
}

impl SubscriptionHandle {
    pub fn job_id(&self) -> &JobId {
        &self.id
    }

    /// Whether this subscription still delivers events.
    pub fn is_active(&self) -> bool {
        self.delivery.is_active()
    }

    pub async fn unsubscribe(&self) {
        self.delivery.deactivate();
        if self.done.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(synchronizer) = self.synchronizer.upgrade() {
            synchronizer.remove(&self.id, self.generation).await;
        }
    }
}

impl std::fmt::Debug for SubscriptionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriptionHandle")
            .field("id", &self.id)
            .field("generation", &self.generation)
            .field("active", &self.is_active())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use serde_json::json;

    use crate::error::{Error, SchedulerError};
    use tokio::sync::mpsc;

    use crate::host::{HostEvent, HostScheduler, InMemoryScheduler, WorkResult};
    use crate::worker::{ForegroundBehaviour, Notification, WorkerConfig, WorkerKind};

    struct Setup {
        sync: Arc<StateSynchronizer>,
        host: Arc<InMemoryScheduler>,
        job: JobId,
        _events: mpsc::UnboundedReceiver<HostEvent>,
    }

    async fn setup() -> Setup {
        let (host, events) = InMemoryScheduler::new();
        let (coordinator, _task) = HostCoordinator::spawn(host.clone());
        host.register_durable(
            &WorkerConfig {
                name: "upload".into(),
                kind: WorkerKind::Queue,
                timeout_seconds: 600,
                foreground_behaviour: ForegroundBehaviour::Foreground,
                repeat_interval_minutes: None,
                notification: Notification::default(),
            },
            None,
        )
        .await
        .unwrap();
        let job = host.enqueue("upload", None).await.unwrap();
        Setup {
            sync: Arc::new(StateSynchronizer::new(coordinator)),
            host,
            job,
            _events: events,
        }
    }

    fn recorder() -> (Arc<Mutex<Vec<JobInfo>>>, impl Fn(JobInfo) + Send + Sync + 'static) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        (seen, move |info: JobInfo| sink.lock().unwrap().push(info))
    }

    #[tokio::test]
    async fn info_decodes_value() {
        let Setup {
            sync,
            host,
            job,
            _events,
        } = setup().await;
        host.fire(&job).await.unwrap();
        host.report_result(&job, Some(r#"{"bytes":42}"#.into()), WorkResult::Success)
            .await;

        let info = sync.info(&job).await.unwrap();
        assert_eq!(info.state, WorkState::Succeeded);
        assert_eq!(info.attempt_count, 1);
        assert_eq!(info.value, json!({"bytes": 42}));
    }

    #[tokio::test]
    async fn info_unknown_job_not_found() {
        let Setup { sync, .. } = setup().await;
        let err = sync.info(&JobId::from("missing")).await.unwrap_err();
        assert!(matches!(err, Error::Scheduler(SchedulerError::NotFound { .. })));
    }

    #[tokio::test]
    async fn snapshot_precedes_live_updates() {
        let Setup {
            sync,
            host,
            job,
            _events,
        } = setup().await;
        let (seen, listener) = recorder();

        let handle = sync.subscribe(&job, listener).await.unwrap();
        host.fire(&job).await.unwrap();
        host.report_result(&job, Some("1".into()), WorkResult::Success)
            .await;

        let states: Vec<WorkState> = seen.lock().unwrap().iter().map(|i| i.state).collect();
        assert_eq!(
            states,
            vec![WorkState::Enqueued, WorkState::Running, WorkState::Succeeded]
        );
        assert_eq!(seen.lock().unwrap()[2].value, json!(1));
        assert!(handle.is_active());
    }

    #[tokio::test]
    async fn resubscribe_replaces_listener() {
        let Setup {
            sync,
            host,
            job,
            _events,
        } = setup().await;
        let (first_seen, first) = recorder();
        let (second_seen, second) = recorder();

        let first_handle = sync.subscribe(&job, first).await.unwrap();
        let _second_handle = sync.subscribe(&job, second).await.unwrap();
        assert!(!first_handle.is_active());
        assert_eq!(host.observer_count(&job).await, 1);
        assert_eq!(sync.subscription_count().await, 1);

        host.fire(&job).await.unwrap();
        assert_eq!(first_seen.lock().unwrap().len(), 1);
        assert_eq!(second_seen.lock().unwrap().len(), 2);

        // The stale handle must not tear down its replacement.
        first_handle.unsubscribe().await;
        assert_eq!(host.observer_count(&job).await, 1);
    }

    #[tokio::test]
    async fn unsubscribe_is_idempotent_and_stops_delivery() {
        let Setup {
            sync,
            host,
            job,
            _events,
        } = setup().await;
        let (seen, listener) = recorder();

        let handle = sync.subscribe(&job, listener).await.unwrap();
        handle.unsubscribe().await;
        handle.unsubscribe().await;
        assert_eq!(host.observer_count(&job).await, 0);
        assert_eq!(sync.subscription_count().await, 0);

        host.fire(&job).await.unwrap();
        assert_eq!(seen.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn subscribe_unknown_job_fails() {
        let Setup { sync, .. } = setup().await;
        let (seen, listener) = recorder();
        assert!(sync.subscribe(&JobId::from("missing"), listener).await.is_err());
        assert!(seen.lock().unwrap().is_empty());
        assert_eq!(sync.subscription_count().await, 0);
    }

    #[tokio::test]
    async fn unsubscribe_all_clears_host_observers() {
        let Setup {
            sync,
            host,
            job,
            _events,
        } = setup().await;
        let (_seen, listener) = recorder();
        let handle = sync.subscribe(&job, listener).await.unwrap();

        sync.unsubscribe_all().await;
        assert!(!handle.is_active());
        assert_eq!(host.observer_count(&job).await, 0);
        handle.unsubscribe().await;
    }

    #[test]
    fn job_info_passes_undecodable_value_through() {
        let info = JobInfo::from(WorkInfo {
            id: JobId::from("j-1"),
            worker_name: "upload".into(),
            state: WorkState::Failed,
            attempt_count: 2,
            value: Some("disk full".into()),
        });
        assert_eq!(info.value, json!("disk full"));
    }

    /// Moves the job to running right after each snapshot read.
    struct AdvancingHost {
        inner: Arc<InMemoryScheduler>,
    }

    #[async_trait::async_trait]
    impl HostScheduler for AdvancingHost {
        async fn register_durable(
            &self,
            config: &WorkerConfig,
            constraints: Option<&crate::worker::Constraints>,
        ) -> std::result::Result<Option<JobId>, SchedulerError> {
            self.inner.register_durable(config, constraints).await
        }

        async fn enqueue(
            &self,
            worker_name: &str,
            payload: Option<String>,
        ) -> std::result::Result<JobId, SchedulerError> {
            self.inner.enqueue(worker_name, payload).await
        }

        async fn cancel(&self, id: &JobId) -> std::result::Result<bool, SchedulerError> {
            self.inner.cancel(id).await
        }

        async fn report_result(&self, id: &JobId, value: Option<String>, result: WorkResult) {
            self.inner.report_result(id, value, result).await
        }

        async fn start_headless_execution(
            &self,
            descriptor: crate::host::HeadlessDescriptor,
        ) -> std::result::Result<(), SchedulerError> {
            self.inner.start_headless_execution(descriptor).await
        }

        async fn get_info(&self, id: &JobId) -> std::result::Result<WorkInfo, SchedulerError> {
            let info = self.inner.get_info(id).await?;
            self.inner.fire(id).await?;
            Ok(info)
        }

        async fn observe(
            &self,
            id: &JobId,
            listener: WorkInfoListener,
        ) -> std::result::Result<ObserverToken, SchedulerError> {
            self.inner.observe(id, listener).await
        }

        async fn unobserve(&self, id: &JobId, token: ObserverToken) {
            self.inner.unobserve(id, token).await
        }
    }

    #[tokio::test]
    async fn change_right_after_snapshot_read_is_delivered() {
        let Setup {
            host,
            job,
            _events,
            ..
        } = setup().await;
        let (coordinator, _task) = HostCoordinator::spawn(Arc::new(AdvancingHost {
            inner: host.clone(),
        }));
        let sync = Arc::new(StateSynchronizer::new(coordinator));
        let (seen, listener) = recorder();

        let _handle = sync.subscribe(&job, listener).await.unwrap();

        let seen = seen.lock().unwrap();
        let states: Vec<WorkState> = seen.iter().map(|i| i.state).collect();
        assert_eq!(states, vec![WorkState::Enqueued, WorkState::Running]);
        assert_eq!(seen[1].attempt_count, 1);
    }

    #[test]
    fn held_changes_covered_by_snapshot_are_dropped() {
        let (seen, listener) = recorder();
        let delivery = Delivery::new(Arc::new(listener));
        let info = |state, attempt_count| WorkInfo {
            id: JobId::from("j-1"),
            worker_name: "upload".into(),
            state,
            attempt_count,
            value: None,
        };

        delivery.on_change(info(WorkState::Running, 1));
        delivery.on_change(info(WorkState::Succeeded, 1));
        delivery.on_change(info(WorkState::Enqueued, 1));
        delivery.open(Some(info(WorkState::Succeeded, 1)));
        delivery.on_change(info(WorkState::Running, 2));

        let states: Vec<(WorkState, u32)> = seen
            .lock()
            .unwrap()
            .iter()
            .map(|i| (i.state, i.attempt_count))
            .collect();
        assert_eq!(
            states,
            vec![
                (WorkState::Succeeded, 1),
                (WorkState::Enqueued, 1),
                (WorkState::Running, 2),
            ]
        );
    }

    #[tokio::test]
    async fn subscribe_does_not_lock_out_readers_while_host_is_busy() {
        let Setup {
            sync,
            job,
            _events,
            ..
        } = setup().await;
        let release = Arc::new(tokio::sync::Notify::new());
        let busy = Arc::clone(&release);
        sync.coordinator
            .post(move |_host| async move { busy.notified().await })
            .unwrap();

        let (_seen, listener) = recorder();
        let pending = tokio::spawn({
            let sync = Arc::clone(&sync);
            let job = job.clone();
            async move { sync.subscribe(&job, listener).await.map(|_| ()) }
        });
        tokio::task::yield_now().await;

        let count = tokio::time::timeout(std::time::Duration::from_secs(1), sync.subscription_count())
            .await
            .unwrap();
        assert_eq!(count, 0);

        release.notify_one();
        pending.await.unwrap().unwrap();
        assert_eq!(sync.subscription_count().await, 1);
    }
}
