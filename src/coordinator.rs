//! Single-consumer executor for host scheduler calls.
//!
//! The host scheduler is thread-affine: every call must run on one
//! coordination context, one at a time, in submission order. Callers from any
//! task submit a closure and await its output.

use std::future::Future;
use std::sync::Arc;

use futures::future::BoxFuture;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::error::CoordinatorError;
use crate::host::HostScheduler;

type HostCall = Box<dyn FnOnce(Arc<dyn HostScheduler>) -> BoxFuture<'static, ()> + Send>;

/// Handle for submitting calls to the coordination loop.
#[derive(Clone)]
pub struct HostCoordinator {
    tx: mpsc::UnboundedSender<HostCall>,
}

impl HostCoordinator {
    /// Start the coordination loop. It runs until every handle is dropped.
    pub fn spawn(host: Arc<dyn HostScheduler>) -> (Self, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::unbounded_channel::<HostCall>();
        let handle = tokio::spawn(async move {
            while let Some(call) = rx.recv().await {
                call(Arc::clone(&host)).await;
            }
            tracing::debug!("Host coordinator stopped");
        });
        (Self { tx }, handle)
    }

    /// Run `f` on the coordination loop and wait for its output.
    pub async fn call<F, Fut, T>(&self, f: F) -> Result<T, CoordinatorError>
    where
        F: FnOnce(Arc<dyn HostScheduler>) -> Fut + Send + 'static,
        Fut: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        let (reply_tx, reply_rx) = oneshot::channel();
        let call: HostCall = Box::new(move |host| {
            Box::pin(async move {
                let _ = reply_tx.send(f(host).await);
            })
        });
        self.tx.send(call).map_err(|_| CoordinatorError::Closed)?;
        reply_rx.await.map_err(|_| CoordinatorError::Dropped)
    }

    /// Queue `f` without waiting. Later calls still observe its effects.
    pub fn post<F, Fut>(&self, f: F) -> Result<(), CoordinatorError>
    where
        F: FnOnce(Arc<dyn HostScheduler>) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let call: HostCall = Box::new(move |host| Box::pin(f(host)));
        self.tx.send(call).map_err(|_| CoordinatorError::Closed)
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}
