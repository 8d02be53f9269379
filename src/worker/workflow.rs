//! Work logic traits implemented on the engine side.

use std::future::Future;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::WorkflowError;
use crate::host::WorkResult;

/// What a queue workflow declares about its attempt.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkflowOutcome {
    pub result: WorkResult,
    pub value: Value,
}

impl WorkflowOutcome {
    pub fn success(value: Value) -> Self {
        Self {
            result: WorkResult::Success,
            value,
        }
    }

    pub fn failure(value: Value) -> Self {
        Self {
            result: WorkResult::Failure,
            value,
        }
    }

    pub fn retry() -> Self {
        Self {
            result: WorkResult::Retry,
            value: Value::Null,
        }
    }
}

/// Payload-driven, one-shot work.
#[async_trait]
pub trait QueueWorkflow: Send + Sync {
    async fn run(&self, payload: Value) -> Result<WorkflowOutcome, WorkflowError>;
}

/// Recurring work without a payload.
#[async_trait]
pub trait PeriodicWorkflow: Send + Sync {
    async fn run(&self) -> Result<(), WorkflowError>;
}

/// Queue workflow backed by an async closure.
pub struct QueueFn<F>(F);

/// Wrap an async closure as a [`QueueWorkflow`].
pub fn queue_fn<F, Fut>(f: F) -> QueueFn<F>
where
    F: Fn(Value) -> Fut + Send + Sync,
    Fut: Future<Output = Result<WorkflowOutcome, WorkflowError>> + Send,
{
    QueueFn(f)
}

#[async_trait]
impl<F, Fut> QueueWorkflow for QueueFn<F>
where
    F: Fn(Value) -> Fut + Send + Sync,
    Fut: Future<Output = Result<WorkflowOutcome, WorkflowError>> + Send,
{
    async fn run(&self, payload: Value) -> Result<WorkflowOutcome, WorkflowError> {
        (self.0)(payload).await
    }
}

/// Periodic workflow backed by an async closure.
pub struct PeriodicFn<F>(F);

/// Wrap an async closure as a [`PeriodicWorkflow`].
pub fn periodic_fn<F, Fut>(f: F) -> PeriodicFn<F>
where
    F: Fn() -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), WorkflowError>> + Send,
{
    PeriodicFn(f)
}

#[async_trait]
impl<F, Fut> PeriodicWorkflow for PeriodicFn<F>
where
    F: Fn() -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), WorkflowError>> + Send,
{
    async fn run(&self) -> Result<(), WorkflowError> {
        (self.0)().await
    }
}
