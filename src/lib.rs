//! Background Worker: dispatch and state sync between a durable job
//! scheduler and an async work engine.

pub mod app_state;
pub mod background;
pub mod bridge;
pub mod config;
pub mod coordinator;
pub mod dispatch;
pub mod error;
pub mod host;
pub mod logging;
pub mod payload;
pub mod state_sync;
pub mod worker;

pub use app_state::AppState;
pub use background::BackgroundWorker;
pub use config::BackgroundWorkerConfig;
pub use error::{Error, Result};
pub use host::{HostScheduler, JobId, WorkResult, WorkState};
pub use state_sync::{JobInfo, SubscriptionHandle};
pub use worker::{WorkerDefinition, WorkflowOutcome};
