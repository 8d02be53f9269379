//! Worker definitions and the registry that keeps them live.
//!
//! - `definition`: declared and normalized worker configuration
//! - `workflow`: the work logic traits and closure adapters
//! - `registry`: one live definition per name, registered durably

pub mod definition;
pub mod registry;
pub mod workflow;

pub use definition::{
    Constraints, ForegroundBehaviour, NetworkRequirement, Notification, RegisteredWorker,
    WorkerConfig, WorkerDefinition, WorkerDescriptor, WorkerKind, Workflow,
};
pub use registry::{RegistrationHandle, WorkerRegistry};
pub use workflow::{
    PeriodicFn, PeriodicWorkflow, QueueFn, QueueWorkflow, WorkflowOutcome, periodic_fn, queue_fn,
};
