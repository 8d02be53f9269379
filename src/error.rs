//! Error types for the background worker bridge.

/// Top-level error type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Invalid worker definition: {0}")]
    InvalidDefinition(#[from] DefinitionError),

    #[error("Scheduler error: {0}")]
    Scheduler(#[from] SchedulerError),

    #[error("Payload error: {0}")]
    Payload(#[from] PayloadError),

    #[error("Coordinator error: {0}")]
    Coordinator(#[from] CoordinatorError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
}

/// Reasons a worker definition is rejected before it reaches the scheduler.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DefinitionError {
    #[error("missing worker name")]
    MissingName,

    #[error("missing worker type for {name}")]
    MissingType { name: String },

    #[error("incompatible worker type: {type_name}")]
    UnknownType { type_name: String },

    #[error("periodic worker {name} has no repeat interval")]
    MissingRepeatInterval { name: String },

    #[error("worker {name} declares type {declared} but carries a {actual} workflow")]
    WorkflowMismatch {
        name: String,
        declared: String,
        actual: String,
    },
}

/// Errors surfaced by (or about) the host scheduler.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SchedulerError {
    #[error("worker not registered: {name}")]
    UnknownWorker { name: String },

    #[error("scheduler rejected request: {reason}")]
    Rejected { reason: String },

    #[error("work not found: {id}")]
    NotFound { id: String },
}

/// Payload encode/decode errors at the engine boundary.
#[derive(Debug, thiserror::Error)]
pub enum PayloadError {
    #[error("failed to encode payload: {0}")]
    Encode(#[source] serde_json::Error),

    #[error("failed to decode payload: {0}")]
    Decode(#[source] serde_json::Error),
}

/// Errors from the coordination executor.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CoordinatorError {
    #[error("coordinator has shut down")]
    Closed,

    #[error("coordinator dropped the call before replying")]
    Dropped,
}

/// Configuration-related errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("Failed to parse configuration: {0}")]
    ParseError(String),
}

/// Error raised by a workflow. Never escapes the execution bridge; it is
/// converted into a `failure` report carrying the message.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct WorkflowError {
    pub message: String,
}

impl WorkflowError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl From<String> for WorkflowError {
    fn from(message: String) -> Self {
        Self { message }
    }
}

impl From<&str> for WorkflowError {
    fn from(message: &str) -> Self {
        Self::new(message)
    }
}

/// Result type alias for the crate.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scheduler_errors_convert_into_top_level() {
        let err: Error = SchedulerError::UnknownWorker {
            name: "upload".into(),
        }
        .into();
        assert_eq!(
            err.to_string(),
            "Scheduler error: worker not registered: upload"
        );
    }

    #[test]
    fn workflow_error_displays_message_verbatim() {
        assert_eq!(WorkflowError::from("disk full").to_string(), "disk full");
    }

    #[test]
    fn unknown_type_matches_registration_wording() {
        let err = DefinitionError::UnknownType {
            type_name: "oneshot".into(),
        };
        assert_eq!(err.to_string(), "incompatible worker type: oneshot");
    }
}
