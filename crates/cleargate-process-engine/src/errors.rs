//! Error types for the pluggable collaborator traits.

use thiserror::Error;

/// Errors from [`SubscriptionStore`](super::traits::SubscriptionStore).
#[derive(Debug, Error)]
pub enum SubscriptionStoreError {
    #[error("duplicate subscription: {owner} already subscribes to {event_type}")]
    Duplicate { owner: String, event_type: String },
    #[error("invalid subscription: {message}")]
    Invalid { message: String },
    #[error("subscription store error: {message}")]
    Store { message: String },
}

/// Errors from [`JobStore`](super::traits::JobStore).
#[derive(Debug, Error)]
pub enum JobStoreError {
    #[error("job not found: {id}")]
    NotFound { id: String },
    /// The job is leased by a different worker than the one reporting.
    #[error("job {id} is no longer leased by {owner}")]
    LeaseLost { id: String, owner: String },
    #[error("job store error: {message}")]
    Store { message: String },
}

/// Errors from [`EventDecoder`](super::traits::EventDecoder).
///
/// Malformed input is dropped, never retried.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("malformed event: {message}")]
    Malformed { message: String },
    #[error("event has no string field {field} identifying its type")]
    MissingEventKey { field: String },
    #[error("no event definition deployed for {event_type}")]
    UnknownEventType { event_type: String },
}

/// Errors from [`ProcessLifecycle`](super::traits::ProcessLifecycle).
#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error("process definition not found: {id}")]
    DefinitionNotFound { id: String },
    #[error("invalid process definition: {}", .errors.join("; "))]
    InvalidDefinition { errors: Vec<String> },
    #[error("process instance not found: {id}")]
    InstanceNotFound { id: String },
    #[error("execution not found: {id}")]
    ExecutionNotFound { id: String },
    #[error("execution {execution_id} cannot be advanced: {message}")]
    InvalidState {
        execution_id: String,
        message: String,
    },
    /// A running instance already carries this reference id.
    #[error("instance {existing_instance_id} already started for reference {reference_id}")]
    DuplicateReference {
        process_definition_id: String,
        reference_id: String,
        existing_instance_id: String,
    },
    #[error("activity {activity_id} failed: {message}")]
    Behavior { activity_id: String, message: String },
    #[error("advance failed: {message}")]
    Advance { message: String },
    #[error("subscription error: {0}")]
    Subscription(#[from] SubscriptionStoreError),
}

/// Errors from [`EventRegistry`](super::registry::EventRegistry).
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("invalid event definition {key}: {message}")]
    InvalidDefinition { key: String, message: String },
}

/// Failure reported by a [`JobHandler`](super::traits::JobHandler).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum JobFailure {
    /// Retrying cannot change the outcome; dead-letter immediately.
    #[error("permanent failure: {message}")]
    Permanent { message: String },
    /// Retry per the backoff policy.
    #[error("transient failure: {message}")]
    Transient { message: String },
}

impl JobFailure {
    pub fn is_permanent(&self) -> bool {
        matches!(self, Self::Permanent { .. })
    }

    pub fn message(&self) -> &str {
        match self {
            Self::Permanent { message } | Self::Transient { message } => message,
        }
    }
}

/// Failure reported by an [`ActivityBehavior`](super::traits::ActivityBehavior).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct BehaviorError {
    pub message: String,
}

impl BehaviorError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}
