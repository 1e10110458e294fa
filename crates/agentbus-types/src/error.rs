//! Shared error types for agentbus.

use thiserror::Error;

/// Top-level error type for structural and local failures.
///
/// Every mutating operation of the core reports `Ok` (success) or one of
/// these variants (failure). Prior state is always preserved on failure.
#[derive(Error, Debug)]
pub enum BusError {
    /// An IO, service, argument or reply with this name already exists.
    #[error("{kind} '{name}' already exists")]
    AlreadyExists {
        /// What kind of element collided (input, output, service, ...).
        kind: String,
        /// The duplicated name.
        name: String,
    },

    /// The named element does not exist.
    #[error("{kind} '{name}' not found")]
    NotFound {
        /// What kind of element was looked up.
        kind: String,
        /// The missing name.
        name: String,
    },

    /// A name is empty or otherwise unusable.
    #[error("Invalid name: {0}")]
    InvalidName(String),

    /// A value cannot be converted to the declared type.
    #[error("Invalid type: {0}")]
    InvalidType(String),

    /// A constrained write failed validation.
    #[error("Constraint violation on '{name}': {reason}")]
    ConstraintViolation {
        /// The IO that rejected the value.
        name: String,
        /// Why the value was rejected.
        reason: String,
    },

    /// A constraint expression could not be parsed or does not fit the IO type.
    #[error("Invalid constraint: {0}")]
    InvalidConstraint(String),

    /// The agent is frozen and ignores input updates.
    #[error("Agent '{0}' is frozen")]
    Frozen(String),

    /// A callback is already attached to this service.
    #[error("Service '{0}' already has a callback")]
    CallbackAlreadyRegistered(String),

    /// Service arguments do not match the declared signature.
    #[error("Invalid arguments for service '{service}': {reason}")]
    InvalidArguments {
        /// The called service.
        service: String,
        /// Which argument failed and why.
        reason: String,
    },

    /// No local or remote agent matches the given name or uuid.
    #[error("Agent not found: {0}")]
    AgentNotFound(String),

    /// The operation is not allowed in the current lifecycle state.
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Security configuration is unusable.
    #[error("Security error: {0}")]
    Security(String),

    /// A local network configuration error (bad endpoint, unknown device).
    #[error("Network error: {0}")]
    Network(String),

    /// The worker queue is saturated.
    #[error("Publication queue is full ({0} pending)")]
    QueueFull(usize),

    /// JSON encoding or decoding failed.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// An I/O error occurred (definition or mapping files).
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// The kernel is shutting down.
    #[error("Shutdown in progress")]
    ShuttingDown,
}

impl BusError {
    /// Shorthand for [`BusError::NotFound`].
    pub fn not_found(kind: impl Into<String>, name: impl Into<String>) -> Self {
        Self::NotFound {
            kind: kind.into(),
            name: name.into(),
        }
    }

    /// Shorthand for [`BusError::AlreadyExists`].
    pub fn already_exists(kind: impl Into<String>, name: impl Into<String>) -> Self {
        Self::AlreadyExists {
            kind: kind.into(),
            name: name.into(),
        }
    }
}

impl From<serde_json::Error> for BusError {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}

/// Alias for Result with BusError.
pub type BusResult<T> = Result<T, BusError>;
