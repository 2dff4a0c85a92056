//! Error types for the coordination domain

use thiserror::Error;

/// Core error type for coordination operations
#[derive(Error, Debug, Clone, PartialEq)]
pub enum Error {
    #[error("Duplicate id: {entity_type} with id {id} already exists")]
    DuplicateId { entity_type: String, id: String },

    #[error("Entity not found: {entity_type} with id {id}")]
    NotFound { entity_type: String, id: String },

    #[error("Resource already locked: {key} is held by {holder}")]
    AlreadyLocked { key: String, holder: String },

    #[error("Not owner: {caller} does not own {resource} (owner: {owner})")]
    NotOwner {
        resource: String,
        caller: String,
        owner: String,
    },

    #[error("Operation timeout: {operation} exceeded {timeout_seconds}s")]
    Timeout {
        operation: String,
        timeout_seconds: u64,
    },

    #[error("Queue full: {pending} pending items (limit {limit})")]
    QueueFull { pending: usize, limit: usize },

    #[error("State transition error: {message}")]
    StateTransition { message: String },

    #[error("Validation error: {message}")]
    Validation { message: String },

    #[error("Configuration error: {message}")]
    Configuration { message: String },

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Storage error: {operation} - {message}")]
    Storage { operation: String, message: String },
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

impl From<anyhow::Error> for Error {
    fn from(err: anyhow::Error) -> Self {
        Error::Storage {
            operation: "internal".to_string(),
            message: err.to_string(),
        }
    }
}

impl Error {
    /// Create a duplicate id error
    pub fn duplicate_id<S1: Into<String>, S2: Into<String>>(entity_type: S1, id: S2) -> Self {
        Self::DuplicateId {
            entity_type: entity_type.into(),
            id: id.into(),
        }
    }

    /// Create a not found error for a specific entity type and ID
    pub fn not_found<S1: Into<String>, S2: Into<String>>(entity_type: S1, id: S2) -> Self {
        Self::NotFound {
            entity_type: entity_type.into(),
            id: id.into(),
        }
    }

    /// Create an already-locked error
    pub fn already_locked<S1: Into<String>, S2: Into<String>>(key: S1, holder: S2) -> Self {
        Self::AlreadyLocked {
            key: key.into(),
            holder: holder.into(),
        }
    }

    /// Create a not-owner error
    pub fn not_owner<S1, S2, S3>(resource: S1, caller: S2, owner: S3) -> Self
    where
        S1: Into<String>,
        S2: Into<String>,
        S3: Into<String>,
    {
        Self::NotOwner {
            resource: resource.into(),
            caller: caller.into(),
            owner: owner.into(),
        }
    }

    /// Create a timeout error
    pub fn timeout<S: Into<String>>(operation: S, timeout_seconds: u64) -> Self {
        Self::Timeout {
            operation: operation.into(),
            timeout_seconds,
        }
    }

    /// Create a state transition error
    pub fn state_transition<S: Into<String>>(message: S) -> Self {
        Self::StateTransition {
            message: message.into(),
        }
    }

    /// Create a validation error with a formatted message
    pub fn validation<S: Into<String>>(message: S) -> Self {
        Self::Validation {
            message: message.into(),
        }
    }

    /// Create a configuration error
    pub fn configuration<S: Into<String>>(message: S) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Create a storage error for a failed backend operation
    pub fn storage<S1: Into<String>, S2: ToString>(operation: S1, err: S2) -> Self {
        Self::Storage {
            operation: operation.into(),
            message: err.to_string(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound { .. })
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Error::Timeout { .. })
    }

    /// Contention is an expected outcome: someone else won, move on.
    pub fn is_contention(&self) -> bool {
        matches!(self, Error::AlreadyLocked { .. })
    }

    /// Check if this error is recoverable (caller can retry later)
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Error::AlreadyLocked { .. }
                | Error::Timeout { .. }
                | Error::QueueFull { .. }
                | Error::Storage { .. }
        )
    }

    /// Get the error category for logging
    pub fn category(&self) -> &'static str {
        match self {
            Error::DuplicateId { .. } => "duplicate_id",
            Error::NotFound { .. } => "not_found",
            Error::AlreadyLocked { .. } => "already_locked",
            Error::NotOwner { .. } => "not_owner",
            Error::Timeout { .. } => "timeout",
            Error::QueueFull { .. } => "queue_full",
            Error::StateTransition { .. } => "state_transition",
            Error::Validation { .. } => "validation",
            Error::Configuration { .. } => "configuration",
            Error::Serialization(_) => "serialization",
            Error::Storage { .. } => "storage",
        }
    }
}

/// Convenience result type for core operations
pub type Result<T> = std::result::Result<T, Error>;
