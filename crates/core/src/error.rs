//! Core error types for kairos operations.
//!
//! All errors are explicit, typed, and recoverable.

use std::path::PathBuf;

use thiserror::Error;

/// Core error type for kairos operations.
#[derive(Debug, Error)]
pub enum Error {
    // Configuration errors
    #[error("failed to read file '{path}': {reason}")]
    FileReadFailed { path: PathBuf, reason: String },

    #[error("TOML parse error: {reason}")]
    TomlParseFailed { reason: String },

    #[error("invalid configuration: {reason}")]
    InvalidConfig { reason: String },

    // Storage errors
    #[error("store connection failed: {reason}")]
    ConnectionFailed { reason: String },

    #[error("store is not open")]
    StoreNotOpen,

    #[error("query failed: {reason}")]
    QueryFailed { reason: String },

    #[error("serialization failed: {reason}")]
    SerializationFailed { reason: String },

    #[error("invalid record: {reason}")]
    InvalidRecord { reason: String },

    #[error("event not found: {id}")]
    EventNotFound { id: String },

    // Lifecycle errors
    #[error("queue is not populated: missing {component}")]
    NotPopulated { component: String },

    #[error("{component} is already started")]
    AlreadyStarted { component: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Create a file read error.
    pub fn file_read_failed(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Self::FileReadFailed {
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// Create a TOML parse error.
    pub fn toml_parse_failed(reason: impl Into<String>) -> Self {
        Self::TomlParseFailed {
            reason: reason.into(),
        }
    }

    /// Create an invalid configuration error.
    pub fn invalid_config(reason: impl Into<String>) -> Self {
        Self::InvalidConfig {
            reason: reason.into(),
        }
    }

    /// Create a connection error.
    pub fn connection_failed(reason: impl Into<String>) -> Self {
        Self::ConnectionFailed {
            reason: reason.into(),
        }
    }

    /// Create a query error.
    pub fn query_failed(reason: impl Into<String>) -> Self {
        Self::QueryFailed {
            reason: reason.into(),
        }
    }

    /// Create a serialization error.
    pub fn serialization_failed(reason: impl Into<String>) -> Self {
        Self::SerializationFailed {
            reason: reason.into(),
        }
    }

    /// Create an invalid record error.
    pub fn invalid_record(reason: impl Into<String>) -> Self {
        Self::InvalidRecord {
            reason: reason.into(),
        }
    }

    /// Create an event-not-found error.
    pub fn event_not_found(id: impl Into<String>) -> Self {
        Self::EventNotFound { id: id.into() }
    }

    /// Create a not-populated error naming the missing component.
    pub fn not_populated(component: impl Into<String>) -> Self {
        Self::NotPopulated {
            component: component.into(),
        }
    }

    /// Create an already-started error.
    pub fn already_started(component: impl Into<String>) -> Self {
        Self::AlreadyStarted {
            component: component.into(),
        }
    }

    /// Whether the failure is transient and the operation may succeed on a later cycle.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::ConnectionFailed { .. } | Self::QueryFailed { .. } | Self::Io(_)
        )
    }
}
