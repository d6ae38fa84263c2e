//! Error types for each boundary of the server core.

use std::io;

/// Key-value store failures.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("store connection error: {0}")]
    Connection(String),

    #[error("store backend error in {operation}: {message}")]
    Backend {
        operation: &'static str,
        message: String,
    },

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

impl StoreError {
    pub fn backend(operation: &'static str, message: impl ToString) -> Self {
        Self::Backend {
            operation,
            message: message.to_string(),
        }
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        StoreError::Serialization(e.to_string())
    }
}

/// Failures reported by collaborator subsystems (map, combat, movement, AI).
#[derive(Debug, thiserror::Error)]
pub enum SubsystemError {
    #[error("{subsystem} failed: {reason}")]
    Failed {
        subsystem: &'static str,
        reason: String,
    },

    #[error("{0} used before initialize()")]
    NotInitialized(&'static str),

    #[error("{0} queue is full")]
    QueueFull(&'static str),

    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

impl SubsystemError {
    pub fn failed(subsystem: &'static str, reason: impl ToString) -> Self {
        Self::Failed {
            subsystem,
            reason: reason.to_string(),
        }
    }
}

/// Failures of session operations that must persist or propagate.
#[derive(Debug, thiserror::Error)]
pub enum PlayerError {
    #[error("failed to persist session {player_id}: {source}")]
    Persist {
        player_id: String,
        #[source]
        source: StoreError,
    },

    #[error("failed to serialize session {player_id}: {source}")]
    Serialization {
        player_id: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Orchestrator failures. Everything here is fatal at boot.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("server is already running")]
    AlreadyRunning,

    #[error("store unavailable: {0}")]
    Store(#[from] StoreError),

    #[error("failed to initialize {subsystem}: {source}")]
    Initialize {
        subsystem: &'static str,
        #[source]
        source: SubsystemError,
    },

    #[error("failed to bind listener on {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: io::Error,
    },
}
