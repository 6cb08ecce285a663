//! Core error types.

use std::path::PathBuf;
use thiserror::Error;

/// Errors from building or driving a state machine.
#[derive(Debug, Error)]
pub enum MachineError {
    #[error("unknown state: #{index} is not part of this graph ({len} states)")]
    UnknownState { index: usize, len: usize },

    #[error("machine '{machine}' is closed")]
    Closed { machine: String },

    #[error("lane kind 'task' requires a running tokio runtime")]
    NoRuntime,

    #[error("failed to spawn lane thread: {0}")]
    Spawn(#[from] std::io::Error),
}

impl MachineError {
    /// Returns a short stable code for the error.
    pub fn error_code(&self) -> &'static str {
        match self {
            MachineError::UnknownState { .. } => "UNKNOWN_STATE",
            MachineError::Closed { .. } => "CLOSED",
            MachineError::NoRuntime => "NO_RUNTIME",
            MachineError::Spawn(_) => "SPAWN_FAILED",
        }
    }
}

/// Errors from receiving on a [`Subscription`](crate::Subscription).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum RecvError {
    /// The machine stopped and every value has been received.
    #[error("machine stopped")]
    Closed,

    /// The subscriber fell behind; this many values were dropped at this
    /// point in the stream.
    #[error("subscriber fell behind, {0} values dropped")]
    Lagged(u64),
}

/// Errors from [`Subscription::try_recv`](crate::Subscription::try_recv).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum TryRecvError {
    #[error("no value ready")]
    Empty,

    #[error("machine stopped")]
    Closed,

    #[error("subscriber fell behind, {0} values dropped")]
    Lagged(u64),
}

/// Errors from parsing and validating machine definitions.
#[derive(Debug, Error)]
pub enum DefinitionError {
    #[error("invalid machine definition: {reason}")]
    Invalid { reason: String },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("failed to read '{}': {}", .0.display(), .1)]
    Io(PathBuf, #[source] std::io::Error),
}

impl DefinitionError {
    pub(crate) fn invalid(reason: impl Into<String>) -> Self {
        DefinitionError::Invalid {
            reason: reason.into(),
        }
    }
}

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file '{}': {}", .0.display(), .1)]
    IoError(PathBuf, #[source] std::io::Error),

    #[error("failed to parse config file '{}': {}", .0.display(), .1)]
    ParseError(PathBuf, String),

    #[error("configuration validation failed: {0}")]
    ValidationError(String),
}
