//! Error types for the bindery orchestration core.
//!
//! Routing misses are deliberately absent from this taxonomy: a message
//! addressed to an offline agent is dropped and logged, not an error.

use std::path::PathBuf;
use thiserror::Error;

/// The main error type for bindery operations.
#[derive(Debug, Error)]
pub enum BinderyError {
    /// A message bus error.
    #[error("{0}")]
    Bus(#[from] BusError),

    /// A checkpoint store error.
    #[error("{0}")]
    Checkpoint(#[from] CheckpointError),

    /// A stage collaborator failed.
    #[error("{0}")]
    Stage(#[from] StageError),

    /// Serialization/deserialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors surfaced by the message bus.
///
/// Bus failures are always contained locally; these variants exist for
/// callers that talk to the bus directly (e.g., a transport adapter
/// decoding wire frames).
#[derive(Debug, Error)]
pub enum BusError {
    /// A channel could not accept a send because the peer is gone.
    #[error("Transport closed for connection '{client_id}'")]
    Transport {
        /// The connection whose channel dropped.
        client_id: String,
    },

    /// A wire frame could not be decoded into a typed message.
    #[error("Malformed message: {0}")]
    Serialization(String),

    /// An operation referenced a connection the bus does not know.
    #[error("Unknown connection '{client_id}'")]
    UnknownClient {
        /// The unrecognized client id.
        client_id: String,
    },
}

/// Errors surfaced by the checkpoint store.
#[derive(Debug, Error)]
pub enum CheckpointError {
    /// A checkpoint's checksum did not match its snapshot.
    #[error("Checksum mismatch for checkpoint '{id}'")]
    Integrity {
        /// The corrupted checkpoint id.
        id: String,
    },

    /// An import carried a version tag this build does not understand.
    #[error("Unknown state format version '{found}' (expected '{expected}')")]
    UnknownVersion {
        /// The version tag found in the file.
        found: String,
        /// The version tag this build writes.
        expected: String,
    },

    /// The advisory lock could not be acquired.
    #[error("State directory is locked by another process: {path}")]
    Locked {
        /// Path of the lock file.
        path: PathBuf,
    },

    /// Serialization of state or checkpoints failed.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A durable write or read failed.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Error describing a failed pipeline stage.
///
/// A collaborator returning a non-success report and a collaborator raising
/// are folded into the same error: the controller treats them identically.
#[derive(Debug, Clone, Error)]
#[error("Stage '{stage}' failed: {message}")]
pub struct StageError {
    /// The stage that failed.
    pub stage: String,
    /// What went wrong.
    pub message: String,
}

impl StageError {
    /// Creates a new stage error.
    #[must_use]
    pub fn new(stage: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            stage: stage.into(),
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_error_display() {
        let err = StageError::new("content", "generator crashed");
        assert_eq!(err.to_string(), "Stage 'content' failed: generator crashed");
    }

    #[test]
    fn test_bus_error_display() {
        let err = BusError::Transport {
            client_id: "client_a1b2".to_string(),
        };
        assert!(err.to_string().contains("client_a1b2"));
    }

    #[test]
    fn test_checkpoint_error_conversion() {
        let json_err = serde_json::from_str::<serde_json::Value>("{").unwrap_err();
        let err: CheckpointError = json_err.into();
        assert!(matches!(err, CheckpointError::Serialization(_)));

        let top: BinderyError = err.into();
        assert!(matches!(top, BinderyError::Checkpoint(_)));
    }
}
