//! Error types for the resync orchestrator
//!
//! Errors fall into a small taxonomy: setup failures, signals that never
//! showed up in a process log, control-plane failures (transient or
//! terminal), member lookup failures and assertion failures. Only
//! transient control-plane errors are ever recovered locally.

use std::fmt;
use std::io;
use std::time::Duration;

use thiserror::Error;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Classification of a control-plane failure
///
/// Produced at the client boundary so callers never inspect error text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// A member is not healthy yet (e.g. it has just joined)
    Unhealthy,
    /// Leadership moved while the request was in flight
    LeadershipChanged,
    /// The endpoint could not be reached at all
    Unavailable,
    /// Anything else
    Other,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorKind::Unhealthy => write!(f, "unhealthy"),
            ErrorKind::LeadershipChanged => write!(f, "leadership changed"),
            ErrorKind::Unavailable => write!(f, "unavailable"),
            ErrorKind::Other => write!(f, "other"),
        }
    }
}

/// A failed control-plane request
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{kind} cluster error: {message}")]
pub struct ClusterError {
    pub kind: ErrorKind,
    pub message: String,
}

impl ClusterError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

/// Main error type
#[derive(Error, Debug)]
pub enum Error {
    // === Setup Errors ===
    #[error("Failed to spawn '{command}': {error}")]
    Spawn { command: String, error: String },

    #[error("Binary '{name}' not found. Set it under [binaries] in the config or add it to PATH")]
    BinaryNotFound { name: String },

    #[error("Failed to stop process '{process}': {error}")]
    Stop { process: String, error: String },

    // === Synchronization Errors ===
    #[error("Timed out after {}s waiting for {pattern} in output of '{process}'", .waited.as_secs())]
    PatternTimeout {
        pattern: String,
        process: String,
        waited: Duration,
    },

    #[error("Process '{process}' exited before {pattern} appeared in its output")]
    ProcessExited { process: String, pattern: String },

    #[error("Cancelled while {0}")]
    Cancelled(String),

    // === Cluster Errors ===
    #[error(transparent)]
    Cluster(#[from] ClusterError),

    #[error("No member advertises client URL '{endpoint}'")]
    MemberNotFound { endpoint: String },

    #[error("{operation} still failing after {attempts} attempts: {last}")]
    RetryExhausted {
        operation: String,
        attempts: u32,
        last: Box<Error>,
    },

    // === Assertion Errors ===
    #[error("Assertion failed: expected {expected}, got {actual}")]
    Assertion { expected: String, actual: String },

    #[error("Scenario '{name}' failed at step {step}")]
    ScenarioFailed { name: String, step: String },

    // === Configuration Errors ===
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid configuration file: {0}")]
    ConfigParse(String),

    // === IO Errors ===
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Failed to read file '{path}': {error}")]
    FileRead { path: String, error: String },

    // === Serialization Errors ===
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Create a spawn error for a command
    pub fn spawn(command: &str, error: impl fmt::Display) -> Self {
        Self::Spawn {
            command: command.to_string(),
            error: error.to_string(),
        }
    }

    /// Create an assertion error from anything debug-printable
    pub fn assertion<E: fmt::Debug, A: fmt::Debug>(expected: &E, actual: &A) -> Self {
        Self::Assertion {
            expected: format!("{:?}", expected),
            actual: format!("{:?}", actual),
        }
    }

    /// Kind of the underlying control-plane failure, if this is one
    pub fn cluster_kind(&self) -> Option<ErrorKind> {
        match self {
            Error::Cluster(e) => Some(e.kind),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cluster_kind() {
        let err: Error = ClusterError::new(ErrorKind::Unhealthy, "etcdserver: unhealthy cluster").into();
        assert_eq!(err.cluster_kind(), Some(ErrorKind::Unhealthy));

        let err = Error::MemberNotFound {
            endpoint: "http://localhost:12379".to_string(),
        };
        assert_eq!(err.cluster_kind(), None);
    }

    #[test]
    fn test_timeout_message_names_pattern_and_process() {
        let err = Error::PatternTimeout {
            pattern: "\"ready to serve client requests\"".to_string(),
            process: "node1".to_string(),
            waited: Duration::from_secs(30),
        };
        let msg = err.to_string();
        assert!(msg.contains("ready to serve client requests"));
        assert!(msg.contains("node1"));
        assert!(msg.contains("30s"));
    }
}
