//! Core domain errors.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::status::TaskStatus;

/// Run-fatal configuration errors.
///
/// These are raised before any task is dispatched, so a run that fails with
/// one of them has touched no remote host.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Shard count must be at least one.
    #[error("Invalid shard count: {0} (must be >= 1)")]
    InvalidShardCount(usize),

    /// Branch name is empty or contains characters unsafe for a shell.
    #[error("Invalid branch name: '{0}'")]
    InvalidBranch(String),

    /// Execute mode needs a coordinator address.
    #[error("Coordinator address is required in execute mode")]
    MissingCoordinator,

    /// Coordinator address is not a bare host name or IPv4 address.
    #[error("Invalid coordinator address: '{0}' (expected a host name or IP without a port)")]
    InvalidCoordinator(String),

    /// Directory has fewer hosts than requested shards.
    #[error("Requested {requested} shards but only {available} hosts are configured")]
    NotEnoughHosts { requested: usize, available: usize },

    /// Two directory entries share an id.
    #[error("Duplicate host id in directory: {0}")]
    DuplicateHost(String),

    /// A shard has no private address to advertise to its peers.
    #[error("Host '{0}' has no private_address, required to build the peer list")]
    MissingPeerAddress(String),

    /// A shard's private address is not a bare host name or IPv4 address.
    #[error("Host '{host}' has an invalid private_address: '{address}' (expected a host name or IP without a port)")]
    InvalidPeerAddress { host: String, address: String },

    /// Derived shard ports would not fit in a port number.
    #[error("Base port {base_port} leaves no room for {shards} shard ports")]
    PortOutOfRange { base_port: u16, shards: usize },

    /// Shard index out of range for the peer list.
    #[error("Shard index {index} out of range for {total} shards")]
    ShardOutOfRange { index: usize, total: usize },

    /// Credentials are missing or unusable.
    #[error("Invalid credentials: {0}")]
    InvalidCredentials(String),

    /// Configuration file could not be read.
    #[error("Failed to read config '{path}': {message}")]
    Unreadable { path: String, message: String },

    /// Configuration file could not be parsed.
    #[error("Failed to parse config '{path}': {message}")]
    Parse { path: String, message: String },

    /// Any other invalid setting.
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Per-task errors. None of these abort the run; they end up in the task's
/// result.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TaskError {
    /// Could not determine a connectable address.
    #[error("Resolution failed: {0}")]
    Resolution(String),

    /// Transport or authentication failure.
    #[error("Connection failed: {0}")]
    Connection(String),

    /// The command ran but the remote shell reported failure.
    #[error("Command failed{}: {message}", .exit_code.map(|c| format!(" with exit code {}", c)).unwrap_or_default())]
    Execution {
        exit_code: Option<i32>,
        message: String,
    },

    /// No completion within the per-task bound.
    #[error("Timed out after {}s", .0.as_secs_f64())]
    Timeout(Duration),

    /// Abandoned because the run was cancelled.
    #[error("Cancelled: {0}")]
    Cancelled(String),

    /// The dispatch unit itself crashed.
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Machine-readable classification of a [`TaskError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Resolution,
    Connection,
    Execution,
    Timeout,
    Cancelled,
    Internal,
}

impl TaskError {
    /// Classification of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Resolution(_) => ErrorKind::Resolution,
            Self::Connection(_) => ErrorKind::Connection,
            Self::Execution { .. } => ErrorKind::Execution,
            Self::Timeout(_) => ErrorKind::Timeout,
            Self::Cancelled(_) => ErrorKind::Cancelled,
            Self::Internal(_) => ErrorKind::Internal,
        }
    }

    /// Terminal status a task ends in when this is its final error.
    pub fn terminal_status(&self) -> TaskStatus {
        match self {
            Self::Timeout(_) => TaskStatus::TimedOut,
            Self::Cancelled(_) => TaskStatus::Cancelled,
            _ => TaskStatus::Failed,
        }
    }

    /// Whether another attempt may be made after this error.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Self::Cancelled(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_execution_error_message() {
        let err = TaskError::Execution {
            exit_code: Some(2),
            message: "git: not found".to_string(),
        };
        assert_eq!(err.to_string(), "Command failed with exit code 2: git: not found");

        let err = TaskError::Execution {
            exit_code: None,
            message: "killed".to_string(),
        };
        assert_eq!(err.to_string(), "Command failed: killed");
    }

    #[test]
    fn test_terminal_status() {
        assert_eq!(
            TaskError::Timeout(Duration::from_secs(5)).terminal_status(),
            TaskStatus::TimedOut
        );
        assert_eq!(
            TaskError::Resolution("no ip".into()).terminal_status(),
            TaskStatus::Failed
        );
        assert_eq!(
            TaskError::Cancelled("stop".into()).terminal_status(),
            TaskStatus::Cancelled
        );
    }

    #[test]
    fn test_timeout_message() {
        let err = TaskError::Timeout(Duration::from_secs(5));
        assert_eq!(err.to_string(), "Timed out after 5s");
        assert_eq!(err.kind(), ErrorKind::Timeout);
    }

    #[test]
    fn test_cancelled_is_not_retryable() {
        assert!(!TaskError::Cancelled("x".into()).is_retryable());
        assert!(TaskError::Connection("refused".into()).is_retryable());
    }
}
