//! Task lifecycle status.

use serde::{Deserialize, Serialize};

/// Status of a dispatched task.
///
/// `Pending -> Dispatched -> {Succeeded, Failed, TimedOut, Cancelled}`.
/// A failed or timed-out task may go back to `Pending` while retry budget
/// remains.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    /// Task created but not yet launched.
    #[default]
    Pending,
    /// Task launched; resolution or session in progress.
    Dispatched,
    /// Command completed with exit status zero.
    Succeeded,
    /// Resolution, connection, or execution failed.
    Failed,
    /// No completion within the per-task timeout.
    TimedOut,
    /// Abandoned or never launched because the run was stopped.
    Cancelled,
}

impl TaskStatus {
    /// Returns true if the task is in a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Succeeded | Self::Failed | Self::TimedOut | Self::Cancelled
        )
    }

    /// Returns true if the task may be retried from this state.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Failed | Self::TimedOut)
    }

    /// Short label used in text output.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Dispatched => "RUNNING",
            Self::Succeeded => "OK",
            Self::Failed => "FAIL",
            Self::TimedOut => "TIMEOUT",
            Self::Cancelled => "CANCELLED",
        }
    }
}
