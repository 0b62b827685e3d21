//! Tasks, their results, and the run report.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{ErrorKind, Host, HostId, RunId, RunMode, TaskError, TaskStatus};

/// One unit of dispatch: a command bound for a host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Task {
    /// Dispatch slot; the task's result lands at this report index.
    pub index: usize,

    /// Target host.
    pub host: Host,

    /// Shell command to run on the host.
    pub command: String,
}

impl Task {
    pub fn new(index: usize, host: Host, command: impl Into<String>) -> Self {
        Self {
            index,
            host,
            command: command.into(),
        }
    }
}

/// Record of a single attempt at a task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attempt {
    /// 1-based attempt number.
    pub number: u32,

    /// Outcome of this attempt.
    pub status: TaskStatus,

    /// Error message if the attempt did not succeed.
    pub error: Option<String>,

    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

/// Final outcome of a task. Built once, never mutated afterwards.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskResult {
    /// Host the task targeted.
    pub host_id: HostId,

    /// Dispatch slot.
    pub index: usize,

    /// Terminal status.
    pub status: TaskStatus,

    /// True only for `Succeeded`.
    pub succeeded: bool,

    /// Captured standard output of the last attempt.
    pub stdout: String,

    /// Captured standard error of the last attempt.
    pub stderr: String,

    /// Remote exit status, when the command ran to completion.
    pub exit_code: Option<i32>,

    /// Error message if the task did not succeed.
    pub error: Option<String>,

    /// Classification of `error`.
    pub error_kind: Option<ErrorKind>,

    /// Every attempt made, in order.
    pub attempts: Vec<Attempt>,
}

impl TaskResult {
    /// A task whose last attempt succeeded.
    pub fn succeeded(
        task: &Task,
        stdout: String,
        stderr: String,
        exit_code: Option<i32>,
        attempts: Vec<Attempt>,
    ) -> Self {
        Self {
            host_id: task.host.id.clone(),
            index: task.index,
            status: TaskStatus::Succeeded,
            succeeded: true,
            stdout,
            stderr,
            exit_code,
            error: None,
            error_kind: None,
            attempts,
        }
    }

    /// A task that ended with an error.
    pub fn failed(task: &Task, error: &TaskError, attempts: Vec<Attempt>) -> Self {
        Self {
            host_id: task.host.id.clone(),
            index: task.index,
            status: error.terminal_status(),
            succeeded: false,
            stdout: String::new(),
            stderr: String::new(),
            exit_code: None,
            error: Some(error.to_string()),
            error_kind: Some(error.kind()),
            attempts,
        }
    }

    /// Attach the output of a command that ran but failed.
    pub fn with_output(mut self, stdout: String, stderr: String, exit_code: Option<i32>) -> Self {
        self.stdout = stdout;
        self.stderr = stderr;
        self.exit_code = exit_code;
        self
    }

    pub fn attempt_count(&self) -> usize {
        self.attempts.len()
    }
}

/// Counts of task outcomes in a report.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunSummary {
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub timed_out: usize,
    pub cancelled: usize,
}

impl RunSummary {
    /// Tasks that did not succeed.
    pub fn unsuccessful(&self) -> usize {
        self.total - self.succeeded
    }

    pub fn all_succeeded(&self) -> bool {
        self.total == self.succeeded
    }
}

impl std::fmt::Display for RunSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "total={} succeeded={} failed={} timed_out={} cancelled={}",
            self.total, self.succeeded, self.failed, self.timed_out, self.cancelled
        )
    }
}

/// Ordered results of a dispatch run. Result order is dispatch order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunReport {
    pub run_id: RunId,
    pub mode: Option<RunMode>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub results: Vec<TaskResult>,
}

impl RunReport {
    pub fn new(
        run_id: RunId,
        started_at: DateTime<Utc>,
        finished_at: DateTime<Utc>,
        results: Vec<TaskResult>,
    ) -> Self {
        Self {
            run_id,
            mode: None,
            started_at,
            finished_at,
            results,
        }
    }

    /// Builder method to tag the report with its run mode.
    pub fn with_mode(mut self, mode: RunMode) -> Self {
        self.mode = Some(mode);
        self
    }

    pub fn len(&self) -> usize {
        self.results.len()
    }

    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }

    /// Tally outcomes.
    pub fn summary(&self) -> RunSummary {
        let mut summary = RunSummary {
            total: self.results.len(),
            ..RunSummary::default()
        };
        for result in &self.results {
            match result.status {
                TaskStatus::Succeeded => summary.succeeded += 1,
                TaskStatus::TimedOut => summary.timed_out += 1,
                TaskStatus::Cancelled => summary.cancelled += 1,
                _ => summary.failed += 1,
            }
        }
        summary
    }

    pub fn all_succeeded(&self) -> bool {
        self.results.iter().all(|r| r.succeeded)
    }
}
