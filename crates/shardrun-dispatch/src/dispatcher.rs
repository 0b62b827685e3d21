//! Dispatch coordinator - fans tasks out to concurrent sessions.
//!
//! Every task gets its own spawned unit and a pre-assigned report slot, so
//! the report always has exactly one result per task, in input order, no
//! matter how units finish. Each attempt is bounded by the per-task timeout,
//! which in turn bounds the final join.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures_util::FutureExt;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use shardrun_core::{
    Attempt, Credentials, DispatchEvent, RunId, RunReport, Task, TaskError, TaskResult,
    TaskStatus,
};

use crate::resolver::{resolve_target, TargetResolver};
use crate::session::{SessionFailure, SessionResult, SessionRunner};

/// How a set of tasks is run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchPolicy {
    /// Upper bound on concurrently running tasks. `None` runs every task at
    /// once.
    pub max_parallel: Option<usize>,

    /// Bound on a single attempt (resolution plus session).
    pub task_timeout: Duration,

    /// Extra attempts allowed after a failed or timed-out attempt.
    pub retry_count: u32,

    /// Pause between attempts of the same task.
    pub retry_delay: Duration,

    /// Stop launching, and cancel in-flight tasks, after the first failure.
    pub fail_fast: bool,
}

impl Default for DispatchPolicy {
    fn default() -> Self {
        Self {
            max_parallel: None,
            task_timeout: Duration::from_secs(300),
            retry_count: 0,
            retry_delay: Duration::from_secs(1),
            fail_fast: false,
        }
    }
}

/// Runs tasks concurrently and aggregates their results.
pub struct Dispatcher {
    resolver: Arc<dyn TargetResolver>,
    runner: Arc<dyn SessionRunner>,
    credentials: Arc<Credentials>,
    policy: DispatchPolicy,
    events: Option<mpsc::Sender<DispatchEvent>>,
}

impl Dispatcher {
    /// Create a dispatcher with the default policy.
    pub fn new(
        resolver: Arc<dyn TargetResolver>,
        runner: Arc<dyn SessionRunner>,
        credentials: Credentials,
    ) -> Self {
        Self {
            resolver,
            runner,
            credentials: Arc::new(credentials),
            policy: DispatchPolicy::default(),
            events: None,
        }
    }

    /// Builder method to set the policy.
    pub fn with_policy(mut self, policy: DispatchPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Builder method to publish lifecycle events. Events are dropped when
    /// the channel is full or closed.
    pub fn with_events(mut self, events: mpsc::Sender<DispatchEvent>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn policy(&self) -> &DispatchPolicy {
        &self.policy
    }

    /// Run every task and wait for all of them.
    ///
    /// Raising `cancel` stops further launches and makes in-flight tasks
    /// abandon their sessions; the call still returns one result per task.
    pub async fn dispatch(&self, tasks: Vec<Task>, cancel: CancellationToken) -> RunReport {
        let run_id = RunId::generate();
        let started_at = Utc::now();
        let total = tasks.len();

        info!(
            run_id = %run_id,
            tasks = total,
            max_parallel = ?self.policy.max_parallel,
            timeout_secs = self.policy.task_timeout.as_secs(),
            retries = self.policy.retry_count,
            fail_fast = self.policy.fail_fast,
            "Dispatching tasks"
        );

        // Raised by the user, or by the first failure under fail-fast.
        let stop = cancel.child_token();
        let semaphore = self
            .policy
            .max_parallel
            .map(|n| Arc::new(Semaphore::new(n.max(1))));

        let mut slots: Vec<(Task, Option<JoinHandle<TaskResult>>)> = Vec::with_capacity(total);

        for task in tasks {
            if stop.is_cancelled() {
                slots.push((task, None));
                continue;
            }

            let permit = match &semaphore {
                Some(semaphore) => {
                    tokio::select! {
                        biased;
                        _ = stop.cancelled() => None,
                        permit = semaphore.clone().acquire_owned() => permit.ok(),
                    }
                }
                None => None,
            };
            if semaphore.is_some() && permit.is_none() {
                slots.push((task, None));
                continue;
            }

            let unit = Unit {
                run_id: run_id.clone(),
                resolver: self.resolver.clone(),
                runner: self.runner.clone(),
                credentials: self.credentials.clone(),
                policy: self.policy.clone(),
                events: self.events.clone(),
                cancel: cancel.clone(),
                stop: stop.clone(),
            };
            let unit_task = task.clone();
            let handle = tokio::spawn(async move {
                let _permit = permit;
                unit.run_guarded(unit_task).await
            });
            slots.push((task, Some(handle)));
        }

        let mut results = Vec::with_capacity(total);
        for (task, handle) in slots {
            let result = match handle {
                Some(handle) => match handle.await {
                    Ok(result) => result,
                    Err(e) => {
                        error!(host_id = %task.host.id, error = %e, "Dispatch unit crashed");
                        if self.policy.fail_fast {
                            stop.cancel();
                        }
                        let result = TaskResult::failed(
                            &task,
                            &TaskError::Internal(format!("dispatch unit crashed: {}", e)),
                            Vec::new(),
                        );
                        self.emit_finished(&run_id, &result);
                        result
                    }
                },
                None => {
                    let reason = if cancel.is_cancelled() {
                        "run cancelled before launch"
                    } else {
                        "not launched after an earlier failure"
                    };
                    debug!(host_id = %task.host.id, reason, "Task not launched");
                    let result =
                        TaskResult::failed(&task, &TaskError::Cancelled(reason.to_string()), Vec::new());
                    self.emit_finished(&run_id, &result);
                    result
                }
            };
            results.push(result);
        }

        let report = RunReport::new(run_id, started_at, Utc::now(), results);
        info!(run_id = %report.run_id, summary = %report.summary(), "Dispatch finished");
        report
    }

    fn emit_finished(&self, run_id: &RunId, result: &TaskResult) {
        if let Some(tx) = &self.events {
            let event = DispatchEvent::finished(
                run_id.clone(),
                result.host_id.clone(),
                result.index,
                result.status,
            );
            if tx.try_send(event).is_err() {
                debug!("Dropped dispatch event");
            }
        }
    }
}

/// Everything one spawned task needs.
struct Unit {
    run_id: RunId,
    resolver: Arc<dyn TargetResolver>,
    runner: Arc<dyn SessionRunner>,
    credentials: Arc<Credentials>,
    policy: DispatchPolicy,
    events: Option<mpsc::Sender<DispatchEvent>>,
    cancel: CancellationToken,
    stop: CancellationToken,
}

impl Unit {
    /// Run the task, turning a panic inside it into an internal failure.
    async fn run_guarded(self, task: Task) -> TaskResult {
        match AssertUnwindSafe(self.run(&task)).catch_unwind().await {
            Ok(result) => result,
            Err(panic) => {
                let message = panic_message(panic.as_ref());
                error!(host_id = %task.host.id, panic = %message, "Dispatch unit panicked");
                if self.policy.fail_fast {
                    info!(host_id = %task.host.id, "Fail-fast: stopping remaining tasks");
                    self.stop.cancel();
                }
                let result = TaskResult::failed(
                    &task,
                    &TaskError::Internal(format!("dispatch unit panicked: {}", message)),
                    Vec::new(),
                );
                self.emit_finished(&result);
                result
            }
        }
    }

    async fn run(&self, task: &Task) -> TaskResult {
        let max_attempts = self.policy.retry_count.saturating_add(1);
        let mut attempts = Vec::new();
        let mut number = 0u32;

        loop {
            number += 1;
            self.emit(DispatchEvent::dispatched(
                self.run_id.clone(),
                task.host.id.clone(),
                task.index,
                number,
            ));
            info!(host_id = %task.host.id, attempt = number, "Task dispatched");

            let started_at = Utc::now();
            let outcome: SessionResult = tokio::select! {
                biased;
                _ = self.stop.cancelled() => Err(self.cancelled_error().into()),
                res = tokio::time::timeout(self.policy.task_timeout, self.attempt(task)) => {
                    res.unwrap_or_else(|_| Err(TaskError::Timeout(self.policy.task_timeout).into()))
                }
            };
            let finished_at = Utc::now();

            let failure = match outcome {
                Ok(output) => {
                    attempts.push(Attempt {
                        number,
                        status: TaskStatus::Succeeded,
                        error: None,
                        started_at,
                        finished_at,
                    });
                    info!(host_id = %task.host.id, attempt = number, "Task succeeded");
                    let result = TaskResult::succeeded(
                        task,
                        output.stdout,
                        output.stderr,
                        output.exit_code,
                        attempts,
                    );
                    self.emit_finished(&result);
                    return result;
                }
                Err(failure) => failure,
            };

            let SessionFailure { error, output } = failure;
            attempts.push(Attempt {
                number,
                status: error.terminal_status(),
                error: Some(error.to_string()),
                started_at,
                finished_at,
            });
            self.emit(DispatchEvent::attempt_failed(
                self.run_id.clone(),
                task.host.id.clone(),
                task.index,
                number,
                &error.to_string(),
            ));

            if number < max_attempts && error.is_retryable() && self.wait_before_retry().await {
                warn!(
                    host_id = %task.host.id,
                    attempt = number,
                    error = %error,
                    "Attempt failed, retrying"
                );
                continue;
            }

            warn!(host_id = %task.host.id, attempts = number, error = %error, "Task did not succeed");
            if self.policy.fail_fast && error.is_retryable() {
                info!(host_id = %task.host.id, "Fail-fast: stopping remaining tasks");
                self.stop.cancel();
            }

            let result = TaskResult::failed(task, &error, attempts).with_output(
                output.stdout,
                output.stderr,
                output.exit_code,
            );
            self.emit_finished(&result);
            return result;
        }
    }

    /// Resolve the target, then run the session.
    async fn attempt(&self, task: &Task) -> SessionResult {
        let address = resolve_target(self.resolver.as_ref(), &task.host).await?;
        debug!(host_id = %task.host.id, address = %address, "Resolved target");
        self.runner
            .run(&task.host, &address, &task.command, &self.credentials)
            .await
    }

    /// Sleep out the retry delay. Returns false if the run was stopped
    /// meanwhile.
    async fn wait_before_retry(&self) -> bool {
        if self.stop.is_cancelled() {
            return false;
        }
        tokio::select! {
            biased;
            _ = self.stop.cancelled() => false,
            _ = tokio::time::sleep(self.policy.retry_delay) => true,
        }
    }

    fn cancelled_error(&self) -> TaskError {
        if self.cancel.is_cancelled() {
            TaskError::Cancelled("run cancelled".to_string())
        } else {
            TaskError::Cancelled("stopped after a failure on another host".to_string())
        }
    }

    fn emit(&self, event: DispatchEvent) {
        if let Some(tx) = &self.events {
            if tx.try_send(event).is_err() {
                debug!("Dropped dispatch event");
            }
        }
    }

    fn emit_finished(&self, result: &TaskResult) {
        self.emit(DispatchEvent::finished(
            self.run_id.clone(),
            result.host_id.clone(),
            result.index,
            result.status,
        ));
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
