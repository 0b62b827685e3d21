//! Remote sessions: one connection, one command.
//!
//! [`SshSessionRunner`] drives the system OpenSSH client as a subprocess,
//! capturing its output through pipes. Dropping the
//! future returned by [`SessionRunner::run`] kills the local `ssh` process,
//! which is how timeouts and cancellation abandon a session.

use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, info, warn};

use shardrun_core::{shell_quote, Credentials, Host, TaskError};

/// Exit status OpenSSH reserves for its own failures.
const SSH_FAILURE_STATUS: i32 = 255;

/// Captured output of a session.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: Option<i32>,
}

/// A failed session, with whatever output was captured before it failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionFailure {
    pub error: TaskError,
    pub output: SessionOutput,
}

impl From<TaskError> for SessionFailure {
    fn from(error: TaskError) -> Self {
        Self {
            error,
            output: SessionOutput::default(),
        }
    }
}

pub type SessionResult = Result<SessionOutput, SessionFailure>;

/// Runs one command on one host.
///
/// Implementations report every failure through the returned result; they
/// must not panic on connection, authentication, or command errors.
#[async_trait]
pub trait SessionRunner: Send + Sync {
    async fn run(
        &self,
        host: &Host,
        address: &str,
        command: &str,
        credentials: &Credentials,
    ) -> SessionResult;
}

/// Options for the `ssh` subprocess.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SshOptions {
    /// Path to the ssh binary.
    pub program: String,

    /// Remote port.
    pub port: u16,

    /// Connection establishment bound, in seconds.
    pub connect_timeout_secs: u64,

    /// Extra `-o` options, e.g. `ServerAliveInterval=15`.
    pub extra_options: Vec<String>,
}

impl Default for SshOptions {
    fn default() -> Self {
        Self {
            program: "ssh".to_string(),
            port: 22,
            connect_timeout_secs: 10,
            extra_options: Vec::new(),
        }
    }
}

/// Session runner backed by the OpenSSH client.
#[derive(Debug, Clone, Default)]
pub struct SshSessionRunner {
    options: SshOptions,
}

impl SshSessionRunner {
    pub fn new(options: SshOptions) -> Self {
        Self { options }
    }

    /// Argument vector for one invocation.
    ///
    /// The command is wrapped in `/bin/bash -c '...'` so the remote login
    /// shell does not reinterpret pipes and redirects.
    pub fn build_args(&self, address: &str, command: &str, credentials: &Credentials) -> Vec<String> {
        let mut args = vec![
            "-p".to_string(),
            self.options.port.to_string(),
            "-o".to_string(),
            "BatchMode=yes".to_string(),
            "-o".to_string(),
            "StrictHostKeyChecking=accept-new".to_string(),
            "-o".to_string(),
            format!("ConnectTimeout={}", self.options.connect_timeout_secs),
            "-i".to_string(),
            credentials.identity_file.display().to_string(),
        ];
        for option in &self.options.extra_options {
            args.push("-o".to_string());
            args.push(option.clone());
        }
        args.push(format!("{}@{}", credentials.user, address));
        args.push("--".to_string());
        args.push(format!("/bin/bash -c {}", shell_quote(command)));
        args
    }
}

#[async_trait]
impl SessionRunner for SshSessionRunner {
    async fn run(
        &self,
        host: &Host,
        address: &str,
        command: &str,
        credentials: &Credentials,
    ) -> SessionResult {
        let mut cmd = Command::new(&self.options.program);
        cmd.args(self.build_args(address, command, credentials))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        debug!(host_id = %host.id, address = %address, "Spawning ssh");

        let child = cmd.spawn().map_err(|e| {
            warn!(host_id = %host.id, error = %e, "Failed to spawn ssh");
            TaskError::Connection(format!("failed to spawn '{}': {}", self.options.program, e))
        })?;

        debug!(host_id = %host.id, address = %address, "ssh started, waiting for exit");

        // Reads stdout and stderr concurrently until both close.
        let output = child.wait_with_output().await.map_err(|e| {
            TaskError::Connection(format!("lost ssh process for '{}': {}", host.id, e))
        })?;

        let exit_code = output.status.code();
        info!(host_id = %host.id, exit_code = ?exit_code, "Session finished");

        classify(SessionOutput {
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            exit_code,
        })
    }
}

/// Map an exit status to success, a connection failure (ssh's own status),
/// or an execution failure (the remote command's status).
fn classify(output: SessionOutput) -> SessionResult {
    let detail = last_line(&output.stderr);
    let error = match output.exit_code {
        Some(0) => return Ok(output),
        Some(SSH_FAILURE_STATUS) => TaskError::Connection(
            detail.unwrap_or_else(|| format!("ssh exited with status {}", SSH_FAILURE_STATUS)),
        ),
        Some(code) => TaskError::Execution {
            exit_code: Some(code),
            message: detail.unwrap_or_else(|| "remote command reported failure".to_string()),
        },
        None => TaskError::Execution {
            exit_code: None,
            message: "ssh terminated by signal".to_string(),
        },
    };
    Err(SessionFailure { error, output })
}

fn last_line(text: &str) -> Option<String> {
    text.lines()
        .rev()
        .map(str::trim)
        .find(|l| !l.is_empty())
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn creds() -> Credentials {
        Credentials::new("deploy", "/keys/id_ed25519")
    }

    fn output(code: Option<i32>, stderr: &str) -> SessionOutput {
        SessionOutput {
            stdout: "partial".to_string(),
            stderr: stderr.to_string(),
            exit_code: code,
        }
    }

    #[test]
    fn test_build_args() {
        let runner = SshSessionRunner::new(SshOptions {
            port: 2222,
            extra_options: vec!["ServerAliveInterval=15".to_string()],
            ..SshOptions::default()
        });
        let args = runner.build_args("34.1.2.3", "cd repo && git pull", &creds());

        assert_eq!(&args[..2], &["-p".to_string(), "2222".to_string()]);
        assert!(args.contains(&"BatchMode=yes".to_string()));
        assert!(args.contains(&"ConnectTimeout=10".to_string()));
        assert!(args.contains(&"/keys/id_ed25519".to_string()));
        assert!(args.contains(&"ServerAliveInterval=15".to_string()));
        assert!(args.contains(&"deploy@34.1.2.3".to_string()));
        assert_eq!(args.last().unwrap(), "/bin/bash -c 'cd repo && git pull'");
    }

    #[test]
    fn test_command_with_quotes_is_escaped() {
        let runner = SshSessionRunner::default();
        let args = runner.build_args("h", "echo 'hi'", &creds());
        assert_eq!(args.last().unwrap(), r"/bin/bash -c 'echo '\''hi'\'''");
    }

    #[test]
    fn test_classify_success() {
        let out = classify(output(Some(0), "")).unwrap();
        assert_eq!(out.stdout, "partial");
    }

    #[test]
    fn test_classify_ssh_failure_is_connection_error() {
        let failure = classify(output(
            Some(255),
            "Warning: something\ndeploy@34.1.2.3: Permission denied (publickey).\n",
        ))
        .unwrap_err();
        assert_eq!(
            failure.error,
            TaskError::Connection("deploy@34.1.2.3: Permission denied (publickey).".to_string())
        );
    }

    #[test]
    fn test_classify_remote_failure_keeps_output() {
        let failure = classify(output(Some(1), "error: pathspec 'nope' did not match\n")).unwrap_err();
        assert!(matches!(
            failure.error,
            TaskError::Execution { exit_code: Some(1), ref message } if message.contains("pathspec")
        ));
        assert_eq!(failure.output.stdout, "partial");
        assert_eq!(failure.output.exit_code, Some(1));
    }

    #[test]
    fn test_classify_signal() {
        let failure = classify(output(None, "")).unwrap_err();
        assert!(matches!(failure.error, TaskError::Execution { exit_code: None, .. }));
    }

    #[tokio::test]
    async fn test_missing_ssh_binary_is_connection_error() {
        let runner = SshSessionRunner::new(SshOptions {
            program: "/nonexistent/shardrun/ssh".to_string(),
            ..SshOptions::default()
        });
        let failure = runner
            .run(&Host::new("vm-1"), "127.0.0.1", "true", &creds())
            .await
            .unwrap_err();
        assert!(matches!(failure.error, TaskError::Connection(msg) if msg.contains("failed to spawn")));
    }
}
