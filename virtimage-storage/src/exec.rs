//! Process execution seam for the external image and volume tools.
//!
//! Every storage-affecting operation in this crate shells out to a tool
//! (`qemu-img`, `lvcreate`, `dd`, ...) through the [`Executor`] trait and
//! blocks until it finishes. Production code uses [`SystemExecutor`]; tests
//! substitute a scripted executor.

use std::io;
use std::process::Command;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, error, warn};

/// Captured output of a completed command.
#[derive(Debug, Clone, Default)]
pub struct CmdOutput {
    /// Captured standard output.
    pub stdout: String,
    /// Captured standard error.
    pub stderr: String,
}

/// Structured failure of an external tool invocation.
#[derive(Error, Debug)]
pub enum ExecError {
    /// The tool could not be spawned at all.
    #[error("failed to spawn `{command}`: {source}")]
    Spawn {
        /// Full command line that was attempted.
        command: String,
        /// Underlying OS error.
        source: io::Error,
    },

    /// The tool ran and exited with a nonzero status.
    #[error("`{command}` exited with status {status}: {stderr}")]
    Failed {
        /// Full command line that was run.
        command: String,
        /// Exit status reported by the OS (-1 if killed by signal).
        status: i32,
        /// Captured standard error.
        stderr: String,
    },
}

/// Executes external commands on behalf of images and snapshots.
pub trait Executor: Send + Sync {
    /// Run `argv` to completion and capture its output.
    ///
    /// With `run_as_root` set the command is executed through the configured
    /// privilege escalation helper. Returns [`ExecError::Failed`] on nonzero
    /// exit, carrying the exit status and captured stderr.
    fn execute(&self, argv: &[&str], run_as_root: bool) -> Result<CmdOutput, ExecError>;
}

/// Executor backed by `std::process::Command`.
pub struct SystemExecutor {
    /// Helper binary prefixed to privileged commands (e.g. "sudo").
    root_helper: Option<String>,
}

impl SystemExecutor {
    /// Create an executor that runs commands directly, without privilege
    /// escalation.
    pub fn new() -> Self {
        Self { root_helper: None }
    }

    /// Set the helper binary used for `run_as_root` commands.
    pub fn with_root_helper(mut self, helper: impl Into<String>) -> Self {
        self.root_helper = Some(helper.into());
        self
    }
}

impl Default for SystemExecutor {
    fn default() -> Self {
        Self::new()
    }
}

impl Executor for SystemExecutor {
    fn execute(&self, argv: &[&str], run_as_root: bool) -> Result<CmdOutput, ExecError> {
        let command_line = argv.join(" ");

        let mut command = match (run_as_root, &self.root_helper) {
            (true, Some(helper)) => {
                let mut cmd = Command::new(helper);
                cmd.args(argv);
                cmd
            }
            _ => {
                let (program, args) = argv.split_first().ok_or_else(|| ExecError::Spawn {
                    command: String::new(),
                    source: io::Error::new(io::ErrorKind::InvalidInput, "empty argv"),
                })?;
                let mut cmd = Command::new(program);
                cmd.args(args);
                cmd
            }
        };

        debug!(command = %command_line, run_as_root, "Executing command");

        let output = command.output().map_err(|source| ExecError::Spawn {
            command: command_line.clone(),
            source,
        })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
            error!(command = %command_line, status = ?output.status.code(), stderr = %stderr, "Command failed");
            return Err(ExecError::Failed {
                command: command_line,
                status: output.status.code().unwrap_or(-1),
                stderr,
            });
        }

        Ok(CmdOutput {
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

/// Blocking retry policy for flaky external tools.
///
/// Runs an operation up to `max_attempts` times, sleeping `backoff(attempt)`
/// between attempts. The final failure is returned unchanged.
#[derive(Clone)]
pub struct Retry {
    max_attempts: u32,
    backoff: fn(u32) -> Duration,
    sleeper: Arc<dyn Fn(Duration) + Send + Sync>,
}

impl Retry {
    /// Create a retry policy with a custom backoff curve.
    pub fn new(max_attempts: u32, backoff: fn(u32) -> Duration) -> Self {
        Self {
            max_attempts,
            backoff,
            sleeper: Arc::new(std::thread::sleep),
        }
    }

    /// Quadratic backoff: 1s after the first failure, 4s after the second.
    pub fn quadratic(max_attempts: u32) -> Self {
        Self::new(max_attempts, |attempt| {
            Duration::from_secs(u64::from(attempt) * u64::from(attempt))
        })
    }

    /// Replace the sleep function. Tests use this to simulate the clock.
    pub fn with_sleeper(mut self, sleeper: Arc<dyn Fn(Duration) + Send + Sync>) -> Self {
        self.sleeper = sleeper;
        self
    }

    /// Run `op` until it succeeds or the attempts are exhausted.
    pub fn run<T>(&self, mut op: impl FnMut() -> Result<T, ExecError>) -> Result<T, ExecError> {
        let mut attempt = 0u32;
        loop {
            match op() {
                Ok(value) => return Ok(value),
                Err(err) => {
                    attempt += 1;
                    if attempt >= self.max_attempts {
                        return Err(err);
                    }
                    let delay = (self.backoff)(attempt);
                    warn!(
                        attempt,
                        delay_secs = delay.as_secs(),
                        error = %err,
                        "Command failed, retrying"
                    );
                    (self.sleeper)(delay);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    fn recording_sleeper() -> (Arc<Mutex<Vec<Duration>>>, Arc<dyn Fn(Duration) + Send + Sync>) {
        let slept: Arc<Mutex<Vec<Duration>>> = Arc::new(Mutex::new(Vec::new()));
        let recorder = Arc::clone(&slept);
        let sleeper: Arc<dyn Fn(Duration) + Send + Sync> = Arc::new(move |delay| {
            recorder.lock().unwrap().push(delay);
        });
        (slept, sleeper)
    }

    #[test]
    fn test_retry_succeeds_after_two_failures() {
        let (slept, sleeper) = recording_sleeper();
        let retry = Retry::quadratic(3).with_sleeper(sleeper);

        let mut attempts = 0;
        let result = retry.run(|| {
            attempts += 1;
            if attempts < 3 {
                Err(ExecError::Failed {
                    command: "lvcreate".into(),
                    status: 5,
                    stderr: "busy".into(),
                })
            } else {
                Ok(())
            }
        });

        assert!(result.is_ok());
        assert_eq!(attempts, 3);

        let slept = slept.lock().unwrap();
        assert_eq!(*slept, vec![Duration::from_secs(1), Duration::from_secs(4)]);
        let total: Duration = slept.iter().sum();
        assert!(total >= Duration::from_secs(5));
    }

    #[test]
    fn test_retry_surfaces_third_error() {
        let (_, sleeper) = recording_sleeper();
        let retry = Retry::quadratic(3).with_sleeper(sleeper);

        let mut attempts = 0;
        let result: Result<(), ExecError> = retry.run(|| {
            attempts += 1;
            Err(ExecError::Failed {
                command: "lvcreate".into(),
                status: 5,
                stderr: format!("failure {attempts}"),
            })
        });

        assert_eq!(attempts, 3);
        match result {
            Err(ExecError::Failed { stderr, .. }) => assert_eq!(stderr, "failure 3"),
            other => panic!("expected Failed, got {other:?}"),
        }
    }

    #[test]
    fn test_system_executor_captures_stdout() {
        let executor = SystemExecutor::new();
        let output = executor
            .execute(&["sh", "-c", "echo hello"], false)
            .expect("command should succeed");
        assert_eq!(output.stdout.trim(), "hello");
    }

    #[test]
    fn test_system_executor_reports_status_and_stderr() {
        let executor = SystemExecutor::new();
        let err = executor
            .execute(&["sh", "-c", "echo oops >&2; exit 3"], false)
            .expect_err("command should fail");
        match err {
            ExecError::Failed { status, stderr, .. } => {
                assert_eq!(status, 3);
                assert!(stderr.contains("oops"));
            }
            other => panic!("expected Failed, got {other:?}"),
        }
    }

    #[test]
    fn test_system_executor_rejects_empty_argv() {
        let executor = SystemExecutor::new();
        assert!(executor.execute(&[], false).is_err());
    }
}
