//! Command execution with timeouts.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use crate::command::Command;
use crate::error::{DnsError, Result};

/// Default per-command time limit.
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(30);

/// Runs [`Command`]s against the platform.
///
/// Implementations return the command's standard output on success and a
/// classified [`DnsError`] on failure. They do not enforce timeouts
/// themselves: [`Executor`] drops the returned future when the limit is
/// exceeded, so implementations must release the underlying process when
/// dropped.
pub trait CommandRunner: Send + Sync + 'static {
    /// Runs `command` to completion.
    fn run(&self, command: &Command) -> impl Future<Output = Result<String>> + Send;
}

/// Production runner that executes commands through Windows PowerShell.
#[derive(Debug, Clone)]
pub struct PowerShell {
    program: String,
}

impl PowerShell {
    /// Uses `powershell` from `PATH`.
    #[must_use]
    pub fn new() -> Self {
        Self {
            program: "powershell".to_string(),
        }
    }

    /// Uses a specific PowerShell binary (e.g. `pwsh`).
    #[must_use]
    pub fn with_program(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }
}

impl Default for PowerShell {
    fn default() -> Self {
        Self::new()
    }
}

impl CommandRunner for PowerShell {
    async fn run(&self, command: &Command) -> Result<String> {
        let script = command.script();
        let output = tokio::process::Command::new(&self.program)
            .args([
                "-NoProfile",
                "-NonInteractive",
                "-ExecutionPolicy",
                "Bypass",
                "-Command",
                &script,
            ])
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| DnsError::from_io(&e, &self.program))?;

        if output.status.success() {
            Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr);
            tracing::debug!(
                command = command.name(),
                code = ?output.status.code(),
                stderr = %stderr.trim(),
                "PowerShell command failed"
            );
            Err(DnsError::from_diagnostic(&stderr))
        }
    }
}

/// Shared handle to a [`CommandRunner`] with a default time limit.
pub struct Executor<R> {
    runner: Arc<R>,
    timeout: Duration,
}

impl<R> Clone for Executor<R> {
    fn clone(&self) -> Self {
        Self {
            runner: Arc::clone(&self.runner),
            timeout: self.timeout,
        }
    }
}

impl<R: CommandRunner> Executor<R> {
    /// Wraps `runner` with [`DEFAULT_COMMAND_TIMEOUT`].
    pub fn new(runner: R) -> Self {
        Self::from_arc(Arc::new(runner), DEFAULT_COMMAND_TIMEOUT)
    }

    /// Wraps an already shared runner.
    pub const fn from_arc(runner: Arc<R>, timeout: Duration) -> Self {
        Self { runner, timeout }
    }

    /// Overrides the default time limit.
    #[must_use]
    pub const fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// The default time limit.
    pub const fn timeout(&self) -> Duration {
        self.timeout
    }

    /// The underlying runner.
    pub fn runner(&self) -> &R {
        &self.runner
    }

    /// Runs `command` under the default time limit.
    pub async fn execute(&self, command: &Command) -> Result<String> {
        self.execute_within(command, self.timeout).await
    }

    /// Runs `command`, abandoning (and killing) it after `limit`.
    pub async fn execute_within(&self, command: &Command, limit: Duration) -> Result<String> {
        tracing::trace!(command = command.name(), "Executing platform command");
        match tokio::time::timeout(limit, self.runner.run(command)).await {
            Ok(result) => result,
            Err(_) => {
                tracing::warn!(
                    command = command.name(),
                    limit_ms = u64::try_from(limit.as_millis()).unwrap_or(u64::MAX),
                    "Platform command timed out"
                );
                Err(DnsError::Timeout { after: limit })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    struct Sleepy(Duration);

    impl CommandRunner for Sleepy {
        async fn run(&self, _command: &Command) -> Result<String> {
            tokio::time::sleep(self.0).await;
            Ok("done".to_string())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn completes_within_limit() {
        let exec = Executor::new(Sleepy(Duration::from_secs(1)));
        assert_eq!(exec.execute(&Command::FlushCache).await.unwrap(), "done");
    }

    #[tokio::test(start_paused = true)]
    async fn times_out() {
        let exec = Executor::new(Sleepy(Duration::from_secs(60))).with_timeout(Duration::from_secs(5));
        let err = exec.execute(&Command::FlushCache).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Timeout);

        let err = exec
            .execute_within(&Command::FlushCache, Duration::from_millis(10))
            .await
            .unwrap_err();
        assert!(matches!(err, DnsError::Timeout { after } if after == Duration::from_millis(10)));
    }
}
