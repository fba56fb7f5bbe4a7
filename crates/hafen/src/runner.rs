//! Subprocess execution boundary for the external tools.
//!
//! Every firewall and system tool (`nft`, `iptables`, `ip`, `machinectl`,
//! `systemctl`, `sysctl`) is reached through [`ToolRunner`], so the engine
//! can be exercised against a fake in tests and every real invocation gets
//! the same timeout bound.

use std::time::Duration;

use async_trait::async_trait;
use hafen_common::{HafenError, HafenResult};
use tokio::process::Command;

/// Default bound on a single tool invocation.
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Captured result of a tool invocation that ran to completion.
#[derive(Debug, Clone)]
pub struct ToolOutput {
    /// Whether the tool exited with status zero.
    pub success: bool,
    /// Raw exit status, -1 when terminated by a signal.
    pub status: i32,
    /// Captured standard output.
    pub stdout: String,
    /// Captured standard error.
    pub stderr: String,
}

/// Runs external tools with bounded execution time.
#[async_trait]
pub trait ToolRunner: Send + Sync {
    /// Run a command to completion and capture its output.
    ///
    /// A non-zero exit is not an error at this level; callers that probe
    /// for rule existence (`iptables -C`) inspect [`ToolOutput::success`].
    /// Spawn failures and timeouts are errors.
    async fn run(&self, program: &str, args: &[&str]) -> HafenResult<ToolOutput>;

    /// Run a command and require a zero exit status.
    async fn run_ok(&self, program: &str, args: &[&str]) -> HafenResult<ToolOutput> {
        let output = self.run(program, args).await?;
        if output.success {
            Ok(output)
        } else {
            Err(HafenError::Tool {
                command: command_line(program, args),
                status: output.status,
                stderr: output.stderr.trim().to_string(),
            })
        }
    }
}

/// Render a program and its arguments as one loggable command line.
#[must_use]
pub fn command_line(program: &str, args: &[&str]) -> String {
    let mut line = String::from(program);
    for arg in args {
        line.push(' ');
        line.push_str(arg);
    }
    line
}

/// [`ToolRunner`] backed by real host processes.
#[derive(Debug, Clone)]
pub struct HostRunner {
    timeout: Duration,
}

impl HostRunner {
    /// Create a runner with the default timeout.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            timeout: DEFAULT_TIMEOUT,
        }
    }

    /// Create a runner with a custom timeout bound.
    #[must_use]
    pub const fn with_timeout(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl Default for HostRunner {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ToolRunner for HostRunner {
    async fn run(&self, program: &str, args: &[&str]) -> HafenResult<ToolOutput> {
        tracing::debug!(command = %command_line(program, args), "Running tool");

        let future = Command::new(program).args(args).output();
        let output = match tokio::time::timeout(self.timeout, future).await {
            Ok(result) => result?,
            Err(_) => {
                return Err(HafenError::ToolTimeout {
                    command: command_line(program, args),
                    seconds: self.timeout.as_secs(),
                });
            }
        };

        let result = ToolOutput {
            success: output.status.success(),
            status: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        };

        if !result.success {
            tracing::debug!(
                command = %command_line(program, args),
                status = result.status,
                stderr = %result.stderr.trim(),
                "Tool exited non-zero"
            );
        }

        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_line_joins_program_and_args() {
        assert_eq!(
            command_line("nft", &["-f", "/var/lib/hafen/ruleset.nft"]),
            "nft -f /var/lib/hafen/ruleset.nft"
        );
        assert_eq!(command_line("true", &[]), "true");
    }

    #[tokio::test]
    async fn captures_stdout_and_status() {
        let runner = HostRunner::new();
        let out = runner.run("echo", &["hello"]).await.unwrap();
        assert!(out.success);
        assert_eq!(out.status, 0);
        assert_eq!(out.stdout.trim(), "hello");
    }

    #[tokio::test]
    async fn nonzero_exit_is_not_an_error() {
        let runner = HostRunner::new();
        let out = runner.run("false", &[]).await.unwrap();
        assert!(!out.success);
    }

    #[tokio::test]
    async fn run_ok_maps_failure_to_tool_error() {
        let runner = HostRunner::new();
        let err = runner.run_ok("false", &[]).await.unwrap_err();
        assert!(matches!(err, HafenError::Tool { .. }));
    }

    #[tokio::test]
    async fn slow_command_times_out() {
        let runner = HostRunner::with_timeout(Duration::from_millis(50));
        let err = runner.run("sleep", &["5"]).await.unwrap_err();
        assert!(matches!(err, HafenError::ToolTimeout { .. }));
    }
}
