use async_trait::async_trait;
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::time::timeout;

use super::{CommandExecutor, CommandResult, CommandSpec};
use crate::models::error::SshAccessError;

/// Executor for local subprocesses
pub struct LocalExecutor;

impl LocalExecutor {
    pub fn new() -> Self {
        Self
    }

    /// Get the PATH environment variable with common binary locations
    pub(crate) fn get_path_env() -> String {
        let base_path = std::env::var("PATH").unwrap_or_default();

        let additional_paths: &[&str] = if cfg!(target_os = "macos") {
            // Homebrew and Docker Desktop install outside the default PATH of GUI-launched shells
            &[
                "/opt/homebrew/bin",
                "/usr/local/bin",
                "/Applications/Docker.app/Contents/Resources/bin",
                "/usr/bin",
                "/bin",
                "/usr/sbin",
                "/sbin",
            ]
        } else {
            &["/usr/local/bin", "/usr/bin", "/bin", "/usr/sbin", "/sbin"]
        };

        if base_path.is_empty() {
            additional_paths.join(":")
        } else {
            format!("{}:{}", additional_paths.join(":"), base_path)
        }
    }

    async fn execute_internal(&self, command: &CommandSpec) -> Result<CommandResult, SshAccessError> {
        let start = Instant::now();

        let mut child = Command::new(&command.program)
            .args(&command.args)
            .env("PATH", Self::get_path_env())
            .stdin(if command.stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| SshAccessError::CommandExecutionFailed {
                command: command.display(),
                exit_code: -1,
                stderr: e.to_string(),
            })?;

        if let (Some(data), Some(mut stdin)) = (command.stdin.as_ref(), child.stdin.take()) {
            stdin
                .write_all(data.as_bytes())
                .await
                .map_err(|e| SshAccessError::CommandExecutionFailed {
                    command: command.display(),
                    exit_code: -1,
                    stderr: format!("failed to write stdin: {}", e),
                })?;
            // stdin dropped here so the child sees EOF
        }

        let output = child
            .wait_with_output()
            .await
            .map_err(|e| SshAccessError::CommandExecutionFailed {
                command: command.display(),
                exit_code: -1,
                stderr: e.to_string(),
            })?;

        let execution_time_ms = start.elapsed().as_millis() as u64;

        Ok(CommandResult {
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            exit_code: output.status.code().unwrap_or(-1),
            execution_time_ms,
        })
    }
}

impl Default for LocalExecutor {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CommandExecutor for LocalExecutor {
    async fn execute(&self, command: &CommandSpec) -> Result<CommandResult, SshAccessError> {
        self.execute_internal(command).await
    }

    async fn execute_with_timeout(
        &self,
        command: &CommandSpec,
        timeout_duration: Duration,
    ) -> Result<CommandResult, SshAccessError> {
        match timeout(timeout_duration, self.execute_internal(command)).await {
            Ok(result) => result,
            Err(_) => Err(SshAccessError::NetworkTimeout(format!(
                "Command timed out after {}ms: {}",
                timeout_duration.as_millis(),
                command.display()
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_local_executor_echo() {
        let executor = LocalExecutor::new();
        let result = executor
            .execute(&CommandSpec::new("echo").arg("hello"))
            .await
            .unwrap();
        assert!(result.success());
        assert!(result.stdout.trim().contains("hello"));
    }

    #[tokio::test]
    async fn test_local_executor_failure() {
        let executor = LocalExecutor::new();
        let result = executor
            .execute(&CommandSpec::new("sh").args(["-c", "exit 3"]))
            .await
            .unwrap();
        assert!(!result.success());
        assert_eq!(result.exit_code, 3);
    }

    #[tokio::test]
    async fn test_local_executor_stdin() {
        let executor = LocalExecutor::new();
        let result = executor
            .execute(&CommandSpec::new("cat").stdin("piped"))
            .await
            .unwrap();
        assert_eq!(result.stdout, "piped");
    }

    #[tokio::test]
    async fn test_local_executor_missing_binary() {
        let executor = LocalExecutor::new();
        let err = executor
            .execute(&CommandSpec::new("definitely-not-a-real-binary-xyz"))
            .await
            .unwrap_err();
        assert!(matches!(err, SshAccessError::CommandExecutionFailed { .. }));
    }

    #[tokio::test]
    async fn test_local_executor_timeout() {
        let executor = LocalExecutor::new();
        let err = executor
            .execute_with_timeout(
                &CommandSpec::new("sleep").arg("5"),
                Duration::from_millis(50),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, SshAccessError::NetworkTimeout(_)));
    }
}
