pub mod builder;
pub mod parser;

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

use crate::config::SshAccessConfig;
use crate::executor::{CommandExecutor, CommandResult};
use crate::models::container::{ContainerInfo, ContainerRuntime};
use crate::models::error::SshAccessError;

pub use builder::CommandBuilder;
pub use parser::OutputParser;

/// The container runtime operations the SSH layer consumes
#[async_trait]
pub trait ContainerRuntimeApi: Send + Sync {
    /// Inspect a container by name; `None` when it does not exist
    async fn inspect(&self, name: &str) -> Result<Option<ContainerInfo>, SshAccessError>;

    /// Every container carrying the managed label, running or stopped
    async fn list_managed(&self) -> Result<Vec<ContainerInfo>, SshAccessError>;

    async fn start(&self, name: &str) -> Result<(), SshAccessError>;

    /// Run `argv` inside the container as `user`
    async fn exec(
        &self,
        name: &str,
        user: &str,
        argv: &[&str],
        stdin: Option<&str>,
    ) -> Result<CommandResult, SshAccessError>;

    /// Command a user can run to read the container's logs
    fn logs_hint(&self, name: &str) -> String;
}

/// Runtime client driving the docker/podman CLI
pub struct CliRuntime {
    runtime: ContainerRuntime,
    executor: Arc<dyn CommandExecutor>,
    managed_label: String,
    port_label: String,
    timeout: Duration,
}

impl CliRuntime {
    pub fn new(config: &SshAccessConfig, executor: Arc<dyn CommandExecutor>) -> Self {
        Self {
            runtime: config.runtime,
            executor,
            managed_label: config.managed_label.clone(),
            port_label: config.port_label.clone(),
            timeout: Duration::from_secs(30),
        }
    }

    fn is_missing_container(stderr: &str) -> bool {
        let lower = stderr.to_lowercase();
        lower.contains("no such container") || lower.contains("no such object")
    }
}

#[async_trait]
impl ContainerRuntimeApi for CliRuntime {
    async fn inspect(&self, name: &str) -> Result<Option<ContainerInfo>, SshAccessError> {
        let command = CommandBuilder::inspect_containers(self.runtime, &[name]);
        let result = self.executor.execute_with_timeout(&command, self.timeout).await?;

        if !result.success() {
            if Self::is_missing_container(&result.stderr) {
                return Ok(None);
            }
            return Err(SshAccessError::CommandExecutionFailed {
                command: command.display(),
                exit_code: result.exit_code,
                stderr: result.stderr,
            });
        }

        let mut containers = OutputParser::parse_inspect(&result.stdout, &self.port_label)?;
        Ok(containers.pop())
    }

    async fn list_managed(&self) -> Result<Vec<ContainerInfo>, SshAccessError> {
        let command = CommandBuilder::list_labeled_ids(self.runtime, &self.managed_label);
        let result = self.executor.execute_with_timeout(&command, self.timeout).await?;
        if !result.success() {
            return Err(SshAccessError::CommandExecutionFailed {
                command: command.display(),
                exit_code: result.exit_code,
                stderr: result.stderr,
            });
        }

        let ids = OutputParser::parse_id_list(&result.stdout);
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let id_refs: Vec<&str> = ids.iter().map(|s| s.as_str()).collect();
        let inspect_cmd = CommandBuilder::inspect_containers(self.runtime, &id_refs);
        let inspect_result = self
            .executor
            .execute_with_timeout(&inspect_cmd, self.timeout)
            .await?;

        // A container removed between ps and inspect makes inspect exit non-zero
        // while still printing the others.
        if !inspect_result.success() && inspect_result.stdout.trim().is_empty() {
            return Err(SshAccessError::CommandExecutionFailed {
                command: inspect_cmd.display(),
                exit_code: inspect_result.exit_code,
                stderr: inspect_result.stderr,
            });
        }

        OutputParser::parse_inspect(&inspect_result.stdout, &self.port_label)
    }

    async fn start(&self, name: &str) -> Result<(), SshAccessError> {
        let command = CommandBuilder::start_container(self.runtime, name);
        let result = self.executor.execute_with_timeout(&command, self.timeout).await?;
        if result.success() {
            tracing::info!("Started container {}", name);
            Ok(())
        } else {
            Err(SshAccessError::ContainerStartFailed {
                name: name.to_string(),
                reason: result.combined_output().trim().to_string(),
            })
        }
    }

    async fn exec(
        &self,
        name: &str,
        user: &str,
        argv: &[&str],
        stdin: Option<&str>,
    ) -> Result<CommandResult, SshAccessError> {
        let mut command = CommandBuilder::exec_in_container(self.runtime, name, user, argv);
        if let Some(data) = stdin {
            command = command.stdin(data);
        }
        self.executor.execute_with_timeout(&command, self.timeout).await
    }

    fn logs_hint(&self, name: &str) -> String {
        CommandBuilder::container_logs_hint(self.runtime, name)
    }
}
