use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error, Clone, Serialize, Deserialize)]
pub enum SshAccessError {
    #[error("Container not found: {0}")]
    ContainerNotFound(String),

    #[error("Container '{name}' exists but is not managed by sandbox-ssh (image: {image})")]
    ContainerForeign { name: String, image: String },

    #[error("Failed to start container {name}: {reason}")]
    ContainerStartFailed { name: String, reason: String },

    #[error("Container {0} stopped while waiting for its SSH daemon")]
    ContainerStopped(String),

    #[error("No free SSH port in range {start}-{end} (held by: {})", .holders.join(", "))]
    PortExhausted {
        start: u16,
        end: u16,
        holders: Vec<String>,
    },

    #[error("SSH daemon in {container} did not become reachable on port {port} within {waited_ms}ms")]
    ReadinessTimeout {
        container: String,
        port: u16,
        waited_ms: u64,
    },

    #[error("Host key for {container} (port {port}) has changed for {}", .algorithms.join(", "))]
    TrustViolation {
        container: String,
        port: u16,
        algorithms: Vec<String>,
        fingerprints: Vec<String>,
    },

    #[error("SSH authentication failed for {container}: {reason}")]
    AuthFailure { container: String, reason: String },

    #[error("SSH connection to {container} failed: {reason}")]
    FatalConnect { container: String, reason: String },

    #[error("SSH connection to {container} failed transiently: {reason}")]
    TransientConnect { container: String, reason: String },

    #[error("Detached command in {container} (pid {pid}) could not be confirmed running")]
    DetachedLaunchUnconfirmed { container: String, pid: String },

    #[error("SSH identity error: {0}")]
    IdentityError(String),

    #[error("Command execution failed: {command} (exit code: {exit_code})\nStderr: {stderr}")]
    CommandExecutionFailed {
        command: String,
        exit_code: i32,
        stderr: String,
    },

    #[error("Network timeout: {0}")]
    NetworkTimeout(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("I/O error on {path}: {message}")]
    Io { path: String, message: String },
}

impl SshAccessError {
    pub fn io(path: impl AsRef<std::path::Path>, err: std::io::Error) -> Self {
        SshAccessError::Io {
            path: path.as_ref().display().to_string(),
            message: err.to_string(),
        }
    }

    /// Check if this error can be retried
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SshAccessError::NetworkTimeout(_) | SshAccessError::TransientConnect { .. }
        )
    }

    /// Process exit code for this error class.
    ///
    /// Codes start at 64 so they stay clear of the exit codes a remote shell
    /// commonly returns, but callers must still distinguish a manager error from
    /// a passed-through session exit code by the `Result` variant, not the number.
    pub fn exit_code(&self) -> i32 {
        match self {
            SshAccessError::ContainerNotFound(_) => 64,
            SshAccessError::ContainerForeign { .. } => 65,
            SshAccessError::ContainerStartFailed { .. } => 66,
            SshAccessError::ContainerStopped(_) => 67,
            SshAccessError::PortExhausted { .. } => 68,
            SshAccessError::ReadinessTimeout { .. } => 69,
            SshAccessError::TrustViolation { .. } => 70,
            SshAccessError::AuthFailure { .. } => 71,
            SshAccessError::FatalConnect { .. } => 72,
            SshAccessError::TransientConnect { .. } => 73,
            SshAccessError::DetachedLaunchUnconfirmed { .. } => 74,
            SshAccessError::IdentityError(_) => 75,
            SshAccessError::CommandExecutionFailed { .. } => 76,
            SshAccessError::NetworkTimeout(_) => 77,
            SshAccessError::InvalidConfiguration(_) => 78,
            SshAccessError::ParseError(_) => 79,
            SshAccessError::Io { .. } => 80,
        }
    }

    /// Get a suggestion for recovering from this error
    pub fn recovery_suggestion(&self) -> String {
        match self {
            SshAccessError::ContainerNotFound(name) => {
                format!("Create the workspace container '{}' first", name)
            }
            SshAccessError::ContainerForeign { name, .. } => format!(
                "Rename or remove the unrelated container '{}' so a managed one can use the name",
                name
            ),
            SshAccessError::ContainerStartFailed { name, .. } => {
                format!("Inspect the container logs: docker logs {}", name)
            }
            SshAccessError::ContainerStopped(name) => format!(
                "The container exited during startup; check: docker logs {}",
                name
            ),
            SshAccessError::PortExhausted { start, end, holders } => format!(
                "Remove unused containers holding ports {}-{} ({}) or widen the port range",
                start,
                end,
                holders.join(", ")
            ),
            SshAccessError::ReadinessTimeout { container, .. } => format!(
                "Check that sshd is running inside the container: docker logs {}",
                container
            ),
            SshAccessError::TrustViolation { container, port, .. } => format!(
                "If {} was intentionally recreated, reconnect with forced trust replacement; \
                 otherwise investigate what is listening on 127.0.0.1:{}",
                container, port
            ),
            SshAccessError::AuthFailure { container, .. } => format!(
                "Recreate the container so the client key is injected again: {}",
                container
            ),
            SshAccessError::FatalConnect { container, .. } => format!(
                "Check that {} is running and its SSH port is published on the loopback address",
                container
            ),
            SshAccessError::TransientConnect { container, .. } => {
                format!("Retry shortly; {} may still be starting", container)
            }
            SshAccessError::DetachedLaunchUnconfirmed { container, .. } => format!(
                "The command exited immediately; run it in the foreground in {} to see its output",
                container
            ),
            SshAccessError::IdentityError(_) => {
                "Check that ssh-keygen is installed and the state directory is writable".to_string()
            }
            SshAccessError::CommandExecutionFailed { .. } => {
                "Check the container runtime is installed and running".to_string()
            }
            SshAccessError::NetworkTimeout(_) => {
                "Check that the container runtime is responsive".to_string()
            }
            SshAccessError::InvalidConfiguration(_) => "Review the sandbox-ssh configuration".to_string(),
            SshAccessError::ParseError(_) => "Check the container runtime version".to_string(),
            SshAccessError::Io { path, .. } => format!("Check permissions on {}", path),
        }
    }
}

pub type Result<T> = std::result::Result<T, SshAccessError>;
