use crate::executor::CommandSpec;
use crate::models::container::ContainerRuntime;

/// Builder for container runtime commands (Docker, Podman)
pub struct CommandBuilder;

impl CommandBuilder {
    // ========================================================================
    // Container queries
    // ========================================================================

    /// Build container inspect command for one or more containers
    pub fn inspect_containers(runtime: ContainerRuntime, names: &[&str]) -> CommandSpec {
        CommandSpec::new(runtime.binary())
            .args(["inspect", "--type", "container"])
            .args(names.iter().copied())
    }

    /// List IDs of every container (running or not) carrying `label`
    pub fn list_labeled_ids(runtime: ContainerRuntime, label: &str) -> CommandSpec {
        CommandSpec::new(runtime.binary()).args([
            "ps".to_string(),
            "-a".to_string(),
            "-q".to_string(),
            "--no-trunc".to_string(),
            "--filter".to_string(),
            format!("label={}", label),
        ])
    }

    // ========================================================================
    // Container control
    // ========================================================================

    pub fn start_container(runtime: ContainerRuntime, name: &str) -> CommandSpec {
        CommandSpec::new(runtime.binary()).args(["start", name])
    }

    /// Run `argv` inside the container as `user`, with stdin attached
    pub fn exec_in_container(
        runtime: ContainerRuntime,
        name: &str,
        user: &str,
        argv: &[&str],
    ) -> CommandSpec {
        CommandSpec::new(runtime.binary())
            .args(["exec", "-i", "-u", user, name])
            .args(argv.iter().copied())
    }

    pub fn container_logs_hint(runtime: ContainerRuntime, name: &str) -> String {
        format!("{} logs {}", runtime.binary(), name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_inspect_command() {
        let cmd = CommandBuilder::inspect_containers(ContainerRuntime::Docker, &["a", "b"]);
        assert_eq!(cmd.display(), "docker inspect --type container a b");
    }

    #[test]
    fn test_list_labeled_ids() {
        let cmd = CommandBuilder::list_labeled_ids(ContainerRuntime::Podman, "sandbox-ssh.managed");
        assert_eq!(
            cmd.display(),
            "podman ps -a -q --no-trunc --filter label=sandbox-ssh.managed"
        );
    }

    #[test]
    fn test_exec_command() {
        let cmd = CommandBuilder::exec_in_container(
            ContainerRuntime::Docker,
            "ws",
            "agent",
            &["sh", "-c", "true"],
        );
        assert_eq!(cmd.args, vec!["exec", "-i", "-u", "agent", "ws", "sh", "-c", "true"]);
    }
}
