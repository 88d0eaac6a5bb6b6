use serde_json::Value;
use std::collections::HashMap;

use crate::models::container::{ContainerInfo, ContainerStatus};
use crate::models::error::SshAccessError;

/// Container port the SSH daemon listens on inside the container
const SSH_CONTAINER_PORT: &str = "22/tcp";

/// Parser for container runtime command output
pub struct OutputParser;

impl OutputParser {
    /// Parse `inspect` output (a JSON array) into container records.
    /// The SSH port comes from `port_label`, falling back to the `22/tcp` host binding.
    pub fn parse_inspect(output: &str, port_label: &str) -> Result<Vec<ContainerInfo>, SshAccessError> {
        let trimmed = output.trim();
        if trimmed.is_empty() {
            return Ok(Vec::new());
        }

        let json_array: Vec<Value> = serde_json::from_str(trimmed).map_err(|e| {
            SshAccessError::ParseError(format!("Failed to parse inspect output: {}", e))
        })?;

        Ok(json_array
            .iter()
            .map(|container| Self::parse_single_container(container, port_label))
            .collect())
    }

    fn parse_single_container(container: &Value, port_label: &str) -> ContainerInfo {
        let id = container["Id"]
            .as_str()
            .or_else(|| container["ID"].as_str())
            .unwrap_or_default()
            .to_string();

        let name = container["Name"]
            .as_str()
            .unwrap_or_default()
            .trim_start_matches('/')
            .to_string();

        let image = container["Config"]["Image"]
            .as_str()
            .or_else(|| container["ImageName"].as_str())
            .unwrap_or_default()
            .to_string();

        let state_json = &container["State"];
        let status = if state_json["Running"].as_bool().unwrap_or(false) {
            ContainerStatus::Running
        } else if state_json["Paused"].as_bool().unwrap_or(false) {
            ContainerStatus::Paused
        } else if state_json["Restarting"].as_bool().unwrap_or(false) {
            ContainerStatus::Restarting
        } else if state_json["Dead"].as_bool().unwrap_or(false) {
            ContainerStatus::Dead
        } else {
            let status_str = state_json["Status"].as_str().unwrap_or("exited");
            Self::parse_status(status_str)
        };

        let mut labels = HashMap::new();
        if let Some(obj) = container["Config"]["Labels"].as_object() {
            for (k, v) in obj {
                if let Some(v) = v.as_str() {
                    labels.insert(k.clone(), v.to_string());
                }
            }
        }

        let ssh_port = labels
            .get(port_label)
            .and_then(|v| v.trim().parse::<u16>().ok())
            .or_else(|| Self::parse_ssh_binding(container));

        ContainerInfo {
            id,
            name,
            image,
            status,
            labels,
            ssh_port,
        }
    }

    /// Host port bound to the container's 22/tcp. HostConfig is consulted first
    /// because NetworkSettings.Ports is empty while the container is stopped.
    fn parse_ssh_binding(container: &Value) -> Option<u16> {
        let candidates = [
            &container["HostConfig"]["PortBindings"][SSH_CONTAINER_PORT],
            &container["NetworkSettings"]["Ports"][SSH_CONTAINER_PORT],
        ];

        candidates.iter().find_map(|bindings| {
            bindings.as_array()?.iter().find_map(|binding| {
                binding["HostPort"]
                    .as_str()
                    .and_then(|p| p.parse::<u16>().ok())
                    .filter(|p| *p != 0)
            })
        })
    }

    /// Parse container status string to enum
    pub fn parse_status(status: &str) -> ContainerStatus {
        let lower = status.to_lowercase();
        if lower.contains("running") || lower.starts_with("up") {
            ContainerStatus::Running
        } else if lower.contains("exited") || lower.contains("stopped") {
            ContainerStatus::Exited
        } else if lower.contains("paused") {
            ContainerStatus::Paused
        } else if lower.contains("restarting") || lower.contains("starting") {
            ContainerStatus::Restarting
        } else if lower.contains("removing") {
            ContainerStatus::Removing
        } else if lower.contains("dead") || lower.contains("error") {
            ContainerStatus::Dead
        } else if lower.contains("created") || lower.contains("configured") {
            ContainerStatus::Created
        } else {
            ContainerStatus::Exited
        }
    }

    /// Parse `ps -q` output into container IDs
    pub fn parse_id_list(output: &str) -> Vec<String> {
        output
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(String::from)
            .collect()
    }
}
