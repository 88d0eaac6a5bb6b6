//! Configuration for the SSH access layer.
//!
//! Every entry point takes an explicit [`SshAccessConfig`]; nothing reads
//! process-wide defaults after construction, so tests can run several
//! configurations side by side.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::models::container::ContainerRuntime;
use crate::models::error::SshAccessError;

/// Environment variable overriding the state directory
pub const HOME_ENV: &str = "SANDBOX_SSH_HOME";
/// Environment variable overriding the port range, formatted `START-END`
pub const PORT_RANGE_ENV: &str = "SANDBOX_SSH_PORT_RANGE";
/// Environment variable selecting the container runtime binary
pub const RUNTIME_ENV: &str = "SANDBOX_SSH_RUNTIME";

/// Inclusive host port range for SSH endpoints
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct PortRange {
    pub start: u16,
    pub end: u16,
}

impl PortRange {
    pub fn new(start: u16, end: u16) -> Self {
        Self { start, end }
    }

    pub fn contains(&self, port: u16) -> bool {
        port >= self.start && port <= self.end
    }

    pub fn iter(&self) -> impl Iterator<Item = u16> {
        self.start..=self.end
    }

    pub fn len(&self) -> usize {
        if self.end < self.start {
            0
        } else {
            (self.end - self.start) as usize + 1
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for PortRange {
    fn default() -> Self {
        Self {
            start: 2300,
            end: 2499,
        }
    }
}

impl std::str::FromStr for PortRange {
    type Err = SshAccessError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (start, end) = s.trim().split_once('-').ok_or_else(|| {
            SshAccessError::InvalidConfiguration(format!(
                "port range must look like START-END, got '{}'",
                s
            ))
        })?;
        let parse = |v: &str| {
            v.trim().parse::<u16>().map_err(|e| {
                SshAccessError::InvalidConfiguration(format!("invalid port '{}': {}", v, e))
            })
        };
        Ok(Self::new(parse(start)?, parse(end)?))
    }
}

/// Backoff polling for the SSH daemon to come up
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReadinessSettings {
    pub initial_interval_ms: u64,
    pub max_interval_ms: u64,
    /// Overall wall-clock budget for a full wait
    pub budget_ms: u64,
    /// Timeout of the single probe used in quick mode
    pub quick_timeout_ms: u64,
}

impl Default for ReadinessSettings {
    fn default() -> Self {
        Self {
            initial_interval_ms: 100,
            max_interval_ms: 2_000,
            budget_ms: 30_000,
            quick_timeout_ms: 2_000,
        }
    }
}

/// Host key scanning retries
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct KeyscanSettings {
    pub attempts: u32,
    pub initial_backoff_ms: u64,
    pub timeout_ms: u64,
}

impl Default for KeyscanSettings {
    fn default() -> Self {
        Self {
            attempts: 3,
            initial_backoff_ms: 200,
            timeout_ms: 5_000,
        }
    }
}

/// Connection retry budget for sessions
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectSettings {
    pub attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub connect_timeout_secs: u64,
    pub server_alive_interval_secs: u64,
}

impl Default for ConnectSettings {
    fn default() -> Self {
        Self {
            attempts: 3,
            initial_backoff_ms: 500,
            max_backoff_ms: 4_000,
            connect_timeout_secs: 10,
            server_alive_interval_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SshAccessConfig {
    /// Holds the identity, trust store, profiles and lock files
    pub state_dir: PathBuf,
    pub runtime: ContainerRuntime,
    pub port_range: PortRange,
    /// Label marking a container as created by this system
    pub managed_label: String,
    /// Label carrying the container's allocated SSH host port
    pub port_label: String,
    /// Images recognised as ours even without the managed label
    pub managed_image_prefixes: Vec<String>,
    pub remote_user: String,
    pub loopback_host: String,
    pub host_alias_prefix: String,
    pub forward_agent: bool,
    pub forward_x11: bool,
    pub ssh_binary: String,
    pub keyscan_binary: String,
    pub keygen_binary: String,
    pub lock_timeout_ms: u64,
    pub detached_check_delay_ms: u64,
    pub readiness: ReadinessSettings,
    pub keyscan: KeyscanSettings,
    pub connect: ConnectSettings,
}

impl Default for SshAccessConfig {
    fn default() -> Self {
        let state_dir = dirs::home_dir()
            .map(|h| h.join(".sandbox-ssh"))
            .unwrap_or_else(|| PathBuf::from(".sandbox-ssh"));

        Self {
            state_dir,
            runtime: ContainerRuntime::Docker,
            port_range: PortRange::default(),
            managed_label: "sandbox-ssh.managed".to_string(),
            port_label: "sandbox-ssh.ssh-port".to_string(),
            managed_image_prefixes: vec!["sandbox-ssh/".to_string()],
            remote_user: "agent".to_string(),
            loopback_host: "127.0.0.1".to_string(),
            host_alias_prefix: "sandbox-".to_string(),
            forward_agent: false,
            forward_x11: false,
            ssh_binary: "ssh".to_string(),
            keyscan_binary: "ssh-keyscan".to_string(),
            keygen_binary: "ssh-keygen".to_string(),
            lock_timeout_ms: 10_000,
            detached_check_delay_ms: 500,
            readiness: ReadinessSettings::default(),
            keyscan: KeyscanSettings::default(),
            connect: ConnectSettings::default(),
        }
    }
}

impl SshAccessConfig {
    /// Configuration rooted at an explicit state directory
    pub fn with_state_dir(state_dir: impl Into<PathBuf>) -> Self {
        Self {
            state_dir: state_dir.into(),
            ..Self::default()
        }
    }

    /// Load a JSON configuration file; missing fields take their defaults
    pub fn load(path: &Path) -> Result<Self, SshAccessError> {
        let content = fs::read_to_string(path).map_err(|e| SshAccessError::io(path, e))?;
        let config: Self = serde_json::from_str(&content).map_err(|e| {
            SshAccessError::InvalidConfiguration(format!("{}: {}", path.display(), e))
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Apply `SANDBOX_SSH_*` environment overrides
    pub fn with_env_overrides(mut self) -> Result<Self, SshAccessError> {
        if let Some(home) = std::env::var_os(HOME_ENV) {
            if !home.is_empty() {
                self.state_dir = PathBuf::from(home);
            }
        }
        if let Ok(range) = std::env::var(PORT_RANGE_ENV) {
            if !range.trim().is_empty() {
                self.port_range = range.parse()?;
            }
        }
        if let Ok(runtime) = std::env::var(RUNTIME_ENV) {
            if !runtime.trim().is_empty() {
                self.runtime = runtime
                    .parse()
                    .map_err(SshAccessError::InvalidConfiguration)?;
            }
        }
        self.validate()?;
        Ok(self)
    }

    pub fn validate(&self) -> Result<(), SshAccessError> {
        if self.port_range.is_empty() || self.port_range.start == 0 {
            return Err(SshAccessError::InvalidConfiguration(format!(
                "port range {}-{} is empty",
                self.port_range.start, self.port_range.end
            )));
        }
        if self.managed_label.trim().is_empty() || self.port_label.trim().is_empty() {
            return Err(SshAccessError::InvalidConfiguration(
                "managed and port labels must be set".to_string(),
            ));
        }
        if self.connect.attempts == 0 || self.keyscan.attempts == 0 {
            return Err(SshAccessError::InvalidConfiguration(
                "retry attempts must be at least 1".to_string(),
            ));
        }
        if self.readiness.budget_ms == 0 {
            return Err(SshAccessError::InvalidConfiguration(
                "readiness budget must be positive".to_string(),
            ));
        }
        Ok(())
    }

    pub fn identity_path(&self) -> PathBuf {
        self.state_dir.join("id_ed25519")
    }

    pub fn public_key_path(&self) -> PathBuf {
        self.state_dir.join("id_ed25519.pub")
    }

    pub fn known_hosts_path(&self) -> PathBuf {
        self.state_dir.join("known_hosts")
    }

    pub fn profiles_dir(&self) -> PathBuf {
        self.state_dir.join("hosts")
    }

    pub fn lock_dir(&self) -> PathBuf {
        self.state_dir.join("locks")
    }

    /// Profile path for a container, derived from its name alone
    pub fn profile_path(&self, container: &str) -> PathBuf {
        self.profiles_dir()
            .join(format!("{}.conf", sanitize_file_name(container)))
    }

    /// SSH host alias used inside the container's profile
    pub fn host_alias(&self, container: &str) -> String {
        format!("{}{}", self.host_alias_prefix, sanitize_file_name(container))
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }

    pub fn detached_check_delay(&self) -> Duration {
        Duration::from_millis(self.detached_check_delay_ms)
    }

    /// Whether an image name identifies one of our own images
    pub fn is_managed_image(&self, image: &str) -> bool {
        self.managed_image_prefixes
            .iter()
            .any(|prefix| !prefix.is_empty() && image.starts_with(prefix.as_str()))
    }
}

fn sanitize_file_name(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = SshAccessConfig::with_state_dir("/tmp/state");
        assert_eq!(config.port_range, PortRange::new(2300, 2499));
        assert_eq!(config.port_range.len(), 200);
        assert_eq!(config.known_hosts_path(), PathBuf::from("/tmp/state/known_hosts"));
        assert_eq!(config.lock_timeout(), Duration::from_secs(10));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_port_range_parse() {
        let range: PortRange = "2300-2310".parse().unwrap();
        assert_eq!(range, PortRange::new(2300, 2310));
        assert!(range.contains(2305));
        assert!(!range.contains(2311));
        assert!("2300".parse::<PortRange>().is_err());
        assert!("a-b".parse::<PortRange>().is_err());
    }

    #[test]
    fn test_validate_rejects_inverted_range() {
        let mut config = SshAccessConfig::with_state_dir("/tmp/state");
        config.port_range = PortRange::new(2400, 2300);
        assert!(matches!(
            config.validate(),
            Err(SshAccessError::InvalidConfiguration(_))
        ));
    }

    #[test]
    fn test_profile_path_is_deterministic() {
        let config = SshAccessConfig::with_state_dir("/tmp/state");
        assert_eq!(
            config.profile_path("my/ws 1"),
            PathBuf::from("/tmp/state/hosts/my_ws_1.conf")
        );
        assert_eq!(config.host_alias("ws-1"), "sandbox-ws-1");
    }

    #[test]
    fn test_load_partial_json() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(
            &path,
            r#"{"port_range": {"start": 3000, "end": 3009}, "runtime": "podman"}"#,
        )
        .unwrap();

        let config = SshAccessConfig::load(&path).unwrap();
        assert_eq!(config.port_range, PortRange::new(3000, 3009));
        assert_eq!(config.runtime, ContainerRuntime::Podman);
        assert_eq!(config.remote_user, "agent");
        assert_eq!(config.connect.attempts, 3);
    }

    #[test]
    fn test_managed_image_prefix() {
        let config = SshAccessConfig::with_state_dir("/tmp/state");
        assert!(config.is_managed_image("sandbox-ssh/agent:latest"));
        assert!(!config.is_managed_image("ubuntu:22.04"));
    }
}
