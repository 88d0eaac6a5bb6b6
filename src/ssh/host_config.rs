//! Per-container OpenSSH client profiles.
//!
//! Each profile is a standalone config file passed with `ssh -F`, so nothing
//! from the user's own `~/.ssh/config` leaks in. Forwarding directives are
//! always written, both off by default.

use once_cell::sync::Lazy;
use regex::Regex;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::OnceCell;

use crate::config::SshAccessConfig;
use crate::executor::{CommandExecutor, CommandSpec};
use crate::models::error::SshAccessError;

static OPENSSH_VERSION: Lazy<Option<Regex>> =
    Lazy::new(|| Regex::new(r"OpenSSH_(?:for_Windows_)?(\d+)\.(\d+)").ok());

/// First OpenSSH release understanding `StrictHostKeyChecking accept-new`
const ACCEPT_NEW_SINCE: (u32, u32) = (7, 6);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StrictMode {
    AcceptNew,
    Yes,
}

impl StrictMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            StrictMode::AcceptNew => "accept-new",
            StrictMode::Yes => "yes",
        }
    }

    fn parse(value: &str) -> Option<Self> {
        match value.to_lowercase().as_str() {
            "accept-new" => Some(StrictMode::AcceptNew),
            "yes" => Some(StrictMode::Yes),
            _ => None,
        }
    }
}

/// Connection parameters for one container
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostProfile {
    pub container: String,
    pub alias: String,
    pub hostname: String,
    pub port: u16,
    pub user: String,
    pub identity_file: PathBuf,
    pub known_hosts_file: PathBuf,
    pub strict: StrictMode,
    pub forward_agent: bool,
    pub forward_x11: bool,
    pub connect_timeout_secs: u64,
    pub server_alive_interval_secs: u64,
}

impl HostProfile {
    pub fn from_config(config: &SshAccessConfig, container: &str, port: u16, strict: StrictMode) -> Self {
        Self {
            container: container.to_string(),
            alias: config.host_alias(container),
            hostname: config.loopback_host.clone(),
            port,
            user: config.remote_user.clone(),
            identity_file: config.identity_path(),
            known_hosts_file: config.known_hosts_path(),
            strict,
            forward_agent: config.forward_agent,
            forward_x11: config.forward_x11,
            connect_timeout_secs: config.connect.connect_timeout_secs,
            server_alive_interval_secs: config.connect.server_alive_interval_secs,
        }
    }

    pub fn render(&self) -> String {
        let yes_no = |v: bool| if v { "yes" } else { "no" };
        let mut out = String::new();
        out.push_str(&format!("# sandbox-ssh profile for container {}\n", self.container));
        out.push_str(&format!("Host {}\n", self.alias));
        out.push_str(&format!("    HostName {}\n", self.hostname));
        out.push_str(&format!("    Port {}\n", self.port));
        out.push_str(&format!("    User {}\n", self.user));
        out.push_str(&format!("    IdentityFile \"{}\"\n", self.identity_file.display()));
        out.push_str("    IdentitiesOnly yes\n");
        out.push_str(&format!(
            "    UserKnownHostsFile \"{}\"\n",
            self.known_hosts_file.display()
        ));
        out.push_str("    GlobalKnownHostsFile /dev/null\n");
        out.push_str(&format!("    StrictHostKeyChecking {}\n", self.strict.as_str()));
        out.push_str("    HashKnownHosts no\n");
        out.push_str("    PasswordAuthentication no\n");
        out.push_str(&format!("    ForwardAgent {}\n", yes_no(self.forward_agent)));
        out.push_str(&format!("    ForwardX11 {}\n", yes_no(self.forward_x11)));
        out.push_str(&format!("    ConnectTimeout {}\n", self.connect_timeout_secs));
        out.push_str(&format!(
            "    ServerAliveInterval {}\n",
            self.server_alive_interval_secs
        ));
        out.push_str("    LogLevel ERROR\n");
        out
    }

    /// Parse a profile previously produced by [`HostProfile::render`].
    /// Returns `None` when a required directive is missing.
    pub fn parse(content: &str) -> Option<Self> {
        let mut container = None;
        let mut alias = None;
        let mut hostname = None;
        let mut port = None;
        let mut user = None;
        let mut identity_file = None;
        let mut known_hosts_file = None;
        let mut strict = None;
        let mut forward_agent = false;
        let mut forward_x11 = false;
        let mut connect_timeout_secs = 0;
        let mut server_alive_interval_secs = 0;

        for line in content.lines() {
            let line = line.trim();

            if let Some(rest) = line.strip_prefix("# sandbox-ssh profile for container ") {
                container = Some(rest.trim().to_string());
                continue;
            }
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            // Split on first whitespace or =
            let Some(split) = line.find(|c: char| c.is_whitespace() || c == '=') else {
                continue;
            };
            let (k, v) = line.split_at(split);
            let v = v.trim_start();
            let v = v.strip_prefix('=').unwrap_or(v);
            let (key, value) = (k.trim().to_lowercase(), unquote(v.trim()));

            match key.as_str() {
                "host" => {
                    if alias.is_some() {
                        // One block per profile
                        break;
                    }
                    alias = Some(value);
                }
                "hostname" => hostname = Some(value),
                "port" => port = value.parse::<u16>().ok(),
                "user" => user = Some(value),
                "identityfile" => identity_file = Some(PathBuf::from(value)),
                "userknownhostsfile" => known_hosts_file = Some(PathBuf::from(value)),
                "stricthostkeychecking" => strict = StrictMode::parse(&value),
                "forwardagent" => forward_agent = value.eq_ignore_ascii_case("yes"),
                "forwardx11" => forward_x11 = value.eq_ignore_ascii_case("yes"),
                "connecttimeout" => connect_timeout_secs = value.parse().unwrap_or(0),
                "serveraliveinterval" => server_alive_interval_secs = value.parse().unwrap_or(0),
                _ => {
                    // Fixed directives
                }
            }
        }

        let alias = alias?;
        Some(Self {
            container: container.unwrap_or_else(|| alias.clone()),
            alias,
            hostname: hostname?,
            port: port?,
            user: user?,
            identity_file: identity_file?,
            known_hosts_file: known_hosts_file?,
            strict: strict?,
            forward_agent,
            forward_x11,
            connect_timeout_secs,
            server_alive_interval_secs,
        })
    }
}

fn unquote(value: &str) -> String {
    value
        .strip_prefix('"')
        .and_then(|v| v.strip_suffix('"'))
        .unwrap_or(value)
        .to_string()
}

/// Parse the `(major, minor)` version out of `ssh -V` output
pub fn parse_openssh_version(output: &str) -> Option<(u32, u32)> {
    let re = OPENSSH_VERSION.as_ref()?;
    let caps = re.captures(output)?;
    let major = caps.get(1)?.as_str().parse().ok()?;
    let minor = caps.get(2)?.as_str().parse().ok()?;
    Some((major, minor))
}

/// Strictness mode supported by a client reporting `version`
pub fn strict_mode_for(version: Option<(u32, u32)>) -> StrictMode {
    match version {
        Some(v) if v >= ACCEPT_NEW_SINCE => StrictMode::AcceptNew,
        _ => StrictMode::Yes,
    }
}

/// Writes profiles and remembers the installed client's capabilities
pub struct HostConfigWriter {
    executor: Arc<dyn CommandExecutor>,
    ssh_binary: String,
    strict: OnceCell<StrictMode>,
}

impl HostConfigWriter {
    pub fn new(executor: Arc<dyn CommandExecutor>, ssh_binary: impl Into<String>) -> Self {
        Self {
            executor,
            ssh_binary: ssh_binary.into(),
            strict: OnceCell::new(),
        }
    }

    /// `accept-new` when the installed client supports it, strict otherwise
    pub async fn strict_mode(&self) -> StrictMode {
        *self
            .strict
            .get_or_init(|| async {
                let command = CommandSpec::new(&self.ssh_binary).arg("-V");
                let version = match self
                    .executor
                    .execute_with_timeout(&command, Duration::from_secs(5))
                    .await
                {
                    // ssh -V prints to stderr
                    Ok(result) => parse_openssh_version(&result.combined_output()),
                    Err(e) => {
                        tracing::warn!("Could not determine ssh client version: {}", e);
                        None
                    }
                };
                let mode = strict_mode_for(version);
                tracing::debug!("ssh client version {:?}; StrictHostKeyChecking {}", version, mode.as_str());
                mode
            })
            .await
    }

    /// Write the profile unless the file already holds identical content.
    /// Returns whether the file changed.
    pub fn write(&self, path: &Path, profile: &HostProfile) -> Result<bool, SshAccessError> {
        let rendered = profile.render();
        if let Ok(existing) = fs::read_to_string(path) {
            if existing == rendered {
                tracing::debug!("Profile {} unchanged", path.display());
                return Ok(false);
            }
        }

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| SshAccessError::io(parent, e))?;
            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                fs::set_permissions(parent, fs::Permissions::from_mode(0o700))
                    .map_err(|e| SshAccessError::io(parent, e))?;
            }
        }

        let tmp = path.with_extension("conf.tmp");
        fs::write(&tmp, rendered.as_bytes()).map_err(|e| SshAccessError::io(&tmp, e))?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&tmp, fs::Permissions::from_mode(0o600))
                .map_err(|e| SshAccessError::io(&tmp, e))?;
        }
        fs::rename(&tmp, path).map_err(|e| SshAccessError::io(path, e))?;

        tracing::info!(
            "Wrote SSH profile {} ({}:{})",
            path.display(),
            profile.hostname,
            profile.port
        );
        Ok(true)
    }

    pub fn is_configured(path: &Path) -> bool {
        path.exists()
    }

    pub fn read(path: &Path) -> Result<Option<HostProfile>, SshAccessError> {
        match fs::read_to_string(path) {
            Ok(content) => Ok(HostProfile::parse(&content)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(SshAccessError::io(path, e)),
        }
    }

    /// Delete the profile. Returns whether a file was removed.
    pub fn remove(path: &Path) -> Result<bool, SshAccessError> {
        match fs::remove_file(path) {
            Ok(()) => {
                tracing::info!("Removed SSH profile {}", path.display());
                Ok(true)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(SshAccessError::io(path, e)),
        }
    }
}
