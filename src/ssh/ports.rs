//! Host port allocation for container SSH endpoints.
//!
//! There is no allocation ledger: the port a container holds is recorded as a
//! label on the container itself, and every managed container (running or
//! stopped) is consulted on each scan. Live listeners are read from the socket
//! table rather than by connecting, so a bound socket that refuses
//! connections still counts as taken.

use async_trait::async_trait;
use std::collections::{BTreeMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::config::PortRange;
use crate::executor::{CommandExecutor, CommandSpec};
use crate::models::container::ContainerInfo;
use crate::models::error::SshAccessError;
use crate::runtime::ContainerRuntimeApi;
use crate::ssh::lock::{self, LeaseOutcome};

/// TCP state code for LISTEN in /proc/net/tcp
const TCP_LISTEN: &str = "0A";

/// Source of the host's currently listening TCP ports
#[async_trait]
pub trait ListenerProbe: Send + Sync {
    async fn listening_ports(&self) -> Result<HashSet<u16>, SshAccessError>;
}

/// Reads `/proc/net/tcp{,6}` where available, otherwise asks `lsof`
pub struct SystemListenerProbe {
    executor: Arc<dyn CommandExecutor>,
}

impl SystemListenerProbe {
    pub fn new(executor: Arc<dyn CommandExecutor>) -> Self {
        Self { executor }
    }

    fn read_proc() -> Option<HashSet<u16>> {
        let mut ports = HashSet::new();
        let mut any = false;
        for table in ["/proc/net/tcp", "/proc/net/tcp6"] {
            if let Ok(content) = std::fs::read_to_string(table) {
                any = true;
                ports.extend(parse_proc_net_tcp(&content));
            }
        }
        any.then_some(ports)
    }

    async fn read_lsof(&self) -> Result<HashSet<u16>, SshAccessError> {
        let command = CommandSpec::new("lsof").args(["-nP", "-iTCP", "-sTCP:LISTEN"]);
        let result = self
            .executor
            .execute_with_timeout(&command, Duration::from_secs(10))
            .await?;
        // lsof exits 1 when nothing matches
        if !result.success() && !result.stdout.trim().is_empty() {
            return Err(SshAccessError::CommandExecutionFailed {
                command: command.display(),
                exit_code: result.exit_code,
                stderr: result.stderr,
            });
        }
        Ok(parse_lsof_listeners(&result.stdout))
    }
}

#[async_trait]
impl ListenerProbe for SystemListenerProbe {
    async fn listening_ports(&self) -> Result<HashSet<u16>, SshAccessError> {
        if let Some(ports) = Self::read_proc() {
            return Ok(ports);
        }
        tracing::trace!("No /proc socket table; falling back to lsof");
        self.read_lsof().await
    }
}

/// Listening ports from the content of `/proc/net/tcp` or `/proc/net/tcp6`.
///
/// Each row has `local_address` as `HEXADDR:HEXPORT` in column 2 and the state
/// in column 4.
pub fn parse_proc_net_tcp(content: &str) -> Vec<u16> {
    content
        .lines()
        .skip(1)
        .filter_map(|line| {
            let fields: Vec<&str> = line.split_whitespace().collect();
            if fields.len() < 4 || fields[3] != TCP_LISTEN {
                return None;
            }
            let (_, port_hex) = fields[1].rsplit_once(':')?;
            u16::from_str_radix(port_hex, 16).ok()
        })
        .collect()
}

/// Listening ports from `lsof -nP -iTCP -sTCP:LISTEN` output
pub fn parse_lsof_listeners(output: &str) -> HashSet<u16> {
    output
        .lines()
        .skip(1)
        .filter(|line| line.contains("(LISTEN)"))
        .filter_map(|line| {
            let name = line
                .split_whitespace()
                .take_while(|f| *f != "(LISTEN)")
                .last()?;
            let (_, port) = name.rsplit_once(':')?;
            port.parse().ok()
        })
        .collect()
}

/// A chosen port and the allocation lease that guards it.
///
/// Keep it alive until the port has been recorded on the container, so a
/// concurrent allocation cannot pick the same free port in between.
#[derive(Debug)]
pub struct PortReservation {
    pub port: u16,
    /// The container already held this port
    pub reused: bool,
    lease: LeaseOutcome,
}

impl PortReservation {
    pub fn is_protected(&self) -> bool {
        self.lease.is_protected()
    }

    /// Release the lease, returning the port
    pub fn into_port(self) -> u16 {
        self.port
    }
}

/// Chooses ports from a range, consulting live listeners and container records
pub struct PortAllocator<'a> {
    runtime: &'a dyn ContainerRuntimeApi,
    probe: &'a dyn ListenerProbe,
    lock_path: PathBuf,
    lock_timeout: Duration,
}

impl<'a> PortAllocator<'a> {
    pub fn new(
        runtime: &'a dyn ContainerRuntimeApi,
        probe: &'a dyn ListenerProbe,
        lock_path: PathBuf,
        lock_timeout: Duration,
    ) -> Self {
        Self {
            runtime,
            probe,
            lock_path,
            lock_timeout,
        }
    }

    /// Pick the SSH host port for `container`.
    ///
    /// `ignore` names a port the caller is about to vacate: it no longer counts
    /// as recorded by another container. With `force_ignore` it is also
    /// treated as free even while something listens on it.
    pub async fn allocate(
        &self,
        container: &str,
        range: PortRange,
        ignore: Option<u16>,
        force_ignore: bool,
    ) -> Result<PortReservation, SshAccessError> {
        if range.is_empty() {
            return Err(SshAccessError::InvalidConfiguration(format!(
                "port range {}-{} is empty",
                range.start, range.end
            )));
        }

        let lease = lock::acquire(&self.lock_path, self.lock_timeout).await;
        if let LeaseOutcome::DegradedUnprotected { reason } = &lease {
            tracing::warn!("Allocating a port for {} without a lease: {:?}", container, reason);
        }

        let managed = self.runtime.list_managed().await?;
        let listeners = self.probe.listening_ports().await?;

        let own = match managed.iter().find(|c| c.name == container) {
            Some(info) => Some(info.clone()),
            None => self.runtime.inspect(container).await?,
        };

        let held = recorded_elsewhere(&managed, container);
        if let Some(port) = reusable_port(own.as_ref(), range, &held, &listeners, ignore, force_ignore)
        {
            tracing::debug!("Reusing port {} for {}", port, container);
            return Ok(PortReservation {
                port,
                reused: true,
                lease,
            });
        }

        for port in range.iter() {
            let vacated = ignore == Some(port);
            if held.contains_key(&port) && !vacated {
                continue;
            }
            if listeners.contains(&port) && !(vacated && force_ignore) {
                continue;
            }
            tracing::info!("Allocated port {} for {}", port, container);
            return Ok(PortReservation {
                port,
                reused: false,
                lease,
            });
        }

        let holders: Vec<String> = held
            .iter()
            .filter(|(port, _)| range.contains(**port))
            .map(|(port, name)| format!("{}:{}", name, port))
            .collect();
        tracing::error!(
            "Port range {}-{} exhausted for {} ({} recorded holders)",
            range.start,
            range.end,
            container,
            holders.len()
        );
        Err(SshAccessError::PortExhausted {
            start: range.start,
            end: range.end,
            holders,
        })
    }
}

/// The container's own recorded port, if it may keep it
fn reusable_port(
    own: Option<&ContainerInfo>,
    range: PortRange,
    held: &BTreeMap<u16, String>,
    listeners: &HashSet<u16>,
    ignore: Option<u16>,
    force_ignore: bool,
) -> Option<u16> {
    let info = own?;
    let port = info.ssh_port?;
    if !range.contains(port) {
        return None;
    }
    if let Some(other) = held.get(&port) {
        if ignore != Some(port) {
            tracing::warn!(
                "Port {} is recorded by both {} and {}; moving {}",
                port,
                info.name,
                other,
                info.name
            );
            return None;
        }
    }
    let forced = force_ignore && ignore == Some(port);
    if !listeners.contains(&port) || forced {
        return Some(port);
    }
    // Bound, but by the container itself
    if info.is_running() {
        return Some(port);
    }
    None
}

/// Ports recorded by every managed container other than `container`
fn recorded_elsewhere(managed: &[ContainerInfo], container: &str) -> BTreeMap<u16, String> {
    managed
        .iter()
        .filter(|c| c.name != container)
        .filter_map(|c| c.ssh_port.map(|p| (p, c.name.clone())))
        .collect()
}
