//! The operations other components call to get SSH access into a container.

use std::sync::Arc;

use crate::config::{PortRange, SshAccessConfig};
use crate::executor::local::LocalExecutor;
use crate::executor::CommandExecutor;
use crate::models::container::ContainerInfo;
use crate::models::error::SshAccessError;
use crate::models::session::{ExecMode, RunOptions, SessionOptions, SessionOutcome};
use crate::runtime::{CliRuntime, ContainerRuntimeApi};
use crate::ssh::host_config::{HostConfigWriter, HostProfile};
use crate::ssh::identity::{self, Identity};
use crate::ssh::keyscan::{KeyScanner, KeyscanScanner};
use crate::ssh::known_hosts::{KnownHostsStore, TrustOutcome};
use crate::ssh::ports::{ListenerProbe, PortAllocator, PortReservation, SystemListenerProbe};
use crate::ssh::readiness::{ProbeMode, ReadinessOutcome, ReadinessProber};
use crate::ssh::session::{OpenSshTransport, RetryPolicy, SessionExecutor, SessionRequest, SshTransport};

/// External collaborators behind trait objects
#[derive(Clone)]
pub struct Collaborators {
    pub executor: Arc<dyn CommandExecutor>,
    pub runtime: Arc<dyn ContainerRuntimeApi>,
    pub scanner: Arc<dyn KeyScanner>,
    pub listeners: Arc<dyn ListenerProbe>,
    pub transport: Arc<dyn SshTransport>,
}

impl Collaborators {
    /// The real binaries: container runtime CLI, ssh-keyscan, ssh
    pub fn system(config: &SshAccessConfig) -> Self {
        let executor: Arc<dyn CommandExecutor> = Arc::new(LocalExecutor::new());
        Self {
            runtime: Arc::new(CliRuntime::new(config, executor.clone())),
            scanner: Arc::new(KeyscanScanner::new(
                executor.clone(),
                config.keyscan_binary.clone(),
            )),
            listeners: Arc::new(SystemListenerProbe::new(executor.clone())),
            transport: Arc::new(OpenSshTransport),
            executor,
        }
    }
}

/// What `establish` did
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EstablishReport {
    pub port: u16,
    pub started: bool,
    pub key_injected: bool,
    pub trust: TrustOutcome,
    pub profile_written: bool,
}

impl EstablishReport {
    /// Nothing on disk or in the container changed
    pub fn is_noop(&self) -> bool {
        !self.started
            && !self.key_injected
            && self.trust == TrustOutcome::Unchanged
            && !self.profile_written
    }
}

/// What `cleanup` removed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CleanupReport {
    pub profile_removed: bool,
    pub trust_entries_removed: usize,
}

pub struct SshAccessManager {
    config: SshAccessConfig,
    parts: Collaborators,
    known_hosts: KnownHostsStore,
    host_config: HostConfigWriter,
}

impl SshAccessManager {
    pub fn new(config: SshAccessConfig) -> Result<Self, SshAccessError> {
        let parts = Collaborators::system(&config);
        Self::with_collaborators(config, parts)
    }

    pub fn with_collaborators(
        config: SshAccessConfig,
        parts: Collaborators,
    ) -> Result<Self, SshAccessError> {
        config.validate()?;
        let known_hosts = KnownHostsStore::new(
            config.known_hosts_path(),
            config.lock_dir().join("known_hosts.lock"),
            config.lock_timeout(),
        );
        let host_config = HostConfigWriter::new(parts.executor.clone(), config.ssh_binary.clone());
        Ok(Self {
            config,
            parts,
            known_hosts,
            host_config,
        })
    }

    pub fn config(&self) -> &SshAccessConfig {
        &self.config
    }

    pub fn known_hosts(&self) -> &KnownHostsStore {
        &self.known_hosts
    }

    /// Create the client keypair if it does not exist yet
    pub async fn ensure_identity(&self) -> Result<Identity, SshAccessError> {
        identity::ensure_identity(&self.config, &self.parts.executor).await
    }

    /// Choose the SSH host port for `container`.
    ///
    /// The returned reservation holds the allocation lease; drop it once the
    /// port has been recorded on the container.
    pub async fn allocate_port(
        &self,
        container: &str,
        range: Option<PortRange>,
        ignore: Option<u16>,
        force_ignore: bool,
    ) -> Result<PortReservation, SshAccessError> {
        let allocator = PortAllocator::new(
            self.parts.runtime.as_ref(),
            self.parts.listeners.as_ref(),
            self.config.lock_dir().join("ports.lock"),
            self.config.lock_timeout(),
        );
        allocator
            .allocate(
                container,
                range.unwrap_or(self.config.port_range),
                ignore,
                force_ignore,
            )
            .await
    }

    /// Make `container` reachable on `port`: start it if needed, wait for
    /// sshd, authorize our key, record its host keys, write the profile.
    pub async fn establish(
        &self,
        container: &str,
        port: u16,
        force_trust: bool,
    ) -> Result<EstablishReport, SshAccessError> {
        let info = self.verify_ownership(container).await?;

        let started = if info.is_running() {
            false
        } else {
            tracing::info!("Starting {} for SSH access", container);
            self.parts.runtime.start(container).await?;
            true
        };

        self.wait_ready(container, port, ProbeMode::Full).await?;

        let identity = self.ensure_identity().await?;
        let key_injected = identity::inject_public_key(
            self.parts.runtime.as_ref(),
            container,
            &self.config.remote_user,
            &identity,
        )
        .await?;

        let trust = self
            .known_hosts
            .record_or_verify(
                self.parts.scanner.as_ref(),
                &self.config.keyscan,
                container,
                &self.config.loopback_host,
                port,
                force_trust,
            )
            .await?;

        let strict = self.host_config.strict_mode().await;
        let profile = HostProfile::from_config(&self.config, container, port, strict);
        let profile_written = self
            .host_config
            .write(&self.config.profile_path(container), &profile)?;

        let report = EstablishReport {
            port,
            started,
            key_injected,
            trust,
            profile_written,
        };
        tracing::info!("SSH access to {} established on port {}", container, port);
        tracing::debug!("Establish report for {}: {:?}", container, report);
        Ok(report)
    }

    /// Open an interactive shell. Returns the remote shell's exit code.
    pub async fn connect_shell(
        &self,
        container: &str,
        options: &SessionOptions,
    ) -> Result<i32, SshAccessError> {
        let outcome = self
            .session(container, options, ExecMode::Interactive, Vec::new())
            .await?;
        Ok(outcome.exit_code())
    }

    /// Run a command. Foreground runs return the remote exit code; detached
    /// runs return the confirmed pid.
    pub async fn run(
        &self,
        container: &str,
        options: &RunOptions,
        command: &[String],
    ) -> Result<SessionOutcome, SshAccessError> {
        if command.iter().all(|w| w.trim().is_empty()) {
            return Err(SshAccessError::InvalidConfiguration(
                "no command given to run".to_string(),
            ));
        }
        self.session(container, &options.session, options.mode(), command.to_vec())
            .await
    }

    /// Remove the container's profile and trust entries. Safe to repeat.
    pub async fn cleanup(&self, container: &str, port: u16) -> Result<CleanupReport, SshAccessError> {
        let profile_removed = HostConfigWriter::remove(&self.config.profile_path(container))?;
        let trust_entries_removed = self
            .known_hosts
            .remove(&self.config.loopback_host, port)
            .await?;
        tracing::info!(
            "Cleaned up SSH access for {} (profile removed: {}, trust entries removed: {})",
            container,
            profile_removed,
            trust_entries_removed
        );
        Ok(CleanupReport {
            profile_removed,
            trust_entries_removed,
        })
    }

    async fn session(
        &self,
        container: &str,
        options: &SessionOptions,
        mode: ExecMode,
        command: Vec<String>,
    ) -> Result<SessionOutcome, SshAccessError> {
        let info = self.verify_ownership(container).await?;
        let port = info.ssh_port.ok_or_else(|| {
            SshAccessError::InvalidConfiguration(format!(
                "container {} has no SSH port recorded (label {})",
                container, self.config.port_label
            ))
        })?;

        let trust_recovered = match self.prepare(&info, port, options.force_trust).await {
            Ok(()) => false,
            Err(SshAccessError::TrustViolation { fingerprints, .. }) => {
                tracing::warn!(
                    "Host key for {} (port {}) changed; attempting one automatic recovery: {}",
                    container,
                    port,
                    fingerprints.join("; ")
                );
                self.recover_trust(container, port).await?;
                true
            }
            Err(e) => return Err(e),
        };

        let identity = self.ensure_identity().await?;
        let prober = self.prober();
        let executor = SessionExecutor {
            transport: self.parts.transport.as_ref(),
            runtime: self.parts.runtime.as_ref(),
            identity: &identity,
            remote_user: &self.config.remote_user,
            prober: &prober,
            known_hosts: &self.known_hosts,
            scanner: self.parts.scanner.as_ref(),
            keyscan: &self.config.keyscan,
            host: &self.config.loopback_host,
            ssh_binary: &self.config.ssh_binary,
            policy: RetryPolicy::from_settings(&self.config.connect),
            detached_check_delay: self.config.detached_check_delay(),
        };
        let request = SessionRequest {
            container: container.to_string(),
            port,
            profile: self.config.profile_path(container),
            alias: self.config.host_alias(container),
            mode,
            command,
            quiet: options.quiet,
            trust_recovered,
        };
        executor.execute(&request).await
    }

    /// Drop the stale trust entries and redo setup with the presented keys
    async fn recover_trust(&self, container: &str, port: u16) -> Result<(), SshAccessError> {
        let removed = self
            .known_hosts
            .remove(&self.config.loopback_host, port)
            .await?;
        tracing::info!(
            "Invalidated {} stale host key entry/entries for {}",
            removed,
            container
        );
        self.establish(container, port, true).await?;
        Ok(())
    }

    /// Full setup when anything may be stale, otherwise a quick readiness check
    async fn prepare(
        &self,
        info: &ContainerInfo,
        port: u16,
        force_trust: bool,
    ) -> Result<(), SshAccessError> {
        let profile_path = self.config.profile_path(&info.name);
        let profile_current = match HostConfigWriter::read(&profile_path)? {
            Some(profile) => profile.port == port,
            None => false,
        };

        if force_trust || !info.is_running() || !profile_current {
            self.establish(&info.name, port, force_trust).await?;
            return Ok(());
        }

        if self.prober().wait_ready(&info.name, port, ProbeMode::Quick).await
            != ReadinessOutcome::Ready
        {
            tracing::debug!("{} not answering yet; waiting for sshd", info.name);
            self.wait_ready(&info.name, port, ProbeMode::Full).await?;
        }
        Ok(())
    }

    async fn wait_ready(&self, container: &str, port: u16, mode: ProbeMode) -> Result<(), SshAccessError> {
        match self.prober().wait_ready(container, port, mode).await {
            ReadinessOutcome::Ready => Ok(()),
            ReadinessOutcome::ContainerGone => {
                tracing::error!(
                    "{} stopped while starting; see: {}",
                    container,
                    self.parts.runtime.logs_hint(container)
                );
                Err(SshAccessError::ContainerStopped(container.to_string()))
            }
            ReadinessOutcome::TimedOut { waited } => Err(SshAccessError::ReadinessTimeout {
                container: container.to_string(),
                port,
                waited_ms: waited.as_millis() as u64,
            }),
        }
    }

    fn prober(&self) -> ReadinessProber<'_> {
        ReadinessProber::new(
            self.parts.runtime.as_ref(),
            self.parts.scanner.as_ref(),
            &self.config.readiness,
            &self.config.loopback_host,
        )
    }

    /// Refuse containers we did not create
    async fn verify_ownership(&self, container: &str) -> Result<ContainerInfo, SshAccessError> {
        let info = self
            .parts
            .runtime
            .inspect(container)
            .await?
            .ok_or_else(|| SshAccessError::ContainerNotFound(container.to_string()))?;

        let labelled = info
            .label(&self.config.managed_label)
            .is_some_and(|v| !v.eq_ignore_ascii_case("false"));
        if labelled || self.config.is_managed_image(&info.image) {
            return Ok(info);
        }

        tracing::warn!(
            "Refusing to operate on {}: no {} label and image {} is not ours",
            container,
            self.config.managed_label,
            info.image
        );
        Err(SshAccessError::ContainerForeign {
            name: container.to_string(),
            image: info.image,
        })
    }
}
