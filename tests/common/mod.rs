#![allow(dead_code)]

use async_trait::async_trait;
use ssh_key::PublicKey;
use std::collections::{HashMap, HashSet, VecDeque};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use tokio::time::Instant;

use sandbox_ssh::executor::{CommandExecutor, CommandResult, CommandSpec};
use sandbox_ssh::models::container::{ContainerInfo, ContainerStatus};
use sandbox_ssh::runtime::ContainerRuntimeApi;
use sandbox_ssh::ssh::session::AttemptOutput;
use sandbox_ssh::ssh::{KeyScanner, ListenerProbe, SshInvocation, SshTransport};
use sandbox_ssh::{Collaborators, PortRange, SshAccessConfig, SshAccessError, SshAccessManager};

pub const ED25519_1: &str =
    "ssh-ed25519 AAAAC3NzaC1lZDI1NTE5AAAAIE9oGZvmxT29050arcJPsKjg3EwwCV3ExpfmpGrrsKx+";
pub const ED25519_2: &str =
    "ssh-ed25519 AAAAC3NzaC1lZDI1NTE5AAAAIMWDzf6M+vYprUBVXlvjQSXgqpHgThMEQETIhETD+rMR";
pub const ED25519_3: &str =
    "ssh-ed25519 AAAAC3NzaC1lZDI1NTE5AAAAIB7KSl9hB1mGcNbXChWSTwpZ+AE6GvDb66SQr98Ez/i1";

pub fn key(openssh: &str) -> PublicKey {
    PublicKey::from_openssh(openssh).unwrap()
}

pub fn result(exit_code: i32, stdout: &str, stderr: &str) -> CommandResult {
    CommandResult {
        stdout: stdout.to_string(),
        stderr: stderr.to_string(),
        exit_code,
        execution_time_ms: 1,
    }
}

pub fn output(exit_code: i32, stdout: &str, stderr: &str) -> AttemptOutput {
    AttemptOutput {
        exit_code,
        stdout: stdout.to_string(),
        stderr: stderr.to_string(),
    }
}

/// In-memory container runtime with per-container authorized_keys
#[derive(Default)]
pub struct FakeRuntime {
    pub containers: Mutex<HashMap<String, ContainerInfo>>,
    pub authorized_keys: Mutex<HashMap<String, String>>,
    pub starts: Mutex<Vec<String>>,
}

impl FakeRuntime {
    pub fn add(&self, name: &str, managed: bool, image: &str, status: ContainerStatus, port: Option<u16>) {
        let mut labels = HashMap::new();
        if managed {
            labels.insert("sandbox-ssh.managed".to_string(), "true".to_string());
        }
        if let Some(p) = port {
            labels.insert("sandbox-ssh.ssh-port".to_string(), p.to_string());
        }
        self.containers.lock().unwrap().insert(
            name.to_string(),
            ContainerInfo {
                id: format!("id-{}", name),
                name: name.to_string(),
                image: image.to_string(),
                status,
                labels,
                ssh_port: port,
            },
        );
    }

    pub fn add_managed(&self, name: &str, status: ContainerStatus, port: Option<u16>) {
        self.add(name, true, "sandbox-ssh/agent:latest", status, port);
    }

    pub fn set_status(&self, name: &str, status: ContainerStatus) {
        if let Some(info) = self.containers.lock().unwrap().get_mut(name) {
            info.status = status;
        }
    }

    /// Simulate a recreated container with an empty authorized_keys
    pub fn clear_authorized_keys(&self, name: &str) {
        self.authorized_keys.lock().unwrap().remove(name);
    }

    pub fn record_port(&self, name: &str, port: u16) {
        if let Some(info) = self.containers.lock().unwrap().get_mut(name) {
            info.ssh_port = Some(port);
            info.labels
                .insert("sandbox-ssh.ssh-port".to_string(), port.to_string());
        }
    }
}

#[async_trait]
impl ContainerRuntimeApi for FakeRuntime {
    async fn inspect(&self, name: &str) -> Result<Option<ContainerInfo>, SshAccessError> {
        Ok(self.containers.lock().unwrap().get(name).cloned())
    }

    async fn list_managed(&self) -> Result<Vec<ContainerInfo>, SshAccessError> {
        let mut managed: Vec<ContainerInfo> = self
            .containers
            .lock()
            .unwrap()
            .values()
            .filter(|c| c.labels.contains_key("sandbox-ssh.managed"))
            .cloned()
            .collect();
        managed.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(managed)
    }

    async fn start(&self, name: &str) -> Result<(), SshAccessError> {
        self.starts.lock().unwrap().push(name.to_string());
        match self.containers.lock().unwrap().get_mut(name) {
            Some(info) => {
                info.status = ContainerStatus::Running;
                Ok(())
            }
            None => Err(SshAccessError::ContainerNotFound(name.to_string())),
        }
    }

    async fn exec(
        &self,
        name: &str,
        _user: &str,
        _argv: &[&str],
        stdin: Option<&str>,
    ) -> Result<CommandResult, SshAccessError> {
        let mut keys = self.authorized_keys.lock().unwrap();
        let file = keys.entry(name.to_string()).or_default();
        match stdin {
            Some(data) => {
                file.push_str(data);
                Ok(result(0, "", ""))
            }
            None => Ok(result(0, file, "")),
        }
    }

    fn logs_hint(&self, name: &str) -> String {
        format!("docker logs {}", name)
    }
}

/// Presents whatever host keys the test sets
pub struct FakeScanner {
    pub keys: Mutex<Vec<PublicKey>>,
}

impl FakeScanner {
    pub fn new(keys: Vec<PublicKey>) -> Self {
        Self {
            keys: Mutex::new(keys),
        }
    }

    pub fn set(&self, keys: Vec<PublicKey>) {
        *self.keys.lock().unwrap() = keys;
    }
}

#[async_trait]
impl KeyScanner for FakeScanner {
    async fn scan(
        &self,
        _host: &str,
        _port: u16,
        _timeout: Duration,
    ) -> Result<Vec<PublicKey>, SshAccessError> {
        Ok(self.keys.lock().unwrap().clone())
    }
}

#[derive(Default)]
pub struct FakeListeners {
    pub ports: Mutex<HashSet<u16>>,
}

#[async_trait]
impl ListenerProbe for FakeListeners {
    async fn listening_ports(&self) -> Result<HashSet<u16>, SshAccessError> {
        Ok(self.ports.lock().unwrap().clone())
    }
}

/// Replays scripted client results; the last one repeats
pub struct FakeTransport {
    pub script: Mutex<VecDeque<AttemptOutput>>,
    pub calls: Mutex<Vec<(Instant, SshInvocation)>>,
}

impl FakeTransport {
    pub fn new(script: Vec<AttemptOutput>) -> Self {
        Self {
            script: Mutex::new(script.into()),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }
}

#[async_trait]
impl SshTransport for FakeTransport {
    async fn attempt(&self, invocation: &SshInvocation) -> Result<AttemptOutput, SshAccessError> {
        self.calls
            .lock()
            .unwrap()
            .push((Instant::now(), invocation.clone()));
        let mut script = self.script.lock().unwrap();
        let next = if script.len() > 1 {
            script.pop_front()
        } else {
            script.front().cloned()
        };
        Ok(next.unwrap_or_default())
    }
}

/// Stands in for ssh-keygen and `ssh -V`
pub struct FakeHostTools;

#[async_trait]
impl CommandExecutor for FakeHostTools {
    async fn execute(&self, command: &CommandSpec) -> Result<CommandResult, SshAccessError> {
        if command.program == "ssh" {
            return Ok(result(0, "", "OpenSSH_9.6p1, OpenSSL 3.0.13 30 Jan 2024\n"));
        }
        if command.program == "ssh-keygen" {
            let path = command
                .args
                .iter()
                .position(|a| a == "-f")
                .map(|i| PathBuf::from(&command.args[i + 1]))
                .unwrap();
            std::fs::write(&path, "PRIVATE KEY").unwrap();
            std::fs::write(path.with_extension("pub"), format!("{} sandbox-ssh\n", ED25519_3))
                .unwrap();
            return Ok(result(0, "", ""));
        }
        Ok(result(127, "", "unexpected command"))
    }

    async fn execute_with_timeout(
        &self,
        command: &CommandSpec,
        _timeout: Duration,
    ) -> Result<CommandResult, SshAccessError> {
        self.execute(command).await
    }
}

pub struct Harness {
    pub dir: TempDir,
    pub runtime: Arc<FakeRuntime>,
    pub scanner: Arc<FakeScanner>,
    pub listeners: Arc<FakeListeners>,
    pub transport: Arc<FakeTransport>,
    pub manager: SshAccessManager,
}

impl Harness {
    pub fn new(range: PortRange, script: Vec<AttemptOutput>) -> Self {
        let dir = TempDir::new().unwrap();
        let mut config = SshAccessConfig::with_state_dir(dir.path().join("state"));
        config.port_range = range;
        config.lock_timeout_ms = 500;

        let runtime = Arc::new(FakeRuntime::default());
        let scanner = Arc::new(FakeScanner::new(vec![key(ED25519_1)]));
        let listeners = Arc::new(FakeListeners::default());
        let transport = Arc::new(FakeTransport::new(script));

        let parts = Collaborators {
            executor: Arc::new(FakeHostTools),
            runtime: runtime.clone(),
            scanner: scanner.clone(),
            listeners: listeners.clone(),
            transport: transport.clone(),
        };
        let manager = SshAccessManager::with_collaborators(config, parts).unwrap();

        Self {
            dir,
            runtime,
            scanner,
            listeners,
            transport,
            manager,
        }
    }

    pub fn known_hosts(&self) -> String {
        std::fs::read_to_string(self.manager.config().known_hosts_path()).unwrap_or_default()
    }

    pub fn profile_files(&self) -> Vec<PathBuf> {
        match std::fs::read_dir(self.manager.config().profiles_dir()) {
            Ok(entries) => entries.filter_map(|e| e.ok()).map(|e| e.path()).collect(),
            Err(_) => Vec::new(),
        }
    }
}
