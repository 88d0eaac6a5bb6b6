//! Running `ssh` against a container profile with retry and trust recovery.
//!
//! One call to [`SessionExecutor::execute`] drives a small state machine:
//!
//! ```text
//! Attempting -> Completed(code)            remote exit code, passed through
//!            -> Transient  -> Backoff -> Attempting     (bounded budget)
//!            -> TrustViolation -> Recovering -> Attempting   (once)
//!            -> Auth | Fatal -> Failed
//! ```
//!
//! Detached launches add a liveness check on the returned pid before the
//! session counts as successful.

use async_trait::async_trait;
use std::borrow::Cow;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;

use crate::config::{ConnectSettings, KeyscanSettings};
use crate::executor::local::LocalExecutor;
use crate::models::error::SshAccessError;
use crate::models::session::{ExecMode, FailureKind, SessionOutcome};
use crate::runtime::ContainerRuntimeApi;
use crate::ssh::classify::{classify_exit, diagnostic_line};
use crate::ssh::identity::{self, Identity};
use crate::ssh::keyscan::KeyScanner;
use crate::ssh::known_hosts::KnownHostsStore;
use crate::ssh::readiness::{ProbeMode, ReadinessOutcome, ReadinessProber};

/// Only this much of the client's stderr is kept for classification
const STDERR_TAIL_BYTES: usize = 64 * 1024;

/// A fully specified `ssh` command line
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SshInvocation {
    pub program: String,
    pub args: Vec<String>,
    /// Capture stdout instead of attaching the caller's terminal
    pub capture: bool,
}

impl SshInvocation {
    pub fn display(&self) -> String {
        format!("{} {}", self.program, self.args.join(" "))
    }
}

/// What one client process produced
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AttemptOutput {
    pub exit_code: i32,
    /// Empty unless the invocation captured output
    pub stdout: String,
    pub stderr: String,
}

/// Runs one `ssh` client process
#[async_trait]
pub trait SshTransport: Send + Sync {
    async fn attempt(&self, invocation: &SshInvocation) -> Result<AttemptOutput, SshAccessError>;
}

/// Spawns the OpenSSH client.
///
/// Attached invocations inherit stdin/stdout so the remote side talks to the
/// caller's terminal; stderr is mirrored to ours and also kept for
/// classification.
pub struct OpenSshTransport;

#[async_trait]
impl SshTransport for OpenSshTransport {
    async fn attempt(&self, invocation: &SshInvocation) -> Result<AttemptOutput, SshAccessError> {
        let spawn_error = |e: std::io::Error| SshAccessError::CommandExecutionFailed {
            command: invocation.display(),
            exit_code: -1,
            stderr: e.to_string(),
        };

        let mut command = Command::new(&invocation.program);
        command
            .args(&invocation.args)
            .env("PATH", LocalExecutor::get_path_env())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if invocation.capture {
            command.stdin(Stdio::null()).stdout(Stdio::piped());
        } else {
            command.stdin(Stdio::inherit()).stdout(Stdio::inherit());
        }

        let mut child = command.spawn().map_err(spawn_error)?;

        let stdout_task = child.stdout.take().map(|mut out| {
            tokio::spawn(async move {
                let mut buf = Vec::new();
                out.read_to_end(&mut buf).await.map(|_| buf)
            })
        });

        let mut stderr_buf: Vec<u8> = Vec::new();
        if let Some(mut err) = child.stderr.take() {
            let mut sink = tokio::io::stderr();
            let mut chunk = [0u8; 4096];
            loop {
                let n = err.read(&mut chunk).await.map_err(spawn_error)?;
                if n == 0 {
                    break;
                }
                if !invocation.capture {
                    // Best effort; a closed terminal must not abort the session
                    let _ = sink.write_all(&chunk[..n]).await;
                }
                stderr_buf.extend_from_slice(&chunk[..n]);
                if stderr_buf.len() > STDERR_TAIL_BYTES {
                    let excess = stderr_buf.len() - STDERR_TAIL_BYTES;
                    stderr_buf.drain(..excess);
                }
            }
        }

        let status = child.wait().await.map_err(spawn_error)?;
        let stdout = match stdout_task {
            Some(task) => task
                .await
                .map_err(|e| SshAccessError::CommandExecutionFailed {
                    command: invocation.display(),
                    exit_code: -1,
                    stderr: e.to_string(),
                })?
                .map_err(spawn_error)?,
            None => Vec::new(),
        };

        Ok(AttemptOutput {
            exit_code: status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&stdout).to_string(),
            stderr: String::from_utf8_lossy(&stderr_buf).to_string(),
        })
    }
}

/// Quote one word for the remote POSIX shell
pub fn quote(word: &str) -> String {
    shell_escape::unix::escape(Cow::from(word)).into_owned()
}

/// The remote command line for `argv`.
///
/// A single argument is a shell snippet and is sent as is; several arguments
/// are an argv and each word is quoted.
pub fn remote_command_line(argv: &[String]) -> String {
    match argv {
        [single] => single.clone(),
        words => words.iter().map(|w| quote(w)).collect::<Vec<_>>().join(" "),
    }
}

/// Wrap a command so it survives the session and print its pid
pub fn detached_wrapper(command_line: &str) -> String {
    let inner = format!("sh -c {} >/dev/null 2>&1 </dev/null &", quote(command_line));
    format!(
        "if command -v setsid >/dev/null 2>&1; then setsid nohup {inner} else nohup {inner} fi; echo $!",
        inner = inner
    )
}

/// Build the client command line for a profile
pub fn build_invocation(
    ssh_binary: &str,
    profile: &Path,
    alias: &str,
    mode: ExecMode,
    remote: Option<&str>,
) -> SshInvocation {
    let mut args = vec!["-F".to_string(), profile.display().to_string()];
    args.push(if mode.wants_tty() { "-t" } else { "-T" }.to_string());
    // Options end before the destination; everything after it is the remote command
    args.push("--".to_string());
    args.push(alias.to_string());
    if let Some(remote) = remote {
        args.push(remote.to_string());
    }
    SshInvocation {
        program: ssh_binary.to_string(),
        args,
        capture: matches!(mode, ExecMode::Detached),
    }
}

/// The pid printed by [`detached_wrapper`]
pub fn parse_pid(stdout: &str) -> Option<u32> {
    stdout
        .lines()
        .rev()
        .map(str::trim)
        .find(|l| !l.is_empty())?
        .parse()
        .ok()
        .filter(|pid| *pid > 1)
}

/// Exponential backoff for the transient retry budget
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub initial: Duration,
    pub cap: Duration,
}

impl RetryPolicy {
    pub fn from_settings(settings: &ConnectSettings) -> Self {
        Self {
            attempts: settings.attempts.max(1),
            initial: Duration::from_millis(settings.initial_backoff_ms),
            cap: Duration::from_millis(settings.max_backoff_ms),
        }
    }

    /// Delay before retry number `retry` (1-based)
    pub fn delay(&self, retry: u32) -> Duration {
        let factor = 2u32.saturating_pow(retry.saturating_sub(1));
        self.initial.saturating_mul(factor).min(self.cap)
    }
}

/// What to run in the container
#[derive(Debug, Clone)]
pub struct SessionRequest {
    pub container: String,
    pub port: u16,
    pub profile: PathBuf,
    pub alias: String,
    pub mode: ExecMode,
    /// Empty for an interactive login shell
    pub command: Vec<String>,
    pub quiet: bool,
    /// The one trust recovery was already spent while preparing the container
    pub trust_recovered: bool,
}

#[derive(Debug)]
enum State {
    Attempting,
    Backoff { retry: u32, delay: Duration },
    Recovering,
    Completed(AttemptOutput),
    Done(SessionOutcome),
    Failed(SshAccessError),
}

/// Drives client attempts for one session request
pub struct SessionExecutor<'a> {
    pub transport: &'a dyn SshTransport,
    pub runtime: &'a dyn ContainerRuntimeApi,
    pub identity: &'a Identity,
    pub remote_user: &'a str,
    pub prober: &'a ReadinessProber<'a>,
    pub known_hosts: &'a KnownHostsStore,
    pub scanner: &'a dyn KeyScanner,
    pub keyscan: &'a KeyscanSettings,
    pub host: &'a str,
    pub ssh_binary: &'a str,
    pub policy: RetryPolicy,
    pub detached_check_delay: Duration,
}

impl<'a> SessionExecutor<'a> {
    pub async fn execute(&self, request: &SessionRequest) -> Result<SessionOutcome, SshAccessError> {
        let remote = match request.mode {
            ExecMode::Interactive if request.command.is_empty() => None,
            ExecMode::Detached => Some(detached_wrapper(&remote_command_line(&request.command))),
            _ => Some(remote_command_line(&request.command)),
        };
        let invocation = build_invocation(
            self.ssh_binary,
            &request.profile,
            &request.alias,
            request.mode,
            remote.as_deref(),
        );

        let mut budget_used = 0u32;
        let mut recovered = request.trust_recovered;
        let mut state = State::Attempting;

        loop {
            state = match state {
                State::Attempting => {
                    budget_used += 1;
                    self.progress(
                        request,
                        format!(
                            "Connecting to {} (attempt {}/{})",
                            request.container, budget_used, self.policy.attempts
                        ),
                    );
                    match self.transport.attempt(&invocation).await {
                        Ok(output) => State::Completed(output),
                        Err(e) if e.is_retryable() => {
                            self.after_transient(request, budget_used, e.to_string())
                        }
                        Err(e) => State::Failed(e),
                    }
                }
                State::Completed(output) => {
                    match classify_exit(output.exit_code, &output.stderr) {
                        None => match request.mode {
                            ExecMode::Detached => self.confirm_detached(request, &output).await,
                            _ => State::Done(SessionOutcome::Exited(output.exit_code)),
                        },
                        Some(FailureKind::Transient) => {
                            self.after_transient(request, budget_used, diagnostic_line(&output.stderr))
                        }
                        Some(FailureKind::TrustViolation) if !recovered => {
                            tracing::warn!(
                                "Host key for {} (port {}) changed; attempting one automatic recovery",
                                request.container,
                                request.port
                            );
                            State::Recovering
                        }
                        Some(FailureKind::TrustViolation) => {
                            tracing::error!(
                                "Host key for {} still rejected after recovery",
                                request.container
                            );
                            let algorithms = self
                                .known_hosts
                                .entries_for(self.host, request.port)
                                .map(|recorded| {
                                    recorded
                                        .trusted
                                        .iter()
                                        .map(|k| k.algorithm().as_str().to_string())
                                        .collect()
                                })
                                .unwrap_or_default();
                            State::Failed(SshAccessError::TrustViolation {
                                container: request.container.clone(),
                                port: request.port,
                                algorithms,
                                fingerprints: vec![diagnostic_line(&output.stderr)],
                            })
                        }
                        Some(FailureKind::Auth) => State::Failed(SshAccessError::AuthFailure {
                            container: request.container.clone(),
                            reason: diagnostic_line(&output.stderr),
                        }),
                        Some(FailureKind::Fatal) => State::Failed(SshAccessError::FatalConnect {
                            container: request.container.clone(),
                            reason: diagnostic_line(&output.stderr),
                        }),
                    }
                }
                State::Backoff { retry, delay } => {
                    tracing::info!(
                        "Retrying connection to {} in {:?} (retry {})",
                        request.container,
                        delay,
                        retry
                    );
                    tokio::time::sleep(delay).await;
                    match self
                        .prober
                        .wait_ready(&request.container, request.port, ProbeMode::Quick)
                        .await
                    {
                        ReadinessOutcome::Ready => {}
                        other => tracing::debug!(
                            "Quick readiness check for {} before retry: {:?}",
                            request.container,
                            other
                        ),
                    }
                    State::Attempting
                }
                State::Recovering => {
                    recovered = true;
                    match self.recover_trust(request).await {
                        Ok(()) => {
                            // The post-recovery attempt is not charged to the budget
                            budget_used = budget_used.saturating_sub(1);
                            State::Attempting
                        }
                        Err(e) => State::Failed(e),
                    }
                }
                State::Done(outcome) => return Ok(outcome),
                State::Failed(error) => {
                    tracing::debug!("Session to {} failed: {}", request.container, error);
                    return Err(error);
                }
            };
        }
    }

    fn after_transient(&self, request: &SessionRequest, budget_used: u32, reason: String) -> State {
        if budget_used >= self.policy.attempts {
            tracing::error!(
                "Giving up on {} after {} attempts: {}",
                request.container,
                budget_used,
                reason
            );
            return State::Failed(SshAccessError::FatalConnect {
                container: request.container.clone(),
                reason: format!("{} (after {} attempts)", reason, budget_used),
            });
        }
        tracing::debug!("Transient failure connecting to {}: {}", request.container, reason);
        State::Backoff {
            retry: budget_used,
            delay: self.policy.delay(budget_used),
        }
    }

    async fn recover_trust(&self, request: &SessionRequest) -> Result<(), SshAccessError> {
        let removed = self.known_hosts.remove(self.host, request.port).await?;
        tracing::info!(
            "Invalidated {} stale host key entry/entries for {}",
            removed,
            request.container
        );
        let outcome = self
            .known_hosts
            .record_or_verify(
                self.scanner,
                self.keyscan,
                &request.container,
                self.host,
                request.port,
                true,
            )
            .await?;
        tracing::info!("Re-recorded host keys for {}: {:?}", request.container, outcome);

        // A recreated container starts with an empty authorized_keys
        let injected = identity::inject_public_key(
            self.runtime,
            &request.container,
            self.remote_user,
            self.identity,
        )
        .await?;
        if injected {
            tracing::info!("Re-authorized client key in {}", request.container);
        }
        Ok(())
    }

    async fn confirm_detached(&self, request: &SessionRequest, output: &AttemptOutput) -> State {
        let Some(pid) = parse_pid(&output.stdout) else {
            tracing::warn!(
                "Detached launch in {} printed no pid: {:?}",
                request.container,
                output.stdout.trim()
            );
            return State::Failed(SshAccessError::DetachedLaunchUnconfirmed {
                container: request.container.clone(),
                pid: output.stdout.trim().to_string(),
            });
        };

        tokio::time::sleep(self.detached_check_delay).await;

        let check = build_invocation(
            self.ssh_binary,
            &request.profile,
            &request.alias,
            ExecMode::Detached,
            Some(&format!("kill -0 {}", pid)),
        );
        let alive = match self.transport.attempt(&check).await {
            Ok(result) => result.exit_code == 0,
            Err(e) => {
                tracing::warn!("Liveness check for pid {} in {} failed: {}", pid, request.container, e);
                false
            }
        };

        if alive {
            tracing::info!("Detached command running in {} as pid {}", request.container, pid);
            State::Done(SessionOutcome::Detached {
                pid: pid.to_string(),
            })
        } else {
            tracing::warn!("Detached pid {} in {} is not running", pid, request.container);
            State::Failed(SshAccessError::DetachedLaunchUnconfirmed {
                container: request.container.clone(),
                pid: pid.to_string(),
            })
        }
    }

    fn progress(&self, request: &SessionRequest, message: String) {
        if request.quiet {
            tracing::debug!("{}", message);
        } else {
            tracing::info!("{}", message);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invocation_shape() {
        let inv = build_invocation(
            "ssh",
            Path::new("/s/hosts/ws.conf"),
            "sandbox-ws",
            ExecMode::Interactive,
            None,
        );
        assert_eq!(inv.args, vec!["-F", "/s/hosts/ws.conf", "-t", "--", "sandbox-ws"]);
        assert!(!inv.capture);

        let inv = build_invocation(
            "ssh",
            Path::new("/s/hosts/ws.conf"),
            "sandbox-ws",
            ExecMode::Foreground { tty: false },
            Some("ls -la"),
        );
        assert_eq!(
            inv.display(),
            "ssh -F /s/hosts/ws.conf -T -- sandbox-ws ls -la"
        );
    }

    #[test]
    fn test_remote_command_quoting() {
        assert_eq!(remote_command_line(&["ls -la | wc -l".to_string()]), "ls -la | wc -l");
        assert_eq!(
            remote_command_line(&["echo".to_string(), "it's here".to_string()]),
            "echo 'it'\\''s here'"
        );
        assert_eq!(
            remote_command_line(&["git".to_string(), "status".to_string()]),
            "git status"
        );
    }

    #[test]
    fn test_detached_wrapper() {
        let wrapped = detached_wrapper("python -m http.server");
        assert!(wrapped.contains("setsid nohup sh -c 'python -m http.server' >/dev/null 2>&1 </dev/null &"));
        assert!(wrapped.ends_with("echo $!"));
    }

    #[test]
    fn test_parse_pid() {
        assert_eq!(parse_pid("4242\n"), Some(4242));
        assert_eq!(parse_pid("motd line\n4242\n\n"), Some(4242));
        assert_eq!(parse_pid(""), None);
        assert_eq!(parse_pid("not a pid"), None);
        assert_eq!(parse_pid("0"), None);
    }

    #[test]
    fn test_retry_policy_schedule() {
        let policy = RetryPolicy::from_settings(&ConnectSettings::default());
        assert_eq!(policy.attempts, 3);
        assert_eq!(policy.delay(1), Duration::from_millis(500));
        assert_eq!(policy.delay(2), Duration::from_millis(1000));
        assert_eq!(policy.delay(3), Duration::from_millis(2000));
        assert_eq!(policy.delay(4), Duration::from_millis(4000));
        assert_eq!(policy.delay(10), Duration::from_millis(4000));
    }
}
