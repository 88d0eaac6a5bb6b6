//! Waiting for a container's SSH daemon to accept connections.

use std::time::Duration;
use tokio::time::{sleep, Instant};

use crate::config::ReadinessSettings;
use crate::runtime::ContainerRuntimeApi;
use crate::ssh::keyscan::KeyScanner;

/// Timeout of each reachability probe inside the full wait
const PROBE_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeMode {
    /// Backoff polling within the configured budget
    Full,
    /// One short probe; for daemons believed to be warm already
    Quick,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadinessOutcome {
    Ready,
    TimedOut { waited: Duration },
    /// The container left the running state while we waited
    ContainerGone,
}

pub struct ReadinessProber<'a> {
    runtime: &'a dyn ContainerRuntimeApi,
    scanner: &'a dyn KeyScanner,
    settings: &'a ReadinessSettings,
    host: &'a str,
}

impl<'a> ReadinessProber<'a> {
    pub fn new(
        runtime: &'a dyn ContainerRuntimeApi,
        scanner: &'a dyn KeyScanner,
        settings: &'a ReadinessSettings,
        host: &'a str,
    ) -> Self {
        Self {
            runtime,
            scanner,
            settings,
            host,
        }
    }

    pub async fn wait_ready(&self, container: &str, port: u16, mode: ProbeMode) -> ReadinessOutcome {
        match mode {
            ProbeMode::Quick => self.quick(port).await,
            ProbeMode::Full => self.full(container, port).await,
        }
    }

    async fn quick(&self, port: u16) -> ReadinessOutcome {
        let started = Instant::now();
        let timeout = Duration::from_millis(self.settings.quick_timeout_ms);
        if self.probe(port, timeout).await {
            ReadinessOutcome::Ready
        } else {
            ReadinessOutcome::TimedOut {
                waited: started.elapsed(),
            }
        }
    }

    async fn full(&self, container: &str, port: u16) -> ReadinessOutcome {
        let started = Instant::now();
        // Budget is wall clock, so a slow probe eats into it
        let deadline = started + Duration::from_millis(self.settings.budget_ms);
        let cap = Duration::from_millis(self.settings.max_interval_ms);
        let mut interval = Duration::from_millis(self.settings.initial_interval_ms);
        let mut attempt = 0u32;

        loop {
            attempt += 1;

            match self.runtime.inspect(container).await {
                Ok(Some(info)) if info.is_running() => {}
                Ok(_) => {
                    tracing::warn!("{} is no longer running; giving up on SSH readiness", container);
                    return ReadinessOutcome::ContainerGone;
                }
                Err(e) => tracing::debug!("Inspecting {} failed during readiness: {}", container, e),
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if self.probe(port, PROBE_TIMEOUT.min(remaining)).await {
                tracing::debug!(
                    "SSH daemon in {} ready on port {} after {} probe(s)",
                    container,
                    port,
                    attempt
                );
                return ReadinessOutcome::Ready;
            }

            let now = Instant::now();
            if now >= deadline {
                let waited = now - started;
                tracing::warn!(
                    "SSH daemon in {} not ready after {:?} ({} probes)",
                    container,
                    waited,
                    attempt
                );
                return ReadinessOutcome::TimedOut { waited };
            }

            sleep(interval.min(deadline - now)).await;
            interval = (interval * 2).min(cap);
        }
    }

    async fn probe(&self, port: u16, timeout: Duration) -> bool {
        if timeout.is_zero() {
            return false;
        }
        match tokio::time::timeout(timeout, self.scanner.scan(self.host, port, timeout)).await {
            Ok(Ok(keys)) => !keys.is_empty(),
            Ok(Err(e)) => {
                tracing::trace!("Readiness probe on {}:{} failed: {}", self.host, port, e);
                false
            }
            Err(_) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::CommandResult;
    use crate::models::container::{ContainerInfo, ContainerStatus};
    use crate::models::error::SshAccessError;
    use crate::ssh::test_keys::{key, ED25519_1};
    use async_trait::async_trait;
    use ssh_key::PublicKey;
    use std::collections::HashMap;
    use std::sync::Mutex;

    struct StatusRuntime {
        statuses: Mutex<Vec<ContainerStatus>>,
    }

    #[async_trait]
    impl ContainerRuntimeApi for StatusRuntime {
        async fn inspect(&self, name: &str) -> Result<Option<ContainerInfo>, SshAccessError> {
            let mut statuses = self.statuses.lock().unwrap();
            let status = if statuses.len() > 1 {
                statuses.remove(0)
            } else {
                statuses[0]
            };
            Ok(Some(ContainerInfo {
                id: "id".to_string(),
                name: name.to_string(),
                image: "sandbox-ssh/agent".to_string(),
                status,
                labels: HashMap::new(),
                ssh_port: Some(2300),
            }))
        }

        async fn list_managed(&self) -> Result<Vec<ContainerInfo>, SshAccessError> {
            Ok(Vec::new())
        }

        async fn start(&self, _name: &str) -> Result<(), SshAccessError> {
            Ok(())
        }

        async fn exec(
            &self,
            _name: &str,
            _user: &str,
            _argv: &[&str],
            _stdin: Option<&str>,
        ) -> Result<CommandResult, SshAccessError> {
            unreachable!()
        }

        fn logs_hint(&self, name: &str) -> String {
            format!("docker logs {}", name)
        }
    }

    /// Answers with keys once `ready_after` scans have happened
    struct CountingScanner {
        ready_after: u32,
        calls: Mutex<Vec<Instant>>,
    }

    #[async_trait]
    impl KeyScanner for CountingScanner {
        async fn scan(
            &self,
            _host: &str,
            _port: u16,
            _timeout: Duration,
        ) -> Result<Vec<PublicKey>, SshAccessError> {
            let mut calls = self.calls.lock().unwrap();
            calls.push(Instant::now());
            if calls.len() as u32 > self.ready_after {
                Ok(vec![key(ED25519_1)])
            } else {
                Ok(Vec::new())
            }
        }
    }

    fn running() -> StatusRuntime {
        StatusRuntime {
            statuses: Mutex::new(vec![ContainerStatus::Running]),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_full_wait_backs_off_until_ready() {
        let runtime = running();
        let scanner = CountingScanner {
            ready_after: 3,
            calls: Mutex::new(Vec::new()),
        };
        let settings = ReadinessSettings::default();
        let prober = ReadinessProber::new(&runtime, &scanner, &settings, "127.0.0.1");

        let outcome = prober.wait_ready("ws", 2300, ProbeMode::Full).await;
        assert_eq!(outcome, ReadinessOutcome::Ready);

        let calls = scanner.calls.lock().unwrap();
        assert_eq!(calls.len(), 4);
        let gaps: Vec<Duration> = calls.windows(2).map(|w| w[1] - w[0]).collect();
        for (gap, expected) in gaps.iter().zip([100u64, 200, 400]) {
            assert!(*gap >= Duration::from_millis(expected), "{:?}", gaps);
            assert!(*gap < Duration::from_millis(expected + 10), "{:?}", gaps);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_full_wait_respects_budget() {
        let runtime = running();
        let scanner = CountingScanner {
            ready_after: u32::MAX,
            calls: Mutex::new(Vec::new()),
        };
        let settings = ReadinessSettings::default();
        let prober = ReadinessProber::new(&runtime, &scanner, &settings, "127.0.0.1");

        let started = Instant::now();
        let outcome = prober.wait_ready("ws", 2300, ProbeMode::Full).await;
        assert!(matches!(outcome, ReadinessOutcome::TimedOut { .. }));
        assert!(started.elapsed() >= Duration::from_secs(30));
        assert!(started.elapsed() < Duration::from_secs(31));

        let calls = scanner.calls.lock().unwrap();
        // Intervals never exceed the cap
        assert!(calls
            .windows(2)
            .all(|w| w[1] - w[0] <= Duration::from_millis(2_010)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_container_gone_fails_fast() {
        let runtime = StatusRuntime {
            statuses: Mutex::new(vec![
                ContainerStatus::Running,
                ContainerStatus::Running,
                ContainerStatus::Exited,
            ]),
        };
        let scanner = CountingScanner {
            ready_after: u32::MAX,
            calls: Mutex::new(Vec::new()),
        };
        let settings = ReadinessSettings::default();
        let prober = ReadinessProber::new(&runtime, &scanner, &settings, "127.0.0.1");

        let started = Instant::now();
        let outcome = prober.wait_ready("ws", 2300, ProbeMode::Full).await;
        assert_eq!(outcome, ReadinessOutcome::ContainerGone);
        assert!(started.elapsed() < Duration::from_secs(1));
        assert_eq!(scanner.calls.lock().unwrap().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_quick_mode_probes_once() {
        let runtime = running();
        let scanner = CountingScanner {
            ready_after: 1,
            calls: Mutex::new(Vec::new()),
        };
        let settings = ReadinessSettings::default();
        let prober = ReadinessProber::new(&runtime, &scanner, &settings, "127.0.0.1");

        let outcome = prober.wait_ready("ws", 2300, ProbeMode::Quick).await;
        assert!(matches!(outcome, ReadinessOutcome::TimedOut { .. }));
        assert_eq!(scanner.calls.lock().unwrap().len(), 1);

        assert_eq!(
            prober.wait_ready("ws", 2300, ProbeMode::Quick).await,
            ReadinessOutcome::Ready
        );
    }
}
