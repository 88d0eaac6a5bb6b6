use async_trait::async_trait;
use ssh_key::PublicKey;
use std::sync::Arc;
use std::time::Duration;

use crate::executor::{CommandExecutor, CommandSpec};
use crate::models::error::SshAccessError;

/// Host key algorithms requested from the daemon
const SCAN_KEY_TYPES: &str = "ed25519,ecdsa,rsa";

/// Fetches the host keys a daemon currently presents
#[async_trait]
pub trait KeyScanner: Send + Sync {
    /// Return every host key offered at `host:port`. An empty list means the
    /// daemon did not answer in time.
    async fn scan(
        &self,
        host: &str,
        port: u16,
        timeout: Duration,
    ) -> Result<Vec<PublicKey>, SshAccessError>;
}

/// Scanner backed by the `ssh-keyscan` binary
pub struct KeyscanScanner {
    executor: Arc<dyn CommandExecutor>,
    binary: String,
}

impl KeyscanScanner {
    pub fn new(executor: Arc<dyn CommandExecutor>, binary: impl Into<String>) -> Self {
        Self {
            executor,
            binary: binary.into(),
        }
    }

    fn command(&self, host: &str, port: u16, timeout: Duration) -> CommandSpec {
        // -T only accepts whole seconds
        let secs = timeout.as_secs().max(1);
        CommandSpec::new(&self.binary).args([
            "-T".to_string(),
            secs.to_string(),
            "-p".to_string(),
            port.to_string(),
            "-t".to_string(),
            SCAN_KEY_TYPES.to_string(),
            host.to_string(),
        ])
    }
}

#[async_trait]
impl KeyScanner for KeyscanScanner {
    async fn scan(
        &self,
        host: &str,
        port: u16,
        timeout: Duration,
    ) -> Result<Vec<PublicKey>, SshAccessError> {
        let command = self.command(host, port, timeout);
        // ssh-keyscan enforces -T per connection; the outer bound covers a wedged binary
        let result = self
            .executor
            .execute_with_timeout(&command, timeout + Duration::from_secs(2))
            .await?;

        // ssh-keyscan exits 0 even when nothing answered; the key list is the signal
        let keys = parse_keyscan_output(&result.stdout);
        tracing::trace!("ssh-keyscan {}:{} returned {} key(s)", host, port, keys.len());
        Ok(keys)
    }
}

/// Parse `ssh-keyscan` output (known_hosts format), one key per algorithm.
/// Comment lines and malformed lines are skipped.
pub fn parse_keyscan_output(output: &str) -> Vec<PublicKey> {
    let mut keys: Vec<PublicKey> = Vec::new();

    for line in output.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }

        for entry in ssh_key::known_hosts::KnownHosts::new(trimmed).flatten() {
            let key = PublicKey::from(entry.public_key().key_data().clone());
            if !keys.iter().any(|k| k.algorithm() == key.algorithm()) {
                keys.push(key);
            }
        }
    }

    keys
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ssh::test_keys::{ECDSA_1, ED25519_1, ED25519_2};

    #[test]
    fn test_parse_keyscan_output() {
        let output = format!(
            "# 127.0.0.1:2300 SSH-2.0-OpenSSH_9.6\n[127.0.0.1]:2300 {}\n[127.0.0.1]:2300 {}\n",
            ED25519_1, ECDSA_1
        );
        let keys = parse_keyscan_output(&output);
        assert_eq!(keys.len(), 2);
        assert_eq!(keys[0].algorithm().as_str(), "ssh-ed25519");
        assert_eq!(keys[1].algorithm().as_str(), "ecdsa-sha2-nistp256");
    }

    #[test]
    fn test_parse_keyscan_keeps_first_key_per_algorithm() {
        let output = format!("127.0.0.1 {}\n127.0.0.1 {}\n", ED25519_1, ED25519_2);
        let keys = parse_keyscan_output(&output);
        assert_eq!(keys.len(), 1);
        assert_eq!(keys[0], PublicKey::from_openssh(ED25519_1).unwrap());
    }

    #[test]
    fn test_parse_keyscan_skips_garbage() {
        let output = "connect to host 127.0.0.1 port 2300: Connection refused\n";
        assert!(parse_keyscan_output(output).is_empty());
    }

    #[test]
    fn test_keyscan_command_shape() {
        let scanner = KeyscanScanner::new(
            Arc::new(crate::executor::local::LocalExecutor::new()),
            "ssh-keyscan",
        );
        let cmd = scanner.command("127.0.0.1", 2300, Duration::from_millis(200));
        assert_eq!(
            cmd.display(),
            "ssh-keyscan -T 1 -p 2300 -t ed25519,ecdsa,rsa 127.0.0.1"
        );
    }
}
