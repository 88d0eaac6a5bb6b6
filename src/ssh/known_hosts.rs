/// Trust store for container host keys.
///
/// The file uses OpenSSH known_hosts syntax so the `ssh` client can consume it
/// directly via `UserKnownHostsFile`:
/// - Port 22 entries use the bare host, every other port uses `[host]:port`
/// - At most one current key per algorithm per host label
/// - A changed key for a known algorithm is a trust violation unless forced
/// - A previously unseen algorithm is appended
///
/// Writers serialize on a lease next to the store (see [`crate::ssh::lock`]).
use std::borrow::Cow;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use hmac::{Hmac, Mac};
use sha1::Sha1;
use ssh_key::{HashAlg, PublicKey};

use crate::config::KeyscanSettings;
use crate::models::error::SshAccessError;
use crate::ssh::keyscan::KeyScanner;
use crate::ssh::lock::{self, LeaseOutcome};

/// Result of reconciling scanned keys with the store
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TrustOutcome {
    /// Store already held exactly these keys; nothing written
    Unchanged,
    /// Entries for the label were (re)written from the scan
    Recorded { algorithms: Vec<String> },
    /// New algorithms were appended next to the existing trusted keys
    Extended { algorithms: Vec<String> },
}

/// What to do with the store, computed without touching the filesystem
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TrustPlan {
    Unchanged,
    /// Remove every line for the label, then append these keys
    Replace(Vec<PublicKey>),
    /// Append these keys, leaving existing lines alone
    Append(Vec<PublicKey>),
    Violation {
        algorithms: Vec<String>,
        fingerprints: Vec<String>,
    },
}

/// Keys currently recorded for one host label
#[derive(Debug, Default, Clone)]
pub struct RecordedKeys {
    pub trusted: Vec<PublicKey>,
    pub revoked: Vec<PublicKey>,
}

impl RecordedKeys {
    pub fn is_empty(&self) -> bool {
        self.trusted.is_empty() && self.revoked.is_empty()
    }
}

/// Build the known_hosts host label for a host/port pair.
pub fn host_label(hostname: &str, port: u16) -> String {
    if port == 22 {
        hostname.to_string()
    } else {
        format!("[{}]:{}", hostname, port)
    }
}

/// Decide how the store must change given what is recorded and what was scanned.
pub fn plan_update(recorded: &RecordedKeys, scanned: &[PublicKey], force: bool) -> TrustPlan {
    let scanned = dedup_by_algorithm(scanned);

    if recorded.is_empty() || force {
        if same_key_set(&recorded.trusted, &scanned) && recorded.revoked.is_empty() {
            return TrustPlan::Unchanged;
        }
        return TrustPlan::Replace(scanned);
    }

    let mut algorithms = Vec::new();
    let mut fingerprints = Vec::new();
    let mut additions = Vec::new();

    for key in &scanned {
        let algorithm = key.algorithm();

        if recorded
            .revoked
            .iter()
            .any(|r| r.key_data() == key.key_data())
        {
            algorithms.push(algorithm.as_str().to_string());
            fingerprints.push(format!("{} {} (revoked)", algorithm.as_str(), fingerprint(key)));
            continue;
        }

        let same_algorithm: Vec<&PublicKey> = recorded
            .trusted
            .iter()
            .filter(|t| t.algorithm() == algorithm)
            .collect();

        if same_algorithm.is_empty() {
            additions.push(key.clone());
        } else if !same_algorithm.iter().any(|t| t.key_data() == key.key_data()) {
            algorithms.push(algorithm.as_str().to_string());
            fingerprints.push(format!(
                "{} {} -> {}",
                algorithm.as_str(),
                fingerprint(same_algorithm[0]),
                fingerprint(key)
            ));
        }
    }

    if !algorithms.is_empty() {
        TrustPlan::Violation {
            algorithms,
            fingerprints,
        }
    } else if !additions.is_empty() {
        TrustPlan::Append(additions)
    } else {
        TrustPlan::Unchanged
    }
}

fn dedup_by_algorithm(keys: &[PublicKey]) -> Vec<PublicKey> {
    let mut out: Vec<PublicKey> = Vec::new();
    for key in keys {
        if !out.iter().any(|k| k.algorithm() == key.algorithm()) {
            out.push(PublicKey::from(key.key_data().clone()));
        }
    }
    out
}

fn same_key_set(a: &[PublicKey], b: &[PublicKey]) -> bool {
    a.len() == b.len()
        && a.iter().all(|x| b.iter().any(|y| x.key_data() == y.key_data()))
        && b.iter().all(|y| a.iter().any(|x| x.key_data() == y.key_data()))
}

/// SHA256 fingerprint in the format `ssh-keygen -l` prints
pub fn fingerprint(key: &PublicKey) -> String {
    key.fingerprint(HashAlg::Sha256).to_string()
}

/// Collect the keys recorded for exactly `label` from known_hosts content.
pub fn recorded_keys(content: &str, label: &str) -> RecordedKeys {
    let mut recorded = RecordedKeys::default();

    for line in content.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }

        for entry in ssh_key::known_hosts::KnownHosts::new(trimmed).flatten() {
            if !host_matches_label(entry.host_patterns(), label) {
                continue;
            }
            let key = PublicKey::from(entry.public_key().key_data().clone());
            match entry.marker() {
                Some(ssh_key::known_hosts::Marker::Revoked) => recorded.revoked.push(key),
                Some(ssh_key::known_hosts::Marker::CertAuthority) => {}
                None => recorded.trusted.push(key),
            }
        }
    }

    recorded
}

/// Render one known_hosts line
pub fn render_entry(label: &str, key: &PublicKey) -> Result<String, SshAccessError> {
    let encoded = PublicKey::from(key.key_data().clone())
        .to_openssh()
        .map_err(|e| SshAccessError::ParseError(format!("Failed to encode host key: {}", e)))?;
    Ok(format!("{} {}", label, encoded.trim_end()))
}

/// Apply a plan to known_hosts content, returning the new content.
/// `None` means the content does not change.
pub fn apply_plan(content: &str, label: &str, plan: &TrustPlan) -> Result<Option<String>, SshAccessError> {
    let (base, keys) = match plan {
        TrustPlan::Unchanged | TrustPlan::Violation { .. } => return Ok(None),
        TrustPlan::Replace(keys) => (remove_entries_from_content(content, label).0, keys),
        TrustPlan::Append(keys) => (content.to_string(), keys),
    };

    let mut output = base;
    if !output.is_empty() && !output.ends_with('\n') {
        output.push('\n');
    }
    for key in keys {
        output.push_str(&render_entry(label, key)?);
        output.push('\n');
    }
    Ok(Some(output))
}

/// Remove host key entries for `label` from known_hosts content.
/// Returns (remaining_content, entries_removed).
///
/// A line listing several host patterns loses only the patterns matching
/// `label`; the line itself goes once no positive pattern is left.
pub fn remove_entries_from_content(content: &str, label: &str) -> (String, usize) {
    let mut kept_lines: Vec<Cow<'_, str>> = Vec::new();
    let mut removed = 0usize;

    for line in content.lines() {
        let trimmed = line.trim();

        // Preserve comments and blank lines
        if trimmed.is_empty() || trimmed.starts_with('#') {
            kept_lines.push(Cow::Borrowed(line));
            continue;
        }

        let matches_host = ssh_key::known_hosts::KnownHosts::new(trimmed)
            .flatten()
            .any(|entry| host_matches_label(entry.host_patterns(), label));
        if !matches_host {
            kept_lines.push(Cow::Borrowed(line));
            continue;
        }

        removed += 1;
        if let Some(narrowed) = without_label_patterns(trimmed, label) {
            kept_lines.push(Cow::Owned(narrowed));
        }
    }

    let mut output = kept_lines.join("\n");
    if !output.is_empty() {
        output.push('\n');
    }

    (output, removed)
}

/// The line with every pattern matching `label` dropped from its host list,
/// or `None` when nothing would still match another host
fn without_label_patterns(line: &str, label: &str) -> Option<String> {
    let mut fields = line.split_whitespace();
    let first = fields.next()?;
    let (marker, hosts) = if first.starts_with('@') {
        (Some(first), fields.next()?)
    } else {
        (None, first)
    };

    // Hashed names hide the pattern; the whole entry goes
    if hosts.starts_with("|1|") {
        return None;
    }

    let remaining: Vec<&str> = hosts
        .split(',')
        .filter(|pat| pat.starts_with('!') || !glob_match(pat, label))
        .collect();
    if !remaining.iter().any(|pat| !pat.starts_with('!')) {
        return None;
    }

    let joined = remaining.join(",");
    let mut rebuilt: Vec<&str> = marker.into_iter().collect();
    rebuilt.push(&joined);
    rebuilt.extend(fields);
    Some(rebuilt.join(" "))
}

/// Strict host matching: only matches against `host_label` (which includes
/// port info for non-22 ports), so removing a non-standard port entry never
/// touches the port-22 entry for the same host.
fn host_matches_label(patterns: &ssh_key::known_hosts::HostPatterns, host_label: &str) -> bool {
    match patterns {
        ssh_key::known_hosts::HostPatterns::Patterns(pats) => {
            let mut matched = false;
            for pat in pats {
                if let Some(negated) = pat.strip_prefix('!') {
                    if glob_match(negated, host_label) {
                        return false;
                    }
                } else if glob_match(pat, host_label) {
                    matched = true;
                }
            }
            matched
        }
        ssh_key::known_hosts::HostPatterns::HashedName { salt, hash } => {
            hash_matches(salt, hash, host_label)
        }
    }
}

/// Check if HMAC-SHA1(salt, name) == hash
fn hash_matches(salt: &[u8], expected_hash: &[u8; 20], name: &str) -> bool {
    let Ok(mut mac) = Hmac::<Sha1>::new_from_slice(salt) else {
        return false;
    };
    mac.update(name.as_bytes());
    let result = mac.finalize().into_bytes();
    result.as_slice() == expected_hash
}

/// Simple glob pattern matching supporting * and ? wildcards.
fn glob_match(pattern: &str, text: &str) -> bool {
    let p: Vec<char> = pattern.chars().collect();
    let t: Vec<char> = text.chars().collect();
    glob_match_inner(&p, &t)
}

fn glob_match_inner(pattern: &[char], text: &[char]) -> bool {
    match (pattern.first(), text.first()) {
        (None, None) => true,
        (Some('*'), _) => {
            glob_match_inner(&pattern[1..], text)
                || (!text.is_empty() && glob_match_inner(pattern, &text[1..]))
        }
        (Some('?'), Some(_)) => glob_match_inner(&pattern[1..], &text[1..]),
        (Some(p), Some(t)) if *p == *t => glob_match_inner(&pattern[1..], &text[1..]),
        _ => false,
    }
}

/// The on-disk trust store plus its writer lease
pub struct KnownHostsStore {
    path: PathBuf,
    lock_path: PathBuf,
    lock_timeout: Duration,
}

impl KnownHostsStore {
    pub fn new(path: PathBuf, lock_path: PathBuf, lock_timeout: Duration) -> Self {
        Self {
            path,
            lock_path,
            lock_timeout,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read(&self) -> Result<String, SshAccessError> {
        match fs::read_to_string(&self.path) {
            Ok(c) => Ok(c),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(String::new()),
            Err(e) => Err(SshAccessError::io(&self.path, e)),
        }
    }

    /// Replace the store atomically, owner read/write only
    fn write(&self, content: &str) -> Result<(), SshAccessError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(|e| SshAccessError::io(parent, e))?;
        }

        let tmp = self.path.with_extension("tmp");
        fs::write(&tmp, content.as_bytes()).map_err(|e| SshAccessError::io(&tmp, e))?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&tmp, fs::Permissions::from_mode(0o600))
                .map_err(|e| SshAccessError::io(&tmp, e))?;
        }

        fs::rename(&tmp, &self.path).map_err(|e| SshAccessError::io(&self.path, e))
    }

    /// Keys currently trusted for a host/port
    pub fn entries_for(&self, hostname: &str, port: u16) -> Result<RecordedKeys, SshAccessError> {
        Ok(recorded_keys(&self.read()?, &host_label(hostname, port)))
    }

    /// Scan the daemon's host keys and reconcile them with the store.
    ///
    /// Fails with `TrustViolation` (store untouched) when a known algorithm now
    /// presents different key material and `force` is false.
    pub async fn record_or_verify(
        &self,
        scanner: &dyn KeyScanner,
        settings: &KeyscanSettings,
        container: &str,
        hostname: &str,
        port: u16,
        force: bool,
    ) -> Result<TrustOutcome, SshAccessError> {
        let scanned = scan_with_retry(scanner, settings, container, hostname, port).await?;
        let label = host_label(hostname, port);

        let _lease = lock::acquire(&self.lock_path, self.lock_timeout).await;
        if let LeaseOutcome::DegradedUnprotected { reason } = &_lease {
            tracing::warn!("Updating {} without a lease: {:?}", self.path.display(), reason);
        }

        let content = self.read()?;
        let recorded = recorded_keys(&content, &label);
        let plan = plan_update(&recorded, &scanned, force);

        let outcome = match &plan {
            TrustPlan::Violation {
                algorithms,
                fingerprints,
            } => {
                tracing::error!(
                    "HOST KEY CHANGED for {} ({}): {}",
                    container,
                    label,
                    fingerprints.join("; ")
                );
                return Err(SshAccessError::TrustViolation {
                    container: container.to_string(),
                    port,
                    algorithms: algorithms.clone(),
                    fingerprints: fingerprints.clone(),
                });
            }
            TrustPlan::Unchanged => TrustOutcome::Unchanged,
            TrustPlan::Replace(keys) => TrustOutcome::Recorded {
                algorithms: algorithm_names(keys),
            },
            TrustPlan::Append(keys) => TrustOutcome::Extended {
                algorithms: algorithm_names(keys),
            },
        };

        if let Some(updated) = apply_plan(&content, &label, &plan)? {
            self.write(&updated)?;
            tracing::info!("Trust store updated for {} ({}): {:?}", container, label, outcome);
        } else {
            tracing::debug!("Trust store already current for {} ({})", container, label);
        }

        Ok(outcome)
    }

    /// Remove all entries for a host/port. Returns the number of lines removed.
    pub async fn remove(&self, hostname: &str, port: u16) -> Result<usize, SshAccessError> {
        let label = host_label(hostname, port);
        let _lease = lock::acquire(&self.lock_path, self.lock_timeout).await;

        let content = self.read()?;
        let (remaining, removed) = remove_entries_from_content(&content, &label);
        if removed > 0 {
            self.write(&remaining)?;
            tracing::info!(
                "Removed {} host key entry/entries for {} from {}",
                removed,
                label,
                self.path.display()
            );
        }
        Ok(removed)
    }
}

fn algorithm_names(keys: &[PublicKey]) -> Vec<String> {
    keys.iter()
        .map(|k| k.algorithm().as_str().to_string())
        .collect()
}

/// Scan with bounded retries; a just-started daemon may not accept connections yet.
async fn scan_with_retry(
    scanner: &dyn KeyScanner,
    settings: &KeyscanSettings,
    container: &str,
    hostname: &str,
    port: u16,
) -> Result<Vec<PublicKey>, SshAccessError> {
    let timeout = Duration::from_millis(settings.timeout_ms);
    let mut delay = Duration::from_millis(settings.initial_backoff_ms);
    let mut last_error: Option<SshAccessError> = None;
    // Per-algorithm map keeps the result stable if a later attempt reorders keys
    let mut found: BTreeMap<String, PublicKey> = BTreeMap::new();

    for attempt in 1..=settings.attempts {
        match scanner.scan(hostname, port, timeout).await {
            Ok(keys) if !keys.is_empty() => {
                for key in keys {
                    found
                        .entry(key.algorithm().as_str().to_string())
                        .or_insert(key);
                }
                return Ok(found.into_values().collect());
            }
            Ok(_) => {
                tracing::debug!(
                    "Host key scan of {}:{} returned nothing (attempt {}/{})",
                    hostname,
                    port,
                    attempt,
                    settings.attempts
                );
            }
            Err(e) => {
                tracing::debug!(
                    "Host key scan of {}:{} failed (attempt {}/{}): {}",
                    hostname,
                    port,
                    attempt,
                    settings.attempts,
                    e
                );
                last_error = Some(e);
            }
        }

        if attempt < settings.attempts {
            tokio::time::sleep(delay).await;
            delay *= 2;
        }
    }

    Err(SshAccessError::TransientConnect {
        container: container.to_string(),
        reason: match last_error {
            Some(e) => format!("could not fetch host keys from {}:{}: {}", hostname, port, e),
            None => format!("no host keys offered on {}:{}", hostname, port),
        },
    })
}
