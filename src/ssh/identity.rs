//! The single client keypair used for every container.
//!
//! Created once with `ssh-keygen`, never rotated. The public half is appended
//! to the container's `authorized_keys`; membership is decided by key material
//! only, so a differing comment on either side never causes a duplicate.

use ssh_key::authorized_keys::AuthorizedKeys;
use ssh_key::PublicKey;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use crate::config::SshAccessConfig;
use crate::executor::{CommandExecutor, CommandSpec};
use crate::models::error::SshAccessError;
use crate::runtime::ContainerRuntimeApi;

const KEY_COMMENT: &str = "sandbox-ssh";
const KEYGEN_TIMEOUT: Duration = Duration::from_secs(30);

/// The local keypair, by path, plus the parsed public half
#[derive(Debug, Clone)]
pub struct Identity {
    pub private_path: PathBuf,
    pub public_path: PathBuf,
    pub public_key: PublicKey,
}

impl Identity {
    /// The line appended to `authorized_keys`
    pub fn authorized_line(&self) -> Result<String, SshAccessError> {
        self.public_key
            .to_openssh()
            .map_err(|e| SshAccessError::IdentityError(format!("Failed to encode public key: {}", e)))
    }
}

/// Make sure the keypair exists with owner-only permissions and return it.
pub async fn ensure_identity(
    config: &SshAccessConfig,
    executor: &Arc<dyn CommandExecutor>,
) -> Result<Identity, SshAccessError> {
    let private_path = config.identity_path();
    let public_path = config.public_key_path();

    if !private_path.exists() {
        create_state_dir(&config.state_dir)?;
        generate_keypair(executor, &config.keygen_binary, &private_path).await?;
        tracing::info!("Generated SSH identity at {}", private_path.display());
    } else if !public_path.exists() {
        derive_public_key(executor, &config.keygen_binary, &private_path, &public_path).await?;
        tracing::info!("Restored missing public key {}", public_path.display());
    }

    restrict_permissions(&private_path)?;

    let content =
        fs::read_to_string(&public_path).map_err(|e| SshAccessError::io(&public_path, e))?;
    let public_key = PublicKey::from_openssh(content.trim()).map_err(|e| {
        SshAccessError::IdentityError(format!(
            "Failed to parse public key {}: {}",
            public_path.display(),
            e
        ))
    })?;

    Ok(Identity {
        private_path,
        public_path,
        public_key,
    })
}

fn create_state_dir(dir: &Path) -> Result<(), SshAccessError> {
    fs::create_dir_all(dir).map_err(|e| SshAccessError::io(dir, e))?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(dir, fs::Permissions::from_mode(0o700))
            .map_err(|e| SshAccessError::io(dir, e))?;
    }
    Ok(())
}

fn restrict_permissions(path: &Path) -> Result<(), SshAccessError> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mode = fs::metadata(path)
            .map_err(|e| SshAccessError::io(path, e))?
            .permissions()
            .mode();
        if mode & 0o077 != 0 {
            fs::set_permissions(path, fs::Permissions::from_mode(0o600))
                .map_err(|e| SshAccessError::io(path, e))?;
            tracing::warn!("Tightened permissions on {}", path.display());
        }
    }
    #[cfg(not(unix))]
    {
        let _ = path;
    }
    Ok(())
}

async fn generate_keypair(
    executor: &Arc<dyn CommandExecutor>,
    keygen: &str,
    private_path: &Path,
) -> Result<(), SshAccessError> {
    let command = CommandSpec::new(keygen).args([
        "-q".to_string(),
        "-t".to_string(),
        "ed25519".to_string(),
        "-N".to_string(),
        String::new(),
        "-C".to_string(),
        KEY_COMMENT.to_string(),
        "-f".to_string(),
        private_path.display().to_string(),
    ]);

    let result = executor.execute_with_timeout(&command, KEYGEN_TIMEOUT).await?;
    if !result.success() {
        return Err(SshAccessError::IdentityError(format!(
            "ssh-keygen failed (exit {}): {}",
            result.exit_code,
            result.combined_output().trim()
        )));
    }
    Ok(())
}

async fn derive_public_key(
    executor: &Arc<dyn CommandExecutor>,
    keygen: &str,
    private_path: &Path,
    public_path: &Path,
) -> Result<(), SshAccessError> {
    let command = CommandSpec::new(keygen).args([
        "-y".to_string(),
        "-f".to_string(),
        private_path.display().to_string(),
    ]);
    let result = executor.execute_with_timeout(&command, KEYGEN_TIMEOUT).await?;
    if !result.success() {
        return Err(SshAccessError::IdentityError(format!(
            "Could not derive public key from {}: {}",
            private_path.display(),
            result.stderr.trim()
        )));
    }
    fs::write(public_path, format!("{}\n", result.stdout.trim()))
        .map_err(|e| SshAccessError::io(public_path, e))
}

/// Whether `authorized_keys` content already holds `key`, ignoring comments
pub fn authorized_keys_contains(content: &str, key: &PublicKey) -> bool {
    AuthorizedKeys::new(content)
        .flatten()
        .any(|entry| entry.public_key().key_data() == key.key_data())
}

const READ_AUTHORIZED_KEYS: &str = "cat \"$HOME/.ssh/authorized_keys\" 2>/dev/null || true";
const APPEND_AUTHORIZED_KEYS: &str = "umask 077 && mkdir -p \"$HOME/.ssh\" && chmod 700 \"$HOME/.ssh\" \
     && cat >> \"$HOME/.ssh/authorized_keys\" && chmod 600 \"$HOME/.ssh/authorized_keys\"";

/// Append the identity to the container user's `authorized_keys` unless present.
/// Returns whether the file changed.
pub async fn inject_public_key(
    runtime: &dyn ContainerRuntimeApi,
    container: &str,
    user: &str,
    identity: &Identity,
) -> Result<bool, SshAccessError> {
    let existing = runtime
        .exec(container, user, &["sh", "-c", READ_AUTHORIZED_KEYS], None)
        .await?;
    if !existing.success() {
        return Err(SshAccessError::CommandExecutionFailed {
            command: format!("read authorized_keys in {}", container),
            exit_code: existing.exit_code,
            stderr: existing.stderr,
        });
    }

    if authorized_keys_contains(&existing.stdout, &identity.public_key) {
        tracing::debug!("Public key already authorized in {}", container);
        return Ok(false);
    }

    let mut payload = String::new();
    if !existing.stdout.is_empty() && !existing.stdout.ends_with('\n') {
        payload.push('\n');
    }
    payload.push_str(identity.authorized_line()?.trim_end());
    payload.push('\n');

    let result = runtime
        .exec(container, user, &["sh", "-c", APPEND_AUTHORIZED_KEYS], Some(&payload))
        .await?;
    if !result.success() {
        return Err(SshAccessError::CommandExecutionFailed {
            command: format!("append authorized_keys in {}", container),
            exit_code: result.exit_code,
            stderr: result.stderr,
        });
    }

    tracing::info!("Authorized SSH identity for {}@{}", user, container);
    Ok(true)
}
