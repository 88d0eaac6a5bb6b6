pub mod access;
pub mod config;
pub mod executor;
pub mod models;
pub mod runtime;
pub mod ssh;

pub use access::{CleanupReport, Collaborators, EstablishReport, SshAccessManager};
pub use config::{PortRange, SshAccessConfig};
pub use models::error::{Result, SshAccessError};
pub use models::session::{ExecMode, RunOptions, SessionOptions, SessionOutcome};

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Install the default tracing subscriber.
///
/// Logs go to stderr; stdout carries remote command output. `RUST_LOG`
/// overrides the filter. Calling this more than once is harmless.
pub fn init_logging() {
    let _ = tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "sandbox_ssh=debug,info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .try_init();
}
