pub mod classify;
pub mod host_config;
pub mod identity;
pub mod keyscan;
pub mod known_hosts;
pub mod lock;
pub mod ports;
pub mod readiness;
pub mod session;

#[cfg(test)]
pub mod test_keys;

pub use host_config::{HostConfigWriter, HostProfile, StrictMode};
pub use identity::Identity;
pub use keyscan::{KeyScanner, KeyscanScanner};
pub use known_hosts::{KnownHostsStore, TrustOutcome};
pub use lock::{DegradeReason, LeaseGuard, LeaseOutcome};
pub use ports::{ListenerProbe, PortAllocator, PortReservation, SystemListenerProbe};
pub use readiness::{ProbeMode, ReadinessOutcome, ReadinessProber};
pub use session::{OpenSshTransport, SessionExecutor, SessionRequest, SshInvocation, SshTransport};
