use serde::{Deserialize, Serialize};

/// How a session attaches to the caller.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum ExecMode {
    /// PTY allocated, attached to the caller's terminal until the remote shell exits.
    Interactive,
    /// Blocks until completion; remote stdout is surfaced to the caller.
    Foreground { tty: bool },
    /// Started under a supervisor on the remote side; returns once the pid is confirmed alive.
    Detached,
}

impl ExecMode {
    pub fn wants_tty(&self) -> bool {
        match self {
            ExecMode::Interactive => true,
            ExecMode::Foreground { tty } => *tty,
            ExecMode::Detached => false,
        }
    }
}

/// Classification of one failed connection attempt.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "camelCase")]
pub enum FailureKind {
    /// Refused / timed out / reset; worth retrying.
    Transient,
    /// The host presented a key that differs from the trust store.
    TrustViolation,
    /// Credentials rejected.
    Auth,
    /// Unresolvable address, no route, or anything else we will not retry.
    Fatal,
}

/// What a successfully established session produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionOutcome {
    /// The remote shell or command exited with this code.
    Exited(i32),
    /// A detached command was launched and its pid confirmed alive.
    Detached { pid: String },
}

impl SessionOutcome {
    pub fn exit_code(&self) -> i32 {
        match self {
            SessionOutcome::Exited(code) => *code,
            SessionOutcome::Detached { .. } => 0,
        }
    }
}

/// Options shared by `connect_shell` and `run`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionOptions {
    /// Replace any trusted host key for the container's port before connecting.
    pub force_trust: bool,
    /// Suppress progress messages.
    pub quiet: bool,
}

/// How `run` executes its command.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunOptions {
    #[serde(flatten)]
    pub session: SessionOptions,
    /// Launch under a supervisor and return once the pid is confirmed alive.
    pub detached: bool,
    /// Request a PTY for a foreground command.
    pub allocate_tty: bool,
}

impl RunOptions {
    pub fn mode(&self) -> ExecMode {
        if self.detached {
            ExecMode::Detached
        } else {
            ExecMode::Foreground {
                tty: self.allocate_tty,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_options_mode() {
        let mut options = RunOptions::default();
        assert_eq!(options.mode(), ExecMode::Foreground { tty: false });
        options.allocate_tty = true;
        assert!(options.mode().wants_tty());
        options.detached = true;
        assert_eq!(options.mode(), ExecMode::Detached);
        assert!(!options.mode().wants_tty());
    }

    #[test]
    fn test_detached_outcome_exit_code() {
        let outcome = SessionOutcome::Detached {
            pid: "42".to_string(),
        };
        assert_eq!(outcome.exit_code(), 0);
        assert_eq!(SessionOutcome::Exited(3).exit_code(), 3);
    }
}
