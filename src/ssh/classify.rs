//! Classification of `ssh` client diagnostics.
//!
//! The client reports every connection-level failure with exit code 255 and a
//! human-readable line on stderr. The table below maps those lines to a
//! [`FailureKind`]. Order matters: trust problems are checked before the
//! generic connection patterns, since a changed host key also ends with
//! "connection closed".

use crate::models::session::FailureKind;

/// Exit code the OpenSSH client uses for its own failures
pub const SSH_CLIENT_FAILURE: i32 = 255;

/// Lower-cased stderr substrings and the failure they indicate
pub const PATTERNS: &[(&str, FailureKind)] = &[
    // Trust
    ("remote host identification has changed", FailureKind::TrustViolation),
    ("host key verification failed", FailureKind::TrustViolation),
    ("has changed and you have requested strict checking", FailureKind::TrustViolation),
    ("offending ", FailureKind::TrustViolation),
    ("host key for", FailureKind::TrustViolation),
    // Credentials
    ("permission denied", FailureKind::Auth),
    ("too many authentication failures", FailureKind::Auth),
    ("no more authentication methods", FailureKind::Auth),
    ("authentication failed", FailureKind::Auth),
    // Never worth retrying
    ("could not resolve hostname", FailureKind::Fatal),
    ("name or service not known", FailureKind::Fatal),
    ("no route to host", FailureKind::Fatal),
    ("network is unreachable", FailureKind::Fatal),
    ("bad configuration option", FailureKind::Fatal),
    ("can't open user config file", FailureKind::Fatal),
    // Daemon not up yet, or mid-restart
    ("connection refused", FailureKind::Transient),
    ("connection timed out", FailureKind::Transient),
    ("operation timed out", FailureKind::Transient),
    ("connection reset", FailureKind::Transient),
    ("kex_exchange_identification", FailureKind::Transient),
    ("connection closed by", FailureKind::Transient),
    ("broken pipe", FailureKind::Transient),
    ("ssh_exchange_identification", FailureKind::Transient),
];

/// Classify client diagnostics. `None` means nothing recognisable was printed.
pub fn classify(stderr: &str) -> Option<FailureKind> {
    let lower = stderr.to_lowercase();
    PATTERNS
        .iter()
        .find(|(pattern, _)| lower.contains(pattern))
        .map(|(_, kind)| *kind)
}

/// Classify a finished client process.
///
/// Only exit code 255 can be a client failure; any other code came from the
/// remote command and is passed through. A 255 with no recognisable
/// diagnostic is also treated as the remote command's own exit code.
pub fn classify_exit(exit_code: i32, stderr: &str) -> Option<FailureKind> {
    if exit_code != SSH_CLIENT_FAILURE {
        return None;
    }
    classify(stderr)
}

/// The first stderr line that matched a pattern, for error messages
pub fn diagnostic_line(stderr: &str) -> String {
    stderr
        .lines()
        .map(str::trim)
        .find(|line| classify(line).is_some())
        .or_else(|| stderr.lines().map(str::trim).find(|l| !l.is_empty()))
        .unwrap_or("no diagnostic output")
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_patterns() {
        for stderr in [
            "ssh: connect to host 127.0.0.1 port 2300: Connection refused",
            "ssh: connect to host 127.0.0.1 port 2300: Connection timed out",
            "kex_exchange_identification: read: Connection reset by peer",
            "Connection closed by 127.0.0.1 port 2300",
            "client_loop: send disconnect: Broken pipe",
        ] {
            assert_eq!(classify(stderr), Some(FailureKind::Transient), "{}", stderr);
        }
    }

    #[test]
    fn test_trust_patterns() {
        let stderr = "@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@\n\
                      @    WARNING: REMOTE HOST IDENTIFICATION HAS CHANGED!     @\n\
                      Host key verification failed.\n\
                      Connection closed by 127.0.0.1 port 2300";
        assert_eq!(classify(stderr), Some(FailureKind::TrustViolation));
        assert_eq!(
            classify("Host key verification failed."),
            Some(FailureKind::TrustViolation)
        );
    }

    #[test]
    fn test_auth_patterns() {
        assert_eq!(
            classify("agent@127.0.0.1: Permission denied (publickey)."),
            Some(FailureKind::Auth)
        );
        assert_eq!(
            classify("Received disconnect from 127.0.0.1: Too many authentication failures"),
            Some(FailureKind::Auth)
        );
    }

    #[test]
    fn test_fatal_patterns() {
        assert_eq!(
            classify("ssh: Could not resolve hostname sandbox-x: Name or service not known"),
            Some(FailureKind::Fatal)
        );
        assert_eq!(
            classify("ssh: connect to host 10.0.0.9 port 22: No route to host"),
            Some(FailureKind::Fatal)
        );
        assert_eq!(
            classify("/tmp/hosts/ws.conf: line 3: Bad configuration option: bogus"),
            Some(FailureKind::Fatal)
        );
    }

    #[test]
    fn test_unrecognised_is_none() {
        assert_eq!(classify(""), None);
        assert_eq!(classify("bash: line 1: foo: command not found"), None);
    }

    #[test]
    fn test_non_client_exit_codes_pass_through() {
        assert_eq!(classify_exit(0, "Connection refused"), None);
        assert_eq!(classify_exit(1, "Permission denied"), None);
        assert_eq!(classify_exit(255, "script failed"), None);
        assert_eq!(
            classify_exit(255, "Connection refused"),
            Some(FailureKind::Transient)
        );
    }

    #[test]
    fn test_diagnostic_line_prefers_matching_line() {
        let stderr = "debug noise\nssh: connect to host 127.0.0.1 port 2300: Connection refused\n";
        assert_eq!(
            diagnostic_line(stderr),
            "ssh: connect to host 127.0.0.1 port 2300: Connection refused"
        );
        assert_eq!(diagnostic_line("just this"), "just this");
        assert_eq!(diagnostic_line(""), "no diagnostic output");
    }
}
