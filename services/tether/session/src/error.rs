//! Session error taxonomy.

use tether_wire::WireError;
use thiserror::Error;

/// Errors raised while dialing, authenticating, or running a session.
///
/// None of these escape a session actor; each one is mapped to a state
/// transition. [`SessionError::is_fatal`] ends the session at once;
/// otherwise [`SessionError::counts_toward_retry`] decides whether the
/// failure consumes the key's reconnect budget.
#[derive(Error, Debug)]
pub enum SessionError {
    /// Pre-dial probe through the proxy failed or timed out
    #[error("proxy {proxy} unreachable: {reason}")]
    ProxyUnreachable {
        /// Proxy descriptor as given
        proxy: String,
        /// Why the probe failed
        reason: String,
    },

    /// Proxy descriptor could not be understood
    #[error("invalid proxy descriptor {0:?}")]
    InvalidProxy(String),

    /// TCP connect, proxy tunnel, TLS, or WebSocket upgrade failed
    #[error("dial failed: {0}")]
    Dial(String),

    /// No AUTH challenge arrived, or the response could not be sent
    #[error("handshake failed: {0}")]
    Handshake(String),

    /// Transport closed or errored after it was open
    #[error("transport closed: {0}")]
    TransportClosed(String),

    /// Too many liveness probes went unanswered
    #[error("no PONG for {missed} consecutive probes")]
    HeartbeatTimeout {
        /// Missed probe count at termination
        missed: u32,
    },

    /// Inbound frame could not be classified
    #[error("parse error: {0}")]
    Parse(#[from] WireError),

    /// Reconnect budget used up for this key
    #[error("gave up after {attempts} attempts")]
    RetryBudgetExhausted {
        /// Attempts recorded
        attempts: u32,
    },

    /// I/O error on the underlying socket
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl SessionError {
    /// Whether this failure consumes one reconnect attempt
    pub fn counts_toward_retry(&self) -> bool {
        !matches!(self, SessionError::ProxyUnreachable { .. })
    }

    /// Whether retrying can never succeed, e.g. a descriptor that does not parse
    pub fn is_fatal(&self) -> bool {
        matches!(self, SessionError::InvalidProxy(_))
    }
}

/// Result alias for session operations
pub type Result<T> = std::result::Result<T, SessionError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_accounting() {
        let unreachable = SessionError::ProxyUnreachable {
            proxy: "p1".to_string(),
            reason: "timeout".to_string(),
        };
        assert!(!unreachable.counts_toward_retry());
        assert!(!unreachable.is_fatal());

        let invalid = SessionError::InvalidProxy("ftp://x".to_string());
        assert!(invalid.is_fatal());
        assert!(invalid.counts_toward_retry());

        assert!(SessionError::Dial("refused".to_string()).counts_toward_retry());
        assert!(SessionError::Handshake("timeout".to_string()).counts_toward_retry());
        assert!(SessionError::TransportClosed("eof".to_string()).counts_toward_retry());
        assert!(SessionError::HeartbeatTimeout { missed: 3 }.counts_toward_retry());
    }
}
