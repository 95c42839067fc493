// Error taxonomy shared by every layer of the connection and orchestration core.

use thiserror::Error;

/// All failures surfaced by the middleware core.
///
/// - `Configuration`: bad URI or participant configuration, fatal at startup.
/// - `Connection` / `Timeout`: a connect attempt failed; retried by the negotiator,
///   then escalated through the fallback chain.
/// - `Protocol`: a malformed or unexpected wire message; fatal for one peer only.
/// - `InvalidState`: API misuse such as a re-entrant async operation.
#[derive(Debug, Error)]
pub enum CsError {
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("connection error: {0}")]
    Connection(String),

    #[error("operation timed out: {0}")]
    Timeout(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, CsError>;

impl CsError {
    pub fn configuration(msg: impl Into<String>) -> Self {
        CsError::Configuration(msg.into())
    }

    pub fn connection(msg: impl Into<String>) -> Self {
        CsError::Connection(msg.into())
    }

    pub fn protocol(msg: impl Into<String>) -> Self {
        CsError::Protocol(msg.into())
    }

    pub fn invalid_state(msg: impl Into<String>) -> Self {
        CsError::InvalidState(msg.into())
    }

    /// Errors after which an IO operation may simply be issued again.
    pub fn is_retryable(&self) -> bool {
        match self {
            CsError::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::WouldBlock | std::io::ErrorKind::Interrupted
            ),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display_carries_context() {
        let e = CsError::configuration("unknown scheme 'udp'");
        assert_eq!(e.to_string(), "configuration error: unknown scheme 'udp'");

        let e = CsError::invalid_state("AsyncAccept already pending");
        assert!(e.to_string().contains("already pending"));
    }

    #[test]
    fn test_retryable_io_kinds() {
        let e: CsError = std::io::Error::from(std::io::ErrorKind::WouldBlock).into();
        assert!(e.is_retryable());

        let e: CsError = std::io::Error::from(std::io::ErrorKind::ConnectionReset).into();
        assert!(!e.is_retryable());

        assert!(!CsError::Cancelled.is_retryable());
    }
}
