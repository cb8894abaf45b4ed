//! Error types for resilient calls
//!
//! - [`ErrorKind`]: closed classification of a failure
//! - [`OperationError`]: what a wrapped operation fails with
//! - [`ApplicationError`]: the single final error returned to callers
//! - [`ExecutionError`]: final error of a cancellable call

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Recoverability category of a failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Connection could not be established or was dropped
    Network,
    /// The backend did not answer in time
    Timeout,
    /// 5xx-equivalent or rate limited (429)
    Server,
    /// 4xx-equivalent other than validation, 408 and 429
    Client,
    /// The request itself was rejected as invalid
    Validation,
    /// Synthesized locally when a circuit breaker refuses the attempt
    CircuitOpen,
    /// Anything the classifier does not understand
    Unknown,
}

impl ErrorKind {
    /// Every kind, in declaration order
    pub const ALL: [ErrorKind; 7] = [
        ErrorKind::Network,
        ErrorKind::Timeout,
        ErrorKind::Server,
        ErrorKind::Client,
        ErrorKind::Validation,
        ErrorKind::CircuitOpen,
        ErrorKind::Unknown,
    ];

    /// Whether a retry can reasonably succeed
    ///
    /// `CircuitOpen` is transient but never retried inside the call that
    /// produced it; the breaker already decided.
    pub fn is_recoverable(self) -> bool {
        match self {
            ErrorKind::Network | ErrorKind::Timeout | ErrorKind::Server => true,
            ErrorKind::Client
            | ErrorKind::Validation
            | ErrorKind::CircuitOpen
            | ErrorKind::Unknown => false,
        }
    }

    /// Suggested base delay before retrying this kind of failure
    pub fn delay_hint(self) -> Duration {
        match self {
            ErrorKind::Network => Duration::from_millis(500),
            ErrorKind::Timeout => Duration::from_secs(1),
            ErrorKind::Server => Duration::from_secs(1),
            ErrorKind::CircuitOpen => Duration::from_secs(30),
            ErrorKind::Client | ErrorKind::Validation | ErrorKind::Unknown => Duration::ZERO,
        }
    }

    /// Stable snake_case name, as used in serialized metrics
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::Network => "network",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Server => "server",
            ErrorKind::Client => "client",
            ErrorKind::Validation => "validation",
            ErrorKind::CircuitOpen => "circuit_open",
            ErrorKind::Unknown => "unknown",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Failure raised by a wrapped operation
///
/// Carries the raw signals the classifier looks at: an HTTP-like status,
/// a transport or database error code, and the message. The original error
/// is kept as the `source`.
#[derive(Clone)]
pub struct OperationError {
    /// Human readable message
    pub message: String,

    /// HTTP-equivalent status code, if the transport has one
    pub status: Option<u16>,

    /// Transport or database error code (`ECONNRESET`, `57014`, `PGRST301`, ...)
    pub code: Option<String>,

    /// Server supplied hint for when to try again
    pub retry_after: Option<Duration>,

    source: Option<Arc<dyn std::error::Error + Send + Sync>>,
}

impl OperationError {
    /// Create an error with only a message
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            status: None,
            code: None,
            retry_after: None,
            source: None,
        }
    }

    /// Create an error from an HTTP-like status code
    pub fn http(status: u16, message: impl Into<String>) -> Self {
        Self::new(message).with_status(status)
    }

    /// Connection-level failure
    pub fn network(message: impl Into<String>) -> Self {
        Self::new(message).with_code("ECONNRESET")
    }

    /// Deadline exceeded
    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(message).with_code("ETIMEDOUT")
    }

    /// Invalid input rejected before or by the backend
    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(message).with_code(VALIDATION_CODE)
    }

    /// Set the status code
    pub fn with_status(mut self, status: u16) -> Self {
        self.status = Some(status);
        self
    }

    /// Set the error code
    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }

    /// Set the retry-after hint
    pub fn with_retry_after(mut self, retry_after: Duration) -> Self {
        self.retry_after = Some(retry_after);
        self
    }

    /// Attach the underlying error
    pub fn with_source(mut self, source: impl std::error::Error + Send + Sync + 'static) -> Self {
        self.source = Some(Arc::new(source));
        self
    }
}

pub(crate) const VALIDATION_CODE: &str = "VALIDATION_ERROR";

impl fmt::Debug for OperationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OperationError")
            .field("message", &self.message)
            .field("status", &self.status)
            .field("code", &self.code)
            .field("retry_after", &self.retry_after)
            .field("source", &self.source.as_ref().map(|s| s.to_string()))
            .finish()
    }
}

impl fmt::Display for OperationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.status, &self.code) {
            (Some(status), _) => write!(f, "{} (status {})", self.message, status),
            (None, Some(code)) => write!(f, "{} ({})", self.message, code),
            (None, None) => f.write_str(&self.message),
        }
    }
}

impl std::error::Error for OperationError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source
            .as_deref()
            .map(|e| e as &(dyn std::error::Error + 'static))
    }
}

impl From<std::io::Error> for OperationError {
    fn from(err: std::io::Error) -> Self {
        use std::io::ErrorKind as Io;

        let code = match err.kind() {
            Io::TimedOut => Some("ETIMEDOUT"),
            Io::ConnectionRefused => Some("ECONNREFUSED"),
            Io::ConnectionReset => Some("ECONNRESET"),
            Io::ConnectionAborted => Some("ECONNABORTED"),
            Io::NotConnected => Some("ENOTCONN"),
            Io::BrokenPipe => Some("EPIPE"),
            Io::AddrNotAvailable => Some("EADDRNOTAVAIL"),
            Io::InvalidInput => Some(VALIDATION_CODE),
            _ => None,
        };

        let mut error = Self::new(err.to_string());
        error.code = code.map(str::to_string);
        error.with_source(err)
    }
}

impl From<tokio::time::error::Elapsed> for OperationError {
    fn from(err: tokio::time::error::Elapsed) -> Self {
        Self::timeout("operation timed out").with_source(err)
    }
}

impl From<anyhow::Error> for OperationError {
    fn from(err: anyhow::Error) -> Self {
        match err.downcast::<std::io::Error>() {
            Ok(io) => io.into(),
            Err(err) => {
                let message = err.to_string();
                let source: Box<dyn std::error::Error + Send + Sync> = err.into();
                Self {
                    source: Some(Arc::from(source)),
                    ..Self::new(message)
                }
            }
        }
    }
}

/// One failed or short-circuited attempt of a call
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailedAttempt {
    /// 1-based attempt number
    pub attempt: u32,
    /// Classification of the failure
    pub kind: ErrorKind,
    /// Failure message
    pub message: String,
}

/// Final failure of a resilient call
///
/// Carries everything a caller needs to present the failure without
/// re-deriving it: the kind, how many attempts were made, the last
/// operation error and the full attempt history.
#[derive(Debug, Clone, Error)]
#[error("{operation_key} failed after {attempts} attempt(s): {kind}")]
pub struct ApplicationError {
    /// Logical operation name the call ran under
    pub operation_key: String,

    /// Kind of the final failure
    pub kind: ErrorKind,

    /// Number of attempts, including a final short-circuited one
    pub attempts: u32,

    /// Last error raised by the operation, if it was ever invoked
    #[source]
    pub cause: Option<OperationError>,

    /// Every failed attempt in order
    pub history: Vec<FailedAttempt>,
}

impl ApplicationError {
    /// Whether the call was refused by an open circuit
    pub fn is_circuit_open(&self) -> bool {
        self.kind == ErrorKind::CircuitOpen
    }

    /// Whether trying the whole call again later may succeed
    pub fn is_recoverable(&self) -> bool {
        self.kind.is_recoverable() || self.is_circuit_open()
    }
}

/// Final failure of a cancellable call
#[derive(Debug, Clone, Error)]
pub enum ExecutionError {
    /// The call failed on its own terms
    #[error(transparent)]
    Failed(#[from] ApplicationError),

    /// The caller cancelled the call
    #[error("{operation_key} cancelled after {attempts} attempt(s)")]
    Cancelled { operation_key: String, attempts: u32 },
}

impl ExecutionError {
    /// Whether the caller cancelled the call
    pub fn is_cancelled(&self) -> bool {
        matches!(self, ExecutionError::Cancelled { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error as _;

    #[test]
    fn test_recoverable_kinds() {
        let recoverable: Vec<_> = ErrorKind::ALL
            .into_iter()
            .filter(|kind| kind.is_recoverable())
            .collect();
        assert_eq!(
            recoverable,
            vec![ErrorKind::Network, ErrorKind::Timeout, ErrorKind::Server]
        );
    }

    #[test]
    fn test_delay_hints() {
        assert_eq!(ErrorKind::Network.delay_hint(), Duration::from_millis(500));
        assert_eq!(ErrorKind::Timeout.delay_hint(), Duration::from_secs(1));
        assert_eq!(ErrorKind::Server.delay_hint(), Duration::from_secs(1));
        assert_eq!(ErrorKind::CircuitOpen.delay_hint(), Duration::from_secs(30));

        for kind in ErrorKind::ALL {
            // Only kinds worth waiting for carry a hint
            let waits = kind.is_recoverable() || kind == ErrorKind::CircuitOpen;
            assert_eq!(!kind.delay_hint().is_zero(), waits, "{kind}");
        }
    }

    #[test]
    fn test_kind_serializes_snake_case() {
        let json = serde_json::to_string(&ErrorKind::CircuitOpen).unwrap();
        assert_eq!(json, "\"circuit_open\"");
        assert_eq!(ErrorKind::CircuitOpen.to_string(), "circuit_open");
    }

    #[test]
    fn test_io_error_maps_code_and_keeps_source() {
        let io = std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused");
        let err = OperationError::from(io);
        assert_eq!(err.code.as_deref(), Some("ECONNREFUSED"));
        assert!(err.source().is_some());
    }

    #[test]
    fn test_anyhow_io_error_is_unwrapped() {
        let io = std::io::Error::new(std::io::ErrorKind::TimedOut, "slow");
        let err = OperationError::from(anyhow::Error::new(io));
        assert_eq!(err.code.as_deref(), Some("ETIMEDOUT"));
    }

    #[test]
    fn test_anyhow_other_error_keeps_message() {
        let err = OperationError::from(anyhow::anyhow!("row decode failed"));
        assert_eq!(err.message, "row decode failed");
        assert!(err.code.is_none());
        assert!(err.source().is_some());
    }

    #[test]
    fn test_display_includes_status() {
        let err = OperationError::http(503, "upstream unavailable");
        assert_eq!(err.to_string(), "upstream unavailable (status 503)");
    }

    #[test]
    fn test_application_error_display_and_source() {
        let err = ApplicationError {
            operation_key: "fetch-contracts".into(),
            kind: ErrorKind::Network,
            attempts: 3,
            cause: Some(OperationError::network("reset by peer")),
            history: vec![],
        };
        assert_eq!(
            err.to_string(),
            "fetch-contracts failed after 3 attempt(s): network"
        );
        assert!(err.source().is_some());
        assert!(err.is_recoverable());
    }

    #[test]
    fn test_cancelled_is_distinct() {
        let err = ExecutionError::Cancelled {
            operation_key: "sync".into(),
            attempts: 2,
        };
        assert!(err.is_cancelled());
        assert_eq!(err.to_string(), "sync cancelled after 2 attempt(s)");
    }
}
