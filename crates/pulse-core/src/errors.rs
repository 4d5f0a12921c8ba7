//! Error taxonomy for the pulse stream client.
//!
//! - [`TransportError`]: Connection drops and network failures. Retried per
//!   backoff policy unless [`TransportError::is_retryable`] says otherwise.
//! - [`ParseError`]: A malformed wire frame. Recovered locally, never fatal.
//! - [`LockError`]: Lock conflict, lock deadline, or the wrapped operation's
//!   own failure.
//! - [`ConnectionError`]: Misuse of a connection handle (e.g. connect after dispose).
//!
//! Transport and parse errors are never returned to handler registrants;
//! the connection turns them into reserved events. Lock errors are returned
//! to the caller that triggered them.

use thiserror::Error;

// ─────────────────────────────────────────────────────────────────────────────
// TransportError
// ─────────────────────────────────────────────────────────────────────────────

/// A transport-level failure while opening or reading a stream.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum TransportError {
    /// The connection could not be established.
    #[error("connect failed: {message}")]
    Connect {
        /// Error description.
        message: String,
    },

    /// The server answered with a non-success status.
    #[error("unexpected status {status}: {body}")]
    Status {
        /// HTTP status code.
        status: u16,
        /// Response body preview.
        body: String,
    },

    /// The server answered with something other than an event stream.
    #[error("unexpected content type: {found}")]
    ContentType {
        /// The `Content-Type` header value received.
        found: String,
    },

    /// Reading from an open stream failed.
    #[error("stream read failed: {message}")]
    Read {
        /// Error description.
        message: String,
    },

    /// The server closed the stream.
    #[error("stream closed by server")]
    Dropped,

    /// No bytes arrived within the idle window.
    #[error("no data received for {timeout_ms}ms")]
    IdleTimeout {
        /// The idle window that elapsed.
        timeout_ms: u64,
    },

    /// Opening the transport did not finish within the connect window.
    #[error("connect timed out after {timeout_ms}ms")]
    ConnectTimeout {
        /// The connect window that elapsed.
        timeout_ms: u64,
    },

    /// A non-retryable failure signaled by the server.
    #[error("fatal server error: {message}")]
    Fatal {
        /// Error description.
        message: String,
    },
}

impl TransportError {
    /// Whether a reconnect attempt may follow this error.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Connect { .. }
            | Self::Read { .. }
            | Self::Dropped
            | Self::IdleTimeout { .. }
            | Self::ConnectTimeout { .. } => true,
            Self::Status { status, .. } => is_retryable_status(*status),
            Self::ContentType { .. } | Self::Fatal { .. } => false,
        }
    }

    /// Stable category string for notices and metrics labels.
    pub fn category(&self) -> &'static str {
        match self {
            Self::Connect { .. } | Self::ConnectTimeout { .. } => "connect",
            Self::Status { .. } => "status",
            Self::ContentType { .. } => "content_type",
            Self::Read { .. } => "read",
            Self::Dropped => "dropped",
            Self::IdleTimeout { .. } => "idle_timeout",
            Self::Fatal { .. } => "fatal",
        }
    }
}

/// Statuses worth reconnecting after: request timeout, rate limit, server errors.
pub fn is_retryable_status(status: u16) -> bool {
    status == 408 || status == 429 || (500..600).contains(&status)
}

// ─────────────────────────────────────────────────────────────────────────────
// ParseError
// ─────────────────────────────────────────────────────────────────────────────

/// A structurally invalid wire frame.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ParseError {
    /// A frame line was not valid UTF-8.
    #[error("frame is not valid UTF-8")]
    InvalidUtf8,

    /// The `data` payload was not a valid JSON document.
    #[error("invalid JSON payload: {message}")]
    InvalidJson {
        /// Parser error description.
        message: String,
    },

    /// The `retry` field was not a non-negative integer.
    #[error("invalid retry value: {value}")]
    InvalidRetry {
        /// The raw field value.
        value: String,
    },

    /// A line exceeded the decoder's length limit and was discarded.
    #[error("line exceeds {limit} bytes")]
    LineTooLong {
        /// The limit in bytes.
        limit: usize,
    },
}

// ─────────────────────────────────────────────────────────────────────────────
// LockError
// ─────────────────────────────────────────────────────────────────────────────

/// Outcome of a lock-guarded operation that did not produce a value.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum LockError<E> {
    /// Another holder owns the key and its entry has not expired.
    ///
    /// Expected and non-fatal; callers typically ignore it or report
    /// "already in progress".
    #[error("operation already in progress for key {key}")]
    InProgress {
        /// The contended key.
        key: String,
    },

    /// The wrapped operation ran past the lock deadline. The lock was released.
    #[error("operation for key {key} timed out after {timeout_ms}ms")]
    TimedOut {
        /// The key that was held.
        key: String,
        /// The deadline that elapsed.
        timeout_ms: u64,
    },

    /// The wrapped operation itself failed.
    #[error("{0}")]
    Operation(E),
}

impl<E> LockError<E> {
    /// Whether this is the duplicate-in-progress condition.
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::InProgress { .. })
    }

    /// Whether retrying later may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::InProgress { .. } | Self::TimedOut { .. })
    }

    /// Stable kind string for rendering.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::InProgress { .. } => "in_progress",
            Self::TimedOut { .. } => "timeout",
            Self::Operation(_) => "operation",
        }
    }

    /// The wrapped operation's error, if that is what failed.
    pub fn into_operation(self) -> Option<E> {
        match self {
            Self::Operation(e) => Some(e),
            _ => None,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// ConnectionError
// ─────────────────────────────────────────────────────────────────────────────

/// Misuse of a stream connection handle.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ConnectionError {
    /// The connection was disposed and cannot be reopened.
    #[error("connection was disposed")]
    Disposed,

    /// The endpoint could not be built from the resource identifier.
    #[error("invalid endpoint: {0}")]
    InvalidEndpoint(String),
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn network_failures_are_retryable() {
        assert!(TransportError::Connect { message: "refused".into() }.is_retryable());
        assert!(TransportError::Dropped.is_retryable());
        assert!(TransportError::Read { message: "reset".into() }.is_retryable());
        assert!(TransportError::IdleTimeout { timeout_ms: 100 }.is_retryable());
        assert!(TransportError::ConnectTimeout { timeout_ms: 100 }.is_retryable());
    }

    #[test]
    fn status_classification() {
        let status = |s| TransportError::Status { status: s, body: String::new() };
        assert!(status(503).is_retryable());
        assert!(status(500).is_retryable());
        assert!(status(429).is_retryable());
        assert!(status(408).is_retryable());
        assert!(!status(404).is_retryable());
        assert!(!status(401).is_retryable());
        assert!(!status(204).is_retryable());
    }

    #[test]
    fn fatal_and_content_type_are_terminal() {
        assert!(!TransportError::Fatal { message: "gone".into() }.is_retryable());
        assert!(!TransportError::ContentType { found: "text/html".into() }.is_retryable());
    }

    #[test]
    fn categories_are_stable() {
        assert_eq!(TransportError::Dropped.category(), "dropped");
        assert_eq!(
            TransportError::Status { status: 500, body: String::new() }.category(),
            "status"
        );
        assert_eq!(TransportError::Fatal { message: String::new() }.category(), "fatal");
    }

    #[test]
    fn transport_error_display() {
        let err = TransportError::Status { status: 503, body: "busy".into() };
        assert_eq!(err.to_string(), "unexpected status 503: busy");
    }

    #[test]
    fn parse_error_display() {
        let err = ParseError::InvalidJson { message: "expected value".into() };
        assert_eq!(err.to_string(), "invalid JSON payload: expected value");
        let err = ParseError::LineTooLong { limit: 1024 };
        assert_eq!(err.to_string(), "line exceeds 1024 bytes");
    }

    #[test]
    fn lock_conflict_is_retryable_not_operation() {
        let err: LockError<String> = LockError::InProgress { key: "connect:a".into() };
        assert!(err.is_conflict());
        assert!(err.is_retryable());
        assert_eq!(err.kind(), "in_progress");
        assert_eq!(err.to_string(), "operation already in progress for key connect:a");
    }

    #[test]
    fn lock_operation_error_displays_inner() {
        let err: LockError<String> = LockError::Operation("boom".into());
        assert!(!err.is_conflict());
        assert!(!err.is_retryable());
        assert_matches!(err.into_operation(), Some(ref s) if s == "boom");
    }

    #[test]
    fn lock_timeout_kind() {
        let err: LockError<()> = LockError::TimedOut { key: "k".into(), timeout_ms: 50 };
        assert_eq!(err.kind(), "timeout");
        assert!(err.into_operation().is_none());
    }
}
