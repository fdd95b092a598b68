//! Error classification for intelligent retry and failure handling
//!
//! Not all failures are equal. A connection reset deserves a quick retry, a
//! 429 deserves a long one, and a 422 deserves none at all. The classifier
//! maps a raw [`BackendFailure`] onto a closed set of [`ErrorKind`]s, each
//! carrying its own retry policy:
//!
//! | kind | retryable | max attempts | base delay |
//! |---|---|---|---|
//! | Network | yes | 5 | 1 s |
//! | RateLimit | yes | 5 | 30 s |
//! | Transient | yes | 3 | 2 s |
//! | Unknown | yes | 2 | 5 s |
//! | InvalidInput | no | 0 | - |
//! | Permanent | no | 0 | - |

use std::fmt;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

/// A raw failure from an outbound call, in the shape the classifier understands.
///
/// Transport layers (reqwest, object stores, subprocess adapters) convert
/// their native error types into this enum before handing them to the
/// resilience stack.
#[derive(Debug, Error, Clone)]
pub enum BackendFailure {
    /// Request or read timed out
    #[error("request timed out: {0}")]
    Timeout(String),

    /// TCP/TLS connection could not be established or was reset
    #[error("connection failed: {0}")]
    Connect(String),

    /// The remote answered with a non-success HTTP status
    #[error("HTTP {status}: {message}")]
    Http { status: u16, message: String },

    /// Anything else (message-based classification applies)
    #[error("{0}")]
    Other(String),
}

impl BackendFailure {
    /// HTTP status code, if this failure carries one
    pub fn status_code(&self) -> Option<u16> {
        match self {
            BackendFailure::Http { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// Shorthand for a status-only failure
    pub fn http(status: u16, message: impl Into<String>) -> Self {
        BackendFailure::Http {
            status,
            message: message.into(),
        }
    }

    /// Shorthand for an unclassified failure
    pub fn other(message: impl Into<String>) -> Self {
        BackendFailure::Other(message.into())
    }
}

/// Classification of errors for retry decisions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Timeouts, connection issues: retry with backoff
    Network,
    /// HTTP 429, quota exceeded: retry with longer backoff
    RateLimit,
    /// HTTP 400/404/405/422, validation errors: fail immediately
    InvalidInput,
    /// HTTP 500-504: retry a few times then fail
    Transient,
    /// HTTP 401/402/403, bad credentials: fail, flag for review
    Permanent,
    /// Unclassified, retried conservatively
    Unknown,
}

impl ErrorKind {
    /// Stable string form used in logs and flow traces
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Network => "NETWORK",
            ErrorKind::RateLimit => "RATE_LIMIT",
            ErrorKind::InvalidInput => "INVALID_INPUT",
            ErrorKind::Transient => "TRANSIENT",
            ErrorKind::Permanent => "PERMANENT",
            ErrorKind::Unknown => "UNKNOWN",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A failure with its classification and the retry policy it implies
#[derive(Debug, Clone)]
pub struct ClassifiedError {
    pub kind: ErrorKind,
    pub message: String,
    pub status_code: Option<u16>,
    pub retryable: bool,
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl ClassifiedError {
    fn new(kind: ErrorKind, message: String, status_code: Option<u16>) -> Self {
        let (retryable, max_attempts, base_delay) = match kind {
            ErrorKind::Network => (true, 5, Duration::from_secs(1)),
            ErrorKind::RateLimit => (true, 5, Duration::from_secs(30)),
            ErrorKind::Transient => (true, 3, Duration::from_secs(2)),
            ErrorKind::Unknown => (true, 2, Duration::from_secs(5)),
            ErrorKind::InvalidInput | ErrorKind::Permanent => (false, 0, Duration::ZERO),
        };

        Self {
            kind,
            message,
            status_code,
            retryable,
            max_attempts,
            base_delay,
        }
    }
}

/// Maps raw failures onto [`ErrorKind`]s with retry parameters.
///
/// Classification precedence:
/// 1. Typed network failures (timeout, connect)
/// 2. HTTP status code mapping
/// 3. Substring match on the error message
/// 4. Default to [`ErrorKind::Unknown`]
#[derive(Debug, Clone, Copy, Default)]
pub struct ErrorClassifier;

impl ErrorClassifier {
    pub fn new() -> Self {
        Self
    }

    /// Classify a failure for retry decisions
    pub fn classify(&self, failure: &BackendFailure) -> ClassifiedError {
        let kind = self.kind_of(failure);
        let classified = ClassifiedError::new(kind, failure.to_string(), failure.status_code());

        debug!(
            kind = classified.kind.as_str(),
            retryable = classified.retryable,
            max_attempts = classified.max_attempts,
            status_code = classified.status_code,
            "error classified"
        );

        classified
    }

    /// Quick check without building the full classification
    pub fn is_retryable(&self, failure: &BackendFailure) -> bool {
        self.classify(failure).retryable
    }

    fn kind_of(&self, failure: &BackendFailure) -> ErrorKind {
        match failure {
            BackendFailure::Timeout(_) | BackendFailure::Connect(_) => ErrorKind::Network,
            BackendFailure::Http { status, .. } => Self::kind_for_status(*status),
            BackendFailure::Other(message) => Self::kind_for_message(message),
        }
    }

    fn kind_for_status(status: u16) -> ErrorKind {
        match status {
            429 => ErrorKind::RateLimit,
            400 | 404 | 405 | 422 => ErrorKind::InvalidInput,
            401 | 402 | 403 => ErrorKind::Permanent,
            500 | 502 | 503 | 504 => ErrorKind::Transient,
            // Unmapped statuses are treated as server-side hiccups
            _ => ErrorKind::Transient,
        }
    }

    fn kind_for_message(message: &str) -> ErrorKind {
        let lower = message.to_lowercase();

        if lower.contains("timeout") || lower.contains("timed out") {
            return ErrorKind::Network;
        }
        if lower.contains("rate limit")
            || lower.contains("too many requests")
            || lower.contains("quota")
        {
            return ErrorKind::RateLimit;
        }
        if lower.contains("invalid") || lower.contains("validation") || lower.contains("bad request")
        {
            return ErrorKind::InvalidInput;
        }
        if lower.contains("unauthorized")
            || lower.contains("forbidden")
            || lower.contains("api key")
            || lower.contains("authentication")
        {
            return ErrorKind::Permanent;
        }

        ErrorKind::Unknown
    }
}
