use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Application-wide error types for Quarry.
///
/// These cover configuration and wiring. Per-identifier fetch failures are
/// [`FetchError`]s and never surface as `AppError`.
#[derive(Error, Debug)]
pub enum AppError {
    /// Job input or engine configuration violated an invariant.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// The HTTP client could not be built.
    #[error("HTTP client error: {0}")]
    HttpClient(String),

    /// Reading an input file failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization failed.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The engine's dispatcher task died before reporting a summary.
    #[error("Engine error: {0}")]
    Engine(String),
}

/// Classification of a per-identifier failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// The session credential was rejected. Fatal for the whole run.
    AuthExpired,
    /// The service asked us to slow down.
    Throttled,
    /// Timeouts, connection resets, 5xx.
    Transient,
    /// The response could not be decoded into a page.
    Malformed,
    /// Non-throttle 4xx and other errors that will not go away on retry.
    Permanent,
    /// The run was cancelled before this identifier finished.
    Cancelled,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::AuthExpired => "auth_expired",
            ErrorKind::Throttled => "throttled",
            ErrorKind::Transient => "transient",
            ErrorKind::Malformed => "malformed",
            ErrorKind::Permanent => "permanent",
            ErrorKind::Cancelled => "cancelled",
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, ErrorKind::Throttled | ErrorKind::Transient)
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error signal returned by a [`ProfileFetcher`](crate::traits::ProfileFetcher).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FetchError {
    /// HTTP 429 or a service-specific throttle marker.
    #[error("Throttled by upstream")]
    Throttled {
        /// Server-provided hint, if any.
        retry_after: Option<Duration>,
    },

    /// 401/403 or an invalidated session.
    #[error("Authentication expired: {0}")]
    AuthExpired(String),

    /// Timeout, connection failure, 5xx.
    #[error("Transient error: {0}")]
    Transient(String),

    /// Body could not be parsed into a page fragment.
    #[error("Malformed response: {0}")]
    Malformed(String),

    /// Non-retryable upstream rejection.
    #[error("Permanent error (HTTP {status}): {message}")]
    Permanent { status: u16, message: String },
}

impl FetchError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            FetchError::Throttled { .. } => ErrorKind::Throttled,
            FetchError::AuthExpired(_) => ErrorKind::AuthExpired,
            FetchError::Transient(_) => ErrorKind::Transient,
            FetchError::Malformed(_) => ErrorKind::Malformed,
            FetchError::Permanent { .. } => ErrorKind::Permanent,
        }
    }

    /// Returns true if this error is transient and worth retrying.
    pub fn is_retryable(&self) -> bool {
        self.kind().is_retryable()
    }

    /// Maps an HTTP status code onto the signal taxonomy.
    ///
    /// Returns `None` for success statuses.
    pub fn from_status(status: u16, retry_after: Option<Duration>, body: &str) -> Option<Self> {
        let message = truncate(body, 200);
        match status {
            200..=399 => None,
            401 | 403 => Some(FetchError::AuthExpired(format!("HTTP {status}"))),
            429 => Some(FetchError::Throttled { retry_after }),
            408 | 500..=599 => Some(FetchError::Transient(format!("HTTP {status}: {message}"))),
            _ => Some(FetchError::Permanent { status, message }),
        }
    }
}

fn truncate(s: &str, max: usize) -> String {
    match s.char_indices().nth(max) {
        Some((idx, _)) => format!("{}...", &s[..idx]),
        None => s.to_string(),
    }
}
