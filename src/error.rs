//! Error taxonomy for remote calls.
//!
//! Every failure from the catalog service is classified into one of five
//! kinds, which drives the retry decision in [`crate::retry`]:
//!
//! | Kind | Source | Retried |
//! |------|--------|---------|
//! | [`ErrorKind::Recoverable`] | network / timeout / connection errors, HTTP 5xx | yes |
//! | [`ErrorKind::RateLimited`] | HTTP 429 (optional `Retry-After`) | yes, honoring the hint |
//! | [`ErrorKind::AuthFailure`] | HTTP 401 / 403 | never |
//! | [`ErrorKind::Invalid`] | non-JSON or malformed response body | never |
//! | [`ErrorKind::NonRecoverable`] | any other HTTP 4xx | never |

use std::fmt;
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;

/// Classification of a remote-call failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ErrorKind {
    Recoverable,
    RateLimited,
    AuthFailure,
    Invalid,
    NonRecoverable,
}

impl ErrorKind {
    pub fn is_retryable(self) -> bool {
        matches!(self, ErrorKind::Recoverable | ErrorKind::RateLimited)
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::Recoverable => "recoverable",
            ErrorKind::RateLimited => "rate-limited",
            ErrorKind::AuthFailure => "auth-failure",
            ErrorKind::Invalid => "invalid",
            ErrorKind::NonRecoverable => "non-recoverable",
        };
        f.write_str(name)
    }
}

/// A failed remote call.
#[derive(Debug, Error)]
pub enum RemoteError {
    /// Network, timeout, connection error or HTTP 5xx.
    #[error("transient failure{}: {message}", status_suffix(.status))]
    Recoverable {
        status: Option<u16>,
        message: String,
    },

    /// HTTP 429, carrying the server's `Retry-After` hint when present.
    #[error("rate limited{}", hint_suffix(.retry_after))]
    RateLimited { retry_after: Option<Duration> },

    /// HTTP 401/403.
    #[error("authentication failed (HTTP {status}): {message}")]
    Authentication { status: u16, message: String },

    /// The response body was not the JSON we expected.
    #[error("invalid response body: {0}")]
    DataValidation(String),

    /// Any other HTTP 4xx.
    #[error("request rejected (HTTP {status}): {message}")]
    NonRecoverable { status: u16, message: String },

    /// A retryable error that persisted past the retry budget.
    #[error("{kind} error persisted after {attempts} attempts: {source}")]
    RetriesExhausted {
        kind: ErrorKind,
        attempts: u32,
        /// The last wait the policy would have applied before another attempt.
        retry_hint: Option<Duration>,
        #[source]
        source: Box<RemoteError>,
    },
}

fn status_suffix(status: &Option<u16>) -> String {
    status.map(|s| format!(" (HTTP {})", s)).unwrap_or_default()
}

fn hint_suffix(retry_after: &Option<Duration>) -> String {
    retry_after
        .map(|d| format!(" (retry after {}s)", d.as_secs_f64()))
        .unwrap_or_default()
}

impl RemoteError {
    pub fn recoverable(message: impl Into<String>) -> Self {
        RemoteError::Recoverable {
            status: None,
            message: message.into(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            RemoteError::Recoverable { .. } => ErrorKind::Recoverable,
            RemoteError::RateLimited { .. } => ErrorKind::RateLimited,
            RemoteError::Authentication { .. } => ErrorKind::AuthFailure,
            RemoteError::DataValidation(_) => ErrorKind::Invalid,
            RemoteError::NonRecoverable { .. } => ErrorKind::NonRecoverable,
            RemoteError::RetriesExhausted { kind, .. } => *kind,
        }
    }

    /// Server-supplied wait hint, if this error carries one.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            RemoteError::RateLimited { retry_after } => *retry_after,
            RemoteError::RetriesExhausted { retry_hint, .. } => *retry_hint,
            _ => None,
        }
    }

    pub fn is_auth_failure(&self) -> bool {
        self.kind() == ErrorKind::AuthFailure
    }
}

/// Classify a remote-call failure.
pub fn classify(err: &RemoteError) -> ErrorKind {
    err.kind()
}

/// Build the error for a non-success HTTP status.
///
/// `retry_after` is the raw `Retry-After` header value, if any; `body` is
/// included (truncated) in the message for diagnostics.
pub fn classify_status(status: u16, retry_after: Option<&str>, body: &str) -> RemoteError {
    let message = truncate_body(body);
    match status {
        429 => RemoteError::RateLimited {
            retry_after: retry_after.and_then(parse_retry_after),
        },
        401 | 403 => RemoteError::Authentication { status, message },
        s if s >= 500 => RemoteError::Recoverable {
            status: Some(s),
            message,
        },
        _ => RemoteError::NonRecoverable { status, message },
    }
}

/// Parse a `Retry-After` value given in (possibly fractional) seconds.
///
/// HTTP-date values are not used by the catalog service and yield `None`.
pub fn parse_retry_after(value: &str) -> Option<Duration> {
    let secs: f64 = value.trim().parse().ok()?;
    // Out-of-range and non-finite values yield `None`.
    Duration::try_from_secs_f64(secs).ok()
}

fn truncate_body(body: &str) -> String {
    const MAX: usize = 200;
    let trimmed = body.trim();
    if trimmed.len() <= MAX {
        return trimmed.to_string();
    }
    let mut end = MAX;
    while !trimmed.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}…", &trimmed[..end])
}

impl From<reqwest::Error> for RemoteError {
    fn from(err: reqwest::Error) -> Self {
        if let Some(status) = err.status() {
            return classify_status(status.as_u16(), None, &err.to_string());
        }
        if err.is_decode() {
            return RemoteError::DataValidation(err.to_string());
        }
        if err.is_builder() {
            return RemoteError::NonRecoverable {
                status: 0,
                message: err.to_string(),
            };
        }
        // Timeouts, connect failures, broken bodies.
        RemoteError::Recoverable {
            status: None,
            message: err.to_string(),
        }
    }
}

impl From<serde_json::Error> for RemoteError {
    fn from(err: serde_json::Error) -> Self {
        RemoteError::DataValidation(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_mapping() {
        assert_eq!(classify_status(500, None, "").kind(), ErrorKind::Recoverable);
        assert_eq!(classify_status(503, None, "").kind(), ErrorKind::Recoverable);
        assert_eq!(classify_status(429, None, "").kind(), ErrorKind::RateLimited);
        assert_eq!(classify_status(401, None, "").kind(), ErrorKind::AuthFailure);
        assert_eq!(classify_status(403, None, "").kind(), ErrorKind::AuthFailure);
        assert_eq!(
            classify_status(404, None, "").kind(),
            ErrorKind::NonRecoverable
        );
        assert_eq!(
            classify_status(400, None, "").kind(),
            ErrorKind::NonRecoverable
        );
    }

    #[test]
    fn rate_limit_carries_hint() {
        let err = classify_status(429, Some("5"), "slow down");
        assert_eq!(err.retry_after(), Some(Duration::from_secs(5)));

        let err = classify_status(429, Some("not-a-number"), "");
        assert_eq!(err.retry_after(), None);
    }

    #[test]
    fn retry_after_parsing() {
        assert_eq!(parse_retry_after("2"), Some(Duration::from_secs(2)));
        assert_eq!(parse_retry_after(" 1.5 "), Some(Duration::from_millis(1500)));
        assert_eq!(parse_retry_after("-1"), None);
        assert_eq!(parse_retry_after("Wed, 21 Oct 2015 07:28:00 GMT"), None);
        assert_eq!(parse_retry_after("NaN"), None);
        assert_eq!(parse_retry_after("inf"), None);
    }

    #[test]
    fn oversized_retry_after_is_ignored() {
        assert_eq!(parse_retry_after("1e20"), None);
        let err = classify_status(429, Some("1e20"), "");
        assert_eq!(err.kind(), ErrorKind::RateLimited);
        assert_eq!(err.retry_after(), None);
    }

    #[test]
    fn only_transient_kinds_retry() {
        assert!(ErrorKind::Recoverable.is_retryable());
        assert!(ErrorKind::RateLimited.is_retryable());
        assert!(!ErrorKind::AuthFailure.is_retryable());
        assert!(!ErrorKind::Invalid.is_retryable());
        assert!(!ErrorKind::NonRecoverable.is_retryable());
    }

    #[test]
    fn exhausted_keeps_kind_and_hint() {
        let err = RemoteError::RetriesExhausted {
            kind: ErrorKind::RateLimited,
            attempts: 4,
            retry_hint: Some(Duration::from_secs(6)),
            source: Box::new(RemoteError::RateLimited {
                retry_after: Some(Duration::from_secs(5)),
            }),
        };
        assert_eq!(classify(&err), ErrorKind::RateLimited);
        assert_eq!(err.retry_after(), Some(Duration::from_secs(6)));
        assert!(err.to_string().contains("after 4 attempts"));
    }

    #[test]
    fn json_errors_are_invalid() {
        let err: RemoteError = serde_json::from_str::<serde_json::Value>("<html>")
            .unwrap_err()
            .into();
        assert_eq!(err.kind(), ErrorKind::Invalid);
    }

    #[test]
    fn long_bodies_are_truncated() {
        let body = "x".repeat(1000);
        let err = classify_status(404, None, &body);
        assert!(err.to_string().len() < 300);
    }
}
