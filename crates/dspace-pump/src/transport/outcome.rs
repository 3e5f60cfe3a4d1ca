//! Classification of raw API responses into a closed set of outcomes.

use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;

/// Maximum length of a response body excerpt carried in failures and logs.
pub const MAX_SNIPPET_CHARS: usize = 200;

/// Status codes that are worth retrying.
pub const RETRYABLE_STATUSES: [u16; 6] = [408, 429, 500, 502, 503, 504];

/// A response as returned by an [`HttpBackend`](super::HttpBackend).
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RawResponse {
    pub status: u16,
    /// Header names are lowercased.
    pub headers: BTreeMap<String, String>,
    pub body: String,
}

impl RawResponse {
    pub fn new(status: u16, body: impl Into<String>) -> Self {
        Self {
            status,
            headers: BTreeMap::new(),
            body: body.into(),
        }
    }

    pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.insert(name.to_ascii_lowercase(), value.into());
        self
    }
}

/// Failure below HTTP: no status line was received.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendError {
    pub kind: BackendErrorKind,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendErrorKind {
    Timeout,
    Connect,
    Other,
}

impl BackendError {
    pub fn new(kind: BackendErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

impl From<reqwest::Error> for BackendError {
    fn from(err: reqwest::Error) -> Self {
        let kind = if err.is_timeout() {
            BackendErrorKind::Timeout
        } else if err.is_connect() {
            BackendErrorKind::Connect
        } else {
            BackendErrorKind::Other
        };
        Self::new(kind, err.to_string())
    }
}

/// Why a call may succeed if repeated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryClass {
    /// 500; the only class the circuit breaker counts.
    ServerError,
    /// 502, 503, 504
    Gateway,
    /// 429
    RateLimited,
    /// 408
    RequestTimeout,
    /// Connection refused, reset or timed out before a response.
    Transport,
}

impl fmt::Display for RetryClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RetryClass::ServerError => "server error",
            RetryClass::Gateway => "gateway error",
            RetryClass::RateLimited => "rate limited",
            RetryClass::RequestTimeout => "request timeout",
            RetryClass::Transport => "transport error",
        };
        f.write_str(name)
    }
}

/// Result of a single attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Success(RawResponse),
    RetryableFailure {
        class: RetryClass,
        status: Option<u16>,
        body: String,
    },
    TerminalFailure {
        status: u16,
        body: String,
    },
    AuthExpired {
        status: u16,
        body: String,
    },
}

/// Map one attempt's result to an [`Outcome`].
pub fn classify(result: std::result::Result<RawResponse, BackendError>) -> Outcome {
    let response = match result {
        Ok(response) => response,
        Err(err) => {
            return Outcome::RetryableFailure {
                class: RetryClass::Transport,
                status: None,
                body: err.message,
            }
        }
    };

    let status = response.status;
    let class = match status {
        200..=299 => return Outcome::Success(response),
        401 | 403 => {
            return Outcome::AuthExpired {
                status,
                body: response.body,
            }
        }
        500 => RetryClass::ServerError,
        502..=504 => RetryClass::Gateway,
        429 => RetryClass::RateLimited,
        408 => RetryClass::RequestTimeout,
        _ => {
            return Outcome::TerminalFailure {
                status,
                body: response.body,
            }
        }
    };

    Outcome::RetryableFailure {
        class,
        status: Some(status),
        body: response.body,
    }
}

/// Escape control characters and bound the length of a body excerpt.
pub fn sanitize_snippet(body: &str) -> String {
    let mut escaped = String::with_capacity(body.len().min(MAX_SNIPPET_CHARS * 2));
    for c in body.chars() {
        match c {
            '\n' => escaped.push_str("\\n"),
            '\r' => escaped.push_str("\\r"),
            '\t' => escaped.push_str("\\t"),
            c if c.is_control() => escaped.push_str(&format!("\\u{{{:x}}}", c as u32)),
            c => escaped.push(c),
        }
    }

    if escaped.chars().count() <= MAX_SNIPPET_CHARS {
        return escaped;
    }
    let mut truncated: String = escaped.chars().take(MAX_SNIPPET_CHARS).collect();
    truncated.push_str("...");
    truncated
}

/// Why the transport gave up on a call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureReason {
    /// The breaker was open; no request was sent.
    CircuitOpen,
    /// A non-retryable status.
    Terminal,
    /// Every attempt failed with a retryable outcome.
    Exhausted,
    /// Re-authentication after a 401/403 failed.
    AuthRejected,
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FailureReason::CircuitOpen => "circuit breaker open",
            FailureReason::Terminal => "non-retryable response",
            FailureReason::Exhausted => "retries exhausted",
            FailureReason::AuthRejected => "re-authentication failed",
        };
        f.write_str(name)
    }
}

/// Structured failure returned once the transport stops retrying.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{method} {endpoint}: {reason} after {attempts} attempt(s), status {}: {snippet}", .status.map(|s| s.to_string()).unwrap_or_else(|| "none".to_string()))]
pub struct TransportFailure {
    pub method: String,
    pub endpoint: String,
    pub reason: FailureReason,
    pub attempts: u32,
    pub status: Option<u16>,
    /// Sanitized, bounded excerpt of the last response body.
    pub snippet: String,
}

impl TransportFailure {
    /// Destination rejected the object because it already exists.
    pub fn is_conflict(&self) -> bool {
        self.reason == FailureReason::Terminal && self.status == Some(409)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_success_range() {
        for status in [200, 201, 204] {
            assert!(matches!(
                classify(Ok(RawResponse::new(status, ""))),
                Outcome::Success(_)
            ));
        }
    }

    #[test]
    fn test_retryable_set_is_exact() {
        for status in 100u16..600 {
            let outcome = classify(Ok(RawResponse::new(status, "")));
            let retryable = matches!(outcome, Outcome::RetryableFailure { .. });
            assert_eq!(
                retryable,
                RETRYABLE_STATUSES.contains(&status),
                "status {}",
                status
            );
        }
    }

    #[test]
    fn test_only_500_is_server_error_class() {
        assert!(matches!(
            classify(Ok(RawResponse::new(500, ""))),
            Outcome::RetryableFailure { class: RetryClass::ServerError, .. }
        ));
        assert!(matches!(
            classify(Ok(RawResponse::new(503, ""))),
            Outcome::RetryableFailure { class: RetryClass::Gateway, .. }
        ));
    }

    #[test]
    fn test_auth_statuses() {
        assert!(matches!(
            classify(Ok(RawResponse::new(401, ""))),
            Outcome::AuthExpired { status: 401, .. }
        ));
        assert!(matches!(
            classify(Ok(RawResponse::new(403, ""))),
            Outcome::AuthExpired { status: 403, .. }
        ));
    }

    #[test]
    fn test_backend_error_is_transport_class() {
        let outcome = classify(Err(BackendError::new(BackendErrorKind::Connect, "reset")));
        assert_eq!(
            outcome,
            Outcome::RetryableFailure {
                class: RetryClass::Transport,
                status: None,
                body: "reset".to_string()
            }
        );
    }

    #[test]
    fn test_snippet_escapes_control_characters() {
        assert_eq!(sanitize_snippet("a\nb\rc\td"), "a\\nb\\rc\\td");
        assert_eq!(sanitize_snippet("x\u{1b}[0m"), "x\\u{1b}[0m");
    }

    #[test]
    fn test_snippet_is_bounded() {
        let long = "é".repeat(500);
        let snippet = sanitize_snippet(&long);
        assert_eq!(snippet.chars().count(), MAX_SNIPPET_CHARS + 3);
        assert!(snippet.ends_with("..."));
    }

    #[test]
    fn test_conflict_detection() {
        let failure = TransportFailure {
            method: "POST".into(),
            endpoint: "core/communities".into(),
            reason: FailureReason::Terminal,
            attempts: 1,
            status: Some(409),
            snippet: String::new(),
        };
        assert!(failure.is_conflict());
    }
}
