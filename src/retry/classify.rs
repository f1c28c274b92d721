//! Mapping errors onto the three retry classes.
//!
//! Typed errors classify themselves from structured data (HTTP status, error
//! variant). Text matching is the fallback for opaque subprocess output.

use std::sync::LazyLock;

use regex::Regex;

use crate::errors::{AgentError, TrackerError};

/// How the retry engine treats a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Transient: back off exponentially and try again.
    Retryable,
    /// Throttled: wait the fixed rate-limit interval and try again.
    RateLimited,
    /// Never retried.
    Permanent,
}

/// Errors that know their own retry class.
pub trait Classify {
    fn classify(&self) -> ErrorClass;
}

static HTTP_STATUS_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\bHTTP (\d{3})\b").unwrap());

const RATE_LIMIT_PATTERNS: &[&str] = &[
    "rate limit",
    "429",
    "too many requests",
    "overloaded",
    "capacity",
];

const TRANSIENT_PATTERNS: &[&str] = &[
    "timeout",
    "timed out",
    "deadline exceeded",
    "connection refused",
    "connection reset",
    "no such host",
    "network",
    "temporary failure",
    "500",
    "502",
    "503",
    "504",
    "internal server error",
    "bad gateway",
    "service unavailable",
];

/// Class for an HTTP status code.
pub fn classify_http_status(status: u16) -> ErrorClass {
    match status {
        429 => ErrorClass::RateLimited,
        408 | 504 => ErrorClass::Retryable,
        500..=599 => ErrorClass::Retryable,
        _ => ErrorClass::Permanent,
    }
}

/// Whether free text names a throttling condition.
fn mentions_rate_limit(text: &str) -> bool {
    let lower = text.to_lowercase();
    RATE_LIMIT_PATTERNS.iter().any(|p| lower.contains(p))
}

/// Pull an `HTTP nnn` status out of CLI output, as printed by `gh`.
pub fn parse_http_status(text: &str) -> Option<u16> {
    HTTP_STATUS_REGEX
        .captures(text)
        .and_then(|c| c.get(1))
        .and_then(|m| m.as_str().parse().ok())
}

/// Class suggested by free text, or `None` when nothing recognisable appears.
pub fn classify_text(text: &str) -> Option<ErrorClass> {
    if let Some(status) = parse_http_status(text) {
        return Some(classify_http_status(status));
    }
    if mentions_rate_limit(text) {
        return Some(ErrorClass::RateLimited);
    }
    let lower = text.to_lowercase();
    if TRANSIENT_PATTERNS.iter().any(|p| lower.contains(p)) {
        return Some(ErrorClass::Retryable);
    }
    None
}

impl Classify for TrackerError {
    fn classify(&self) -> ErrorClass {
        match self {
            // GitHub answers an exhausted quota with 403 rather than 429.
            TrackerError::Status { status: 403, message } if mentions_rate_limit(message) => {
                ErrorClass::RateLimited
            }
            TrackerError::Status { status, .. } => classify_http_status(*status),
            TrackerError::Transport(_) => ErrorClass::Retryable,
            TrackerError::Spawn { .. } => ErrorClass::Permanent,
            TrackerError::Decode(_) => ErrorClass::Permanent,
            TrackerError::Command { stderr, .. } => {
                classify_text(stderr).unwrap_or(ErrorClass::Retryable)
            }
            TrackerError::Other(e) => {
                classify_text(&e.to_string()).unwrap_or(ErrorClass::Retryable)
            }
        }
    }
}

impl Classify for AgentError {
    fn classify(&self) -> ErrorClass {
        match self {
            AgentError::Timeout { .. } => ErrorClass::Retryable,
            AgentError::Spawn { .. } => ErrorClass::Permanent,
            AgentError::Cancelled => ErrorClass::Permanent,
            AgentError::Io(_) => ErrorClass::Retryable,
            AgentError::Failed { message, .. } => {
                classify_text(message).unwrap_or(ErrorClass::Permanent)
            }
        }
    }
}
