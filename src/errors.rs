//! Typed error hierarchy for taskwright.
//!
//! One enum per boundary:
//! - `TrackerError`: issue tracker calls (carries the HTTP status when known)
//! - `AgentError`: coding agent subprocess failures
//! - `StateError`: progress record transitions and fragment decoding
//! - `CycleError`: dependency cycles found before admission
//! - `RetryError`: outcome of the retry engine wrapping any of the above
//! - `OrchestratorError`: phase handler failures, including domain failures

use std::time::Duration;

use thiserror::Error;

use crate::state::Phase;

/// Errors returned by a [`crate::tracker::Tracker`] backend.
#[derive(Debug, Error)]
pub enum TrackerError {
    #[error("HTTP {status}: {message}")]
    Status { status: u16, message: String },

    #[error("transport error: {0}")]
    Transport(String),

    #[error("failed to run {command}: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{command} failed: {stderr}")]
    Command { command: String, stderr: String },

    #[error("unexpected response: {0}")]
    Decode(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl TrackerError {
    pub fn status(status: u16, message: impl Into<String>) -> Self {
        TrackerError::Status {
            status,
            message: message.into(),
        }
    }

    pub fn not_found(what: impl std::fmt::Display) -> Self {
        TrackerError::status(404, format!("{} not found", what))
    }

    /// HTTP status code, when the backend exposed one.
    pub fn http_status(&self) -> Option<u16> {
        match self {
            TrackerError::Status { status, .. } => Some(*status),
            _ => None,
        }
    }
}

impl From<reqwest::Error> for TrackerError {
    fn from(err: reqwest::Error) -> Self {
        match err.status() {
            Some(status) => TrackerError::status(status.as_u16(), err.to_string()),
            None if err.is_decode() => TrackerError::Decode(err.to_string()),
            None => TrackerError::Transport(err.to_string()),
        }
    }
}

/// Errors from a single agent invocation.
#[derive(Debug, Error)]
pub enum AgentError {
    #[error("agent timed out after {}s", .after.as_secs())]
    Timeout { after: Duration },

    #[error("failed to spawn agent command {command}: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("agent failed: {message}")]
    Failed {
        exit_code: Option<i32>,
        message: String,
    },

    #[error("agent invocation cancelled")]
    Cancelled,

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Errors from progress record handling.
#[derive(Debug, Error)]
pub enum StateError {
    #[error("illegal phase transition {from} -> {to}")]
    IllegalTransition { from: Phase, to: Phase },

    #[error("malformed state fragment: {0}")]
    Malformed(#[source] serde_json::Error),

    #[error("failed to serialize state: {0}")]
    Serialize(#[source] serde_json::Error),
}

/// A dependency cycle, listed in traversal order without repeating the entry node.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("dependency cycle detected: {}", format_cycle(.path))]
pub struct CycleError {
    pub path: Vec<u64>,
}

fn format_cycle(path: &[u64]) -> String {
    let mut parts: Vec<String> = path.iter().map(|n| format!("#{}", n)).collect();
    if let Some(first) = path.first() {
        parts.push(format!("#{}", first));
    }
    parts.join(" -> ")
}

/// Outcome of [`crate::retry::RetryPolicy`] when the operation never succeeded.
#[derive(Debug, Error)]
pub enum RetryError<E>
where
    E: std::error::Error + 'static,
{
    #[error("operation cancelled")]
    Cancelled,

    #[error("{source} (after {attempts} attempt(s))")]
    Failed {
        attempts: u32,
        #[source]
        source: E,
    },
}

impl<E> RetryError<E>
where
    E: std::error::Error + 'static,
{
    pub fn is_cancelled(&self) -> bool {
        matches!(self, RetryError::Cancelled)
    }

    /// The last operation error, if the engine gave up on one.
    pub fn into_inner(self) -> Option<E> {
        match self {
            RetryError::Cancelled => None,
            RetryError::Failed { source, .. } => Some(source),
        }
    }
}

/// Errors raised while driving one item through its phases.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("tracker error: {0}")]
    Tracker(#[from] TrackerError),

    #[error(transparent)]
    Agent(#[from] AgentError),

    #[error(transparent)]
    State(#[from] StateError),

    #[error("user aborted")]
    UserAborted,

    #[error("git error during implementation: {0}")]
    Git(String),

    #[error("expected agent output file {0} was not written")]
    MissingOutput(String),

    #[error("cancelled")]
    Cancelled,

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl From<RetryError<TrackerError>> for OrchestratorError {
    fn from(err: RetryError<TrackerError>) -> Self {
        match err {
            RetryError::Cancelled => OrchestratorError::Cancelled,
            RetryError::Failed { source, .. } => OrchestratorError::Tracker(source),
        }
    }
}

impl From<RetryError<AgentError>> for OrchestratorError {
    fn from(err: RetryError<AgentError>) -> Self {
        match err {
            RetryError::Cancelled => OrchestratorError::Cancelled,
            RetryError::Failed {
                source: AgentError::Cancelled,
                ..
            } => OrchestratorError::Cancelled,
            RetryError::Failed { source, .. } => OrchestratorError::Agent(source),
        }
    }
}

impl OrchestratorError {
    pub fn is_cancelled(&self) -> bool {
        matches!(
            self,
            OrchestratorError::Cancelled | OrchestratorError::Agent(AgentError::Cancelled)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tracker_error_exposes_status() {
        let err = TrackerError::status(429, "slow down");
        assert_eq!(err.http_status(), Some(429));
        assert_eq!(err.to_string(), "HTTP 429: slow down");

        let err = TrackerError::Transport("connection reset".into());
        assert_eq!(err.http_status(), None);
    }

    #[test]
    fn test_tracker_not_found_is_404() {
        let err = TrackerError::not_found("issue #7");
        assert_eq!(err.http_status(), Some(404));
        assert!(err.to_string().contains("issue #7 not found"));
    }

    #[test]
    fn test_cycle_error_formats_closed_path() {
        let err = CycleError { path: vec![1, 2] };
        assert_eq!(err.to_string(), "dependency cycle detected: #1 -> #2 -> #1");

        let self_loop = CycleError { path: vec![5] };
        assert_eq!(self_loop.to_string(), "dependency cycle detected: #5 -> #5");
    }

    #[test]
    fn test_state_error_illegal_transition_names_phases() {
        let err = StateError::IllegalTransition {
            from: Phase::Completed,
            to: Phase::Planning,
        };
        assert_eq!(err.to_string(), "illegal phase transition completed -> planning");
    }

    #[test]
    fn test_retry_error_into_orchestrator_error() {
        let err: OrchestratorError = RetryError::<TrackerError>::Cancelled.into();
        assert!(err.is_cancelled());

        let err: OrchestratorError = RetryError::Failed {
            attempts: 3,
            source: TrackerError::status(500, "boom"),
        }
        .into();
        match err {
            OrchestratorError::Tracker(inner) => assert_eq!(inner.http_status(), Some(500)),
            other => panic!("Expected Tracker, got {:?}", other),
        }
    }

    #[test]
    fn test_agent_cancellation_maps_to_cancelled() {
        let err: OrchestratorError = RetryError::Failed {
            attempts: 1,
            source: AgentError::Cancelled,
        }
        .into();
        assert!(err.is_cancelled());
    }

    #[test]
    fn test_agent_timeout_message() {
        let err = AgentError::Timeout {
            after: Duration::from_secs(90),
        };
        assert_eq!(err.to_string(), "agent timed out after 90s");
    }
}
