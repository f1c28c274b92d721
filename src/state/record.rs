//! The persisted per-item progress record.

use std::collections::BTreeSet;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};

use super::phase::Phase;
use crate::errors::StateError;

/// Upper bound on retained progress log entries.
pub const MAX_STATUS_HISTORY: usize = 100;

/// Why an item ended up in `failed`, when the failure is a domain failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    MergeConflict,
    DependencyCycle,
    DependencyFailed,
    UserAborted,
    CiFailed,
    /// Written by a newer version; kept so the record still loads.
    #[serde(other)]
    Unknown,
}

impl FailureReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureReason::MergeConflict => "merge_conflict",
            FailureReason::DependencyCycle => "dependency_cycle",
            FailureReason::DependencyFailed => "dependency_failed",
            FailureReason::UserAborted => "user_aborted",
            FailureReason::CiFailed => "ci_failed",
            FailureReason::Unknown => "unknown",
        }
    }
}

/// One round of clarifying questions and the reply that answered them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QaEntry {
    pub questions: String,
    pub answers: String,
}

/// Workflow progress for one item, round-tripped through a state fragment.
///
/// Field names are part of the persisted format. Unknown fields are ignored on
/// read and every field has a default, so older and newer fragments both load.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressRecord {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub session_id: String,

    #[serde(default)]
    pub current_phase: Phase,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub qa_history: Vec<QaEntry>,

    #[serde(default)]
    pub qa_round: u32,

    #[serde(default)]
    pub plan_version: u32,

    #[serde(default)]
    pub review_iteration: u32,

    #[serde(default)]
    pub ci_fix_attempts: u32,

    /// When the current wait for CI began; cleared when CI passes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ci_wait_started: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pr_number: Option<u64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch_name: Option<String>,

    #[serde(default = "epoch")]
    pub last_updated: DateTime<Utc>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_comment_time: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_pr_comment_time: Option<DateTime<Utc>>,

    /// `None` until detection has run; `Some(empty)` means "no dependencies".
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub depends_on: Option<BTreeSet<u64>>,

    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub blocked_by: BTreeSet<u64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<FailureReason>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failed_phase: Option<Phase>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_comment_id: Option<u64>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub status_history: Vec<String>,
}

fn epoch() -> DateTime<Utc> {
    DateTime::<Utc>::UNIX_EPOCH
}

impl Default for ProgressRecord {
    fn default() -> Self {
        Self {
            session_id: String::new(),
            current_phase: Phase::New,
            qa_history: Vec::new(),
            qa_round: 0,
            plan_version: 0,
            review_iteration: 0,
            ci_fix_attempts: 0,
            ci_wait_started: None,
            pr_number: None,
            branch_name: None,
            last_updated: Utc::now(),
            last_comment_time: None,
            last_pr_comment_time: None,
            depends_on: None,
            blocked_by: BTreeSet::new(),
            error: None,
            failure_reason: None,
            failed_phase: None,
            status_comment_id: None,
            status_history: Vec::new(),
        }
    }
}

impl ProgressRecord {
    pub fn new() -> Self {
        Self::default()
    }

    /// A fresh record starting at `phase`, used when only a phase label is known.
    pub fn starting_at(phase: Phase) -> Self {
        Self {
            current_phase: phase,
            ..Self::default()
        }
    }

    pub fn phase(&self) -> Phase {
        self.current_phase
    }

    pub fn is_terminal(&self) -> bool {
        self.current_phase.is_terminal()
    }

    /// Move to `next`, rejecting anything outside the workflow graph.
    pub fn transition(&mut self, next: Phase) -> Result<(), StateError> {
        if !self.current_phase.can_transition_to(next) {
            return Err(StateError::IllegalTransition {
                from: self.current_phase,
                to: next,
            });
        }
        self.current_phase = next;
        Ok(())
    }

    /// Move to `failed`, recording the message, the reason, and where it happened.
    pub fn fail(
        &mut self,
        message: impl Into<String>,
        reason: Option<FailureReason>,
    ) -> Result<(), StateError> {
        let from = self.current_phase;
        self.transition(Phase::Failed)?;
        self.failed_phase = Some(from);
        self.error = Some(message.into());
        self.failure_reason = reason;
        Ok(())
    }

    /// Leave `failed` after an explicit retry command and return the phase resumed.
    ///
    /// Items that failed before their plan was approved resume where they failed;
    /// everything else re-enters `implementing` with its review counters reset.
    pub fn reset_for_retry(&mut self) -> Result<Phase, StateError> {
        if self.current_phase != Phase::Failed {
            return Err(StateError::IllegalTransition {
                from: self.current_phase,
                to: Phase::Implementing,
            });
        }

        let resume = match self.failed_phase {
            Some(p @ (Phase::New | Phase::Questions | Phase::Planning | Phase::Approval)) => p,
            _ => Phase::Implementing,
        };
        if resume == Phase::Implementing {
            self.review_iteration = 0;
            self.ci_fix_attempts = 0;
            self.ci_wait_started = None;
        }

        self.current_phase = resume;
        self.error = None;
        self.failure_reason = None;
        self.failed_phase = None;
        self.blocked_by.clear();
        Ok(resume)
    }

    /// Record the answer to the outstanding question round.
    pub fn record_answer(&mut self, questions: impl Into<String>, answers: impl Into<String>) {
        self.qa_history.push(QaEntry {
            questions: questions.into(),
            answers: answers.into(),
        });
    }

    /// Replace `blocked_by`, keeping it a subset of `depends_on`.
    pub fn set_blocked_by(&mut self, blocked: impl IntoIterator<Item = u64>) {
        let deps = self.depends_on.clone().unwrap_or_default();
        self.blocked_by = blocked.into_iter().filter(|n| deps.contains(n)).collect();
    }

    pub fn is_blocked(&self) -> bool {
        !self.blocked_by.is_empty()
    }

    /// Append a progress log line, dropping the oldest past the cap.
    pub fn push_status(&mut self, entry: impl Into<String>) {
        self.status_history.push(entry.into());
        if self.status_history.len() > MAX_STATUS_HISTORY {
            let excess = self.status_history.len() - MAX_STATUS_HISTORY;
            self.status_history.drain(..excess);
        }
    }

    /// Advance `last_updated` to now, strictly past its previous value.
    pub fn touch(&mut self) {
        let now = Utc::now();
        self.last_updated = if now > self.last_updated {
            now
        } else {
            self.last_updated + ChronoDuration::microseconds(1)
        };
    }
}
