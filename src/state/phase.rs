//! Workflow phases, the legal transitions between them, and their tracker labels.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Prefix shared by every phase label (`phase:planning`, ...).
pub const LABEL_PREFIX: &str = "phase:";

/// One discrete state of the per-item workflow.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    #[default]
    New,
    Questions,
    Planning,
    Approval,
    Implementing,
    Review,
    Completed,
    Failed,
}

impl Phase {
    pub const ALL: [Phase; 8] = [
        Phase::New,
        Phase::Questions,
        Phase::Planning,
        Phase::Approval,
        Phase::Implementing,
        Phase::Review,
        Phase::Completed,
        Phase::Failed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::New => "new",
            Phase::Questions => "questions",
            Phase::Planning => "planning",
            Phase::Approval => "approval",
            Phase::Implementing => "implementing",
            Phase::Review => "review",
            Phase::Completed => "completed",
            Phase::Failed => "failed",
        }
    }

    /// Tracker label for this phase.
    pub fn label(&self) -> String {
        format!("{}{}", LABEL_PREFIX, self.as_str())
    }

    /// Parse a `phase:<name>` label. Unknown names yield `None`.
    pub fn from_label(label: &str) -> Option<Phase> {
        label.strip_prefix(LABEL_PREFIX)?.parse().ok()
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Phase::Completed | Phase::Failed)
    }

    /// Phases that wait on a human reply between polls.
    pub fn awaits_reply(&self) -> bool {
        matches!(self, Phase::Questions | Phase::Approval | Phase::Review)
    }

    /// Whether `self -> next` is an edge of the workflow graph.
    ///
    /// Leaving `failed` is not a transition; it goes through
    /// [`crate::state::ProgressRecord::reset_for_retry`].
    pub fn can_transition_to(self, next: Phase) -> bool {
        if next == Phase::Failed {
            return !self.is_terminal();
        }
        matches!(
            (self, next),
            (Phase::New, Phase::Questions)
                | (Phase::New, Phase::Planning)
                | (Phase::Questions, Phase::Questions)
                | (Phase::Questions, Phase::Planning)
                | (Phase::Planning, Phase::Approval)
                | (Phase::Approval, Phase::Approval)
                | (Phase::Approval, Phase::Implementing)
                | (Phase::Implementing, Phase::Review)
                | (Phase::Review, Phase::Review)
                | (Phase::Review, Phase::Completed)
        )
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Phase {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Phase::ALL
            .iter()
            .copied()
            .find(|p| p.as_str() == s)
            .ok_or_else(|| format!("unknown phase '{}'", s))
    }
}

/// The phase named by the first phase label, or `new` when there is none.
pub fn phase_from_labels<S: AsRef<str>>(labels: &[S]) -> Phase {
    labels
        .iter()
        .find_map(|l| Phase::from_label(l.as_ref()))
        .unwrap_or_default()
}

/// Labels to strip when moving to `target`: every other phase label.
/// `new` has no label of its own.
pub fn labels_to_remove(target: Phase) -> Vec<String> {
    Phase::ALL
        .iter()
        .filter(|p| **p != Phase::New && **p != target)
        .map(|p| p.label())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_label_round_trip() {
        for phase in Phase::ALL {
            assert_eq!(Phase::from_label(&phase.label()), Some(phase));
        }
        assert_eq!(Phase::Review.label(), "phase:review");
        assert_eq!(Phase::from_label("phase:bogus"), None);
        assert_eq!(Phase::from_label("review"), None);
    }

    #[test]
    fn test_phase_from_labels_defaults_to_new() {
        let labels = vec!["bug".to_string(), "ai-implement".to_string()];
        assert_eq!(phase_from_labels(&labels), Phase::New);

        let labels = vec!["bug", "phase:approval", "phase:review"];
        assert_eq!(phase_from_labels(&labels), Phase::Approval);
    }

    #[test]
    fn test_labels_to_remove_excludes_target_and_new() {
        let labels = labels_to_remove(Phase::Planning);
        assert_eq!(labels.len(), 6);
        assert!(!labels.contains(&"phase:planning".to_string()));
        assert!(!labels.contains(&"phase:new".to_string()));
        assert!(labels.contains(&"phase:failed".to_string()));
    }

    #[test]
    fn test_forward_transitions() {
        assert!(Phase::New.can_transition_to(Phase::Questions));
        assert!(Phase::New.can_transition_to(Phase::Planning));
        assert!(Phase::Questions.can_transition_to(Phase::Planning));
        assert!(Phase::Planning.can_transition_to(Phase::Approval));
        assert!(Phase::Approval.can_transition_to(Phase::Approval));
        assert!(Phase::Approval.can_transition_to(Phase::Implementing));
        assert!(Phase::Implementing.can_transition_to(Phase::Review));
        assert!(Phase::Review.can_transition_to(Phase::Completed));
    }

    #[test]
    fn test_regressions_are_rejected() {
        assert!(!Phase::Approval.can_transition_to(Phase::Planning));
        assert!(!Phase::Review.can_transition_to(Phase::Implementing));
        assert!(!Phase::New.can_transition_to(Phase::Implementing));
        assert!(!Phase::Planning.can_transition_to(Phase::Completed));
    }

    #[test]
    fn test_any_live_phase_can_fail() {
        for phase in Phase::ALL {
            assert_eq!(phase.can_transition_to(Phase::Failed), !phase.is_terminal());
        }
    }

    #[test]
    fn test_terminal_phases_have_no_exits() {
        for next in Phase::ALL {
            assert!(!Phase::Completed.can_transition_to(next));
            assert!(!Phase::Failed.can_transition_to(next));
        }
    }

    #[test]
    fn test_serde_uses_snake_case() {
        let json = serde_json::to_string(&Phase::Implementing).unwrap();
        assert_eq!(json, "\"implementing\"");
        let parsed: Phase = serde_json::from_str("\"approval\"").unwrap();
        assert_eq!(parsed, Phase::Approval);
    }
}
