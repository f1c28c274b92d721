//! Extracting declared dependencies from issue text and labels.

use std::collections::BTreeSet;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::state::is_system_text;
use crate::tracker::{Comment, Issue};

/// Label that disables detection for one issue.
pub const OVERRIDE_LABEL: &str = "no-dependencies";
/// Body token that disables detection for one issue.
pub const OVERRIDE_TOKEN: &str = "/no-deps";
/// Explicit dependency label prefix: `depends-on:#12` or `depends-on:12`.
pub const DEPENDS_LABEL_PREFIX: &str = "depends-on:";

// Case-insensitive; each captures the referenced issue number.
static REFERENCE_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        r"(?i)\bdepends?\s+on\s+#(\d+)",
        r"(?i)\bafter\s+#(\d+)",
        r"(?i)\brequires?\s+#(\d+)",
        r"(?i)\bblocked\s+by\s+#(\d+)",
        r"(?i)\bwaiting\s+(?:for|on)\s+#(\d+)",
    ]
    .iter()
    .map(|p| Regex::new(p).unwrap())
    .collect()
});

/// How much of an issue the detector reads.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DetectionMode {
    /// Text patterns and explicit labels.
    #[default]
    Auto,
    /// Explicit `depends-on:` labels only.
    Manual,
    /// No dependencies are ever reported.
    Disabled,
}

impl std::str::FromStr for DetectionMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "auto" => Ok(DetectionMode::Auto),
            "manual" => Ok(DetectionMode::Manual),
            "disabled" => Ok(DetectionMode::Disabled),
            other => Err(format!(
                "invalid dependency detection mode '{}': expected auto, manual or disabled",
                other
            )),
        }
    }
}

/// Issue numbers referenced by dependency phrases in `text`, in order of first
/// appearance, deduplicated, without `self_number`.
pub fn parse_issue_references(text: &str, self_number: u64) -> Vec<u64> {
    let mut found: Vec<(usize, u64)> = REFERENCE_PATTERNS
        .iter()
        .flat_map(|re| re.captures_iter(text))
        .filter_map(|caps| {
            let m = caps.get(1)?;
            let number = m.as_str().parse::<u64>().ok()?;
            Some((m.start(), number))
        })
        .collect();
    found.sort_by_key(|(pos, _)| *pos);

    let mut seen = BTreeSet::new();
    found
        .into_iter()
        .map(|(_, n)| n)
        .filter(|n| *n != self_number && seen.insert(*n))
        .collect()
}

/// Issue numbers named by `depends-on:` labels.
pub fn parse_dependency_labels<S: AsRef<str>>(labels: &[S], self_number: u64) -> Vec<u64> {
    labels
        .iter()
        .filter_map(|l| l.as_ref().strip_prefix(DEPENDS_LABEL_PREFIX))
        .filter_map(|rest| rest.trim().trim_start_matches('#').parse::<u64>().ok())
        .filter(|n| *n != self_number)
        .collect()
}

/// Computes an issue's dependency set.
#[derive(Debug, Clone, Copy, Default)]
pub struct DependencyDetector {
    mode: DetectionMode,
}

impl DependencyDetector {
    pub fn new(mode: DetectionMode) -> Self {
        Self { mode }
    }

    pub fn mode(&self) -> DetectionMode {
        self.mode
    }

    /// Whether the issue opted out of dependency detection.
    pub fn has_override(issue: &Issue) -> bool {
        issue.labels.iter().any(|l| l == OVERRIDE_LABEL) || issue.body.contains(OVERRIDE_TOKEN)
    }

    /// Dependencies declared by `issue` in its labels, body, and human comments.
    pub fn detect(&self, issue: &Issue, comments: &[Comment]) -> BTreeSet<u64> {
        if self.mode == DetectionMode::Disabled || Self::has_override(issue) {
            return BTreeSet::new();
        }

        let mut deps: BTreeSet<u64> = parse_dependency_labels(&issue.labels, issue.number)
            .into_iter()
            .collect();

        if self.mode == DetectionMode::Auto {
            deps.extend(parse_issue_references(&issue.body, issue.number));
            for comment in comments.iter().filter(|c| !is_system_text(&c.body)) {
                deps.extend(parse_issue_references(&comment.body, issue.number));
            }
        }
        deps
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;

    fn issue(number: u64, body: &str, labels: &[&str]) -> Issue {
        Issue {
            number,
            title: format!("Issue {}", number),
            body: body.to_string(),
            labels: labels.iter().map(|l| l.to_string()).collect(),
            ..Issue::default()
        }
    }

    fn comment(id: u64, body: &str) -> Comment {
        Comment {
            id,
            body: body.to_string(),
            author: "alice".into(),
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_parse_each_pattern() {
        assert_eq!(parse_issue_references("Depends on #12", 1), vec![12]);
        assert_eq!(parse_issue_references("depend on #3", 1), vec![3]);
        assert_eq!(parse_issue_references("do this after #4", 1), vec![4]);
        assert_eq!(parse_issue_references("Requires #5", 1), vec![5]);
        assert_eq!(parse_issue_references("require #6", 1), vec![6]);
        assert_eq!(parse_issue_references("BLOCKED BY #7", 1), vec![7]);
        assert_eq!(parse_issue_references("waiting for #8", 1), vec![8]);
        assert_eq!(parse_issue_references("Waiting on #9", 1), vec![9]);
    }

    #[test]
    fn test_parse_dedupes_and_orders() {
        let text = "requires #20, depends on #10\nalso blocked by #20 and after #10";
        assert_eq!(parse_issue_references(text, 1), vec![20, 10]);
    }

    #[test]
    fn test_parse_removes_self_reference() {
        assert_eq!(
            parse_issue_references("depends on #7 and after #3", 7),
            vec![3]
        );
    }

    #[test]
    fn test_parse_ignores_plain_mentions() {
        assert!(parse_issue_references("see #4 and fixes #5", 1).is_empty());
        assert!(parse_issue_references("depends on 4", 1).is_empty());
        assert!(parse_issue_references("thereafter #4", 1).is_empty());
    }

    #[test]
    fn test_parse_dependency_labels() {
        let labels = ["depends-on:#3", "depends-on:4", "bug", "depends-on:#9", "depends-on:x"];
        assert_eq!(parse_dependency_labels(&labels, 9), vec![3, 4]);
    }

    #[test]
    fn test_detect_reads_body_and_human_comments() {
        let detector = DependencyDetector::new(DetectionMode::Auto);
        let item = issue(10, "Depends on #1", &[]);
        let comments = vec![
            comment(1, "Also waiting on #2"),
            comment(2, "**Blocked:** depends on #99\n\n<!-- taskwright -->"),
        ];
        assert_eq!(detector.detect(&item, &comments), BTreeSet::from([1, 2]));
    }

    #[test]
    fn test_detect_override_label_and_token() {
        let detector = DependencyDetector::new(DetectionMode::Auto);
        let labelled = issue(10, "Depends on #1", &[OVERRIDE_LABEL]);
        assert!(detector.detect(&labelled, &[]).is_empty());

        let tokened = issue(10, "Depends on #1\n/no-deps", &[]);
        assert!(detector.detect(&tokened, &[]).is_empty());
    }

    #[test]
    fn test_detect_disabled_mode() {
        let detector = DependencyDetector::new(DetectionMode::Disabled);
        let item = issue(10, "Depends on #1", &["depends-on:#2"]);
        assert!(detector.detect(&item, &[]).is_empty());
    }

    #[test]
    fn test_detect_manual_mode_uses_labels_only() {
        let detector = DependencyDetector::new(DetectionMode::Manual);
        let item = issue(10, "Depends on #1", &["depends-on:#2"]);
        let comments = vec![comment(1, "after #3")];
        assert_eq!(detector.detect(&item, &comments), BTreeSet::from([2]));
    }

    #[test]
    fn test_mode_from_str() {
        assert_eq!("AUTO".parse::<DetectionMode>().unwrap(), DetectionMode::Auto);
        assert_eq!("manual".parse::<DetectionMode>().unwrap(), DetectionMode::Manual);
        assert!("sometimes".parse::<DetectionMode>().is_err());
    }
}
