//! Interpreting agent output and agent-written files.

use std::sync::LazyLock;

use regex::Regex;

use crate::agent::prompts::{
    IMPLEMENTATION_COMPLETE_MARKER, NO_QUESTIONS_MARKER, SIGNIFICANT_CHANGES_MARKER,
};

static MERGE_CONFLICT_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"MERGE_CONFLICT_UNRESOLVED:[ \t]*([^\r\n]+)").unwrap());

static BRANCH_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"IMPLEMENTATION_COMPLETE[ \t]+`?([A-Za-z0-9._/\-]+)`?").unwrap());

static PULL_URL_REGEX: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"/pulls?/(\d+)").unwrap());

const GIT_ERROR_PATTERNS: &[&str] = &[
    "push rejected",
    "failed to push",
    "rebase failed",
    "fatal: ",
    "error: failed to",
];

/// Whether the questions file asks anything. Empty means no.
pub fn questions_pending(questions: &str) -> bool {
    let trimmed = questions.trim();
    !trimmed.is_empty() && !trimmed.contains(NO_QUESTIONS_MARKER)
}

/// Whether a plan revision changed enough to warrant another review cycle.
pub fn needs_rereview(output: &str) -> bool {
    output.contains(SIGNIFICANT_CHANGES_MARKER)
}

/// Files the agent could not merge, from `MERGE_CONFLICT_UNRESOLVED: a, b`.
///
/// Empty when the marker is absent.
pub fn parse_merge_conflict(output: &str) -> Vec<String> {
    let Some(caps) = MERGE_CONFLICT_REGEX.captures(output) else {
        return Vec::new();
    };
    caps[1]
        .split(',')
        .map(|f| f.trim().trim_matches('`').to_string())
        .filter(|f| !f.is_empty() && !f.starts_with('<'))
        .collect()
}

/// Branch from `IMPLEMENTATION_COMPLETE <branch>`.
pub fn parse_branch(output: &str) -> Option<String> {
    if !output.contains(IMPLEMENTATION_COMPLETE_MARKER) {
        return None;
    }
    BRANCH_REGEX
        .captures_iter(output)
        .map(|caps| caps[1].to_string())
        .filter(|b| b != "branch-name")
        .last()
}

/// Whether the output reports a git failure the agent did not recover from.
///
/// Mentions of a resolution anywhere in the output suppress the match.
/// `CONFLICT` is matched in git's own upper case so prose about conflicts does not count.
pub fn has_git_error(output: &str) -> bool {
    let lower = output.to_lowercase();
    if lower.contains("resolved") || lower.contains("successfully") {
        return false;
    }
    output.contains("CONFLICT (") || GIT_ERROR_PATTERNS.iter().any(|p| lower.contains(p))
}

/// Pull request number from an "already exists" creation error.
pub fn parse_existing_pr(message: &str) -> Option<u64> {
    if !message.contains("already exists") {
        return None;
    }
    PULL_URL_REGEX
        .captures(message)
        .and_then(|caps| caps[1].parse().ok())
}
