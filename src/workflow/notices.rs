//! Human-readable comments posted when an item fails, blocks, or resumes.
//!
//! Every notice carries the system marker so reply scanning skips it.

use crate::errors::CycleError;
use crate::state::add_system_marker;

/// Label added when a merge conflict needs a human.
pub const NEEDS_MANUAL_RESOLUTION_LABEL: &str = "needs-manual-resolution";

/// Label set by `taskwright abort`; the daemon leaves such items alone.
pub const ABORT_LABEL: &str = "abort";

pub fn error(message: &str) -> String {
    add_system_marker(&format!("**Error:**\n```\n{}\n```", message))
}

pub fn merge_conflict(files: &[String], base_branch: &str) -> String {
    let mut out = String::from("**Merge Conflict**\n\n");
    out.push_str("Unable to automatically resolve merge conflicts in the following files:\n\n");
    for file in files {
        out.push_str(&format!("- `{}`\n", file));
    }
    out.push_str("\n**What was attempted:**\n");
    out.push_str(&format!("- Fetched latest changes from origin/{}\n", base_branch));
    out.push_str(&format!("- Attempted to rebase onto {}\n", base_branch));
    out.push_str("- Tried to resolve conflicts using code context\n\n");
    out.push_str("**To resolve:**\n");
    out.push_str("1. Manually resolve the conflicts in the listed files\n");
    out.push_str("2. Push the resolved changes to the branch\n");
    out.push_str("3. Comment `/retry` to re-trigger processing\n");
    add_system_marker(&out)
}

pub fn dependency_failed(dependency: u64) -> String {
    add_system_marker(&format!(
        "**Blocked:** Dependency #{} failed. This issue cannot proceed until the dependency is resolved.\n\nRetry with `/retry` after fixing the dependency.",
        dependency
    ))
}

pub fn dependency_cycle(cycle: &CycleError) -> String {
    add_system_marker(&format!(
        "**Blocked:** {}.\n\nRemove one of the dependencies, then comment `/retry`.",
        cycle
    ))
}

pub fn unblocked(dependency: u64) -> String {
    add_system_marker(&format!(
        "Dependency #{} completed. Proceeding with this issue.",
        dependency
    ))
}

pub fn pr_created(number: u64, url: &str) -> String {
    add_system_marker(&format!("Created PR #{}: {}", number, url))
}

pub fn feedback_addressed() -> String {
    add_system_marker("Addressed PR feedback and pushed changes.")
}

pub fn retrying() -> String {
    add_system_marker("Retrying implementation...")
}

pub fn aborted_from_cli() -> String {
    add_system_marker("**Processing aborted** via CLI command.")
}

/// Pull request body: the agent's summary (or a stock one), the closing keyword, a footer.
pub fn pr_body(issue_number: u64, summary: &str) -> String {
    let mut out = String::new();
    if summary.trim().is_empty() {
        out.push_str("## Summary\n\nImplements the requested changes.\n\n");
    } else {
        out.push_str(summary.trim());
        out.push_str("\n\n");
    }
    out.push_str(&format!("Closes #{}\n\n", issue_number));
    out.push_str("---\n*Automated by taskwright*\n");
    out
}

pub fn pr_title(issue_title: &str) -> String {
    format!("Implement: {}", issue_title)
}
