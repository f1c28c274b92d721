//! Slash commands recognised in issue comments.

use crate::state::strip;

/// `/approve`, alone, is the only approval.
pub fn is_approval(body: &str) -> bool {
    body.trim() == "/approve"
}

/// `/abort ...` or a bare `abort`, any case.
pub fn is_abort(body: &str) -> bool {
    let lower = body.trim().to_lowercase();
    lower.starts_with("/abort") || lower == "abort"
}

/// `/retry` or `/retry <reason>`, any case.
pub fn is_retry(body: &str) -> bool {
    let lower = body.trim().to_lowercase();
    lower == "/retry" || lower.starts_with("/retry ")
}

/// The human text of a reply, with any state fragment removed.
pub fn extract_feedback(body: &str) -> String {
    strip(body).trim().to_string()
}
