//! Embedding a [`ProgressRecord`] in tracker-hosted text.
//!
//! A fragment is an HTML comment that renders invisibly in issue and comment
//! bodies:
//!
//! ```text
//! <!-- taskwright-state
//! { ...pretty JSON... }
//! -->
//! ```
//!
//! The system marker (`<!-- taskwright -->`) is a separate, JSON-free flag that
//! tags text posted by this tool. Either marker may appear without the other.

use std::sync::LazyLock;

use regex::Regex;
use tracing::debug;

use super::record::ProgressRecord;
use crate::errors::StateError;

pub const STATE_START: &str = "<!-- taskwright-state";
pub const STATE_END: &str = "-->";
pub const SYSTEM_MARKER: &str = "<!-- taskwright -->";

static FRAGMENT_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"<!-- taskwright-state\s*([\s\S]*?)\s*-->").unwrap());

/// Serialize `record` into a fragment, advancing its `last_updated`.
///
/// `>` is written as `\u003e` so the JSON can never close the comment early.
pub fn encode(record: &mut ProgressRecord) -> Result<String, StateError> {
    record.touch();
    let json = serde_json::to_string_pretty(record).map_err(StateError::Serialize)?;
    let json = json.replace('>', "\\u003e");
    Ok(format!("{}\n{}\n{}", STATE_START, json, STATE_END))
}

/// Extract and parse the first fragment in `text`.
///
/// Returns `Ok(None)` when the text carries no fragment.
pub fn decode(text: &str) -> Result<Option<ProgressRecord>, StateError> {
    let Some(caps) = FRAGMENT_REGEX.captures(text) else {
        return Ok(None);
    };
    let json = caps.get(1).map(|m| m.as_str()).unwrap_or_default();
    serde_json::from_str(json)
        .map(Some)
        .map_err(StateError::Malformed)
}

/// The most recently updated record across several texts.
///
/// Malformed fragments are skipped.
pub fn latest<'a, I>(texts: I) -> Option<ProgressRecord>
where
    I: IntoIterator<Item = &'a str>,
{
    let mut best: Option<ProgressRecord> = None;
    for text in texts {
        let record = match decode(text) {
            Ok(Some(record)) => record,
            Ok(None) => continue,
            Err(e) => {
                debug!(error = %e, "Skipping unreadable state fragment");
                continue;
            }
        };
        if best
            .as_ref()
            .is_none_or(|b| record.last_updated > b.last_updated)
        {
            best = Some(record);
        }
    }
    best
}

pub fn contains_fragment(text: &str) -> bool {
    FRAGMENT_REGEX.is_match(text)
}

/// Remove every fragment from `text`.
pub fn strip(text: &str) -> String {
    FRAGMENT_REGEX.replace_all(text, "").into_owned()
}

/// Strip existing fragments, then append a fresh one.
pub fn append_to_body(body: &str, record: &mut ProgressRecord) -> Result<String, StateError> {
    let fragment = encode(record)?;
    let stripped = strip(body);
    let stripped = stripped.trim();
    if stripped.is_empty() {
        return Ok(fragment);
    }
    Ok(format!("{}\n\n{}", stripped, fragment))
}

/// Replace the first fragment in place, or append one if there is none.
pub fn update_body(body: &str, record: &mut ProgressRecord) -> Result<String, StateError> {
    if !contains_fragment(body) {
        return append_to_body(body, record);
    }
    let fragment = encode(record)?;
    Ok(FRAGMENT_REGEX
        .replacen(body, 1, regex::NoExpand(&fragment))
        .into_owned())
}

pub fn has_system_marker(text: &str) -> bool {
    text.contains(SYSTEM_MARKER)
}

pub fn add_system_marker(text: &str) -> String {
    format!("{}\n\n{}", text, SYSTEM_MARKER)
}

/// Text produced by this tool: carries the system marker, a fragment, or both.
pub fn is_system_text(text: &str) -> bool {
    has_system_marker(text) || contains_fragment(text)
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, Utc};

    use super::*;
    use crate::state::{FailureReason, Phase};

    fn sample() -> ProgressRecord {
        let mut record = ProgressRecord::starting_at(Phase::Review);
        record.session_id = "sess-1".into();
        record.qa_round = 1;
        record.plan_version = 2;
        record.pr_number = Some(42);
        record.branch_name = Some("ai/issue-7".into());
        record.depends_on = Some([3, 5].into());
        record.set_blocked_by([5]);
        record.record_answer("1. Which DB?", "Postgres");
        record
    }

    #[test]
    fn test_round_trip_preserves_fields() {
        let mut record = sample();
        let before = record.last_updated;
        let text = encode(&mut record).unwrap();

        let decoded = decode(&text).unwrap().unwrap();
        assert_eq!(decoded, record);
        assert!(decoded.last_updated > before);
    }

    #[test]
    fn test_round_trip_inside_surrounding_text() {
        let mut record = sample();
        let body = append_to_body("## Plan\n\nDo the thing.", &mut record).unwrap();
        assert!(body.starts_with("## Plan"));
        assert_eq!(decode(&body).unwrap().unwrap(), record);
    }

    #[test]
    fn test_decode_without_fragment_is_none() {
        assert!(decode("just a comment").unwrap().is_none());
    }

    #[test]
    fn test_decode_malformed_is_error() {
        let text = format!("{}\n{{not json\n{}", STATE_START, STATE_END);
        assert!(matches!(decode(&text), Err(StateError::Malformed(_))));
    }

    #[test]
    fn test_closing_delimiter_in_values_is_escaped() {
        let mut record = ProgressRecord::starting_at(Phase::Implementing);
        record.fail("saw --> in output", None).unwrap();
        let text = encode(&mut record).unwrap();
        assert_eq!(text.matches(STATE_END).count(), 1);

        let decoded = decode(&text).unwrap().unwrap();
        assert_eq!(decoded.error.as_deref(), Some("saw --> in output"));
        assert_eq!(decoded.failure_reason, None::<FailureReason>);
    }

    #[test]
    fn test_latest_picks_most_recent() {
        let mut old = ProgressRecord::starting_at(Phase::Planning);
        let old_text = encode(&mut old).unwrap();

        let mut new = ProgressRecord::starting_at(Phase::Approval);
        new.last_updated = Utc::now() + Duration::seconds(5);
        let new_text = encode(&mut new).unwrap();

        let texts = [new_text.as_str(), "no state here", old_text.as_str()];
        let picked = latest(texts).unwrap();
        assert_eq!(picked.phase(), Phase::Approval);
    }

    #[test]
    fn test_latest_skips_malformed() {
        let broken = format!("{} {{oops {}", STATE_START, STATE_END);
        let mut good = ProgressRecord::starting_at(Phase::Questions);
        let good_text = encode(&mut good).unwrap();
        let picked = latest([broken.as_str(), good_text.as_str()]).unwrap();
        assert_eq!(picked.phase(), Phase::Questions);
        assert!(latest(["nothing", "here"]).is_none());
    }

    #[test]
    fn test_append_replaces_existing_fragment() {
        let mut first = ProgressRecord::starting_at(Phase::Planning);
        let body = append_to_body("Body", &mut first).unwrap();

        let mut second = ProgressRecord::starting_at(Phase::Approval);
        let body = append_to_body(&body, &mut second).unwrap();

        assert_eq!(body.matches(STATE_START).count(), 1);
        assert_eq!(decode(&body).unwrap().unwrap().phase(), Phase::Approval);
        assert!(body.starts_with("Body\n\n"));
    }

    #[test]
    fn test_update_replaces_in_place() {
        let mut first = ProgressRecord::starting_at(Phase::Planning);
        let fragment = encode(&mut first).unwrap();
        let body = format!("Header\n{}\nFooter", fragment);

        let mut second = ProgressRecord::starting_at(Phase::Approval);
        let updated = update_body(&body, &mut second).unwrap();
        assert!(updated.starts_with("Header\n"));
        assert!(updated.ends_with("\nFooter"));
        assert_eq!(decode(&updated).unwrap().unwrap().phase(), Phase::Approval);
    }

    #[test]
    fn test_update_appends_when_missing() {
        let mut record = ProgressRecord::new();
        let updated = update_body("Plain body", &mut record).unwrap();
        assert!(updated.starts_with("Plain body\n\n"));
        assert!(contains_fragment(&updated));
    }

    #[test]
    fn test_markers_are_independent() {
        let marked = add_system_marker("**Error:** boom");
        assert!(has_system_marker(&marked));
        assert!(!contains_fragment(&marked));
        assert!(is_system_text(&marked));

        let mut record = ProgressRecord::new();
        let stateful = encode(&mut record).unwrap();
        assert!(!has_system_marker(&stateful));
        assert!(contains_fragment(&stateful));
        assert!(is_system_text(&stateful));

        assert!(!is_system_text("LGTM, /approve"));
    }

    #[test]
    fn test_strip_removes_fragment() {
        let mut record = ProgressRecord::new();
        let body = append_to_body("Please use Redis", &mut record).unwrap();
        assert_eq!(strip(&body).trim(), "Please use Redis");
    }
}
