//! The per-item status comment.
//!
//! One comment per item holds a timestamped progress log, the state fragment,
//! and the system marker. It is created on first write and edited afterwards;
//! its id lives in the record so restarts keep editing the same comment. This
//! is also where the record is persisted after each transition, so writes
//! happen even when the log display is disabled.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::config::ProgressConfig;
use crate::errors::OrchestratorError;
use crate::retry::RetryPolicy;
use crate::state::{ProgressRecord, add_system_marker, encode};
use crate::tracker::{Tracker, WorkItem};

pub const ANALYZING: &str = "🔍 Analyzing issue and generating questions...";
pub const PLANNING: &str = "📝 Creating implementation plan...";
pub const WAITING_ANSWERS: &str = "❓ Waiting for answers...";
pub const WAITING_APPROVAL: &str = "⏳ Waiting for approval...";
pub const IMPLEMENTING: &str = "🔨 Implementing changes...";
pub const CREATING_PR: &str = "🚀 Creating PR...";
pub const ADDRESSED_FEEDBACK: &str = "🔧 Addressed PR feedback and pushed changes";
pub const WAITING_CI: &str = "⏳ Waiting for CI to complete...";
pub const CI_PASSED: &str = "✅ CI passed";
pub const RETRYING: &str = "🔁 Retrying...";

pub fn plan_review(iteration: u32, total: u32) -> String {
    format!("🔄 Reviewing plan ({}/{})...", iteration, total)
}

pub fn code_review(iteration: u32, total: u32) -> String {
    format!("✅ Code review ({}/{})...", iteration, total)
}

pub fn completed(pr_number: Option<u64>) -> String {
    match pr_number {
        Some(n) => format!("✨ Completed successfully - PR #{}", n),
        None => "✨ Completed successfully".to_string(),
    }
}

pub fn failed(message: &str) -> String {
    format!("❌ Failed: {}", message)
}

pub fn fixing_ci(attempt: u32, max: u32) -> String {
    format!("🔧 Fixing CI failure (attempt {}/{})...", attempt, max)
}

pub fn ci_fix_exhausted(attempts: u32, max: u32) -> String {
    format!("❌ CI fix attempts exhausted ({}/{})", attempts, max)
}

pub fn ci_timed_out(after: Duration) -> String {
    format!("⏰ CI timed out after {}s", after.as_secs())
}

/// Writes the status comment for one item.
pub struct Reporter {
    tracker: Arc<dyn Tracker>,
    item: WorkItem,
    enabled: bool,
    debounce: Duration,
    last_update: Option<Instant>,
    last_status: Option<String>,
    retry: RetryPolicy,
    cancel: CancellationToken,
}

impl Reporter {
    pub fn new(
        tracker: Arc<dyn Tracker>,
        item: WorkItem,
        config: &ProgressConfig,
        retry: RetryPolicy,
        cancel: CancellationToken,
        record: &ProgressRecord,
    ) -> Self {
        let last_status = record
            .status_history
            .last()
            .and_then(|entry| entry.split_once('|'))
            .map(|(_, msg)| msg.to_string());
        Self {
            tracker,
            item,
            enabled: config.enabled,
            debounce: Duration::from_secs(config.debounce_secs),
            last_update: None,
            last_status,
            retry,
            cancel,
        }
    }

    /// Log `status` unless it repeats the last one or the debounce window is open.
    pub async fn update(
        &mut self,
        record: &mut ProgressRecord,
        status: &str,
    ) -> Result<(), OrchestratorError> {
        if !self.enabled || self.last_status.as_deref() == Some(status) {
            return Ok(());
        }
        let recent = self.last_update.is_some_and(|t| t.elapsed() < self.debounce);
        if recent && record.status_comment_id.is_some() {
            debug!(item = %self.item, status, "Debounced progress update");
            return Ok(());
        }
        self.write(record, Some(status)).await
    }

    /// Log `status` now. A repeated status persists the record without a new entry.
    pub async fn force_update(
        &mut self,
        record: &mut ProgressRecord,
        status: &str,
    ) -> Result<(), OrchestratorError> {
        if self.last_status.as_deref() == Some(status) {
            return self.write(record, None).await;
        }
        self.write(record, Some(status)).await
    }

    /// Final entry for a terminal phase. Always written.
    pub async fn finalize(
        &mut self,
        record: &mut ProgressRecord,
        status: &str,
    ) -> Result<(), OrchestratorError> {
        self.last_status = None;
        self.write(record, Some(status)).await
    }

    /// Rewrite the status comment with the current record and no new entry.
    pub async fn persist(&mut self, record: &mut ProgressRecord) -> Result<(), OrchestratorError> {
        self.write(record, None).await
    }

    async fn write(
        &mut self,
        record: &mut ProgressRecord,
        status: Option<&str>,
    ) -> Result<(), OrchestratorError> {
        if let Some(status) = status {
            if self.enabled {
                let stamp = Utc::now().format("%H:%M:%S");
                record.push_status(format!("{}|{}", stamp, status));
            }
            self.last_status = Some(status.to_string());
        }

        let tracker = &self.tracker;
        let repo = self.item.repo.as_str();
        match record.status_comment_id {
            Some(id) => {
                let body = self.render(record)?;
                self.retry
                    .run(&self.cancel, || tracker.update_comment(repo, id, &body))
                    .await?;
            }
            None => {
                let number = self.item.number;
                let body = self.render(record)?;
                let id = self
                    .retry
                    .run(&self.cancel, || tracker.create_comment(repo, number, &body))
                    .await?;
                // Rewrite once so the stored fragment knows its own comment.
                record.status_comment_id = Some(id);
                let body = self.render(record)?;
                self.retry
                    .run(&self.cancel, || tracker.update_comment(repo, id, &body))
                    .await?;
            }
        }
        self.last_update = Some(Instant::now());
        Ok(())
    }

    fn render(&self, record: &mut ProgressRecord) -> Result<String, OrchestratorError> {
        let fragment = encode(record)?;
        if !self.enabled {
            return Ok(add_system_marker(&fragment));
        }
        let mut lines = vec!["**Progress Log**".to_string(), String::new()];
        lines.extend(
            record
                .status_history
                .iter()
                .filter_map(|entry| entry.split_once('|'))
                .map(|(time, msg)| format!("`{}` {}", time, msg)),
        );
        Ok(add_system_marker(&format!(
            "{}\n\n{}",
            lines.join("\n"),
            fragment
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::{Phase, decode, has_system_marker};
    use crate::tracker::{InMemoryTracker, Issue};

    const REPO: &str = "acme/widgets";

    fn setup(enabled: bool, debounce_secs: u64) -> (Arc<InMemoryTracker>, Reporter, ProgressRecord) {
        let tracker = Arc::new(InMemoryTracker::new());
        tracker.add_issue(
            REPO,
            Issue {
                number: 1,
                title: "t".into(),
                ..Issue::default()
            },
        );
        let record = ProgressRecord::new();
        let config = ProgressConfig {
            enabled,
            debounce_secs,
        };
        let reporter = Reporter::new(
            tracker.clone(),
            WorkItem::new(REPO, 1),
            &config,
            RetryPolicy::default(),
            CancellationToken::new(),
            &record,
        );
        (tracker, reporter, record)
    }

    #[tokio::test]
    async fn test_first_write_creates_then_edits() {
        let (tracker, mut reporter, mut record) = setup(true, 0);
        reporter.force_update(&mut record, ANALYZING).await.unwrap();
        reporter.force_update(&mut record, PLANNING).await.unwrap();

        let comments = tracker.comments(REPO, 1);
        assert_eq!(comments.len(), 1);
        let body = &comments[0].body;
        assert!(body.starts_with("**Progress Log**\n\n`"));
        assert!(body.contains(ANALYZING));
        assert!(body.contains(PLANNING));
        assert!(has_system_marker(body));

        let stored = decode(body).unwrap().unwrap();
        assert_eq!(stored.status_comment_id, Some(comments[0].id));
        assert_eq!(stored.status_history.len(), 2);
    }

    #[tokio::test]
    async fn test_duplicate_status_is_not_logged_twice() {
        let (tracker, mut reporter, mut record) = setup(true, 0);
        reporter.force_update(&mut record, WAITING_APPROVAL).await.unwrap();
        record.transition(Phase::Questions).unwrap();
        reporter.force_update(&mut record, WAITING_APPROVAL).await.unwrap();
        reporter.update(&mut record, WAITING_APPROVAL).await.unwrap();

        assert_eq!(record.status_history.len(), 1);
        let stored = decode(&tracker.comments(REPO, 1)[0].body).unwrap().unwrap();
        // The repeat still persisted the new phase.
        assert_eq!(stored.current_phase, Phase::Questions);
    }

    #[tokio::test]
    async fn test_update_is_debounced() {
        let (tracker, mut reporter, mut record) = setup(true, 3600);
        reporter.update(&mut record, ANALYZING).await.unwrap();
        reporter.update(&mut record, PLANNING).await.unwrap();
        assert_eq!(record.status_history.len(), 1);
        assert_eq!(tracker.call_count("create_comment"), 1);

        reporter.finalize(&mut record, &completed(Some(3))).await.unwrap();
        assert_eq!(record.status_history.len(), 2);
        assert!(tracker.comments(REPO, 1)[0].body.contains("PR #3"));
    }

    #[tokio::test]
    async fn test_disabled_still_persists_fragment() {
        let (tracker, mut reporter, mut record) = setup(false, 0);
        reporter.update(&mut record, ANALYZING).await.unwrap();
        assert_eq!(tracker.call_count("create_comment"), 0);

        reporter.force_update(&mut record, ANALYZING).await.unwrap();
        let comments = tracker.comments(REPO, 1);
        assert_eq!(comments.len(), 1);
        assert!(!comments[0].body.contains("Progress Log"));
        assert!(record.status_history.is_empty());
        assert!(decode(&comments[0].body).unwrap().is_some());
    }

    #[tokio::test]
    async fn test_resumes_existing_comment_and_last_status() {
        let (tracker, mut reporter, mut record) = setup(true, 0);
        reporter.force_update(&mut record, IMPLEMENTING).await.unwrap();

        let mut resumed = Reporter::new(
            tracker.clone(),
            WorkItem::new(REPO, 1),
            &ProgressConfig::default(),
            RetryPolicy::default(),
            CancellationToken::new(),
            &record,
        );
        resumed.force_update(&mut record, IMPLEMENTING).await.unwrap();
        assert_eq!(record.status_history.len(), 1);
        assert_eq!(tracker.comments(REPO, 1).len(), 1);
    }

    #[test]
    fn test_status_formatters() {
        assert_eq!(plan_review(2, 5), "🔄 Reviewing plan (2/5)...");
        assert_eq!(code_review(1, 3), "✅ Code review (1/3)...");
        assert_eq!(completed(None), "✨ Completed successfully");
        assert_eq!(failed("boom"), "❌ Failed: boom");
        assert_eq!(fixing_ci(1, 3), "🔧 Fixing CI failure (attempt 1/3)...");
        assert_eq!(ci_fix_exhausted(3, 3), "❌ CI fix attempts exhausted (3/3)");
    }
}
