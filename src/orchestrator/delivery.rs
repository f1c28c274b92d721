//! Phases after approval: implementation, pull request review, CI, merge.

use std::time::Duration;

use chrono::Utc;
use tracing::{debug, info, warn};

use super::{Orchestrator, Run, Step, reply_text};
use crate::agent::AgentTask;
use crate::agent::prompts;
use crate::errors::{OrchestratorError, RetryError};
use crate::progress;
use crate::state::{FailureReason, Phase, ProgressRecord, is_system_text};
use crate::tracker::{CiStatus, Comment, NewPullRequest, PullRequest};
use crate::workflow::notices::{self, NEEDS_MANUAL_RESOLUTION_LABEL};
use crate::workflow::{has_git_error, parse_branch, parse_existing_pr, parse_merge_conflict};

/// Lines of agent output quoted when a git failure is reported.
const GIT_ERROR_CONTEXT_LINES: usize = 20;

/// Branch used when the agent does not name the one it pushed.
pub fn fallback_branch(issue_number: u64) -> String {
    format!("taskwright/issue-{}", issue_number)
}

impl Orchestrator {
    pub(super) async fn handle_implementing(
        &self,
        run: &mut Run,
        record: &mut ProgressRecord,
    ) -> Result<Step, OrchestratorError> {
        let base = self.base_branch(run).await;

        if record.branch_name.is_none() {
            info!(item = %run.item, base = %base, "Implementing plan");
            run.reporter.force_update(record, progress::IMPLEMENTING).await?;
            let prompt = prompts::implement(run.item.number, &run.issue.title, &base);
            let response = self
                .agent(run, record, AgentTask::Implement, prompt)
                .await?;

            let conflicts = parse_merge_conflict(&response.output);
            if !conflicts.is_empty() {
                self.fail_merge_conflict(run, record, &conflicts, &base)
                    .await?;
                return Ok(Step::Continue);
            }
            if has_git_error(&response.output) {
                return Err(OrchestratorError::Git(tail(
                    &response.output,
                    GIT_ERROR_CONTEXT_LINES,
                )));
            }

            let branch = parse_branch(&response.output).unwrap_or_else(|| {
                let fallback = fallback_branch(run.item.number);
                warn!(item = %run.item, branch = %fallback, "Agent did not report a branch, assuming default");
                fallback
            });
            info!(item = %run.item, branch = %branch, "Implementation pushed");
            record.branch_name = Some(branch);
            self.checkpoint(run, record).await?;
        }

        let cycles = self.config.agent.review_cycles;
        let branch = record.branch_name.clone().unwrap_or_default();
        while record.review_iteration < cycles {
            let i = record.review_iteration + 1;
            run.reporter
                .force_update(record, &progress::code_review(i, cycles))
                .await?;
            self.agent(
                run,
                record,
                AgentTask::ReviewCode,
                prompts::review_code(i, cycles, &branch),
            )
            .await?;
            record.review_iteration = i;
            run.states.register(&run.item, record);
        }

        self.enter(run, record, Phase::Review, progress::CREATING_PR)
            .await?;
        Ok(Step::Continue)
    }

    pub(super) async fn handle_review(
        &self,
        run: &mut Run,
        record: &mut ProgressRecord,
    ) -> Result<Step, OrchestratorError> {
        let pr_number = match record.pr_number {
            Some(n) => n,
            None => {
                let base = self.base_branch(run).await;
                let pr = self.open_pr(run, record, &base).await?;
                info!(item = %run.item, pr = pr.number, "Opened pull request");
                record.pr_number = Some(pr.number);
                record.last_pr_comment_time = Some(Utc::now());
                self.checkpoint(run, record).await?;
                self.post_comment(
                    &run.item,
                    &notices::pr_created(pr.number, &pr.html_url),
                    &run.cancel,
                )
                .await?;
                pr.number
            }
        };

        if self.address_pr_feedback(run, record, pr_number).await? {
            return Ok(Step::Wait);
        }

        if self.config.ci.wait_for_ci
            && let Some(step) = self.check_ci(run, record, pr_number).await?
        {
            return Ok(step);
        }

        let repo = run.item.repo.as_str();
        let mergeable = self
            .tracker_retry
            .run(&run.cancel, || self.tracker.is_mergeable(repo, pr_number))
            .await?;
        if !mergeable || !self.config.defaults.auto_merge {
            debug!(item = %run.item, pr = pr_number, mergeable, "Pull request not merged yet");
            return Ok(Step::Wait);
        }

        info!(item = %run.item, pr = pr_number, "Merging pull request");
        self.tracker_retry
            .run(&run.cancel, || self.tracker.merge_pr(repo, pr_number))
            .await?;
        record.transition(Phase::Completed)?;
        self.set_phase_label(&run.item, Phase::Completed, &run.cancel)
            .await?;
        run.reporter
            .finalize(record, &progress::completed(Some(pr_number)))
            .await?;
        run.states.register(&run.item, record);
        self.workspaces.cleanup(&run.item).await;
        Ok(Step::Continue)
    }

    async fn fail_merge_conflict(
        &self,
        run: &mut Run,
        record: &mut ProgressRecord,
        files: &[String],
        base: &str,
    ) -> Result<(), OrchestratorError> {
        let message = format!("Merge conflict in: {}", files.join(", "));
        let notice = notices::merge_conflict(files, base);
        self.fail_with(
            &run.item,
            record,
            &mut run.reporter,
            &message,
            Some(FailureReason::MergeConflict),
            &notice,
            &run.cancel,
        )
        .await?;

        let (repo, number) = (run.item.repo.as_str(), run.item.number);
        self.tracker_retry
            .run(&run.cancel, || {
                self.tracker
                    .remove_label(repo, number, &self.config.trigger_label)
            })
            .await?;
        self.tracker_retry
            .run(&run.cancel, || {
                self.tracker
                    .add_label(repo, number, NEEDS_MANUAL_RESOLUTION_LABEL)
            })
            .await?;
        Ok(())
    }

    /// The repository's default branch, or the configured one when it cannot be read.
    async fn base_branch(&self, run: &Run) -> String {
        match self.tracker.get_default_branch(&run.item.repo).await {
            Ok(branch) if !branch.trim().is_empty() => branch,
            Ok(_) => self.config.defaults.base_branch.clone(),
            Err(e) => {
                debug!(item = %run.item, error = %e, "Default branch lookup failed");
                self.config.defaults.base_branch.clone()
            }
        }
    }

    async fn open_pr(
        &self,
        run: &mut Run,
        record: &mut ProgressRecord,
        base: &str,
    ) -> Result<PullRequest, OrchestratorError> {
        let head = record
            .branch_name
            .clone()
            .unwrap_or_else(|| fallback_branch(run.item.number));

        let summary = match self
            .agent(
                run,
                record,
                AgentTask::Summarize,
                prompts::summarize_changes(base, &head),
            )
            .await
        {
            Ok(response) => response.output,
            Err(e) if e.is_cancelled() => return Err(e),
            Err(e) => {
                warn!(item = %run.item, error = %e, "Could not summarize changes, using stock PR body");
                String::new()
            }
        };

        let new_pr = NewPullRequest {
            title: notices::pr_title(&run.issue.title),
            body: notices::pr_body(run.item.number, &summary),
            head,
            base: base.to_string(),
            issue_number: run.item.number,
        };
        let repo = run.item.repo.as_str();
        match self
            .tracker_retry
            .run(&run.cancel, || self.tracker.create_pr(repo, &new_pr))
            .await
        {
            Ok(pr) => Ok(pr),
            Err(RetryError::Cancelled) => Err(OrchestratorError::Cancelled),
            Err(RetryError::Failed { source, .. }) => {
                let Some(existing) = parse_existing_pr(&source.to_string()) else {
                    return Err(source.into());
                };
                info!(item = %run.item, pr = existing, "Pull request already exists, reusing it");
                Ok(self
                    .tracker_retry
                    .run(&run.cancel, || self.tracker.get_pr(repo, existing))
                    .await?)
            }
        }
    }

    /// Hand new authorized PR comments to the agent. Returns whether any were addressed.
    async fn address_pr_feedback(
        &self,
        run: &mut Run,
        record: &mut ProgressRecord,
        pr_number: u64,
    ) -> Result<bool, OrchestratorError> {
        let repo = run.item.repo.as_str();
        let mut candidates: Vec<Comment> = Vec::new();
        match self
            .tracker_retry
            .run(&run.cancel, || self.tracker.get_pr_comments(repo, pr_number))
            .await
        {
            Ok(comments) => candidates.extend(comments),
            Err(RetryError::Cancelled) => return Err(OrchestratorError::Cancelled),
            Err(e) => warn!(item = %run.item, pr = pr_number, error = %e, "Failed to fetch PR comments"),
        }
        match self
            .tracker_retry
            .run(&run.cancel, || {
                self.tracker.get_pr_review_comments(repo, pr_number)
            })
            .await
        {
            Ok(comments) => candidates.extend(comments),
            Err(RetryError::Cancelled) => return Err(OrchestratorError::Cancelled),
            Err(e) => warn!(item = %run.item, pr = pr_number, error = %e, "Failed to fetch PR review comments"),
        }

        let since = record.last_pr_comment_time;
        candidates.retain(|c| {
            !is_system_text(&c.body) && since.is_none_or(|t| c.created_at > t)
        });
        candidates.sort_by_key(|c| c.created_at);

        let mut feedback = Vec::new();
        let mut newest = None;
        for comment in &candidates {
            if crate::auth::is_authorized(self.tracker.as_ref(), repo, &comment.author).await {
                feedback.push(reply_text(comment));
                newest = Some(comment.created_at);
            }
        }
        if feedback.is_empty() {
            return Ok(false);
        }

        info!(item = %run.item, pr = pr_number, count = feedback.len(), "Addressing PR feedback");
        let branch = record.branch_name.clone().unwrap_or_default();
        let prompt = prompts::address_feedback(&feedback.join("\n\n---\n\n"), &branch);
        self.agent(run, record, AgentTask::AddressFeedback, prompt)
            .await?;

        record.last_pr_comment_time = newest;
        record.ci_wait_started = None;
        record.transition(Phase::Review)?;
        run.reporter
            .force_update(record, progress::ADDRESSED_FEEDBACK)
            .await?;
        run.states.register(&run.item, record);
        self.post_comment(&run.item, &notices::feedback_addressed(), &run.cancel)
            .await?;
        Ok(true)
    }

    /// `None` lets the merge check run; `Some` ends this pass.
    ///
    /// Changes to the CI wait start or fix counter are checkpointed here, since
    /// progress updates may be debounced or disabled.
    async fn check_ci(
        &self,
        run: &mut Run,
        record: &mut ProgressRecord,
        pr_number: u64,
    ) -> Result<Option<Step>, OrchestratorError> {
        let before = (record.ci_wait_started, record.ci_fix_attempts);
        let step = self.poll_ci(run, record, pr_number).await?;
        if record.phase() == Phase::Review
            && (record.ci_wait_started, record.ci_fix_attempts) != before
        {
            self.checkpoint(run, record).await?;
        }
        Ok(step)
    }

    async fn poll_ci(
        &self,
        run: &mut Run,
        record: &mut ProgressRecord,
        pr_number: u64,
    ) -> Result<Option<Step>, OrchestratorError> {
        let timeout = Duration::from_secs(self.config.ci.timeout_secs);
        let started = *record.ci_wait_started.get_or_insert_with(Utc::now);
        let waited = Utc::now()
            .signed_duration_since(started)
            .to_std()
            .unwrap_or_default();
        if waited > timeout {
            warn!(item = %run.item, pr = pr_number, "Gave up waiting for CI");
            run.reporter
                .update(record, &progress::ci_timed_out(timeout))
                .await?;
            return Ok(None);
        }

        let repo = run.item.repo.as_str();
        let pr = self
            .tracker_retry
            .run(&run.cancel, || self.tracker.get_pr(repo, pr_number))
            .await?;
        let status = match self
            .tracker_retry
            .run(&run.cancel, || self.tracker.ci_status(repo, &pr))
            .await
        {
            Ok(status) => status,
            Err(RetryError::Cancelled) => return Err(OrchestratorError::Cancelled),
            Err(e) => {
                warn!(item = %run.item, pr = pr_number, error = %e, "Failed to read CI status");
                return Ok(Some(Step::Wait));
            }
        };

        match status {
            CiStatus::Success => {
                debug!(item = %run.item, pr = pr_number, "CI passed");
                record.ci_fix_attempts = 0;
                record.ci_wait_started = None;
                run.reporter.update(record, progress::CI_PASSED).await?;
                Ok(None)
            }
            CiStatus::Pending => {
                run.reporter.update(record, progress::WAITING_CI).await?;
                Ok(Some(Step::Wait))
            }
            CiStatus::Unknown => {
                record.ci_wait_started = None;
                Ok(None)
            }
            CiStatus::Failure { summary } => {
                let max = self.config.ci.max_fix_attempts;
                if record.ci_fix_attempts >= max {
                    run.reporter
                        .update(
                            record,
                            &progress::ci_fix_exhausted(record.ci_fix_attempts, max),
                        )
                        .await?;
                    let message = format!("CI failures could not be fixed after {} attempts", max);
                    let notice = notices::error(&message);
                    self.fail_with(
                        &run.item,
                        record,
                        &mut run.reporter,
                        &message,
                        Some(FailureReason::CiFailed),
                        &notice,
                        &run.cancel,
                    )
                    .await?;
                    return Ok(Some(Step::Continue));
                }

                record.ci_fix_attempts += 1;
                info!(item = %run.item, pr = pr_number, attempt = record.ci_fix_attempts, max, "Fixing CI failure");
                run.reporter
                    .force_update(record, &progress::fixing_ci(record.ci_fix_attempts, max))
                    .await?;
                let branch = record.branch_name.clone().unwrap_or_default();
                match self
                    .agent(run, record, AgentTask::FixCi, prompts::fix_ci(&summary, &branch))
                    .await
                {
                    Ok(_) => {}
                    Err(e) if e.is_cancelled() => return Err(e),
                    Err(e) => warn!(item = %run.item, error = %e, "CI fix attempt failed"),
                }
                record.ci_wait_started = Some(Utc::now());
                Ok(Some(Step::Wait))
            }
        }
    }
}

/// The last `lines` lines of `text`.
fn tail(text: &str, lines: usize) -> String {
    let all: Vec<&str> = text.trim().lines().collect();
    all[all.len().saturating_sub(lines)..].join("\n")
}
