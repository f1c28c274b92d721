//! Drives one item through the workflow phases.
//!
//! ## Architecture
//!
//! ```text
//!  Job ──▶ ensure_cloned ──▶ loop { handler for record.phase() } ──▶ JobResult
//!                                   │
//!                                   ├─ Continue ─▶ next handler
//!                                   ├─ Wait ─────▶ job ends; a later poll resumes it
//!                                   └─ Err ──────▶ fail_with(): phase:failed + error notice
//! ```
//!
//! Handlers own the record for the duration of their call. Every transition is
//! persisted through the item's [`Reporter`] and mirrored into the pool's
//! [`ActiveStates`] so a shutdown can save in-flight progress. Waiting for a
//! human is not a blocking operation: the handler returns [`Step::Wait`], the
//! job ends, and the daemon offers the item again on its next poll.

mod delivery;
mod planning;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::agent::prompts::TASK_DIR;
use crate::agent::{Agent, AgentRequest, AgentResponse, AgentTask};
use crate::auth;
use crate::config::Config;
use crate::errors::OrchestratorError;
use crate::pool::{ActiveStates, Job, JobResult, JobRunner, JobStatus};
use crate::progress::{self, Reporter};
use crate::retry::RetryPolicy;
use crate::state::{
    FailureReason, Phase, ProgressRecord, add_system_marker, append_to_body, is_system_text,
    labels_to_remove, latest, phase_from_labels,
};
use crate::tracker::{Comment, Issue, Tracker, WorkItem};
use crate::workflow::notices::{self, NEEDS_MANUAL_RESOLUTION_LABEL};
use crate::workflow::{extract_feedback, is_retry};
use crate::workspace::{Workspace, WorkspaceManager};

/// Follow-up question rounds after the first one are capped here.
pub const MAX_QA_ROUNDS: u32 = 3;

/// What a handler asks the phase loop to do next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Step {
    Continue,
    Wait,
}

/// Everything a handler needs besides the record.
struct Run {
    item: WorkItem,
    issue: Issue,
    workspace: Workspace,
    reporter: Reporter,
    cancel: CancellationToken,
    states: ActiveStates,
}

/// Runs the phase state machine for jobs handed out by the worker pool.
pub struct Orchestrator {
    config: Arc<Config>,
    tracker: Arc<dyn Tracker>,
    agent: Arc<dyn Agent>,
    workspaces: WorkspaceManager,
    tracker_retry: RetryPolicy,
    agent_retry: RetryPolicy,
}

impl Orchestrator {
    pub fn new(config: Arc<Config>, tracker: Arc<dyn Tracker>, agent: Arc<dyn Agent>) -> Self {
        let tracker_retry = config.retry_policy();
        // Agent calls wait out outages instead of failing the item.
        let agent_retry = tracker_retry.clone().unlimited();
        Self {
            workspaces: WorkspaceManager::new(config.workspace_root()),
            config,
            tracker,
            agent,
            tracker_retry,
            agent_retry,
        }
    }

    /// Replace both retry policies.
    pub fn with_retry(mut self, tracker: RetryPolicy, agent: RetryPolicy) -> Self {
        self.tracker_retry = tracker;
        self.agent_retry = agent;
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn tracker(&self) -> &Arc<dyn Tracker> {
        &self.tracker
    }

    pub fn workspaces(&self) -> &WorkspaceManager {
        &self.workspaces
    }

    pub fn tracker_retry(&self) -> &RetryPolicy {
        &self.tracker_retry
    }

    pub fn reporter(
        &self,
        item: &WorkItem,
        record: &ProgressRecord,
        cancel: &CancellationToken,
    ) -> Reporter {
        Reporter::new(
            self.tracker.clone(),
            item.clone(),
            &self.config.progress,
            self.tracker_retry.clone(),
            cancel.clone(),
            record,
        )
    }

    /// The newest record embedded in the issue or its comments, or a fresh one
    /// starting at the phase the labels name.
    pub async fn load_record(
        &self,
        item: &WorkItem,
        issue: &Issue,
        cancel: &CancellationToken,
    ) -> Result<ProgressRecord, OrchestratorError> {
        let comments = self.comments(item, cancel).await?;
        let texts = std::iter::once(issue.body.as_str()).chain(comments.iter().map(|c| c.body.as_str()));
        Ok(latest(texts).unwrap_or_else(|| ProgressRecord::starting_at(phase_from_labels(&issue.labels))))
    }

    /// Write `record` to the item's status comment.
    pub async fn persist_record(
        &self,
        item: &WorkItem,
        record: &mut ProgressRecord,
        cancel: &CancellationToken,
    ) -> Result<(), OrchestratorError> {
        self.reporter(item, record, cancel).persist(record).await
    }

    /// Swap the phase label: strip every other phase label, add this one.
    pub async fn set_phase_label(
        &self,
        item: &WorkItem,
        phase: Phase,
        cancel: &CancellationToken,
    ) -> Result<(), OrchestratorError> {
        for label in labels_to_remove(phase) {
            self.tracker_retry
                .run(cancel, || self.tracker.remove_label(&item.repo, item.number, &label))
                .await?;
        }
        if phase != Phase::New {
            let label = phase.label();
            self.tracker_retry
                .run(cancel, || self.tracker.add_label(&item.repo, item.number, &label))
                .await?;
        }
        Ok(())
    }

    /// Fail an item that is not running in the pool, posting `notice`.
    pub async fn fail_item(
        &self,
        item: &WorkItem,
        record: &mut ProgressRecord,
        message: &str,
        reason: Option<FailureReason>,
        notice: &str,
        cancel: &CancellationToken,
    ) -> Result<(), OrchestratorError> {
        let mut reporter = self.reporter(item, record, cancel);
        self.fail_with(item, record, &mut reporter, message, reason, notice, cancel)
            .await
    }

    #[allow(clippy::too_many_arguments)]
    async fn fail_with(
        &self,
        item: &WorkItem,
        record: &mut ProgressRecord,
        reporter: &mut Reporter,
        message: &str,
        reason: Option<FailureReason>,
        notice: &str,
        cancel: &CancellationToken,
    ) -> Result<(), OrchestratorError> {
        let from = record.phase();
        record.fail(message, reason)?;
        warn!(
            item = %item,
            phase = %from,
            reason = reason.map(|r| r.as_str()).unwrap_or("error"),
            error = message,
            "Item failed"
        );
        reporter.finalize(record, &progress::failed(message)).await?;
        self.post_comment(item, notice, cancel).await?;
        self.set_phase_label(item, Phase::Failed, cancel).await
    }

    /// Reset a failed item when an authorized `/retry` arrived after the last
    /// consumed reply. Returns whether the item was reset.
    pub async fn check_for_retry(
        &self,
        item: &WorkItem,
        record: &mut ProgressRecord,
        cancel: &CancellationToken,
    ) -> Result<bool, OrchestratorError> {
        if record.phase() != Phase::Failed {
            return Ok(false);
        }
        let since = record.last_comment_time;
        let comments = self.comments(item, cancel).await?;
        let mut request = None;
        for comment in comments
            .into_iter()
            .rev()
            .filter(|c| is_new_reply(c, since) && is_retry(&c.body))
        {
            if auth::is_authorized(self.tracker.as_ref(), &item.repo, &comment.author).await {
                request = Some(comment);
                break;
            }
        }
        let Some(request) = request else {
            return Ok(false);
        };

        let resumed = record.reset_for_retry()?;
        record.last_comment_time = Some(request.created_at);
        info!(item = %item, resumed = %resumed, by = %request.author, "Retry requested");

        let repo = item.repo.as_str();
        self.tracker_retry
            .run(cancel, || {
                self.tracker
                    .remove_label(repo, item.number, NEEDS_MANUAL_RESOLUTION_LABEL)
            })
            .await?;
        self.tracker_retry
            .run(cancel, || {
                self.tracker
                    .add_label(repo, item.number, &self.config.trigger_label)
            })
            .await?;
        self.set_phase_label(item, resumed, cancel).await?;
        self.react(item, request.id, cancel).await;
        self.post_comment(item, &notices::retrying(), cancel).await?;
        self.reporter(item, record, cancel)
            .force_update(record, progress::RETRYING)
            .await?;
        Ok(true)
    }

    /// Post a standalone copy of an in-flight record while shutting down.
    pub async fn save_snapshot(
        &self,
        item: &WorkItem,
        record: &ProgressRecord,
        cancel: &CancellationToken,
    ) -> Result<(), OrchestratorError> {
        let mut record = record.clone();
        let body = append_to_body(&add_system_marker("State saved during shutdown"), &mut record)?;
        self.post_comment(item, &body, cancel).await?;
        Ok(())
    }

    /// Comments on the item, oldest first.
    pub async fn comments(
        &self,
        item: &WorkItem,
        cancel: &CancellationToken,
    ) -> Result<Vec<Comment>, OrchestratorError> {
        Ok(self
            .tracker_retry
            .run(cancel, || self.tracker.get_comments(&item.repo, item.number))
            .await?)
    }

    async fn post_comment(
        &self,
        item: &WorkItem,
        body: &str,
        cancel: &CancellationToken,
    ) -> Result<u64, OrchestratorError> {
        Ok(self
            .tracker_retry
            .run(cancel, || self.tracker.create_comment(&item.repo, item.number, body))
            .await?)
    }

    /// Acknowledge a consumed reply. Best effort.
    async fn react(&self, item: &WorkItem, comment_id: u64, cancel: &CancellationToken) {
        if let Err(e) = self
            .tracker_retry
            .run(cancel, || self.tracker.react_to_comment(&item.repo, comment_id, "+1"))
            .await
        {
            debug!(item = %item, comment_id, error = %e, "Failed to react to comment");
        }
    }

    /// The newest authorized human reply after `since`.
    ///
    /// Unauthorized replies are skipped without being consumed.
    async fn find_reply(
        &self,
        run: &Run,
        since: Option<DateTime<Utc>>,
    ) -> Result<Option<Comment>, OrchestratorError> {
        let comments = self.comments(&run.item, &run.cancel).await?;
        for comment in comments.into_iter().rev().filter(|c| is_new_reply(c, since)) {
            if auth::is_authorized(self.tracker.as_ref(), &run.item.repo, &comment.author).await {
                return Ok(Some(comment));
            }
        }
        Ok(None)
    }

    /// Start the reply watermark at the newest existing comment, so discussion
    /// from before the bot got involved is never read as an answer.
    async fn start_watermark(
        &self,
        run: &Run,
        record: &mut ProgressRecord,
    ) -> Result<(), OrchestratorError> {
        if record.last_comment_time.is_some() {
            return Ok(());
        }
        let comments = self.comments(&run.item, &run.cancel).await?;
        record.last_comment_time = comments.iter().map(|c| c.created_at).max();
        Ok(())
    }

    /// Invoke the agent in the item's workspace, resuming its session.
    async fn agent(
        &self,
        run: &Run,
        record: &mut ProgressRecord,
        task: AgentTask,
        prompt: String,
    ) -> Result<AgentResponse, OrchestratorError> {
        let request =
            AgentRequest::new(task, prompt, &run.workspace.repo_dir).resume(&record.session_id);
        debug!(item = %run.item, task = %task, "Invoking agent");
        let response = self
            .agent_retry
            .run(&run.cancel, || self.agent.run(&request, &run.cancel))
            .await?;
        if let Some(session) = response.session_id.as_deref()
            && !session.is_empty()
        {
            record.session_id = session.to_string();
        }
        Ok(response)
    }

    /// Contents of an agent-written task file that must exist.
    async fn require_task_file(&self, run: &Run, name: &str) -> Result<String, OrchestratorError> {
        run.workspace
            .read_task_file(name)
            .await?
            .filter(|content| !content.is_empty())
            .ok_or_else(|| OrchestratorError::MissingOutput(format!("{}/{}", TASK_DIR, name)))
    }

    /// Mirror the record's phase into the labels, log `status`, and persist.
    async fn settle(
        &self,
        run: &mut Run,
        record: &mut ProgressRecord,
        status: &str,
    ) -> Result<(), OrchestratorError> {
        self.set_phase_label(&run.item, record.phase(), &run.cancel)
            .await?;
        run.reporter.force_update(record, status).await?;
        run.states.register(&run.item, record);
        Ok(())
    }

    async fn enter(
        &self,
        run: &mut Run,
        record: &mut ProgressRecord,
        next: Phase,
        status: &str,
    ) -> Result<(), OrchestratorError> {
        let from = record.phase();
        record.transition(next)?;
        info!(item = %run.item, from = %from, to = %next, "Phase transition");
        self.settle(run, record, status).await
    }

    async fn checkpoint(
        &self,
        run: &mut Run,
        record: &mut ProgressRecord,
    ) -> Result<(), OrchestratorError> {
        run.reporter.persist(record).await?;
        run.states.register(&run.item, record);
        Ok(())
    }

    /// Handler loop. Returns how the job ended and the error that ended it, if any.
    async fn drive(
        &self,
        run: &mut Run,
        record: &mut ProgressRecord,
    ) -> (JobStatus, Option<String>) {
        loop {
            if run.cancel.is_cancelled() {
                return (JobStatus::Cancelled, None);
            }
            let phase = record.phase();
            debug!(item = %run.item, phase = %phase, "Running phase handler");
            let step = match phase {
                Phase::New => self.handle_new(run, record).await,
                Phase::Questions => self.handle_questions(run, record).await,
                Phase::Planning => self.handle_planning(run, record).await,
                Phase::Approval => self.handle_approval(run, record).await,
                Phase::Implementing => self.handle_implementing(run, record).await,
                Phase::Review => self.handle_review(run, record).await,
                Phase::Completed => return (JobStatus::Completed, None),
                Phase::Failed => return (JobStatus::Failed, record.error.clone()),
            };

            match step {
                Ok(Step::Continue) => {}
                Ok(Step::Wait) => {
                    debug!(item = %run.item, phase = %record.phase(), "Waiting for external input");
                    return (JobStatus::Waiting, None);
                }
                Err(e) if e.is_cancelled() => {
                    info!(item = %run.item, phase = %phase, "Job interrupted by shutdown");
                    return (JobStatus::Cancelled, None);
                }
                Err(e) => {
                    let message = e.to_string();
                    error!(item = %run.item, phase = %phase, error = %message, "Phase handler failed");
                    let reason = match e {
                        OrchestratorError::UserAborted => Some(FailureReason::UserAborted),
                        _ => None,
                    };
                    let notice = notices::error(&message);
                    if let Err(report) = self
                        .fail_with(
                            &run.item,
                            record,
                            &mut run.reporter,
                            &message,
                            reason,
                            &notice,
                            &run.cancel,
                        )
                        .await
                    {
                        if report.is_cancelled() {
                            return (JobStatus::Cancelled, None);
                        }
                        warn!(item = %run.item, error = %report, "Failed to report failure");
                    }
                    return (JobStatus::Failed, Some(message));
                }
            }
        }
    }
}

/// A human comment newer than the watermark.
fn is_new_reply(comment: &Comment, since: Option<DateTime<Utc>>) -> bool {
    !is_system_text(&comment.body) && since.is_none_or(|t| comment.created_at > t)
}

/// Reply text as handed to the agent.
fn reply_text(comment: &Comment) -> String {
    extract_feedback(&comment.body)
}

#[async_trait]
impl JobRunner for Orchestrator {
    async fn run(&self, job: Job, cancel: CancellationToken, states: ActiveStates) -> JobResult {
        let Job {
            item,
            issue,
            mut record,
        } = job;

        match record.phase() {
            Phase::Completed => return JobResult::new(item, record, JobStatus::Completed),
            Phase::Failed => {
                let error = record.error.clone().unwrap_or_default();
                return JobResult::new(item, record, JobStatus::Failed).with_error(error);
            }
            _ => {}
        }

        info!(item = %item, phase = %record.phase(), "Starting job");
        let workspace = match self
            .workspaces
            .ensure_cloned(self.tracker.as_ref(), &item, &self.tracker_retry, &cancel)
            .await
        {
            Ok(workspace) => workspace,
            Err(e) if e.is_cancelled() => {
                return JobResult::new(item, record, JobStatus::Cancelled);
            }
            Err(e) => {
                warn!(item = %item, error = %e, "Could not prepare workspace");
                return JobResult::new(item, record, JobStatus::Errored).with_error(e.to_string());
            }
        };

        let reporter = self.reporter(&item, &record, &cancel);
        let mut run = Run {
            item,
            issue,
            workspace,
            reporter,
            cancel,
            states,
        };
        let (status, error) = self.drive(&mut run, &mut record).await;
        info!(item = %run.item, phase = %record.phase(), status = ?status, "Job finished");

        let result = JobResult::new(run.item, record, status);
        match error {
            Some(error) => result.with_error(error),
            None => result,
        }
    }
}
