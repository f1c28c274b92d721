//! Phases before a plan is approved: analysis, questions, planning, approval.

use tracing::{debug, info};

use super::{MAX_QA_ROUNDS, Orchestrator, Run, Step, reply_text};
use crate::agent::AgentTask;
use crate::agent::prompts::{self, FEEDBACK_FILE, PLAN_FILE, QUESTIONS_FILE};
use crate::errors::OrchestratorError;
use crate::progress;
use crate::state::{Phase, ProgressRecord, append_to_body};
use crate::workflow::{is_abort, is_approval, needs_rereview, questions_pending};

impl Orchestrator {
    pub(super) async fn handle_new(
        &self,
        run: &mut Run,
        record: &mut ProgressRecord,
    ) -> Result<Step, OrchestratorError> {
        info!(item = %run.item, "Analyzing issue");
        self.start_watermark(run, record).await?;
        run.reporter.force_update(record, progress::ANALYZING).await?;
        run.workspace.ensure_task_dir().await?;

        let prompt = prompts::analyze_issue(&run.issue.title, &run.issue.body);
        self.agent(run, record, AgentTask::Analyze, prompt).await?;

        let questions = run
            .workspace
            .read_task_file(QUESTIONS_FILE)
            .await?
            .unwrap_or_default();
        if questions_pending(&questions) {
            record.qa_round = 1;
            self.ask(run, record, &questions).await?;
            return Ok(Step::Wait);
        }

        self.enter(run, record, Phase::Planning, progress::PLANNING)
            .await?;
        Ok(Step::Continue)
    }

    pub(super) async fn handle_questions(
        &self,
        run: &mut Run,
        record: &mut ProgressRecord,
    ) -> Result<Step, OrchestratorError> {
        let Some(reply) = self.find_reply(run, record.last_comment_time).await? else {
            debug!(item = %run.item, round = record.qa_round, "No answer yet");
            return Ok(Step::Wait);
        };
        self.react(&run.item, reply.id, &run.cancel).await;
        record.last_comment_time = Some(reply.created_at);

        if is_abort(&reply.body) {
            return Err(OrchestratorError::UserAborted);
        }

        info!(item = %run.item, round = record.qa_round, by = %reply.author, "Received answers");
        let asked = run
            .workspace
            .read_task_file(QUESTIONS_FILE)
            .await?
            .unwrap_or_default();
        record.record_answer(asked.clone(), reply_text(&reply));
        run.reporter.force_update(record, progress::PLANNING).await?;

        let prompt = prompts::incorporate_answers(&record.qa_history);
        self.agent(run, record, AgentTask::Analyze, prompt).await?;

        let follow_up = run
            .workspace
            .read_task_file(QUESTIONS_FILE)
            .await?
            .unwrap_or_default();
        if questions_pending(&follow_up) && follow_up != asked {
            if record.qa_round < MAX_QA_ROUNDS {
                record.qa_round += 1;
                self.ask(run, record, &follow_up).await?;
                return Ok(Step::Wait);
            }
            info!(item = %run.item, rounds = record.qa_round, "Question rounds exhausted, planning with what we have");
        }

        self.enter(run, record, Phase::Planning, progress::PLANNING)
            .await?;
        Ok(Step::Continue)
    }

    pub(super) async fn handle_planning(
        &self,
        run: &mut Run,
        record: &mut ProgressRecord,
    ) -> Result<Step, OrchestratorError> {
        let cycles = self.config.agent.review_cycles;
        info!(item = %run.item, cycles, "Reviewing plan");
        self.review_plan(run, record).await?;

        let plan = self.require_task_file(run, PLAN_FILE).await?;
        self.start_watermark(run, record).await?;
        record.transition(Phase::Approval)?;
        record.plan_version = record.plan_version.max(1);
        self.post_plan(run, record, &plan, cycles).await?;
        self.settle(run, record, progress::WAITING_APPROVAL).await?;
        Ok(Step::Continue)
    }

    pub(super) async fn handle_approval(
        &self,
        run: &mut Run,
        record: &mut ProgressRecord,
    ) -> Result<Step, OrchestratorError> {
        let Some(reply) = self.find_reply(run, record.last_comment_time).await? else {
            debug!(item = %run.item, version = record.plan_version, "Plan awaiting approval");
            return Ok(Step::Wait);
        };
        self.react(&run.item, reply.id, &run.cancel).await;
        record.last_comment_time = Some(reply.created_at);

        if is_abort(&reply.body) {
            return Err(OrchestratorError::UserAborted);
        }
        if is_approval(&reply.body) {
            info!(item = %run.item, by = %reply.author, version = record.plan_version, "Plan approved");
            self.enter(run, record, Phase::Implementing, progress::IMPLEMENTING)
                .await?;
            return Ok(Step::Continue);
        }

        info!(item = %run.item, by = %reply.author, "Revising plan from feedback");
        run.reporter.force_update(record, progress::PLANNING).await?;
        run.workspace
            .write_task_file(FEEDBACK_FILE, &reply_text(&reply))
            .await?;
        let response = self
            .agent(run, record, AgentTask::RevisePlan, prompts::revise_plan())
            .await?;

        let mut reviews = 0;
        if needs_rereview(&response.output) {
            info!(item = %run.item, "Significant plan changes, reviewing again");
            self.review_plan(run, record).await?;
            reviews = self.config.agent.review_cycles;
        }

        let plan = self.require_task_file(run, PLAN_FILE).await?;
        record.transition(Phase::Approval)?;
        record.plan_version += 1;
        self.post_plan(run, record, &plan, reviews).await?;
        self.settle(run, record, progress::WAITING_APPROVAL).await?;
        Ok(Step::Wait)
    }

    /// Move to `questions` and post them with the record attached.
    async fn ask(
        &self,
        run: &mut Run,
        record: &mut ProgressRecord,
        questions: &str,
    ) -> Result<(), OrchestratorError> {
        self.start_watermark(run, record).await?;
        record.transition(Phase::Questions)?;
        info!(item = %run.item, round = record.qa_round, "Posting questions");
        let body = append_to_body(&prompts::questions_comment(questions, record.qa_round), record)?;
        self.post_comment(&run.item, &body, &run.cancel).await?;
        self.settle(run, record, progress::WAITING_ANSWERS).await
    }

    async fn review_plan(
        &self,
        run: &mut Run,
        record: &mut ProgressRecord,
    ) -> Result<(), OrchestratorError> {
        let cycles = self.config.agent.review_cycles;
        for i in 1..=cycles {
            run.reporter
                .force_update(record, &progress::plan_review(i, cycles))
                .await?;
            self.agent(run, record, AgentTask::ReviewPlan, prompts::review_plan(i, cycles))
                .await?;
        }
        Ok(())
    }

    async fn post_plan(
        &self,
        run: &Run,
        record: &mut ProgressRecord,
        plan: &str,
        reviews: u32,
    ) -> Result<(), OrchestratorError> {
        let body = append_to_body(&prompts::plan_comment(plan, reviews), record)?;
        self.post_comment(&run.item, &body, &run.cancel).await?;
        Ok(())
    }
}
