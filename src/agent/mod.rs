//! Coding agent boundary.
//!
//! ## Architecture
//!
//! ```text
//! orchestrator ──AgentRequest──▶ dyn Agent ──▶ ClaudeAgent (subprocess, stream-json)
//!       ▲                                            │
//!       └──────────── AgentResponse{output, session_id} ◀┘
//! ```
//!
//! The agent edits files in the item's workspace. Structured results come back
//! two ways: marker lines in the final output (`IMPLEMENTATION_COMPLETE`,
//! `SIGNIFICANT_CHANGES`, ...) and files under `.taskwright/` that the prompts
//! ask it to write. Both are defined in [`prompts`].

pub mod claude;
pub mod prompts;
pub mod stream;

use std::fmt;
use std::path::PathBuf;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

pub use claude::ClaudeAgent;

use crate::errors::AgentError;

/// What an invocation is for. Decides the tool allowlist.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AgentTask {
    Analyze,
    ReviewPlan,
    RevisePlan,
    Implement,
    ReviewCode,
    AddressFeedback,
    FixCi,
    Summarize,
}

impl AgentTask {
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentTask::Analyze => "analyze",
            AgentTask::ReviewPlan => "review_plan",
            AgentTask::RevisePlan => "revise_plan",
            AgentTask::Implement => "implement",
            AgentTask::ReviewCode => "review_code",
            AgentTask::AddressFeedback => "address_feedback",
            AgentTask::FixCi => "fix_ci",
            AgentTask::Summarize => "summarize",
        }
    }

    /// Tools the agent may use for this task.
    pub fn allowed_tools(&self) -> &'static [&'static str] {
        match self {
            AgentTask::Analyze => &["Read", "Write", "Glob", "Grep"],
            AgentTask::ReviewPlan | AgentTask::RevisePlan => &["Read", "Write", "Edit"],
            AgentTask::Summarize => &["Read", "Glob", "Grep", "Bash"],
            AgentTask::Implement
            | AgentTask::ReviewCode
            | AgentTask::AddressFeedback
            | AgentTask::FixCi => &["Read", "Write", "Edit", "Bash", "Glob", "Grep"],
        }
    }
}

impl fmt::Display for AgentTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One agent invocation.
#[derive(Debug, Clone)]
pub struct AgentRequest {
    pub task: AgentTask,
    pub prompt: String,
    pub work_dir: PathBuf,
    /// Resume this conversation instead of starting a new one.
    pub session_id: Option<String>,
    pub allowed_tools: Vec<String>,
}

impl AgentRequest {
    /// A request with the task's default tool allowlist.
    pub fn new(task: AgentTask, prompt: impl Into<String>, work_dir: impl Into<PathBuf>) -> Self {
        Self {
            task,
            prompt: prompt.into(),
            work_dir: work_dir.into(),
            session_id: None,
            allowed_tools: task.allowed_tools().iter().map(|t| t.to_string()).collect(),
        }
    }

    /// Resume `session_id` when it is non-empty.
    pub fn resume(mut self, session_id: &str) -> Self {
        if !session_id.is_empty() {
            self.session_id = Some(session_id.to_string());
        }
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AgentResponse {
    pub output: String,
    /// Conversation id reported by the agent, if any.
    pub session_id: Option<String>,
}

/// Runs a coding agent to completion.
#[async_trait]
pub trait Agent: Send + Sync {
    /// Run one invocation. Cancelling `cancel` stops the agent and yields
    /// [`AgentError::Cancelled`].
    async fn run(
        &self,
        request: &AgentRequest,
        cancel: &CancellationToken,
    ) -> Result<AgentResponse, AgentError>;
}
