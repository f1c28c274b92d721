//! Shared fixtures: an in-memory tracker plus an agent that writes the files
//! each prompt asks for.

#![allow(dead_code)]

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

use taskwright::agent::prompts::{NO_QUESTIONS_MARKER, PLAN_FILE, QUESTIONS_FILE, TASK_DIR};
use taskwright::agent::{Agent, AgentRequest, AgentResponse, AgentTask};
use taskwright::config::Config;
use taskwright::daemon::Daemon;
use taskwright::errors::AgentError;
use taskwright::orchestrator::Orchestrator;
use taskwright::retry::RetryPolicy;
use taskwright::tracker::{InMemoryTracker, Issue};

pub const REPO: &str = "acme/shop";

/// Never asks questions and always reports a clean push to `feat/issue`.
#[derive(Default)]
pub struct StubAgent {
    pub calls: Mutex<Vec<AgentTask>>,
}

impl StubAgent {
    pub fn count(&self, task: AgentTask) -> usize {
        self.calls.lock().unwrap().iter().filter(|t| **t == task).count()
    }
}

#[async_trait]
impl Agent for StubAgent {
    async fn run(
        &self,
        request: &AgentRequest,
        _cancel: &CancellationToken,
    ) -> Result<AgentResponse, AgentError> {
        self.calls.lock().unwrap().push(request.task);
        let dir = request.work_dir.join(TASK_DIR);
        std::fs::create_dir_all(&dir)?;
        let output = match request.task {
            AgentTask::Analyze => {
                std::fs::write(dir.join(QUESTIONS_FILE), NO_QUESTIONS_MARKER)?;
                std::fs::write(dir.join(PLAN_FILE), "1. Do the thing")?;
                "done".to_string()
            }
            AgentTask::Implement => "IMPLEMENTATION_COMPLETE feat/issue".to_string(),
            AgentTask::Summarize => "## Summary\n\nDoes the thing.".to_string(),
            _ => "ok".to_string(),
        };
        Ok(AgentResponse {
            output,
            session_id: Some("stub-session".to_string()),
        })
    }
}

pub fn issue(number: u64, body: &str) -> Issue {
    Issue {
        number,
        title: format!("Issue {}", number),
        body: body.to_string(),
        labels: vec!["ai-implement".to_string()],
        state: "open".to_string(),
        ..Issue::default()
    }
}

pub struct World {
    _root: TempDir,
    pub tracker: Arc<InMemoryTracker>,
    pub agent: Arc<StubAgent>,
    pub orchestrator: Arc<Orchestrator>,
}

impl World {
    pub fn new(issues: Vec<Issue>) -> Self {
        let root = TempDir::new().unwrap();
        let mut config = Config::default();
        config.workspace_dir = Some(root.path().to_path_buf());
        config.agent.review_cycles = 1;
        config.progress.debounce_secs = 0;
        config.concurrency.max_per_repo = 3;

        let tracker = Arc::new(InMemoryTracker::new());
        for issue in issues {
            tracker.add_issue(REPO, issue);
        }
        let agent = Arc::new(StubAgent::default());
        let retry = RetryPolicy::new(2, Duration::from_millis(1), Duration::from_millis(1));
        let orchestrator = Orchestrator::new(Arc::new(config), tracker.clone(), agent.clone())
            .with_retry(retry.clone(), retry);
        Self {
            _root: root,
            tracker,
            agent,
            orchestrator: Arc::new(orchestrator),
        }
    }

    pub fn daemon(&self) -> Daemon {
        Daemon::new(self.orchestrator.clone(), vec![REPO.to_string()])
    }

    pub fn comments_containing(&self, number: u64, needle: &str) -> usize {
        self.tracker
            .comments(REPO, number)
            .iter()
            .filter(|c| c.body.contains(needle))
            .count()
    }
}

/// Drain results until no job is in flight.
pub async fn settle(daemon: &Daemon) {
    for _ in 0..500 {
        daemon.drain_results();
        if daemon.active_jobs() == 0 {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("jobs did not finish");
}
