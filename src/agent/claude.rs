//! Running the `claude` CLI (or anything that speaks its stream-json format).

use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::stream::{StreamCollector, StreamOutcome};
use super::{Agent, AgentRequest, AgentResponse};
use crate::errors::AgentError;

/// Stderr kept for error messages.
const MAX_STDERR_CHARS: usize = 2000;

/// Agent backed by a CLI subprocess per invocation.
#[derive(Debug, Clone)]
pub struct ClaudeAgent {
    command: String,
    timeout: Duration,
}

impl ClaudeAgent {
    pub fn new(command: impl Into<String>, timeout: Duration) -> Self {
        Self {
            command: command.into(),
            timeout,
        }
    }

    /// Arguments for one invocation; the prompt goes on stdin.
    pub fn build_args(request: &AgentRequest) -> Vec<String> {
        let mut args: Vec<String> = ["--print", "--output-format", "stream-json", "--verbose"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        if let Some(session) = request.session_id.as_deref().filter(|s| !s.is_empty()) {
            args.push("--resume".into());
            args.push(session.to_string());
        }
        for tool in &request.allowed_tools {
            args.push("--allowedTools".into());
            args.push(tool.clone());
        }
        args
    }

    /// `command` may carry its own leading arguments (`"npx claude"`).
    fn command_parts(&self) -> (String, Vec<String>) {
        let mut parts = self.command.split_whitespace().map(str::to_string);
        let program = parts.next().unwrap_or_default();
        (program, parts.collect())
    }

    async fn execute(&self, request: &AgentRequest) -> Result<AgentResponse, AgentError> {
        let (program, mut args) = self.command_parts();
        args.extend(Self::build_args(request));

        debug!(
            task = %request.task,
            dir = %request.work_dir.display(),
            resume = request.session_id.is_some(),
            "Spawning agent"
        );

        let mut child = Command::new(&program)
            .args(&args)
            .current_dir(&request.work_dir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| AgentError::Spawn {
                command: self.command.clone(),
                source,
            })?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(request.prompt.as_bytes()).await?;
            stdin.shutdown().await?;
        }

        // Drained concurrently so a chatty stderr cannot block the child.
        let stderr_task = child.stderr.take().map(|mut stderr| {
            tokio::spawn(async move {
                let mut buf = String::new();
                let _ = stderr.read_to_string(&mut buf).await;
                buf
            })
        });

        let mut collector = StreamCollector::new();
        if let Some(stdout) = child.stdout.take() {
            let mut lines = BufReader::new(stdout).lines();
            while let Some(line) = lines.next_line().await? {
                collector.push_line(&line);
            }
        }

        let status = child.wait().await?;
        let stderr = match stderr_task {
            Some(handle) => handle.await.unwrap_or_default(),
            None => String::new(),
        };
        let outcome = collector.finish();

        if !status.success() || outcome.is_error {
            return Err(failure(status.code(), &outcome, &stderr));
        }

        Ok(AgentResponse {
            output: outcome.output,
            session_id: outcome.session_id,
        })
    }
}

fn failure(exit_code: Option<i32>, outcome: &StreamOutcome, stderr: &str) -> AgentError {
    let stderr = stderr.trim();
    let mut message = if outcome.is_error && !outcome.output.trim().is_empty() {
        outcome.output.trim().to_string()
    } else if !stderr.is_empty() {
        stderr.chars().take(MAX_STDERR_CHARS).collect()
    } else {
        match exit_code {
            Some(code) => format!("exited with status {}", code),
            None => "terminated by signal".to_string(),
        }
    };
    if outcome.is_error && !stderr.is_empty() && !message.contains(stderr) {
        let tail: String = stderr.chars().take(MAX_STDERR_CHARS).collect();
        message = format!("{}\n{}", message, tail);
    }
    AgentError::Failed { exit_code, message }
}

#[async_trait]
impl Agent for ClaudeAgent {
    async fn run(
        &self,
        request: &AgentRequest,
        cancel: &CancellationToken,
    ) -> Result<AgentResponse, AgentError> {
        let started = std::time::Instant::now();
        // Dropping the execute future drops the child, which kills it.
        let result = tokio::select! {
            _ = cancel.cancelled() => {
                warn!(task = %request.task, "Agent cancelled");
                return Err(AgentError::Cancelled);
            }
            result = tokio::time::timeout(self.timeout, self.execute(request)) => result,
        };

        match result {
            Ok(Ok(response)) => {
                info!(
                    task = %request.task,
                    elapsed_secs = started.elapsed().as_secs(),
                    "Agent finished"
                );
                Ok(response)
            }
            Ok(Err(e)) => Err(e),
            Err(_) => Err(AgentError::Timeout {
                after: self.timeout,
            }),
        }
    }
}
