//! Issue tracker boundary.
//!
//! ## Architecture
//!
//! ```text
//!                       ┌─────────────────┐
//!  orchestrator ───────▶│  dyn Tracker    │◀─────── daemon
//!                       └───────┬─────────┘
//!          ┌────────────────────┼──────────────────────┐
//!   GitHubTracker (REST)  GiteaTracker (REST)   InMemoryTracker (tests, dry runs)
//!          └──────── RestClient ┘
//! ```
//!
//! Backends return [`TrackerError`], which carries the HTTP status when there
//! is one so the retry engine can classify it without string matching. Backends
//! never retry on their own; callers wrap calls in a
//! [`crate::retry::RetryPolicy`].

pub mod gitea;
pub mod github;
pub mod memory;
mod rest;
pub mod types;
mod wire;

use std::path::Path;
use std::sync::Arc;

use anyhow::{Result, bail};
use async_trait::async_trait;

pub use gitea::GiteaTracker;
pub use github::GitHubTracker;
pub use memory::InMemoryTracker;
pub use types::{CiStatus, Comment, Issue, NewPullRequest, PullRequest, WorkItem};

use crate::config::{Config, ProviderKind};
use crate::errors::TrackerError;

/// Operations the orchestration engine needs from an issue tracker.
#[async_trait]
pub trait Tracker: Send + Sync {
    /// Short backend name for logs.
    fn name(&self) -> &str;

    async fn get_issue(&self, repo: &str, number: u64) -> Result<Issue, TrackerError>;

    /// Open issues carrying `label` (pull requests excluded).
    async fn list_issues_with_label(
        &self,
        repo: &str,
        label: &str,
    ) -> Result<Vec<Issue>, TrackerError>;

    /// Comments on an issue, oldest first.
    async fn get_comments(&self, repo: &str, number: u64) -> Result<Vec<Comment>, TrackerError>;

    /// Post a comment and return its id.
    async fn create_comment(&self, repo: &str, number: u64, body: &str)
    -> Result<u64, TrackerError>;

    async fn update_comment(
        &self,
        repo: &str,
        comment_id: u64,
        body: &str,
    ) -> Result<(), TrackerError>;

    async fn update_issue_body(
        &self,
        repo: &str,
        number: u64,
        body: &str,
    ) -> Result<(), TrackerError>;

    /// React to a comment (`+1`, `eyes`, ...).
    async fn react_to_comment(
        &self,
        repo: &str,
        comment_id: u64,
        reaction: &str,
    ) -> Result<(), TrackerError>;

    async fn add_label(&self, repo: &str, number: u64, label: &str) -> Result<(), TrackerError>;

    /// Removing a label the issue does not carry succeeds.
    async fn remove_label(&self, repo: &str, number: u64, label: &str)
    -> Result<(), TrackerError>;

    async fn create_pr(&self, repo: &str, pr: &NewPullRequest)
    -> Result<PullRequest, TrackerError>;

    async fn get_pr(&self, repo: &str, number: u64) -> Result<PullRequest, TrackerError>;

    /// Conversation comments on a pull request.
    async fn get_pr_comments(&self, repo: &str, number: u64)
    -> Result<Vec<Comment>, TrackerError>;

    /// Inline review comments on a pull request.
    async fn get_pr_review_comments(
        &self,
        repo: &str,
        number: u64,
    ) -> Result<Vec<Comment>, TrackerError>;

    async fn merge_pr(&self, repo: &str, number: u64) -> Result<(), TrackerError>;

    async fn is_mergeable(&self, repo: &str, number: u64) -> Result<bool, TrackerError> {
        Ok(self.get_pr(repo, number).await?.mergeable == Some(true))
    }

    async fn clone_repo(&self, repo: &str, dest: &Path) -> Result<(), TrackerError>;

    async fn get_default_branch(&self, repo: &str) -> Result<String, TrackerError>;

    /// Whether `user` may steer work in `repo`.
    async fn is_collaborator(&self, repo: &str, user: &str) -> Result<bool, TrackerError>;

    /// Combined CI state of a pull request head.
    async fn ci_status(&self, _repo: &str, _pr: &PullRequest) -> Result<CiStatus, TrackerError> {
        Ok(CiStatus::Unknown)
    }
}

/// Build the tracker backend selected in `config`.
pub fn from_config(config: &Config) -> Result<Arc<dyn Tracker>> {
    match config.provider {
        ProviderKind::GitHub => {
            let tracker = GitHubTracker::new(&config.github.api_url, &config.github.token)?;
            Ok(Arc::new(tracker))
        }
        ProviderKind::Gitea => {
            if config.gitea.url.is_empty() {
                bail!("gitea.url must be set when provider = \"gitea\"");
            }
            let tracker = GiteaTracker::new(&config.gitea.url, &config.gitea.token)?;
            Ok(Arc::new(tracker))
        }
    }
}

/// Run `git clone` into `dest`, scrubbing `secret` from any error output.
pub(crate) async fn git_clone(url: &str, dest: &Path, secret: &str) -> Result<(), TrackerError> {
    let output = tokio::process::Command::new("git")
        .arg("clone")
        .arg(url)
        .arg(dest)
        .kill_on_drop(true)
        .output()
        .await
        .map_err(|source| TrackerError::Spawn {
            command: "git clone".into(),
            source,
        })?;

    if !output.status.success() {
        let mut stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        if !secret.is_empty() {
            stderr = stderr.replace(secret, "[REDACTED]");
        }
        return Err(TrackerError::Command {
            command: "git clone".into(),
            stderr,
        });
    }
    Ok(())
}

/// Embed a token in an https clone URL.
pub(crate) fn authenticated_clone_url(clone_url: &str, user: &str, token: &str) -> String {
    if token.is_empty() {
        return clone_url.to_string();
    }
    match clone_url.strip_prefix("https://") {
        Some(rest) => format!("https://{}:{}@{}", user, token, rest),
        None => clone_url.to_string(),
    }
}
