//! GitHub backend over the REST v3 API.

use std::path::Path;

use async_trait::async_trait;
use reqwest::{Method, StatusCode};
use serde::Deserialize;
use serde_json::json;
use tracing::debug;

use super::rest::RestClient;
use super::types::{CiStatus, Comment, Issue, NewPullRequest, PullRequest};
use super::wire::{ApiComment, ApiCreated, ApiIssue, ApiPull, ApiRepo, encode_segment};
use super::{Tracker, authenticated_clone_url, git_clone};
use crate::errors::TrackerError;

pub const DEFAULT_API_URL: &str = "https://api.github.com";
const PAGE_SIZE: usize = 100;

pub struct GitHubTracker {
    client: RestClient,
    token: String,
}

impl GitHubTracker {
    pub fn new(api_url: &str, token: &str) -> Result<Self, TrackerError> {
        let api_url = if api_url.is_empty() {
            DEFAULT_API_URL
        } else {
            api_url
        };
        let authorization = (!token.is_empty()).then(|| format!("Bearer {}", token));
        Ok(Self {
            client: RestClient::new(api_url, authorization)?,
            token: token.to_string(),
        })
    }
}

#[derive(Debug, Deserialize)]
struct Permission {
    #[serde(default)]
    permission: String,
}

#[derive(Debug, Deserialize)]
struct CheckRuns {
    #[serde(default)]
    check_runs: Vec<CheckRun>,
}

#[derive(Debug, Deserialize)]
struct CheckRun {
    #[serde(default)]
    name: String,
    #[serde(default)]
    status: String,
    #[serde(default)]
    conclusion: Option<String>,
    #[serde(default)]
    output: Option<CheckOutput>,
}

#[derive(Debug, Deserialize)]
struct CheckOutput {
    #[serde(default)]
    summary: Option<String>,
}

/// Fold individual check runs into one status.
fn combine_check_runs(runs: &[CheckRun]) -> CiStatus {
    if runs.is_empty() {
        return CiStatus::Unknown;
    }
    if runs.iter().any(|r| r.status != "completed") {
        return CiStatus::Pending;
    }
    let failures: Vec<String> = runs
        .iter()
        .filter(|r| {
            !matches!(
                r.conclusion.as_deref(),
                Some("success" | "neutral" | "skipped")
            )
        })
        .map(|r| {
            let summary = r
                .output
                .as_ref()
                .and_then(|o| o.summary.clone())
                .unwrap_or_default();
            format!(
                "{} ({}): {}",
                r.name,
                r.conclusion.as_deref().unwrap_or("unknown"),
                summary
            )
        })
        .collect();
    if failures.is_empty() {
        CiStatus::Success
    } else {
        CiStatus::Failure {
            summary: failures.join("\n"),
        }
    }
}

#[async_trait]
impl Tracker for GitHubTracker {
    fn name(&self) -> &str {
        "github"
    }

    async fn get_issue(&self, repo: &str, number: u64) -> Result<Issue, TrackerError> {
        let api: ApiIssue = self
            .client
            .get(&format!("repos/{}/issues/{}", repo, number))
            .await?;
        Ok(api.into())
    }

    async fn list_issues_with_label(
        &self,
        repo: &str,
        label: &str,
    ) -> Result<Vec<Issue>, TrackerError> {
        let issues: Vec<ApiIssue> = self
            .client
            .get_all(
                &format!("repos/{}/issues", repo),
                &[("state", "open"), ("labels", label)],
                "per_page",
                PAGE_SIZE,
            )
            .await?;
        Ok(issues
            .into_iter()
            .filter(|i| !i.is_pull_request())
            .map(Issue::from)
            .collect())
    }

    async fn get_comments(&self, repo: &str, number: u64) -> Result<Vec<Comment>, TrackerError> {
        let comments: Vec<ApiComment> = self
            .client
            .get_all(
                &format!("repos/{}/issues/{}/comments", repo, number),
                &[],
                "per_page",
                PAGE_SIZE,
            )
            .await?;
        Ok(comments.into_iter().map(Comment::from).collect())
    }

    async fn create_comment(
        &self,
        repo: &str,
        number: u64,
        body: &str,
    ) -> Result<u64, TrackerError> {
        let created: ApiCreated = self
            .client
            .send_json(
                Method::POST,
                &format!("repos/{}/issues/{}/comments", repo, number),
                &json!({ "body": body }),
            )
            .await?;
        Ok(created.id)
    }

    async fn update_comment(
        &self,
        repo: &str,
        comment_id: u64,
        body: &str,
    ) -> Result<(), TrackerError> {
        self.client
            .send_json_unit(
                Method::PATCH,
                &format!("repos/{}/issues/comments/{}", repo, comment_id),
                &json!({ "body": body }),
            )
            .await
    }

    async fn update_issue_body(
        &self,
        repo: &str,
        number: u64,
        body: &str,
    ) -> Result<(), TrackerError> {
        self.client
            .send_json_unit(
                Method::PATCH,
                &format!("repos/{}/issues/{}", repo, number),
                &json!({ "body": body }),
            )
            .await
    }

    async fn react_to_comment(
        &self,
        repo: &str,
        comment_id: u64,
        reaction: &str,
    ) -> Result<(), TrackerError> {
        self.client
            .send_json_unit(
                Method::POST,
                &format!("repos/{}/issues/comments/{}/reactions", repo, comment_id),
                &json!({ "content": reaction }),
            )
            .await
    }

    async fn add_label(&self, repo: &str, number: u64, label: &str) -> Result<(), TrackerError> {
        self.client
            .send_json_unit(
                Method::POST,
                &format!("repos/{}/issues/{}/labels", repo, number),
                &json!({ "labels": [label] }),
            )
            .await
    }

    async fn remove_label(
        &self,
        repo: &str,
        number: u64,
        label: &str,
    ) -> Result<(), TrackerError> {
        let path = format!(
            "repos/{}/issues/{}/labels/{}",
            repo,
            number,
            encode_segment(label)
        );
        match self.client.delete(&path).await {
            Err(e) if e.http_status() == Some(404) => {
                debug!(repo, number, label, "Label not present, nothing to remove");
                Ok(())
            }
            other => other,
        }
    }

    async fn create_pr(
        &self,
        repo: &str,
        pr: &NewPullRequest,
    ) -> Result<PullRequest, TrackerError> {
        let api: ApiPull = self
            .client
            .send_json(
                Method::POST,
                &format!("repos/{}/pulls", repo),
                &json!({
                    "title": pr.title,
                    "body": pr.body,
                    "head": pr.head,
                    "base": pr.base,
                }),
            )
            .await?;
        Ok(api.into())
    }

    async fn get_pr(&self, repo: &str, number: u64) -> Result<PullRequest, TrackerError> {
        let api: ApiPull = self
            .client
            .get(&format!("repos/{}/pulls/{}", repo, number))
            .await?;
        Ok(api.into())
    }

    async fn get_pr_comments(
        &self,
        repo: &str,
        number: u64,
    ) -> Result<Vec<Comment>, TrackerError> {
        self.get_comments(repo, number).await
    }

    async fn get_pr_review_comments(
        &self,
        repo: &str,
        number: u64,
    ) -> Result<Vec<Comment>, TrackerError> {
        let comments: Vec<ApiComment> = self
            .client
            .get_all(
                &format!("repos/{}/pulls/{}/comments", repo, number),
                &[],
                "per_page",
                PAGE_SIZE,
            )
            .await?;
        Ok(comments.into_iter().map(Comment::from).collect())
    }

    async fn merge_pr(&self, repo: &str, number: u64) -> Result<(), TrackerError> {
        self.client
            .send_json_unit(
                Method::PUT,
                &format!("repos/{}/pulls/{}/merge", repo, number),
                &json!({ "merge_method": "squash" }),
            )
            .await
    }

    async fn clone_repo(&self, repo: &str, dest: &Path) -> Result<(), TrackerError> {
        let info: ApiRepo = self.client.get(&format!("repos/{}", repo)).await?;
        let url = authenticated_clone_url(&info.clone_url, "x-access-token", &self.token);
        git_clone(&url, dest, &self.token).await
    }

    async fn get_default_branch(&self, repo: &str) -> Result<String, TrackerError> {
        let info: ApiRepo = self.client.get(&format!("repos/{}", repo)).await?;
        if info.default_branch.is_empty() {
            return Ok("main".to_string());
        }
        Ok(info.default_branch)
    }

    async fn is_collaborator(&self, repo: &str, user: &str) -> Result<bool, TrackerError> {
        let path = format!(
            "repos/{}/collaborators/{}/permission",
            repo,
            encode_segment(user)
        );
        match self.client.get::<Permission>(&path).await {
            Ok(p) => Ok(matches!(p.permission.as_str(), "admin" | "maintain" | "write")),
            Err(e) if e.http_status() == Some(StatusCode::NOT_FOUND.as_u16()) => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn ci_status(&self, repo: &str, pr: &PullRequest) -> Result<CiStatus, TrackerError> {
        if pr.head_sha.is_empty() {
            return Ok(CiStatus::Unknown);
        }
        let runs: CheckRuns = self
            .client
            .get(&format!("repos/{}/commits/{}/check-runs", repo, pr.head_sha))
            .await?;
        Ok(combine_check_runs(&runs.check_runs))
    }
}
