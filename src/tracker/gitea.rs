//! Gitea (and Forgejo) backend over the `/api/v1` REST API.

use std::path::Path;

use async_trait::async_trait;
use reqwest::{Method, StatusCode};
use serde::Deserialize;
use serde_json::json;
use tracing::debug;

use super::rest::RestClient;
use super::types::{CiStatus, Comment, Issue, NewPullRequest, PullRequest};
use super::wire::{ApiComment, ApiCreated, ApiIssue, ApiLabel, ApiPull, ApiRepo};
use super::{Tracker, authenticated_clone_url, git_clone};
use crate::errors::TrackerError;

const PAGE_SIZE: usize = 50;
const NEW_LABEL_COLOR: &str = "#ededed";

pub struct GiteaTracker {
    client: RestClient,
    token: String,
}

impl GiteaTracker {
    /// `url` is the server root, e.g. `https://git.example.com`.
    pub fn new(url: &str, token: &str) -> Result<Self, TrackerError> {
        let base = format!("{}/api/v1", url.trim_end_matches('/'));
        let authorization = (!token.is_empty()).then(|| format!("token {}", token));
        Ok(Self {
            client: RestClient::new(&base, authorization)?,
            token: token.to_string(),
        })
    }

    async fn repo_labels(&self, repo: &str) -> Result<Vec<ApiLabel>, TrackerError> {
        self.client
            .get_all(&format!("repos/{}/labels", repo), &[], "limit", PAGE_SIZE)
            .await
    }

    /// Gitea attaches labels by id; create the label if the repo lacks it.
    async fn label_id(&self, repo: &str, name: &str) -> Result<u64, TrackerError> {
        if let Some(label) = self
            .repo_labels(repo)
            .await?
            .into_iter()
            .find(|l| l.name == name)
        {
            return Ok(label.id);
        }
        debug!(repo, label = name, "Creating missing label");
        let created: ApiCreated = self
            .client
            .send_json(
                Method::POST,
                &format!("repos/{}/labels", repo),
                &json!({ "name": name, "color": NEW_LABEL_COLOR }),
            )
            .await?;
        Ok(created.id)
    }
}

#[derive(Debug, Deserialize)]
struct ApiReview {
    id: u64,
}

#[derive(Debug, Deserialize)]
struct CombinedStatus {
    #[serde(default)]
    state: String,
    #[serde(default)]
    statuses: Vec<CommitStatus>,
}

#[derive(Debug, Deserialize)]
struct CommitStatus {
    #[serde(default)]
    context: String,
    #[serde(default)]
    status: String,
    #[serde(default)]
    description: String,
}

fn combine_statuses(combined: &CombinedStatus) -> CiStatus {
    if combined.statuses.is_empty() {
        return CiStatus::Unknown;
    }
    match combined.state.as_str() {
        "success" => CiStatus::Success,
        "pending" | "" => CiStatus::Pending,
        _ => {
            let summary = combined
                .statuses
                .iter()
                .filter(|s| matches!(s.status.as_str(), "failure" | "error"))
                .map(|s| format!("{} ({}): {}", s.context, s.status, s.description))
                .collect::<Vec<_>>()
                .join("\n");
            CiStatus::Failure { summary }
        }
    }
}

#[async_trait]
impl Tracker for GiteaTracker {
    fn name(&self) -> &str {
        "gitea"
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
                &[("state", "open"), ("type", "issues"), ("labels", label)],
                "limit",
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
            .get(&format!("repos/{}/issues/{}/comments", repo, number))
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
        let id = self.label_id(repo, label).await?;
        self.client
            .send_json_unit(
                Method::POST,
                &format!("repos/{}/issues/{}/labels", repo, number),
                &json!({ "labels": [id] }),
            )
            .await
    }

    async fn remove_label(
        &self,
        repo: &str,
        number: u64,
        label: &str,
    ) -> Result<(), TrackerError> {
        let Some(existing) = self
            .repo_labels(repo)
            .await?
            .into_iter()
            .find(|l| l.name == label)
        else {
            return Ok(());
        };
        let path = format!("repos/{}/issues/{}/labels/{}", repo, number, existing.id);
        match self.client.delete(&path).await {
            Err(e) if e.http_status() == Some(404) => Ok(()),
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
        let reviews: Vec<ApiReview> = self
            .client
            .get(&format!("repos/{}/pulls/{}/reviews", repo, number))
            .await?;
        let mut comments = Vec::new();
        for review in reviews {
            let batch: Vec<ApiComment> = self
                .client
                .get(&format!(
                    "repos/{}/pulls/{}/reviews/{}/comments",
                    repo, number, review.id
                ))
                .await?;
            comments.extend(batch.into_iter().map(Comment::from));
        }
        comments.sort_by_key(|c| c.created_at);
        Ok(comments)
    }

    async fn merge_pr(&self, repo: &str, number: u64) -> Result<(), TrackerError> {
        self.client
            .send_json_unit(
                Method::POST,
                &format!("repos/{}/pulls/{}/merge", repo, number),
                &json!({ "Do": "squash" }),
            )
            .await
    }

    async fn clone_repo(&self, repo: &str, dest: &Path) -> Result<(), TrackerError> {
        let info: ApiRepo = self.client.get(&format!("repos/{}", repo)).await?;
        let url = authenticated_clone_url(&info.clone_url, "oauth2", &self.token);
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
        let status = self
            .client
            .probe(&format!("repos/{}/collaborators/{}", repo, user))
            .await?;
        match status {
            StatusCode::NO_CONTENT | StatusCode::OK => Ok(true),
            StatusCode::NOT_FOUND => Ok(false),
            other => Err(TrackerError::status(
                other.as_u16(),
                "unexpected collaborator check response",
            )),
        }
    }

    async fn ci_status(&self, repo: &str, pr: &PullRequest) -> Result<CiStatus, TrackerError> {
        if pr.head_sha.is_empty() {
            return Ok(CiStatus::Unknown);
        }
        let combined: CombinedStatus = self
            .client
            .get(&format!("repos/{}/commits/{}/status", repo, pr.head_sha))
            .await?;
        Ok(combine_statuses(&combined))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn combined(state: &str, statuses: &[(&str, &str)]) -> CombinedStatus {
        CombinedStatus {
            state: state.into(),
            statuses: statuses
                .iter()
                .map(|(context, status)| CommitStatus {
                    context: context.to_string(),
                    status: status.to_string(),
                    description: "details".into(),
                })
                .collect(),
        }
    }

    #[test]
    fn test_no_statuses_is_unknown() {
        assert_eq!(combine_statuses(&combined("", &[])), CiStatus::Unknown);
    }

    #[test]
    fn test_pending_and_success() {
        let pending = combined("pending", &[("ci/build", "pending")]);
        assert_eq!(combine_statuses(&pending), CiStatus::Pending);
        let green = combined("success", &[("ci/build", "success")]);
        assert_eq!(combine_statuses(&green), CiStatus::Success);
    }

    #[test]
    fn test_failure_lists_failing_contexts() {
        let red = combined("failure", &[("ci/build", "success"), ("ci/test", "failure")]);
        match combine_statuses(&red) {
            CiStatus::Failure { summary } => {
                assert_eq!(summary, "ci/test (failure): details");
            }
            other => panic!("Expected Failure, got {:?}", other),
        }
    }

    #[test]
    fn test_new_builds_api_base() {
        assert!(GiteaTracker::new("https://git.example.com/", "tok").is_ok());
    }
}
