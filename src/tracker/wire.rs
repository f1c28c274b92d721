//! REST payload shapes shared by the GitHub and Gitea backends.
//!
//! Both APIs use the same field names for the subset read here.

use chrono::{DateTime, Utc};
use serde::Deserialize;

use super::types::{Comment, Issue, PullRequest};

#[derive(Debug, Default, Deserialize)]
pub(crate) struct ApiUser {
    #[serde(default)]
    pub login: String,
}

#[derive(Debug, Deserialize)]
pub(crate) struct ApiLabel {
    #[serde(default)]
    pub id: u64,
    pub name: String,
}

#[derive(Debug, Deserialize)]
pub(crate) struct ApiIssue {
    pub number: u64,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub body: Option<String>,
    #[serde(default)]
    pub state: String,
    #[serde(default)]
    pub user: Option<ApiUser>,
    #[serde(default)]
    pub labels: Vec<ApiLabel>,
    #[serde(default)]
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub updated_at: DateTime<Utc>,
    /// Present when the "issue" is really a pull request.
    #[serde(default)]
    pub pull_request: Option<serde_json::Value>,
}

impl ApiIssue {
    pub fn is_pull_request(&self) -> bool {
        self.pull_request.as_ref().is_some_and(|v| !v.is_null())
    }
}

impl From<ApiIssue> for Issue {
    fn from(api: ApiIssue) -> Self {
        Issue {
            number: api.number,
            title: api.title,
            body: api.body.unwrap_or_default(),
            labels: api.labels.into_iter().map(|l| l.name).collect(),
            state: api.state,
            author: api.user.unwrap_or_default().login,
            created_at: api.created_at,
            updated_at: api.updated_at,
        }
    }
}

#[derive(Debug, Deserialize)]
pub(crate) struct ApiComment {
    pub id: u64,
    #[serde(default)]
    pub body: Option<String>,
    #[serde(default)]
    pub user: Option<ApiUser>,
    #[serde(default)]
    pub created_at: DateTime<Utc>,
}

impl From<ApiComment> for Comment {
    fn from(api: ApiComment) -> Self {
        Comment {
            id: api.id,
            body: api.body.unwrap_or_default(),
            author: api.user.unwrap_or_default().login,
            created_at: api.created_at,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
pub(crate) struct ApiRef {
    #[serde(rename = "ref", default)]
    pub name: String,
    #[serde(default)]
    pub sha: String,
}

#[derive(Debug, Deserialize)]
pub(crate) struct ApiPull {
    pub number: u64,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub body: Option<String>,
    #[serde(default)]
    pub state: String,
    #[serde(default)]
    pub mergeable: Option<bool>,
    #[serde(default)]
    pub html_url: String,
    #[serde(default)]
    pub head: ApiRef,
    #[serde(default)]
    pub base: ApiRef,
}

impl From<ApiPull> for PullRequest {
    fn from(api: ApiPull) -> Self {
        PullRequest {
            number: api.number,
            title: api.title,
            body: api.body.unwrap_or_default(),
            state: api.state,
            mergeable: api.mergeable,
            html_url: api.html_url,
            head_ref: api.head.name,
            head_sha: api.head.sha,
            base_ref: api.base.name,
        }
    }
}

#[derive(Debug, Deserialize)]
pub(crate) struct ApiRepo {
    #[serde(default)]
    pub default_branch: String,
    #[serde(default)]
    pub clone_url: String,
}

#[derive(Debug, Deserialize)]
pub(crate) struct ApiCreated {
    pub id: u64,
}

/// Percent-encode one URL path segment (label names may contain spaces or `/`).
pub(crate) fn encode_segment(segment: &str) -> String {
    let mut out = String::with_capacity(segment.len());
    for byte in segment.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' | b':' => {
                out.push(byte as char)
            }
            _ => out.push_str(&format!("%{:02X}", byte)),
        }
    }
    out
}
