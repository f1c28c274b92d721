//! In-process tracker used by tests and `--dry-run`.
//!
//! Everything lives behind one mutex. Failures can be queued per operation
//! name to exercise the retry paths.

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::path::Path;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{Duration, Utc};

use super::Tracker;
use super::types::{CiStatus, Comment, Issue, NewPullRequest, PullRequest};
use crate::errors::TrackerError;

type Key = (String, u64);

#[derive(Default)]
struct Inner {
    issues: BTreeMap<Key, Issue>,
    comments: BTreeMap<Key, Vec<Comment>>,
    pulls: BTreeMap<Key, PullRequest>,
    review_comments: BTreeMap<Key, Vec<Comment>>,
    ci: BTreeMap<Key, CiStatus>,
    merged: BTreeSet<Key>,
    reactions: Vec<(u64, String)>,
    collaborators: BTreeSet<(String, String)>,
    allow_everyone: bool,
    failures: HashMap<String, VecDeque<TrackerError>>,
    calls: HashMap<String, usize>,
    next_id: u64,
    default_branch: String,
    comment_delay: Option<std::time::Duration>,
}

/// Tracker state held entirely in memory.
pub struct InMemoryTracker {
    inner: Mutex<Inner>,
}

impl Default for InMemoryTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryTracker {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                next_id: 1000,
                default_branch: "main".to_string(),
                allow_everyone: true,
                ..Inner::default()
            }),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        // A panicking test thread must not wedge every later assertion.
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Count the call and pop a queued failure for `op`, if any.
    fn enter(&self, op: &str) -> Result<(), TrackerError> {
        let mut inner = self.lock();
        *inner.calls.entry(op.to_string()).or_default() += 1;
        match inner.failures.get_mut(op).and_then(|q| q.pop_front()) {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    pub fn add_issue(&self, repo: &str, issue: Issue) {
        let mut inner = self.lock();
        let key = (repo.to_string(), issue.number);
        inner.comments.entry(key.clone()).or_default();
        inner.issues.insert(key, issue);
    }

    /// Post a comment as `author` and return its id.
    pub fn add_comment(&self, repo: &str, number: u64, author: &str, body: &str) -> u64 {
        let mut inner = self.lock();
        push_comment(&mut inner, repo, number, author, body)
    }

    pub fn add_review_comment(&self, repo: &str, pr: u64, author: &str, body: &str) -> u64 {
        let mut inner = self.lock();
        inner.next_id += 1;
        let id = inner.next_id;
        let created_at = next_timestamp(inner.review_comments.values().flatten());
        inner
            .review_comments
            .entry((repo.to_string(), pr))
            .or_default()
            .push(Comment {
                id,
                body: body.to_string(),
                author: author.to_string(),
                created_at,
            });
        id
    }

    pub fn issue(&self, repo: &str, number: u64) -> Option<Issue> {
        self.lock().issues.get(&(repo.to_string(), number)).cloned()
    }

    pub fn comments(&self, repo: &str, number: u64) -> Vec<Comment> {
        self.lock()
            .comments
            .get(&(repo.to_string(), number))
            .cloned()
            .unwrap_or_default()
    }

    pub fn labels(&self, repo: &str, number: u64) -> Vec<String> {
        self.issue(repo, number)
            .map(|i| i.labels)
            .unwrap_or_default()
    }

    pub fn set_labels(&self, repo: &str, number: u64, labels: &[&str]) {
        let mut inner = self.lock();
        if let Some(issue) = inner.issues.get_mut(&(repo.to_string(), number)) {
            issue.labels = labels.iter().map(|l| l.to_string()).collect();
        }
    }

    /// Seed an existing pull request.
    pub fn add_pull(&self, repo: &str, pr: PullRequest) {
        self.lock().pulls.insert((repo.to_string(), pr.number), pr);
    }

    pub fn pull(&self, repo: &str, number: u64) -> Option<PullRequest> {
        self.lock().pulls.get(&(repo.to_string(), number)).cloned()
    }

    pub fn pulls(&self, repo: &str) -> Vec<PullRequest> {
        self.lock()
            .pulls
            .iter()
            .filter(|((r, _), _)| r == repo)
            .map(|(_, pr)| pr.clone())
            .collect()
    }

    pub fn set_mergeable(&self, repo: &str, pr: u64, mergeable: Option<bool>) {
        if let Some(p) = self.lock().pulls.get_mut(&(repo.to_string(), pr)) {
            p.mergeable = mergeable;
        }
    }

    pub fn set_ci_status(&self, repo: &str, pr: u64, status: CiStatus) {
        self.lock().ci.insert((repo.to_string(), pr), status);
    }

    pub fn is_merged(&self, repo: &str, pr: u64) -> bool {
        self.lock().merged.contains(&(repo.to_string(), pr))
    }

    pub fn reactions(&self) -> Vec<(u64, String)> {
        self.lock().reactions.clone()
    }

    /// Restrict authorization to users added with [`Self::add_collaborator`].
    pub fn restrict_collaborators(&self) {
        self.lock().allow_everyone = false;
    }

    pub fn add_collaborator(&self, repo: &str, user: &str) {
        let mut inner = self.lock();
        inner.allow_everyone = false;
        inner
            .collaborators
            .insert((repo.to_string(), user.to_string()));
    }

    /// Queue `error` to be returned by the next call to `op` (the trait method name).
    pub fn fail_next(&self, op: &str, error: TrackerError) {
        self.lock()
            .failures
            .entry(op.to_string())
            .or_default()
            .push_back(error);
    }

    pub fn call_count(&self, op: &str) -> usize {
        self.lock().calls.get(op).copied().unwrap_or(0)
    }

    /// Make every later `create_comment` take `delay` before it lands.
    pub fn delay_comments(&self, delay: std::time::Duration) {
        self.lock().comment_delay = Some(delay);
    }
}

/// Strictly after every existing timestamp, so "newer than" comparisons hold in tests.
fn next_timestamp<'a>(existing: impl Iterator<Item = &'a Comment>) -> chrono::DateTime<Utc> {
    let now = Utc::now();
    match existing.map(|c| c.created_at).max() {
        Some(latest) if latest >= now => latest + Duration::milliseconds(1),
        _ => now,
    }
}

fn push_comment(inner: &mut Inner, repo: &str, number: u64, author: &str, body: &str) -> u64 {
    inner.next_id += 1;
    let id = inner.next_id;
    let created_at = next_timestamp(inner.comments.values().flatten());
    inner
        .comments
        .entry((repo.to_string(), number))
        .or_default()
        .push(Comment {
            id,
            body: body.to_string(),
            author: author.to_string(),
            created_at,
        });
    id
}

fn not_found(kind: &str, repo: &str, number: u64) -> TrackerError {
    TrackerError::not_found(&format!("{} {}#{}", kind, repo, number))
}

#[async_trait]
impl Tracker for InMemoryTracker {
    fn name(&self) -> &str {
        "memory"
    }

    async fn get_issue(&self, repo: &str, number: u64) -> Result<Issue, TrackerError> {
        self.enter("get_issue")?;
        self.issue(repo, number)
            .ok_or_else(|| not_found("issue", repo, number))
    }

    async fn list_issues_with_label(
        &self,
        repo: &str,
        label: &str,
    ) -> Result<Vec<Issue>, TrackerError> {
        self.enter("list_issues_with_label")?;
        Ok(self
            .lock()
            .issues
            .iter()
            .filter(|((r, _), issue)| r == repo && issue.state != "closed" && issue.has_label(label))
            .map(|(_, issue)| issue.clone())
            .collect())
    }

    async fn get_comments(&self, repo: &str, number: u64) -> Result<Vec<Comment>, TrackerError> {
        self.enter("get_comments")?;
        Ok(self.comments(repo, number))
    }

    async fn create_comment(
        &self,
        repo: &str,
        number: u64,
        body: &str,
    ) -> Result<u64, TrackerError> {
        self.enter("create_comment")?;
        let delay = self.lock().comment_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let mut inner = self.lock();
        Ok(push_comment(&mut inner, repo, number, "taskwright-bot", body))
    }

    async fn update_comment(
        &self,
        repo: &str,
        comment_id: u64,
        body: &str,
    ) -> Result<(), TrackerError> {
        self.enter("update_comment")?;
        let mut inner = self.lock();
        let comment = inner
            .comments
            .iter_mut()
            .filter(|((r, _), _)| r == repo)
            .flat_map(|(_, list)| list.iter_mut())
            .find(|c| c.id == comment_id)
            .ok_or_else(|| TrackerError::not_found(&format!("comment {}", comment_id)))?;
        comment.body = body.to_string();
        Ok(())
    }

    async fn update_issue_body(
        &self,
        repo: &str,
        number: u64,
        body: &str,
    ) -> Result<(), TrackerError> {
        self.enter("update_issue_body")?;
        let mut inner = self.lock();
        let issue = inner
            .issues
            .get_mut(&(repo.to_string(), number))
            .ok_or_else(|| not_found("issue", repo, number))?;
        issue.body = body.to_string();
        Ok(())
    }

    async fn react_to_comment(
        &self,
        _repo: &str,
        comment_id: u64,
        reaction: &str,
    ) -> Result<(), TrackerError> {
        self.enter("react_to_comment")?;
        self.lock()
            .reactions
            .push((comment_id, reaction.to_string()));
        Ok(())
    }

    async fn add_label(&self, repo: &str, number: u64, label: &str) -> Result<(), TrackerError> {
        self.enter("add_label")?;
        let mut inner = self.lock();
        let issue = inner
            .issues
            .get_mut(&(repo.to_string(), number))
            .ok_or_else(|| not_found("issue", repo, number))?;
        if !issue.has_label(label) {
            issue.labels.push(label.to_string());
        }
        Ok(())
    }

    async fn remove_label(
        &self,
        repo: &str,
        number: u64,
        label: &str,
    ) -> Result<(), TrackerError> {
        self.enter("remove_label")?;
        if let Some(issue) = self.lock().issues.get_mut(&(repo.to_string(), number)) {
            issue.labels.retain(|l| l != label);
        }
        Ok(())
    }

    async fn create_pr(
        &self,
        repo: &str,
        pr: &NewPullRequest,
    ) -> Result<PullRequest, TrackerError> {
        self.enter("create_pr")?;
        let mut inner = self.lock();
        if let Some(existing) = inner
            .pulls
            .iter()
            .find(|((r, _), p)| r == repo && p.head_ref == pr.head && p.state == "open")
            .map(|(_, p)| p.clone())
        {
            return Err(TrackerError::status(
                422,
                format!(
                    "A pull request already exists for {}: {}",
                    pr.head, existing.html_url
                ),
            ));
        }
        inner.next_id += 1;
        let number = inner.next_id;
        let created = PullRequest {
            number,
            title: pr.title.clone(),
            body: pr.body.clone(),
            state: "open".into(),
            mergeable: Some(true),
            html_url: format!("https://tracker.test/{}/pull/{}", repo, number),
            head_ref: pr.head.clone(),
            head_sha: format!("sha-{}", number),
            base_ref: pr.base.clone(),
        };
        inner
            .pulls
            .insert((repo.to_string(), number), created.clone());
        Ok(created)
    }

    async fn get_pr(&self, repo: &str, number: u64) -> Result<PullRequest, TrackerError> {
        self.enter("get_pr")?;
        self.pull(repo, number)
            .ok_or_else(|| not_found("pull request", repo, number))
    }

    async fn get_pr_comments(
        &self,
        repo: &str,
        number: u64,
    ) -> Result<Vec<Comment>, TrackerError> {
        self.enter("get_pr_comments")?;
        Ok(self.comments(repo, number))
    }

    async fn get_pr_review_comments(
        &self,
        repo: &str,
        number: u64,
    ) -> Result<Vec<Comment>, TrackerError> {
        self.enter("get_pr_review_comments")?;
        Ok(self
            .lock()
            .review_comments
            .get(&(repo.to_string(), number))
            .cloned()
            .unwrap_or_default())
    }

    async fn merge_pr(&self, repo: &str, number: u64) -> Result<(), TrackerError> {
        self.enter("merge_pr")?;
        let mut inner = self.lock();
        let key = (repo.to_string(), number);
        let pr = inner
            .pulls
            .get_mut(&key)
            .ok_or_else(|| not_found("pull request", repo, number))?;
        if pr.mergeable == Some(false) {
            return Err(TrackerError::status(405, "Pull request is not mergeable"));
        }
        pr.state = "closed".into();
        inner.merged.insert(key);
        Ok(())
    }

    async fn clone_repo(&self, _repo: &str, dest: &Path) -> Result<(), TrackerError> {
        self.enter("clone_repo")?;
        tokio::fs::create_dir_all(dest)
            .await
            .map_err(|e| TrackerError::Other(e.into()))
    }

    async fn get_default_branch(&self, _repo: &str) -> Result<String, TrackerError> {
        self.enter("get_default_branch")?;
        Ok(self.lock().default_branch.clone())
    }

    async fn is_collaborator(&self, repo: &str, user: &str) -> Result<bool, TrackerError> {
        self.enter("is_collaborator")?;
        let inner = self.lock();
        Ok(inner.allow_everyone
            || inner
                .collaborators
                .contains(&(repo.to_string(), user.to_string())))
    }

    async fn ci_status(&self, repo: &str, pr: &PullRequest) -> Result<CiStatus, TrackerError> {
        self.enter("ci_status")?;
        Ok(self
            .lock()
            .ci
            .get(&(repo.to_string(), pr.number))
            .cloned()
            .unwrap_or(CiStatus::Unknown))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const REPO: &str = "acme/api";

    fn issue(number: u64, labels: &[&str]) -> Issue {
        Issue {
            number,
            title: format!("Issue {}", number),
            labels: labels.iter().map(|l| l.to_string()).collect(),
            state: "open".into(),
            ..Issue::default()
        }
    }

    #[tokio::test]
    async fn test_list_filters_by_label_and_repo() {
        let tracker = InMemoryTracker::new();
        tracker.add_issue(REPO, issue(1, &["ai-implement"]));
        tracker.add_issue(REPO, issue(2, &["bug"]));
        tracker.add_issue("acme/web", issue(3, &["ai-implement"]));

        let listed = tracker.list_issues_with_label(REPO, "ai-implement").await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].number, 1);
    }

    #[tokio::test]
    async fn test_labels_add_remove_idempotent() {
        let tracker = InMemoryTracker::new();
        tracker.add_issue(REPO, issue(1, &[]));
        tracker.add_label(REPO, 1, "phase:planning").await.unwrap();
        tracker.add_label(REPO, 1, "phase:planning").await.unwrap();
        assert_eq!(tracker.labels(REPO, 1), vec!["phase:planning"]);

        tracker.remove_label(REPO, 1, "phase:planning").await.unwrap();
        tracker.remove_label(REPO, 1, "phase:planning").await.unwrap();
        assert!(tracker.labels(REPO, 1).is_empty());
    }

    #[tokio::test]
    async fn test_comments_are_ordered_and_editable() {
        let tracker = InMemoryTracker::new();
        tracker.add_issue(REPO, issue(1, &[]));
        let first = tracker.add_comment(REPO, 1, "alice", "hello");
        let second = tracker.create_comment(REPO, 1, "status").await.unwrap();
        tracker.update_comment(REPO, second, "status v2").await.unwrap();

        let comments = tracker.get_comments(REPO, 1).await.unwrap();
        assert_eq!(comments[0].id, first);
        assert!(comments[1].created_at > comments[0].created_at);
        assert_eq!(comments[1].body, "status v2");
    }

    #[tokio::test]
    async fn test_duplicate_pr_reports_existing_url() {
        let tracker = InMemoryTracker::new();
        let new_pr = NewPullRequest {
            title: "Fix".into(),
            body: "Closes #1".into(),
            head: "ai/issue-1".into(),
            base: "main".into(),
            issue_number: 1,
        };
        let created = tracker.create_pr(REPO, &new_pr).await.unwrap();
        let err = tracker.create_pr(REPO, &new_pr).await.unwrap_err();
        assert_eq!(err.http_status(), Some(422));
        assert!(err.to_string().contains(&format!("/pull/{}", created.number)));
    }

    #[tokio::test]
    async fn test_queued_failure_is_returned_once() {
        let tracker = InMemoryTracker::new();
        tracker.fail_next("get_default_branch", TrackerError::status(502, "bad gateway"));
        assert!(tracker.get_default_branch(REPO).await.is_err());
        assert_eq!(tracker.get_default_branch(REPO).await.unwrap(), "main");
        assert_eq!(tracker.call_count("get_default_branch"), 2);
    }

    #[tokio::test]
    async fn test_collaborators_restricted() {
        let tracker = InMemoryTracker::new();
        assert!(tracker.is_collaborator(REPO, "anyone").await.unwrap());
        tracker.add_collaborator(REPO, "alice");
        assert!(tracker.is_collaborator(REPO, "alice").await.unwrap());
        assert!(!tracker.is_collaborator(REPO, "mallory").await.unwrap());
    }
}
