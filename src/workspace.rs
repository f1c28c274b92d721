//! Per-item working directories.
//!
//! ```text
//! <root>/<owner>_<repo>/issue-<n>/repo/              clone of the repository
//! <root>/<owner>_<repo>/issue-<n>/repo/.taskwright/  agent results (questions, plan, feedback)
//! ```
//!
//! A clone is made once and reused across polls until the item completes.

use std::path::{Path, PathBuf};

use anyhow::Context;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::agent::prompts::TASK_DIR;
use crate::errors::OrchestratorError;
use crate::retry::RetryPolicy;
use crate::tracker::{Tracker, WorkItem};

/// Directory layout for one item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Workspace {
    pub dir: PathBuf,
    pub repo_dir: PathBuf,
}

impl Workspace {
    pub fn task_dir(&self) -> PathBuf {
        self.repo_dir.join(TASK_DIR)
    }

    /// Whether a clone is already in place.
    pub fn exists(&self) -> bool {
        std::fs::read_dir(&self.repo_dir)
            .map(|mut entries| entries.next().is_some())
            .unwrap_or(false)
    }

    /// Trimmed contents of `.taskwright/<name>`, or `None` when the file is missing.
    pub async fn read_task_file(&self, name: &str) -> Result<Option<String>, OrchestratorError> {
        let path = self.task_dir().join(name);
        match tokio::fs::read_to_string(&path).await {
            Ok(content) => Ok(Some(content.trim().to_string())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(anyhow::Error::new(e)
                .context(format!("Failed to read {}", path.display()))
                .into()),
        }
    }

    pub async fn write_task_file(&self, name: &str, content: &str) -> Result<(), OrchestratorError> {
        let dir = self.task_dir();
        tokio::fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("Failed to create {}", dir.display()))?;
        let path = dir.join(name);
        tokio::fs::write(&path, content)
            .await
            .with_context(|| format!("Failed to write {}", path.display()))?;
        Ok(())
    }

    pub async fn ensure_task_dir(&self) -> Result<(), OrchestratorError> {
        let dir = self.task_dir();
        tokio::fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("Failed to create {}", dir.display()))?;
        Ok(())
    }
}

/// Hands out and cleans up workspaces under one root.
#[derive(Debug, Clone)]
pub struct WorkspaceManager {
    root: PathBuf,
}

impl WorkspaceManager {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn workspace(&self, item: &WorkItem) -> Workspace {
        let dir = self
            .root
            .join(item.repo.replace('/', "_"))
            .join(format!("issue-{}", item.number));
        Workspace {
            repo_dir: dir.join("repo"),
            dir,
        }
    }

    /// The item's workspace, cloning the repository first if needed.
    pub async fn ensure_cloned(
        &self,
        tracker: &dyn Tracker,
        item: &WorkItem,
        retry: &RetryPolicy,
        cancel: &CancellationToken,
    ) -> Result<Workspace, OrchestratorError> {
        let workspace = self.workspace(item);
        if workspace.exists() {
            debug!(item = %item, dir = %workspace.repo_dir.display(), "Reusing workspace");
            return Ok(workspace);
        }

        tokio::fs::create_dir_all(&workspace.dir)
            .await
            .with_context(|| format!("Failed to create {}", workspace.dir.display()))?;
        // A half-finished clone from an interrupted run would make git refuse.
        if workspace.repo_dir.exists() {
            let _ = tokio::fs::remove_dir_all(&workspace.repo_dir).await;
        }

        info!(item = %item, dir = %workspace.repo_dir.display(), "Cloning repository");
        retry
            .run(cancel, || tracker.clone_repo(&item.repo, &workspace.repo_dir))
            .await?;
        Ok(workspace)
    }

    /// Remove the item's workspace. Missing directories are fine.
    pub async fn cleanup(&self, item: &WorkItem) {
        let workspace = self.workspace(item);
        match tokio::fs::remove_dir_all(&workspace.dir).await {
            Ok(()) => info!(item = %item, "Removed workspace"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(item = %item, error = %e, "Failed to remove workspace"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tracker::InMemoryTracker;

    #[test]
    fn test_layout() {
        let manager = WorkspaceManager::new("/var/ws");
        let ws = manager.workspace(&WorkItem::new("acme/api", 12));
        assert_eq!(ws.dir, PathBuf::from("/var/ws/acme_api/issue-12"));
        assert_eq!(ws.repo_dir, PathBuf::from("/var/ws/acme_api/issue-12/repo"));
        assert_eq!(
            ws.task_dir(),
            PathBuf::from("/var/ws/acme_api/issue-12/repo/.taskwright")
        );
    }

    #[tokio::test]
    async fn test_clone_once_then_reuse() {
        let root = tempfile::tempdir().unwrap();
        let manager = WorkspaceManager::new(root.path());
        let tracker = InMemoryTracker::new();
        let item = WorkItem::new("acme/api", 3);
        let cancel = CancellationToken::new();
        let retry = RetryPolicy::default();

        let ws = manager
            .ensure_cloned(&tracker, &item, &retry, &cancel)
            .await
            .unwrap();
        ws.write_task_file("plan.md", "  the plan \n").await.unwrap();

        manager
            .ensure_cloned(&tracker, &item, &retry, &cancel)
            .await
            .unwrap();
        assert_eq!(tracker.call_count("clone_repo"), 1);
        assert_eq!(
            ws.read_task_file("plan.md").await.unwrap().as_deref(),
            Some("the plan")
        );
        assert!(ws.read_task_file("questions.md").await.unwrap().is_none());

        manager.cleanup(&item).await;
        assert!(!ws.dir.exists());
        manager.cleanup(&item).await;
    }
}
