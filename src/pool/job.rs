//! Units of work for the pool and what comes back from them.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::state::ProgressRecord;
use crate::tracker::{Issue, WorkItem};

/// One item and its record, owned by the worker running it.
#[derive(Debug, Clone)]
pub struct Job {
    pub item: WorkItem,
    pub issue: Issue,
    pub record: ProgressRecord,
}

impl Job {
    pub fn new(item: WorkItem, issue: Issue, record: ProgressRecord) -> Self {
        Self {
            item,
            issue,
            record,
        }
    }

    /// The group the per-group limit applies to.
    pub fn group(&self) -> &str {
        &self.item.repo
    }
}

/// How a job ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStatus {
    /// Stopped to wait for a human or for CI; resumed by a later poll.
    Waiting,
    Completed,
    /// The item moved to `failed`.
    Failed,
    /// Shutdown interrupted the job; its record stays resumable.
    Cancelled,
    /// The job could not run (clone failed, tracker unreachable); the item is unchanged.
    Errored,
}

#[derive(Debug, Clone)]
pub struct JobResult {
    pub item: WorkItem,
    /// The record as the job left it.
    pub record: ProgressRecord,
    pub status: JobStatus,
    pub error: Option<String>,
}

impl JobResult {
    pub fn new(item: WorkItem, record: ProgressRecord, status: JobStatus) -> Self {
        Self {
            item,
            record,
            status,
            error: None,
        }
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }
}

/// Snapshots of records held by running jobs, for persistence during shutdown.
#[derive(Debug, Clone, Default)]
pub struct ActiveStates {
    inner: Arc<Mutex<HashMap<WorkItem, ProgressRecord>>>,
}

impl ActiveStates {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<WorkItem, ProgressRecord>> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Record (or refresh) the snapshot for `item`.
    pub fn register(&self, item: &WorkItem, record: &ProgressRecord) {
        self.lock().insert(item.clone(), record.clone());
    }

    pub fn unregister(&self, item: &WorkItem) {
        self.lock().remove(item);
    }

    pub fn contains(&self, item: &WorkItem) -> bool {
        self.lock().contains_key(item)
    }

    /// Copies of every registered record.
    pub fn snapshot(&self) -> Vec<(WorkItem, ProgressRecord)> {
        let mut all: Vec<_> = self
            .lock()
            .iter()
            .map(|(item, record)| (item.clone(), record.clone()))
            .collect();
        all.sort_by(|a, b| a.0.cmp(&b.0));
        all
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

/// What a worker hands each job to.
#[async_trait]
pub trait JobRunner: Send + Sync {
    /// Run `job` to its next stopping point. `states` should be refreshed
    /// whenever the record is persisted.
    async fn run(&self, job: Job, cancel: CancellationToken, states: ActiveStates) -> JobResult;
}
