//! The polling loop.
//!
//! ## Architecture
//!
//! ```text
//!  every poll_interval:
//!    drain finished jobs ──▶ tracked records
//!    for each repo:
//!      list trigger-labelled (+ needs-manual-resolution) issues
//!        └─ load record ─▶ /retry check ─▶ detect deps ─▶ cycle check
//!             └─ resolve_blocking ─▶ fail | mark blocked | unblock + try_submit
//!  on cancel:
//!    stop admitting ─▶ save in-flight records ─▶ pool.shutdown(grace)
//! ```
//!
//! Items whose job is still running are never loaded or resubmitted; the
//! record in the pool's active-state map stands in for them.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use futures::future::join_all;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::dependency::{Blocking, DependencyDetector, DependencyGraph, resolve_blocking};
use crate::errors::{OrchestratorError, RetryError};
use crate::orchestrator::Orchestrator;
use crate::pool::{ActiveStates, Job, JobResult, JobRunner, JobStatus, PoolLimits, WorkerPool};
use crate::state::{FailureReason, Phase, ProgressRecord, phase_from_labels};
use crate::tracker::{Issue, WorkItem};
use crate::workflow::notices::{self, ABORT_LABEL, NEEDS_MANUAL_RESOLUTION_LABEL};

/// Counts from one poll, across all repositories.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct PollSummary {
    pub seen: usize,
    pub submitted: usize,
    /// Ready but rejected by the pool's limits.
    pub deferred: usize,
    pub blocked: usize,
    pub failed: usize,
}

impl PollSummary {
    fn absorb(&mut self, other: PollSummary) {
        self.seen += other.seen;
        self.submitted += other.submitted;
        self.deferred += other.deferred;
        self.blocked += other.blocked;
        self.failed += other.failed;
    }
}

enum Admission {
    Submitted,
    Deferred,
    Blocked,
    Failed,
}

pub struct Daemon {
    orchestrator: Arc<Orchestrator>,
    pool: WorkerPool,
    repos: Vec<String>,
    detector: DependencyDetector,
    tracked: Mutex<HashMap<String, BTreeMap<u64, ProgressRecord>>>,
}

impl Daemon {
    /// Start the worker pool for `repos`. Must be called inside a Tokio runtime.
    pub fn new(orchestrator: Arc<Orchestrator>, repos: Vec<String>) -> Self {
        let config = orchestrator.config();
        let limits = PoolLimits::new(
            config.concurrency.max_per_repo,
            config.concurrency.max_total,
        );
        let detector = DependencyDetector::new(config.concurrency.dependency_detection);
        let pool = WorkerPool::start(limits, orchestrator.clone());
        Self {
            orchestrator,
            pool,
            repos,
            detector,
            tracked: Mutex::new(HashMap::new()),
        }
    }

    fn tracked_map(&self) -> std::sync::MutexGuard<'_, HashMap<String, BTreeMap<u64, ProgressRecord>>> {
        self.tracked.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Last known record of an item.
    pub fn tracked(&self, item: &WorkItem) -> Option<ProgressRecord> {
        self.tracked_map()
            .get(&item.repo)
            .and_then(|records| records.get(&item.number))
            .cloned()
    }

    /// Jobs admitted and not yet drained.
    pub fn active_jobs(&self) -> usize {
        self.pool.active_count()
    }

    /// Poll until `cancel` fires, then shut down gracefully.
    pub async fn run(&self, cancel: CancellationToken) -> Result<()> {
        let config = self.orchestrator.config();
        info!(
            repos = ?self.repos,
            interval_secs = config.poll_interval().as_secs(),
            max_per_repo = config.concurrency.max_per_repo,
            max_total = config.concurrency.max_total,
            "Daemon started"
        );

        let mut ticker = tokio::time::interval(config.poll_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => match self.poll(&cancel).await {
                    Ok(summary) => debug!(
                        seen = summary.seen,
                        submitted = summary.submitted,
                        deferred = summary.deferred,
                        blocked = summary.blocked,
                        failed = summary.failed,
                        "Poll complete"
                    ),
                    Err(e) if e.is_cancelled() => break,
                    Err(e) => warn!(error = %e, "Poll failed"),
                },
            }
        }

        info!("Shutdown requested");
        self.shutdown(config.shutdown_timeout()).await;
        Ok(())
    }

    /// One pass over every repository.
    pub async fn poll(&self, cancel: &CancellationToken) -> Result<PollSummary, OrchestratorError> {
        self.drain_results();
        let mut summary = PollSummary::default();
        for repo in &self.repos {
            match self.poll_repo(repo, cancel).await {
                Ok(repo_summary) => summary.absorb(repo_summary),
                Err(e) if e.is_cancelled() => return Err(e),
                Err(e) => warn!(repo = %repo, error = %e, "Failed to poll repository"),
            }
        }
        Ok(summary)
    }

    /// Collect finished jobs, releasing their pool slots. Returns how many were drained.
    pub fn drain_results(&self) -> usize {
        let mut drained = 0;
        while let Some(result) = self.pool.try_next_result() {
            self.pool.on_job_complete(&result.item.repo);
            self.record_result(result);
            drained += 1;
        }
        drained
    }

    fn record_result(&self, result: JobResult) {
        let JobResult {
            item,
            record,
            status,
            error,
        } = result;
        match status {
            JobStatus::Completed => info!(item = %item, pr = ?record.pr_number, "Item completed"),
            JobStatus::Failed => warn!(item = %item, error = error.as_deref().unwrap_or(""), "Item failed"),
            JobStatus::Errored => warn!(item = %item, error = error.as_deref().unwrap_or(""), "Job errored, will retry next poll"),
            JobStatus::Cancelled => info!(item = %item, phase = %record.phase(), "Job cancelled"),
            JobStatus::Waiting => debug!(item = %item, phase = %record.phase(), "Item waiting"),
        }
        self.tracked_map()
            .entry(item.repo)
            .or_default()
            .insert(item.number, record);
    }

    /// Stop admitting, save in-flight records, then let running jobs finish.
    ///
    /// Saving and draining share one `grace` deadline. Returns whether every
    /// job finished within it.
    pub async fn shutdown(&self, grace: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + grace;
        self.pool.stop_accepting();
        let active = self.pool.active_states().snapshot();
        if !active.is_empty() {
            info!(count = active.len(), "Saving state of in-flight jobs");
            let cancel = CancellationToken::new();
            let save = join_all(active.iter().map(|(item, record)| {
                let cancel = &cancel;
                async move {
                    if let Err(e) = self.orchestrator.save_snapshot(item, record, cancel).await {
                        warn!(item = %item, error = %e, "Failed to save state");
                    }
                }
            }));
            if tokio::time::timeout_at(deadline, save).await.is_err() {
                warn!("Timed out saving in-flight state");
            }
        }
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        let drained = self.pool.shutdown(remaining).await;
        self.drain_results();
        drained
    }

    async fn poll_repo(
        &self,
        repo: &str,
        cancel: &CancellationToken,
    ) -> Result<PollSummary, OrchestratorError> {
        let orchestrator = &self.orchestrator;
        let mut summary = PollSummary::default();
        let issues = self.candidate_issues(repo, cancel).await?;

        let mut records: BTreeMap<u64, ProgressRecord> = self
            .pool
            .active_states()
            .snapshot()
            .into_iter()
            .filter(|(item, _)| item.repo == repo)
            .map(|(item, record)| (item.number, record))
            .collect();
        let mut pending: Vec<(WorkItem, Issue)> = Vec::new();
        let mut detected: BTreeSet<u64> = BTreeSet::new();

        for issue in issues {
            let number = issue.number;
            if issue.has_label(ABORT_LABEL) {
                debug!(repo = %repo, issue = number, "Skipping aborted item");
                continue;
            }
            if records.contains_key(&number) {
                continue;
            }
            summary.seen += 1;
            let item = WorkItem::new(repo, number);
            let mut record = match orchestrator.load_record(&item, &issue, cancel).await {
                Ok(record) => record,
                Err(e) if e.is_cancelled() => return Err(e),
                Err(e) => {
                    warn!(item = %item, error = %e, "Failed to load state");
                    continue;
                }
            };

            if record.phase() == Phase::Failed {
                match orchestrator.check_for_retry(&item, &mut record, cancel).await {
                    Ok(true) => {}
                    Ok(false) => {
                        records.insert(number, record);
                        continue;
                    }
                    Err(e) if e.is_cancelled() => return Err(e),
                    Err(e) => {
                        warn!(item = %item, error = %e, "Retry check failed");
                        records.insert(number, record);
                        continue;
                    }
                }
            }
            if record.is_terminal() {
                records.insert(number, record);
                continue;
            }

            if record.depends_on.is_none() {
                match detect_dependencies(orchestrator, &self.detector, &item, &issue, cancel).await {
                    Ok(deps) => {
                        if !deps.is_empty() {
                            info!(item = %item, depends_on = ?deps, "Detected dependencies");
                            detected.insert(number);
                        }
                        record.depends_on = Some(deps);
                    }
                    Err(e) if e.is_cancelled() => return Err(e),
                    Err(e) => warn!(item = %item, error = %e, "Dependency detection failed"),
                }
            }
            records.insert(number, record);
            pending.push((item, issue));
        }

        let graph = DependencyGraph::from_records(
            records
                .iter()
                .filter(|(_, r)| !r.is_terminal())
                .map(|(n, r)| (*n, r)),
        );
        debug!(repo = %repo, items = graph.len(), "Checking dependency graph");
        for cycle in graph.find_cycles() {
            warn!(repo = %repo, cycle = %cycle, "Dependency cycle");
            let notice = notices::dependency_cycle(&cycle);
            for number in &cycle.path {
                let Some(idx) = pending.iter().position(|(item, _)| item.number == *number) else {
                    continue;
                };
                let (item, _) = pending.remove(idx);
                let Some(record) = records.get_mut(number) else {
                    continue;
                };
                match orchestrator
                    .fail_item(
                        &item,
                        record,
                        &cycle.to_string(),
                        Some(FailureReason::DependencyCycle),
                        &notice,
                        cancel,
                    )
                    .await
                {
                    Ok(()) => summary.failed += 1,
                    Err(e) if e.is_cancelled() => return Err(e),
                    Err(e) => warn!(item = %item, error = %e, "Failed to report dependency cycle"),
                }
            }
        }

        let mut phases: HashMap<u64, Phase> =
            records.iter().map(|(n, r)| (*n, r.phase())).collect();
        let wanted: BTreeSet<u64> = pending
            .iter()
            .filter_map(|(item, _)| records.get(&item.number))
            .flat_map(|r| r.depends_on.iter().flatten().copied())
            .collect();
        let looked_up = dependency_phases(orchestrator, repo, &wanted, &phases, cancel).await?;
        phases.extend(looked_up);

        for (item, issue) in pending {
            let Some(record) = records.get_mut(&item.number) else {
                continue;
            };
            let number = item.number;
            match self
                .admit(item, issue, record, &phases, detected.contains(&number), cancel)
                .await
            {
                Ok(Admission::Submitted) => summary.submitted += 1,
                Ok(Admission::Deferred) => summary.deferred += 1,
                Ok(Admission::Blocked) => summary.blocked += 1,
                Ok(Admission::Failed) => {
                    phases.insert(number, Phase::Failed);
                    summary.failed += 1;
                }
                Err(e) if e.is_cancelled() => return Err(e),
                Err(e) => warn!(repo = %repo, issue = number, error = %e, "Admission failed"),
            }
        }

        self.tracked_map().insert(repo.to_string(), records);
        Ok(summary)
    }

    async fn admit(
        &self,
        item: WorkItem,
        issue: Issue,
        record: &mut ProgressRecord,
        phases: &HashMap<u64, Phase>,
        mut dirty: bool,
        cancel: &CancellationToken,
    ) -> Result<Admission, OrchestratorError> {
        match gate(&self.orchestrator, &item, record, phases, cancel).await? {
            Blocking::Ready => {}
            Blocking::Blocked(blocked) => {
                if record.blocked_by != blocked {
                    debug!(item = %item, blocked_by = ?blocked, "Item blocked");
                    record.set_blocked_by(blocked);
                    dirty = true;
                }
                if dirty {
                    self.orchestrator.persist_record(&item, record, cancel).await?;
                }
                return Ok(Admission::Blocked);
            }
            Blocking::DependencyFailed(_) => return Ok(Admission::Failed),
        }
        if dirty {
            self.orchestrator.persist_record(&item, record, cancel).await?;
        }

        let job = Job::new(item.clone(), issue, record.clone());
        if self.pool.try_submit(job) {
            debug!(item = %item, phase = %record.phase(), "Submitted");
            Ok(Admission::Submitted)
        } else {
            debug!(item = %item, "Pool full, deferring");
            Ok(Admission::Deferred)
        }
    }

    async fn candidate_issues(
        &self,
        repo: &str,
        cancel: &CancellationToken,
    ) -> Result<Vec<Issue>, OrchestratorError> {
        let orchestrator = &self.orchestrator;
        let tracker = orchestrator.tracker();
        let trigger = orchestrator.config().trigger_label.as_str();
        let mut issues = orchestrator
            .tracker_retry()
            .run(cancel, || tracker.list_issues_with_label(repo, trigger))
            .await?;
        // Merge-conflict failures lose the trigger label; /retry must still find them.
        let manual = orchestrator
            .tracker_retry()
            .run(cancel, || {
                tracker.list_issues_with_label(repo, NEEDS_MANUAL_RESOLUTION_LABEL)
            })
            .await?;
        for issue in manual {
            if !issues.iter().any(|i| i.number == issue.number) {
                issues.push(issue);
            }
        }
        issues.sort_by_key(|i| i.number);
        Ok(issues)
    }
}

/// Process one item once in the foreground, honoring its dependencies.
///
/// A blocked item comes back `Waiting` with `blocked_by` filled in.
pub async fn run_once(
    orchestrator: &Orchestrator,
    item: &WorkItem,
    cancel: &CancellationToken,
) -> Result<JobResult, OrchestratorError> {
    let tracker = orchestrator.tracker();
    let issue = orchestrator
        .tracker_retry()
        .run(cancel, || tracker.get_issue(&item.repo, item.number))
        .await?;
    let mut record = orchestrator.load_record(item, &issue, cancel).await?;
    if record.phase() == Phase::Failed {
        orchestrator.check_for_retry(item, &mut record, cancel).await?;
    }

    if !record.is_terminal() {
        let mut dirty = false;
        if record.depends_on.is_none() {
            let detector =
                DependencyDetector::new(orchestrator.config().concurrency.dependency_detection);
            let deps = detect_dependencies(orchestrator, &detector, item, &issue, cancel).await?;
            dirty = !deps.is_empty();
            record.depends_on = Some(deps);
        }
        let deps = record.depends_on.clone().unwrap_or_default();
        let phases = dependency_phases(orchestrator, &item.repo, &deps, &HashMap::new(), cancel).await?;
        match gate(orchestrator, item, &mut record, &phases, cancel).await? {
            Blocking::Ready => {
                if dirty {
                    orchestrator.persist_record(item, &mut record, cancel).await?;
                }
            }
            Blocking::Blocked(blocked) => {
                info!(item = %item, blocked_by = ?blocked, "Item is blocked");
                record.set_blocked_by(blocked);
                orchestrator.persist_record(item, &mut record, cancel).await?;
                return Ok(JobResult::new(item.clone(), record, JobStatus::Waiting));
            }
            Blocking::DependencyFailed(_) => {
                let error = record.error.clone().unwrap_or_default();
                return Ok(JobResult::new(item.clone(), record, JobStatus::Failed).with_error(error));
            }
        }
    }

    let job = Job::new(item.clone(), issue, record);
    Ok(orchestrator
        .run(job, cancel.clone(), ActiveStates::new())
        .await)
}

/// Resolve `record`'s dependencies. A failed dependency fails the item; a
/// newly ready item that was blocked announces each dependency that cleared.
async fn gate(
    orchestrator: &Orchestrator,
    item: &WorkItem,
    record: &mut ProgressRecord,
    phases: &HashMap<u64, Phase>,
    cancel: &CancellationToken,
) -> Result<Blocking, OrchestratorError> {
    let deps = record.depends_on.clone().unwrap_or_default();
    let verdict = resolve_blocking(&deps, |n| phases.get(&n).copied());
    match &verdict {
        Blocking::DependencyFailed(dep) => {
            let message = format!("Dependency #{} failed", dep);
            orchestrator
                .fail_item(
                    item,
                    record,
                    &message,
                    Some(FailureReason::DependencyFailed),
                    &notices::dependency_failed(*dep),
                    cancel,
                )
                .await?;
        }
        Blocking::Ready if record.is_blocked() => {
            let cleared = std::mem::take(&mut record.blocked_by);
            info!(item = %item, cleared = ?cleared, "Dependencies completed, unblocking");
            let tracker = orchestrator.tracker();
            for dep in cleared {
                let body = notices::unblocked(dep);
                orchestrator
                    .tracker_retry()
                    .run(cancel, || tracker.create_comment(&item.repo, item.number, &body))
                    .await?;
            }
            orchestrator.persist_record(item, record, cancel).await?;
        }
        _ => {}
    }
    Ok(verdict)
}

async fn detect_dependencies(
    orchestrator: &Orchestrator,
    detector: &DependencyDetector,
    item: &WorkItem,
    issue: &Issue,
    cancel: &CancellationToken,
) -> Result<BTreeSet<u64>, OrchestratorError> {
    if DependencyDetector::has_override(issue) {
        return Ok(BTreeSet::new());
    }
    let comments = orchestrator.comments(item, cancel).await?;
    Ok(detector.detect(issue, &comments))
}

/// Phases for dependencies `known` does not cover, read from their labels.
/// Lookups that fail leave the dependency out, which counts as not completed.
async fn dependency_phases(
    orchestrator: &Orchestrator,
    repo: &str,
    wanted: &BTreeSet<u64>,
    known: &HashMap<u64, Phase>,
    cancel: &CancellationToken,
) -> Result<HashMap<u64, Phase>, OrchestratorError> {
    let tracker = orchestrator.tracker();
    let mut phases = HashMap::new();
    for &dep in wanted.iter().filter(|n| !known.contains_key(n)) {
        match orchestrator
            .tracker_retry()
            .run(cancel, || tracker.get_issue(repo, dep))
            .await
        {
            Ok(issue) => {
                phases.insert(dep, phase_from_labels(&issue.labels));
            }
            Err(RetryError::Cancelled) => return Err(OrchestratorError::Cancelled),
            Err(e) => debug!(repo = %repo, issue = dep, error = %e, "Dependency lookup failed"),
        }
    }
    Ok(phases)
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};

    use async_trait::async_trait;

    use super::*;
    use crate::agent::{Agent, AgentRequest, AgentResponse};
    use crate::errors::AgentError;
    use crate::orchestrator::tests::{REPO, ScriptedAgent, fast_retry, test_config};
    use crate::tracker::InMemoryTracker;

    fn issue(number: u64, body: &str, labels: &[&str]) -> Issue {
        Issue {
            number,
            title: format!("Issue {}", number),
            body: body.to_string(),
            labels: labels.iter().map(|l| l.to_string()).collect(),
            state: "open".into(),
            ..Issue::default()
        }
    }

    struct Setup {
        _root: tempfile::TempDir,
        tracker: Arc<InMemoryTracker>,
        daemon: Daemon,
    }

    fn setup(agent: Arc<dyn Agent>, issues: Vec<Issue>) -> Setup {
        let root = tempfile::tempdir().unwrap();
        let mut config = test_config(root.path());
        config.concurrency.max_per_repo = 2;
        let tracker = Arc::new(InMemoryTracker::new());
        for issue in issues {
            tracker.add_issue(REPO, issue);
        }
        let orchestrator = Orchestrator::new(Arc::new(config), tracker.clone(), agent)
            .with_retry(fast_retry(), fast_retry());
        let daemon = Daemon::new(Arc::new(orchestrator), vec![REPO.to_string()]);
        Setup {
            _root: root,
            tracker,
            daemon,
        }
    }

    async fn settle(daemon: &Daemon) {
        for _ in 0..500 {
            daemon.drain_results();
            if daemon.active_jobs() == 0 {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("jobs did not finish");
    }

    fn comments_containing(tracker: &InMemoryTracker, number: u64, needle: &str) -> usize {
        tracker
            .comments(REPO, number)
            .iter()
            .filter(|c| c.body.contains(needle))
            .count()
    }

    #[tokio::test]
    async fn test_blocked_item_waits_for_dependency() {
        let s = setup(
            Arc::new(ScriptedAgent::new(&[])),
            vec![
                issue(1, "Base work", &["ai-implement", "phase:approval"]),
                issue(2, "This depends on #1", &["ai-implement"]),
            ],
        );
        let cancel = CancellationToken::new();

        let first = s.daemon.poll(&cancel).await.unwrap();
        assert_eq!(first.submitted, 1);
        assert_eq!(first.blocked, 1);
        settle(&s.daemon).await;
        let blocked = s.daemon.tracked(&WorkItem::new(REPO, 2)).unwrap();
        assert_eq!(blocked.phase(), Phase::New);
        assert_eq!(blocked.blocked_by, BTreeSet::from([1]));

        s.tracker.set_labels(REPO, 1, &["ai-implement", "phase:completed"]);
        let second = s.daemon.poll(&cancel).await.unwrap();
        assert_eq!(second.submitted, 1);
        settle(&s.daemon).await;

        let record = s.daemon.tracked(&WorkItem::new(REPO, 2)).unwrap();
        assert_eq!(record.phase(), Phase::Approval);
        assert!(record.blocked_by.is_empty());
        assert_eq!(comments_containing(&s.tracker, 2, "Dependency #1 completed"), 1);
    }

    #[tokio::test]
    async fn test_cycle_fails_every_member() {
        let s = setup(
            Arc::new(ScriptedAgent::new(&[])),
            vec![
                issue(1, "Depends on #2", &["ai-implement"]),
                issue(2, "Depends on #1", &["ai-implement"]),
            ],
        );
        let summary = s.daemon.poll(&CancellationToken::new()).await.unwrap();
        assert_eq!(summary.failed, 2);
        assert_eq!(summary.submitted, 0);

        for n in [1, 2] {
            let record = s.daemon.tracked(&WorkItem::new(REPO, n)).unwrap();
            assert_eq!(record.phase(), Phase::Failed);
            assert_eq!(record.failure_reason, Some(FailureReason::DependencyCycle));
            assert!(s.tracker.labels(REPO, n).contains(&"phase:failed".to_string()));
            assert_eq!(comments_containing(&s.tracker, n, "**Blocked:**"), 1);
            assert!(comments_containing(&s.tracker, n, "#1 -> #2 -> #1") >= 1);
        }
    }

    #[tokio::test]
    async fn test_failed_dependency_fails_dependent() {
        let s = setup(
            Arc::new(ScriptedAgent::new(&[])),
            vec![
                issue(1, "Base work", &["ai-implement", "phase:failed"]),
                issue(2, "Requires #1", &["ai-implement"]),
            ],
        );
        let summary = s.daemon.poll(&CancellationToken::new()).await.unwrap();
        assert_eq!(summary.failed, 1);

        let record = s.daemon.tracked(&WorkItem::new(REPO, 2)).unwrap();
        assert_eq!(record.failure_reason, Some(FailureReason::DependencyFailed));
        assert_eq!(comments_containing(&s.tracker, 2, "**Blocked:** Dependency #1 failed"), 1);
    }

    #[tokio::test]
    async fn test_aborted_items_are_skipped() {
        let s = setup(
            Arc::new(ScriptedAgent::new(&[])),
            vec![issue(1, "Anything", &["ai-implement", "abort", "phase:failed"])],
        );
        let summary = s.daemon.poll(&CancellationToken::new()).await.unwrap();
        assert_eq!(summary, PollSummary::default());
        assert!(s.daemon.tracked(&WorkItem::new(REPO, 1)).is_none());
    }

    #[tokio::test]
    async fn test_running_item_is_not_resubmitted() {
        let agent = Arc::new(HangingAgent::default());
        let s = setup(agent.clone(), vec![issue(1, "Slow one", &["ai-implement"])]);
        let cancel = CancellationToken::new();

        assert_eq!(s.daemon.poll(&cancel).await.unwrap().submitted, 1);
        agent.wait_started().await;
        let again = s.daemon.poll(&cancel).await.unwrap();
        assert_eq!(again.seen, 0);
        assert_eq!(again.submitted, 0);
        assert_eq!(s.daemon.active_jobs(), 1);
        s.daemon.shutdown(Duration::from_millis(50)).await;
    }

    #[derive(Default)]
    struct HangingAgent {
        started: AtomicBool,
    }

    impl HangingAgent {
        async fn wait_started(&self) {
            for _ in 0..500 {
                if self.started.load(Ordering::SeqCst) {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
            panic!("agent never started");
        }
    }

    #[async_trait]
    impl Agent for HangingAgent {
        async fn run(
            &self,
            _request: &AgentRequest,
            cancel: &CancellationToken,
        ) -> Result<AgentResponse, AgentError> {
            self.started.store(true, Ordering::SeqCst);
            cancel.cancelled().await;
            Err(AgentError::Cancelled)
        }
    }

    #[tokio::test]
    async fn test_shutdown_saves_in_flight_state() {
        let agent = Arc::new(HangingAgent::default());
        let s = setup(agent.clone(), vec![issue(1, "Slow one", &["ai-implement"])]);
        s.daemon.poll(&CancellationToken::new()).await.unwrap();
        agent.wait_started().await;

        let drained = s.daemon.shutdown(Duration::from_millis(100)).await;
        assert!(!drained);
        assert_eq!(comments_containing(&s.tracker, 1, "State saved during shutdown"), 1);

        let record = s.daemon.tracked(&WorkItem::new(REPO, 1)).unwrap();
        assert_eq!(record.phase(), Phase::New);
        assert!(!s.tracker.labels(REPO, 1).contains(&"phase:failed".to_string()));
        assert_eq!(s.daemon.active_jobs(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_saving_and_draining_share_one_deadline() {
        let agent = Arc::new(HangingAgent::default());
        let s = setup(agent.clone(), vec![issue(1, "Slow one", &["ai-implement"])]);
        s.daemon.poll(&CancellationToken::new()).await.unwrap();
        agent.wait_started().await;
        s.tracker.delay_comments(Duration::from_secs(60));

        let started = tokio::time::Instant::now();
        let drained = s.daemon.shutdown(Duration::from_secs(10)).await;
        assert!(!drained);
        assert!(started.elapsed() < Duration::from_secs(15));
        assert_eq!(s.daemon.active_jobs(), 0);
    }

    #[tokio::test]
    async fn test_run_once_reports_blocked_item() {
        let s = setup(
            Arc::new(ScriptedAgent::new(&[])),
            vec![issue(7, "Waiting for #3", &["ai-implement"])],
        );
        let orchestrator = s.daemon.orchestrator.clone();
        let result = run_once(&orchestrator, &WorkItem::new(REPO, 7), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(result.status, JobStatus::Waiting);
        assert_eq!(result.record.phase(), Phase::New);
        assert_eq!(result.record.blocked_by, BTreeSet::from([3]));
    }

    #[tokio::test]
    async fn test_run_once_drives_ready_item() {
        let s = setup(
            Arc::new(ScriptedAgent::new(&[])),
            vec![issue(7, "Add a login page", &["ai-implement"])],
        );
        let orchestrator = s.daemon.orchestrator.clone();
        let result = run_once(&orchestrator, &WorkItem::new(REPO, 7), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(result.status, JobStatus::Waiting);
        assert_eq!(result.record.phase(), Phase::Approval);
        assert_eq!(result.record.depends_on, Some(BTreeSet::new()));
    }
}
