//! Bounded concurrent execution of jobs.
//!
//! ## Architecture
//!
//! ```text
//! daemon ──try_submit──▶ [limits check under one mutex] ──▶ queue ──▶ worker 1..=max_total
//!    ▲                                                                    │
//!    └── on_job_complete ◀── next_result / try_next_result ◀── results ◀──┘
//! ```
//!
//! Admission checks both limits and reserves a slot atomically. The slot is
//! released by [`WorkerPool::on_job_complete`], which the caller invokes once
//! per drained result. Rejection is not an error: the caller offers the item
//! again on a later poll. The pool never retries a job itself.

pub mod job;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub use job::{ActiveStates, Job, JobResult, JobRunner, JobStatus};

/// Concurrency limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolLimits {
    pub max_per_group: usize,
    pub max_total: usize,
}

impl PoolLimits {
    pub fn new(max_per_group: usize, max_total: usize) -> Self {
        Self {
            max_per_group,
            max_total,
        }
    }
}

#[derive(Debug, Default)]
struct Counters {
    by_group: HashMap<String, usize>,
    total: usize,
    accepting: bool,
}

/// Fixed set of workers pulling jobs from one queue.
pub struct WorkerPool {
    limits: PoolLimits,
    counters: Mutex<Counters>,
    queue: Mutex<Option<mpsc::Sender<Job>>>,
    results: tokio::sync::Mutex<mpsc::UnboundedReceiver<JobResult>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    states: ActiveStates,
    cancel: CancellationToken,
}

impl WorkerPool {
    /// Start `limits.max_total` workers (at least one) running jobs through `runner`.
    ///
    /// Must be called inside a Tokio runtime.
    pub fn start(limits: PoolLimits, runner: Arc<dyn JobRunner>) -> Self {
        let worker_count = limits.max_total.max(1);
        let (queue_tx, queue_rx) = mpsc::channel::<Job>(worker_count);
        let (results_tx, results_rx) = mpsc::unbounded_channel();
        let queue_rx = Arc::new(tokio::sync::Mutex::new(queue_rx));
        let states = ActiveStates::new();
        let cancel = CancellationToken::new();

        let workers = (0..worker_count)
            .map(|id| {
                tokio::spawn(worker_loop(
                    id,
                    queue_rx.clone(),
                    results_tx.clone(),
                    runner.clone(),
                    states.clone(),
                    cancel.clone(),
                ))
            })
            .collect();

        Self {
            limits,
            counters: Mutex::new(Counters {
                accepting: true,
                ..Counters::default()
            }),
            queue: Mutex::new(Some(queue_tx)),
            results: tokio::sync::Mutex::new(results_rx),
            workers: Mutex::new(workers),
            states,
            cancel,
        }
    }

    fn counters(&self) -> std::sync::MutexGuard<'_, Counters> {
        self.counters.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn limits(&self) -> PoolLimits {
        self.limits
    }

    /// Admit `job` if the pool is accepting and both limits have room.
    ///
    /// Returns whether the job was queued.
    pub fn try_submit(&self, job: Job) -> bool {
        let mut counters = self.counters();
        if !counters.accepting {
            return false;
        }
        if counters.total >= self.limits.max_total {
            return false;
        }
        let group = job.group().to_string();
        let in_group = counters.by_group.get(&group).copied().unwrap_or(0);
        if in_group >= self.limits.max_per_group {
            return false;
        }

        let sent = {
            let queue = self.queue.lock().unwrap_or_else(|e| e.into_inner());
            match queue.as_ref() {
                Some(tx) => tx.try_send(job).is_ok(),
                None => false,
            }
        };
        if !sent {
            return false;
        }
        counters.total += 1;
        *counters.by_group.entry(group).or_default() += 1;
        true
    }

    /// Release the slot held by a finished job of `group`.
    pub fn on_job_complete(&self, group: &str) {
        let mut counters = self.counters();
        if let Some(n) = counters.by_group.get_mut(group) {
            *n = n.saturating_sub(1);
            if *n == 0 {
                counters.by_group.remove(group);
            }
        }
        counters.total = counters.total.saturating_sub(1);
    }

    pub fn active_count(&self) -> usize {
        self.counters().total
    }

    pub fn active_count_for(&self, group: &str) -> usize {
        self.counters().by_group.get(group).copied().unwrap_or(0)
    }

    pub fn is_accepting(&self) -> bool {
        self.counters().accepting
    }

    pub fn stop_accepting(&self) {
        self.counters().accepting = false;
    }

    /// In-flight record snapshots.
    pub fn active_states(&self) -> &ActiveStates {
        &self.states
    }

    /// A finished job, if one is waiting and no one is blocked in [`Self::next_result`].
    pub fn try_next_result(&self) -> Option<JobResult> {
        self.results.try_lock().ok()?.try_recv().ok()
    }

    /// Wait up to `timeout` for a finished job.
    pub async fn next_result(&self, timeout: Duration) -> Option<JobResult> {
        let mut results = self.results.lock().await;
        tokio::time::timeout(timeout, results.recv())
            .await
            .ok()
            .flatten()
    }

    /// Stop accepting, close the queue, and wait up to `grace` for running jobs.
    ///
    /// Jobs still running at the deadline are cancelled. Returns whether every
    /// worker finished within the grace period.
    pub async fn shutdown(&self, grace: Duration) -> bool {
        self.stop_accepting();
        self.queue.lock().unwrap_or_else(|e| e.into_inner()).take();

        let mut handles: Vec<JoinHandle<()>> =
            std::mem::take(&mut *self.workers.lock().unwrap_or_else(|e| e.into_inner()));

        let drained = tokio::time::timeout(grace, async {
            for handle in handles.iter_mut() {
                let _ = handle.await;
            }
        })
        .await
        .is_ok();

        if !drained {
            warn!(
                active = self.states.len(),
                "Shutdown grace period expired, cancelling running jobs"
            );
            self.cancel.cancel();
            for handle in handles {
                if !handle.is_finished() {
                    let _ = handle.await;
                }
            }
        }
        self.cancel.cancel();
        info!(drained, "Worker pool stopped");
        drained
    }
}

async fn worker_loop(
    id: usize,
    queue: Arc<tokio::sync::Mutex<mpsc::Receiver<Job>>>,
    results: mpsc::UnboundedSender<JobResult>,
    runner: Arc<dyn JobRunner>,
    states: ActiveStates,
    cancel: CancellationToken,
) {
    loop {
        let job = {
            let mut rx = queue.lock().await;
            tokio::select! {
                _ = cancel.cancelled() => None,
                job = rx.recv() => job,
            }
        };
        let Some(job) = job else {
            debug!(worker = id, "Worker exiting");
            return;
        };

        let item = job.item.clone();
        states.register(&item, &job.record);
        debug!(worker = id, item = %item, "Worker picked up job");
        let result = runner.run(job, cancel.clone(), states.clone()).await;
        states.unregister(&item);

        if results.send(result).is_err() {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use tokio::sync::Semaphore;

    use super::*;
    use crate::state::ProgressRecord;
    use crate::tracker::{Issue, WorkItem};

    /// Holds each job until a permit is released; tracks peak concurrency.
    struct GatedRunner {
        gate: Arc<Semaphore>,
        running: AtomicUsize,
        peak: AtomicUsize,
    }

    impl GatedRunner {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                gate: Arc::new(Semaphore::new(0)),
                running: AtomicUsize::new(0),
                peak: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl JobRunner for GatedRunner {
        async fn run(&self, job: Job, cancel: CancellationToken, _states: ActiveStates) -> JobResult {
            let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            let status = tokio::select! {
                _ = cancel.cancelled() => JobStatus::Cancelled,
                permit = self.gate.acquire() => {
                    if let Ok(permit) = permit {
                        permit.forget();
                    }
                    JobStatus::Waiting
                }
            };
            self.running.fetch_sub(1, Ordering::SeqCst);
            JobResult::new(job.item, job.record, status)
        }
    }

    fn job(repo: &str, number: u64) -> Job {
        Job::new(
            WorkItem::new(repo, number),
            Issue {
                number,
                ..Issue::default()
            },
            ProgressRecord::new(),
        )
    }

    async fn wait_running(runner: &GatedRunner, n: usize) {
        for _ in 0..200 {
            if runner.running.load(Ordering::SeqCst) == n {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("expected {} running jobs", n);
    }

    #[tokio::test]
    async fn test_per_group_limit() {
        let runner = GatedRunner::new();
        let pool = WorkerPool::start(PoolLimits::new(2, 5), runner.clone());

        assert!(pool.try_submit(job("a/x", 1)));
        assert!(pool.try_submit(job("a/x", 2)));
        assert!(!pool.try_submit(job("a/x", 3)));
        assert!(pool.try_submit(job("b/y", 4)));
        assert_eq!(pool.active_count_for("a/x"), 2);
        assert_eq!(pool.active_count(), 3);

        wait_running(&runner, 3).await;
        assert!(runner.peak.load(Ordering::SeqCst) <= 3);

        runner.gate.add_permits(3);
        for _ in 0..3 {
            let result = pool.next_result(Duration::from_secs(2)).await.unwrap();
            assert_eq!(result.status, JobStatus::Waiting);
            pool.on_job_complete(&result.item.repo);
        }
        assert_eq!(pool.active_count(), 0);
        assert!(pool.try_submit(job("a/x", 3)));
        runner.gate.add_permits(1);
        assert!(pool.shutdown(Duration::from_secs(2)).await);
    }

    #[tokio::test]
    async fn test_total_limit_across_groups() {
        let runner = GatedRunner::new();
        let pool = WorkerPool::start(PoolLimits::new(1, 3), runner.clone());

        let accepted = (1..=6)
            .filter(|n| pool.try_submit(job(&format!("org/r{}", n), *n)))
            .count();
        assert_eq!(accepted, 3);
        wait_running(&runner, 3).await;
        assert_eq!(runner.peak.load(Ordering::SeqCst), 3);
        assert_eq!(pool.active_states().len(), 3);

        runner.gate.add_permits(3);
        assert!(pool.shutdown(Duration::from_secs(2)).await);
        assert!(pool.active_states().is_empty());
    }

    #[tokio::test]
    async fn test_slot_held_until_completion_reported() {
        let runner = GatedRunner::new();
        let pool = WorkerPool::start(PoolLimits::new(1, 1), runner.clone());
        runner.gate.add_permits(1);

        assert!(pool.try_submit(job("a/x", 1)));
        let result = pool.next_result(Duration::from_secs(2)).await.unwrap();
        assert_eq!(result.item.number, 1);
        assert!(!pool.try_submit(job("a/x", 2)));

        pool.on_job_complete("a/x");
        pool.on_job_complete("a/x");
        assert_eq!(pool.active_count(), 0);
        assert!(pool.shutdown(Duration::from_secs(1)).await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_next_result_times_out_when_idle() {
        let runner = GatedRunner::new();
        let pool = WorkerPool::start(PoolLimits::new(1, 1), runner.clone());
        assert!(pool.next_result(Duration::from_secs(30)).await.is_none());

        assert!(pool.try_submit(job("a/x", 1)));
        runner.gate.add_permits(1);
        let result = pool.next_result(Duration::from_secs(30)).await.unwrap();
        assert_eq!(result.item.number, 1);
        assert!(pool.try_next_result().is_none());
        assert!(pool.shutdown(Duration::from_secs(1)).await);
    }

    #[tokio::test]
    async fn test_shutdown_rejects_and_cancels_after_grace() {
        let runner = GatedRunner::new();
        let pool = WorkerPool::start(PoolLimits::new(1, 2), runner.clone());
        assert!(pool.try_submit(job("a/x", 1)));
        wait_running(&runner, 1).await;

        let drained = pool.shutdown(Duration::from_millis(50)).await;
        assert!(!drained);
        assert!(!pool.try_submit(job("b/y", 2)));

        let result = pool.next_result(Duration::from_secs(1)).await.unwrap();
        assert_eq!(result.status, JobStatus::Cancelled);
    }

    #[tokio::test]
    async fn test_concurrent_submitters_respect_limits() {
        let runner = GatedRunner::new();
        let pool = Arc::new(WorkerPool::start(PoolLimits::new(2, 4), runner.clone()));

        let mut handles = Vec::new();
        for n in 0..40u64 {
            let pool = pool.clone();
            handles.push(tokio::spawn(async move {
                pool.try_submit(job(&format!("g/{}", n % 3), n))
            }));
        }
        let mut accepted = 0;
        for handle in handles {
            if handle.await.unwrap() {
                accepted += 1;
            }
        }
        assert_eq!(accepted, 4);
        for g in 0..3 {
            assert!(pool.active_count_for(&format!("g/{}", g)) <= 2);
        }
        runner.gate.add_permits(4);
        assert!(pool.shutdown(Duration::from_secs(2)).await);
    }
}
