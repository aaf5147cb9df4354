//! In-process broker backend.
//!
//! Same semantics as the Redis backend, scoped to one process: used by the
//! test suite and by `work --broker memory` for single-machine runs.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Notify;

use super::{
    AckOutcome, Broker, BrokerError, FailedJob, Job, JobSpec, Result, FAILED_RETENTION, WORKER_TTL,
};

#[derive(Debug, Clone, PartialEq, Eq)]
enum JobState {
    Pending,
    Deferred,
    Scheduled,
    Started { deadline: DateTime<Utc> },
    Done,
    Failed,
    Cancelled,
}

struct JobEntry {
    job: Job,
    state: JobState,
    timeout: Duration,
    not_before: Option<DateTime<Utc>>,
    remaining_deps: HashSet<String>,
    dependents: HashSet<String>,
    error: Option<String>,
    failed_at: Option<DateTime<Utc>>,
}

#[derive(Default)]
struct Inner {
    queues: HashMap<String, VecDeque<String>>,
    jobs: HashMap<String, JobEntry>,
    workers: HashMap<String, (String, DateTime<Utc>)>,
}

impl Inner {
    /// Promote due scheduled jobs and recycle expired deliveries.
    fn tick(&mut self, now: DateTime<Utc>) {
        let due: Vec<String> = self
            .jobs
            .iter()
            .filter(|(_, e)| {
                e.state == JobState::Scheduled && e.not_before.map(|t| t <= now).unwrap_or(true)
            })
            .map(|(id, _)| id.clone())
            .collect();
        for id in due {
            self.make_pending(&id);
        }

        let expired: Vec<String> = self
            .jobs
            .iter()
            .filter(|(_, e)| matches!(e.state, JobState::Started { deadline } if deadline <= now))
            .map(|(id, _)| id.clone())
            .collect();
        for id in expired {
            let exhausted = {
                let entry = match self.jobs.get(&id) {
                    Some(e) => e,
                    None => continue,
                };
                entry.job.attempt >= entry.job.max_attempts
            };
            if exhausted {
                self.finish(&id, JobState::Failed, Some("delivery timed out".to_string()), now);
            } else {
                self.make_pending(&id);
            }
        }

        // Failed-registry retention
        let cutoff = now - chrono::Duration::from_std(FAILED_RETENTION).unwrap_or_else(|_| chrono::Duration::zero());
        let stale: Vec<String> = self
            .jobs
            .iter()
            .filter(|(_, e)| {
                e.state == JobState::Failed && e.failed_at.map(|t| t < cutoff).unwrap_or(false)
            })
            .map(|(id, _)| id.clone())
            .collect();
        for id in stale {
            self.jobs.remove(&id);
        }
    }

    fn make_pending(&mut self, id: &str) {
        if let Some(entry) = self.jobs.get_mut(id) {
            entry.state = JobState::Pending;
            self.queues
                .entry(entry.job.queue.clone())
                .or_default()
                .push_back(id.to_string());
        }
    }

    /// Terminate a job and unblock its dependents. Done and cancelled
    /// records are dropped; failed records stay for the retention window.
    fn finish(
        &mut self,
        id: &str,
        state: JobState,
        error: Option<String>,
        now: DateTime<Utc>,
    ) {
        let dependents = match self.jobs.get_mut(id) {
            Some(entry) => {
                entry.state = state.clone();
                entry.error = error;
                if state == JobState::Failed {
                    entry.failed_at = Some(now);
                }
                std::mem::take(&mut entry.dependents)
            }
            None => HashSet::new(),
        };
        if state != JobState::Failed {
            self.jobs.remove(id);
        }
        for dep_id in dependents {
            let promote = match self.jobs.get_mut(&dep_id) {
                Some(dep) => {
                    dep.remaining_deps.remove(id);
                    dep.state == JobState::Deferred && dep.remaining_deps.is_empty()
                }
                None => false,
            };
            if promote {
                let ready_later = self
                    .jobs
                    .get(&dep_id)
                    .and_then(|d| d.not_before)
                    .map(|t| t > now)
                    .unwrap_or(false);
                if ready_later {
                    if let Some(dep) = self.jobs.get_mut(&dep_id) {
                        dep.state = JobState::Scheduled;
                    }
                } else {
                    self.make_pending(&dep_id);
                }
            }
        }
    }

    fn remove_from_queue(&mut self, queue: &str, id: &str) {
        if let Some(q) = self.queues.get_mut(queue) {
            q.retain(|queued| queued != id);
        }
    }
}

/// Single-process broker with the full queue contract.
pub struct MemoryBroker {
    inner: Mutex<Inner>,
    notify: Notify,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            notify: Notify::new(),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        // Lock poisoning only happens if a holder panicked; propagating the
        // inner state is still sound for a queue.
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn enqueue(&self, spec: JobSpec) -> Result<String> {
        let now = Utc::now();
        let id = spec.id.clone();
        {
            let mut inner = self.lock();
            if inner.jobs.contains_key(&id) {
                return Err(BrokerError::Other(format!("duplicate job id {id}")));
            }

            let remaining: HashSet<String> = spec
                .opts
                .depends_on
                .iter()
                .filter(|dep| {
                    inner
                        .jobs
                        .get(*dep)
                        .map(|e| {
                            !matches!(
                                e.state,
                                JobState::Failed | JobState::Cancelled
                            )
                        })
                        .unwrap_or(false)
                })
                .cloned()
                .collect();

            let job = Job {
                id: id.clone(),
                queue: spec.queue.clone(),
                payload: spec.payload,
                priority: spec.opts.priority,
                attempt: 0,
                max_attempts: spec.opts.max_attempts,
                created_at: now,
            };
            let state = if !remaining.is_empty() {
                JobState::Deferred
            } else if spec.opts.not_before.map(|t| t > now).unwrap_or(false) {
                JobState::Scheduled
            } else {
                JobState::Pending
            };

            for dep in &remaining {
                if let Some(entry) = inner.jobs.get_mut(dep) {
                    entry.dependents.insert(id.clone());
                }
            }
            let pending = state == JobState::Pending;
            inner.jobs.insert(
                id.clone(),
                JobEntry {
                    job,
                    state,
                    timeout: spec.opts.timeout,
                    not_before: spec.opts.not_before,
                    remaining_deps: remaining,
                    dependents: HashSet::new(),
                    error: None,
                    failed_at: None,
                },
            );
            if pending {
                inner
                    .queues
                    .entry(spec.queue)
                    .or_default()
                    .push_back(id.clone());
            }
        }
        self.notify.notify_waiters();
        Ok(id)
    }

    async fn reserve(&self, queues: &[&str], wait: Duration) -> Result<Option<Job>> {
        let deadline = tokio::time::Instant::now() + wait;
        loop {
            {
                let now = Utc::now();
                let mut inner = self.lock();
                inner.tick(now);
                for queue in queues {
                    // Skip over ids whose records were cancelled away
                    while let Some(id) = inner.queues.get_mut(*queue).and_then(|q| q.pop_front()) {
                        if let Some(entry) = inner.jobs.get_mut(&id) {
                            entry.job.attempt += 1;
                            entry.state = JobState::Started {
                                deadline: now
                                    + chrono::Duration::from_std(entry.timeout)
                                        .unwrap_or(chrono::Duration::seconds(600)),
                            };
                            return Ok(Some(entry.job.clone()));
                        }
                    }
                }
            }
            // Short poll slices double as the timer for scheduled promotion
            // and delivery expiry.
            let now = tokio::time::Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            let slice = Duration::from_millis(25).min(deadline - now);
            let _ = tokio::time::timeout(slice, self.notify.notified()).await;
        }
    }

    async fn ack(&self, job_id: &str, outcome: AckOutcome) -> Result<()> {
        {
            let now = Utc::now();
            let mut inner = self.lock();
            let known_started = matches!(
                inner.jobs.get(job_id).map(|e| &e.state),
                Some(JobState::Started { .. })
            );
            if !known_started {
                // Cancelled or already recycled: the worker's outcome no
                // longer matters.
                return Ok(());
            }
            match outcome {
                AckOutcome::Done => {
                    inner.finish(job_id, JobState::Done, None, now);
                }
                AckOutcome::Failed(error) => {
                    inner.finish(job_id, JobState::Failed, Some(error), now);
                }
            }
        }
        self.notify.notify_waiters();
        Ok(())
    }

    async fn cancel(&self, job_id: &str) -> Result<bool> {
        let existed = {
            let now = Utc::now();
            let mut inner = self.lock();
            match inner.jobs.get(job_id) {
                Some(entry) => {
                    let queue = entry.job.queue.clone();
                    inner.remove_from_queue(&queue, job_id);
                    inner.finish(job_id, JobState::Cancelled, None, now);
                    inner.jobs.remove(job_id);
                    true
                }
                None => false,
            }
        };
        self.notify.notify_waiters();
        Ok(existed)
    }

    async fn purge_queue(&self, queue: &str) -> Result<u64> {
        let ids: Vec<String> = {
            let mut inner = self.lock();
            inner
                .queues
                .get_mut(queue)
                .map(|q| q.drain(..).collect())
                .unwrap_or_default()
        };
        let count = ids.len() as u64;
        for id in ids {
            let now = Utc::now();
            let mut inner = self.lock();
            inner.finish(&id, JobState::Cancelled, None, now);
            inner.jobs.remove(&id);
        }
        Ok(count)
    }

    async fn depth(&self, queue: &str) -> Result<u64> {
        let inner = self.lock();
        Ok(inner.queues.get(queue).map(|q| q.len() as u64).unwrap_or(0))
    }

    async fn failed_jobs(&self, limit: usize) -> Result<Vec<FailedJob>> {
        let inner = self.lock();
        let mut failed: Vec<FailedJob> = inner
            .jobs
            .values()
            .filter(|e| e.state == JobState::Failed)
            .map(|e| FailedJob {
                job: e.job.clone(),
                error: e.error.clone().unwrap_or_default(),
                failed_at: e.failed_at.unwrap_or(e.job.created_at),
            })
            .collect();
        failed.sort_by(|a, b| b.failed_at.cmp(&a.failed_at));
        failed.truncate(limit);
        Ok(failed)
    }

    async fn heartbeat_worker(&self, worker_id: &str, stage: &str) -> Result<()> {
        let mut inner = self.lock();
        inner
            .workers
            .insert(worker_id.to_string(), (stage.to_string(), Utc::now()));
        Ok(())
    }

    async fn active_worker_counts(&self) -> Result<HashMap<String, u64>> {
        let cutoff = Utc::now() - chrono::Duration::from_std(WORKER_TTL).unwrap_or_else(|_| chrono::Duration::zero());
        let inner = self.lock();
        let mut counts = HashMap::new();
        for (stage, seen) in inner.workers.values() {
            if *seen >= cutoff {
                *counts.entry(stage.clone()).or_insert(0) += 1;
            }
        }
        Ok(counts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{JobPayload, Priority};

    fn fetch_spec(queue: &str, site: &str) -> JobSpec {
        JobSpec::new(
            queue,
            JobPayload::FetchSite {
                subdomain: site.to_string(),
            },
        )
    }

    #[tokio::test]
    async fn test_fifo_within_queue() {
        let broker = MemoryBroker::new();
        let a = broker.enqueue(fetch_spec("fetch", "a.example")).await.unwrap();
        let b = broker.enqueue(fetch_spec("fetch", "b.example")).await.unwrap();

        let first = broker
            .reserve(&["fetch"], Duration::from_millis(10))
            .await
            .unwrap()
            .unwrap();
        let second = broker
            .reserve(&["fetch"], Duration::from_millis(10))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(first.id, a);
        assert_eq!(second.id, b);
        assert_eq!(first.attempt, 1);
    }

    #[tokio::test]
    async fn test_high_band_listed_first_wins() {
        let broker = MemoryBroker::new();
        for i in 0..20 {
            broker
                .enqueue(fetch_spec("fetch", &format!("site{i}.example")))
                .await
                .unwrap();
        }
        let urgent = broker
            .enqueue(fetch_spec("high", "urgent.example").with_priority(Priority::High))
            .await
            .unwrap();

        let job = broker
            .reserve(&["high", "fetch"], Duration::from_millis(10))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(job.id, urgent);
    }

    #[tokio::test]
    async fn test_reserve_empty_times_out() {
        let broker = MemoryBroker::new();
        let job = broker
            .reserve(&["fetch"], Duration::from_millis(20))
            .await
            .unwrap();
        assert!(job.is_none());
    }

    #[tokio::test]
    async fn test_dependencies_defer_until_all_terminate() {
        let broker = MemoryBroker::new();
        let dep1 = broker.enqueue(fetch_spec("ocr", "a.example")).await.unwrap();
        let dep2 = broker.enqueue(fetch_spec("ocr", "a.example")).await.unwrap();
        broker
            .enqueue(
                fetch_spec("compilation", "a.example")
                    .with_depends_on(vec![dep1.clone(), dep2.clone()]),
            )
            .await
            .unwrap();

        assert!(broker
            .reserve(&["compilation"], Duration::from_millis(10))
            .await
            .unwrap()
            .is_none());

        let j1 = broker
            .reserve(&["ocr"], Duration::from_millis(10))
            .await
            .unwrap()
            .unwrap();
        broker.ack(&j1.id, AckOutcome::Done).await.unwrap();
        assert!(broker
            .reserve(&["compilation"], Duration::from_millis(10))
            .await
            .unwrap()
            .is_none());

        // Failure also unblocks: dependents wait for termination, not success
        let j2 = broker
            .reserve(&["ocr"], Duration::from_millis(10))
            .await
            .unwrap()
            .unwrap();
        broker
            .ack(&j2.id, AckOutcome::Failed("engine refused".into()))
            .await
            .unwrap();

        let coord = broker
            .reserve(&["compilation"], Duration::from_millis(50))
            .await
            .unwrap();
        assert!(coord.is_some());
    }

    #[tokio::test]
    async fn test_unknown_dependency_counts_as_terminated() {
        let broker = MemoryBroker::new();
        broker
            .enqueue(fetch_spec("fetch", "a.example").with_depends_on(vec!["ghost".into()]))
            .await
            .unwrap();
        assert!(broker
            .reserve(&["fetch"], Duration::from_millis(10))
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn test_not_before_delays_delivery() {
        let broker = MemoryBroker::new();
        broker
            .enqueue(
                fetch_spec("fetch", "a.example")
                    .with_not_before(Utc::now() + chrono::Duration::milliseconds(50)),
            )
            .await
            .unwrap();

        assert!(broker
            .reserve(&["fetch"], Duration::from_millis(5))
            .await
            .unwrap()
            .is_none());

        std::thread::sleep(Duration::from_millis(60));
        assert!(broker
            .reserve(&["fetch"], Duration::from_millis(5))
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn test_timeout_requeues_then_fails() {
        let broker = MemoryBroker::new();
        broker
            .enqueue(
                fetch_spec("ocr", "a.example")
                    .with_timeout(Duration::from_millis(5))
                    .with_max_attempts(2),
            )
            .await
            .unwrap();

        // First delivery expires
        let j1 = broker
            .reserve(&["ocr"], Duration::from_millis(10))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(j1.attempt, 1);
        std::thread::sleep(Duration::from_millis(10));

        // Redelivered with a bumped attempt
        let j2 = broker
            .reserve(&["ocr"], Duration::from_millis(50))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(j2.id, j1.id);
        assert_eq!(j2.attempt, 2);
        std::thread::sleep(Duration::from_millis(10));

        // Attempts exhausted: lands in the failed registry
        assert!(broker
            .reserve(&["ocr"], Duration::from_millis(50))
            .await
            .unwrap()
            .is_none());
        let failed = broker.failed_jobs(10).await.unwrap();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].job.id, j1.id);
        assert!(failed[0].error.contains("timed out"));
    }

    #[tokio::test]
    async fn test_ack_after_cancel_is_noop() {
        let broker = MemoryBroker::new();
        let id = broker.enqueue(fetch_spec("fetch", "a.example")).await.unwrap();
        let job = broker
            .reserve(&["fetch"], Duration::from_millis(10))
            .await
            .unwrap()
            .unwrap();
        assert!(broker.cancel(&id).await.unwrap());
        broker.ack(&job.id, AckOutcome::Done).await.unwrap();
        assert_eq!(broker.depth("fetch").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_cancel_unblocks_dependents() {
        let broker = MemoryBroker::new();
        let dep = broker.enqueue(fetch_spec("ocr", "a.example")).await.unwrap();
        broker
            .enqueue(fetch_spec("compilation", "a.example").with_depends_on(vec![dep.clone()]))
            .await
            .unwrap();

        broker.cancel(&dep).await.unwrap();
        assert!(broker
            .reserve(&["compilation"], Duration::from_millis(50))
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn test_purge_queue() {
        let broker = MemoryBroker::new();
        for i in 0..5 {
            broker
                .enqueue(fetch_spec("fetch", &format!("s{i}.example")))
                .await
                .unwrap();
        }
        assert_eq!(broker.purge_queue("fetch").await.unwrap(), 5);
        assert_eq!(broker.depth("fetch").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_worker_registry() {
        let broker = MemoryBroker::new();
        broker.heartbeat_worker("w1", "ocr").await.unwrap();
        broker.heartbeat_worker("w2", "ocr").await.unwrap();
        broker.heartbeat_worker("w3", "fetch").await.unwrap();
        let counts = broker.active_worker_counts().await.unwrap();
        assert_eq!(counts.get("ocr"), Some(&2));
        assert_eq!(counts.get("fetch"), Some(&1));
    }
}
