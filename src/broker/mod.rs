//! Job broker abstraction: durable FIFO queues with a high-priority band,
//! dependency deferral, delivery timeouts, and a failed-job registry.
//!
//! Two backends implement the same trait: `RedisBroker` for distributed
//! deployments and `MemoryBroker` for tests and single-process runs. The
//! pipeline is backend-agnostic; selection happens at boot.

mod memory;
mod redis;

pub use memory::MemoryBroker;
pub use redis::RedisBroker;

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::models::{JobPayload, Priority};

/// How long a failed job's record is retained for inspection.
pub const FAILED_RETENTION: Duration = Duration::from_secs(7 * 24 * 3600);
/// Worker heartbeats older than this no longer count as active.
pub const WORKER_TTL: Duration = Duration::from_secs(90);

#[derive(Error, Debug)]
pub enum BrokerError {
    #[error("Broker connection error: {0}")]
    Connection(String),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("Job not found: {0}")]
    NotFound(String),
    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, BrokerError>;

/// Options attached to an enqueue.
#[derive(Debug, Clone)]
pub struct EnqueueOptions {
    pub priority: Priority,
    /// Job ids that must terminate (done, failed, or cancelled) before this
    /// job becomes deliverable. Unknown ids count as already terminated.
    pub depends_on: Vec<String>,
    /// Maximum wall time per delivery; an expired job is redelivered.
    pub timeout: Duration,
    /// Deliveries before the job moves to the failed registry.
    pub max_attempts: u32,
    /// Earliest delivery time, for delayed re-enqueues.
    pub not_before: Option<DateTime<Utc>>,
}

impl Default for EnqueueOptions {
    fn default() -> Self {
        Self {
            priority: Priority::Normal,
            depends_on: Vec::new(),
            timeout: Duration::from_secs(10 * 60),
            max_attempts: 3,
            not_before: None,
        }
    }
}

/// A job to enqueue. Ids are minted by the producer so fan-out code can wire
/// `depends_on` before anything is enqueued.
#[derive(Debug, Clone)]
pub struct JobSpec {
    pub id: String,
    pub queue: String,
    pub payload: JobPayload,
    pub opts: EnqueueOptions,
}

impl JobSpec {
    pub fn new(queue: impl Into<String>, payload: JobPayload) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            queue: queue.into(),
            payload,
            opts: EnqueueOptions::default(),
        }
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.opts.priority = priority;
        self
    }

    pub fn with_depends_on(mut self, deps: Vec<String>) -> Self {
        self.opts.depends_on = deps;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.opts.timeout = timeout;
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.opts.max_attempts = max_attempts;
        self
    }

    pub fn with_not_before(mut self, at: DateTime<Utc>) -> Self {
        self.opts.not_before = Some(at);
        self
    }
}

/// A reserved job as delivered to a worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub queue: String,
    pub payload: JobPayload,
    pub priority: Priority,
    /// Delivery count, 1 on first reservation.
    pub attempt: u32,
    pub max_attempts: u32,
    pub created_at: DateTime<Utc>,
}

/// Terminal outcome reported by the worker holding a job.
#[derive(Debug, Clone)]
pub enum AckOutcome {
    Done,
    Failed(String),
}

/// A job in the failed registry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailedJob {
    pub job: Job,
    pub error: String,
    pub failed_at: DateTime<Utc>,
}

/// Durable job queue contract shared by all backends.
///
/// Guarantees:
/// - a job with unfinished dependencies is never delivered;
/// - at most one worker holds a job at a time; expired deliveries requeue
///   until `max_attempts`, then land in the failed registry;
/// - FIFO within a queue; no ordering across queues.
#[async_trait]
pub trait Broker: Send + Sync {
    async fn enqueue(&self, spec: JobSpec) -> Result<String>;

    /// Return the next runnable job across `queues`, scanned in the listed
    /// order (callers list the high band first). Blocks up to `wait`.
    async fn reserve(&self, queues: &[&str], wait: Duration) -> Result<Option<Job>>;

    /// Report a terminal outcome. Acking a job that was cancelled out from
    /// under the worker is a quiet no-op.
    async fn ack(&self, job_id: &str, outcome: AckOutcome) -> Result<()>;

    /// Remove a job wherever it currently lives. Dependents treat the
    /// cancelled job as terminated. Returns whether the job existed.
    async fn cancel(&self, job_id: &str) -> Result<bool>;

    /// Drop every pending job in a queue. Returns how many were removed.
    async fn purge_queue(&self, queue: &str) -> Result<u64>;

    /// Pending jobs in a queue (deferred and scheduled jobs not included).
    async fn depth(&self, queue: &str) -> Result<u64>;

    /// Most recent entries of the failed registry.
    async fn failed_jobs(&self, limit: usize) -> Result<Vec<FailedJob>>;

    /// Record a worker heartbeat for observability.
    async fn heartbeat_worker(&self, worker_id: &str, stage: &str) -> Result<()>;

    /// Active worker counts per stage, heartbeats within `WORKER_TTL`.
    async fn active_worker_counts(&self) -> Result<HashMap<String, u64>>;
}
