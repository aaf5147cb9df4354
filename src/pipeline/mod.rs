//! Pipeline core: stage operations, worker loops, coordinators, the
//! reconciler, and the scheduler.
//!
//! All of it runs against an explicit `PipelineEnv` built at boot (broker
//! handle, state store, capability table, storage layout) threaded through
//! every worker. Stage code returns follow-up job specs as values; the
//! worker loop performs the enqueues.

pub mod coordinator;
pub mod reconciler;
pub mod scheduler;
pub mod stages;
pub mod worker;

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

use crate::broker::{Broker, BrokerError, JobSpec};
use crate::config::Settings;
use crate::models::{JobPayload, Priority, Stage, HIGH_QUEUE};
use crate::plugins::{Capabilities, CapabilityError};
use crate::state::{PipelineStore, StateError};
use crate::storage::StorageLayout;

/// Queue coordinators ride: any machine with a compilation worker can
/// complete orchestration.
pub const COORDINATOR_QUEUE: &str = "compilation";

/// Delay before a coordinator's single re-check when it observes unsettled
/// counters.
pub const COORDINATOR_RECHECK_DELAY: Duration = Duration::from_secs(30);

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error(transparent)]
    State(#[from] StateError),
    #[error(transparent)]
    Broker(#[from] BrokerError),
    #[error(transparent)]
    Capability(#[from] CapabilityError),
    #[error("Unknown site: {0}")]
    UnknownSite(String),
}

pub type Result<T> = std::result::Result<T, PipelineError>;

/// Everything a worker needs, assembled once at startup.
#[derive(Clone)]
pub struct PipelineEnv {
    pub settings: Settings,
    pub store: PipelineStore,
    pub broker: Arc<dyn Broker>,
    pub caps: Capabilities,
    pub layout: StorageLayout,
    /// Identifies this worker process across logs and failure manifests.
    pub run_id: String,
}

impl PipelineEnv {
    pub fn new(
        settings: Settings,
        store: PipelineStore,
        broker: Arc<dyn Broker>,
        caps: Capabilities,
    ) -> Self {
        let layout = StorageLayout::new(settings.storage_dir.clone());
        Self {
            settings,
            store,
            broker,
            caps,
            layout,
            run_id: uuid::Uuid::new_v4().to_string(),
        }
    }

    /// Enqueue follow-up specs and record them in the tracking table.
    pub async fn enqueue_all(&self, specs: Vec<JobSpec>) -> Result<()> {
        for spec in specs {
            let subdomain = spec.payload.subdomain().to_string();
            let stage = spec.payload.stage();
            let id = spec.id.clone();
            self.broker.enqueue(spec).await?;
            self.store.track_jobs(&subdomain, stage, &[id])?;
        }
        Ok(())
    }

    /// Build the coordinator job spec for a settled stage. Callers must have
    /// won `claim_coordinator` first.
    pub fn coordinator_spec(&self, subdomain: &str, stage: Stage, priority: Priority) -> JobSpec {
        let queue = match priority {
            Priority::High => HIGH_QUEUE,
            Priority::Normal => COORDINATOR_QUEUE,
        };
        JobSpec::new(
            queue,
            JobPayload::StageCoordinator {
                subdomain: subdomain.to_string(),
                stage,
                retried: false,
            },
        )
        .with_priority(priority)
        .with_timeout(Duration::from_secs(5 * 60))
        .with_max_attempts(self.settings.max_attempts)
    }
}

/// Cancel every pending and running job for a site and reset its row.
/// In-flight workers notice via their conditional counter updates and stand
/// down without mutating state.
pub async fn purge_site(env: &PipelineEnv, subdomain: &str) -> Result<u64> {
    if env.store.get_site(subdomain)?.is_none() {
        return Err(PipelineError::UnknownSite(subdomain.to_string()));
    }
    let mut cancelled = 0u64;
    for (job_id, _stage) in env.store.jobs_for_site(subdomain)? {
        if env.broker.cancel(&job_id).await? {
            cancelled += 1;
        }
    }
    env.store.clear_tracking(subdomain)?;
    env.store.reset_site(subdomain)?;
    tracing::info!(site = subdomain, cancelled, "purged site");
    Ok(cancelled)
}

/// Retry middleware for collaborator calls: transient failures back off
/// exponentially, anything else propagates immediately.
pub async fn retry_transient<T, F, Fut>(label: &str, mut op: F) -> std::result::Result<T, CapabilityError>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = std::result::Result<T, CapabilityError>>,
{
    const ATTEMPTS: u32 = 3;
    let mut delay = Duration::from_millis(250);
    let mut attempt = 1;
    loop {
        match op().await {
            Err(CapabilityError::Transient(msg)) if attempt < ATTEMPTS => {
                tracing::warn!(
                    op = label,
                    attempt,
                    error = %msg,
                    "transient failure, retrying"
                );
                tokio::time::sleep(delay).await;
                delay *= 2;
                attempt += 1;
            }
            other => return other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn test_retry_transient_retries_then_succeeds() {
        let calls = AtomicU32::new(0);
        let result = retry_transient("test", || async {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            if n < 2 {
                Err(CapabilityError::Transient("flaky".into()))
            } else {
                Ok(n)
            }
        })
        .await;
        assert_eq!(result.unwrap(), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retry_transient_exhausts() {
        let calls = AtomicU32::new(0);
        let result: std::result::Result<(), _> = retry_transient("test", || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(CapabilityError::Transient("down".into()))
        })
        .await;
        assert!(matches!(result, Err(CapabilityError::Transient(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retry_transient_permanent_not_retried() {
        let calls = AtomicU32::new(0);
        let result: std::result::Result<(), _> = retry_transient("test", || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(CapabilityError::Item("bad pdf".into()))
        })
        .await;
        assert!(matches!(result, Err(CapabilityError::Item(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
