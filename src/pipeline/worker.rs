//! Generic worker loop: reserve, dispatch on payload, record the terminal
//! counter update, maybe claim the stage coordinator, ack.
//!
//! Workers are typed by the queue they subscribe to, but dispatch on the
//! payload: the shared high band can hand any stage's job to any pool.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;

use crate::broker::{AckOutcome, Broker, Job};
use crate::models::{JobPayload, Priority, Stage, StageCounters, HIGH_QUEUE};
use crate::plugins::CapabilityError;
use crate::state::CounterKind;
use crate::storage::{FailureEntry, PageRef};

use super::stages::{StageOutcome, StageResult};
use super::{coordinator, stages, PipelineEnv, PipelineError};

/// How long one reserve call blocks before the loop re-checks shutdown.
const RESERVE_WAIT: Duration = Duration::from_secs(5);
/// Pause before retrying a broker that refused a reservation.
const BROKER_BACKOFF: Duration = Duration::from_secs(5);

/// Outcome of processing a single job.
pub struct ProcessResult {
    pub outcome: AckOutcome,
    /// Set when the worker itself is broken and must exit; the job is acked
    /// failed and the site untouched.
    pub fatal: Option<String>,
}

impl ProcessResult {
    fn done() -> Self {
        Self {
            outcome: AckOutcome::Done,
            fatal: None,
        }
    }

    fn failed(msg: impl Into<String>) -> Self {
        Self {
            outcome: AckOutcome::Failed(msg.into()),
            fatal: None,
        }
    }

    fn fatal(msg: String) -> Self {
        Self {
            outcome: AckOutcome::Failed(msg.clone()),
            fatal: Some(msg),
        }
    }
}

/// Execute one job end to end (stage work plus state bookkeeping). The
/// caller acks with the returned outcome.
pub async fn process_job(env: &PipelineEnv, job: &Job) -> ProcessResult {
    let subdomain = job.payload.subdomain().to_string();
    let stage = job.payload.stage();
    tracing::debug!(
        site = %subdomain,
        stage = %stage,
        job_id = %job.id,
        run_id = %env.run_id,
        kind = job.payload.kind(),
        attempt = job.attempt,
        "processing job"
    );

    let result: StageResult = match &job.payload {
        JobPayload::FetchSite { subdomain } => stages::fetch_site(env, job, subdomain).await,
        JobPayload::OcrPage {
            subdomain,
            meeting,
            date,
            page,
        } => {
            let page = PageRef {
                meeting: meeting.clone(),
                date: date.clone(),
                page: *page,
            };
            stages::ocr_page(env, subdomain, &page).await
        }
        JobPayload::CompileSite { subdomain } => stages::compile_site(env, subdomain).await,
        JobPayload::ExtractPage {
            subdomain,
            page_id,
            meeting,
            date,
            page,
        } => {
            let page = PageRef {
                meeting: meeting.clone(),
                date: date.clone(),
                page: *page,
            };
            stages::extract_page(env, subdomain, page_id, &page).await
        }
        JobPayload::DeploySite { subdomain } => stages::deploy_site(env, subdomain).await,
        JobPayload::StageCoordinator {
            subdomain,
            stage,
            retried,
        } => {
            return match coordinator::run(env, job, subdomain, *stage, *retried).await {
                Ok(followups) => match env.enqueue_all(followups).await {
                    Ok(()) => ProcessResult::done(),
                    Err(e) => ProcessResult::failed(format!("enqueue follow-ups: {e}")),
                },
                Err(PipelineError::UnknownSite(site)) => {
                    ProcessResult::failed(format!("unknown site {site}"))
                }
                Err(e) => ProcessResult::failed(e.to_string()),
            };
        }
    };

    finalize(env, job, &subdomain, stage, result).await
}

/// Apply the terminal bookkeeping for a per-item stage result.
async fn finalize(
    env: &PipelineEnv,
    job: &Job,
    subdomain: &str,
    stage: Stage,
    result: StageResult,
) -> ProcessResult {
    match result {
        Ok(StageOutcome::HandedOff { followups }) => match env.enqueue_all(followups).await {
            Ok(()) => ProcessResult::done(),
            Err(e) => ProcessResult::failed(format!("enqueue follow-ups: {e}")),
        },
        Ok(StageOutcome::ItemDone { followups }) => {
            if let Err(e) = env.enqueue_all(followups).await {
                return ProcessResult::failed(format!("enqueue follow-ups: {e}"));
            }
            record_terminal(env, job, subdomain, stage, CounterKind::Completed).await
        }
        Err(CapabilityError::Fatal(msg)) => {
            // Worker-level breakage: no site mutation, supervisor restarts us
            tracing::error!(
                site = subdomain,
                stage = %stage,
                job_id = %job.id,
                error = %msg,
                "fatal worker error"
            );
            ProcessResult::fatal(msg)
        }
        Err(err) => {
            let msg = err.to_string();
            tracing::warn!(
                site = subdomain,
                stage = %stage,
                job_id = %job.id,
                run_id = %env.run_id,
                error = %msg,
                "job failed"
            );
            if let CapabilityError::Site(site_msg) = &err {
                if let Err(e) = env.store.record_error(subdomain, stage, site_msg) {
                    tracing::error!(site = subdomain, error = %e, "failed to record site error");
                }
            } else if let Some(page) = payload_page(&job.payload) {
                // Per-item failure: the manifest is the durable record
                let entry =
                    FailureEntry::new(subdomain, stage.as_str(), &page, &job.id, &msg);
                if let Err(e) = env.layout.append_failure(&env.run_id, &entry) {
                    tracing::error!(site = subdomain, error = %e, "failed to append failure manifest");
                }
            }
            let mut result = record_terminal(env, job, subdomain, stage, CounterKind::Failed).await;
            result.outcome = AckOutcome::Failed(msg);
            result
        }
    }
}

/// Bump the stage counter for a terminal path and, when that settles the
/// stage, claim and enqueue its coordinator.
async fn record_terminal(
    env: &PipelineEnv,
    job: &Job,
    subdomain: &str,
    stage: Stage,
    kind: CounterKind,
) -> ProcessResult {
    let counters = match env.store.increment(subdomain, stage, kind) {
        Ok(Some(counters)) => counters,
        Ok(None) => {
            // Site was purged or moved on: stand down without mutating
            tracing::info!(
                site = subdomain,
                stage = %stage,
                job_id = %job.id,
                "stage reset under a running job, dropping outcome"
            );
            return ProcessResult::failed("site stage reset during processing");
        }
        Err(e) => return ProcessResult::failed(format!("counter update: {e}")),
    };

    if let Err(e) = settle_stage(env, subdomain, stage, counters, job.priority).await {
        return ProcessResult::failed(format!("coordinator enqueue: {e}"));
    }
    ProcessResult::done()
}

/// If this update settled the stage, win the coordinator claim and enqueue
/// the coordinator job. Exactly one terminal update per stage gets here.
async fn settle_stage(
    env: &PipelineEnv,
    subdomain: &str,
    stage: Stage,
    counters: StageCounters,
    priority: Priority,
) -> super::Result<()> {
    if !counters.is_settled() {
        return Ok(());
    }
    if !env.store.claim_coordinator(subdomain, stage)? {
        return Ok(());
    }
    tracing::info!(
        site = subdomain,
        stage = %stage,
        completed = counters.completed,
        failed = counters.failed,
        "stage settled, enqueueing coordinator"
    );
    let spec = env.coordinator_spec(subdomain, stage, priority);
    env.enqueue_all(vec![spec]).await
}

fn payload_page(payload: &JobPayload) -> Option<PageRef> {
    match payload {
        JobPayload::OcrPage {
            meeting,
            date,
            page,
            ..
        }
        | JobPayload::ExtractPage {
            meeting,
            date,
            page,
            ..
        } => Some(PageRef {
            meeting: meeting.clone(),
            date: date.clone(),
            page: *page,
        }),
        _ => None,
    }
}

/// One worker task: subscribe to the high band plus a stage queue and
/// process until shutdown (or a fatal error).
pub async fn run_worker(
    env: Arc<PipelineEnv>,
    stage: Stage,
    index: usize,
    mut shutdown: watch::Receiver<bool>,
) {
    let worker_id = format!("{}-{}-{}", stage.as_str(), index, &env.run_id[..8]);
    let queues = [HIGH_QUEUE, stage.queue()];
    tracing::info!(worker = %worker_id, run_id = %env.run_id, "worker started");

    loop {
        if *shutdown.borrow() {
            break;
        }
        if let Err(e) = env.broker.heartbeat_worker(&worker_id, stage.as_str()).await {
            tracing::warn!(worker = %worker_id, error = %e, "heartbeat failed");
        }

        let reserved = tokio::select! {
            r = env.broker.reserve(&queues, RESERVE_WAIT) => r,
            _ = shutdown.changed() => break,
        };
        match reserved {
            Ok(Some(job)) => {
                let result = process_job(&env, &job).await;
                if let Err(e) = env.broker.ack(&job.id, result.outcome).await {
                    tracing::error!(worker = %worker_id, job_id = %job.id, error = %e, "ack failed");
                }
                if let Some(msg) = result.fatal {
                    tracing::error!(worker = %worker_id, error = %msg, "worker exiting on fatal error");
                    break;
                }
            }
            Ok(None) => {}
            Err(e) => {
                // Broker unavailable: pause reservation, never progress
                // silently
                tracing::warn!(worker = %worker_id, error = %e, "broker unavailable, pausing");
                tokio::time::sleep(BROKER_BACKOFF).await;
            }
        }
    }
    tracing::info!(worker = %worker_id, "worker stopped");
}

/// Spawn the configured pools for the given stages and wait for them.
pub async fn run_pools(env: Arc<PipelineEnv>, stages: Vec<Stage>, shutdown: watch::Receiver<bool>) {
    let mut handles = Vec::new();
    for stage in stages {
        let count = env.settings.workers.for_stage(stage);
        for index in 0..count {
            handles.push(tokio::spawn(run_worker(
                env.clone(),
                stage,
                index,
                shutdown.clone(),
            )));
        }
    }
    futures::future::join_all(handles).await;
}

/// Drain every queue synchronously until nothing is deliverable. Test and
/// maintenance helper; production runs `run_pools`.
pub async fn run_until_idle(env: &PipelineEnv) -> super::Result<u32> {
    let queues = [
        HIGH_QUEUE,
        Stage::Fetch.queue(),
        Stage::Ocr.queue(),
        Stage::Compilation.queue(),
        Stage::Extraction.queue(),
        Stage::Deploy.queue(),
    ];
    let mut processed = 0u32;
    while let Some(job) = env.broker.reserve(&queues, Duration::from_millis(50)).await? {
        let result = process_job(env, &job).await;
        env.broker.ack(&job.id, result.outcome).await?;
        if let Some(msg) = result.fatal {
            return Err(CapabilityError::Fatal(msg).into());
        }
        processed += 1;
    }
    Ok(processed)
}
