//! Stage coordinators: the fan-in jobs that advance a site through the DAG.
//!
//! A coordinator runs once per (site, stage) transition, after the stage's
//! per-item counters settle. It is the only code that calls `advance_stage`.
//! Double delivery is harmless: a second coordinator re-reads the row, sees
//! the stage already moved, and exits.

use std::time::Duration;

use chrono::Utc;

use crate::broker::{Job, JobSpec};
use crate::models::{JobPayload, Stage};
use crate::plugins::sitedb;
use crate::storage::PageRef;

use super::stages::{compile_site_spec, deploy_site_spec, extract_page_spec};
use super::{PipelineEnv, PipelineError, Result, COORDINATOR_RECHECK_DELAY};

/// Drive one coordinator delivery. Returns follow-up specs for the worker
/// loop to enqueue.
pub async fn run(
    env: &PipelineEnv,
    job: &Job,
    subdomain: &str,
    stage: Stage,
    retried: bool,
) -> Result<Vec<JobSpec>> {
    let site = env
        .store
        .get_site(subdomain)?
        .ok_or_else(|| PipelineError::UnknownSite(subdomain.to_string()))?;

    if site.current_stage != Some(stage) {
        // The site moved on (or was purged) while this job sat in the queue
        tracing::info!(
            site = subdomain,
            expected = %stage,
            actual = ?site.current_stage,
            "stale coordinator, nothing to do"
        );
        return Ok(vec![]);
    }

    let counters = site.counters(stage);
    if !counters.is_settled() {
        // Rare race: a worker claimed the coordinator before its counter
        // write became visible. Allow one delayed re-check, then leave
        // recovery to the reconciler.
        if !retried {
            tracing::warn!(
                site = subdomain,
                stage = %stage,
                completed = counters.completed,
                failed = counters.failed,
                total = counters.total,
                "counters not settled, re-checking shortly"
            );
            let recheck = JobSpec::new(
                job.queue.clone(),
                JobPayload::StageCoordinator {
                    subdomain: subdomain.to_string(),
                    stage,
                    retried: true,
                },
            )
            .with_priority(job.priority)
            .with_timeout(Duration::from_secs(5 * 60))
            .with_not_before(
                Utc::now()
                    + chrono::Duration::from_std(COORDINATOR_RECHECK_DELAY)
                        .unwrap_or_else(|_| chrono::Duration::zero()),
            );
            return Ok(vec![recheck]);
        }
        tracing::error!(
            site = subdomain,
            stage = %stage,
            completed = counters.completed,
            failed = counters.failed,
            total = counters.total,
            "counters still not settled after re-check, deferring to reconciler"
        );
        return Ok(vec![]);
    }

    if counters.failed > 0 && counters.completed > 0 {
        tracing::warn!(
            site = subdomain,
            stage = %stage,
            failed = counters.failed,
            completed = counters.completed,
            "stage finished with partial failures, proceeding on completed subset"
        );
    }

    // Nothing succeeded: stop here rather than run downstream stages on
    // nothing. A zero-total ocr stage is the no-documents short-circuit;
    // the fetch worker already recorded its error.
    if counters.completed == 0 && stage != Stage::Fetch {
        if counters.total > 0 {
            env.store.record_error(
                subdomain,
                stage,
                &format!("all {} jobs failed", counters.total),
            )?;
        }
        env.store.advance_stage(subdomain, Stage::Completed, 1)?;
        tracing::warn!(site = subdomain, stage = %stage, "completed with nothing to carry forward");
        return Ok(vec![]);
    }

    match stage {
        // A fetch coordinator only fires when the fetch job itself failed
        // (success hands off to ocr directly).
        Stage::Fetch => {
            env.store.advance_stage(subdomain, Stage::Completed, 1)?;
            tracing::warn!(site = subdomain, "fetch failed, completing with error on record");
            Ok(vec![])
        }
        Stage::Ocr => {
            env.store.advance_stage(subdomain, Stage::Compilation, 1)?;
            Ok(vec![compile_site_spec(env, subdomain, job.priority)])
        }
        Stage::Compilation => {
            let db_path = env.layout.db_path(subdomain);
            let applied = sitedb::extracted_page_count(&db_path)? > 0;
            if site.extraction_enabled && !applied {
                let pages = sitedb::list_pages(&db_path)?;
                if pages.is_empty() {
                    env.store.advance_stage(subdomain, Stage::Deploy, 1)?;
                    return Ok(vec![deploy_site_spec(env, subdomain, job.priority)]);
                }
                env.store
                    .advance_stage(subdomain, Stage::Extraction, pages.len() as u32)?;
                tracing::info!(
                    site = subdomain,
                    pages = pages.len(),
                    "fanning out extraction"
                );
                let specs = pages
                    .into_iter()
                    .map(|row| {
                        let page = PageRef {
                            meeting: row.meeting,
                            date: row.date,
                            page: row.page,
                        };
                        extract_page_spec(env, subdomain, &row.id, &page, job.priority)
                    })
                    .collect();
                Ok(specs)
            } else {
                env.store.advance_stage(subdomain, Stage::Deploy, 1)?;
                Ok(vec![deploy_site_spec(env, subdomain, job.priority)])
            }
        }
        // Recompile so the search index reflects the annotated pages, then
        // the compilation coordinator routes to deploy (annotations are now
        // applied).
        Stage::Extraction => {
            env.store.advance_stage(subdomain, Stage::Compilation, 1)?;
            Ok(vec![compile_site_spec(env, subdomain, job.priority)])
        }
        Stage::Deploy => {
            env.store.advance_stage(subdomain, Stage::Completed, 1)?;
            tracing::info!(site = subdomain, "pipeline completed");
            Ok(vec![])
        }
        Stage::Completed => Ok(vec![]),
    }
}
