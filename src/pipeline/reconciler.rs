//! Reconciler: heals drift between queue state and on-disk reality.
//!
//! On-disk artifacts are the ground truth for per-item work; state-store
//! counters are a materialized cache of that truth. The reconciler scans
//! for sites that stopped moving, recounts their artifacts, rewrites
//! counters absolutely, and either re-enqueues the specific missing jobs or
//! enqueues the coordinator the site lost. It never advances stages and
//! never deletes artifacts.

use std::collections::BTreeSet;
use std::time::Duration;

use crate::models::{Priority, SiteRecord, Stage};
use crate::plugins::{sitedb, Deployer};
use crate::storage::PageRef;

use super::stages::{
    compile_site_spec, deploy_site_spec, extract_page_spec, fetch_site_spec, ocr_page_spec,
};
use super::{PipelineEnv, Result};

/// What one reconciliation pass did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    pub scanned: usize,
    pub rewritten: usize,
    pub coordinators_enqueued: usize,
    pub jobs_reenqueued: usize,
}

/// The recount of a single stuck site's current stage.
struct Recount {
    total: u32,
    completed: u32,
    failed: u32,
    /// Jobs to re-enqueue when the stage cannot settle on its own.
    missing: Vec<crate::broker::JobSpec>,
}

/// Run one reconciliation scan over every stuck site.
pub async fn reconcile_once(env: &PipelineEnv, threshold: Duration) -> Result<ReconcileReport> {
    let mut report = ReconcileReport::default();
    let stuck = env.store.snapshot_stuck(threshold)?;
    report.scanned = stuck.len();
    if stuck.is_empty() {
        tracing::debug!("reconciler: nothing stuck");
        return Ok(report);
    }

    for site in stuck {
        match reconcile_site(env, &site, &mut report).await {
            Ok(()) => {}
            Err(e) => {
                // One bad site must not block healing the rest
                tracing::error!(
                    site = %site.subdomain,
                    error = %e,
                    "reconciliation failed for site"
                );
            }
        }
    }
    tracing::info!(
        scanned = report.scanned,
        rewritten = report.rewritten,
        coordinators = report.coordinators_enqueued,
        reenqueued = report.jobs_reenqueued,
        "reconciliation pass finished"
    );
    Ok(report)
}

async fn reconcile_site(
    env: &PipelineEnv,
    site: &SiteRecord,
    report: &mut ReconcileReport,
) -> Result<()> {
    let stage = match site.current_stage {
        Some(stage) if stage != Stage::Completed => stage,
        _ => return Ok(()),
    };
    let subdomain = &site.subdomain;
    let recount = recount_stage(env, site, stage)?;
    let before = site.counters(stage);

    if (before.total, before.completed, before.failed)
        != (recount.total, recount.completed, recount.failed)
    {
        let applied = env.store.set_stage_counters(
            subdomain,
            stage,
            recount.total,
            recount.completed,
            recount.failed,
        )?;
        if !applied {
            // The site moved on between snapshot and rewrite
            tracing::info!(site = %subdomain, stage = %stage, "site advanced mid-reconcile, skipping");
            return Ok(());
        }
        report.rewritten += 1;
        tracing::info!(
            site = %subdomain,
            stage = %stage,
            before_total = before.total,
            before_completed = before.completed,
            before_failed = before.failed,
            after_total = recount.total,
            after_completed = recount.completed,
            after_failed = recount.failed,
            "rewrote counters from on-disk ground truth"
        );
    } else {
        // Counters already match disk; the site is stuck for queue-side
        // reasons (lost coordinator or lost item jobs)
        tracing::info!(
            site = %subdomain,
            stage = %stage,
            completed = before.completed,
            failed = before.failed,
            total = before.total,
            "counters match disk, checking for lost jobs"
        );
    }

    if recount.completed + recount.failed >= recount.total {
        // Stage is settled; make sure a coordinator actually runs.
        if site.coordinator_enqueued {
            // A claimed coordinator on a stuck site is long gone
            if env.store.release_coordinator(subdomain, stage)? {
                tracing::warn!(
                    site = %subdomain,
                    stage = %stage,
                    "released stale coordinator claim"
                );
            }
        }
        if env.store.claim_coordinator(subdomain, stage)? {
            let spec = env.coordinator_spec(subdomain, stage, Priority::Normal);
            env.enqueue_all(vec![spec]).await?;
            report.coordinators_enqueued += 1;
            tracing::info!(site = %subdomain, stage = %stage, "re-enqueued missing coordinator");
        }
    } else if !recount.missing.is_empty() {
        let count = recount.missing.len();
        env.enqueue_all(recount.missing).await?;
        // Refresh updated_at so the next scan does not double-admit the
        // same work before it had a chance to run
        env.store.touch_site(subdomain)?;
        report.jobs_reenqueued += count;
        tracing::info!(
            site = %subdomain,
            stage = %stage,
            jobs = count,
            "re-enqueued missing per-item jobs"
        );
    }
    Ok(())
}

/// Recount a stage from its artifacts. Failures only count when the failure
/// manifest recorded them; work that is neither done nor recorded failed is
/// re-enqueued instead of being written off.
fn recount_stage(env: &PipelineEnv, site: &SiteRecord, stage: Stage) -> Result<Recount> {
    let subdomain = &site.subdomain;
    match stage {
        Stage::Fetch => {
            // Settled fetch counters (the fetch job failed terminally) keep
            // their record and go to the coordinator; anything else means
            // the fetch job was lost and is re-run.
            let counters = site.fetch;
            if counters.total > 0 && counters.is_settled() {
                return Ok(Recount {
                    total: counters.total,
                    completed: counters.completed,
                    failed: counters.failed,
                    missing: vec![],
                });
            }
            Ok(Recount {
                total: 1,
                completed: 0,
                failed: 0,
                missing: vec![fetch_site_spec(env, subdomain, Priority::Normal)],
            })
        }
        Stage::Ocr => {
            let expected: BTreeSet<PageRef> = env
                .layout
                .list_pdf_pages(subdomain)
                .map_err(io_err)?
                .into_iter()
                .collect();
            let present: BTreeSet<PageRef> = env
                .layout
                .list_txt_pages(subdomain)
                .map_err(io_err)?
                .into_iter()
                .collect();
            let recorded_failed: BTreeSet<PageRef> = env
                .layout
                .failed_pages(subdomain)
                .map_err(io_err)?
                .into_iter()
                .filter(|p| expected.contains(p) && !present.contains(p))
                .collect();
            let missing: Vec<_> = expected
                .iter()
                .filter(|p| !present.contains(*p) && !recorded_failed.contains(*p))
                .map(|p| ocr_page_spec(env, subdomain, p, Priority::Normal))
                .collect();
            Ok(Recount {
                total: expected.len() as u32,
                completed: present.iter().filter(|p| expected.contains(*p)).count() as u32,
                failed: recorded_failed.len() as u32,
                missing,
            })
        }
        Stage::Compilation => {
            let compiled = env.layout.db_path(subdomain).exists();
            Ok(Recount {
                total: 1,
                completed: compiled as u32,
                failed: 0,
                missing: if compiled {
                    vec![]
                } else {
                    vec![compile_site_spec(env, subdomain, Priority::Normal)]
                },
            })
        }
        Stage::Extraction => {
            let db_path = env.layout.db_path(subdomain);
            let pages = sitedb::list_pages(&db_path)?;
            let extracted = sitedb::extracted_page_count(&db_path)?;
            let recorded_failed: BTreeSet<PageRef> = env
                .layout
                .failed_pages(subdomain)
                .map_err(io_err)?
                .into_iter()
                .collect();
            let mut failed = 0u32;
            let mut missing = Vec::new();
            for row in &pages {
                if sitedb::is_page_extracted(&db_path, &row.id)? {
                    continue;
                }
                let page = PageRef {
                    meeting: row.meeting.clone(),
                    date: row.date.clone(),
                    page: row.page,
                };
                if recorded_failed.contains(&page) {
                    failed += 1;
                } else {
                    missing.push(extract_page_spec(env, subdomain, &row.id, &page, Priority::Normal));
                }
            }
            Ok(Recount {
                total: pages.len() as u32,
                completed: extracted,
                failed,
                missing,
            })
        }
        Stage::Deploy => {
            let deployed = env.caps.deployer.is_deployed(subdomain);
            Ok(Recount {
                total: 1,
                completed: deployed as u32,
                failed: 0,
                missing: if deployed {
                    vec![]
                } else {
                    vec![deploy_site_spec(env, subdomain, Priority::Normal)]
                },
            })
        }
        Stage::Completed => Ok(Recount {
            total: 0,
            completed: 0,
            failed: 0,
            missing: vec![],
        }),
    }
}

fn io_err(e: std::io::Error) -> super::PipelineError {
    crate::plugins::CapabilityError::Transient(format!("artifact scan: {e}")).into()
}

/// Run the reconciler on its timer until shutdown flips.
pub async fn run_timer(
    env: std::sync::Arc<PipelineEnv>,
    mut shutdown: tokio::sync::watch::Receiver<bool>,
) {
    let interval = env.settings.reconcile_interval;
    let threshold = env.settings.stuck_threshold;
    loop {
        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            _ = shutdown.changed() => break,
        }
        if *shutdown.borrow() {
            break;
        }
        if let Err(e) = reconcile_once(&env, threshold).await {
            tracing::error!(error = %e, "reconciliation pass failed");
        }
    }
}
