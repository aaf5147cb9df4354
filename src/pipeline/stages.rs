//! Per-stage operations.
//!
//! Each operation does the stage's work against the filesystem and
//! collaborators, then reports what the worker loop should do next. Stage
//! code never enqueues directly; follow-up jobs come back as specs.
//!
//! Every operation is idempotent with respect to its on-disk outputs, so a
//! redelivered job (worker crash, delivery timeout) converges instead of
//! duplicating work.

use crate::broker::{Job, JobSpec};
use crate::models::{queue_for, JobPayload, Priority, Stage};
use crate::plugins::{
    sitedb, CapabilityError, Compiler, Deployer, Extractor, Fetcher, OcrEngine,
};
use crate::storage::PageRef;

use super::{retry_transient, PipelineEnv};

/// Build a `fetch_site` job spec.
pub fn fetch_site_spec(env: &PipelineEnv, subdomain: &str, priority: Priority) -> JobSpec {
    JobSpec::new(
        queue_for(Stage::Fetch, priority),
        JobPayload::FetchSite {
            subdomain: subdomain.to_string(),
        },
    )
    .with_priority(priority)
    .with_timeout(env.settings.stage_timeout(Stage::Fetch))
    .with_max_attempts(env.settings.max_attempts)
}

/// Build an `ocr_page` job spec.
pub fn ocr_page_spec(
    env: &PipelineEnv,
    subdomain: &str,
    page: &PageRef,
    priority: Priority,
) -> JobSpec {
    JobSpec::new(
        queue_for(Stage::Ocr, priority),
        JobPayload::OcrPage {
            subdomain: subdomain.to_string(),
            meeting: page.meeting.clone(),
            date: page.date.clone(),
            page: page.page,
        },
    )
    .with_priority(priority)
    .with_timeout(env.settings.stage_timeout(Stage::Ocr))
    .with_max_attempts(env.settings.max_attempts)
}

/// Build a `compile_site` job spec.
pub fn compile_site_spec(env: &PipelineEnv, subdomain: &str, priority: Priority) -> JobSpec {
    JobSpec::new(
        queue_for(Stage::Compilation, priority),
        JobPayload::CompileSite {
            subdomain: subdomain.to_string(),
        },
    )
    .with_priority(priority)
    .with_timeout(env.settings.stage_timeout(Stage::Compilation))
    .with_max_attempts(env.settings.max_attempts)
}

/// Build an `extract_page` job spec.
pub fn extract_page_spec(
    env: &PipelineEnv,
    subdomain: &str,
    page_id: &str,
    page: &PageRef,
    priority: Priority,
) -> JobSpec {
    JobSpec::new(
        queue_for(Stage::Extraction, priority),
        JobPayload::ExtractPage {
            subdomain: subdomain.to_string(),
            page_id: page_id.to_string(),
            meeting: page.meeting.clone(),
            date: page.date.clone(),
            page: page.page,
        },
    )
    .with_priority(priority)
    .with_timeout(env.settings.stage_timeout(Stage::Extraction))
    .with_max_attempts(env.settings.max_attempts)
}

/// Build a `deploy_site` job spec.
pub fn deploy_site_spec(env: &PipelineEnv, subdomain: &str, priority: Priority) -> JobSpec {
    JobSpec::new(
        queue_for(Stage::Deploy, priority),
        JobPayload::DeploySite {
            subdomain: subdomain.to_string(),
        },
    )
    .with_priority(priority)
    .with_timeout(env.settings.stage_timeout(Stage::Deploy))
    .with_max_attempts(env.settings.max_attempts)
}

/// What a stage operation asks of the worker loop.
#[derive(Debug)]
pub enum StageOutcome {
    /// Per-item work finished: bump the completed counter, then enqueue any
    /// follow-ups.
    ItemDone { followups: Vec<JobSpec> },
    /// The operation moved the site to another stage itself (the fetch
    /// handoff); enqueue follow-ups, touch no counters.
    HandedOff { followups: Vec<JobSpec> },
}

pub type StageResult = std::result::Result<StageOutcome, CapabilityError>;

/// Fetch a site's documents and fan out its OCR stage.
///
/// Writes page PDFs, seeds the ocr counters with the page total, and hands
/// back one `ocr_page` spec per page. With zero pages the site short-
/// circuits: an empty ocr stage whose coordinator immediately completes the
/// site with the "no documents" error on record.
pub async fn fetch_site(env: &PipelineEnv, job: &Job, subdomain: &str) -> StageResult {
    let caps = env.caps.clone();
    let layout = env.layout.clone();
    let documents = retry_transient("fetch", || {
        let caps = caps.clone();
        let layout = layout.clone();
        async move { caps.fetcher.fetch(subdomain, &layout).await }
    })
    .await?;

    let mut pages: Vec<PageRef> = Vec::new();
    for doc in &documents {
        for page in 1..=doc.page_count() {
            pages.push(PageRef {
                meeting: doc.meeting.clone(),
                date: doc.date.clone(),
                page,
            });
        }
    }

    let total = pages.len() as u32;
    let state_err = |e: crate::state::StateError| CapabilityError::Transient(e.to_string());

    if total == 0 {
        tracing::warn!(site = subdomain, "fetch found no documents");
        env.store
            .record_error(subdomain, Stage::Fetch, "no documents")
            .map_err(state_err)?;
        env.store
            .initialize_stage(subdomain, Stage::Ocr, 0)
            .map_err(state_err)?;
        let mut followups = Vec::new();
        if env
            .store
            .claim_coordinator(subdomain, Stage::Ocr)
            .map_err(state_err)?
        {
            followups.push(env.coordinator_spec(subdomain, Stage::Ocr, job.priority));
        }
        return Ok(StageOutcome::HandedOff { followups });
    }

    env.store
        .initialize_stage(subdomain, Stage::Ocr, total)
        .map_err(state_err)?;
    tracing::info!(
        site = subdomain,
        documents = documents.len(),
        pages = total,
        "fetched site, fanning out ocr"
    );

    let followups = pages
        .iter()
        .map(|page| ocr_page_spec(env, subdomain, page, job.priority))
        .collect();

    Ok(StageOutcome::HandedOff { followups })
}

/// OCR one page into its text artifact.
pub async fn ocr_page(env: &PipelineEnv, subdomain: &str, page: &PageRef) -> StageResult {
    // Idempotent: an existing non-empty artifact is success
    if env.layout.has_page_text(subdomain, page) {
        return Ok(StageOutcome::ItemDone { followups: vec![] });
    }

    let pdf_path = env.layout.pdf_page_path(subdomain, page);
    let ocr = env.caps.ocr.clone();
    let text = retry_transient("ocr", || {
        let ocr = ocr.clone();
        let pdf_path = pdf_path.clone();
        async move { ocr.ocr_page(&pdf_path) }
    })
    .await?;

    env.layout
        .write_page_text(subdomain, page, &text)
        .map_err(|e| CapabilityError::Transient(format!("write text artifact: {e}")))?;

    Ok(StageOutcome::ItemDone { followups: vec![] })
}

/// Compile the site database from whatever text artifacts exist.
pub async fn compile_site(env: &PipelineEnv, subdomain: &str) -> StageResult {
    let compiler = env.caps.compiler.clone();
    let layout = env.layout.clone();
    let site = subdomain.to_string();
    let summary = retry_transient("compile", || {
        let compiler = compiler.clone();
        let layout = layout.clone();
        let site = site.clone();
        async move { compiler.compile(&site, &layout) }
    })
    .await?;

    tracing::info!(site = subdomain, pages = summary.pages, "compiled site database");
    Ok(StageOutcome::ItemDone { followups: vec![] })
}

/// Extract entities and votes for one page and persist them to its row.
pub async fn extract_page(
    env: &PipelineEnv,
    subdomain: &str,
    page_id: &str,
    page: &PageRef,
) -> StageResult {
    let db_path = env.layout.db_path(subdomain);

    // Idempotent: annotations already applied
    if sitedb::is_page_extracted(&db_path, page_id)? {
        return Ok(StageOutcome::ItemDone { followups: vec![] });
    }

    let text = env
        .layout
        .read_page_text(subdomain, page)
        .map_err(|e| CapabilityError::Item(format!("text artifact missing: {e}")))?;

    let annotations = env.caps.extractor.extract(&text)?;
    sitedb::apply_annotations(&db_path, page_id, &annotations)?;

    Ok(StageOutcome::ItemDone { followups: vec![] })
}

/// Publish the compiled database.
pub async fn deploy_site(env: &PipelineEnv, subdomain: &str) -> StageResult {
    let db_path = env.layout.db_path(subdomain);
    let deployer = env.caps.deployer.clone();
    let site = subdomain.to_string();
    retry_transient("deploy", || {
        let deployer = deployer.clone();
        let db_path = db_path.clone();
        let site = site.clone();
        async move { deployer.deploy(&site, &db_path) }
    })
    .await?;

    tracing::info!(site = subdomain, "deployed site database");
    Ok(StageOutcome::ItemDone { followups: vec![] })
}
