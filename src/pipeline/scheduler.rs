//! Scheduler: admits sites into the pipeline.
//!
//! Rate limiting is structural: `advance_oldest` admits exactly one site
//! per invocation and is driven by an external cron; operators admit
//! specific sites through `enqueue_site`.

use crate::models::{Priority, Stage};

use super::stages::fetch_site_spec;
use super::{PipelineEnv, PipelineError, Result};

/// Admit one site by hand, at the given priority.
///
/// Seeds the fetch stage (total 1) and enqueues the fetch job.
pub async fn enqueue_site(env: &PipelineEnv, subdomain: &str, priority: Priority) -> Result<()> {
    if env.store.get_site(subdomain)?.is_none() {
        return Err(PipelineError::UnknownSite(subdomain.to_string()));
    }
    env.store.initialize_stage(subdomain, Stage::Fetch, 1)?;
    let spec = fetch_site_spec(env, subdomain, priority);
    env.enqueue_all(vec![spec]).await?;
    tracing::info!(site = subdomain, priority = priority.as_str(), "site admitted");
    Ok(())
}

/// One scheduler tick: admit the stalest eligible site (never-processed
/// sites first), if any. Only idle or completed sites are eligible; a site
/// stalled mid-pipeline is left for the reconciler, since re-admission
/// would reset its stage under running workers. Returns the admitted
/// subdomain.
pub async fn advance_oldest(env: &PipelineEnv) -> Result<Option<String>> {
    let candidate = env.store.oldest_eligible(env.settings.admission_age)?;
    let subdomain = match candidate {
        Some(subdomain) => subdomain,
        None => {
            tracing::debug!("scheduler: no site eligible");
            return Ok(None);
        }
    };
    enqueue_site(env, &subdomain, Priority::Normal).await?;
    Ok(Some(subdomain))
}
