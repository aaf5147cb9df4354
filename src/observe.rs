//! Read-only status and health queries over the broker and state store.

use std::collections::HashMap;

use chrono::Utc;
use serde::Serialize;

use crate::broker::Broker;
use crate::models::{SiteRecord, Stage, HIGH_QUEUE};
use crate::pipeline::{PipelineEnv, Result};

/// Health thresholds: healthy at or above the first, degraded at or above
/// the second, unhealthy below.
pub const HEALTHY_SCORE: f64 = 0.9;
pub const DEGRADED_SCORE: f64 = 0.5;

#[derive(Debug, Clone, Serialize)]
pub struct QueueDepth {
    pub queue: String,
    pub depth: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct SiteStatus {
    #[serde(flatten)]
    pub record: SiteRecord,
    /// Seconds since the site was first admitted, while mid-pipeline.
    pub in_pipeline_secs: Option<i64>,
    /// Seconds since the last state-store write for this site.
    pub idle_secs: Option<i64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    /// Sites currently mid-pipeline.
    pub active: usize,
    /// Active sites past the stuck threshold.
    pub stuck: usize,
    /// Fraction of active sites still moving; 1.0 when idle.
    pub score: f64,
}

impl HealthReport {
    /// Exit code for the `health` command: 0 healthy, 1 degraded,
    /// 2 unhealthy.
    pub fn exit_code(&self) -> i32 {
        if self.score >= HEALTHY_SCORE {
            0
        } else if self.score >= DEGRADED_SCORE {
            1
        } else {
            2
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub queues: Vec<QueueDepth>,
    /// Active worker counts per stage, from broker heartbeats.
    pub workers: HashMap<String, u64>,
    pub sites: Vec<SiteStatus>,
    /// Most recent entries from the broker's failed registry.
    pub recent_failures: Vec<crate::broker::FailedJob>,
    pub health: HealthReport,
}

/// Every queue the pipeline uses, high band first.
pub fn all_queues() -> Vec<&'static str> {
    let mut queues = vec![HIGH_QUEUE];
    queues.extend(Stage::COUNTED.iter().map(|s| s.queue()));
    queues
}

/// Assemble the full status snapshot, optionally filtered to one site.
pub async fn status(env: &PipelineEnv, site_filter: Option<&str>) -> Result<StatusReport> {
    let mut queues = Vec::new();
    for queue in all_queues() {
        queues.push(QueueDepth {
            queue: queue.to_string(),
            depth: env.broker.depth(queue).await?,
        });
    }
    let workers = env.broker.active_worker_counts().await?;

    let now = Utc::now();
    let records = match site_filter {
        Some(site) => env.store.get_site(site)?.into_iter().collect(),
        None => env.store.list_sites()?,
    };
    let sites = records
        .into_iter()
        .map(|record| {
            let mid_pipeline = matches!(
                record.current_stage,
                Some(stage) if stage != Stage::Completed
            );
            SiteStatus {
                in_pipeline_secs: record
                    .started_at
                    .filter(|_| mid_pipeline)
                    .map(|t| (now - t).num_seconds()),
                idle_secs: record.updated_at.map(|t| (now - t).num_seconds()),
                record,
            }
        })
        .collect();

    let recent_failures = env.broker.failed_jobs(10).await?;
    let health = health(env).await?;
    Ok(StatusReport {
        queues,
        workers,
        sites,
        recent_failures,
        health,
    })
}

/// Compute the fleet health score from the state store alone.
pub async fn health(env: &PipelineEnv) -> Result<HealthReport> {
    let sites = env.store.list_sites()?;
    let active = sites
        .iter()
        .filter(|s| matches!(s.current_stage, Some(stage) if stage != Stage::Completed))
        .count();
    let stuck = env
        .store
        .snapshot_stuck(env.settings.stuck_threshold)?
        .len();
    let score = if active == 0 {
        1.0
    } else {
        1.0 - (stuck.min(active) as f64 / active as f64)
    };
    Ok(HealthReport {
        active,
        stuck,
        score,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_codes() {
        let healthy = HealthReport {
            active: 10,
            stuck: 0,
            score: 1.0,
        };
        assert_eq!(healthy.exit_code(), 0);
        let degraded = HealthReport {
            active: 10,
            stuck: 3,
            score: 0.7,
        };
        assert_eq!(degraded.exit_code(), 1);
        let unhealthy = HealthReport {
            active: 10,
            stuck: 8,
            score: 0.2,
        };
        assert_eq!(unhealthy.exit_code(), 2);
    }

    #[test]
    fn test_all_queues_high_first() {
        let queues = all_queues();
        assert_eq!(queues[0], "high");
        assert!(queues.contains(&"ocr"));
        assert_eq!(queues.len(), 6);
    }
}
