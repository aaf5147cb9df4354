//! Core domain types: pipeline stages, site state, job payloads.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Queue that carries high-priority jobs of every kind. Workers list it
/// ahead of their stage queue when reserving.
pub const HIGH_QUEUE: &str = "high";

/// Pipeline stages, in DAG order.
///
/// `fetch -> ocr -> compilation -> [extraction -> compilation] -> deploy ->
/// completed`. The extraction detour runs at most once per site, guarded by
/// the site's extraction flag and the "already applied" check against the
/// compiled database.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Fetch,
    Ocr,
    Compilation,
    Extraction,
    Deploy,
    Completed,
}

impl Stage {
    /// Stages that carry per-item counters (everything except `completed`).
    pub const COUNTED: [Stage; 5] = [
        Stage::Fetch,
        Stage::Ocr,
        Stage::Compilation,
        Stage::Extraction,
        Stage::Deploy,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Fetch => "fetch",
            Stage::Ocr => "ocr",
            Stage::Compilation => "compilation",
            Stage::Extraction => "extraction",
            Stage::Deploy => "deploy",
            Stage::Completed => "completed",
        }
    }

    pub fn parse(s: &str) -> Option<Stage> {
        match s {
            "fetch" => Some(Stage::Fetch),
            "ocr" => Some(Stage::Ocr),
            "compilation" => Some(Stage::Compilation),
            "extraction" => Some(Stage::Extraction),
            "deploy" => Some(Stage::Deploy),
            "completed" => Some(Stage::Completed),
            _ => None,
        }
    }

    /// Queue that carries normal-priority per-item jobs of this stage.
    pub fn queue(&self) -> &'static str {
        self.as_str()
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Job priority band. High-priority jobs ride a dedicated queue that every
/// worker pool lists first.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    #[default]
    Normal,
    High,
}

impl Priority {
    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::Normal => "normal",
            Priority::High => "high",
        }
    }

    pub fn parse(s: &str) -> Option<Priority> {
        match s {
            "normal" => Some(Priority::Normal),
            "high" => Some(Priority::High),
            _ => None,
        }
    }
}

/// Resolve the queue a job should land on: the shared high band, or the
/// stage's own queue.
pub fn queue_for(stage: Stage, priority: Priority) -> &'static str {
    match priority {
        Priority::High => HIGH_QUEUE,
        Priority::Normal => stage.queue(),
    }
}

/// Per-stage progress counters. `completed + failed <= total` always.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageCounters {
    pub total: u32,
    pub completed: u32,
    pub failed: u32,
}

impl StageCounters {
    /// All per-item work has terminated (successfully or not).
    pub fn is_settled(&self) -> bool {
        self.completed + self.failed == self.total
    }
}

/// A site's pipeline state row. Owned by the state store; mutated only
/// through its atomic operations.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SiteRecord {
    pub subdomain: String,
    pub current_stage: Option<Stage>,
    pub started_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
    pub coordinator_enqueued: bool,
    pub extraction_enabled: bool,
    pub last_error_stage: Option<String>,
    pub last_error_message: Option<String>,
    pub last_error_at: Option<DateTime<Utc>>,
    pub fetch: StageCounters,
    pub ocr: StageCounters,
    pub compilation: StageCounters,
    pub extraction: StageCounters,
    pub deploy: StageCounters,
}

impl SiteRecord {
    /// Counters for a counted stage.
    pub fn counters(&self, stage: Stage) -> StageCounters {
        match stage {
            Stage::Fetch => self.fetch,
            Stage::Ocr => self.ocr,
            Stage::Compilation => self.compilation,
            Stage::Extraction => self.extraction,
            Stage::Deploy => self.deploy,
            Stage::Completed => StageCounters::default(),
        }
    }
}

/// One fetched document: a meeting's PDF split into per-page files.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocumentRef {
    pub site: String,
    pub meeting: String,
    pub date: String,
    /// Per-page PDF paths, in page order.
    pub page_paths: Vec<std::path::PathBuf>,
}

impl DocumentRef {
    pub fn page_count(&self) -> u32 {
        self.page_paths.len() as u32
    }
}

/// Closed set of job payloads the pipeline moves through the broker.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum JobPayload {
    FetchSite {
        subdomain: String,
    },
    OcrPage {
        subdomain: String,
        meeting: String,
        date: String,
        page: u32,
    },
    /// Fan-in job: advances the site past `stage` once its counters settle.
    StageCoordinator {
        subdomain: String,
        stage: Stage,
        /// Set on the single delayed re-enqueue a coordinator allows itself
        /// when it observes unsettled counters.
        #[serde(default)]
        retried: bool,
    },
    CompileSite {
        subdomain: String,
    },
    ExtractPage {
        subdomain: String,
        page_id: String,
        meeting: String,
        date: String,
        page: u32,
    },
    DeploySite {
        subdomain: String,
    },
}

impl JobPayload {
    pub fn subdomain(&self) -> &str {
        match self {
            JobPayload::FetchSite { subdomain }
            | JobPayload::OcrPage { subdomain, .. }
            | JobPayload::StageCoordinator { subdomain, .. }
            | JobPayload::CompileSite { subdomain }
            | JobPayload::ExtractPage { subdomain, .. }
            | JobPayload::DeploySite { subdomain } => subdomain,
        }
    }

    /// Stage this payload performs work for. Coordinators report the stage
    /// they close out.
    pub fn stage(&self) -> Stage {
        match self {
            JobPayload::FetchSite { .. } => Stage::Fetch,
            JobPayload::OcrPage { .. } => Stage::Ocr,
            JobPayload::StageCoordinator { stage, .. } => *stage,
            JobPayload::CompileSite { .. } => Stage::Compilation,
            JobPayload::ExtractPage { .. } => Stage::Extraction,
            JobPayload::DeploySite { .. } => Stage::Deploy,
        }
    }

    /// Short label for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            JobPayload::FetchSite { .. } => "fetch_site",
            JobPayload::OcrPage { .. } => "ocr_page",
            JobPayload::StageCoordinator { .. } => "coordinator",
            JobPayload::CompileSite { .. } => "compile_site",
            JobPayload::ExtractPage { .. } => "extract_page",
            JobPayload::DeploySite { .. } => "deploy_site",
        }
    }
}

/// A named entity found on a page.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityRecord {
    pub kind: String,
    pub value: String,
}

/// A recorded vote found on a page.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoteRecord {
    pub motion: String,
    pub ayes: u32,
    pub nays: u32,
    pub abstains: u32,
}

/// Extraction output for a single page.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageAnnotations {
    pub entities: Vec<EntityRecord>,
    pub votes: Vec<VoteRecord>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_roundtrip() {
        for stage in Stage::COUNTED {
            assert_eq!(Stage::parse(stage.as_str()), Some(stage));
        }
        assert_eq!(Stage::parse("completed"), Some(Stage::Completed));
        assert_eq!(Stage::parse("bogus"), None);
    }

    #[test]
    fn test_queue_for_priority_bands() {
        assert_eq!(queue_for(Stage::Fetch, Priority::Normal), "fetch");
        assert_eq!(queue_for(Stage::Fetch, Priority::High), HIGH_QUEUE);
        assert_eq!(queue_for(Stage::Ocr, Priority::High), HIGH_QUEUE);
    }

    #[test]
    fn test_counters_settled() {
        let mut c = StageCounters {
            total: 5,
            completed: 3,
            failed: 1,
        };
        assert!(!c.is_settled());
        c.failed = 2;
        assert!(c.is_settled());
        let empty = StageCounters::default();
        assert!(empty.is_settled());
    }

    #[test]
    fn test_payload_stage_and_site() {
        let p = JobPayload::OcrPage {
            subdomain: "a.example".into(),
            meeting: "council".into(),
            date: "2024-03-12".into(),
            page: 3,
        };
        assert_eq!(p.subdomain(), "a.example");
        assert_eq!(p.stage(), Stage::Ocr);

        let c = JobPayload::StageCoordinator {
            subdomain: "a.example".into(),
            stage: Stage::Ocr,
            retried: false,
        };
        assert_eq!(c.stage(), Stage::Ocr);
        assert_eq!(c.kind(), "coordinator");
    }
}
