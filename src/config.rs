//! Configuration resolved from the environment.
//!
//! All knobs come from environment variables (a `.env` file is honored via
//! dotenvy at startup). There is no config-file layer: the deployment story
//! is container + env, and the CLI overrides the few things operators touch
//! interactively.

use std::path::PathBuf;
use std::time::Duration;

use serde::Serialize;

use crate::models::Stage;

/// Default interval between reconciler scans.
pub const DEFAULT_RECONCILE_INTERVAL: Duration = Duration::from_secs(15 * 60);
/// Sites untouched for this long are considered stuck.
pub const DEFAULT_STUCK_THRESHOLD: Duration = Duration::from_secs(2 * 60 * 60);
/// Sites younger than this are not eligible for scheduler re-admission.
pub const DEFAULT_ADMISSION_AGE: Duration = Duration::from_secs(23 * 60 * 60);

/// Per-stage worker pool sizes.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct WorkerCounts {
    pub fetch: usize,
    pub ocr: usize,
    pub compilation: usize,
    pub extraction: usize,
    pub deploy: usize,
}

impl Default for WorkerCounts {
    fn default() -> Self {
        Self {
            fetch: 2,
            ocr: 4,
            compilation: 1,
            extraction: 2,
            deploy: 1,
        }
    }
}

impl WorkerCounts {
    pub fn for_stage(&self, stage: Stage) -> usize {
        match stage {
            Stage::Fetch => self.fetch,
            Stage::Ocr => self.ocr,
            Stage::Compilation => self.compilation,
            Stage::Extraction => self.extraction,
            Stage::Deploy => self.deploy,
            Stage::Completed => 0,
        }
    }
}

/// Runtime settings for brokers, stores, and worker pools.
#[derive(Debug, Clone, Serialize)]
pub struct Settings {
    /// Broker connection URL.
    pub redis_url: String,
    /// State store location: a SQLite path or `sqlite://` URL.
    pub database_path: PathBuf,
    /// Root of the per-site artifact tree.
    pub storage_dir: PathBuf,
    /// Root the deployer publishes compiled databases into.
    pub deploy_dir: PathBuf,
    /// OCR backend name (`tesseract` is the only built-in).
    pub ocr_backend: String,
    /// Whether newly registered sites get entity extraction.
    pub enable_extraction: bool,
    pub workers: WorkerCounts,
    pub reconcile_interval: Duration,
    pub stuck_threshold: Duration,
    pub admission_age: Duration,
    /// Broker-level delivery attempts before a job lands in the failed
    /// registry.
    pub max_attempts: u32,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            redis_url: "redis://127.0.0.1:6379".to_string(),
            database_path: PathBuf::from("civipipe.db"),
            storage_dir: PathBuf::from("storage"),
            deploy_dir: PathBuf::from("deploy"),
            ocr_backend: "tesseract".to_string(),
            enable_extraction: false,
            workers: WorkerCounts::default(),
            reconcile_interval: DEFAULT_RECONCILE_INTERVAL,
            stuck_threshold: DEFAULT_STUCK_THRESHOLD,
            admission_age: DEFAULT_ADMISSION_AGE,
            max_attempts: 3,
        }
    }
}

impl Settings {
    /// Build settings from the process environment.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            redis_url: env_string("REDIS_URL").unwrap_or(defaults.redis_url),
            database_path: env_path("DATABASE_URL").unwrap_or(defaults.database_path),
            storage_dir: env_path("STORAGE_DIR").unwrap_or(defaults.storage_dir),
            deploy_dir: env_path("DEPLOY_DIR").unwrap_or(defaults.deploy_dir),
            ocr_backend: env_string("DEFAULT_OCR_BACKEND").unwrap_or(defaults.ocr_backend),
            enable_extraction: env_bool("ENABLE_EXTRACTION").unwrap_or(defaults.enable_extraction),
            workers: WorkerCounts {
                fetch: env_usize("FETCH_WORKERS").unwrap_or(defaults.workers.fetch),
                ocr: env_usize("OCR_WORKERS").unwrap_or(defaults.workers.ocr),
                compilation: env_usize("COMPILATION_WORKERS")
                    .unwrap_or(defaults.workers.compilation),
                extraction: env_usize("EXTRACTION_WORKERS").unwrap_or(defaults.workers.extraction),
                deploy: env_usize("DEPLOY_WORKERS").unwrap_or(defaults.workers.deploy),
            },
            reconcile_interval: env_duration("RECONCILE_INTERVAL")
                .unwrap_or(defaults.reconcile_interval),
            stuck_threshold: env_duration("STUCK_THRESHOLD").unwrap_or(defaults.stuck_threshold),
            admission_age: env_duration("ADMISSION_AGE").unwrap_or(defaults.admission_age),
            max_attempts: defaults.max_attempts,
        }
    }

    /// Maximum wall time for one job of the given stage.
    pub fn stage_timeout(&self, stage: Stage) -> Duration {
        match stage {
            Stage::Fetch => Duration::from_secs(10 * 60),
            Stage::Ocr => Duration::from_secs(10 * 60),
            Stage::Compilation => Duration::from_secs(30 * 60),
            Stage::Extraction => Duration::from_secs(2 * 60 * 60),
            Stage::Deploy => Duration::from_secs(10 * 60),
            Stage::Completed => Duration::from_secs(60),
        }
    }
}

fn env_string(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.is_empty())
}

fn env_path(key: &str) -> Option<PathBuf> {
    let raw = env_string(key)?;
    // Accept sqlite:// URLs for DATABASE_URL compatibility
    let raw = raw
        .strip_prefix("sqlite://")
        .or_else(|| raw.strip_prefix("sqlite:"))
        .unwrap_or(&raw);
    let expanded = shellexpand::tilde(raw);
    Some(PathBuf::from(expanded.as_ref()))
}

fn env_bool(key: &str) -> Option<bool> {
    let raw = env_string(key)?;
    match raw.to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

fn env_usize(key: &str) -> Option<usize> {
    env_string(key)?.parse().ok()
}

fn env_duration(key: &str) -> Option<Duration> {
    let raw = env_string(key)?;
    humantime::parse_duration(&raw).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let s = Settings::default();
        assert_eq!(s.workers.ocr, 4);
        assert_eq!(s.stage_timeout(Stage::Extraction), Duration::from_secs(7200));
        assert!(!s.enable_extraction);
    }

    #[test]
    fn test_env_path_strips_sqlite_scheme() {
        std::env::set_var("CIVIPIPE_TEST_DB", "sqlite:///var/lib/pipeline.db");
        let path = env_path("CIVIPIPE_TEST_DB").unwrap();
        assert_eq!(path, PathBuf::from("/var/lib/pipeline.db"));
        std::env::remove_var("CIVIPIPE_TEST_DB");
    }

    #[test]
    fn test_env_duration_parses_humantime() {
        std::env::set_var("CIVIPIPE_TEST_DUR", "2h");
        assert_eq!(
            env_duration("CIVIPIPE_TEST_DUR"),
            Some(Duration::from_secs(7200))
        );
        std::env::remove_var("CIVIPIPE_TEST_DUR");
    }
}
