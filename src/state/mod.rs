//! Pipeline state store: the single source of truth for per-site progress.
//!
//! One row per site with per-stage counters. Every mutation is a single
//! conditional `UPDATE ... WHERE` so concurrent workers on different
//! machines cannot lose updates; read-modify-write never happens outside a
//! `BEGIN IMMEDIATE` transaction.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use rusqlite::{params, Connection};
use thiserror::Error;

use crate::models::{SiteRecord, Stage, StageCounters};

#[derive(Error, Debug)]
pub enum StateError {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),
    #[error("Unknown site: {0}")]
    UnknownSite(String),
    #[error("Stage has no counters: {0}")]
    Uncounted(Stage),
}

pub type Result<T> = std::result::Result<T, StateError>;

/// Which counter a terminal job outcome bumps.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CounterKind {
    Completed,
    Failed,
}

/// Handle to the site-state database. Cheap to clone; every operation opens
/// its own connection (WAL mode allows concurrent readers with one writer).
#[derive(Debug, Clone)]
pub struct PipelineStore {
    db_path: PathBuf,
}

/// Create a database connection with settings tuned for concurrent workers.
fn connect(db_path: &Path) -> Result<Connection> {
    let conn = Connection::open(db_path)?;

    // WAL mode persists, so this is effectively a one-time setting per database
    conn.execute_batch(
        r#"
        PRAGMA journal_mode = WAL;
        PRAGMA synchronous = NORMAL;
        PRAGMA foreign_keys = ON;
        PRAGMA busy_timeout = 30000;
    "#,
    )?;

    Ok(conn)
}

/// Parse a datetime string from the database.
fn parse_datetime_opt(s: Option<String>) -> Option<DateTime<Utc>> {
    s.and_then(|s| {
        DateTime::parse_from_rfc3339(&s)
            .map(|dt| dt.with_timezone(&Utc))
            .ok()
    })
}

fn now_str() -> String {
    Utc::now().to_rfc3339()
}

impl PipelineStore {
    pub fn new(db_path: impl Into<PathBuf>) -> Result<Self> {
        let store = Self {
            db_path: db_path.into(),
        };
        store.init_schema()?;
        Ok(store)
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    fn connect(&self) -> Result<Connection> {
        connect(&self.db_path)
    }

    fn init_schema(&self) -> Result<()> {
        let conn = self.connect()?;

        let mut counter_cols = String::new();
        for stage in Stage::COUNTED {
            let s = stage.as_str();
            counter_cols.push_str(&format!(
                "{s}_total INTEGER NOT NULL DEFAULT 0,
                 {s}_completed INTEGER NOT NULL DEFAULT 0,
                 {s}_failed INTEGER NOT NULL DEFAULT 0,\n"
            ));
        }

        conn.execute_batch(&format!(
            r#"
            CREATE TABLE IF NOT EXISTS sites (
                subdomain TEXT PRIMARY KEY,
                current_stage TEXT,
                started_at TEXT,
                updated_at TEXT,
                coordinator_enqueued INTEGER NOT NULL DEFAULT 0,
                extraction_enabled INTEGER NOT NULL DEFAULT 0,
                last_error_stage TEXT,
                last_error_message TEXT,
                last_error_at TEXT,
                {counter_cols}
                created_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_sites_current_stage
                ON sites(current_stage);
            CREATE INDEX IF NOT EXISTS idx_sites_updated_at
                ON sites(updated_at);
            CREATE INDEX IF NOT EXISTS idx_sites_coordinator_pending
                ON sites(subdomain, coordinator_enqueued)
                WHERE coordinator_enqueued = 0;

            CREATE TABLE IF NOT EXISTS site_jobs (
                job_id TEXT PRIMARY KEY,
                subdomain TEXT NOT NULL,
                stage TEXT NOT NULL,
                created_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_site_jobs_subdomain
                ON site_jobs(subdomain);
        "#
        ))?;

        Ok(())
    }

    /// Register a site. Idempotent; re-registration updates the extraction
    /// flag only.
    pub fn register_site(&self, subdomain: &str, extraction_enabled: bool) -> Result<()> {
        let conn = self.connect()?;
        conn.execute(
            r#"
            INSERT INTO sites (subdomain, extraction_enabled, created_at)
            VALUES (?1, ?2, ?3)
            ON CONFLICT(subdomain) DO UPDATE SET
                extraction_enabled = excluded.extraction_enabled
            "#,
            params![subdomain, extraction_enabled as i64, now_str()],
        )?;
        Ok(())
    }

    pub fn get_site(&self, subdomain: &str) -> Result<Option<SiteRecord>> {
        let conn = self.connect()?;
        let mut stmt = conn.prepare("SELECT * FROM sites WHERE subdomain = ?1")?;
        let mut rows = stmt.query_map(params![subdomain], row_to_site)?;
        match rows.next() {
            Some(row) => Ok(Some(row?)),
            None => Ok(None),
        }
    }

    pub fn list_sites(&self) -> Result<Vec<SiteRecord>> {
        let conn = self.connect()?;
        let mut stmt = conn.prepare("SELECT * FROM sites ORDER BY subdomain")?;
        let sites = stmt
            .query_map([], row_to_site)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(sites)
    }

    /// Enter a stage: set `current_stage`, seed its counters, release the
    /// coordinator guard.
    pub fn initialize_stage(&self, subdomain: &str, stage: Stage, total: u32) -> Result<()> {
        let s = counted(stage)?;
        let conn = self.connect()?;
        let now = now_str();
        let changed = conn.execute(
            &format!(
                r#"
                UPDATE sites SET
                    current_stage = ?2,
                    {s}_total = ?3,
                    {s}_completed = 0,
                    {s}_failed = 0,
                    coordinator_enqueued = 0,
                    started_at = COALESCE(started_at, ?4),
                    updated_at = MAX(COALESCE(updated_at, ''), ?4)
                WHERE subdomain = ?1
                "#
            ),
            params![subdomain, stage.as_str(), total, now],
        )?;
        if changed == 0 {
            return Err(StateError::UnknownSite(subdomain.to_string()));
        }
        Ok(())
    }

    /// Bump a stage counter. Returns the post-update counters, or `None`
    /// when the update cannot land: the site left `stage` (purged or reset),
    /// or the stage already settled (a redelivered job racing its own first
    /// delivery). Callers must then drop the outcome and leave state alone.
    pub fn increment(
        &self,
        subdomain: &str,
        stage: Stage,
        kind: CounterKind,
    ) -> Result<Option<StageCounters>> {
        let s = counted(stage)?;
        let col = match kind {
            CounterKind::Completed => format!("{s}_completed"),
            CounterKind::Failed => format!("{s}_failed"),
        };
        let conn = self.connect()?;
        conn.execute("BEGIN IMMEDIATE", [])?;

        let result: Result<Option<StageCounters>> = (|| {
            let changed = conn.execute(
                &format!(
                    r#"
                    UPDATE sites SET
                        {col} = {col} + 1,
                        updated_at = MAX(COALESCE(updated_at, ''), ?3)
                    WHERE subdomain = ?1 AND current_stage = ?2
                      AND {s}_completed + {s}_failed < {s}_total
                    "#
                ),
                params![subdomain, stage.as_str(), now_str()],
            )?;
            if changed == 0 {
                return Ok(None);
            }
            let counters = conn.query_row(
                &format!(
                    "SELECT {s}_completed, {s}_failed, {s}_total FROM sites WHERE subdomain = ?1"
                ),
                params![subdomain],
                |row| {
                    Ok(StageCounters {
                        completed: row.get(0)?,
                        failed: row.get(1)?,
                        total: row.get(2)?,
                    })
                },
            )?;
            Ok(Some(counters))
        })();

        if result.is_ok() {
            conn.execute("COMMIT", [])?;
        } else {
            let _ = conn.execute("ROLLBACK", []);
        }

        result
    }

    /// Flip the coordinator guard false -> true, but only while the stage's
    /// counters are settled and nobody else has claimed. Exactly one caller
    /// per (site, current_stage) wins.
    pub fn claim_coordinator(&self, subdomain: &str, stage: Stage) -> Result<bool> {
        let s = counted(stage)?;
        let conn = self.connect()?;
        let changed = conn.execute(
            &format!(
                r#"
                UPDATE sites SET
                    coordinator_enqueued = 1,
                    updated_at = MAX(COALESCE(updated_at, ''), ?3)
                WHERE subdomain = ?1
                  AND current_stage = ?2
                  AND coordinator_enqueued = 0
                  AND {s}_completed + {s}_failed = {s}_total
                "#
            ),
            params![subdomain, stage.as_str(), now_str()],
        )?;
        Ok(changed == 1)
    }

    /// Drop a stale coordinator claim so the reconciler can re-claim. Only
    /// meaningful for stuck sites: a live coordinator would have advanced
    /// the stage long before the stuck threshold.
    pub fn release_coordinator(&self, subdomain: &str, stage: Stage) -> Result<bool> {
        let conn = self.connect()?;
        let changed = conn.execute(
            r#"
            UPDATE sites SET coordinator_enqueued = 0
            WHERE subdomain = ?1 AND current_stage = ?2 AND coordinator_enqueued = 1
            "#,
            params![subdomain, stage.as_str()],
        )?;
        Ok(changed == 1)
    }

    /// Move the site to its next stage, seeding the new stage's counters.
    /// Coordinators are the only callers.
    pub fn advance_stage(&self, subdomain: &str, to_stage: Stage, total: u32) -> Result<()> {
        if to_stage == Stage::Completed {
            let conn = self.connect()?;
            let changed = conn.execute(
                r#"
                UPDATE sites SET
                    current_stage = 'completed',
                    coordinator_enqueued = 0,
                    updated_at = MAX(COALESCE(updated_at, ''), ?2)
                WHERE subdomain = ?1
                "#,
                params![subdomain, now_str()],
            )?;
            if changed == 0 {
                return Err(StateError::UnknownSite(subdomain.to_string()));
            }
            return Ok(());
        }
        self.initialize_stage(subdomain, to_stage, total)
    }

    /// Record a site-level error without touching counters.
    pub fn record_error(&self, subdomain: &str, stage: Stage, message: &str) -> Result<()> {
        let conn = self.connect()?;
        let now = now_str();
        conn.execute(
            r#"
            UPDATE sites SET
                last_error_stage = ?2,
                last_error_message = ?3,
                last_error_at = ?4,
                updated_at = MAX(COALESCE(updated_at, ''), ?4)
            WHERE subdomain = ?1
            "#,
            params![subdomain, stage.as_str(), message, now],
        )?;
        Ok(())
    }

    /// Sites mid-pipeline whose last update is older than the threshold.
    pub fn snapshot_stuck(&self, threshold: std::time::Duration) -> Result<Vec<SiteRecord>> {
        let cutoff = (Utc::now()
            - ChronoDuration::from_std(threshold).unwrap_or(ChronoDuration::zero()))
        .to_rfc3339();
        let conn = self.connect()?;
        let mut stmt = conn.prepare(
            r#"
            SELECT * FROM sites
            WHERE current_stage IS NOT NULL
              AND current_stage != 'completed'
              AND updated_at IS NOT NULL
              AND updated_at < ?1
            ORDER BY updated_at ASC
            "#,
        )?;
        let sites = stmt
            .query_map(params![cutoff], row_to_site)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(sites)
    }

    /// The stalest site eligible for re-admission: never-processed sites
    /// first, then by oldest `updated_at` beyond the age threshold. Sites
    /// still mid-pipeline are never eligible, however stale; re-admitting
    /// one would reset its stage out from under in-flight workers, and
    /// unsticking is the reconciler's job.
    pub fn oldest_eligible(&self, age: std::time::Duration) -> Result<Option<String>> {
        let cutoff =
            (Utc::now() - ChronoDuration::from_std(age).unwrap_or(ChronoDuration::zero()))
                .to_rfc3339();
        let conn = self.connect()?;
        let result = conn.query_row(
            r#"
            SELECT subdomain FROM sites
            WHERE (current_stage IS NULL OR current_stage = 'completed')
              AND (updated_at IS NULL OR updated_at < ?1)
            ORDER BY updated_at IS NOT NULL, updated_at ASC
            LIMIT 1
            "#,
            params![cutoff],
            |row| row.get::<_, String>(0),
        );
        match result {
            Ok(subdomain) => Ok(Some(subdomain)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Reconciler-only: overwrite a stage's counters with recounted ground
    /// truth. Guarded on `current_stage` so a site that moved on is left
    /// alone.
    pub fn set_stage_counters(
        &self,
        subdomain: &str,
        stage: Stage,
        total: u32,
        completed: u32,
        failed: u32,
    ) -> Result<bool> {
        let s = counted(stage)?;
        let conn = self.connect()?;
        let changed = conn.execute(
            &format!(
                r#"
                UPDATE sites SET
                    {s}_total = ?3,
                    {s}_completed = ?4,
                    {s}_failed = ?5,
                    updated_at = MAX(COALESCE(updated_at, ''), ?6)
                WHERE subdomain = ?1 AND current_stage = ?2
                "#
            ),
            params![subdomain, stage.as_str(), total, completed, failed, now_str()],
        )?;
        Ok(changed == 1)
    }

    /// Refresh `updated_at` without changing anything else. Keeps a site
    /// out of the next stuck scan after it has been healed.
    pub fn touch_site(&self, subdomain: &str) -> Result<()> {
        let conn = self.connect()?;
        conn.execute(
            "UPDATE sites SET updated_at = MAX(COALESCE(updated_at, ''), ?2) WHERE subdomain = ?1",
            params![subdomain, now_str()],
        )?;
        Ok(())
    }

    /// Purge support: drop the site out of the pipeline and zero every
    /// counter. In-flight workers then see their conditional increments
    /// match zero rows and stand down.
    pub fn reset_site(&self, subdomain: &str) -> Result<()> {
        let mut zeroes = String::new();
        for stage in Stage::COUNTED {
            let s = stage.as_str();
            zeroes.push_str(&format!(
                "{s}_total = 0, {s}_completed = 0, {s}_failed = 0,\n"
            ));
        }
        let conn = self.connect()?;
        let changed = conn.execute(
            &format!(
                r#"
                UPDATE sites SET
                    current_stage = NULL,
                    coordinator_enqueued = 0,
                    {zeroes}
                    updated_at = MAX(COALESCE(updated_at, ''), ?2)
                WHERE subdomain = ?1
                "#
            ),
            params![subdomain, now_str()],
        )?;
        if changed == 0 {
            return Err(StateError::UnknownSite(subdomain.to_string()));
        }
        Ok(())
    }

    // Job tracking rows: observability and purge only, never a correctness
    // input.

    pub fn track_jobs(&self, subdomain: &str, stage: Stage, job_ids: &[String]) -> Result<()> {
        if job_ids.is_empty() {
            return Ok(());
        }
        let mut conn = self.connect()?;
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare(
                "INSERT OR REPLACE INTO site_jobs (job_id, subdomain, stage, created_at)
                 VALUES (?1, ?2, ?3, ?4)",
            )?;
            let now = now_str();
            for job_id in job_ids {
                stmt.execute(params![job_id, subdomain, stage.as_str(), now])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    pub fn jobs_for_site(&self, subdomain: &str) -> Result<Vec<(String, String)>> {
        let conn = self.connect()?;
        let mut stmt = conn.prepare(
            "SELECT job_id, stage FROM site_jobs WHERE subdomain = ?1 ORDER BY created_at",
        )?;
        let jobs = stmt
            .query_map(params![subdomain], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(jobs)
    }

    pub fn clear_tracking(&self, subdomain: &str) -> Result<usize> {
        let conn = self.connect()?;
        let removed = conn.execute(
            "DELETE FROM site_jobs WHERE subdomain = ?1",
            params![subdomain],
        )?;
        Ok(removed)
    }
}

fn counted(stage: Stage) -> Result<&'static str> {
    if stage == Stage::Completed {
        return Err(StateError::Uncounted(stage));
    }
    Ok(stage.as_str())
}

fn row_to_site(row: &rusqlite::Row<'_>) -> rusqlite::Result<SiteRecord> {
    let stage_counters = |s: &str| -> rusqlite::Result<StageCounters> {
        Ok(StageCounters {
            total: row.get(format!("{s}_total").as_str())?,
            completed: row.get(format!("{s}_completed").as_str())?,
            failed: row.get(format!("{s}_failed").as_str())?,
        })
    };
    Ok(SiteRecord {
        subdomain: row.get("subdomain")?,
        current_stage: row
            .get::<_, Option<String>>("current_stage")?
            .as_deref()
            .and_then(Stage::parse),
        started_at: parse_datetime_opt(row.get("started_at")?),
        updated_at: parse_datetime_opt(row.get("updated_at")?),
        coordinator_enqueued: row.get::<_, i64>("coordinator_enqueued")? != 0,
        extraction_enabled: row.get::<_, i64>("extraction_enabled")? != 0,
        last_error_stage: row.get("last_error_stage")?,
        last_error_message: row.get("last_error_message")?,
        last_error_at: parse_datetime_opt(row.get("last_error_at")?),
        fetch: stage_counters("fetch")?,
        ocr: stage_counters("ocr")?,
        compilation: stage_counters("compilation")?,
        extraction: stage_counters("extraction")?,
        deploy: stage_counters("deploy")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn store() -> (tempfile::TempDir, PipelineStore) {
        let dir = tempdir().unwrap();
        let store = PipelineStore::new(dir.path().join("state.db")).unwrap();
        (dir, store)
    }

    #[test]
    fn test_register_and_get() {
        let (_dir, store) = store();
        store.register_site("a.example", true).unwrap();
        let site = store.get_site("a.example").unwrap().unwrap();
        assert_eq!(site.subdomain, "a.example");
        assert!(site.extraction_enabled);
        assert!(site.current_stage.is_none());

        // Re-registration only updates the extraction flag
        store.register_site("a.example", false).unwrap();
        let site = store.get_site("a.example").unwrap().unwrap();
        assert!(!site.extraction_enabled);
    }

    #[test]
    fn test_initialize_and_increment() {
        let (_dir, store) = store();
        store.register_site("a.example", false).unwrap();
        store.initialize_stage("a.example", Stage::Ocr, 3).unwrap();

        let c = store
            .increment("a.example", Stage::Ocr, CounterKind::Completed)
            .unwrap()
            .unwrap();
        assert_eq!((c.completed, c.failed, c.total), (1, 0, 3));

        let c = store
            .increment("a.example", Stage::Ocr, CounterKind::Failed)
            .unwrap()
            .unwrap();
        assert_eq!((c.completed, c.failed, c.total), (1, 1, 3));
        assert!(!c.is_settled());

        let c = store
            .increment("a.example", Stage::Ocr, CounterKind::Completed)
            .unwrap()
            .unwrap();
        assert!(c.is_settled());
    }

    #[test]
    fn test_increment_rejected_once_settled() {
        let (_dir, store) = store();
        store.register_site("a.example", false).unwrap();
        store.initialize_stage("a.example", Stage::Ocr, 1).unwrap();
        store
            .increment("a.example", Stage::Ocr, CounterKind::Completed)
            .unwrap()
            .unwrap();

        // A redelivered duplicate cannot push counters past total
        let result = store
            .increment("a.example", Stage::Ocr, CounterKind::Completed)
            .unwrap();
        assert!(result.is_none());
        let site = store.get_site("a.example").unwrap().unwrap();
        assert_eq!(site.ocr.completed, 1);
    }

    #[test]
    fn test_increment_wrong_stage_is_noop() {
        let (_dir, store) = store();
        store.register_site("a.example", false).unwrap();
        store.initialize_stage("a.example", Stage::Ocr, 3).unwrap();

        // A late fetch-stage increment after the site moved on must not land
        let result = store
            .increment("a.example", Stage::Fetch, CounterKind::Completed)
            .unwrap();
        assert!(result.is_none());
        let site = store.get_site("a.example").unwrap().unwrap();
        assert_eq!(site.fetch.completed, 0);
    }

    #[test]
    fn test_claim_coordinator_requires_settled() {
        let (_dir, store) = store();
        store.register_site("a.example", false).unwrap();
        store.initialize_stage("a.example", Stage::Ocr, 2).unwrap();

        assert!(!store.claim_coordinator("a.example", Stage::Ocr).unwrap());
        store
            .increment("a.example", Stage::Ocr, CounterKind::Completed)
            .unwrap();
        store
            .increment("a.example", Stage::Ocr, CounterKind::Failed)
            .unwrap();

        assert!(store.claim_coordinator("a.example", Stage::Ocr).unwrap());
        // Second claim loses
        assert!(!store.claim_coordinator("a.example", Stage::Ocr).unwrap());
    }

    #[test]
    fn test_claim_coordinator_zero_total() {
        let (_dir, store) = store();
        store.register_site("a.example", false).unwrap();
        store.initialize_stage("a.example", Stage::Ocr, 0).unwrap();
        assert!(store.claim_coordinator("a.example", Stage::Ocr).unwrap());
    }

    #[test]
    fn test_exactly_one_claim_under_contention() {
        let (_dir, store) = store();
        store.register_site("a.example", false).unwrap();
        store.initialize_stage("a.example", Stage::Ocr, 8).unwrap();

        let mut handles = Vec::new();
        for _ in 0..8 {
            let store = store.clone();
            handles.push(std::thread::spawn(move || {
                let counters = store
                    .increment("a.example", Stage::Ocr, CounterKind::Completed)
                    .unwrap()
                    .unwrap();
                if counters.is_settled() {
                    store.claim_coordinator("a.example", Stage::Ocr).unwrap()
                } else {
                    false
                }
            }));
        }
        let claims: usize = handles
            .into_iter()
            .map(|h| h.join().unwrap() as usize)
            .sum();
        assert_eq!(claims, 1);

        let site = store.get_site("a.example").unwrap().unwrap();
        assert_eq!(site.ocr.completed, 8);
        assert!(site.coordinator_enqueued);
    }

    #[test]
    fn test_advance_resets_coordinator_guard() {
        let (_dir, store) = store();
        store.register_site("a.example", false).unwrap();
        store.initialize_stage("a.example", Stage::Ocr, 0).unwrap();
        assert!(store.claim_coordinator("a.example", Stage::Ocr).unwrap());

        store
            .advance_stage("a.example", Stage::Compilation, 1)
            .unwrap();
        let site = store.get_site("a.example").unwrap().unwrap();
        assert_eq!(site.current_stage, Some(Stage::Compilation));
        assert!(!site.coordinator_enqueued);
        assert_eq!(site.compilation.total, 1);

        store
            .advance_stage("a.example", Stage::Completed, 1)
            .unwrap();
        let site = store.get_site("a.example").unwrap().unwrap();
        assert_eq!(site.current_stage, Some(Stage::Completed));
    }

    #[test]
    fn test_record_error_preserves_counters() {
        let (_dir, store) = store();
        store.register_site("a.example", false).unwrap();
        store.initialize_stage("a.example", Stage::Fetch, 1).unwrap();
        store
            .record_error("a.example", Stage::Fetch, "no documents")
            .unwrap();
        let site = store.get_site("a.example").unwrap().unwrap();
        assert_eq!(site.last_error_stage.as_deref(), Some("fetch"));
        assert_eq!(site.last_error_message.as_deref(), Some("no documents"));
        assert_eq!(site.fetch.total, 1);
    }

    #[test]
    fn test_snapshot_stuck() {
        let (_dir, store) = store();
        store.register_site("old.example", false).unwrap();
        store.register_site("fresh.example", false).unwrap();
        store.register_site("done.example", false).unwrap();
        store
            .initialize_stage("old.example", Stage::Ocr, 5)
            .unwrap();
        store
            .initialize_stage("fresh.example", Stage::Ocr, 5)
            .unwrap();
        store
            .initialize_stage("done.example", Stage::Deploy, 1)
            .unwrap();
        store
            .advance_stage("done.example", Stage::Completed, 1)
            .unwrap();

        // Backdate old.example
        let conn = connect(store.db_path()).unwrap();
        let old = (Utc::now() - ChronoDuration::hours(3)).to_rfc3339();
        conn.execute(
            "UPDATE sites SET updated_at = ?1 WHERE subdomain = 'old.example'",
            params![old],
        )
        .unwrap();

        let stuck = store
            .snapshot_stuck(std::time::Duration::from_secs(2 * 3600))
            .unwrap();
        let names: Vec<_> = stuck.iter().map(|s| s.subdomain.as_str()).collect();
        assert_eq!(names, vec!["old.example"]);
    }

    #[test]
    fn test_oldest_eligible_null_first() {
        let (_dir, store) = store();
        store.register_site("touched.example", false).unwrap();
        store.register_site("untouched.example", false).unwrap();
        store
            .initialize_stage("touched.example", Stage::Fetch, 1)
            .unwrap();

        // Only the never-touched site is older than any threshold
        let next = store
            .oldest_eligible(std::time::Duration::from_secs(0))
            .unwrap();
        assert_eq!(next.as_deref(), Some("untouched.example"));
    }

    #[test]
    fn test_oldest_eligible_skips_sites_mid_pipeline() {
        let (_dir, store) = store();
        store.register_site("stalled.example", false).unwrap();
        store.register_site("finished.example", false).unwrap();
        store
            .initialize_stage("stalled.example", Stage::Ocr, 5)
            .unwrap();
        store
            .initialize_stage("finished.example", Stage::Deploy, 1)
            .unwrap();
        store
            .advance_stage("finished.example", Stage::Completed, 1)
            .unwrap();

        // Both sites look ancient
        let old = (Utc::now() - ChronoDuration::days(2)).to_rfc3339();
        let conn = connect(store.db_path()).unwrap();
        conn.execute("UPDATE sites SET updated_at = ?1", params![old])
            .unwrap();

        // A site stuck mid-pipeline is the reconciler's problem, never the
        // scheduler's: only the completed site may be re-admitted
        let next = store
            .oldest_eligible(std::time::Duration::from_secs(23 * 3600))
            .unwrap();
        assert_eq!(next.as_deref(), Some("finished.example"));
    }

    #[test]
    fn test_reset_site_zeroes_counters() {
        let (_dir, store) = store();
        store.register_site("a.example", false).unwrap();
        store.initialize_stage("a.example", Stage::Ocr, 5).unwrap();
        store
            .increment("a.example", Stage::Ocr, CounterKind::Completed)
            .unwrap();

        store.reset_site("a.example").unwrap();
        let site = store.get_site("a.example").unwrap().unwrap();
        assert!(site.current_stage.is_none());
        assert_eq!(site.ocr.total, 0);
        assert_eq!(site.ocr.completed, 0);

        // Late increments from purged workers are rejected
        let result = store
            .increment("a.example", Stage::Ocr, CounterKind::Completed)
            .unwrap();
        assert!(result.is_none());
    }

    #[test]
    fn test_set_stage_counters_guarded_by_stage() {
        let (_dir, store) = store();
        store.register_site("a.example", false).unwrap();
        store.initialize_stage("a.example", Stage::Ocr, 8).unwrap();

        assert!(store
            .set_stage_counters("a.example", Stage::Ocr, 8, 8, 0)
            .unwrap());
        let site = store.get_site("a.example").unwrap().unwrap();
        assert_eq!(site.ocr.completed, 8);

        // Site moved on: rewrite refuses
        store
            .advance_stage("a.example", Stage::Compilation, 1)
            .unwrap();
        assert!(!store
            .set_stage_counters("a.example", Stage::Ocr, 8, 4, 4)
            .unwrap());
    }

    #[test]
    fn test_job_tracking() {
        let (_dir, store) = store();
        store.register_site("a.example", false).unwrap();
        store
            .track_jobs(
                "a.example",
                Stage::Ocr,
                &["job-1".to_string(), "job-2".to_string()],
            )
            .unwrap();
        let jobs = store.jobs_for_site("a.example").unwrap();
        assert_eq!(jobs.len(), 2);
        assert_eq!(jobs[0].1, "ocr");

        assert_eq!(store.clear_tracking("a.example").unwrap(), 2);
        assert!(store.jobs_for_site("a.example").unwrap().is_empty());
    }

    #[test]
    fn test_updated_at_monotonic() {
        let (_dir, store) = store();
        store.register_site("a.example", false).unwrap();
        store.initialize_stage("a.example", Stage::Ocr, 1).unwrap();

        // Force a future updated_at, then verify a new write cannot move it
        // backwards
        let future = (Utc::now() + ChronoDuration::hours(1)).to_rfc3339();
        let conn = connect(store.db_path()).unwrap();
        conn.execute(
            "UPDATE sites SET updated_at = ?1 WHERE subdomain = 'a.example'",
            params![future],
        )
        .unwrap();

        store
            .increment("a.example", Stage::Ocr, CounterKind::Completed)
            .unwrap();
        let site = store.get_site("a.example").unwrap().unwrap();
        assert!(site.updated_at.unwrap() > Utc::now() + ChronoDuration::minutes(30));
    }
}
