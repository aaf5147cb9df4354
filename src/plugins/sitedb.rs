//! Per-site `meetings.db` access: page rows, FTS index, extraction
//! annotations.
//!
//! Page identity is deterministic (`storage::page_id`), so recompilation is
//! an upsert and never disturbs extraction annotations already applied.

use std::path::Path;

use rusqlite::{params, Connection};

use crate::models::PageAnnotations;

use super::{CapabilityError, Result};

/// A page row in a site database.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageRow {
    pub id: String,
    pub meeting: String,
    pub date: String,
    pub page: u32,
}

pub fn open(db_path: &Path) -> Result<Connection> {
    let conn = Connection::open(db_path)
        .map_err(|e| CapabilityError::Transient(format!("open {}: {e}", db_path.display())))?;
    conn.execute_batch(
        r#"
        PRAGMA journal_mode = WAL;
        PRAGMA synchronous = NORMAL;
        PRAGMA busy_timeout = 30000;
    "#,
    )
    .map_err(db_err)?;
    Ok(conn)
}

pub fn init_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS pages (
            id TEXT PRIMARY KEY,
            meeting TEXT NOT NULL,
            date TEXT NOT NULL,
            page INTEGER NOT NULL,
            text TEXT NOT NULL,
            entities_extracted INTEGER NOT NULL DEFAULT 0,
            UNIQUE(meeting, date, page)
        );

        CREATE VIRTUAL TABLE IF NOT EXISTS pages_fts
            USING fts5(page_id UNINDEXED, text);

        CREATE TABLE IF NOT EXISTS entities (
            page_id TEXT NOT NULL,
            kind TEXT NOT NULL,
            value TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_entities_page ON entities(page_id);

        CREATE TABLE IF NOT EXISTS votes (
            page_id TEXT NOT NULL,
            motion TEXT NOT NULL,
            ayes INTEGER NOT NULL,
            nays INTEGER NOT NULL,
            abstains INTEGER NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_votes_page ON votes(page_id);
    "#,
    )
    .map_err(db_err)?;
    Ok(())
}

/// Insert or refresh a page and its FTS row. The `entities_extracted` flag
/// survives re-compilation.
pub fn upsert_page(
    conn: &Connection,
    id: &str,
    meeting: &str,
    date: &str,
    page: u32,
    text: &str,
) -> Result<()> {
    // Drop the FTS row under the page's previous identity, if any
    conn.execute(
        r#"
        DELETE FROM pages_fts WHERE page_id IN (
            SELECT id FROM pages WHERE meeting = ?1 AND date = ?2 AND page = ?3
        )
        "#,
        params![meeting, date, page],
    )
    .map_err(db_err)?;

    conn.execute(
        r#"
        INSERT INTO pages (id, meeting, date, page, text)
        VALUES (?1, ?2, ?3, ?4, ?5)
        ON CONFLICT(meeting, date, page) DO UPDATE SET
            id = excluded.id,
            text = excluded.text
        "#,
        params![id, meeting, date, page, text],
    )
    .map_err(db_err)?;

    conn.execute(
        "INSERT INTO pages_fts (page_id, text) VALUES (?1, ?2)",
        params![id, text],
    )
    .map_err(db_err)?;
    Ok(())
}

pub fn page_count(db_path: &Path) -> Result<u32> {
    let conn = open(db_path)?;
    let count: u32 = conn
        .query_row("SELECT COUNT(*) FROM pages", [], |row| row.get(0))
        .map_err(db_err)?;
    Ok(count)
}

/// Pages whose extraction annotations have been applied. This is the
/// reconciler's ground truth for the extraction stage.
pub fn extracted_page_count(db_path: &Path) -> Result<u32> {
    let conn = open(db_path)?;
    let count: u32 = conn
        .query_row(
            "SELECT COUNT(*) FROM pages WHERE entities_extracted = 1",
            [],
            |row| row.get(0),
        )
        .map_err(db_err)?;
    Ok(count)
}

pub fn list_pages(db_path: &Path) -> Result<Vec<PageRow>> {
    let conn = open(db_path)?;
    let mut stmt = conn
        .prepare("SELECT id, meeting, date, page FROM pages ORDER BY meeting, date, page")
        .map_err(db_err)?;
    let pages = stmt
        .query_map([], |row| {
            Ok(PageRow {
                id: row.get(0)?,
                meeting: row.get(1)?,
                date: row.get(2)?,
                page: row.get(3)?,
            })
        })
        .map_err(db_err)?
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(db_err)?;
    Ok(pages)
}

/// Whether a specific page already has annotations applied.
pub fn is_page_extracted(db_path: &Path, page_id: &str) -> Result<bool> {
    let conn = open(db_path)?;
    let extracted: Option<i64> = conn
        .query_row(
            "SELECT entities_extracted FROM pages WHERE id = ?1",
            params![page_id],
            |row| row.get(0),
        )
        .map(Some)
        .or_else(|e| match e {
            rusqlite::Error::QueryReturnedNoRows => Ok(None),
            e => Err(db_err(e)),
        })?;
    Ok(extracted == Some(1))
}

/// Persist one page's extraction output and mark the page as annotated.
pub fn apply_annotations(
    db_path: &Path,
    page_id: &str,
    annotations: &PageAnnotations,
) -> Result<()> {
    let mut conn = open(db_path)?;
    let tx = conn
        .transaction()
        .map_err(db_err)?;

    let changed = tx
        .execute(
            "UPDATE pages SET entities_extracted = 1 WHERE id = ?1",
            params![page_id],
        )
        .map_err(db_err)?;
    if changed == 0 {
        return Err(CapabilityError::Item(format!(
            "page {page_id} not present in site database"
        )));
    }

    tx.execute("DELETE FROM entities WHERE page_id = ?1", params![page_id])
        .map_err(db_err)?;
    tx.execute("DELETE FROM votes WHERE page_id = ?1", params![page_id])
        .map_err(db_err)?;
    for entity in &annotations.entities {
        tx.execute(
            "INSERT INTO entities (page_id, kind, value) VALUES (?1, ?2, ?3)",
            params![page_id, entity.kind, entity.value],
        )
        .map_err(db_err)?;
    }
    for vote in &annotations.votes {
        tx.execute(
            "INSERT INTO votes (page_id, motion, ayes, nays, abstains)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![page_id, vote.motion, vote.ayes, vote.nays, vote.abstains],
        )
        .map_err(db_err)?;
    }
    tx.commit().map_err(db_err)?;
    Ok(())
}

/// Full-text search over page text. Returns matching page ids.
pub fn search(db_path: &Path, query: &str) -> Result<Vec<String>> {
    let conn = open(db_path)?;
    let mut stmt = conn
        .prepare("SELECT page_id FROM pages_fts WHERE pages_fts MATCH ?1 ORDER BY rank")
        .map_err(db_err)?;
    let ids = stmt
        .query_map(params![query], |row| row.get::<_, String>(0))
        .map_err(db_err)?
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(db_err)?;
    Ok(ids)
}

fn db_err(e: rusqlite::Error) -> CapabilityError {
    CapabilityError::Transient(format!("site database error: {e}"))
}
