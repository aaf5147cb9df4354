//! SQLite compiler: builds a site's `meetings.db` from its text artifacts.

use crate::storage::{page_id, StorageLayout};

use super::{sitedb, CapabilityError, Compiler, Result};

/// What a compilation pass produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompileSummary {
    pub pages: u32,
}

/// Compiles text artifacts into an FTS-indexed SQLite database with
/// deterministic page ids. Upsert semantics: re-running over the same text
/// is a no-op, and extraction annotations survive recompilation.
pub struct SqliteCompiler {
    /// Document kind folded into page identity.
    kind: String,
}

impl SqliteCompiler {
    pub fn new() -> Self {
        Self {
            kind: "minutes".to_string(),
        }
    }
}

impl Default for SqliteCompiler {
    fn default() -> Self {
        Self::new()
    }
}

impl Compiler for SqliteCompiler {
    fn name(&self) -> &str {
        "sqlite"
    }

    fn compile(&self, site: &str, layout: &StorageLayout) -> Result<CompileSummary> {
        let pages = layout
            .list_txt_pages(site)
            .map_err(|e| CapabilityError::Transient(format!("enumerate text artifacts: {e}")))?;

        let db_path = layout.db_path(site);
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| CapabilityError::Fatal(format!("storage dir: {e}")))?;
        }
        let conn = sitedb::open(&db_path)?;
        sitedb::init_schema(&conn)?;

        let mut compiled = 0u32;
        for page in &pages {
            let text = layout
                .read_page_text(site, page)
                .map_err(|e| CapabilityError::Transient(format!("read page text: {e}")))?;
            let id = page_id(&self.kind, &page.meeting, &page.date, page.page, &text);
            sitedb::upsert_page(&conn, &id, &page.meeting, &page.date, page.page, &text)?;
            compiled += 1;
        }

        Ok(CompileSummary { pages: compiled })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::PageRef;
    use tempfile::tempdir;

    fn page(meeting: &str, date: &str, n: u32) -> PageRef {
        PageRef {
            meeting: meeting.into(),
            date: date.into(),
            page: n,
        }
    }

    #[test]
    fn test_compile_builds_searchable_db() {
        let dir = tempdir().unwrap();
        let layout = StorageLayout::new(dir.path());
        layout
            .write_page_text("a.example", &page("council", "2024-03-12", 1), "zoning variance")
            .unwrap();
        layout
            .write_page_text("a.example", &page("council", "2024-03-12", 2), "budget hearing")
            .unwrap();

        let compiler = SqliteCompiler::new();
        let summary = compiler.compile("a.example", &layout).unwrap();
        assert_eq!(summary.pages, 2);

        let db_path = layout.db_path("a.example");
        assert_eq!(sitedb::page_count(&db_path).unwrap(), 2);
        assert_eq!(sitedb::search(&db_path, "zoning").unwrap().len(), 1);
    }

    #[test]
    fn test_recompile_is_idempotent() {
        let dir = tempdir().unwrap();
        let layout = StorageLayout::new(dir.path());
        layout
            .write_page_text("a.example", &page("council", "2024-03-12", 1), "minutes")
            .unwrap();

        let compiler = SqliteCompiler::new();
        compiler.compile("a.example", &layout).unwrap();
        let first = sitedb::list_pages(&layout.db_path("a.example")).unwrap();
        compiler.compile("a.example", &layout).unwrap();
        let second = sitedb::list_pages(&layout.db_path("a.example")).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_compile_empty_site() {
        let dir = tempdir().unwrap();
        let layout = StorageLayout::new(dir.path());
        let compiler = SqliteCompiler::new();
        let summary = compiler.compile("empty.example", &layout).unwrap();
        assert_eq!(summary.pages, 0);
        assert!(layout.db_path("empty.example").exists());
    }
}
