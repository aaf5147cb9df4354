//! On-disk artifact layout for per-site pipeline outputs.
//!
//! The filesystem is the durable store for per-page work:
//!
//! ```text
//! <storage>/<site>/pdfs/<meeting>/<date>/<page>.pdf
//! <storage>/<site>/txt/<meeting>/<date>/<page>.txt
//! <storage>/<site>/meetings.db
//! <storage>/<site>/ocr_failures_<run>.jsonl   (append-only)
//! ```
//!
//! Counters in the state store are a materialized cache of this tree; the
//! reconciler treats the tree as ground truth.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// A page's position within a site's document tree.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PageRef {
    pub meeting: String,
    pub date: String,
    pub page: u32,
}

/// One line of an OCR failure manifest.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailureEntry {
    pub at: String,
    pub site: String,
    pub stage: String,
    pub meeting: String,
    pub date: String,
    pub page: u32,
    pub job_id: String,
    pub error: String,
}

/// Compute the deterministic identity of a processed page.
///
/// `sha256(kind, meeting, date, page, text)` hex-truncated to 12 characters.
/// Field values are joined with an unprintable separator so adjacent fields
/// cannot collide.
pub fn page_id(kind: &str, meeting: &str, date: &str, page: u32, text: &str) -> String {
    let mut hasher = Sha256::new();
    for part in [kind, meeting, date] {
        hasher.update(part.as_bytes());
        hasher.update([0x1f]);
    }
    hasher.update(page.to_string().as_bytes());
    hasher.update([0x1f]);
    hasher.update(text.as_bytes());
    hex::encode(hasher.finalize())[..12].to_string()
}

/// Replace path-hostile characters in a meeting or date component.
pub fn sanitize_component(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| {
            if c.is_alphanumeric() || c == '-' || c == '_' || c == '.' {
                c
            } else {
                '_'
            }
        })
        .collect();
    let trimmed = cleaned.trim_matches(['_', '.']).to_string();
    if trimmed.is_empty() {
        "unnamed".to_string()
    } else {
        trimmed
    }
}

/// Resolves artifact paths under a storage root.
#[derive(Debug, Clone)]
pub struct StorageLayout {
    root: PathBuf,
}

impl StorageLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn site_dir(&self, site: &str) -> PathBuf {
        self.root.join(site)
    }

    pub fn pdf_dir(&self, site: &str) -> PathBuf {
        self.site_dir(site).join("pdfs")
    }

    pub fn txt_dir(&self, site: &str) -> PathBuf {
        self.site_dir(site).join("txt")
    }

    pub fn pdf_page_path(&self, site: &str, page: &PageRef) -> PathBuf {
        self.pdf_dir(site)
            .join(sanitize_component(&page.meeting))
            .join(sanitize_component(&page.date))
            .join(format!("{}.pdf", page.page))
    }

    pub fn txt_page_path(&self, site: &str, page: &PageRef) -> PathBuf {
        self.txt_dir(site)
            .join(sanitize_component(&page.meeting))
            .join(sanitize_component(&page.date))
            .join(format!("{}.txt", page.page))
    }

    pub fn db_path(&self, site: &str) -> PathBuf {
        self.site_dir(site).join("meetings.db")
    }

    pub fn failure_manifest_path(&self, site: &str, run_id: &str) -> PathBuf {
        self.site_dir(site)
            .join(format!("ocr_failures_{}.jsonl", run_id))
    }

    /// Write a page's OCR text. A temp-file rename keeps concurrent retries
    /// from observing a half-written artifact.
    pub fn write_page_text(&self, site: &str, page: &PageRef, text: &str) -> std::io::Result<()> {
        let path = self.txt_page_path(site, page);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let tmp = path.with_extension("txt.tmp");
        fs::write(&tmp, text)?;
        fs::rename(&tmp, &path)?;
        Ok(())
    }

    /// A page's text artifact exists and is non-empty.
    pub fn has_page_text(&self, site: &str, page: &PageRef) -> bool {
        let path = self.txt_page_path(site, page);
        fs::metadata(&path).map(|m| m.len() > 0).unwrap_or(false)
    }

    pub fn read_page_text(&self, site: &str, page: &PageRef) -> std::io::Result<String> {
        fs::read_to_string(self.txt_page_path(site, page))
    }

    /// Append a failure record to the site's manifest for this run.
    pub fn append_failure(&self, run_id: &str, entry: &FailureEntry) -> std::io::Result<()> {
        let path = self.failure_manifest_path(&entry.site, run_id);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut file = fs::OpenOptions::new().create(true).append(true).open(path)?;
        let line = serde_json::to_string(entry).map_err(std::io::Error::other)?;
        writeln!(file, "{}", line)?;
        Ok(())
    }

    /// Pages recorded as failed across every run's manifest for a site.
    pub fn failed_pages(&self, site: &str) -> std::io::Result<Vec<PageRef>> {
        let mut failed = Vec::new();
        let site_dir = self.site_dir(site);
        let entries = match fs::read_dir(&site_dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(failed),
            Err(e) => return Err(e),
        };
        for entry in entries {
            let entry = entry?;
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if !name.starts_with("ocr_failures_") || !name.ends_with(".jsonl") {
                continue;
            }
            let content = fs::read_to_string(entry.path())?;
            for line in content.lines() {
                if let Ok(rec) = serde_json::from_str::<FailureEntry>(line) {
                    failed.push(PageRef {
                        meeting: rec.meeting,
                        date: rec.date,
                        page: rec.page,
                    });
                }
            }
        }
        failed.sort();
        failed.dedup();
        Ok(failed)
    }

    /// All page PDFs present for a site (the expected work set).
    pub fn list_pdf_pages(&self, site: &str) -> std::io::Result<Vec<PageRef>> {
        self.list_pages(&self.pdf_dir(site), "pdf")
    }

    /// All non-empty page text artifacts present for a site.
    pub fn list_txt_pages(&self, site: &str) -> std::io::Result<Vec<PageRef>> {
        self.list_pages(&self.txt_dir(site), "txt")
    }

    fn list_pages(&self, root: &Path, extension: &str) -> std::io::Result<Vec<PageRef>> {
        let mut pages = Vec::new();
        let meetings = match fs::read_dir(root) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(pages),
            Err(e) => return Err(e),
        };
        for meeting in meetings {
            let meeting = meeting?;
            if !meeting.file_type()?.is_dir() {
                continue;
            }
            let meeting_name = meeting.file_name().to_string_lossy().to_string();
            for date in fs::read_dir(meeting.path())? {
                let date = date?;
                if !date.file_type()?.is_dir() {
                    continue;
                }
                let date_name = date.file_name().to_string_lossy().to_string();
                for file in fs::read_dir(date.path())? {
                    let file = file?;
                    let path = file.path();
                    if path.extension().and_then(|e| e.to_str()) != Some(extension) {
                        continue;
                    }
                    // Empty artifacts do not count as completed work
                    if file.metadata()?.len() == 0 {
                        continue;
                    }
                    let stem = match path.file_stem().and_then(|s| s.to_str()) {
                        Some(stem) => stem,
                        None => continue,
                    };
                    if let Ok(page) = stem.parse::<u32>() {
                        pages.push(PageRef {
                            meeting: meeting_name.clone(),
                            date: date_name.clone(),
                            page,
                        });
                    }
                }
            }
        }
        pages.sort();
        Ok(pages)
    }
}

impl FailureEntry {
    pub fn new(
        site: &str,
        stage: &str,
        page: &PageRef,
        job_id: &str,
        error: &str,
    ) -> Self {
        Self {
            at: Utc::now().to_rfc3339(),
            site: site.to_string(),
            stage: stage.to_string(),
            meeting: page.meeting.clone(),
            date: page.date.clone(),
            page: page.page,
            job_id: job_id.to_string(),
            error: error.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_page_id_deterministic() {
        let a = page_id("minutes", "council", "2024-03-12", 1, "call to order");
        let b = page_id("minutes", "council", "2024-03-12", 1, "call to order");
        assert_eq!(a, b);
        assert_eq!(a.len(), 12);
    }

    #[test]
    fn test_page_id_sensitive_to_every_field() {
        let base = page_id("minutes", "council", "2024-03-12", 1, "text");
        assert_ne!(base, page_id("agenda", "council", "2024-03-12", 1, "text"));
        assert_ne!(base, page_id("minutes", "planning", "2024-03-12", 1, "text"));
        assert_ne!(base, page_id("minutes", "council", "2024-03-13", 1, "text"));
        assert_ne!(base, page_id("minutes", "council", "2024-03-12", 2, "text"));
        assert_ne!(base, page_id("minutes", "council", "2024-03-12", 1, "other"));
    }

    #[test]
    fn test_page_id_no_field_boundary_collision() {
        // "ab" + "c" must not hash like "a" + "bc"
        assert_ne!(
            page_id("ab", "c", "d", 1, "t"),
            page_id("a", "bc", "d", 1, "t")
        );
    }

    #[test]
    fn test_paths() {
        let layout = StorageLayout::new("/data");
        let page = PageRef {
            meeting: "city council".into(),
            date: "2024-03-12".into(),
            page: 3,
        };
        assert_eq!(
            layout.pdf_page_path("a.example", &page),
            PathBuf::from("/data/a.example/pdfs/city_council/2024-03-12/3.pdf")
        );
        assert_eq!(
            layout.txt_page_path("a.example", &page),
            PathBuf::from("/data/a.example/txt/city_council/2024-03-12/3.txt")
        );
        assert_eq!(
            layout.db_path("a.example"),
            PathBuf::from("/data/a.example/meetings.db")
        );
        assert_eq!(
            layout.failure_manifest_path("a.example", "run1"),
            PathBuf::from("/data/a.example/ocr_failures_run1.jsonl")
        );
    }

    #[test]
    fn test_sanitize_component() {
        assert_eq!(sanitize_component("City Council (Regular)"), "City_Council__Regular");
        assert_eq!(sanitize_component("../evil"), "evil");
        assert_eq!(sanitize_component(""), "unnamed");
    }

    #[test]
    fn test_write_and_list_txt_pages() {
        let dir = tempdir().unwrap();
        let layout = StorageLayout::new(dir.path());
        let page = PageRef {
            meeting: "council".into(),
            date: "2024-03-12".into(),
            page: 1,
        };
        assert!(!layout.has_page_text("a.example", &page));
        layout.write_page_text("a.example", &page, "minutes text").unwrap();
        assert!(layout.has_page_text("a.example", &page));
        assert_eq!(
            layout.read_page_text("a.example", &page).unwrap(),
            "minutes text"
        );

        let listed = layout.list_txt_pages("a.example").unwrap();
        assert_eq!(listed, vec![page]);
    }

    #[test]
    fn test_empty_artifact_not_counted() {
        let dir = tempdir().unwrap();
        let layout = StorageLayout::new(dir.path());
        let page = PageRef {
            meeting: "council".into(),
            date: "2024-03-12".into(),
            page: 1,
        };
        let path = layout.txt_page_path("a.example", &page);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, "").unwrap();
        assert!(!layout.has_page_text("a.example", &page));
        assert!(layout.list_txt_pages("a.example").unwrap().is_empty());
    }

    #[test]
    fn test_failure_manifest_roundtrip() {
        let dir = tempdir().unwrap();
        let layout = StorageLayout::new(dir.path());
        let page = PageRef {
            meeting: "council".into(),
            date: "2024-03-12".into(),
            page: 2,
        };
        let entry = FailureEntry::new("a.example", "ocr", &page, "job-1", "engine refused");
        layout.append_failure("runA", &entry).unwrap();
        layout.append_failure("runA", &entry).unwrap();

        let failed = layout.failed_pages("a.example").unwrap();
        assert_eq!(failed, vec![page]);
    }

    #[test]
    fn test_failed_pages_missing_site_dir() {
        let dir = tempdir().unwrap();
        let layout = StorageLayout::new(dir.path());
        assert!(layout.failed_pages("nowhere.example").unwrap().is_empty());
    }
}
