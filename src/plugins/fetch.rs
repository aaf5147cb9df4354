//! Built-in fetchers: manifest-driven HTTP download and local directory
//! import.

use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;

use crate::models::DocumentRef;
use crate::storage::{PageRef, StorageLayout};

use super::{CapabilityError, Fetcher, Result};

/// One meeting's worth of page PDFs in a site manifest.
#[derive(Debug, Clone, Deserialize)]
pub struct ManifestMeeting {
    pub meeting: String,
    pub date: String,
    /// Per-page PDF URLs, in page order.
    pub pages: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct SiteManifest {
    meetings: Vec<ManifestMeeting>,
}

/// Fetches a JSON manifest of meeting pages from the site and downloads
/// each page PDF. The manifest URL is a template with a `{site}`
/// placeholder.
pub struct HttpFetcher {
    client: reqwest::Client,
    manifest_template: String,
}

impl HttpFetcher {
    pub fn new() -> Result<Self> {
        Self::with_template("https://{site}/meetings/manifest.json")
    }

    pub fn with_template(template: impl Into<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(120))
            .user_agent(concat!("civipipe/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| CapabilityError::Fatal(format!("http client: {e}")))?;
        Ok(Self {
            client,
            manifest_template: template.into(),
        })
    }

    async fn download(&self, url: &str) -> Result<Vec<u8>> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| CapabilityError::Transient(format!("GET {url}: {e}")))?;
        let status = response.status();
        if status.is_server_error() {
            return Err(CapabilityError::Transient(format!("GET {url}: {status}")));
        }
        if !status.is_success() {
            return Err(CapabilityError::Item(format!("GET {url}: {status}")));
        }
        let bytes = response
            .bytes()
            .await
            .map_err(|e| CapabilityError::Transient(format!("GET {url}: {e}")))?;
        Ok(bytes.to_vec())
    }
}

#[async_trait]
impl Fetcher for HttpFetcher {
    fn name(&self) -> &str {
        "http"
    }

    async fn fetch(&self, site: &str, layout: &StorageLayout) -> Result<Vec<DocumentRef>> {
        let manifest_url = self.manifest_template.replace("{site}", site);
        let response = self
            .client
            .get(&manifest_url)
            .send()
            .await
            .map_err(|e| CapabilityError::Transient(format!("GET {manifest_url}: {e}")))?;
        let status = response.status();
        if status.is_server_error() {
            return Err(CapabilityError::Transient(format!(
                "manifest {manifest_url}: {status}"
            )));
        }
        if !status.is_success() {
            return Err(CapabilityError::Site(format!(
                "manifest {manifest_url}: {status}"
            )));
        }
        let manifest: SiteManifest = response
            .json()
            .await
            .map_err(|e| CapabilityError::Site(format!("manifest parse: {e}")))?;

        let mut documents = Vec::with_capacity(manifest.meetings.len());
        for entry in manifest.meetings {
            let mut page_paths = Vec::with_capacity(entry.pages.len());
            for (index, url) in entry.pages.iter().enumerate() {
                let page_ref = PageRef {
                    meeting: entry.meeting.clone(),
                    date: entry.date.clone(),
                    page: index as u32 + 1,
                };
                let path = layout.pdf_page_path(site, &page_ref);
                // Idempotent: already-downloaded pages are left alone
                if fs::metadata(&path).map(|m| m.len() > 0).unwrap_or(false) {
                    page_paths.push(path);
                    continue;
                }
                let bytes = self.download(url).await?;
                if let Some(parent) = path.parent() {
                    fs::create_dir_all(parent)
                        .map_err(|e| CapabilityError::Fatal(format!("storage dir: {e}")))?;
                }
                fs::write(&path, &bytes)
                    .map_err(|e| CapabilityError::Transient(format!("write page pdf: {e}")))?;
                page_paths.push(path);
            }
            documents.push(DocumentRef {
                site: site.to_string(),
                meeting: entry.meeting,
                date: entry.date,
                page_paths,
            });
        }
        Ok(documents)
    }
}

/// Imports page PDFs from a local drop directory laid out as
/// `<drop>/<site>/<meeting>/<date>/<page>.pdf`. Useful for air-gapped
/// ingestion and for tests.
pub struct DirectoryFetcher {
    drop_dir: PathBuf,
}

impl DirectoryFetcher {
    pub fn new(drop_dir: impl Into<PathBuf>) -> Self {
        Self {
            drop_dir: drop_dir.into(),
        }
    }
}

#[async_trait]
impl Fetcher for DirectoryFetcher {
    fn name(&self) -> &str {
        "directory"
    }

    async fn fetch(&self, site: &str, layout: &StorageLayout) -> Result<Vec<DocumentRef>> {
        let drop_site = self.drop_dir.join(site);
        if !drop_site.exists() {
            return Ok(Vec::new());
        }
        let pages = list_drop_pages(&drop_site)
            .map_err(|e| CapabilityError::Transient(format!("scan drop dir: {e}")))?;

        let mut by_meeting: BTreeMap<(String, String), Vec<PageRef>> = BTreeMap::new();
        for page in pages {
            by_meeting
                .entry((page.meeting.clone(), page.date.clone()))
                .or_default()
                .push(page);
        }

        let mut documents = Vec::new();
        for ((meeting, date), mut refs) in by_meeting {
            refs.sort();
            let mut page_paths = Vec::with_capacity(refs.len());
            for page_ref in &refs {
                let src = drop_site
                    .join(&page_ref.meeting)
                    .join(&page_ref.date)
                    .join(format!("{}.pdf", page_ref.page));
                let dst = layout.pdf_page_path(site, page_ref);
                if !fs::metadata(&dst).map(|m| m.len() > 0).unwrap_or(false) {
                    if let Some(parent) = dst.parent() {
                        fs::create_dir_all(parent)
                            .map_err(|e| CapabilityError::Fatal(format!("storage dir: {e}")))?;
                    }
                    fs::copy(&src, &dst)
                        .map_err(|e| CapabilityError::Transient(format!("import page: {e}")))?;
                }
                page_paths.push(dst);
            }
            documents.push(DocumentRef {
                site: site.to_string(),
                meeting,
                date,
                page_paths,
            });
        }
        Ok(documents)
    }
}

fn list_drop_pages(site_dir: &std::path::Path) -> std::io::Result<Vec<PageRef>> {
    let mut pages = Vec::new();
    for meeting in fs::read_dir(site_dir)? {
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
                if path.extension().and_then(|e| e.to_str()) != Some("pdf") {
                    continue;
                }
                if let Some(page) = path
                    .file_stem()
                    .and_then(|s| s.to_str())
                    .and_then(|s| s.parse::<u32>().ok())
                {
                    pages.push(PageRef {
                        meeting: meeting_name.clone(),
                        date: date_name.clone(),
                        page,
                    });
                }
            }
        }
    }
    Ok(pages)
}
