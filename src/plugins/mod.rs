//! Capability interfaces the pipeline core consumes, plus their built-in
//! implementations.
//!
//! Collaborators are values registered into a `Capabilities` table at boot;
//! the core never reaches for globals. Every call returns a `Result` whose
//! error carries its retry classification, so the worker loop's middleware
//! can decide between retrying, recording a per-item failure, or tearing the
//! worker down.

mod compile;
mod deploy;
mod extract;
mod fetch;
mod ocr;
pub mod sitedb;

pub use compile::{CompileSummary, SqliteCompiler};
pub use deploy::DirectoryDeployer;
pub use extract::RegexExtractor;
pub use fetch::{DirectoryFetcher, HttpFetcher};
pub use ocr::TesseractOcr;

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use crate::config::Settings;
use crate::models::{DocumentRef, PageAnnotations};
use crate::storage::StorageLayout;

/// Collaborator failure, classified for retry handling.
#[derive(Error, Debug)]
pub enum CapabilityError {
    /// Worth retrying: network timeouts, busy files, broker hiccups.
    #[error("transient: {0}")]
    Transient(String),
    /// One item is bad (corrupt PDF, engine refusal); the rest of the stage
    /// proceeds.
    #[error("{0}")]
    Item(String),
    /// The whole site cannot proceed (no documents, bad credentials).
    #[error("site: {0}")]
    Site(String),
    /// The worker itself is broken (missing binary, missing storage); it
    /// must exit and let the supervisor restart it.
    #[error("fatal: {0}")]
    Fatal(String),
}

pub type Result<T> = std::result::Result<T, CapabilityError>;

/// Acquires a site's documents and writes per-page PDFs into the storage
/// tree. Protocol-specific; sites plug in their own.
#[async_trait]
pub trait Fetcher: Send + Sync {
    fn name(&self) -> &str;

    /// Fetch everything new for `site`. Must be idempotent: pages already
    /// on disk are left alone.
    async fn fetch(&self, site: &str, layout: &StorageLayout) -> Result<Vec<DocumentRef>>;
}

/// Extracts text from a single page PDF. Blocking CPU work.
pub trait OcrEngine: Send + Sync {
    fn name(&self) -> &str;

    fn is_available(&self) -> bool;

    /// Human-readable hint shown when the backend is unavailable.
    fn availability_hint(&self) -> String;

    fn ocr_page(&self, pdf_path: &Path) -> Result<String>;
}

/// Pulls entities and votes out of one page's text.
pub trait Extractor: Send + Sync {
    fn name(&self) -> &str;

    fn extract(&self, text: &str) -> Result<PageAnnotations>;
}

/// Builds a site's searchable database from its text artifacts.
pub trait Compiler: Send + Sync {
    fn name(&self) -> &str;

    fn compile(&self, site: &str, layout: &StorageLayout) -> Result<CompileSummary>;
}

/// Publishes a compiled database. Must leave a marker the reconciler can
/// check for.
pub trait Deployer: Send + Sync {
    fn name(&self) -> &str;

    fn deploy(&self, site: &str, db_path: &Path) -> Result<()>;

    /// Whether the site's current database has been published.
    fn is_deployed(&self, site: &str) -> bool;
}

/// The capability table threaded through workers at startup.
#[derive(Clone)]
pub struct Capabilities {
    pub fetcher: Arc<dyn Fetcher>,
    pub ocr: Arc<dyn OcrEngine>,
    pub extractor: Arc<dyn Extractor>,
    pub compiler: Arc<dyn Compiler>,
    pub deployer: Arc<dyn Deployer>,
}

impl Capabilities {
    /// The standard table: HTTP fetch, the configured OCR backend, regex
    /// extraction, SQLite compilation, directory deployment.
    ///
    /// Backend availability (system binaries) is checked by worker startup,
    /// not here, so read-only commands work on machines without OCR tools.
    pub fn standard(settings: &Settings) -> Result<Self> {
        let ocr: Arc<dyn OcrEngine> = match settings.ocr_backend.as_str() {
            "tesseract" => Arc::new(TesseractOcr::new()),
            other => {
                return Err(CapabilityError::Fatal(format!(
                    "unknown OCR backend '{other}'"
                )))
            }
        };
        Ok(Self {
            fetcher: Arc::new(HttpFetcher::new()?),
            ocr,
            extractor: Arc::new(RegexExtractor::new()),
            compiler: Arc::new(SqliteCompiler::new()),
            deployer: Arc::new(DirectoryDeployer::new(settings.deploy_dir.clone())),
        })
    }
}
