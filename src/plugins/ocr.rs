//! Tesseract OCR backend.
//!
//! Born-digital PDFs are handled by a `pdftotext` fast path; scanned pages
//! fall back to `pdftoppm` rasterization plus `tesseract`. All three are
//! system binaries, checked at boot.

use std::path::{Path, PathBuf};
use std::process::Command;

use tempfile::TempDir;

use super::{CapabilityError, OcrEngine, Result};

/// Minimum characters before pdftotext output is trusted; below this the
/// page is assumed to be a scan.
const TEXT_LAYER_MIN_CHARS: usize = 32;

/// OCR via the tesseract and poppler command-line tools.
pub struct TesseractOcr {
    language: String,
}

impl TesseractOcr {
    pub fn new() -> Self {
        Self {
            language: "eng".to_string(),
        }
    }

    pub fn with_language(language: impl Into<String>) -> Self {
        Self {
            language: language.into(),
        }
    }

    /// Try the PDF's embedded text layer.
    fn pdf_text_layer(&self, pdf_path: &Path) -> Result<Option<String>> {
        let output = Command::new("pdftotext")
            .arg(pdf_path)
            .arg("-")
            .output();

        match output {
            Ok(output) if output.status.success() => {
                let text = String::from_utf8_lossy(&output.stdout).to_string();
                if text.trim().len() >= TEXT_LAYER_MIN_CHARS {
                    Ok(Some(text))
                } else {
                    Ok(None)
                }
            }
            Ok(_) => Ok(None), // malformed text layer; fall through to OCR
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(CapabilityError::Fatal(
                    "pdftotext not found (install poppler-utils)".to_string(),
                ))
            }
            Err(e) => Err(CapabilityError::Transient(format!("pdftotext: {e}"))),
        }
    }

    /// Rasterize a single-page PDF to a PNG.
    fn rasterize(&self, pdf_path: &Path, output_dir: &Path) -> Result<PathBuf> {
        let output_prefix = output_dir.join("page");
        let status = Command::new("pdftoppm")
            .args(["-png", "-r", "300"])
            .arg(pdf_path)
            .arg(&output_prefix)
            .status();

        match status {
            Ok(s) if s.success() => self.find_page_image(output_dir).ok_or_else(|| {
                CapabilityError::Item(format!(
                    "no image produced for {}",
                    pdf_path.display()
                ))
            }),
            Ok(_) => Err(CapabilityError::Item(format!(
                "pdftoppm failed on {}",
                pdf_path.display()
            ))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(CapabilityError::Fatal(
                    "pdftoppm not found (install poppler-utils)".to_string(),
                ))
            }
            Err(e) => Err(CapabilityError::Transient(format!("pdftoppm: {e}"))),
        }
    }

    /// Find the rasterized image (pdftoppm pads page numbers variably).
    fn find_page_image(&self, temp_path: &Path) -> Option<PathBuf> {
        for digits in [1, 2, 3, 4] {
            let filename = format!("page-{:0width$}.png", 1, width = digits);
            let path = temp_path.join(&filename);
            if path.exists() {
                return Some(path);
            }
        }
        // Some poppler versions omit the page suffix for single-page input
        let bare = temp_path.join("page.png");
        bare.exists().then_some(bare)
    }

    fn run_tesseract(&self, image_path: &Path) -> Result<String> {
        let output = Command::new("tesseract")
            .arg(image_path)
            .arg("stdout")
            .args(["-l", &self.language])
            .output();

        match output {
            Ok(output) => {
                if output.status.success() {
                    Ok(String::from_utf8_lossy(&output.stdout).to_string())
                } else {
                    let stderr = String::from_utf8_lossy(&output.stderr);
                    Err(CapabilityError::Item(format!("tesseract failed: {stderr}")))
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(CapabilityError::Fatal(
                    "tesseract not found (install tesseract-ocr)".to_string(),
                ))
            }
            Err(e) => Err(CapabilityError::Transient(format!("tesseract: {e}"))),
        }
    }
}

impl Default for TesseractOcr {
    fn default() -> Self {
        Self::new()
    }
}

impl OcrEngine for TesseractOcr {
    fn name(&self) -> &str {
        "tesseract"
    }

    fn is_available(&self) -> bool {
        which::which("tesseract").is_ok() && which::which("pdftoppm").is_ok()
    }

    fn availability_hint(&self) -> String {
        if which::which("tesseract").is_err() {
            "Tesseract not installed. Install with: apt install tesseract-ocr".to_string()
        } else if which::which("pdftoppm").is_err() {
            "pdftoppm not installed. Install with: apt install poppler-utils".to_string()
        } else {
            "Tesseract is available".to_string()
        }
    }

    fn ocr_page(&self, pdf_path: &Path) -> Result<String> {
        if !pdf_path.exists() {
            return Err(CapabilityError::Item(format!(
                "page pdf missing: {}",
                pdf_path.display()
            )));
        }

        if let Some(text) = self.pdf_text_layer(pdf_path)? {
            return Ok(text);
        }

        let temp_dir = TempDir::new()
            .map_err(|e| CapabilityError::Transient(format!("temp dir: {e}")))?;
        let image_path = self.rasterize(pdf_path, temp_dir.path())?;
        self.run_tesseract(&image_path)
    }
}
