//! PDF page rasterization via an external `pdftoppm`.
//!
//! The document is written to a scratch directory, rendered to one PNG per
//! page, and the pages are decoded back in page order.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use image::DynamicImage;
use tokio::process::Command;
use tracing::{debug, warn};

use super::MediaError;
use super::images::load_image_from_bytes;
use crate::config::PdfConfig;

const PAGE_PREFIX: &str = "page";

#[derive(Debug, Clone)]
pub struct PdfRenderer {
    program: String,
    dpi: u32,
    max_pages: Option<u32>,
}

impl PdfRenderer {
    pub fn new(program: impl Into<String>, dpi: u32, max_pages: Option<u32>) -> Self {
        Self { program: program.into(), dpi, max_pages }
    }

    pub fn from_config(config: &PdfConfig) -> Self {
        Self::new(config.renderer.clone(), config.dpi, config.max_pages)
    }

    /// Render every page (up to `max_pages`) to an RGB image, first page first.
    pub async fn render(&self, pdf: &[u8]) -> Result<Vec<DynamicImage>, MediaError> {
        let dir = tempfile::tempdir()?;
        let input = dir.path().join("input.pdf");
        tokio::fs::write(&input, pdf).await?;
        let prefix = dir.path().join(PAGE_PREFIX);

        let mut cmd = Command::new(&self.program);
        cmd.arg("-r").arg(self.dpi.to_string()).arg("-png");
        if let Some(last) = self.max_pages {
            cmd.arg("-l").arg(last.to_string());
        }
        cmd.arg(&input).arg(&prefix).stdin(Stdio::null()).kill_on_drop(true);

        debug!(program = %self.program, dpi = self.dpi, bytes = pdf.len(), "rendering pdf");
        let output = cmd
            .output()
            .await
            .map_err(|e| MediaError::Pdf(format!("cannot run '{}': {e}", self.program)))?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            warn!(status = %output.status, stderr = %stderr.trim(), "pdf renderer failed");
            return Err(MediaError::Pdf(format!("{} exited with {}: {}", self.program, output.status, stderr.trim())));
        }

        let pages = rendered_pages(dir.path()).await?;
        if pages.is_empty() {
            return Err(MediaError::Pdf("renderer produced no pages".into()));
        }
        debug!(pages = pages.len(), "pdf rendered");

        let images = tokio::task::spawn_blocking(move || {
            pages
                .iter()
                .map(|p| std::fs::read(p).map_err(MediaError::from).and_then(|b| load_image_from_bytes(&b)))
                .collect::<Result<Vec<_>, _>>()
        })
        .await
        .map_err(|e| MediaError::Pdf(format!("page decoding task failed: {e}")))??;

        // `dir` lives until here so the page files exist while being decoded.
        drop(dir);
        Ok(images)
    }
}

/// PNGs written by the renderer, sorted by page number.
async fn rendered_pages(dir: &Path) -> Result<Vec<PathBuf>, MediaError> {
    let mut entries = tokio::fs::read_dir(dir).await?;
    let mut pages = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if let Some(n) = path.file_name().and_then(|n| n.to_str()).and_then(page_number) {
            pages.push((n, path));
        }
    }
    pages.sort_by_key(|(n, _)| *n);
    Ok(pages.into_iter().map(|(_, p)| p).collect())
}

/// `page-07.png` -> 7. Zero padding depends on the document's page count.
fn page_number(file_name: &str) -> Option<u32> {
    let stem = file_name.strip_suffix(".png")?;
    let (prefix, num) = stem.rsplit_once('-')?;
    if prefix != PAGE_PREFIX {
        return None;
    }
    num.parse().ok()
}
