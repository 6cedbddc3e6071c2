//! Uploaded media: classification, image decoding, PDF rasterization.

pub mod images;
pub mod pdf;

use image::DynamicImage;
use thiserror::Error;
use tracing::debug;

pub use images::{load_image_from_bytes, resize_long_edge};
pub use pdf::PdfRenderer;

#[derive(Debug, Error)]
pub enum MediaError {
    #[error("image decode failed: {0}")]
    Decode(String),
    #[error("image encode failed: {0}")]
    Encode(String),
    #[error("pdf render failed: {0}")]
    Pdf(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// One file from the `files` form field.
#[derive(Debug, Clone)]
pub struct Upload {
    pub filename: String,
    pub content_type: Option<String>,
    pub bytes: Vec<u8>,
}

impl Upload {
    pub fn is_pdf(&self) -> bool {
        self.filename.to_lowercase().ends_with(".pdf")
            || self
                .content_type
                .as_deref()
                .is_some_and(|ct| ct.eq_ignore_ascii_case("application/pdf"))
    }
}

/// Decoded images (upload order) and raw PDF documents.
#[derive(Debug, Default)]
pub struct SortedUploads {
    pub images: Vec<DynamicImage>,
    pub pdfs: Vec<Vec<u8>>,
}

/// Split uploads into PDFs and images. Images that fail to decode are dropped.
pub fn sort_uploads(uploads: Vec<Upload>) -> SortedUploads {
    let mut out = SortedUploads::default();
    for upload in uploads {
        if upload.is_pdf() {
            out.pdfs.push(upload.bytes);
            continue;
        }
        match load_image_from_bytes(&upload.bytes) {
            Ok(img) => out.images.push(img),
            Err(e) => debug!(filename = %upload.filename, error = %e, "skipping undecodable upload"),
        }
    }
    out
}
