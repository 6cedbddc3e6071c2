//! Image decoding and resizing.

use std::io::Cursor;

use image::imageops::FilterType;
use image::{DynamicImage, ImageDecoder, ImageFormat, ImageReader};
use tracing::debug;

use super::MediaError;

/// Decode an uploaded image, honour its EXIF orientation, and convert to RGB8.
pub fn load_image_from_bytes(bytes: &[u8]) -> Result<DynamicImage, MediaError> {
    let reader = ImageReader::new(Cursor::new(bytes))
        .with_guessed_format()
        .map_err(|e| MediaError::Decode(e.to_string()))?;
    let mut decoder = reader.into_decoder().map_err(|e| MediaError::Decode(e.to_string()))?;

    // Unreadable orientation metadata is not fatal.
    let orientation = decoder.orientation().ok();
    let mut img = DynamicImage::from_decoder(decoder).map_err(|e| MediaError::Decode(e.to_string()))?;
    if let Some(orientation) = orientation {
        img.apply_orientation(orientation);
    }
    Ok(DynamicImage::ImageRgb8(img.into_rgb8()))
}

/// Scale so the longer side is at most `max_edge`. Sizes are truncated, never rounded up.
pub fn resize_long_edge(img: DynamicImage, max_edge: u32) -> DynamicImage {
    let (w, h) = (img.width(), img.height());
    let long_edge = w.max(h);
    if max_edge == 0 || long_edge <= max_edge {
        return img;
    }
    let scale = f64::from(max_edge) / f64::from(long_edge);
    let nw = ((f64::from(w) * scale) as u32).max(1);
    let nh = ((f64::from(h) * scale) as u32).max(1);
    debug!(from = %format!("{w}x{h}"), to = %format!("{nw}x{nh}"), "resizing image");
    img.resize_exact(nw, nh, FilterType::Lanczos3)
}

/// Encode as PNG, for transports that carry images inline.
pub fn to_png_bytes(img: &DynamicImage) -> Result<Vec<u8>, MediaError> {
    let mut buf = Vec::new();
    img.write_to(&mut Cursor::new(&mut buf), ImageFormat::Png)
        .map_err(|e| MediaError::Encode(e.to_string()))?;
    Ok(buf)
}
