//! Raster images to the inline base64 PNG payload the vision model expects.

use anyhow::{bail, Context, Result};
use base64::Engine;
use image::ImageFormat;
use std::ffi::OsStr;
use std::io::Cursor;
use std::path::Path;

const MAX_IMAGE_BYTES: u64 = 15 * 1024 * 1024;

pub fn is_supported_image_path(path: &Path) -> bool {
    matches!(
        path.extension()
            .and_then(OsStr::to_str)
            .map(|s| s.to_ascii_lowercase())
            .as_deref(),
        Some("png" | "jpg" | "jpeg" | "webp" | "gif" | "bmp")
    )
}

/// Read an image file and return it re-encoded as base64 PNG.
pub fn load_image_base64(path: &Path) -> Result<String> {
    if !is_supported_image_path(path) {
        bail!("Unsupported image type for {:?}", path);
    }
    let size = std::fs::metadata(path)
        .with_context(|| format!("Failed to read image {:?}", path))?
        .len();
    if size == 0 {
        bail!("Image {:?} is empty", path);
    }
    if size > MAX_IMAGE_BYTES {
        bail!("Image {:?} is too large ({} bytes)", path, size);
    }

    let bytes = std::fs::read(path).with_context(|| format!("Failed to read image {:?}", path))?;
    encode_png_base64(&bytes)
}

/// Decode any supported raster format and re-encode it as base64 PNG.
pub fn encode_png_base64(bytes: &[u8]) -> Result<String> {
    let decoded = image::load_from_memory(bytes).context("Failed to decode image")?;
    let mut png = Cursor::new(Vec::new());
    decoded
        .write_to(&mut png, ImageFormat::Png)
        .context("Failed to encode image as PNG")?;
    Ok(base64::engine::general_purpose::STANDARD.encode(png.into_inner()))
}
