//! Frame image helpers.

use std::io::Cursor;

use image::{ImageFormat, ImageResult};
use svcs_types::{BoundingBox, SvcsError};

/// Check that `bytes` is an image in a format we can decode.
pub fn validate_image(bytes: &[u8]) -> Result<ImageFormat, SvcsError> {
    if bytes.is_empty() {
        return Err(SvcsError::InvalidInput("empty image payload".into()));
    }
    image::guess_format(bytes)
        .map_err(|e| SvcsError::InvalidInput(format!("unrecognised image payload: {e}")))
}

/// PNG-encoded crop of `bbox` out of the encoded image `bytes`.
///
/// The box is clamped to the image; a box with no area left after clamping
/// yields the whole frame.
pub fn crop_to_png(bytes: &[u8], bbox: &BoundingBox) -> ImageResult<Vec<u8>> {
    let img = image::load_from_memory(bytes)?;
    let (w, h) = (img.width(), img.height());
    let [x1, y1, x2, y2] = bbox.0;

    let clamp = |v: f64, max: u32| -> u32 {
        if v.is_nan() { 0 } else { v.clamp(0.0, max as f64) as u32 }
    };
    let (left, right) = (clamp(x1.min(x2), w), clamp(x1.max(x2).ceil(), w));
    let (top, bottom) = (clamp(y1.min(y2), h), clamp(y1.max(y2).ceil(), h));

    let region = if right > left && bottom > top {
        img.crop_imm(left, top, right - left, bottom - top)
    } else {
        img
    };

    let mut out = Vec::new();
    region.write_to(&mut Cursor::new(&mut out), ImageFormat::Png)?;
    Ok(out)
}
