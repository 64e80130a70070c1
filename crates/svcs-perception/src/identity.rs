//! Identity Resolver.
//!
//! Derives the [`ObjectKey`] used by the label cache and the state vector.
//!
//! - With a persistent tracker (`tracker_id > -1`) the key is
//!   `"<label>_<tracker_id>"`.
//! - Without one, the bounding-box centre is bucketed into a pixel grid of
//!   size `B` and the depth into 0.5-unit slices:
//!   `"<label>_cell_<cx div B>_<cy div B>_<round(z * 2)>"`.
//!
//! The fallback keeps a key stable across frames without a tracker, at the
//! cost of merging two same-labelled objects that land in the same cell.
//!
//! The function is pure: identical detection fields always give the same key.

use svcs_types::{Detection, ObjectKey, SvcsError};

/// Grid-bucketing key generator.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct IdentityResolver {
    bucket_px: f64,
}

impl IdentityResolver {
    /// Create a resolver with a grid cell of `bucket_px` pixels.
    ///
    /// Returns [`SvcsError::InvalidInput`] unless `bucket_px` is finite and
    /// positive.
    pub fn new(bucket_px: f64) -> Result<Self, SvcsError> {
        if !bucket_px.is_finite() || bucket_px <= 0.0 {
            return Err(SvcsError::InvalidInput(format!(
                "bucket size must be a positive number of pixels, got {bucket_px}"
            )));
        }
        Ok(Self { bucket_px })
    }

    pub fn bucket_px(&self) -> f64 {
        self.bucket_px
    }

    /// Key for `detection`.
    pub fn key_for(&self, detection: &Detection) -> ObjectKey {
        if detection.has_tracker() {
            return ObjectKey::new(format!("{}_{}", detection.label, detection.tracker_id));
        }
        let (cx, cy) = detection.bbox.center();
        let cell_x = (cx / self.bucket_px).floor() as i64;
        let cell_y = (cy / self.bucket_px).floor() as i64;
        let z_bucket = (detection.position_3d.z * 2.0).round() as i64;
        ObjectKey::new(format!(
            "{}_cell_{}_{}_{}",
            detection.label, cell_x, cell_y, z_bucket
        ))
    }
}
