//! Engine configuration.
//!
//! Every knob here is fixed for the lifetime of a
//! [`FusionEngine`][crate::engine::FusionEngine].  The CLI fills it from its
//! config vault; embedders construct it directly.

use serde::{Deserialize, Serialize};
use svcs_types::SvcsError;

/// How semantic descriptions are requested.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DescribeMode {
    /// Crop every selected detection and describe the crops concurrently.
    #[default]
    PerObject,
    /// Describe the whole frame once and anchor the returned objects to
    /// matching detections.
    WholeFrame,
}

/// Tunables of the fusion pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Run the detector on frames where `frame mod stride == 1`.
    pub detection_stride: u64,
    /// Run the describer on detected frames where `frame mod stride == 1`.
    pub description_stride: u64,
    /// Detections submitted per description round.
    pub max_described_per_frame: usize,
    /// Seconds a cached semantic label stays valid.
    pub label_ttl_secs: f64,
    /// Grid cell size (pixels) of the tracker-less identity fallback.
    pub bucket_px: f64,
    /// Depth assumed when a frame carries none.
    pub default_depth: f64,
    /// Default MOVE threshold of scan diffs.
    pub diff_threshold: f64,
    pub describe_mode: DescribeMode,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            detection_stride: 1,
            description_stride: 3,
            max_described_per_frame: 4,
            label_ttl_secs: 10.0,
            bucket_px: 80.0,
            default_depth: 1.5,
            diff_threshold: svcs_memory::DEFAULT_DIFF_THRESHOLD,
            describe_mode: DescribeMode::PerObject,
        }
    }
}

impl EngineConfig {
    /// Reject values the pipeline cannot run with.
    pub fn validate(&self) -> Result<(), SvcsError> {
        let invalid = |msg: String| Err(SvcsError::InvalidInput(msg));
        if self.detection_stride == 0 {
            return invalid("detection_stride must be at least 1".into());
        }
        if self.description_stride == 0 {
            return invalid("description_stride must be at least 1".into());
        }
        if !self.bucket_px.is_finite() || self.bucket_px <= 0.0 {
            return invalid(format!("bucket_px must be positive, got {}", self.bucket_px));
        }
        if !self.label_ttl_secs.is_finite() || self.label_ttl_secs < 0.0 {
            return invalid(format!(
                "label_ttl_secs must be non-negative, got {}",
                self.label_ttl_secs
            ));
        }
        if !self.default_depth.is_finite() || self.default_depth <= 0.0 {
            return invalid(format!(
                "default_depth must be positive, got {}",
                self.default_depth
            ));
        }
        if !self.diff_threshold.is_finite() || self.diff_threshold < 0.0 {
            return invalid(format!(
                "diff_threshold must be non-negative, got {}",
                self.diff_threshold
            ));
        }
        Ok(())
    }
}
