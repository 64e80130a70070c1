//! Sampling Policy.
//!
//! Bounds compute and external API cost under sustained real-time input.
//! Two independent strides are configured once at startup:
//!
//! - the **detection stride**: the object detector only runs on frames where
//!   `frame mod detection_stride == 1`.  Skipped frames are still stored so
//!   every frame has a `frame_path`, but they yield no detections.
//! - the **description stride**: among frames that produced detections, the
//!   semantic describer only runs where `frame mod description_stride == 1`,
//!   and only for the first `max_described` detections of that frame.
//!   Detections beyond the cap are not described that round; there is no
//!   backlog.
//!
//! The frame counter is per probe and starts at 1.  The stride test is
//! evaluated as `(frame - 1) mod stride == 0`, which equals
//! `frame mod stride == 1` for every stride ≥ 2 and makes a stride of 1 mean
//! "every frame".

use std::num::NonZeroU64;

use svcs_types::SvcsError;
use tracing::debug;

/// Work scheduled for one frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameDecision {
    pub frame: u64,
    /// Run the object detector on this frame.
    pub run_detection: bool,
    /// The frame falls on the description stride.  Description still only
    /// happens when detection ran and found something.
    pub on_description_stride: bool,
}

impl FrameDecision {
    /// Whether the describer runs, given how many detections the frame
    /// produced.
    pub fn should_describe(&self, detections_found: usize) -> bool {
        detections_found > 0 && self.run_detection && self.on_description_stride
    }
}

/// Stride-based scheduling of detection and description work.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SamplingPolicy {
    detection_stride: NonZeroU64,
    description_stride: NonZeroU64,
    max_described: usize,
}

impl SamplingPolicy {
    /// Create a policy.
    ///
    /// Returns [`SvcsError::InvalidInput`] when either stride is zero.
    pub fn new(
        detection_stride: u64,
        description_stride: u64,
        max_described: usize,
    ) -> Result<Self, SvcsError> {
        let detection_stride = NonZeroU64::new(detection_stride)
            .ok_or_else(|| SvcsError::InvalidInput("detection stride must be positive".into()))?;
        let description_stride = NonZeroU64::new(description_stride).ok_or_else(|| {
            SvcsError::InvalidInput("description stride must be positive".into())
        })?;
        debug!(
            detection_stride = detection_stride.get(),
            description_stride = description_stride.get(),
            max_described,
            "sampling policy configured"
        );
        Ok(Self {
            detection_stride,
            description_stride,
            max_described,
        })
    }

    pub fn detection_stride(&self) -> u64 {
        self.detection_stride.get()
    }

    pub fn description_stride(&self) -> u64 {
        self.description_stride.get()
    }

    pub fn max_described(&self) -> usize {
        self.max_described
    }

    /// Whether the detector runs on `frame`.
    pub fn should_detect(&self, frame: u64) -> bool {
        on_stride(frame, self.detection_stride)
    }

    /// The leading slice of `items` that may be submitted for description.
    pub fn select_for_description<'a, T>(&self, items: &'a [T]) -> &'a [T] {
        &items[..items.len().min(self.max_described)]
    }

    /// Full decision for `frame`.
    pub fn decide(&self, frame: u64) -> FrameDecision {
        FrameDecision {
            frame,
            run_detection: self.should_detect(frame),
            on_description_stride: on_stride(frame, self.description_stride),
        }
    }
}

fn on_stride(frame: u64, stride: NonZeroU64) -> bool {
    frame >= 1 && (frame - 1) % stride.get() == 0
}
