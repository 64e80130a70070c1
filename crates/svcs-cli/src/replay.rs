//! Capture replay – feeds recorded frames through the fusion engine.
//!
//! A capture is a JSON-lines file, one recorded frame per line:
//!
//! ```json
//! {"probe_id":"phone-1","scan_id":"kitchen","timestamp":1700000000.0,
//!  "pose":{"alpha":0.0,"beta":90.0,"gamma":0.0},
//!  "image":"frames/0001.jpg",
//!  "detections":[{"label":"cup","tracker_id":3,"confidence":0.91,
//!                 "bbox":[120,80,220,190],"position_3d":{"x":0.1,"y":-0.2,"z":1.4}}],
//!  "descriptions":[{"label":"cup","name":"white ceramic mug","details":"chipped rim"}]}
//! ```
//!
//! `image` is resolved relative to the capture file; without it a blank
//! `width`×`height` canvas stands in.  Detections and descriptions were
//! produced offline and are served back by [`ReplayDetector`] and
//! [`ReplayDescriber`] while the engine runs its normal pipeline.  Lines
//! with `"stop": true` complete their scan after ingestion.
//!
//! [`recording_instructions`] is what a recorder sends its multimodal model
//! to produce `frame_description` and `descriptions`.

use std::collections::HashMap;
use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use image::{DynamicImage, ImageFormat, RgbImage};
use serde::Deserialize;
use svcs_runtime::{
    CollaboratorError, DescribedObject, Describer, DetectRequest, Detector, DetectorOutput,
    FrameDescription, FrameInput, FusionEngine, ObjectDescription, ProbeSession,
    SPATIAL_DESCRIBE_PROMPT, response_schema,
};
use svcs_types::{Detection, Orientation};
use thiserror::Error;
use tracing::{info, warn};

#[derive(Error, Debug)]
pub enum ReplayError {
    #[error("Failed to read capture {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

// ─────────────────────────────────────────────────────────────────────────────
// Capture format
// ─────────────────────────────────────────────────────────────────────────────

fn default_probe() -> String {
    "replay".to_string()
}
fn default_width() -> u32 {
    640
}
fn default_height() -> u32 {
    480
}

/// One line of a capture file.
#[derive(Debug, Clone, Deserialize)]
pub struct RecordedFrame {
    #[serde(default = "default_probe")]
    pub probe_id: String,
    #[serde(default)]
    pub scan_id: Option<String>,
    #[serde(default)]
    pub timestamp: Option<f64>,
    #[serde(default)]
    pub pose: Orientation,
    #[serde(default)]
    pub depth: Option<f64>,
    /// Image file, relative to the capture.
    #[serde(default)]
    pub image: Option<String>,
    #[serde(default = "default_width")]
    pub width: u32,
    #[serde(default = "default_height")]
    pub height: u32,
    /// Where the frame was stored when it was recorded.
    #[serde(default)]
    pub frame_path: Option<String>,
    #[serde(default)]
    pub detections: Vec<Detection>,
    #[serde(default)]
    pub descriptions: Vec<RecordedDescription>,
    #[serde(default)]
    pub frame_description: Option<FrameDescription>,
    #[serde(default)]
    pub stop: bool,
}

/// Offline description of the detection labelled `label`.
#[derive(Debug, Clone, Deserialize)]
pub struct RecordedDescription {
    pub label: String,
    pub name: String,
    #[serde(default)]
    pub details: String,
}

/// Whole-frame prompt followed by the JSON Schemas of both description
/// shapes a capture records.
pub fn recording_instructions() -> Result<String, serde_json::Error> {
    let frame = serde_json::to_string_pretty(&response_schema::<FrameDescription>()?)?;
    let object = serde_json::to_string_pretty(&response_schema::<ObjectDescription>()?)?;
    Ok(format!(
        "{SPATIAL_DESCRIBE_PROMPT}\n\n\
         # frame_description schema\n{frame}\n\n\
         # per-object description schema\n{object}"
    ))
}

// ─────────────────────────────────────────────────────────────────────────────
// Replay collaborators
// ─────────────────────────────────────────────────────────────────────────────

/// The frame currently being replayed, shared by the replay collaborators.
#[derive(Clone, Default)]
pub struct ReplayDeck(Arc<Mutex<Option<RecordedFrame>>>);

impl ReplayDeck {
    fn load(&self, frame: RecordedFrame) {
        *self.0.lock().unwrap_or_else(PoisonError::into_inner) = Some(frame);
    }

    fn clear(&self) {
        *self.0.lock().unwrap_or_else(PoisonError::into_inner) = None;
    }

    fn with_current<T>(&self, f: impl FnOnce(&RecordedFrame) -> T) -> Option<T> {
        self.0
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map(f)
    }
}

fn frame_path_for(frame: &RecordedFrame, request: &DetectRequest) -> String {
    frame.frame_path.clone().unwrap_or_else(|| {
        format!(
            "data/frames/{}/frame_{:05}.jpg",
            request.scan_id, request.frame_number
        )
    })
}

/// Serves the recorded detections of the current frame.
pub struct ReplayDetector {
    deck: ReplayDeck,
}

impl ReplayDetector {
    pub fn new(deck: ReplayDeck) -> Self {
        Self { deck }
    }
}

#[async_trait]
impl Detector for ReplayDetector {
    fn name(&self) -> &str {
        "replay"
    }

    async fn detect(&self, request: &DetectRequest) -> Result<DetectorOutput, CollaboratorError> {
        self.deck
            .with_current(|frame| DetectorOutput {
                frame_path: frame_path_for(frame, request),
                detections: frame.detections.clone(),
            })
            .ok_or_else(|| CollaboratorError::Unavailable("replay detector".into()))
    }

    async fn store_frame(&self, request: &DetectRequest) -> Result<String, CollaboratorError> {
        self.deck
            .with_current(|frame| frame_path_for(frame, request))
            .ok_or_else(|| CollaboratorError::Unavailable("replay detector".into()))
    }
}

/// Serves the recorded descriptions of the current frame.
pub struct ReplayDescriber {
    deck: ReplayDeck,
}

impl ReplayDescriber {
    pub fn new(deck: ReplayDeck) -> Self {
        Self { deck }
    }
}

#[async_trait]
impl Describer for ReplayDescriber {
    async fn describe_object(
        &self,
        _crop: &[u8],
        hint_label: &str,
    ) -> Result<ObjectDescription, CollaboratorError> {
        self.deck
            .with_current(|frame| {
                frame
                    .descriptions
                    .iter()
                    .find(|d| d.label == hint_label)
                    .map(|d| ObjectDescription {
                        name: d.name.clone(),
                        details: d.details.clone(),
                    })
            })
            .flatten()
            .ok_or_else(|| {
                CollaboratorError::BadResponse(format!("no recorded description for '{hint_label}'"))
            })
    }

    async fn describe_frame(&self, _image: &[u8]) -> Result<FrameDescription, CollaboratorError> {
        self.deck
            .with_current(|frame| {
                frame.frame_description.clone().or_else(|| {
                    (!frame.descriptions.is_empty()).then(|| FrameDescription {
                        objects: frame
                            .descriptions
                            .iter()
                            .map(|d| DescribedObject {
                                name: d.name.clone(),
                                position: String::new(),
                                details: d.details.clone(),
                            })
                            .collect(),
                    })
                })
            })
            .flatten()
            .ok_or_else(|| CollaboratorError::BadResponse("no recorded frame description".into()))
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Driver
// ─────────────────────────────────────────────────────────────────────────────

/// Outcome of one replayed capture.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ReplayReport {
    pub frames: usize,
    pub failed: usize,
    pub skipped_lines: usize,
    pub described: usize,
    pub scans_completed: usize,
    pub probes: usize,
}

/// Replay every frame of the capture at `path` through `engine`.
///
/// Malformed lines and failing frames are counted and skipped.  Each probe
/// gets its own session, disconnected once the capture ends.
pub async fn replay_file(
    engine: &Arc<FusionEngine>,
    deck: &ReplayDeck,
    path: &Path,
) -> Result<ReplayReport, ReplayError> {
    let raw = std::fs::read_to_string(path).map_err(|source| ReplayError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let base = path.parent().unwrap_or_else(|| Path::new("."));

    let mut report = ReplayReport::default();
    let mut sessions: HashMap<String, ProbeSession> = HashMap::new();

    for (n, line) in raw.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let frame: RecordedFrame = match serde_json::from_str(line) {
            Ok(f) => f,
            Err(e) => {
                warn!(line = n + 1, error = %e, "skipping malformed capture line");
                report.skipped_lines += 1;
                continue;
            }
        };
        let image = match load_image(base, &frame) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(line = n + 1, error = %e, "skipping frame without usable image");
                report.skipped_lines += 1;
                continue;
            }
        };

        let input = FrameInput {
            scan_id: frame.scan_id.clone(),
            image,
            depth: frame.depth,
            pose: frame.pose,
            timestamp: frame.timestamp,
        };
        let stop = frame.stop;
        let probe_id = frame.probe_id.clone();
        let session = sessions
            .entry(probe_id.clone())
            .or_insert_with(|| engine.session(probe_id));

        deck.load(frame);
        let result = session.ingest(input).await;
        deck.clear();

        match result {
            Ok(summary) => {
                report.frames += 1;
                report.described += summary.described;
                if stop {
                    match session.stop_scan(&summary.scan_id) {
                        Ok(_) => report.scans_completed += 1,
                        Err(e) => warn!(scan_id = %summary.scan_id, error = %e, "stop failed"),
                    }
                }
            }
            Err(e) => {
                warn!(line = n + 1, error = %e, "frame failed");
                report.failed += 1;
            }
        }
    }

    report.probes = sessions.len();
    for session in sessions.into_values() {
        session.disconnect();
    }
    info!(
        capture = %path.display(),
        frames = report.frames,
        failed = report.failed,
        skipped = report.skipped_lines,
        "replay finished"
    );
    Ok(report)
}

fn load_image(base: &Path, frame: &RecordedFrame) -> Result<Vec<u8>, String> {
    match &frame.image {
        Some(rel) => {
            let path = base.join(rel);
            std::fs::read(&path).map_err(|e| format!("{}: {e}", path.display()))
        }
        None => blank_png(frame.width, frame.height).map_err(|e| e.to_string()),
    }
}

fn blank_png(width: u32, height: u32) -> image::ImageResult<Vec<u8>> {
    let img = DynamicImage::ImageRgb8(RgbImage::new(width.max(1), height.max(1)));
    let mut out = Vec::new();
    img.write_to(&mut Cursor::new(&mut out), ImageFormat::Png)?;
    Ok(out)
}
