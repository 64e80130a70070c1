use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Tracker id reported by the detector when no persistent tracker is
/// following the object.
pub const NO_TRACKER: i64 = -1;

/// A scene-relative 3-D position (same unit as the detector's
/// back-projection, nominally metres).
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Position3D {
    #[serde(default)]
    pub x: f64,
    #[serde(default)]
    pub y: f64,
    #[serde(default)]
    pub z: f64,
}

impl Position3D {
    pub fn new(x: f64, y: f64, z: f64) -> Self {
        Self { x, y, z }
    }

    /// Euclidean distance to `other`.
    pub fn distance(&self, other: &Self) -> f64 {
        let dx = self.x - other.x;
        let dy = self.y - other.y;
        let dz = self.z - other.z;
        (dx * dx + dy * dy + dz * dz).sqrt()
    }

    pub fn is_finite(&self) -> bool {
        self.x.is_finite() && self.y.is_finite() && self.z.is_finite()
    }
}

/// Pixel-space bounding box `[x1, y1, x2, y2]`.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BoundingBox(pub [f64; 4]);

impl BoundingBox {
    pub fn new(x1: f64, y1: f64, x2: f64, y2: f64) -> Self {
        Self([x1, y1, x2, y2])
    }

    /// Centre point `(cx, cy)`.
    pub fn center(&self) -> (f64, f64) {
        let [x1, y1, x2, y2] = self.0;
        ((x1 + x2) / 2.0, (y1 + y2) / 2.0)
    }
}

/// Device orientation sample in degrees (yaw / pitch / roll style axes).
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Orientation {
    #[serde(default)]
    pub alpha: f64,
    #[serde(default)]
    pub beta: f64,
    #[serde(default)]
    pub gamma: f64,
}

/// One located object in one frame, as produced by the external detector.
///
/// The semantic fields are filled in by label fusion before the detection is
/// appended to a scan's history; after that the record is never modified.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    pub label: String,
    #[serde(default = "no_tracker")]
    pub tracker_id: i64,
    #[serde(default)]
    pub confidence: f64,
    #[serde(default)]
    pub bbox: BoundingBox,
    #[serde(default)]
    pub position_3d: Position3D,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub semantic_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub semantic_details: Option<String>,
    #[serde(default)]
    pub frame_path: String,
    #[serde(default)]
    pub timestamp: f64,
}

fn no_tracker() -> i64 {
    NO_TRACKER
}

impl Detection {
    /// A detection with no tracker, no semantic fields and an empty frame
    /// reference.
    pub fn new(label: impl Into<String>, bbox: BoundingBox, position_3d: Position3D) -> Self {
        Self {
            label: label.into(),
            tracker_id: NO_TRACKER,
            confidence: 0.0,
            bbox,
            position_3d,
            semantic_name: None,
            semantic_details: None,
            frame_path: String::new(),
            timestamp: 0.0,
        }
    }

    pub fn has_tracker(&self) -> bool {
        self.tracker_id > NO_TRACKER
    }
}

/// Stable identity of a physical object within one scan.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ObjectKey(String);

impl ObjectKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A recognised object instance, as shown to people and agents.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SemanticObservation {
    pub name: String,
    pub position_3d: Position3D,
    pub details: String,
    pub timestamp: f64,
    pub frame_path: String,
}

/// Lifecycle of a scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScanStatus {
    Scanning,
    Completed,
}

/// Listing view of one scan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScanSummary {
    pub scan_id: String,
    pub status: ScanStatus,
    pub source: Option<String>,
    pub frame_count: u64,
    pub object_count: u64,
    pub updated_at: Option<f64>,
    /// File-name component of the last stored frame (empty when none).
    pub last_frame: String,
}

/// Classification of a change between two scans.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum DiffEventKind {
    Move,
    Added,
    Removed,
}

impl fmt::Display for DiffEventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DiffEventKind::Move => write!(f, "MOVE"),
            DiffEventKind::Added => write!(f, "ADDED"),
            DiffEventKind::Removed => write!(f, "REMOVED"),
        }
    }
}

/// One classified change between a "before" and an "after" scan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiffEvent {
    #[serde(rename = "type")]
    pub kind: DiffEventKind,
    pub label: String,
    pub distance: Option<f64>,
    pub from: Option<Position3D>,
    pub to: Option<Position3D>,
}

/// Display-ready state of one tracked object in the current frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackedObject {
    /// Resolved display label (fresh or cached semantic name, else the
    /// detector label).
    pub label: String,
    pub raw_label: String,
    pub position: Position3D,
    pub confidence: f64,
    pub tracker_id: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

/// Per-frame state vector keyed by object identity.
pub type StateVector = BTreeMap<ObjectKey, TrackedObject>;

/// Unified event wrapper for the observer bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    /// e.g. `"svcs-runtime::engine"`
    pub source: String,
    pub payload: EventPayload,
}

impl Event {
    pub fn new(source: impl Into<String>, payload: EventPayload) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            source: source.into(),
            payload,
        }
    }
}

/// Variants of data routed to observers.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventPayload {
    Detection(FrameBroadcast),
    ScanCompleted { scan_id: String, log: String },
    ProbeDisconnected { probe: String },
    SystemAlert { component: String, message: String },
}

/// Snapshot broadcast to dashboards after every ingested frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FrameBroadcast {
    pub source: String,
    pub scan_id: String,
    pub frame_number: u64,
    pub objects: StateVector,
    pub pose: Orientation,
    pub timestamp: f64,
    pub log: String,
}

/// Global error type spanning caller mistakes, missing scans and failing
/// collaborators.
#[derive(Error, Debug, Serialize, Deserialize)]
pub enum SvcsError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Dependency failure in {component}: {details}")]
    Dependency { component: String, details: String },

    #[error("Persistence error: {0}")]
    Persistence(String),

    #[error("Channel error: {0}")]
    Channel(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detection_defaults_tracker_to_minus_one() {
        let json = r#"{"label":"cup","confidence":0.9,"bbox":[0,0,10,10],
            "position_3d":{"x":1.0,"y":2.0,"z":1.5},"frame_path":"f.jpg","timestamp":3.0}"#;
        let det: Detection = serde_json::from_str(json).unwrap();
        assert_eq!(det.tracker_id, NO_TRACKER);
        assert!(!det.has_tracker());
        assert_eq!(det.bbox, BoundingBox::new(0.0, 0.0, 10.0, 10.0));
        assert!(det.semantic_name.is_none());
    }

    #[test]
    fn bounding_box_center() {
        let bbox = BoundingBox::new(10.0, 20.0, 30.0, 60.0);
        assert_eq!(bbox.center(), (20.0, 40.0));
    }

    #[test]
    fn position_distance_is_euclidean() {
        let a = Position3D::new(0.0, 0.0, 0.0);
        let b = Position3D::new(3.0, 4.0, 0.0);
        assert!((a.distance(&b) - 5.0).abs() < 1e-12);
    }

    #[test]
    fn diff_event_serializes_type_tag_uppercase() {
        let ev = DiffEvent {
            kind: DiffEventKind::Added,
            label: "chair".to_string(),
            distance: None,
            from: None,
            to: Some(Position3D::new(1.0, 0.0, 0.0)),
        };
        let json = serde_json::to_string(&ev).unwrap();
        assert!(json.contains(r#""type":"ADDED""#));
        assert!(json.contains(r#""from":null"#));
    }

    #[test]
    fn scan_status_serializes_lowercase() {
        let json = serde_json::to_string(&ScanStatus::Scanning).unwrap();
        assert_eq!(json, r#""scanning""#);
    }

    #[test]
    fn object_key_is_transparent() {
        let key = ObjectKey::new("cup_4");
        assert_eq!(serde_json::to_string(&key).unwrap(), r#""cup_4""#);
        assert_eq!(key.to_string(), "cup_4");
    }

    #[test]
    fn event_roundtrip() {
        let event = Event::new(
            "svcs-runtime::engine",
            EventPayload::ScanCompleted {
                scan_id: "room_01".to_string(),
                log: "Scan room_01 completed.".to_string(),
            },
        );
        let json = serde_json::to_string(&event).unwrap();
        let back: Event = serde_json::from_str(&json).unwrap();
        assert_eq!(event.id, back.id);
        assert!(matches!(back.payload, EventPayload::ScanCompleted { .. }));
    }

    #[test]
    fn svcs_error_display() {
        let err = SvcsError::NotFound("Scan 'x' not found".to_string());
        assert!(err.to_string().contains("Not found"));

        let err = SvcsError::Dependency {
            component: "describer".to_string(),
            details: "timeout".to_string(),
        };
        assert!(err.to_string().contains("describer"));
    }
}
