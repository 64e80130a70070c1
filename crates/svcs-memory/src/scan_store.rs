//! Scan State Store.
//!
//! Owns one [`ScanRecord`] per scan id.  Records are created lazily on the
//! first frame that references an unseen id, mutated by every ingested frame,
//! flipped to `completed` by an explicit stop, and only destroyed by a
//! process-wide [`ScanStore::reset`].
//!
//! ## Locking
//!
//! The scan map sits behind a [`RwLock`]; each record behind its own
//! [`Mutex`].  A frame commit holds the map's read lock plus the record's
//! mutex, so two probes writing the same scan are serialized while different
//! scans proceed in parallel.  `reset` takes the map's write lock and
//! therefore waits for in-flight commits.  No lock is held across an
//! `.await`.
//!
//! ## Partial-failure isolation
//!
//! A commit always records the detection history and counters.  The semantic
//! additions of the frame (label-cache writes, observations, object count)
//! are validated first and applied all-or-nothing: if any of them is invalid
//! the frame still commits, without its semantic part, and the
//! [`FrameOutcome`] says so.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use serde::Serialize;
use svcs_types::{
    Detection, ObjectKey, ScanStatus, ScanSummary, SemanticObservation, StateVector, SvcsError,
    TrackedObject,
};
use tracing::{debug, info, warn};

use crate::label_cache::{LabelCache, LabelOrigin};

// ─────────────────────────────────────────────────────────────────────────────
// Records
// ─────────────────────────────────────────────────────────────────────────────

/// Aggregate state of one scan.
#[derive(Debug, Clone, Serialize)]
pub struct ScanRecord {
    pub scan_id: String,
    pub status: ScanStatus,
    /// Probe (or other ingress) that created the scan.
    pub source: Option<String>,
    pub frame_count: u64,
    pub object_count: u64,
    /// Semantic observations in arrival order.
    pub objects: Vec<SemanticObservation>,
    /// Full detection history in arrival order.
    pub detections: Vec<Detection>,
    pub labels: LabelCache,
    pub last_frame_path: Option<String>,
    pub updated_at: Option<f64>,
}

impl ScanRecord {
    fn new(scan_id: &str, source: Option<&str>, label_ttl: f64) -> Self {
        Self {
            scan_id: scan_id.to_string(),
            status: ScanStatus::Scanning,
            source: source.map(str::to_string),
            frame_count: 0,
            object_count: 0,
            objects: Vec::new(),
            detections: Vec::new(),
            labels: LabelCache::new(label_ttl),
            last_frame_path: None,
            updated_at: None,
        }
    }

    /// Listing view of this record.
    pub fn summary(&self) -> ScanSummary {
        let last_frame = self
            .last_frame_path
            .as_deref()
            .and_then(|p| Path::new(p).file_name())
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        ScanSummary {
            scan_id: self.scan_id.clone(),
            status: self.status,
            source: self.source.clone(),
            frame_count: self.frame_count,
            object_count: self.object_count,
            updated_at: self.updated_at,
            last_frame,
        }
    }

    fn apply(&mut self, commit: FrameCommit) -> FrameOutcome {
        let FrameCommit {
            timestamp,
            frame_path,
            detections,
            observations,
        } = commit;

        self.frame_count += 1;
        self.updated_at = Some(timestamp);
        if let Some(path) = frame_path {
            self.last_frame_path = Some(path);
        }

        let semantic_error = validate_semantics(&detections, &observations, timestamp).err();
        if let Some(reason) = &semantic_error {
            warn!(
                scan_id = %self.scan_id,
                frame = self.frame_count,
                %reason,
                "semantic merge rejected; recording detections only"
            );
        }
        let semantic_ok = semantic_error.is_none();

        let mut state = StateVector::new();
        for fused in detections {
            let FusedDetection {
                key,
                mut detection,
                fresh,
            } = fused;

            let (name, details) = match fresh.filter(|_| semantic_ok) {
                Some(label) => {
                    self.labels
                        .put(key.clone(), label.name.clone(), label.details.clone(), timestamp);
                    detection.semantic_name = Some(label.name.clone());
                    detection.semantic_details = Some(label.details.clone());
                    (label.name, Some(label.details))
                }
                None => {
                    let view = self.labels.resolve(&key, &detection, timestamp);
                    if view.origin == LabelOrigin::Cached {
                        detection.semantic_name = Some(view.name.clone());
                        detection.semantic_details = view.details.clone();
                    }
                    (view.name, view.details)
                }
            };

            state.insert(
                key,
                TrackedObject {
                    label: name,
                    raw_label: detection.label.clone(),
                    position: detection.position_3d,
                    confidence: detection.confidence,
                    tracker_id: detection.tracker_id,
                    details,
                },
            );
            self.detections.push(detection);
        }

        let mut observations_added = 0;
        if semantic_ok {
            observations_added = observations.len();
            self.object_count += observations_added as u64;
            self.objects.extend(observations);
        }

        debug!(
            scan_id = %self.scan_id,
            frame = self.frame_count,
            tracked = state.len(),
            observations_added,
            "frame recorded"
        );

        FrameOutcome {
            frame_count: self.frame_count,
            object_count: self.object_count,
            state,
            observations_added,
            semantic_error,
        }
    }
}

fn validate_semantics(
    detections: &[FusedDetection],
    observations: &[SemanticObservation],
    timestamp: f64,
) -> Result<(), String> {
    if !timestamp.is_finite() {
        return Err(format!("non-finite frame timestamp {timestamp}"));
    }
    for fused in detections {
        if let Some(label) = &fused.fresh
            && label.name.trim().is_empty()
        {
            return Err(format!("empty semantic name for {}", fused.key));
        }
    }
    for obs in observations {
        if obs.name.trim().is_empty() {
            return Err("observation without a name".to_string());
        }
        if !obs.position_3d.is_finite() || !obs.timestamp.is_finite() {
            return Err(format!("observation '{}' has non-finite coordinates", obs.name));
        }
    }
    Ok(())
}

// ─────────────────────────────────────────────────────────────────────────────
// Commit / outcome
// ─────────────────────────────────────────────────────────────────────────────

/// A semantic label produced for one detection on the current frame.
#[derive(Debug, Clone, PartialEq)]
pub struct FreshLabel {
    pub name: String,
    pub details: String,
}

/// One keyed detection of the frame being committed.
#[derive(Debug, Clone)]
pub struct FusedDetection {
    pub key: ObjectKey,
    pub detection: Detection,
    /// Semantic result obtained for this detection on this frame, if any.
    pub fresh: Option<FreshLabel>,
}

/// Everything one frame contributes to its scan.
#[derive(Debug, Clone, Default)]
pub struct FrameCommit {
    pub timestamp: f64,
    pub frame_path: Option<String>,
    pub detections: Vec<FusedDetection>,
    pub observations: Vec<SemanticObservation>,
}

/// Result of [`ScanStore::record_frame`].
#[derive(Debug, Clone)]
pub struct FrameOutcome {
    pub frame_count: u64,
    pub object_count: u64,
    /// Display-ready state of every object detected on the frame.
    pub state: StateVector,
    pub observations_added: usize,
    /// Why the semantic part of the frame was skipped, if it was.
    pub semantic_error: Option<String>,
}

impl FrameOutcome {
    pub fn semantic_committed(&self) -> bool {
        self.semantic_error.is_none()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// ScanStore
// ─────────────────────────────────────────────────────────────────────────────

type ScanCell = Arc<Mutex<ScanRecord>>;

/// Mapping of scan id → [`ScanRecord`] with per-scan mutual exclusion.
#[derive(Debug)]
pub struct ScanStore {
    label_ttl: f64,
    scans: RwLock<HashMap<String, ScanCell>>,
}

impl ScanStore {
    /// Create an empty store whose label caches use `label_ttl` seconds.
    pub fn new(label_ttl: f64) -> Self {
        Self {
            label_ttl,
            scans: RwLock::new(HashMap::new()),
        }
    }

    /// Return the summary of `scan_id`, creating the record if it does not
    /// exist yet.  Idempotent: an existing record keeps its original source.
    pub fn get_or_create(&self, scan_id: &str, source: Option<&str>) -> ScanSummary {
        let cell = self.cell_or_create(scan_id, source);
        let record = lock(&cell);
        record.summary()
    }

    /// Commit one frame to `scan_id`, creating the scan on first use.
    ///
    /// Detection history and counters are always recorded.  The semantic
    /// part (fresh labels, observations, `object_count`) is merged as a
    /// unit: if any fresh label has an empty name, or any observation has
    /// an empty name or non-finite values, none of it is merged and
    /// [`FrameOutcome::semantic_error`] says why.  The frame's semantic
    /// output then stays out of the label cache and the semantic index
    /// together.
    pub fn record_frame(
        &self,
        scan_id: &str,
        source: Option<&str>,
        commit: FrameCommit,
    ) -> FrameOutcome {
        loop {
            {
                let map = self.read_map();
                if let Some(cell) = map.get(scan_id) {
                    let mut record = lock(cell);
                    return record.apply(commit);
                }
            }
            // A reset may slip in between creation and the commit; retry.
            self.cell_or_create(scan_id, source);
        }
    }

    /// Flip `scan_id` to [`ScanStatus::Completed`].
    pub fn mark_completed(&self, scan_id: &str) -> Result<ScanSummary, SvcsError> {
        let map = self.read_map();
        let cell = map.get(scan_id).ok_or_else(|| not_found(scan_id))?;
        let mut record = lock(cell);
        if record.status != ScanStatus::Completed {
            record.status = ScanStatus::Completed;
            info!(scan_id, frames = record.frame_count, "scan completed");
        }
        Ok(record.summary())
    }

    /// Summaries of every scan, ordered by scan id.
    pub fn list_scans(&self) -> Vec<ScanSummary> {
        let map = self.read_map();
        let mut summaries: Vec<ScanSummary> = map.values().map(|c| lock(c).summary()).collect();
        summaries.sort_by(|a, b| a.scan_id.cmp(&b.scan_id));
        summaries
    }

    /// Full copy of one record.
    pub fn snapshot(&self, scan_id: &str) -> Result<ScanRecord, SvcsError> {
        self.with_scan(scan_id, |r| r.clone())
    }

    /// Run `f` against one record under its lock.
    pub fn with_scan<T>(
        &self,
        scan_id: &str,
        f: impl FnOnce(&ScanRecord) -> T,
    ) -> Result<T, SvcsError> {
        let map = self.read_map();
        let cell = map.get(scan_id).ok_or_else(|| not_found(scan_id))?;
        let record = lock(cell);
        Ok(f(&record))
    }

    /// Whether `scan_id` exists.
    pub fn contains(&self, scan_id: &str) -> bool {
        self.read_map().contains_key(scan_id)
    }

    /// Drop every scan atomically.
    pub fn reset(&self) -> usize {
        let mut map = self.write_map();
        let dropped = map.len();
        map.clear();
        info!(dropped, "scan store reset");
        dropped
    }

    pub fn len(&self) -> usize {
        self.read_map().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read_map().is_empty()
    }

    // ── internal helpers ─────────────────────────────────────────────────────

    fn cell_or_create(&self, scan_id: &str, source: Option<&str>) -> ScanCell {
        if let Some(cell) = self.read_map().get(scan_id) {
            return Arc::clone(cell);
        }
        let mut map = self.write_map();
        let cell = map.entry(scan_id.to_string()).or_insert_with(|| {
            info!(scan_id, source = source.unwrap_or("-"), "scan created");
            Arc::new(Mutex::new(ScanRecord::new(scan_id, source, self.label_ttl)))
        });
        Arc::clone(cell)
    }

    fn read_map(&self) -> RwLockReadGuard<'_, HashMap<String, ScanCell>> {
        self.scans.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_map(&self) -> RwLockWriteGuard<'_, HashMap<String, ScanCell>> {
        self.scans.write().unwrap_or_else(PoisonError::into_inner)
    }
}

fn lock(cell: &ScanCell) -> MutexGuard<'_, ScanRecord> {
    cell.lock().unwrap_or_else(PoisonError::into_inner)
}

fn not_found(scan_id: &str) -> SvcsError {
    SvcsError::NotFound(format!("Scan '{scan_id}' not found"))
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
