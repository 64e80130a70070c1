//! Scan Diff Engine.
//!
//! Compares where things were in a "before" scan with where they are in an
//! "after" scan.
//!
//! For each scan the full detection history is collapsed into the **latest
//! position per detector label** (greatest timestamp wins; on equal
//! timestamps the first one seen is kept).  Multiple tracked instances that
//! share a label therefore collapse into one representative; this is a
//! scan-level change summary, not per-instance diffing.
//!
//! Then, per label:
//!
//! | present in | condition | event |
//! |---|---|---|
//! | both | distance > threshold | `MOVE {label, distance, from, to}` |
//! | both | distance ≤ threshold | – |
//! | after only | | `ADDED {label, to}` |
//! | before only | | `REMOVED {label, from}` |
//!
//! Events are grouped MOVE, ADDED, REMOVED; each group is in ascending label
//! order.  Distances are rounded to 4 decimals.

use std::collections::BTreeMap;

use serde::Serialize;
use svcs_types::{Detection, DiffEvent, DiffEventKind, Position3D, SvcsError};

use crate::scan_store::{ScanRecord, ScanStore};

/// Default MOVE threshold, in position units.
pub const DEFAULT_DIFF_THRESHOLD: f64 = 0.5;

/// Result of comparing two scans.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScanDiff {
    pub before_scan: String,
    pub after_scan: String,
    pub threshold: f64,
    pub events: Vec<DiffEvent>,
    pub total: usize,
    pub summary: String,
}

/// Latest position of every label in `detections`.
pub fn latest_positions(detections: &[Detection]) -> BTreeMap<String, Position3D> {
    let mut latest: BTreeMap<String, (f64, Position3D)> = BTreeMap::new();
    for det in detections {
        match latest.get_mut(&det.label) {
            Some(entry) if det.timestamp > entry.0 => {
                *entry = (det.timestamp, det.position_3d);
            }
            Some(_) => {}
            None => {
                latest.insert(det.label.clone(), (det.timestamp, det.position_3d));
            }
        }
    }
    latest.into_iter().map(|(label, (_, pos))| (label, pos)).collect()
}

/// Classify the changes between two latest-position maps.
pub fn diff_positions(
    before: &BTreeMap<String, Position3D>,
    after: &BTreeMap<String, Position3D>,
    threshold: f64,
) -> Vec<DiffEvent> {
    let mut moved = Vec::new();
    let mut added = Vec::new();
    let mut removed = Vec::new();

    for (label, to) in after {
        match before.get(label) {
            Some(from) => {
                let distance = from.distance(to);
                if distance > threshold {
                    moved.push(DiffEvent {
                        kind: DiffEventKind::Move,
                        label: label.clone(),
                        distance: Some(round4(distance)),
                        from: Some(*from),
                        to: Some(*to),
                    });
                }
            }
            None => added.push(DiffEvent {
                kind: DiffEventKind::Added,
                label: label.clone(),
                distance: None,
                from: None,
                to: Some(*to),
            }),
        }
    }
    for (label, from) in before {
        if !after.contains_key(label) {
            removed.push(DiffEvent {
                kind: DiffEventKind::Removed,
                label: label.clone(),
                distance: None,
                from: Some(*from),
                to: None,
            });
        }
    }

    moved.into_iter().chain(added).chain(removed).collect()
}

/// One-line human-readable summary of `events`.
pub fn summarize(before_scan: &str, after_scan: &str, events: &[DiffEvent]) -> String {
    if events.is_empty() {
        return format!("No changes detected between {before_scan} and {after_scan}.");
    }
    let count = |kind| events.iter().filter(|e| e.kind == kind).count();
    let total = events.len();
    format!(
        "{total} change{} between {before_scan} and {after_scan}: {} moved, {} added, {} removed.",
        if total == 1 { "" } else { "s" },
        count(DiffEventKind::Move),
        count(DiffEventKind::Added),
        count(DiffEventKind::Removed),
    )
}

/// Diff two scan snapshots.
pub fn diff_scans(
    before: &ScanRecord,
    after: &ScanRecord,
    threshold: f64,
) -> Result<ScanDiff, SvcsError> {
    check_threshold(threshold)?;
    Ok(build_diff(
        &before.scan_id,
        &after.scan_id,
        &latest_positions(&before.detections),
        &latest_positions(&after.detections),
        threshold,
    ))
}

impl ScanStore {
    /// Diff two stored scans without cloning their histories.
    ///
    /// Both ids are checked first; an unknown id yields
    /// [`SvcsError::NotFound`] whatever the threshold.  A negative or
    /// non-finite threshold on known scans yields [`SvcsError::InvalidInput`].
    pub fn diff(&self, before: &str, after: &str, threshold: f64) -> Result<ScanDiff, SvcsError> {
        for id in [before, after] {
            if !self.contains(id) {
                return Err(SvcsError::NotFound(format!("Scan '{id}' not found")));
            }
        }
        check_threshold(threshold)?;

        let before_latest = self.with_scan(before, |r| latest_positions(&r.detections))?;
        let after_latest = self.with_scan(after, |r| latest_positions(&r.detections))?;
        Ok(build_diff(before, after, &before_latest, &after_latest, threshold))
    }
}

fn check_threshold(threshold: f64) -> Result<(), SvcsError> {
    if !threshold.is_finite() || threshold < 0.0 {
        return Err(SvcsError::InvalidInput(format!(
            "diff threshold must be a non-negative number, got {threshold}"
        )));
    }
    Ok(())
}

fn build_diff(
    before: &str,
    after: &str,
    before_latest: &BTreeMap<String, Position3D>,
    after_latest: &BTreeMap<String, Position3D>,
    threshold: f64,
) -> ScanDiff {
    let events = diff_positions(before_latest, after_latest, threshold);
    ScanDiff {
        before_scan: before.to_string(),
        after_scan: after.to_string(),
        threshold,
        total: events.len(),
        summary: summarize(before, after, &events),
        events,
    }
}

fn round4(v: f64) -> f64 {
    (v * 10_000.0).round() / 10_000.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scan_store::{FrameCommit, FusedDetection};
    use svcs_types::{BoundingBox, ObjectKey};

    fn det(label: &str, t: f64, x: f64, y: f64, z: f64) -> Detection {
        let mut d = Detection::new(label, BoundingBox::default(), Position3D::new(x, y, z));
        d.timestamp = t;
        d
    }

    fn positions(entries: &[(&str, (f64, f64, f64))]) -> BTreeMap<String, Position3D> {
        entries
            .iter()
            .map(|(l, (x, y, z))| (l.to_string(), Position3D::new(*x, *y, *z)))
            .collect()
    }

    fn record(store: &ScanStore, scan: &str, detections: Vec<Detection>) {
        let t = detections.iter().map(|d| d.timestamp).fold(0.0, f64::max);
        let detections = detections
            .into_iter()
            .map(|d| FusedDetection {
                key: ObjectKey::new(format!("{}_{}", d.label, d.timestamp)),
                detection: d,
                fresh: None,
            })
            .collect();
        store.record_frame(
            scan,
            None,
            FrameCommit {
                timestamp: t,
                frame_path: None,
                detections,
                observations: vec![],
            },
        );
    }

    // ── latest_positions ─────────────────────────────────────────────────────

    #[test]
    fn latest_position_keeps_greatest_timestamp() {
        let dets = vec![
            det("cup", 1.0, 0.0, 0.0, 0.0),
            det("cup", 3.0, 2.0, 0.0, 0.0),
            det("cup", 2.0, 1.0, 0.0, 0.0),
        ];
        let latest = latest_positions(&dets);
        assert_eq!(latest["cup"], Position3D::new(2.0, 0.0, 0.0));
    }

    #[test]
    fn latest_position_tie_keeps_first_seen() {
        let dets = vec![det("cup", 1.0, 0.0, 0.0, 0.0), det("cup", 1.0, 5.0, 0.0, 0.0)];
        assert_eq!(latest_positions(&dets)["cup"], Position3D::new(0.0, 0.0, 0.0));
    }

    #[test]
    fn same_label_instances_collapse() {
        let mut a = det("chair", 1.0, 0.0, 0.0, 0.0);
        a.tracker_id = 1;
        let mut b = det("chair", 2.0, 4.0, 0.0, 0.0);
        b.tracker_id = 2;
        let latest = latest_positions(&[a, b]);
        assert_eq!(latest.len(), 1);
    }

    // ── diff_positions ───────────────────────────────────────────────────────

    #[test]
    fn move_then_added() {
        let before = positions(&[("a", (0.0, 0.0, 0.0))]);
        let after = positions(&[("a", (1.0, 0.0, 0.0)), ("b", (0.0, 0.0, 0.0))]);
        let events = diff_positions(&before, &after, 0.5);

        assert_eq!(events.len(), 2);
        assert_eq!(events[0].kind, DiffEventKind::Move);
        assert_eq!(events[0].label, "a");
        assert_eq!(events[0].distance, Some(1.0));
        assert_eq!(events[0].from, Some(Position3D::new(0.0, 0.0, 0.0)));
        assert_eq!(events[0].to, Some(Position3D::new(1.0, 0.0, 0.0)));
        assert_eq!(events[1].kind, DiffEventKind::Added);
        assert_eq!(events[1].label, "b");
        assert!(events[1].from.is_none());
        assert_eq!(events[1].to, Some(Position3D::new(0.0, 0.0, 0.0)));
    }

    #[test]
    fn identical_positions_yield_no_events() {
        let p = positions(&[("a", (1.0, 2.0, 3.0)), ("b", (0.0, 0.0, 0.0))]);
        for threshold in [0.01, 0.5, 10.0] {
            assert!(diff_positions(&p, &p, threshold).is_empty());
        }
    }

    #[test]
    fn within_threshold_is_silent() {
        let before = positions(&[("a", (0.0, 0.0, 0.0))]);
        let after = positions(&[("a", (0.5, 0.0, 0.0))]);
        assert!(diff_positions(&before, &after, 0.5).is_empty());
    }

    #[test]
    fn categories_ordered_and_alphabetical() {
        let before = positions(&[
            ("zebra", (0.0, 0.0, 0.0)),
            ("mug", (0.0, 0.0, 0.0)),
            ("lamp", (0.0, 0.0, 0.0)),
            ("desk", (0.0, 0.0, 0.0)),
        ]);
        let after = positions(&[
            ("mug", (3.0, 0.0, 0.0)),
            ("desk", (0.0, 2.0, 0.0)),
            ("vase", (0.0, 0.0, 0.0)),
            ("book", (0.0, 0.0, 0.0)),
        ]);
        let events = diff_positions(&before, &after, 0.5);
        let got: Vec<(DiffEventKind, &str)> =
            events.iter().map(|e| (e.kind, e.label.as_str())).collect();
        assert_eq!(
            got,
            vec![
                (DiffEventKind::Move, "desk"),
                (DiffEventKind::Move, "mug"),
                (DiffEventKind::Added, "book"),
                (DiffEventKind::Added, "vase"),
                (DiffEventKind::Removed, "lamp"),
                (DiffEventKind::Removed, "zebra"),
            ]
        );
    }

    #[test]
    fn distance_rounded_to_four_decimals() {
        let before = positions(&[("a", (0.0, 0.0, 0.0))]);
        let after = positions(&[("a", (1.0, 1.0, 1.0))]);
        let events = diff_positions(&before, &after, 0.5);
        assert_eq!(events[0].distance, Some(1.7321));
    }

    #[test]
    fn summary_wording() {
        assert_eq!(summarize("a", "b", &[]), "No changes detected between a and b.");
        let before = positions(&[("x", (0.0, 0.0, 0.0))]);
        let events = diff_positions(&before, &BTreeMap::new(), 0.5);
        assert_eq!(
            summarize("a", "b", &events),
            "1 change between a and b: 0 moved, 0 added, 1 removed."
        );
    }

    // ── ScanStore::diff ──────────────────────────────────────────────────────

    #[test]
    fn store_diff_reports_unknown_scan() {
        let store = ScanStore::new(10.0);
        store.get_or_create("before", None);
        let err = store.diff("before", "missing", 0.5).unwrap_err();
        assert!(matches!(err, SvcsError::NotFound(ref m) if m.contains("missing")));
        let err = store.diff("missing", "before", 0.5).unwrap_err();
        assert!(matches!(err, SvcsError::NotFound(_)));
    }

    #[test]
    fn store_diff_empty_scans_is_empty_not_error() {
        let store = ScanStore::new(10.0);
        store.get_or_create("a", None);
        store.get_or_create("b", None);
        let diff = store.diff("a", "b", DEFAULT_DIFF_THRESHOLD).unwrap();
        assert!(diff.events.is_empty());
        assert_eq!(diff.total, 0);
    }

    #[test]
    fn store_diff_uses_recorded_history() {
        let store = ScanStore::new(10.0);
        record(&store, "before", vec![det("a", 1.0, 0.0, 0.0, 0.0)]);
        record(&store, "after", vec![det("a", 2.0, 1.0, 0.0, 0.0), det("b", 2.0, 0.0, 0.0, 0.0)]);

        let diff = store.diff("before", "after", 0.5).unwrap();
        assert_eq!(diff.total, 2);
        assert_eq!(diff.events[0].kind, DiffEventKind::Move);
        assert_eq!(diff.events[1].kind, DiffEventKind::Added);
        assert!(diff.summary.starts_with("2 changes"));
    }

    #[test]
    fn snapshot_diff_matches_store_diff() {
        let store = ScanStore::new(10.0);
        record(&store, "before", vec![det("lamp", 1.0, 0.0, 0.0, 0.0)]);
        record(&store, "after", vec![det("mug", 1.0, 0.0, 0.0, 0.0)]);

        let before = store.snapshot("before").unwrap();
        let after = store.snapshot("after").unwrap();
        let diff = diff_scans(&before, &after, DEFAULT_DIFF_THRESHOLD).unwrap();
        assert_eq!(diff, store.diff("before", "after", DEFAULT_DIFF_THRESHOLD).unwrap());
        assert_eq!(diff.events[0].kind, DiffEventKind::Added);
        assert_eq!(diff.events[1].kind, DiffEventKind::Removed);
        assert!(diff_scans(&before, &after, f64::INFINITY).is_err());
    }

    #[test]
    fn store_diff_same_scan_twice() {
        let store = ScanStore::new(10.0);
        record(&store, "room", vec![det("a", 1.0, 0.0, 0.0, 0.0)]);
        let diff = store.diff("room", "room", 0.5).unwrap();
        assert!(diff.events.is_empty());
    }

    #[test]
    fn store_diff_rejects_negative_threshold() {
        let store = ScanStore::new(10.0);
        store.get_or_create("a", None);
        assert!(matches!(
            store.diff("a", "a", -1.0).unwrap_err(),
            SvcsError::InvalidInput(_)
        ));
    }

    #[test]
    fn unknown_scan_reported_before_bad_threshold() {
        let store = ScanStore::new(10.0);
        store.get_or_create("a", None);
        for threshold in [-1.0, f64::NAN] {
            assert!(matches!(
                store.diff("a", "missing", threshold).unwrap_err(),
                SvcsError::NotFound(_)
            ));
            assert!(matches!(
                store.diff("missing", "a", threshold).unwrap_err(),
                SvcsError::NotFound(_)
            ));
        }
    }
}
