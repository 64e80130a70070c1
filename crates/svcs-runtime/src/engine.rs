//! [`FusionEngine`] – the per-frame fusion pipeline.
//!
//! Each probe connection gets a [`ProbeSession`] that owns the probe's frame
//! counter and processes its frames strictly in order.  One call to
//! [`ProbeSession::ingest`] runs:
//!
//! 1. **Validate** – reject empty or unrecognised image payloads before the
//!    frame counter moves.
//! 2. **Sample** – [`SamplingPolicy`] decides whether the detector runs;
//!    skipped frames are only stored so every frame keeps a `frame_path`.
//! 3. **Detect** – the [`Detector`] locates objects and back-projects them
//!    using the [`pose_matrix`] of the frame's orientation.  A detector
//!    failure drops the frame.
//! 4. **Describe** – on the description stride, up to
//!    `max_described_per_frame` detections are described (crops fanned out
//!    concurrently, or one whole-frame call).  Every call finishes before
//!    the frame is committed; failures just mean no semantic contribution.
//! 5. **Fuse & commit** – [`IdentityResolver`] keys every detection, the
//!    scan's label cache resolves display labels, and the
//!    [`ScanStore`] commits history, counters and observations under the
//!    scan's lock.
//! 6. **Index** – committed observations are appended to the
//!    [`SemanticIndex`].
//! 7. **Broadcast** – the frame's state vector goes out on
//!    [`Topic::Detections`].
//!
//! Different probes run concurrently against the shared store and index.
//! Steps 5 and 6 of one frame happen under a shared commit gate that
//! [`FusionEngine::reset`] takes exclusively, so a reset never leaves the
//! index holding observations of a scan it just dropped.
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use svcs_memory::{HashingEmbedder, SemanticIndex};
//! use svcs_middleware::EventBus;
//! use svcs_runtime::collaborators::Detector;
//! use svcs_runtime::engine::{FrameInput, FusionEngine};
//! use svcs_runtime::EngineConfig;
//!
//! # async fn run(detector: Arc<dyn Detector>, jpeg: Vec<u8>) -> Result<(), svcs_types::SvcsError> {
//! let index = Arc::new(SemanticIndex::in_memory(Some(Arc::new(HashingEmbedder::default()))));
//! let engine = Arc::new(FusionEngine::new(
//!     EngineConfig::default(),
//!     detector,
//!     index,
//!     EventBus::default(),
//! )?);
//!
//! let mut probe = engine.session("phone-1");
//! let summary = probe.ingest(FrameInput::new("kitchen", jpeg)).await?;
//! println!("frame {} → {} objects", summary.frame_number, summary.state.len());
//! # Ok(())
//! # }
//! ```

use std::sync::{Arc, PoisonError, RwLock};

use chrono::Utc;
use futures_util::future::join_all;
use serde::Serialize;
use svcs_memory::{
    FrameCommit, FrameOutcome, FreshLabel, FusedDetection, ObservationMeta, ScanDiff, ScanRecord,
    ScanStore, SearchHit, SemanticIndex,
};
use svcs_middleware::{EventBus, Topic};
use svcs_perception::{IdentityResolver, SamplingPolicy, pose_matrix};
use svcs_types::{
    Detection, Event, EventPayload, FrameBroadcast, Orientation, ScanSummary, SemanticObservation,
    StateVector, SvcsError,
};
use tracing::{debug, info, instrument, warn};

use crate::collaborators::{
    Answerer, DescribedObject, Describer, DetectRequest, Detector, ObjectDescription,
};
use crate::config::{DescribeMode, EngineConfig};
use crate::imaging::{crop_to_png, validate_image};

const ENGINE_SOURCE: &str = "svcs-runtime::engine";

// ─────────────────────────────────────────────────────────────────────────────
// Input / output types
// ─────────────────────────────────────────────────────────────────────────────

/// One frame as received from a probe (image already decoded from its
/// transport encoding).
#[derive(Debug, Clone)]
pub struct FrameInput {
    /// Target scan; `scan_<probe>` when absent.
    pub scan_id: Option<String>,
    /// Encoded image bytes.
    pub image: Vec<u8>,
    /// Distance to the scene centre; the configured default when absent.
    pub depth: Option<f64>,
    pub pose: Orientation,
    /// Capture time in seconds; the current time when absent.
    pub timestamp: Option<f64>,
}

impl FrameInput {
    pub fn new(scan_id: impl Into<String>, image: Vec<u8>) -> Self {
        Self {
            scan_id: Some(scan_id.into()),
            image,
            depth: None,
            pose: Orientation::default(),
            timestamp: None,
        }
    }

    pub fn at(mut self, timestamp: f64) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    pub fn with_pose(mut self, pose: Orientation) -> Self {
        self.pose = pose;
        self
    }

    pub fn with_depth(mut self, depth: f64) -> Self {
        self.depth = Some(depth);
        self
    }
}

/// Processing summary of one ingested frame.
#[derive(Debug, Clone, Serialize)]
pub struct FrameSummary {
    pub probe_id: String,
    pub scan_id: String,
    pub frame_number: u64,
    pub frame_path: Option<String>,
    pub detections_found: usize,
    /// Objects that received a semantic description this frame.
    pub described: usize,
    pub semantic_committed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub semantic_error: Option<String>,
    /// Observations appended to the semantic index.
    pub indexed: usize,
    pub state: StateVector,
}

/// Search results with an optional natural-language answer.
#[derive(Debug, Clone, Serialize)]
pub struct QueryResponse {
    pub query: String,
    pub answer: Option<String>,
    pub results: Vec<SearchHit>,
}

/// Availability snapshot of the engine and its collaborators.
#[derive(Debug, Clone, Serialize)]
pub struct EngineStatus {
    pub search_ready: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub search_unavailable_reason: Option<String>,
    pub indexed_observations: usize,
    pub detector: String,
    pub describer_configured: bool,
    pub answerer_configured: bool,
    pub describe_mode: DescribeMode,
    pub scans: usize,
    /// Subscribers currently receiving frame broadcasts.
    pub detection_observers: usize,
}

/// What [`FusionEngine::reset`] threw away.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ResetReport {
    pub scans: usize,
    pub observations: usize,
}

// ─────────────────────────────────────────────────────────────────────────────
// FusionEngine
// ─────────────────────────────────────────────────────────────────────────────

/// Shared state and collaborators of the pipeline.  Wrap it in an [`Arc`]
/// and open one [`ProbeSession`] per probe.
pub struct FusionEngine {
    config: EngineConfig,
    sampling: SamplingPolicy,
    identity: IdentityResolver,
    store: Arc<ScanStore>,
    index: Arc<SemanticIndex>,
    bus: EventBus,
    detector: Arc<dyn Detector>,
    describer: Option<Arc<dyn Describer>>,
    answerer: Option<Arc<dyn Answerer>>,
    /// Shared by frame commits, exclusive for [`reset`][Self::reset].
    commit_gate: RwLock<()>,
}

impl FusionEngine {
    /// Build an engine; fails when `config` does not validate.
    pub fn new(
        config: EngineConfig,
        detector: Arc<dyn Detector>,
        index: Arc<SemanticIndex>,
        bus: EventBus,
    ) -> Result<Self, SvcsError> {
        config.validate()?;
        let sampling = SamplingPolicy::new(
            config.detection_stride,
            config.description_stride,
            config.max_described_per_frame,
        )?;
        let identity = IdentityResolver::new(config.bucket_px)?;
        let store = Arc::new(ScanStore::new(config.label_ttl_secs));

        if let Some(reason) = index.unavailable_reason() {
            warn!(%reason, "semantic search unavailable; running detection-only");
        }
        info!(
            detector = detector.name(),
            detection_stride = config.detection_stride,
            description_stride = config.description_stride,
            "fusion engine ready"
        );

        Ok(Self {
            config,
            sampling,
            identity,
            store,
            index,
            bus,
            detector,
            describer: None,
            answerer: None,
            commit_gate: RwLock::new(()),
        })
    }

    pub fn with_describer(mut self, describer: Arc<dyn Describer>) -> Self {
        self.describer = Some(describer);
        self
    }

    pub fn with_answerer(mut self, answerer: Arc<dyn Answerer>) -> Self {
        self.answerer = Some(answerer);
        self
    }

    /// Open the ingestion session of `probe_id`.  Its frame counter starts
    /// at zero; the first ingested frame is frame 1.
    pub fn session(self: &Arc<Self>, probe_id: impl Into<String>) -> ProbeSession {
        let probe_id = probe_id.into();
        info!(probe = %probe_id, "probe connected");
        ProbeSession {
            engine: Arc::clone(self),
            probe_id,
            frame_count: 0,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    pub fn store(&self) -> &Arc<ScanStore> {
        &self.store
    }

    pub fn index(&self) -> &Arc<SemanticIndex> {
        &self.index
    }

    /// Compare two scans; `threshold` defaults to the configured one.
    pub fn diff(
        &self,
        before: &str,
        after: &str,
        threshold: Option<f64>,
    ) -> Result<ScanDiff, SvcsError> {
        self.store
            .diff(before, after, threshold.unwrap_or(self.config.diff_threshold))
    }

    pub fn list_scans(&self) -> Vec<ScanSummary> {
        self.store.list_scans()
    }

    /// Full snapshot of one scan.
    pub fn scan(&self, scan_id: &str) -> Result<ScanRecord, SvcsError> {
        self.store.snapshot(scan_id)
    }

    /// Semantic search, optionally restricted to one known scan.
    pub fn search(
        &self,
        query: &str,
        k: usize,
        scan: Option<&str>,
    ) -> Result<Vec<SearchHit>, SvcsError> {
        if query.trim().is_empty() {
            return Err(SvcsError::InvalidInput("query must not be empty".into()));
        }
        if let Some(id) = scan
            && !self.store.contains(id)
        {
            return Err(SvcsError::NotFound(format!("Scan '{id}' not found")));
        }
        Ok(self.index.search(query, k, scan))
    }

    /// [`search`][Self::search] plus an answer from the configured
    /// [`Answerer`].  An answerer failure leaves `answer` empty.
    pub async fn query(
        &self,
        query: &str,
        k: usize,
        scan: Option<&str>,
    ) -> Result<QueryResponse, SvcsError> {
        let results = self.search(query, k, scan)?;
        let answer = match &self.answerer {
            Some(answerer) => match answerer.answer(query, &results).await {
                Ok(a) => Some(a.answer),
                Err(e) => {
                    warn!(error = %e, "answerer failed");
                    None
                }
            },
            None => None,
        };
        Ok(QueryResponse {
            query: query.to_string(),
            answer,
            results,
        })
    }

    pub fn status(&self) -> EngineStatus {
        EngineStatus {
            search_ready: self.index.is_ready(),
            search_unavailable_reason: self.index.unavailable_reason(),
            indexed_observations: self.index.len(),
            detector: self.detector.name().to_string(),
            describer_configured: self.describer.is_some(),
            answerer_configured: self.answerer.is_some(),
            describe_mode: self.config.describe_mode,
            scans: self.store.len(),
            detection_observers: self.bus.receiver_count(Topic::Detections),
        }
    }

    /// Drop every scan and every indexed observation.
    ///
    /// Waits for frames that are mid-commit; their observations are either
    /// dropped with the rest or committed after the reset, never split.
    pub fn reset(&self) -> ResetReport {
        let _gate = self
            .commit_gate
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let report = ResetReport {
            scans: self.store.reset(),
            observations: self.index.clear(),
        };
        info!(scans = report.scans, observations = report.observations, "engine reset");
        report
    }

    /// Persist the semantic index.
    pub fn save_index(&self) -> Result<(), SvcsError> {
        self.index.save().map_err(SvcsError::from)
    }

    /// Publish to `topic`; having no observers is not an error here.
    pub fn publish(&self, topic: Topic, source: &str, payload: EventPayload) {
        if let Err(e) = self.bus.publish_to(topic, Event::new(source, payload)) {
            debug!(?topic, error = %e, "event not delivered");
        }
    }

    /// Commit one fused frame and index its observations when the semantic
    /// merge went through.  Returns the outcome and the number indexed.
    fn commit_frame(
        &self,
        scan_id: &str,
        probe_id: &str,
        frame: u64,
        commit: FrameCommit,
        metadata: Vec<(String, ObservationMeta)>,
    ) -> (FrameOutcome, usize) {
        let _gate = self
            .commit_gate
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        let outcome = self.store.record_frame(scan_id, Some(probe_id), commit);

        let mut indexed = 0;
        if outcome.semantic_committed() {
            for (text, meta) in metadata {
                match self.index.add(&text, meta) {
                    Ok(true) => indexed += 1,
                    Ok(false) => {}
                    Err(e) => warn!(scan_id = %scan_id, frame, error = %e, "indexing failed"),
                }
            }
        }
        (outcome, indexed)
    }

    fn alert(&self, component: &str, message: String) {
        self.publish(
            Topic::SystemAlerts,
            ENGINE_SOURCE,
            EventPayload::SystemAlert {
                component: component.to_string(),
                message,
            },
        );
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// ProbeSession
// ─────────────────────────────────────────────────────────────────────────────

/// Sequential ingestion loop of one probe.
pub struct ProbeSession {
    engine: Arc<FusionEngine>,
    probe_id: String,
    frame_count: u64,
}

/// Semantic output of one frame, before commit.
#[derive(Default)]
struct SemanticBatch {
    fresh: Vec<Option<FreshLabel>>,
    observations: Vec<SemanticObservation>,
    metadata: Vec<(String, ObservationMeta)>,
    described: usize,
}

impl ProbeSession {
    pub fn probe_id(&self) -> &str {
        &self.probe_id
    }

    /// Frames accepted so far (including dropped ones).
    pub fn frame_count(&self) -> u64 {
        self.frame_count
    }

    /// Scan id used when a frame names none.
    pub fn default_scan_id(&self) -> String {
        format!("scan_{}", self.probe_id)
    }

    /// Run one frame through the pipeline.
    #[instrument(skip(self, input), fields(probe = %self.probe_id))]
    pub async fn ingest(&mut self, input: FrameInput) -> Result<FrameSummary, SvcsError> {
        validate_image(&input.image)?;
        if let Some(ts) = input.timestamp
            && !ts.is_finite()
        {
            return Err(SvcsError::InvalidInput(format!("non-finite timestamp {ts}")));
        }
        if let Some(depth) = input.depth
            && (!depth.is_finite() || depth <= 0.0)
        {
            return Err(SvcsError::InvalidInput(format!("depth must be positive, got {depth}")));
        }

        self.frame_count += 1;
        let frame = self.frame_count;
        let engine = Arc::clone(&self.engine);
        let scan_id = input.scan_id.clone().unwrap_or_else(|| self.default_scan_id());
        let timestamp = input.timestamp.unwrap_or_else(now_secs);
        let decision = engine.sampling.decide(frame);

        let request = DetectRequest {
            probe_id: self.probe_id.clone(),
            scan_id: scan_id.clone(),
            frame_number: frame,
            image: input.image,
            depth: input.depth.unwrap_or(engine.config.default_depth),
            pose: pose_matrix(input.pose),
            timestamp,
        };

        // ── detect ───────────────────────────────────────────────────────────
        let (frame_path, detections) = if decision.run_detection {
            debug!(
                scan_id = %scan_id,
                frame,
                pose = %request.pose.as_pose_string(),
                "running detector"
            );
            match engine.detector.detect(&request).await {
                Ok(out) => {
                    let path = out.frame_path;
                    let detections: Vec<Detection> = out
                        .detections
                        .into_iter()
                        .map(|mut d| {
                            d.timestamp = timestamp;
                            if d.frame_path.is_empty() {
                                d.frame_path = path.clone();
                            }
                            d
                        })
                        .collect();
                    (Some(path), detections)
                }
                Err(e) => {
                    warn!(scan_id = %scan_id, frame, error = %e, "detector failed; frame dropped");
                    engine.alert(engine.detector.name(), format!("frame {frame} dropped: {e}"));
                    return Err(e.into());
                }
            }
        } else {
            match engine.detector.store_frame(&request).await {
                Ok(path) => (Some(path), Vec::new()),
                Err(e) => {
                    warn!(scan_id = %scan_id, frame, error = %e, "frame storage failed");
                    (None, Vec::new())
                }
            }
        };

        // ── describe ─────────────────────────────────────────────────────────
        let mut batch = SemanticBatch {
            fresh: vec![None; detections.len()],
            ..SemanticBatch::default()
        };
        if let Some(describer) = engine.describer.as_deref()
            && decision.should_describe(detections.len())
        {
            let ctx = ObservationContext {
                scan_id: &scan_id,
                probe_id: &self.probe_id,
                frame_path: frame_path.as_deref().unwrap_or_default(),
                timestamp,
            };
            match engine.config.describe_mode {
                DescribeMode::PerObject => {
                    let selected = engine.sampling.select_for_description(&detections);
                    let results = describe_crops(describer, &request.image, selected).await;
                    for (i, result) in results.into_iter().enumerate() {
                        if let Some(desc) = result {
                            let det = &detections[i];
                            batch.push(i, det, &desc.name, "", &desc.details, true, &ctx);
                        }
                    }
                }
                DescribeMode::WholeFrame => match describer.describe_frame(&request.image).await {
                    Ok(desc) => {
                        let objects = engine.sampling.select_for_description(&desc.objects);
                        for obj in objects {
                            let (i, matched) = anchor(&detections, obj);
                            batch.push(
                                i,
                                &detections[i],
                                &obj.name,
                                &obj.position,
                                &obj.details,
                                matched,
                                &ctx,
                            );
                        }
                    }
                    Err(e) => {
                        warn!(scan_id = %scan_id, frame, error = %e, "frame description failed")
                    }
                },
            }
        }

        // ── fuse, commit & index ─────────────────────────────────────────────
        let detections_found = detections.len();
        let fused: Vec<FusedDetection> = detections
            .into_iter()
            .zip(std::mem::take(&mut batch.fresh))
            .map(|(detection, fresh)| FusedDetection {
                key: engine.identity.key_for(&detection),
                detection,
                fresh,
            })
            .collect();
        let (outcome, indexed) = engine.commit_frame(
            &scan_id,
            &self.probe_id,
            frame,
            FrameCommit {
                timestamp,
                frame_path: frame_path.clone(),
                detections: fused,
                observations: std::mem::take(&mut batch.observations),
            },
            std::mem::take(&mut batch.metadata),
        );

        // ── broadcast ────────────────────────────────────────────────────────
        let log = format!("[{scan_id}] Frame #{frame}: {detections_found} objects detected");
        engine.publish(
            Topic::Detections,
            &self.probe_id,
            EventPayload::Detection(FrameBroadcast {
                source: self.probe_id.clone(),
                scan_id: scan_id.clone(),
                frame_number: frame,
                objects: outcome.state.clone(),
                pose: input.pose,
                timestamp,
                log,
            }),
        );
        debug!(
            scan_id = %scan_id,
            frame,
            detections_found,
            described = batch.described,
            indexed,
            "frame ingested"
        );

        Ok(FrameSummary {
            probe_id: self.probe_id.clone(),
            scan_id,
            frame_number: frame,
            frame_path,
            detections_found,
            described: batch.described,
            semantic_committed: outcome.semantic_committed(),
            semantic_error: outcome.semantic_error,
            indexed,
            state: outcome.state,
        })
    }

    /// Mark `scan_id` completed and tell observers.
    pub fn stop_scan(&self, scan_id: &str) -> Result<ScanSummary, SvcsError> {
        let summary = self.engine.store.mark_completed(scan_id)?;
        self.engine.publish(
            Topic::ScanLifecycle,
            &self.probe_id,
            EventPayload::ScanCompleted {
                scan_id: scan_id.to_string(),
                log: format!("Scan {scan_id} completed."),
            },
        );
        Ok(summary)
    }

    /// End the session and tell observers the probe left.
    pub fn disconnect(self) {
        info!(probe = %self.probe_id, frames = self.frame_count, "probe disconnected");
        self.engine.publish(
            Topic::ScanLifecycle,
            &self.probe_id,
            EventPayload::ProbeDisconnected {
                probe: self.probe_id.clone(),
            },
        );
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Semantic helpers
// ─────────────────────────────────────────────────────────────────────────────

struct ObservationContext<'a> {
    scan_id: &'a str,
    probe_id: &'a str,
    frame_path: &'a str,
    timestamp: f64,
}

impl SemanticBatch {
    /// Record one description anchored at detection `i`.  `label_detection`
    /// also makes it the detection's fresh display label.
    #[allow(clippy::too_many_arguments)]
    fn push(
        &mut self,
        i: usize,
        det: &Detection,
        name: &str,
        position: &str,
        details: &str,
        label_detection: bool,
        ctx: &ObservationContext<'_>,
    ) {
        self.described += 1;
        if label_detection {
            self.fresh[i] = Some(FreshLabel {
                name: name.to_string(),
                details: details.to_string(),
            });
        }
        self.observations.push(SemanticObservation {
            name: name.to_string(),
            position_3d: det.position_3d,
            details: details.to_string(),
            timestamp: ctx.timestamp,
            frame_path: ctx.frame_path.to_string(),
        });
        self.metadata.push((
            observation_text(name, position, details),
            ObservationMeta {
                scan_id: ctx.scan_id.to_string(),
                source: ctx.probe_id.to_string(),
                name: name.to_string(),
                frame_path: ctx.frame_path.to_string(),
                timestamp: ctx.timestamp,
                bbox: Some(det.bbox),
                tracker_id: det.tracker_id,
                confidence: det.confidence,
                position_3d: det.position_3d,
            },
        ));
    }
}

/// Describe each detection's crop concurrently; `None` where cropping or
/// the call failed.
async fn describe_crops(
    describer: &dyn Describer,
    image: &[u8],
    selected: &[Detection],
) -> Vec<Option<ObjectDescription>> {
    let calls = selected.iter().map(|det| async move {
        let crop = match crop_to_png(image, &det.bbox) {
            Ok(crop) => crop,
            Err(e) => {
                warn!(label = %det.label, error = %e, "crop failed");
                return None;
            }
        };
        match describer.describe_object(&crop, &det.label).await {
            Ok(desc) => Some(desc),
            Err(e) => {
                warn!(label = %det.label, error = %e, "object description failed");
                None
            }
        }
    });
    join_all(calls).await
}

/// Index of the detection a whole-frame object is placed at, and whether it
/// matched by label.  `detections` is non-empty whenever description runs.
fn anchor(detections: &[Detection], obj: &DescribedObject) -> (usize, bool) {
    let name = obj.name.trim();
    match detections
        .iter()
        .position(|d| d.label.eq_ignore_ascii_case(name))
    {
        Some(i) => (i, true),
        None => (0, false),
    }
}

/// Text embedded for one observation: the non-empty parts joined by spaces.
pub fn observation_text(name: &str, position: &str, details: &str) -> String {
    [name, position, details]
        .iter()
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join(" ")
}

fn now_secs() -> f64 {
    Utc::now().timestamp_millis() as f64 / 1000.0
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Mutex, mpsc};
    use std::time::Duration;

    use async_trait::async_trait;
    use svcs_memory::{Embedder, HashingEmbedder, MemoryError};
    use svcs_types::{BoundingBox, DiffEventKind, Position3D, ScanStatus};

    use crate::collaborators::{Answer, CollaboratorError, DetectorOutput, FrameDescription};
    use crate::imaging::tests::png;

    // ── mocks ────────────────────────────────────────────────────────────────

    #[derive(Default)]
    struct MockDetector {
        detections: Mutex<Vec<Detection>>,
        detect_calls: AtomicUsize,
        store_calls: AtomicUsize,
        fail: bool,
    }

    impl MockDetector {
        fn returning(detections: Vec<Detection>) -> Self {
            Self {
                detections: Mutex::new(detections),
                ..Self::default()
            }
        }

        fn set(&self, detections: Vec<Detection>) {
            *self.detections.lock().unwrap() = detections;
        }
    }

    #[async_trait]
    impl Detector for MockDetector {
        fn name(&self) -> &str {
            "mock"
        }

        async fn detect(&self, req: &DetectRequest) -> Result<DetectorOutput, CollaboratorError> {
            self.detect_calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(CollaboratorError::failed("mock", "model crashed"));
            }
            Ok(DetectorOutput {
                frame_path: format!("data/frames/{}/frame_{}.jpg", req.scan_id, req.frame_number),
                detections: self.detections.lock().unwrap().clone(),
            })
        }

        async fn store_frame(&self, req: &DetectRequest) -> Result<String, CollaboratorError> {
            self.store_calls.fetch_add(1, Ordering::SeqCst);
            Ok(format!("data/frames/{}/frame_{}.jpg", req.scan_id, req.frame_number))
        }
    }

    #[derive(Default)]
    struct MockDescriber {
        calls: AtomicUsize,
        fail: bool,
        frame: FrameDescription,
    }

    #[async_trait]
    impl Describer for MockDescriber {
        async fn describe_object(
            &self,
            crop: &[u8],
            hint_label: &str,
        ) -> Result<ObjectDescription, CollaboratorError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            assert!(image::guess_format(crop).is_ok(), "crop must be an image");
            if self.fail {
                return Err(CollaboratorError::failed("describer", "quota exceeded"));
            }
            Ok(ObjectDescription {
                name: format!("blue {hint_label}"),
                details: format!("a {hint_label} on the desk"),
            })
        }

        async fn describe_frame(
            &self,
            _image: &[u8],
        ) -> Result<FrameDescription, CollaboratorError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.frame.clone())
        }
    }

    struct EchoAnswerer;

    #[async_trait]
    impl Answerer for EchoAnswerer {
        async fn answer(
            &self,
            query: &str,
            hits: &[SearchHit],
        ) -> Result<Answer, CollaboratorError> {
            Ok(Answer {
                answer: format!("{query}: {} hits", hits.len()),
            })
        }
    }

    /// Parks inside its first `embed` until released.
    struct GatedEmbedder {
        inner: HashingEmbedder,
        gate: Mutex<Option<(mpsc::Sender<()>, mpsc::Receiver<()>)>>,
    }

    impl Embedder for GatedEmbedder {
        fn dimension(&self) -> usize {
            self.inner.dimension()
        }

        fn embed(&self, text: &str) -> Result<Vec<f32>, MemoryError> {
            let gate = self.gate.lock().unwrap().take();
            if let Some((entered, release)) = gate {
                entered.send(()).unwrap();
                release.recv().unwrap();
            }
            self.inner.embed(text)
        }

        fn name(&self) -> &str {
            "gated"
        }
    }

    fn det(label: &str, tracker: i64, x: f64) -> Detection {
        let mut d = Detection::new(
            label,
            BoundingBox::new(4.0, 4.0, 20.0, 20.0),
            Position3D::new(x, 0.0, 1.5),
        );
        d.tracker_id = tracker;
        d.confidence = 0.9;
        d
    }

    fn config() -> EngineConfig {
        EngineConfig {
            description_stride: 1,
            ..EngineConfig::default()
        }
    }

    fn engine_with(
        config: EngineConfig,
        detector: Arc<MockDetector>,
        describer: Option<Arc<MockDescriber>>,
    ) -> Arc<FusionEngine> {
        let index = Arc::new(SemanticIndex::in_memory(Some(Arc::new(HashingEmbedder::default()))));
        let mut engine = FusionEngine::new(config, detector, index, EventBus::default()).unwrap();
        if let Some(d) = describer {
            engine = engine.with_describer(d);
        }
        Arc::new(engine)
    }

    fn frame(scan: &str, t: f64) -> FrameInput {
        FrameInput::new(scan, png(32, 32)).at(t)
    }

    // ── sampling ─────────────────────────────────────────────────────────────

    #[tokio::test]
    async fn detection_stride_two_detects_odd_frames_and_stores_the_rest() {
        let detector = Arc::new(MockDetector::returning(vec![det("cup", 1, 0.0)]));
        let cfg = EngineConfig {
            detection_stride: 2,
            ..config()
        };
        let engine = engine_with(cfg, detector.clone(), None);
        let mut probe = engine.session("p1");

        let mut found = Vec::new();
        for t in 1..=5 {
            let s = probe.ingest(frame("room", t as f64)).await.unwrap();
            assert!(s.frame_path.is_some(), "frame {t} must have a path");
            found.push(s.detections_found);
        }
        assert_eq!(found, vec![1, 0, 1, 0, 1]);
        assert_eq!(detector.detect_calls.load(Ordering::SeqCst), 3);
        assert_eq!(detector.store_calls.load(Ordering::SeqCst), 2);

        let summary = &engine.list_scans()[0];
        assert_eq!(summary.frame_count, 5);
        assert_eq!(summary.last_frame, "frame_5.jpg");
    }

    #[tokio::test]
    async fn description_capped_and_labels_cached_between_rounds() {
        let detector = Arc::new(MockDetector::returning(vec![
            det("cup", 1, 0.0),
            det("book", 2, 1.0),
            det("lamp", 3, 2.0),
        ]));
        let describer = Arc::new(MockDescriber::default());
        let cfg = EngineConfig {
            description_stride: 3,
            max_described_per_frame: 2,
            ..EngineConfig::default()
        };
        let engine = engine_with(cfg, detector, Some(describer.clone()));
        let mut probe = engine.session("p1");

        let first = probe.ingest(frame("room", 1.0)).await.unwrap();
        assert_eq!(first.described, 2);
        assert_eq!(describer.calls.load(Ordering::SeqCst), 2);
        assert_eq!(first.state[&svcs_types::ObjectKey::new("cup_1")].label, "blue cup");
        assert_eq!(first.state[&svcs_types::ObjectKey::new("lamp_3")].label, "lamp");
        assert_eq!(first.indexed, 2);

        // Frame 2 is off the description stride: labels come from the cache.
        let second = probe.ingest(frame("room", 2.0)).await.unwrap();
        assert_eq!(second.described, 0);
        assert_eq!(describer.calls.load(Ordering::SeqCst), 2);
        let cup = &second.state[&svcs_types::ObjectKey::new("cup_1")];
        assert_eq!(cup.label, "blue cup");
        assert_eq!(cup.raw_label, "cup");
        assert_eq!(cup.details.as_deref(), Some("a cup on the desk"));

        let record = engine.scan("room").unwrap();
        assert_eq!(record.object_count, 2);
        assert_eq!(record.detections.len(), 6);
    }

    #[tokio::test]
    async fn cached_label_expires_after_ttl() {
        let detector = Arc::new(MockDetector::returning(vec![det("cup", 1, 0.0)]));
        let describer = Arc::new(MockDescriber::default());
        let cfg = EngineConfig {
            description_stride: 100,
            label_ttl_secs: 10.0,
            ..EngineConfig::default()
        };
        let engine = engine_with(cfg, detector, Some(describer));
        let mut probe = engine.session("p1");

        probe.ingest(frame("room", 0.0)).await.unwrap();
        let fresh = probe.ingest(frame("room", 9.0)).await.unwrap();
        assert_eq!(fresh.state[&svcs_types::ObjectKey::new("cup_1")].label, "blue cup");
        let stale = probe.ingest(frame("room", 20.0)).await.unwrap();
        assert_eq!(stale.state[&svcs_types::ObjectKey::new("cup_1")].label, "cup");
    }

    // ── failures ─────────────────────────────────────────────────────────────

    #[tokio::test]
    async fn invalid_image_rejected_before_counter_moves() {
        let detector = Arc::new(MockDetector::returning(vec![]));
        let engine = engine_with(config(), detector.clone(), None);
        let mut probe = engine.session("p1");

        let err = probe
            .ingest(FrameInput::new("room", b"not an image".to_vec()))
            .await
            .unwrap_err();
        assert!(matches!(err, SvcsError::InvalidInput(_)));
        assert_eq!(probe.frame_count(), 0);
        assert_eq!(detector.detect_calls.load(Ordering::SeqCst), 0);
        assert!(engine.list_scans().is_empty());

        let ok = probe.ingest(frame("room", 1.0)).await.unwrap();
        assert_eq!(ok.frame_number, 1);
    }

    #[tokio::test]
    async fn detector_failure_drops_frame_but_counts_it() {
        let detector = Arc::new(MockDetector {
            fail: true,
            ..MockDetector::default()
        });
        let engine = engine_with(config(), detector, None);
        let mut alerts = engine.bus().subscribe_to(Topic::SystemAlerts);
        let mut probe = engine.session("p1");

        let err = probe.ingest(frame("room", 1.0)).await.unwrap_err();
        assert!(matches!(err, SvcsError::Dependency { .. }));
        assert_eq!(probe.frame_count(), 1);
        assert!(engine.list_scans().is_empty());
        assert!(matches!(
            alerts.try_recv().unwrap().payload,
            EventPayload::SystemAlert { .. }
        ));
    }

    #[tokio::test]
    async fn describer_failure_still_commits_detections() {
        let detector = Arc::new(MockDetector::returning(vec![det("cup", 1, 0.0)]));
        let describer = Arc::new(MockDescriber {
            fail: true,
            ..MockDescriber::default()
        });
        let engine = engine_with(config(), detector, Some(describer));
        let mut probe = engine.session("p1");

        let s = probe.ingest(frame("room", 1.0)).await.unwrap();
        assert_eq!(s.described, 0);
        assert!(s.semantic_committed);
        assert_eq!(s.state[&svcs_types::ObjectKey::new("cup_1")].label, "cup");
        let record = engine.scan("room").unwrap();
        assert_eq!(record.frame_count, 1);
        assert_eq!(record.object_count, 0);
        assert!(engine.index().is_empty());
    }

    #[tokio::test]
    async fn bad_depth_rejected() {
        let engine = engine_with(config(), Arc::new(MockDetector::default()), None);
        let mut probe = engine.session("p1");
        let err = probe.ingest(frame("room", 1.0).with_depth(-1.0)).await.unwrap_err();
        assert!(matches!(err, SvcsError::InvalidInput(_)));
    }

    // ── whole-frame description ──────────────────────────────────────────────

    #[tokio::test]
    async fn whole_frame_objects_anchor_to_matching_detection() {
        let detector = Arc::new(MockDetector::returning(vec![
            det("chair", 7, 5.0),
            det("cup", 1, 0.0),
        ]));
        let describer = Arc::new(MockDescriber {
            frame: FrameDescription {
                objects: vec![
                    DescribedObject {
                        name: "Cup".into(),
                        position: "on the table".into(),
                        details: "white ceramic".into(),
                    },
                    DescribedObject {
                        name: "fern".into(),
                        position: "corner".into(),
                        details: String::new(),
                    },
                ],
            },
            ..MockDescriber::default()
        });
        let cfg = EngineConfig {
            describe_mode: DescribeMode::WholeFrame,
            ..config()
        };
        let engine = engine_with(cfg, detector, Some(describer.clone()));
        let mut probe = engine.session("p1");

        let s = probe.ingest(frame("room", 1.0)).await.unwrap();
        assert_eq!(describer.calls.load(Ordering::SeqCst), 1);
        assert_eq!(s.described, 2);
        assert_eq!(s.state[&svcs_types::ObjectKey::new("cup_1")].label, "Cup");
        assert_eq!(s.state[&svcs_types::ObjectKey::new("chair_7")].label, "chair");

        let record = engine.scan("room").unwrap();
        assert_eq!(record.objects[0].position_3d, Position3D::new(0.0, 0.0, 1.5));
        // Unmatched objects land on the first detection.
        assert_eq!(record.objects[1].name, "fern");
        assert_eq!(record.objects[1].position_3d, Position3D::new(5.0, 0.0, 1.5));

        let hits = engine.search("white ceramic cup", 1, None).unwrap();
        assert_eq!(hits[0].description, "Cup on the table white ceramic");
    }

    // ── search & query ───────────────────────────────────────────────────────

    #[tokio::test]
    async fn search_filters_by_scan_and_rejects_unknown_scan() {
        let detector = Arc::new(MockDetector::returning(vec![det("cup", 1, 0.0)]));
        let describer = Arc::new(MockDescriber::default());
        let engine = engine_with(config(), detector.clone(), Some(describer));
        let mut probe = engine.session("p1");

        probe.ingest(frame("kitchen", 1.0)).await.unwrap();
        detector.set(vec![det("laptop", 4, 0.0)]);
        probe.ingest(frame("office", 2.0)).await.unwrap();

        let hits = engine.search("blue cup", 5, Some("office")).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].metadata.scan_id, "office");
        assert_eq!(hits[0].metadata.source, "p1");
        assert_eq!(hits[0].metadata.tracker_id, 4);

        assert!(matches!(
            engine.search("cup", 5, Some("garage")),
            Err(SvcsError::NotFound(_))
        ));
        assert!(matches!(engine.search("  ", 5, None), Err(SvcsError::InvalidInput(_))));
    }

    #[tokio::test]
    async fn query_uses_answerer_when_configured() {
        let detector = Arc::new(MockDetector::returning(vec![det("cup", 1, 0.0)]));
        let describer = Arc::new(MockDescriber::default());
        let index = Arc::new(SemanticIndex::in_memory(Some(Arc::new(HashingEmbedder::default()))));
        let engine = Arc::new(
            FusionEngine::new(config(), detector, index, EventBus::default())
                .unwrap()
                .with_describer(describer)
                .with_answerer(Arc::new(EchoAnswerer)),
        );
        engine.session("p1").ingest(frame("room", 1.0)).await.unwrap();

        let response = engine.query("where is my cup", 3, None).await.unwrap();
        assert_eq!(response.results.len(), 1);
        assert_eq!(response.answer.as_deref(), Some("where is my cup: 1 hits"));
        assert!(engine.status().answerer_configured);
    }

    // ── lifecycle & observers ────────────────────────────────────────────────

    #[tokio::test]
    async fn every_frame_is_broadcast() {
        let detector = Arc::new(MockDetector::returning(vec![det("cup", 1, 0.0)]));
        let engine = engine_with(config(), detector, None);
        assert_eq!(engine.status().detection_observers, 0);
        let mut rx = engine.bus().subscribe_to(Topic::Detections);
        assert_eq!(engine.status().detection_observers, 1);
        let mut probe = engine.session("p1");

        let pose = Orientation {
            alpha: 90.0,
            beta: 0.0,
            gamma: 0.0,
        };
        probe.ingest(frame("room", 1.0).with_pose(pose)).await.unwrap();

        let event = rx.try_recv().unwrap();
        assert_eq!(event.source, "p1");
        match event.payload {
            EventPayload::Detection(b) => {
                assert_eq!(b.frame_number, 1);
                assert_eq!(b.scan_id, "room");
                assert_eq!(b.pose, pose);
                assert_eq!(b.objects.len(), 1);
                assert_eq!(b.log, "[room] Frame #1: 1 objects detected");
            }
            other => panic!("unexpected payload {other:?}"),
        }
    }

    #[tokio::test]
    async fn stop_scan_and_disconnect_notify_observers() {
        let engine = engine_with(config(), Arc::new(MockDetector::default()), None);
        let mut rx = engine.bus().subscribe_to(Topic::ScanLifecycle);
        let mut probe = engine.session("p1");

        let err = probe.stop_scan("room").unwrap_err();
        assert!(matches!(err, SvcsError::NotFound(_)));

        probe.ingest(frame("room", 1.0)).await.unwrap();
        let summary = probe.stop_scan("room").unwrap();
        assert_eq!(summary.status, ScanStatus::Completed);
        assert!(matches!(
            rx.try_recv().unwrap().payload,
            EventPayload::ScanCompleted { ref scan_id, .. } if scan_id == "room"
        ));

        probe.disconnect();
        assert!(matches!(
            rx.try_recv().unwrap().payload,
            EventPayload::ProbeDisconnected { ref probe } if probe == "p1"
        ));
    }

    #[tokio::test]
    async fn missing_scan_id_defaults_per_probe() {
        let engine = engine_with(config(), Arc::new(MockDetector::default()), None);
        let mut probe = engine.session("phone");
        let mut input = frame("unused", 1.0);
        input.scan_id = None;
        let s = probe.ingest(input).await.unwrap();
        assert_eq!(s.scan_id, "scan_phone");
    }

    #[tokio::test]
    async fn diff_between_scans_uses_configured_threshold() {
        let detector = Arc::new(MockDetector::returning(vec![det("cup", 1, 0.0)]));
        let engine = engine_with(config(), detector.clone(), None);
        let mut probe = engine.session("p1");

        probe.ingest(frame("before", 1.0)).await.unwrap();
        detector.set(vec![det("cup", 1, 1.0), det("plant", 2, 3.0)]);
        probe.ingest(frame("after", 2.0)).await.unwrap();

        let diff = engine.diff("before", "after", None).unwrap();
        let kinds: Vec<_> = diff.events.iter().map(|e| e.kind).collect();
        assert_eq!(kinds, vec![DiffEventKind::Move, DiffEventKind::Added]);
        assert!(engine.diff("before", "after", Some(5.0)).unwrap().events.len() == 1);
        assert!(matches!(
            engine.diff("before", "nowhere", None),
            Err(SvcsError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn reset_clears_scans_and_search() {
        let detector = Arc::new(MockDetector::returning(vec![det("cup", 1, 0.0)]));
        let engine = engine_with(config(), detector, Some(Arc::new(MockDescriber::default())));
        engine.session("p1").ingest(frame("room", 1.0)).await.unwrap();
        assert_eq!(engine.status().scans, 1);

        let report = engine.reset();
        assert_eq!(report, ResetReport { scans: 1, observations: 1 });
        assert!(engine.list_scans().is_empty());
        assert!(engine.search("cup", 5, None).unwrap().is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn reset_waits_for_in_flight_commit() {
        let (entered_tx, entered_rx) = mpsc::channel();
        let (release_tx, release_rx) = mpsc::channel();
        let embedder: Arc<dyn Embedder> = Arc::new(GatedEmbedder {
            inner: HashingEmbedder::default(),
            gate: Mutex::new(Some((entered_tx, release_rx))),
        });
        let index = Arc::new(SemanticIndex::in_memory(Some(embedder)));
        let detector = Arc::new(MockDetector::returning(vec![det("cup", 1, 0.0)]));
        let engine = Arc::new(
            FusionEngine::new(config(), detector, index, EventBus::default())
                .unwrap()
                .with_describer(Arc::new(MockDescriber::default())),
        );

        let ingesting = tokio::spawn({
            let engine = engine.clone();
            async move {
                let mut probe = engine.session("p1");
                probe.ingest(frame("room", 1.0)).await
            }
        });
        // The frame's scan is written and its observation is being embedded.
        tokio::task::spawn_blocking(move || entered_rx.recv())
            .await
            .unwrap()
            .unwrap();

        let resetting = std::thread::spawn({
            let engine = engine.clone();
            move || engine.reset()
        });
        std::thread::sleep(Duration::from_millis(50));
        assert!(!resetting.is_finished(), "reset must wait for the commit");
        release_tx.send(()).unwrap();

        let summary = ingesting.await.unwrap().unwrap();
        assert_eq!(summary.indexed, 1);
        assert_eq!(
            resetting.join().unwrap(),
            ResetReport {
                scans: 1,
                observations: 1
            }
        );
        assert!(engine.list_scans().is_empty());
        assert!(engine.index().is_empty());
        assert!(engine.search("cup", 5, None).unwrap().is_empty());
    }

    #[tokio::test]
    async fn saved_index_survives_restart() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("memory").join("spatial_index.db");
        let embedder: Arc<dyn Embedder> = Arc::new(HashingEmbedder::default());

        let index = Arc::new(SemanticIndex::open(&path, Some(embedder.clone())));
        let detector = Arc::new(MockDetector::returning(vec![det("cup", 1, 0.0)]));
        let engine = Arc::new(
            FusionEngine::new(config(), detector.clone(), index, EventBus::default())
                .unwrap()
                .with_describer(Arc::new(MockDescriber::default())),
        );
        engine.session("p1").ingest(frame("room", 1.0)).await.unwrap();
        engine.save_index().unwrap();

        let reopened = Arc::new(SemanticIndex::open(&path, Some(embedder)));
        let engine = FusionEngine::new(config(), detector, reopened, EventBus::default()).unwrap();
        let status = engine.status();
        assert!(status.search_ready);
        assert_eq!(status.indexed_observations, 1);
        // Scan records are not persisted, so searches run unfiltered.
        assert_eq!(engine.search("blue cup", 1, None).unwrap()[0].metadata.scan_id, "room");
    }

    #[tokio::test]
    async fn concurrent_probes_share_one_scan() {
        let detector = Arc::new(MockDetector::returning(vec![det("cup", 1, 0.0)]));
        let engine = engine_with(config(), detector, None);

        let mut tasks = Vec::new();
        for p in 0..4 {
            let engine = Arc::clone(&engine);
            tasks.push(tokio::spawn(async move {
                let mut probe = engine.session(format!("p{p}"));
                for t in 0..10 {
                    probe.ingest(frame("shared", t as f64)).await.unwrap();
                }
            }));
        }
        for t in tasks {
            t.await.unwrap();
        }
        let record = engine.scan("shared").unwrap();
        assert_eq!(record.frame_count, 40);
        assert_eq!(record.detections.len(), 40);
    }

    #[test]
    fn observation_text_skips_empty_parts() {
        assert_eq!(observation_text("mug", "", "chipped"), "mug chipped");
        assert_eq!(observation_text(" mug ", "left", ""), "mug left");
    }

    #[test]
    fn engine_rejects_invalid_config() {
        let index = Arc::new(SemanticIndex::in_memory(None));
        let cfg = EngineConfig {
            detection_stride: 0,
            ..EngineConfig::default()
        };
        let detector = Arc::new(MockDetector::default());
        let result = FusionEngine::new(cfg, detector, index, EventBus::default());
        assert!(result.is_err());
    }
}
