//! External collaborators of the fusion engine.
//!
//! The engine never runs a neural network itself.  Object detection with 3D
//! back-projection, semantic description and question answering are
//! injected behind the async traits below, so the same pipeline runs against
//! a hosted multimodal model, a local detector process, or a recorded
//! capture.
//!
//! | Trait | Called | Failure effect |
//! |---|---|---|
//! | [`Detector`] | every frame (`detect` on the detection stride, `store_frame` otherwise) | frame dropped |
//! | [`Describer`] | frames on the description stride that produced detections | no semantic contribution for that frame |
//! | [`Answerer`] | [`FusionEngine::query`][crate::engine::FusionEngine::query] | hits returned without an answer |
//!
//! Describers that talk to a JSON-mode model can constrain its output with
//! [`response_schema`] and [`SPATIAL_DESCRIBE_PROMPT`].

use async_trait::async_trait;
use schemars::{JsonSchema, schema_for};
use serde::{Deserialize, Serialize};
use svcs_memory::SearchHit;
use svcs_perception::PoseMatrix;
use svcs_types::{Detection, SvcsError};
use thiserror::Error;

/// Instruction sent alongside a whole frame to a multimodal describer.
pub const SPATIAL_DESCRIBE_PROMPT: &str = "\
List every distinct physical object visible in this image.
For each object give:
- name: a short, specific noun phrase (colour and material when visible),
- position: where it is in the frame relative to other objects,
- details: any distinguishing features (brand, state, damage, contents).
Respond with JSON only.";

// ─────────────────────────────────────────────────────────────────────────────
// Error type
// ─────────────────────────────────────────────────────────────────────────────

/// Errors reported by collaborator implementations.
#[derive(Error, Debug)]
pub enum CollaboratorError {
    /// The collaborator is not configured or cannot be reached.
    #[error("{0} unavailable")]
    Unavailable(String),
    /// The call was made but failed.
    #[error("{component} failed: {details}")]
    Failed { component: String, details: String },
    /// The collaborator answered with something that could not be used.
    #[error("Unexpected response: {0}")]
    BadResponse(String),
}

impl CollaboratorError {
    pub fn failed(component: impl Into<String>, details: impl ToString) -> Self {
        Self::Failed {
            component: component.into(),
            details: details.to_string(),
        }
    }
}

impl From<CollaboratorError> for SvcsError {
    fn from(err: CollaboratorError) -> Self {
        match err {
            CollaboratorError::Unavailable(component) => SvcsError::Dependency {
                details: format!("{component} unavailable"),
                component,
            },
            CollaboratorError::Failed { component, details } => {
                SvcsError::Dependency { component, details }
            }
            CollaboratorError::BadResponse(details) => SvcsError::Dependency {
                component: "collaborator".to_string(),
                details,
            },
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Detector
// ─────────────────────────────────────────────────────────────────────────────

/// Everything a detector needs to locate objects in one frame.
#[derive(Debug, Clone)]
pub struct DetectRequest {
    pub probe_id: String,
    pub scan_id: String,
    pub frame_number: u64,
    /// Encoded image bytes (JPEG, PNG, …).
    pub image: Vec<u8>,
    /// Assumed distance to the scene centre, used for back-projection.
    pub depth: f64,
    pub pose: PoseMatrix,
    pub timestamp: f64,
}

/// Result of [`Detector::detect`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DetectorOutput {
    /// Where the detector stored the frame image.
    pub frame_path: String,
    #[serde(default)]
    pub detections: Vec<Detection>,
}

#[async_trait]
pub trait Detector: Send + Sync {
    /// Short name for logs and status output.
    fn name(&self) -> &str;

    /// Store the frame, locate objects and back-project them to 3D.
    async fn detect(&self, request: &DetectRequest) -> Result<DetectorOutput, CollaboratorError>;

    /// Store the frame only and return its path.  Used on frames skipped by
    /// the detection stride.
    async fn store_frame(&self, request: &DetectRequest) -> Result<String, CollaboratorError>;
}

// ─────────────────────────────────────────────────────────────────────────────
// Describer
// ─────────────────────────────────────────────────────────────────────────────

/// Semantic description of one cropped object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ObjectDescription {
    pub name: String,
    #[serde(default)]
    pub details: String,
}

/// One object of a whole-frame description.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct DescribedObject {
    pub name: String,
    /// Free-text location within the frame.
    #[serde(default)]
    pub position: String,
    #[serde(default)]
    pub details: String,
}

/// Semantic description of a whole frame.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct FrameDescription {
    #[serde(default)]
    pub objects: Vec<DescribedObject>,
}

#[async_trait]
pub trait Describer: Send + Sync {
    /// Describe one object crop; `hint_label` is the detector's class label.
    async fn describe_object(
        &self,
        crop: &[u8],
        hint_label: &str,
    ) -> Result<ObjectDescription, CollaboratorError>;

    /// Describe every object visible in a full frame.
    async fn describe_frame(&self, image: &[u8]) -> Result<FrameDescription, CollaboratorError>;
}

// ─────────────────────────────────────────────────────────────────────────────
// Answerer
// ─────────────────────────────────────────────────────────────────────────────

/// Natural-language answer to a spatial question.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct Answer {
    pub answer: String,
}

#[async_trait]
pub trait Answerer: Send + Sync {
    /// Answer `query` from the retrieved `hits` (best first).
    async fn answer(&self, query: &str, hits: &[SearchHit]) -> Result<Answer, CollaboratorError>;
}

/// JSON Schema of `T`, for JSON-mode model requests.
pub fn response_schema<T: JsonSchema>() -> Result<serde_json::Value, serde_json::Error> {
    serde_json::to_value(schema_for!(T))
}
