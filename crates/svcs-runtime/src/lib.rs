//! `svcs-runtime` – The Fusion Engine
//!
//! Drives every probe frame through detection, description, identity
//! resolution and commit, and answers the read side (listing, diff, search,
//! question answering) over the fused state.
//!
//! # Modules
//!
//! - [`engine`] – [`FusionEngine`][engine::FusionEngine] and its per-probe
//!   [`ProbeSession`][engine::ProbeSession]: the ordered frame pipeline,
//!   scan lifecycle events and the query surface.
//! - [`collaborators`] – the [`Detector`][collaborators::Detector],
//!   [`Describer`][collaborators::Describer] and
//!   [`Answerer`][collaborators::Answerer] traits the engine is wired to,
//!   plus JSON Schemas for model-backed implementations.
//! - [`config`] – [`EngineConfig`][config::EngineConfig]: strides, label
//!   TTL, identity bucket size and diff threshold.
//! - [`imaging`] – payload validation and object cropping.
//! - [`telemetry`] – [`init_tracing`][telemetry::init_tracing]:
//!   initialises the global `tracing` subscriber with an optional OTLP span
//!   exporter.  Set `OTEL_EXPORTER_OTLP_ENDPOINT` to export spans.

pub mod collaborators;
pub mod config;
pub mod engine;
pub mod imaging;
pub mod telemetry;

pub use collaborators::{
    Answer, Answerer, CollaboratorError, DescribedObject, Describer, DetectRequest, Detector,
    DetectorOutput, FrameDescription, ObjectDescription, SPATIAL_DESCRIBE_PROMPT, response_schema,
};
pub use config::{DescribeMode, EngineConfig};
pub use engine::{
    EngineStatus, FrameInput, FrameSummary, FusionEngine, ProbeSession, QueryResponse, ResetReport,
};
pub use telemetry::{TracerProviderGuard, init_tracing};
