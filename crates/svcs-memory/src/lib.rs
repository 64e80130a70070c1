//! `svcs-memory` – scan state and recall.
//!
//! Everything the engine remembers about a space lives here: per-scan
//! aggregates with their label caches, the diff between two scans, and the
//! semantic index that answers free-text questions about what was seen.
//!
//! # Modules
//!
//! - [`label_cache`] – [`LabelCache`][label_cache::LabelCache]: latest
//!   semantic label per object key, served back while it is younger than the
//!   TTL.
//! - [`scan_store`] – [`ScanStore`][scan_store::ScanStore]: lazily created
//!   scan records, mutated under a per-scan lock.
//! - [`diff`] – latest-position comparison of two scans into MOVE / ADDED /
//!   REMOVED events.
//! - [`embedding`] – the [`Embedder`][embedding::Embedder] seam and a local
//!   feature-hashing implementation.
//! - [`semantic_index`] – [`SemanticIndex`][semantic_index::SemanticIndex]:
//!   append-only inner-product index over normalised embeddings with a
//!   metadata sidecar and scan-filtered search.

pub mod diff;
pub mod embedding;
pub mod error;
pub mod label_cache;
pub mod scan_store;
pub mod semantic_index;

pub use diff::{DEFAULT_DIFF_THRESHOLD, ScanDiff, diff_scans};
pub use embedding::{EMBEDDING_DIM, Embedder, HashingEmbedder};
pub use error::MemoryError;
pub use label_cache::{LabelCache, LabelOrigin};
pub use scan_store::{FrameCommit, FrameOutcome, FreshLabel, FusedDetection, ScanRecord, ScanStore};
pub use semantic_index::{ObservationMeta, SearchHit, SemanticIndex};
