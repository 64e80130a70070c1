//! Semantic Memory Index.
//!
//! An append-only vector index over the semantic observations of every scan.
//! Each entry is a unit-length embedding of the observation text plus the
//! metadata needed to answer "where did I see X, and in which scan?".
//!
//! # Layout
//!
//! Vectors and metadata live in two positionally aligned lists: entry `i`
//! of one always describes entry `i` of the other.  Both are behind one
//! `RwLock`; appends take the write lock, searches share the read lock, and
//! embedding happens before either lock is taken.
//!
//! # Persistence
//!
//! | file | contents |
//! |---|---|
//! | `<stem>.<ext>` (e.g. `spatial_index.db`) | SQLite database: `index_meta(key, value)` holding the dimension, `vectors(position, embedding)` with little-endian f32 BLOBs |
//! | `<stem>.json` | JSON array of [`IndexedObservation`], same order |
//!
//! At startup both files present → load; either absent → start empty.  A
//! pair that fails to load (corrupt database, unreadable JSON, length or
//! dimension mismatch) leaves the index **unavailable**: `add` is a logged
//! no-op, `search` returns nothing, and `save` refuses to overwrite the
//! files on disk.
//!
//! `save` writes each file to a `.tmp` sibling first and renames it into
//! place, so an interrupted save leaves the previous files intact.
//!
//! # Example
//!
//! ```rust
//! use std::sync::Arc;
//! use svcs_memory::embedding::HashingEmbedder;
//! use svcs_memory::semantic_index::{ObservationMeta, SemanticIndex};
//!
//! let index = SemanticIndex::in_memory(Some(Arc::new(HashingEmbedder::default())));
//! index.add("blue mug on the desk", ObservationMeta::for_scan("kitchen")).unwrap();
//! index.add("office chair by the window", ObservationMeta::for_scan("office")).unwrap();
//!
//! let hits = index.search("mug", 5, None);
//! assert_eq!(hits[0].description, "blue mug on the desk");
//!
//! let hits = index.search("mug", 5, Some("office"));
//! assert!(hits.iter().all(|h| h.metadata.scan_id == "office"));
//! ```

use std::path::{Path, PathBuf};
use std::sync::{Arc, Once, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::{DateTime, Utc};
use rusqlite::{Connection, params};
use serde::{Deserialize, Serialize};
use svcs_types::{BoundingBox, NO_TRACKER, Position3D};
use tracing::{info, warn};
use uuid::Uuid;

use crate::embedding::{Embedder, dot, l2_normalize};
use crate::error::MemoryError;

/// Candidate multiplier applied when a scan filter is given.
const FILTER_OVERFETCH: usize = 10;

// ─────────────────────────────────────────────────────────────────────────────
// Metadata
// ─────────────────────────────────────────────────────────────────────────────

/// Caller-supplied context of one indexed observation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObservationMeta {
    pub scan_id: String,
    /// Probe that produced the frame.
    #[serde(default)]
    pub source: String,
    /// Semantic name of the object.
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub frame_path: String,
    #[serde(default)]
    pub timestamp: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bbox: Option<BoundingBox>,
    #[serde(default = "no_tracker")]
    pub tracker_id: i64,
    #[serde(default)]
    pub confidence: f64,
    #[serde(default)]
    pub position_3d: Position3D,
}

fn no_tracker() -> i64 {
    NO_TRACKER
}

impl ObservationMeta {
    /// Metadata carrying only a scan id.
    pub fn for_scan(scan_id: impl Into<String>) -> Self {
        Self {
            scan_id: scan_id.into(),
            source: String::new(),
            name: String::new(),
            frame_path: String::new(),
            timestamp: 0.0,
            bbox: None,
            tracker_id: NO_TRACKER,
            confidence: 0.0,
            position_3d: Position3D::default(),
        }
    }
}

/// One metadata record as stored in the sidecar.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexedObservation {
    pub id: Uuid,
    pub indexed_at: DateTime<Utc>,
    /// The text that was embedded.
    pub description: String,
    #[serde(flatten)]
    pub meta: ObservationMeta,
}

/// A search result.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SearchHit {
    /// Inner product of the unit query and entry vectors.
    pub score: f32,
    pub description: String,
    pub metadata: ObservationMeta,
}

// ─────────────────────────────────────────────────────────────────────────────
// SemanticIndex
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
enum Backend {
    Ready,
    Unavailable(String),
}

#[derive(Debug)]
struct IndexState {
    backend: Backend,
    vectors: Vec<Vec<f32>>,
    metadata: Vec<IndexedObservation>,
}

impl IndexState {
    fn empty(backend: Backend) -> Self {
        Self {
            backend,
            vectors: Vec::new(),
            metadata: Vec::new(),
        }
    }
}

/// Flat inner-product index with scan-filtered search.
pub struct SemanticIndex {
    embedder: Option<Arc<dyn Embedder>>,
    path: Option<PathBuf>,
    state: RwLock<IndexState>,
    missing_embedder: Once,
}

impl std::fmt::Debug for SemanticIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SemanticIndex")
            .field("embedder", &self.embedder.as_ref().map(|e| e.name().to_string()))
            .field("path", &self.path)
            .field("len", &self.len())
            .finish()
    }
}

impl SemanticIndex {
    /// Index backed by the file pair at `path` (vectors) and its `.json`
    /// sidecar, loading any previously saved entries.
    ///
    /// `embedder == None` yields an index that is never ready.
    pub fn open(path: impl AsRef<Path>, embedder: Option<Arc<dyn Embedder>>) -> Self {
        let path = path.as_ref().to_path_buf();
        let state = match embedder.as_deref() {
            Some(e) => load_state(&path, e.dimension()),
            None => IndexState::empty(Backend::Ready),
        };
        if let Backend::Unavailable(reason) = &state.backend {
            warn!(path = %path.display(), %reason, "semantic index unavailable");
        } else {
            info!(path = %path.display(), entries = state.vectors.len(), "semantic index opened");
        }
        Self {
            embedder,
            path: Some(path),
            state: RwLock::new(state),
            missing_embedder: Once::new(),
        }
    }

    /// Index that lives only in memory; [`save`][Self::save] is a no-op.
    pub fn in_memory(embedder: Option<Arc<dyn Embedder>>) -> Self {
        Self {
            embedder,
            path: None,
            state: RwLock::new(IndexState::empty(Backend::Ready)),
            missing_embedder: Once::new(),
        }
    }

    /// Both an embedder and a loaded backend are present.
    pub fn is_ready(&self) -> bool {
        self.embedder.is_some() && self.read().backend == Backend::Ready
    }

    /// Why the index is not ready, if it is not.
    pub fn unavailable_reason(&self) -> Option<String> {
        if self.embedder.is_none() {
            return Some("no embedder configured".to_string());
        }
        match &self.read().backend {
            Backend::Ready => None,
            Backend::Unavailable(reason) => Some(reason.clone()),
        }
    }

    pub fn embedder_name(&self) -> Option<&str> {
        self.embedder.as_deref().map(|e| e.name())
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn len(&self) -> usize {
        self.read().vectors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Embed `text` and append it with `meta`.
    ///
    /// Returns `Ok(false)` without touching the index when it is not ready.
    pub fn add(&self, text: &str, meta: ObservationMeta) -> Result<bool, MemoryError> {
        let Some(embedder) = self.embedder.as_deref() else {
            self.missing_embedder.call_once(|| {
                warn!("semantic index has no embedder; observations are not indexed");
            });
            return Ok(false);
        };
        if let Backend::Unavailable(reason) = &self.read().backend {
            warn!(
                %reason,
                scan_id = %meta.scan_id,
                "semantic index unavailable, observation not indexed"
            );
            return Ok(false);
        }

        let vector = normalized(embedder, text)?;
        let entry = IndexedObservation {
            id: Uuid::new_v4(),
            indexed_at: Utc::now(),
            description: text.to_string(),
            meta,
        };

        let mut state = self.write();
        if state.backend != Backend::Ready {
            return Ok(false);
        }
        state.vectors.push(vector);
        state.metadata.push(entry);
        Ok(true)
    }

    /// The `k` entries most similar to `query`, best first, optionally
    /// restricted to one scan.
    ///
    /// With a scan filter the top `k × 10` candidates are taken before
    /// filtering, so a scan whose entries all rank below that window yields
    /// fewer than `k` hits.  Returns an empty list when the index is not
    /// ready or the query cannot be embedded.
    pub fn search(&self, query: &str, k: usize, scan: Option<&str>) -> Vec<SearchHit> {
        let Some(embedder) = self.embedder.as_deref() else {
            return Vec::new();
        };
        if k == 0 {
            return Vec::new();
        }
        let q = match normalized(embedder, query) {
            Ok(q) => q,
            Err(e) => {
                warn!(error = %e, "query embedding failed");
                return Vec::new();
            }
        };

        let state = self.read();
        if state.backend != Backend::Ready {
            return Vec::new();
        }

        let mut scored: Vec<(usize, f32)> = state
            .vectors
            .iter()
            .enumerate()
            .map(|(i, v)| (i, dot(v, &q)))
            .collect();
        scored.sort_by(|a, b| b.1.total_cmp(&a.1).then(a.0.cmp(&b.0)));

        let fetch = match scan {
            Some(_) => k.saturating_mul(FILTER_OVERFETCH),
            None => k,
        };
        scored
            .into_iter()
            .take(fetch)
            .filter_map(|(i, score)| {
                let entry = &state.metadata[i];
                match scan {
                    Some(id) if entry.meta.scan_id != id => None,
                    _ => Some(SearchHit {
                        score,
                        description: entry.description.clone(),
                        metadata: entry.meta.clone(),
                    }),
                }
            })
            .take(k)
            .collect()
    }

    /// Drop every entry and mark the backend ready again.
    pub fn clear(&self) -> usize {
        let mut state = self.write();
        let dropped = state.vectors.len();
        *state = IndexState::empty(Backend::Ready);
        info!(dropped, "semantic index cleared");
        dropped
    }

    /// Write the vector file and its JSON sidecar.
    ///
    /// No-op for in-memory indexes.  Refuses with
    /// [`MemoryError::Unavailable`] when the persisted pair failed to load.
    pub fn save(&self) -> Result<(), MemoryError> {
        let Some(path) = self.path.as_deref() else {
            return Ok(());
        };
        let Some(embedder) = self.embedder.as_deref() else {
            return Ok(());
        };
        let state = self.read();
        if let Backend::Unavailable(reason) = &state.backend {
            return Err(MemoryError::Unavailable(reason.clone()));
        }
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }
        let sidecar = sidecar_path(path);
        let staged = [staging_path(path), staging_path(&sidecar)];
        let written = stage_pair(&staged, embedder.dimension(), &state)
            .and_then(|()| std::fs::rename(&staged[0], path).map_err(MemoryError::from))
            .and_then(|()| std::fs::rename(&staged[1], &sidecar).map_err(MemoryError::from));
        if let Err(e) = written {
            for tmp in &staged {
                let _ = std::fs::remove_file(tmp);
            }
            return Err(e);
        }
        info!(path = %path.display(), entries = state.vectors.len(), "semantic index saved");
        Ok(())
    }

    fn read(&self) -> RwLockReadGuard<'_, IndexState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, IndexState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }
}

/// `<stem>.json` next to the vector file.
pub fn sidecar_path(path: &Path) -> PathBuf {
    path.with_extension("json")
}

/// `<name>.tmp` next to `path`.
fn staging_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".tmp");
    path.with_file_name(name)
}

/// Write the vector file and sidecar to their staging paths.
fn stage_pair(staged: &[PathBuf; 2], dim: usize, state: &IndexState) -> Result<(), MemoryError> {
    for tmp in staged {
        match std::fs::remove_file(tmp) {
            Err(e) if e.kind() != std::io::ErrorKind::NotFound => return Err(e.into()),
            _ => {}
        }
    }
    write_vectors(&staged[0], dim, &state.vectors)?;
    std::fs::write(&staged[1], serde_json::to_string_pretty(&state.metadata)?)?;
    Ok(())
}

fn normalized(embedder: &dyn Embedder, text: &str) -> Result<Vec<f32>, MemoryError> {
    let mut v = embedder.embed(text)?;
    if v.len() != embedder.dimension() {
        return Err(MemoryError::DimensionMismatch {
            expected: embedder.dimension(),
            actual: v.len(),
        });
    }
    l2_normalize(&mut v);
    Ok(v)
}

// ─────────────────────────────────────────────────────────────────────────────
// Vector file
// ─────────────────────────────────────────────────────────────────────────────

fn embedding_to_bytes(embedding: &[f32]) -> Vec<u8> {
    embedding.iter().flat_map(|f| f.to_le_bytes()).collect()
}

fn bytes_to_embedding(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect()
}

fn write_vectors(path: &Path, dim: usize, vectors: &[Vec<f32>]) -> Result<(), MemoryError> {
    let mut conn = Connection::open(path)?;
    let tx = conn.transaction()?;
    tx.execute_batch(
        "CREATE TABLE IF NOT EXISTS index_meta (
            key   TEXT NOT NULL PRIMARY KEY,
            value TEXT NOT NULL
        );
        CREATE TABLE IF NOT EXISTS vectors (
            position  INTEGER NOT NULL PRIMARY KEY,
            embedding BLOB NOT NULL
        );
        DELETE FROM vectors;",
    )?;
    tx.execute(
        "INSERT OR REPLACE INTO index_meta (key, value) VALUES ('dimension', ?1)",
        params![dim.to_string()],
    )?;
    {
        let mut stmt = tx.prepare("INSERT INTO vectors (position, embedding) VALUES (?1, ?2)")?;
        for (position, v) in vectors.iter().enumerate() {
            stmt.execute(params![position as i64, embedding_to_bytes(v)])?;
        }
    }
    tx.commit()?;
    Ok(())
}

fn read_vectors(path: &Path) -> Result<(usize, Vec<Vec<f32>>), MemoryError> {
    let conn = Connection::open(path)?;
    let dim: String = conn.query_row(
        "SELECT value FROM index_meta WHERE key = 'dimension'",
        [],
        |row| row.get(0),
    )?;
    let dim: usize = dim
        .parse()
        .map_err(|_| MemoryError::Unavailable(format!("invalid stored dimension '{dim}'")))?;

    let mut stmt = conn.prepare("SELECT embedding FROM vectors ORDER BY position ASC")?;
    let rows = stmt.query_map([], |row| row.get::<_, Vec<u8>>(0))?;
    let mut vectors = Vec::new();
    for blob in rows {
        let v = bytes_to_embedding(&blob?);
        if v.len() != dim {
            return Err(MemoryError::DimensionMismatch {
                expected: dim,
                actual: v.len(),
            });
        }
        vectors.push(v);
    }
    Ok((dim, vectors))
}

fn load_state(path: &Path, dim: usize) -> IndexState {
    let sidecar = sidecar_path(path);
    if !path.exists() || !sidecar.exists() {
        return IndexState::empty(Backend::Ready);
    }
    match load_pair(path, &sidecar, dim) {
        Ok((vectors, metadata)) => IndexState {
            backend: Backend::Ready,
            vectors,
            metadata,
        },
        Err(e) => IndexState::empty(Backend::Unavailable(e.to_string())),
    }
}

fn load_pair(
    path: &Path,
    sidecar: &Path,
    dim: usize,
) -> Result<(Vec<Vec<f32>>, Vec<IndexedObservation>), MemoryError> {
    let (stored_dim, vectors) = read_vectors(path)?;
    if stored_dim != dim {
        return Err(MemoryError::DimensionMismatch {
            expected: dim,
            actual: stored_dim,
        });
    }
    let metadata: Vec<IndexedObservation> =
        serde_json::from_str(&std::fs::read_to_string(sidecar)?)?;
    if metadata.len() != vectors.len() {
        return Err(MemoryError::Unavailable(format!(
            "{} vectors but {} metadata records",
            vectors.len(),
            metadata.len()
        )));
    }
    Ok((vectors, metadata))
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
