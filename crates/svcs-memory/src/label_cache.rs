//! Label Fusion Cache.
//!
//! Semantic descriptions arrive far less often than detections: the
//! describer only runs on some frames and only for a capped number of
//! objects.  Without a cache, an object described on frame 1 would flicker
//! back to its raw detector label on frames 2, 3, …  This module keeps, per
//! scan, the most recent semantic label for every [`ObjectKey`] and serves it
//! back while it is fresh.
//!
//! ## Policy
//!
//! * **Write** – a fresh semantic result for a key unconditionally replaces
//!   the cached entry (last writer wins, conflicting descriptions are never
//!   merged).  `updated_at` is the timestamp of the frame that produced it.
//! * **Read** – for a detection without a fresh result this round:
//!   - entry present and `now − updated_at ≤ ttl` → cached name/details;
//!   - entry present but older → the entry is evicted, and the detection's
//!     own semantic fields are used, else the raw detector label;
//!   - no entry → same fallback.
//!
//! Eviction is lazy: nothing is removed until the first stale read.
//!
//! # Example
//!
//! ```rust
//! use svcs_memory::label_cache::{LabelCache, LabelOrigin};
//! use svcs_types::{BoundingBox, Detection, ObjectKey, Position3D};
//!
//! let mut cache = LabelCache::new(10.0);
//! let key = ObjectKey::new("cup_3");
//! cache.put(key.clone(), "blue mug", "chipped handle", 100.0);
//!
//! let det = Detection::new("cup", BoundingBox::default(), Position3D::default());
//! let view = cache.resolve(&key, &det, 105.0);
//! assert_eq!(view.name, "blue mug");
//! assert_eq!(view.origin, LabelOrigin::Cached);
//!
//! // Past the TTL the raw detector label comes back and the entry is gone.
//! let view = cache.resolve(&key, &det, 111.0);
//! assert_eq!(view.name, "cup");
//! assert!(!cache.contains(&key));
//! ```

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use svcs_types::{Detection, ObjectKey};

// ─────────────────────────────────────────────────────────────────────────────
// CachedLabel
// ─────────────────────────────────────────────────────────────────────────────

/// The latest semantic label seen for one object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CachedLabel {
    pub name: String,
    pub details: String,
    /// Timestamp (seconds) of the frame that produced the label.
    pub updated_at: f64,
}

/// Where a resolved display label came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LabelOrigin {
    /// Described on this very frame.
    Fresh,
    /// Served from the cache within its TTL.
    Cached,
    /// The detection's own semantic fields.
    Detection,
    /// The raw detector class label.
    Detector,
}

/// Display view of one detection.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedLabel {
    pub name: String,
    pub details: Option<String>,
    pub origin: LabelOrigin,
}

// ─────────────────────────────────────────────────────────────────────────────
// LabelCache
// ─────────────────────────────────────────────────────────────────────────────

/// Per-scan mapping of [`ObjectKey`] → most recent [`CachedLabel`].
#[derive(Debug, Clone, Serialize)]
pub struct LabelCache {
    /// Maximum age (seconds) of a label before it is considered stale.
    ttl: f64,
    entries: HashMap<ObjectKey, CachedLabel>,
}

impl LabelCache {
    /// Create an empty cache with the given TTL in seconds.
    ///
    /// Negative TTLs are clamped to zero (labels are then only served on
    /// the frame that produced them).
    pub fn new(ttl: f64) -> Self {
        Self {
            ttl: ttl.max(0.0),
            entries: HashMap::new(),
        }
    }

    pub fn ttl(&self) -> f64 {
        self.ttl
    }

    /// Insert or overwrite the label for `key`.
    pub fn put(
        &mut self,
        key: ObjectKey,
        name: impl Into<String>,
        details: impl Into<String>,
        updated_at: f64,
    ) {
        self.entries.insert(
            key,
            CachedLabel {
                name: name.into(),
                details: details.into(),
                updated_at,
            },
        );
    }

    /// Return the entry for `key` if it is still fresh at `now`, evicting it
    /// when it has expired.
    pub fn lookup(&mut self, key: &ObjectKey, now: f64) -> Option<&CachedLabel> {
        let fresh = match self.entries.get(key) {
            Some(entry) => now - entry.updated_at <= self.ttl,
            None => return None,
        };
        if fresh {
            self.entries.get(key)
        } else {
            self.entries.remove(key);
            None
        }
    }

    /// Resolve the display label of a detection that did not receive a fresh
    /// semantic result this round.
    pub fn resolve(&mut self, key: &ObjectKey, detection: &Detection, now: f64) -> ResolvedLabel {
        if let Some(entry) = self.lookup(key, now) {
            return ResolvedLabel {
                name: entry.name.clone(),
                details: Some(entry.details.clone()),
                origin: LabelOrigin::Cached,
            };
        }
        match &detection.semantic_name {
            Some(name) => ResolvedLabel {
                name: name.clone(),
                details: detection.semantic_details.clone(),
                origin: LabelOrigin::Detection,
            },
            None => ResolvedLabel {
                name: detection.label.clone(),
                details: None,
                origin: LabelOrigin::Detector,
            },
        }
    }

    /// Peek at an entry without applying the TTL.
    pub fn get(&self, key: &ObjectKey) -> Option<&CachedLabel> {
        self.entries.get(key)
    }

    pub fn contains(&self, key: &ObjectKey) -> bool {
        self.entries.contains_key(key)
    }

    /// Number of entries currently held (fresh or not yet evicted).
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
