//! Text embedders.
//!
//! The semantic index only needs two things from an embedding model: a fixed
//! output dimension and a way to turn text into a vector of that size.  The
//! [`Embedder`] trait captures exactly that, so a hosted model can be plugged
//! in by the embedding application.
//!
//! [`HashingEmbedder`] is the local default.  It is a feature-hashing model:
//! every lower-cased alphanumeric token (weight 1.0) and every adjacent token
//! pair (weight 0.5) is hashed with FNV-1a 64 into one of [`EMBEDDING_DIM`]
//! buckets, with the top hash bit choosing the sign.  Texts sharing words
//! therefore land close together under inner product, which is all the
//! engine's search needs.
//!
//! # Example
//!
//! ```rust
//! use svcs_memory::embedding::{Embedder, HashingEmbedder, cosine_similarity};
//!
//! let e = HashingEmbedder::default();
//! let a = e.embed("red mug on the desk").unwrap();
//! let b = e.embed("a red mug").unwrap();
//! let c = e.embed("bicycle helmet").unwrap();
//! assert_eq!(a.len(), 384);
//! assert!(cosine_similarity(&a, &b) > cosine_similarity(&a, &c));
//! ```

use crate::error::MemoryError;

/// Dimension of every vector stored in the semantic index.
pub const EMBEDDING_DIM: usize = 384;

const BIGRAM_WEIGHT: f32 = 0.5;

/// Text → dense vector.
pub trait Embedder: Send + Sync {
    /// Length of every vector returned by [`embed`][Embedder::embed].
    fn dimension(&self) -> usize;

    /// Embed `text`.  The result need not be normalised.
    fn embed(&self, text: &str) -> Result<Vec<f32>, MemoryError>;

    /// Short name for logs and status output.
    fn name(&self) -> &str;
}

// ─────────────────────────────────────────────────────────────────────────────
// HashingEmbedder
// ─────────────────────────────────────────────────────────────────────────────

/// Deterministic local feature-hashing embedder.
#[derive(Debug, Clone, Copy)]
pub struct HashingEmbedder {
    dim: usize,
}

impl HashingEmbedder {
    /// Embedder with `dim` buckets (clamped to at least 1).
    pub fn new(dim: usize) -> Self {
        Self { dim: dim.max(1) }
    }
}

impl Default for HashingEmbedder {
    fn default() -> Self {
        Self::new(EMBEDDING_DIM)
    }
}

impl Embedder for HashingEmbedder {
    fn dimension(&self) -> usize {
        self.dim
    }

    fn embed(&self, text: &str) -> Result<Vec<f32>, MemoryError> {
        let tokens = tokenize(text);
        let mut v = vec![0.0f32; self.dim];
        for token in &tokens {
            self.accumulate(&mut v, token.as_bytes(), 1.0);
        }
        for pair in tokens.windows(2) {
            let joined = format!("{} {}", pair[0], pair[1]);
            self.accumulate(&mut v, joined.as_bytes(), BIGRAM_WEIGHT);
        }
        Ok(v)
    }

    fn name(&self) -> &str {
        "hashing"
    }
}

impl HashingEmbedder {
    fn accumulate(&self, v: &mut [f32], feature: &[u8], weight: f32) {
        let h = fnv1a64(feature);
        let bucket = (h % self.dim as u64) as usize;
        let sign = if h >> 63 == 0 { 1.0 } else { -1.0 };
        v[bucket] += sign * weight;
    }
}

fn tokenize(text: &str) -> Vec<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(str::to_lowercase)
        .collect()
}

fn fnv1a64(bytes: &[u8]) -> u64 {
    const OFFSET: u64 = 0xcbf29ce484222325;
    const PRIME: u64 = 0x100000001b3;
    let mut h = OFFSET;
    for &b in bytes {
        h ^= b as u64;
        h = h.wrapping_mul(PRIME);
    }
    h
}

// ─────────────────────────────────────────────────────────────────────────────
// Vector helpers
// ─────────────────────────────────────────────────────────────────────────────

/// Scale `v` to unit length in place.  A zero vector is left unchanged.
pub fn l2_normalize(v: &mut [f32]) {
    let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        for x in v.iter_mut() {
            *x /= norm;
        }
    }
}

/// Inner product of two equal-length vectors.
pub fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

/// Cosine similarity in `[-1.0, 1.0]`, or `0.0` if either vector has zero
/// norm.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        0.0
    } else {
        dot(a, b) / (norm_a * norm_b)
    }
}
