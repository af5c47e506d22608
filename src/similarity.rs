//! Cosine similarity and pairwise edge planning.
//!
//! Similarity is clamped to `[0, 1]`: negative cosines are floored to zero.
//! Degenerate vectors (empty, zero norm, non-finite components, mismatched
//! dimensions) are rejected with `GraphError::Computation` so NaN never
//! reaches a threshold comparison.

use rayon::prelude::*;

use crate::error::{GraphError, Result};

/// Compute the clamped cosine similarity of two embeddings.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> Result<f32> {
    if a.is_empty() || b.is_empty() {
        return Err(GraphError::Computation("empty embedding vector".to_string()));
    }
    if a.len() != b.len() {
        return Err(GraphError::Computation(format!(
            "dimension mismatch: {} vs {}",
            a.len(),
            b.len()
        )));
    }

    // Accumulate in f64; 512-d CLIP vectors lose precision in f32 sums.
    let mut dot = 0.0f64;
    let mut norm_a = 0.0f64;
    let mut norm_b = 0.0f64;
    for (&x, &y) in a.iter().zip(b.iter()) {
        let (x, y) = (x as f64, y as f64);
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    if !dot.is_finite() || !norm_a.is_finite() || !norm_b.is_finite() {
        return Err(GraphError::Computation("non-finite embedding component".to_string()));
    }
    if norm_a == 0.0 || norm_b == 0.0 {
        return Err(GraphError::Computation("zero-norm embedding vector".to_string()));
    }

    let similarity = dot / (norm_a.sqrt() * norm_b.sqrt());
    Ok(similarity.clamp(0.0, 1.0) as f32)
}

/// Validate a single embedding before it is admitted into a build.
pub fn validate_embedding(embedding: &[f32]) -> Result<()> {
    if embedding.is_empty() {
        return Err(GraphError::Computation("empty embedding vector".to_string()));
    }
    if embedding.iter().any(|v| !v.is_finite()) {
        return Err(GraphError::Computation("non-finite embedding component".to_string()));
    }
    if embedding.iter().all(|v| *v == 0.0) {
        return Err(GraphError::Computation("zero-norm embedding vector".to_string()));
    }
    Ok(())
}

/// Reject thresholds outside `[0, 1]` (NaN included).
pub fn validate_threshold(threshold: f32) -> Result<()> {
    if (0.0..=1.0).contains(&threshold) {
        Ok(())
    } else {
        Err(GraphError::InvalidThreshold(threshold))
    }
}

// ── Pair planning ──────────────────────────────────────────────────

/// An edge that passed the threshold, by index into the planner inputs.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PlannedEdge {
    pub left: PairSide,
    pub right: PairSide,
    pub similarity: f32,
}

/// Which input list an index refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PairSide {
    Fresh(usize),
    Existing(usize),
}

/// Outcome of a pairwise scan.
#[derive(Debug, Default)]
pub struct PairPlan {
    pub edges: Vec<PlannedEdge>,
    pub comparisons: usize,
    pub failures: usize,
}

/// Plan similarity edges for `fresh` embeddings.
///
/// Compares every fresh pair `(i, j)` with `i < j`, and every fresh item
/// against every `existing` item. Existing-to-existing pairs are never
/// compared. The scan is read-only, so rows run on the rayon pool when
/// `parallel` is set; output order is deterministic either way.
pub fn plan_edges(
    fresh: &[&[f32]],
    existing: &[&[f32]],
    threshold: f32,
    parallel: bool,
) -> PairPlan {
    let row = |i: usize| -> (Vec<PlannedEdge>, usize, usize) {
        let mut edges = Vec::new();
        let mut comparisons = 0;
        let mut failures = 0;

        let mut consider = |right: PairSide, other: &[f32]| {
            comparisons += 1;
            match cosine_similarity(fresh[i], other) {
                Ok(similarity) if similarity >= threshold => edges.push(PlannedEdge {
                    left: PairSide::Fresh(i),
                    right,
                    similarity,
                }),
                Ok(_) => {}
                Err(e) => {
                    failures += 1;
                    tracing::debug!("pair ({:?}, {:?}) skipped: {}", i, right, e);
                }
            }
        };

        for (j, other) in existing.iter().enumerate() {
            consider(PairSide::Existing(j), other);
        }
        for (j, other) in fresh.iter().enumerate().skip(i + 1) {
            consider(PairSide::Fresh(j), other);
        }
        (edges, comparisons, failures)
    };

    let rows: Vec<(Vec<PlannedEdge>, usize, usize)> = if parallel {
        (0..fresh.len()).into_par_iter().map(row).collect()
    } else {
        (0..fresh.len()).map(row).collect()
    };

    let mut plan = PairPlan::default();
    for (edges, comparisons, failures) in rows {
        plan.edges.extend(edges);
        plan.comparisons += comparisons;
        plan.failures += failures;
    }
    plan
}
