//! Read-side queries over the similarity graph
//!
//! Both query kinds return a [`GraphView`]: a flat node list with one
//! center plus the edges between included nodes. Query functions work on a
//! borrowed store (the caller holds the read lock) and return store errors
//! as-is; the engine decides how to degrade.

pub mod extended;
pub mod neighbors;

pub use extended::extended_neighbors;
pub use neighbors::neighbors;

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::graph::{edge_id, GraphStore};
use crate::paths::lookup_variants;
use crate::storage::{ImageRecord, ScoredNeighbor};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GraphNode {
    /// Store node ID in decimal
    pub id: String,
    pub path: String,
    pub is_center: bool,
    /// BFS level of first discovery; only set by extended traversal
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub level: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl GraphNode {
    pub(crate) fn from_image(image: &ImageRecord, is_center: bool, level: Option<usize>) -> Self {
        Self {
            id: image.id.to_string(),
            path: image.path.clone(),
            is_center,
            level,
            description: image.description.clone(),
        }
    }

    pub(crate) fn neighbor(found: &ScoredNeighbor, level: Option<usize>) -> Self {
        Self {
            id: found.id.to_string(),
            path: found.path.clone(),
            is_center: false,
            level,
            description: found.description.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphEdge {
    /// Order-independent `e{min}-{max}`
    pub id: String,
    pub source: String,
    pub target: String,
    /// Cosine similarity
    pub weight: f32,
}

impl GraphEdge {
    pub(crate) fn new(source: u128, target: u128, weight: f32) -> Self {
        Self {
            id: edge_id(source, target),
            source: source.to_string(),
            target: target.to_string(),
            weight,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GraphView {
    pub nodes: Vec<GraphNode>,
    pub edges: Vec<GraphEdge>,
}

impl GraphView {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn center(&self) -> Option<&GraphNode> {
        self.nodes.iter().find(|n| n.is_center)
    }

    /// Drop non-center nodes whose file fails `exists`, then every edge
    /// touching a dropped node. The center always stays.
    pub fn retain_existing<F>(mut self, mut exists: F) -> Self
    where
        F: FnMut(&str) -> bool,
    {
        let mut dropped: HashSet<String> = HashSet::new();
        self.nodes.retain(|node| {
            if node.is_center || exists(&node.path) {
                true
            } else {
                dropped.insert(node.id.clone());
                false
            }
        });
        if !dropped.is_empty() {
            tracing::debug!("Filtered {} nodes with missing files", dropped.len());
            self.edges
                .retain(|e| !dropped.contains(&e.source) && !dropped.contains(&e.target));
        }
        self
    }
}

/// Parameters of a single-level neighbor query.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NeighborQuery {
    pub threshold: f32,
    pub limit: usize,
}

impl Default for NeighborQuery {
    fn default() -> Self {
        Self { threshold: 0.5, limit: 10 }
    }
}

/// Parameters of a bounded breadth-first traversal.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ExtendedQuery {
    pub threshold: f32,
    /// Levels to expand below the center (0 returns the center alone)
    pub depth: usize,
    /// Neighbors fetched per expanded node
    pub limit_per_level: usize,
    /// Hard cap on returned nodes, center included
    pub max_nodes: usize,
}

impl Default for ExtendedQuery {
    fn default() -> Self {
        Self { threshold: 0.5, depth: 1, limit_per_level: 10, max_nodes: 100 }
    }
}

/// Resolve a caller-supplied path to an image node.
///
/// Tries each lookup variant in order and stops at the first that names a
/// node. Purely string-based: no fuzzy or case-insensitive matching.
pub fn resolve_image(store: &dyn GraphStore, raw: &str, prefix: &str) -> Result<Option<ImageRecord>> {
    for candidate in lookup_variants(raw, prefix) {
        if let Some(image) = store.find_image_by_key(&candidate)? {
            if candidate != raw {
                tracing::debug!("Resolved {} via {}", raw, candidate);
            }
            return Ok(Some(image));
        }
    }
    Ok(None)
}
