//! Graph store API and the in-memory implementation

pub mod features;
pub mod id_gen;
pub mod memory;

pub use features::store_image_features;
pub use id_gen::{compute_node_id, edge_id, image_node_id, label_node_id};
pub use memory::MemoryGraphStore;

use std::collections::BTreeMap;
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::error::Result;
use crate::storage::{
    EdgeKind, EdgeRecord, ImageRecord, LabelKind, PatternMatch, PatternQuery, ScoredNeighbor,
};

/// Property graph store used by the engine.
///
/// Send + Sync required for use behind `RwLock<Box<dyn GraphStore>>` in
/// `SimilarityEngine`. Every operation is fallible: a remote store can lose
/// its connection at any point, and callers decide whether that degrades
/// (queries) or surfaces (mutations).
pub trait GraphStore: Send + Sync {
    // === IMAGE NODES ===

    /// Create the image node for `key`, or update the embedding and
    /// description of the existing one. Returns the node ID.
    fn create_image_node(
        &mut self,
        key: &str,
        embedding: Vec<f32>,
        description: Option<String>,
    ) -> Result<u128>;

    /// Exact lookup by normalized file name
    fn find_image_by_key(&self, key: &str) -> Result<Option<ImageRecord>>;

    fn get_image(&self, id: u128) -> Result<Option<ImageRecord>>;

    /// Merge scalar properties into an image; replaces `features_json` when given.
    fn set_image_properties(
        &mut self,
        id: u128,
        properties: BTreeMap<String, serde_json::Value>,
        features_json: Option<String>,
    ) -> Result<()>;

    fn set_description(&mut self, id: u128, description: String) -> Result<()>;

    /// All image keys, sorted
    fn list_all_image_paths(&self) -> Result<Vec<String>>;

    /// `(key, embedding)` for every image, sorted by key
    fn list_image_embeddings(&self) -> Result<Vec<(String, Vec<f32>)>>;

    fn count_images(&self) -> Result<usize>;

    /// Delete images by key together with their incident edges.
    /// Keys without a node are ignored. Returns the number deleted.
    fn delete_images(&mut self, keys: &[String]) -> Result<usize>;

    // === LABELS & EDGES ===

    /// Create the label node, or return the existing one.
    fn merge_label_node(&mut self, kind: LabelKind, name: &str) -> Result<u128>;

    /// Create or update an edge.
    ///
    /// `SIMILAR_TO` merges on the unordered endpoint pair and rejects
    /// self-loops; other kinds merge on `(src, dst, kind)`.
    fn merge_edge(&mut self, edge: EdgeRecord) -> Result<()>;

    /// Images joined to `id` by `SIMILAR_TO` with `similarity >= threshold`,
    /// similarity descending, ties by node ID ascending, at most `limit`.
    fn similar_neighbors(&self, id: u128, threshold: f32, limit: usize)
        -> Result<Vec<ScoredNeighbor>>;

    /// Count edges, optionally of a single kind
    fn count_edges(&self, kind: Option<EdgeKind>) -> Result<usize>;

    // === QUERIES ===

    fn run_pattern_query(&self, query: &PatternQuery) -> Result<Vec<PatternMatch>>;

    // === MAINTENANCE ===

    /// Remove every node and edge
    fn clear_all(&mut self) -> Result<()>;

    /// Persist pending changes (no-op for stores without durable state)
    fn flush(&mut self) -> Result<()> {
        Ok(())
    }
}

/// A store shared between query threads and the builder.
pub type SharedStore = RwLock<Box<dyn GraphStore>>;

/// Read access; a poisoned lock still yields the store.
pub fn read_store(store: &SharedStore) -> RwLockReadGuard<'_, Box<dyn GraphStore>> {
    store.read().unwrap_or_else(PoisonError::into_inner)
}

/// Exclusive access; a poisoned lock still yields the store.
pub fn write_store(store: &SharedStore) -> RwLockWriteGuard<'_, Box<dyn GraphStore>> {
    store.write().unwrap_or_else(PoisonError::into_inner)
}
