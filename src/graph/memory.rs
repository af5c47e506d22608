//! In-memory graph store with optional snapshot persistence
//!
//! All state lives in hash maps. A file-backed store loads a bincode
//! snapshot on `open` and rewrites it on `flush` (temp file + rename, so a
//! crash mid-write leaves the previous snapshot intact).

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use super::id_gen::{image_node_id, label_node_id};
use super::GraphStore;
use crate::error::{GraphError, Result};
use crate::storage::{
    EdgeKind, EdgeRecord, FeatureCriteria, ImageRecord, LabelKind, LabelRecord, MatchMode,
    PatternMatch, PatternQuery, ScoredNeighbor,
};

const SNAPSHOT_VERSION: u32 = 1;

/// On-disk layout
#[derive(Serialize, Deserialize)]
struct Snapshot {
    version: u32,
    images: Vec<ImageRecord>,
    labels: Vec<LabelRecord>,
    edges: Vec<EdgeRecord>,
}

type EdgeKey = (u128, u128, EdgeKind);

/// Merge key: similarity edges are stored under the ordered pair.
fn edge_key(edge: &EdgeRecord) -> EdgeKey {
    if edge.kind.is_undirected() && edge.dst < edge.src {
        (edge.dst, edge.src, edge.kind)
    } else {
        (edge.src, edge.dst, edge.kind)
    }
}

pub struct MemoryGraphStore {
    images: HashMap<u128, ImageRecord>,
    /// Normalized key -> image ID
    keys: HashMap<String, u128>,
    labels: HashMap<u128, LabelRecord>,
    edges: HashMap<EdgeKey, EdgeRecord>,
    /// Similarity adjacency, both directions
    similar: HashMap<u128, HashMap<u128, f32>>,
    /// Outgoing image->label edges: image -> [(kind, label)]
    outgoing: HashMap<u128, HashSet<(EdgeKind, u128)>>,
    path: Option<PathBuf>,
    dirty: bool,
}

// ── Constructors ────────────────────────────────────────────────────

impl MemoryGraphStore {
    /// Create an ephemeral (in-memory only) store.
    pub fn create_ephemeral() -> Self {
        Self {
            images: HashMap::new(),
            keys: HashMap::new(),
            labels: HashMap::new(),
            edges: HashMap::new(),
            similar: HashMap::new(),
            outgoing: HashMap::new(),
            path: None,
            dirty: false,
        }
    }

    /// Open a file-backed store. A missing file starts an empty graph.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let mut store = Self::create_ephemeral();
        store.path = Some(path.to_path_buf());

        if !path.exists() {
            return Ok(store);
        }

        let reader = BufReader::new(File::open(path)?);
        let snapshot: Snapshot = bincode::deserialize_from(reader)?;
        if snapshot.version != SNAPSHOT_VERSION {
            return Err(GraphError::InvalidFormat(format!(
                "snapshot version {} (expected {})",
                snapshot.version, SNAPSHOT_VERSION
            )));
        }

        for image in snapshot.images {
            store.keys.insert(image.path.clone(), image.id);
            store.images.insert(image.id, image);
        }
        for label in snapshot.labels {
            store.labels.insert(label.id, label);
        }
        for edge in snapshot.edges {
            store.index_edge(&edge);
            store.edges.insert(edge_key(&edge), edge);
        }

        tracing::info!(
            "Opened graph snapshot {}: {} images, {} labels, {} edges",
            path.display(),
            store.images.len(),
            store.labels.len(),
            store.edges.len()
        );
        Ok(store)
    }

    pub fn is_ephemeral(&self) -> bool {
        self.path.is_none()
    }

    pub fn label_count(&self) -> usize {
        self.labels.len()
    }

    /// Label node by kind and name
    pub fn find_label(&self, kind: LabelKind, name: &str) -> Option<&LabelRecord> {
        self.labels.get(&label_node_id(kind, name))
    }
}

// ── Helpers ─────────────────────────────────────────────────────────

impl MemoryGraphStore {
    fn index_edge(&mut self, edge: &EdgeRecord) {
        match edge.kind {
            EdgeKind::SimilarTo => {
                let similarity = edge.similarity.unwrap_or(0.0);
                self.similar.entry(edge.src).or_default().insert(edge.dst, similarity);
                self.similar.entry(edge.dst).or_default().insert(edge.src, similarity);
            }
            kind => {
                self.outgoing.entry(edge.src).or_default().insert((kind, edge.dst));
            }
        }
    }

    fn detach_image(&mut self, id: u128) {
        if let Some(adjacent) = self.similar.remove(&id) {
            for other in adjacent.keys() {
                if let Some(back) = self.similar.get_mut(other) {
                    back.remove(&id);
                }
            }
        }
        self.outgoing.remove(&id);
        self.edges.retain(|(src, dst, _), _| *src != id && *dst != id);
    }

    fn image_mut(&mut self, id: u128) -> Result<&mut ImageRecord> {
        self.images
            .get_mut(&id)
            .ok_or_else(|| GraphError::ImageNotFound(format!("node {}", id)))
    }

    /// True when `image` links to the `kind` label `name` via `edge_kind`.
    fn has_label(&self, image: u128, edge_kind: EdgeKind, kind: LabelKind, name: &str) -> bool {
        let label = label_node_id(kind, name);
        self.outgoing
            .get(&image)
            .map(|out| out.contains(&(edge_kind, label)))
            .unwrap_or(false)
    }

    fn object_confidence(&self, image: u128, object: &str) -> Option<f32> {
        let label = label_node_id(LabelKind::Object, object);
        self.edges
            .get(&(image, label, EdgeKind::Contains))
            .and_then(|e| e.confidence)
    }

    fn matches_set<F>(names: &[String], mode: MatchMode, mut hit: F) -> bool
    where
        F: FnMut(&str) -> bool,
    {
        if names.is_empty() {
            return true;
        }
        match mode {
            MatchMode::All => names.iter().all(|n| hit(n)),
            MatchMode::Any => names.iter().any(|n| hit(n)),
        }
    }

    fn matches_criteria(&self, image: &ImageRecord, criteria: &FeatureCriteria) -> bool {
        let id = image.id;
        Self::matches_set(&criteria.tags, criteria.tags_mode, |t| {
            self.has_label(id, EdgeKind::HasTag, LabelKind::Tag, t)
        }) && Self::matches_set(&criteria.colors, criteria.colors_mode, |c| {
            self.has_label(id, EdgeKind::HasColor, LabelKind::Color, c)
        }) && Self::matches_set(&criteria.objects, criteria.objects_mode, |o| {
            self.object_confidence(id, o)
                .map(|c| c >= criteria.min_confidence)
                .unwrap_or(false)
        }) && criteria
            .orientation
            .as_deref()
            .map(|o| image.property_str("basic_orientation") == Some(o))
            .unwrap_or(true)
            && criteria
                .camera
                .as_deref()
                .map(|c| self.has_label(id, EdgeKind::TakenWith, LabelKind::Camera, c))
                .unwrap_or(true)
    }

    /// Images passing `filter`, sorted by path, at most `limit`.
    fn collect_matches<F>(&self, limit: usize, filter: F) -> Vec<PatternMatch>
    where
        F: Fn(&ImageRecord) -> bool,
    {
        let mut hits: Vec<&ImageRecord> = self.images.values().filter(|i| filter(i)).collect();
        hits.sort_by(|a, b| a.path.cmp(&b.path));
        hits.into_iter()
            .take(limit)
            .map(|i| PatternMatch {
                id: i.id,
                path: i.path.clone(),
                description: i.description.clone(),
                confidence: None,
            })
            .collect()
    }
}

// ── GraphStore Implementation ───────────────────────────────────────

impl GraphStore for MemoryGraphStore {
    fn create_image_node(
        &mut self,
        key: &str,
        embedding: Vec<f32>,
        description: Option<String>,
    ) -> Result<u128> {
        let id = image_node_id(key);
        match self.images.get_mut(&id) {
            Some(existing) => {
                existing.embedding = embedding;
                if description.is_some() {
                    existing.description = description;
                }
            }
            None => {
                let mut record = ImageRecord::new(id, key, embedding);
                record.description = description;
                self.images.insert(id, record);
                self.keys.insert(key.to_string(), id);
            }
        }
        self.dirty = true;
        Ok(id)
    }

    fn find_image_by_key(&self, key: &str) -> Result<Option<ImageRecord>> {
        Ok(self
            .keys
            .get(key)
            .and_then(|id| self.images.get(id))
            .cloned())
    }

    fn get_image(&self, id: u128) -> Result<Option<ImageRecord>> {
        Ok(self.images.get(&id).cloned())
    }

    fn set_image_properties(
        &mut self,
        id: u128,
        properties: BTreeMap<String, serde_json::Value>,
        features_json: Option<String>,
    ) -> Result<()> {
        let image = self.image_mut(id)?;
        image.properties.extend(properties);
        if features_json.is_some() {
            image.features_json = features_json;
        }
        self.dirty = true;
        Ok(())
    }

    fn set_description(&mut self, id: u128, description: String) -> Result<()> {
        self.image_mut(id)?.description = Some(description);
        self.dirty = true;
        Ok(())
    }

    fn list_all_image_paths(&self) -> Result<Vec<String>> {
        let mut paths: Vec<String> = self.keys.keys().cloned().collect();
        paths.sort();
        Ok(paths)
    }

    fn list_image_embeddings(&self) -> Result<Vec<(String, Vec<f32>)>> {
        let mut out: Vec<(String, Vec<f32>)> = self
            .images
            .values()
            .map(|i| (i.path.clone(), i.embedding.clone()))
            .collect();
        out.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(out)
    }

    fn count_images(&self) -> Result<usize> {
        Ok(self.images.len())
    }

    fn delete_images(&mut self, keys: &[String]) -> Result<usize> {
        let mut deleted = 0;
        for key in keys {
            if let Some(id) = self.keys.remove(key) {
                self.images.remove(&id);
                self.detach_image(id);
                deleted += 1;
            }
        }
        if deleted > 0 {
            self.dirty = true;
        }
        Ok(deleted)
    }

    fn merge_label_node(&mut self, kind: LabelKind, name: &str) -> Result<u128> {
        let id = label_node_id(kind, name);
        if !self.labels.contains_key(&id) {
            self.labels.insert(id, LabelRecord { id, kind, name: name.to_string() });
            self.dirty = true;
        }
        Ok(id)
    }

    fn merge_edge(&mut self, edge: EdgeRecord) -> Result<()> {
        if edge.kind == EdgeKind::SimilarTo {
            if edge.src == edge.dst {
                return Err(GraphError::InvalidEdge(format!("self-loop on node {}", edge.src)));
            }
            if !self.images.contains_key(&edge.src) || !self.images.contains_key(&edge.dst) {
                return Err(GraphError::InvalidEdge(format!(
                    "SIMILAR_TO endpoints must be images: {} -> {}",
                    edge.src, edge.dst
                )));
            }
        } else if !self.labels.contains_key(&edge.dst) {
            return Err(GraphError::InvalidEdge(format!(
                "{} target {} is not a label node",
                edge.kind.as_str(),
                edge.dst
            )));
        }

        self.index_edge(&edge);
        self.edges.insert(edge_key(&edge), edge);
        self.dirty = true;
        Ok(())
    }

    fn similar_neighbors(
        &self,
        id: u128,
        threshold: f32,
        limit: usize,
    ) -> Result<Vec<ScoredNeighbor>> {
        let Some(adjacent) = self.similar.get(&id) else {
            return Ok(Vec::new());
        };

        let mut neighbors: Vec<ScoredNeighbor> = adjacent
            .iter()
            .filter(|(_, sim)| **sim >= threshold)
            .filter_map(|(other, sim)| {
                self.images.get(other).map(|image| ScoredNeighbor {
                    id: image.id,
                    path: image.path.clone(),
                    description: image.description.clone(),
                    similarity: *sim,
                })
            })
            .collect();

        neighbors.sort_by(|a, b| b.similarity.total_cmp(&a.similarity).then(a.id.cmp(&b.id)));
        neighbors.truncate(limit);
        Ok(neighbors)
    }

    fn count_edges(&self, kind: Option<EdgeKind>) -> Result<usize> {
        Ok(match kind {
            Some(kind) => self.edges.keys().filter(|(_, _, k)| *k == kind).count(),
            None => self.edges.len(),
        })
    }

    fn run_pattern_query(&self, query: &PatternQuery) -> Result<Vec<PatternMatch>> {
        let matches = match query {
            PatternQuery::ByTags { tags, mode, limit } => {
                if tags.is_empty() {
                    return Ok(Vec::new());
                }
                self.collect_matches(*limit, |i| {
                    Self::matches_set(tags, *mode, |t| {
                        self.has_label(i.id, EdgeKind::HasTag, LabelKind::Tag, t)
                    })
                })
            }
            PatternQuery::ByColor { color, limit } => self.collect_matches(*limit, |i| {
                self.has_label(i.id, EdgeKind::HasColor, LabelKind::Color, color)
            }),
            PatternQuery::ContainingObject { object, min_confidence, limit } => {
                let mut hits: Vec<PatternMatch> = self
                    .images
                    .values()
                    .filter_map(|i| {
                        self.object_confidence(i.id, object)
                            .filter(|c| *c >= *min_confidence)
                            .map(|c| PatternMatch {
                                id: i.id,
                                path: i.path.clone(),
                                description: i.description.clone(),
                                confidence: Some(c),
                            })
                    })
                    .collect();
                hits.sort_by(|a, b| {
                    let (ca, cb) = (a.confidence.unwrap_or(0.0), b.confidence.unwrap_or(0.0));
                    cb.total_cmp(&ca).then_with(|| a.path.cmp(&b.path))
                });
                hits.truncate(*limit);
                hits
            }
            PatternQuery::ByFeatures { criteria, limit } => {
                self.collect_matches(*limit, |i| self.matches_criteria(i, criteria))
            }
            PatternQuery::DescriptionContains { text, limit } => {
                let needle = text.to_lowercase();
                if needle.is_empty() {
                    return Ok(Vec::new());
                }
                self.collect_matches(*limit, |i| {
                    i.description
                        .as_deref()
                        .map(|d| d.to_lowercase().contains(&needle))
                        .unwrap_or(false)
                })
            }
        };
        Ok(matches)
    }

    fn clear_all(&mut self) -> Result<()> {
        self.images.clear();
        self.keys.clear();
        self.labels.clear();
        self.edges.clear();
        self.similar.clear();
        self.outgoing.clear();
        self.dirty = true;
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        let Some(path) = self.path.clone() else {
            return Ok(());
        };
        if !self.dirty && path.exists() {
            return Ok(());
        }

        let mut images: Vec<ImageRecord> = self.images.values().cloned().collect();
        images.sort_by(|a, b| a.path.cmp(&b.path));
        let mut labels: Vec<LabelRecord> = self.labels.values().cloned().collect();
        labels.sort_by_key(|l| l.id);
        let mut edges: Vec<EdgeRecord> = self.edges.values().cloned().collect();
        edges.sort_by_key(edge_key);

        let snapshot = Snapshot { version: SNAPSHOT_VERSION, images, labels, edges };

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let tmp = path.with_extension("tmp");
        {
            let mut writer = BufWriter::new(File::create(&tmp)?);
            bincode::serialize_into(&mut writer, &snapshot)?;
            writer.flush()?;
        }
        fs::rename(&tmp, &path)?;
        self.dirty = false;

        tracing::debug!("Flushed graph snapshot to {}", path.display());
        Ok(())
    }
}

// ── Tests ───────────────────────────────────────────────────────────
