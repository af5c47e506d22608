//! Record types shared by the store, builder and query layers

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Image node as held by a graph store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageRecord {
    /// Store-assigned ID (deterministic BLAKE3 hash of the key)
    pub id: u128,

    /// Normalized file name; unique across image nodes
    pub path: String,

    /// Embedding captured at build time. Persisted so incremental updates
    /// can compare new images against existing ones without re-embedding.
    pub embedding: Vec<f32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    /// Scalar feature properties (`basic_orientation`, `color_hex`, `brightness`, ...)
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub properties: BTreeMap<String, serde_json::Value>,

    /// Full feature bag, serialized as JSON
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub features_json: Option<String>,
}

impl ImageRecord {
    pub fn new(id: u128, path: impl Into<String>, embedding: Vec<f32>) -> Self {
        Self {
            id,
            path: path.into(),
            embedding,
            description: None,
            properties: BTreeMap::new(),
            features_json: None,
        }
    }

    pub fn property_str(&self, key: &str) -> Option<&str> {
        self.properties.get(key).and_then(|v| v.as_str())
    }
}

/// Kinds of shared label nodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum LabelKind {
    Tag,
    Category,
    Color,
    Object,
    Camera,
    Lens,
}

impl LabelKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            LabelKind::Tag => "Tag",
            LabelKind::Category => "Category",
            LabelKind::Color => "Color",
            LabelKind::Object => "Object",
            LabelKind::Camera => "Camera",
            LabelKind::Lens => "Lens",
        }
    }

    /// Property that keys the label (`model` for cameras, `name` otherwise).
    pub fn key_field(&self) -> &'static str {
        match self {
            LabelKind::Camera => "model",
            _ => "name",
        }
    }
}

/// Label node: merged on `(kind, name)`, shared across images.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LabelRecord {
    pub id: u128,
    pub kind: LabelKind,
    pub name: String,
}

/// Relationship types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum EdgeKind {
    SimilarTo,
    HasTag,
    InCategory,
    HasColor,
    Contains,
    TakenWith,
    UsedLens,
}

impl EdgeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EdgeKind::SimilarTo => "SIMILAR_TO",
            EdgeKind::HasTag => "HAS_TAG",
            EdgeKind::InCategory => "IN_CATEGORY",
            EdgeKind::HasColor => "HAS_COLOR",
            EdgeKind::Contains => "CONTAINS",
            EdgeKind::TakenWith => "TAKEN_WITH",
            EdgeKind::UsedLens => "USED_LENS",
        }
    }

    /// Similarity edges are undirected; everything else points image -> label.
    pub fn is_undirected(&self) -> bool {
        matches!(self, EdgeKind::SimilarTo)
    }
}

/// Edge record. Properties are kind-specific.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EdgeRecord {
    pub src: u128,
    pub dst: u128,
    pub kind: EdgeKind,

    /// `SIMILAR_TO` only, in `[0, 1]`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub similarity: Option<f32>,

    /// `CONTAINS` only: detector confidence
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f32>,
}

impl EdgeRecord {
    pub fn similar(src: u128, dst: u128, similarity: f32) -> Self {
        Self { src, dst, kind: EdgeKind::SimilarTo, similarity: Some(similarity), confidence: None }
    }

    pub fn label(src: u128, dst: u128, kind: EdgeKind) -> Self {
        Self { src, dst, kind, similarity: None, confidence: None }
    }

    pub fn contains(src: u128, dst: u128, confidence: f32) -> Self {
        Self { src, dst, kind: EdgeKind::Contains, similarity: None, confidence: Some(confidence) }
    }
}

/// A neighbor reached over a `SIMILAR_TO` edge.
#[derive(Debug, Clone, PartialEq)]
pub struct ScoredNeighbor {
    pub id: u128,
    pub path: String,
    pub description: Option<String>,
    pub similarity: f32,
}

// ── Pattern queries ────────────────────────────────────────────────

/// How a list of labels combines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum MatchMode {
    /// Every label must be attached
    #[default]
    All,
    /// At least one label must be attached
    Any,
}

/// Default minimum detector confidence for object criteria.
pub const DEFAULT_MIN_CONFIDENCE: f32 = 0.5;

fn default_min_confidence() -> f32 {
    DEFAULT_MIN_CONFIDENCE
}

fn any_mode() -> MatchMode {
    MatchMode::Any
}

/// Combined feature search. Empty lists and `None` fields do not constrain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureCriteria {
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub tags_mode: MatchMode,
    #[serde(default)]
    pub colors: Vec<String>,
    #[serde(default = "any_mode")]
    pub colors_mode: MatchMode,
    #[serde(default)]
    pub objects: Vec<String>,
    #[serde(default = "any_mode")]
    pub objects_mode: MatchMode,
    #[serde(default = "default_min_confidence")]
    pub min_confidence: f32,
    #[serde(default)]
    pub orientation: Option<String>,
    #[serde(default)]
    pub camera: Option<String>,
}

impl Default for FeatureCriteria {
    fn default() -> Self {
        Self {
            tags: Vec::new(),
            tags_mode: MatchMode::All,
            colors: Vec::new(),
            colors_mode: MatchMode::Any,
            objects: Vec::new(),
            objects_mode: MatchMode::Any,
            min_confidence: DEFAULT_MIN_CONFIDENCE,
            orientation: None,
            camera: None,
        }
    }
}

impl FeatureCriteria {
    pub fn is_empty(&self) -> bool {
        self.tags.is_empty()
            && self.colors.is_empty()
            && self.objects.is_empty()
            && self.orientation.is_none()
            && self.camera.is_none()
    }
}

/// Read-only pattern queries over images and their labels.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum PatternQuery {
    ByTags { tags: Vec<String>, mode: MatchMode, limit: usize },
    ByColor { color: String, limit: usize },
    ContainingObject { object: String, min_confidence: f32, limit: usize },
    ByFeatures { criteria: FeatureCriteria, limit: usize },
    DescriptionContains { text: String, limit: usize },
}

/// One image matched by a pattern query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatternMatch {
    pub id: u128,
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Set for object queries
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f32>,
}
