//! simgraph - similarity graph engine for image collections
//!
//! Images become nodes carrying an embedding; images whose cosine
//! similarity clears a threshold are joined by `SIMILAR_TO` edges. On top
//! of the graph the engine answers direct-neighbor and bounded BFS queries,
//! and keeps the graph honest against the images directory through a
//! shared existence cache.
//!
//! ```text
//! SimilarityEngine
//!   ├── builder     staged rebuild / incremental update
//!   ├── query       neighbors, extended traversal, existence filter
//!   ├── existence   filesystem cache
//!   └── graph       GraphStore trait + MemoryGraphStore
//! ```

pub mod builder;
pub mod collaborators;
pub mod config;
pub mod engine;
pub mod error;
pub mod existence;
pub mod graph;
pub mod logging;
pub mod metrics;
pub mod paths;
pub mod query;
pub mod similarity;
pub mod storage;

pub use builder::{BuildOptions, BuildReport, CancelToken, UpdateReport};
pub use collaborators::{
    discover_images, Collaborators, DescriptionGenerator, Embedder, FeatureBag, FeatureExtractor,
};
pub use config::EngineConfig;
pub use engine::{GraphStats, PruneReport, SimilarityEngine, SyncReport};
pub use error::{GraphError, Result};
pub use existence::ExistenceCache;
pub use graph::{GraphStore, MemoryGraphStore};
pub use metrics::{Metrics, MetricsSnapshot};
pub use paths::{lookup_variants, normalize_image_path};
pub use query::{ExtendedQuery, GraphEdge, GraphNode, GraphView, NeighborQuery};
pub use similarity::cosine_similarity;
pub use storage::{
    EdgeKind, EdgeRecord, FeatureCriteria, ImageRecord, LabelKind, MatchMode, PatternMatch,
    PatternQuery,
};
