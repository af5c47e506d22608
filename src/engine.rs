//! SimilarityEngine - the public facade
//!
//! Owns the graph store (behind an `RwLock`), the existence cache, the
//! collaborators and the configuration. Queries take the read lock and may
//! run concurrently; mutations are serialized by a build mutex and take the
//! write lock only for their commit. The existence cache is invalidated
//! after every mutation that changes which images are in the graph.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Instant;

use serde::Serialize;

use crate::builder::{self, BuildOptions, BuildReport, UpdateReport};
use crate::collaborators::{discover_images, Collaborators, FeatureBag};
use crate::config::EngineConfig;
use crate::error::Result;
use crate::existence::ExistenceCache;
use crate::graph::{
    read_store, store_image_features, write_store, GraphStore, MemoryGraphStore, SharedStore,
};
use crate::metrics::{Metrics, Operation};
use crate::paths::normalize_with_prefix;
use crate::query::{self, resolve_image, ExtendedQuery, GraphView, NeighborQuery};
use crate::similarity::validate_threshold;
use crate::storage::{EdgeKind, ImageRecord, PatternMatch, PatternQuery};

/// Counts for a dashboard or health check.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct GraphStats {
    pub image_count: usize,
    pub similarity_edges: usize,
    pub total_edges: usize,
}

/// Result of pruning nodes whose files are gone.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PruneReport {
    pub checked: usize,
    /// Keys confirmed missing on disk
    pub missing: Vec<String>,
    pub removed: usize,
}

/// Differences between the graph and the images directory.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SyncReport {
    /// In the graph, no file on disk
    pub graph_only: Vec<String>,
    /// On disk, no node in the graph
    pub disk_only: Vec<String>,
}

impl SyncReport {
    pub fn in_sync(&self) -> bool {
        self.graph_only.is_empty() && self.disk_only.is_empty()
    }
}

pub struct SimilarityEngine {
    store: SharedStore,
    cache: Arc<ExistenceCache>,
    collaborators: Collaborators,
    config: EngineConfig,
    metrics: Option<Arc<Metrics>>,
    /// Serializes rebuild, update, prune and node edits
    build_lock: Mutex<()>,
}

impl SimilarityEngine {
    /// Engine over `store` with a cache rooted at `config.images_dir`.
    pub fn new(store: Box<dyn GraphStore>, collaborators: Collaborators, config: EngineConfig) -> Self {
        let cache = Arc::new(ExistenceCache::with_prefix(&config.images_dir, &config.path_prefix));
        Self::with_cache(store, cache, collaborators, config)
    }

    /// Engine sharing an existing cache (e.g. with a static file handler).
    pub fn with_cache(
        store: Box<dyn GraphStore>,
        cache: Arc<ExistenceCache>,
        collaborators: Collaborators,
        config: EngineConfig,
    ) -> Self {
        Self {
            store: RwLock::new(store),
            cache,
            collaborators,
            config,
            metrics: None,
            build_lock: Mutex::new(()),
        }
    }

    /// Engine over a `MemoryGraphStore`, file-backed when
    /// `config.store_path` is set.
    pub fn open(config: EngineConfig, collaborators: Collaborators) -> Result<Self> {
        config.validate()?;
        let store: Box<dyn GraphStore> = match &config.store_path {
            Some(path) => Box::new(MemoryGraphStore::open(path)?),
            None => Box::new(MemoryGraphStore::create_ephemeral()),
        };
        Ok(Self::new(store, collaborators, config))
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn cache(&self) -> &Arc<ExistenceCache> {
        &self.cache
    }

    pub fn metrics(&self) -> Option<&Arc<Metrics>> {
        self.metrics.as_ref()
    }

    /// Build options seeded from the configuration.
    pub fn build_options(&self) -> BuildOptions {
        BuildOptions {
            threshold: self.config.build_threshold,
            timeout: self.config.collaborator_timeout(),
            parallel: self.config.parallel_pairs,
            path_prefix: self.config.path_prefix.clone(),
            ..BuildOptions::default()
        }
    }

    pub fn default_neighbor_query(&self) -> NeighborQuery {
        NeighborQuery {
            threshold: self.config.default_threshold,
            limit: self.config.default_neighbor_limit,
        }
    }

    pub fn default_extended_query(&self) -> ExtendedQuery {
        ExtendedQuery {
            threshold: self.config.default_threshold,
            depth: self.config.default_depth,
            limit_per_level: self.config.default_limit_per_level,
            max_nodes: self.config.default_max_nodes,
        }
    }

    fn record(&self, operation: Operation, started: Instant) {
        if let Some(metrics) = &self.metrics {
            metrics.record_query(operation, started.elapsed().as_millis() as u64);
        }
    }

    fn lock_builds(&self) -> std::sync::MutexGuard<'_, ()> {
        self.build_lock.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // ── Construction ──────────────────────────────────────────────

    /// Replace the graph with one built from `images`.
    pub fn rebuild_graph(&self, images: &[PathBuf], options: &BuildOptions) -> Result<BuildReport> {
        let started = Instant::now();
        let _build = self.lock_builds();
        let result = builder::rebuild_graph(&self.store, images, &self.collaborators, options);
        // The commit may have run even if a later step failed
        self.cache.invalidate_all();
        let report = result?;

        self.record(Operation::Rebuild, started);
        if let Some(metrics) = &self.metrics {
            metrics.record_build(
                report.elapsed_ms,
                report.successful_nodes as u64,
                report.edges_created as u64,
            );
        }
        Ok(report)
    }

    /// Rebuild from every image in `config.images_dir`.
    pub fn rebuild_from_dir(&self, options: &BuildOptions) -> Result<BuildReport> {
        let images = discover_images(&self.config.images_dir, &self.config.image_extensions)?;
        tracing::info!("Found {} images in {}", images.len(), self.config.images_dir.display());
        self.rebuild_graph(&images, options)
    }

    /// Add the images not yet in the graph.
    pub fn update_graph(&self, images: &[PathBuf], options: &BuildOptions) -> Result<UpdateReport> {
        let started = Instant::now();
        let _build = self.lock_builds();
        let result = builder::update_graph(&self.store, images, &self.collaborators, options);
        self.cache.invalidate_all();
        let report = result?;

        self.record(Operation::Update, started);
        if let Some(metrics) = &self.metrics {
            metrics.record_build(
                report.elapsed_ms,
                report.added_count as u64,
                report.new_relationships as u64,
            );
        }
        Ok(report)
    }

    /// Update from the images currently in `config.images_dir`.
    pub fn update_from_dir(&self, options: &BuildOptions) -> Result<UpdateReport> {
        let images = discover_images(&self.config.images_dir, &self.config.image_extensions)?;
        self.update_graph(&images, options)
    }

    // ── Queries ───────────────────────────────────────────────────

    /// Direct neighbors of `raw`, filtered to files that exist.
    ///
    /// Only an invalid threshold is an error. Store failures are logged
    /// and yield an empty view.
    pub fn get_neighbors(&self, raw: &str, query: &NeighborQuery) -> Result<GraphView> {
        validate_threshold(query.threshold)?;
        let started = Instant::now();

        let found = {
            let store = read_store(&self.store);
            query::neighbors(store.as_ref(), raw, &self.config.path_prefix, query)
        };
        let view = match found {
            Ok(view) => view.retain_existing(|path| self.cache.exists(path)),
            Err(e) => {
                tracing::warn!("Neighbor query for {} failed: {}", raw, e);
                GraphView::empty()
            }
        };

        self.record(Operation::Neighbors, started);
        Ok(view)
    }

    /// Bounded BFS around `raw`, filtered to files that exist.
    pub fn get_extended_neighbors(&self, raw: &str, query: &ExtendedQuery) -> Result<GraphView> {
        validate_threshold(query.threshold)?;
        let started = Instant::now();

        let found = {
            let store = read_store(&self.store);
            query::extended_neighbors(store.as_ref(), raw, &self.config.path_prefix, query)
        };
        let view = match found {
            Ok(view) => view.retain_existing(|path| self.cache.exists(path)),
            Err(e) => {
                tracing::warn!("Extended neighbor query for {} failed: {}", raw, e);
                GraphView::empty()
            }
        };

        self.record(Operation::ExtendedNeighbors, started);
        Ok(view)
    }

    /// Pattern search over labels and descriptions. Degrades to no matches.
    pub fn search(&self, query: &PatternQuery) -> Vec<PatternMatch> {
        let started = Instant::now();
        let matches = read_store(&self.store).run_pattern_query(query).unwrap_or_else(|e| {
            tracing::warn!("Pattern query failed: {}", e);
            Vec::new()
        });
        self.record(Operation::PatternQuery, started);
        matches
    }

    pub fn find_image(&self, raw: &str) -> Result<Option<ImageRecord>> {
        let store = read_store(&self.store);
        resolve_image(store.as_ref(), raw, &self.config.path_prefix)
    }

    /// Up to `limit` image keys in key order.
    pub fn sample_images(&self, limit: usize) -> Result<Vec<String>> {
        let mut paths = read_store(&self.store).list_all_image_paths()?;
        paths.truncate(limit);
        Ok(paths)
    }

    pub fn stats(&self) -> Result<GraphStats> {
        let store = read_store(&self.store);
        Ok(GraphStats {
            image_count: store.count_images()?,
            similarity_edges: store.count_edges(Some(EdgeKind::SimilarTo))?,
            total_edges: store.count_edges(None)?,
        })
    }

    // ── Node edits ────────────────────────────────────────────────

    /// Attach a feature bag to an existing image. `Ok(false)` when the image
    /// is unknown or the bag is empty.
    pub fn store_features(&self, raw: &str, bag: &FeatureBag) -> Result<bool> {
        let _build = self.lock_builds();
        let mut store = write_store(&self.store);
        let Some(image) = resolve_image(store.as_ref(), raw, &self.config.path_prefix)? else {
            return Ok(false);
        };
        let stored = store_image_features(store.as_mut(), &image.path, bag)?;
        store.flush()?;
        Ok(stored)
    }

    /// Set the description of an existing image. `Ok(false)` when unknown.
    pub fn set_description(&self, raw: &str, description: &str) -> Result<bool> {
        let _build = self.lock_builds();
        let mut store = write_store(&self.store);
        let Some(image) = resolve_image(store.as_ref(), raw, &self.config.path_prefix)? else {
            return Ok(false);
        };
        store.set_description(image.id, description.to_string())?;
        store.flush()?;
        Ok(true)
    }

    // ── Maintenance ───────────────────────────────────────────────

    /// Remove the nodes among `candidates` whose files are gone.
    ///
    /// Every candidate is re-checked on disk, bypassing the cache. Keys
    /// without a node are ignored, so pruning twice removes nothing the
    /// second time.
    pub fn prune(&self, candidates: &[String]) -> Result<usize> {
        let started = Instant::now();
        let _build = self.lock_builds();
        let missing = self.confirm_missing(candidates);
        let removed = self.delete_missing(&missing)?;
        self.record(Operation::Prune, started);
        Ok(removed)
    }

    /// Check every image in the graph and remove those without a file.
    pub fn prune_missing(&self) -> Result<PruneReport> {
        let started = Instant::now();
        let _build = self.lock_builds();
        let candidates = read_store(&self.store).list_all_image_paths()?;
        let missing = self.confirm_missing(&candidates);
        let removed = self.delete_missing(&missing)?;

        tracing::info!(
            "Pruned {} of {} images ({} missing on disk)",
            removed,
            candidates.len(),
            missing.len()
        );
        self.record(Operation::Prune, started);
        Ok(PruneReport { checked: candidates.len(), missing, removed })
    }

    fn confirm_missing(&self, candidates: &[String]) -> Vec<String> {
        let mut seen: HashSet<String> = HashSet::new();
        candidates
            .iter()
            .map(|c| normalize_with_prefix(c, &self.config.path_prefix))
            .filter(|key| !key.is_empty() && seen.insert(key.clone()))
            .filter(|key| !self.cache.exists_with(key, true))
            .collect()
    }

    /// One batch delete, then cache invalidation. Caller holds the build lock.
    fn delete_missing(&self, missing: &[String]) -> Result<usize> {
        if missing.is_empty() {
            self.cache.invalidate_all();
            return Ok(0);
        }
        let result = {
            let mut store = write_store(&self.store);
            match store.delete_images(missing) {
                Ok(removed) => store.flush().map(|_| removed),
                Err(e) => Err(e),
            }
        };
        self.cache.invalidate_all();
        result
    }

    /// Drop all cached existence answers.
    pub fn invalidate_cache(&self) {
        self.cache.invalidate_all();
    }

    /// Cached check whether `name` exists in the images directory.
    pub fn image_exists(&self, name: &str) -> bool {
        self.cache.exists(name)
    }

    /// On-disk path for `name`, with case-insensitive fallback.
    pub fn image_file(&self, name: &str) -> Option<PathBuf> {
        self.cache.resolve(name)
    }

    /// Compare graph keys with the files in `config.images_dir`.
    pub fn sync_report(&self) -> Result<SyncReport> {
        let in_graph = read_store(&self.store).list_all_image_paths()?;
        let on_disk = discover_images(&self.config.images_dir, &self.config.image_extensions)?;

        let graph_keys: HashSet<String> = in_graph.iter().map(|k| k.to_lowercase()).collect();
        let graph_only: Vec<String> =
            in_graph.into_iter().filter(|key| !self.cache.exists(key)).collect();
        let disk_only: Vec<String> = on_disk
            .iter()
            .filter_map(|p| p.file_name().map(|n| n.to_string_lossy().into_owned()))
            .filter(|name| !graph_keys.contains(&name.to_lowercase()))
            .collect();

        if !graph_only.is_empty() || !disk_only.is_empty() {
            tracing::info!(
                "Graph out of sync: {} nodes without files, {} files without nodes",
                graph_only.len(),
                disk_only.len()
            );
        }
        Ok(SyncReport { graph_only, disk_only })
    }

    /// Persist the store.
    pub fn flush(&self) -> Result<()> {
        write_store(&self.store).flush()
    }
}

impl std::fmt::Debug for SimilarityEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SimilarityEngine")
            .field("images_dir", &self.config.images_dir)
            .field("cache", &self.cache)
            .field("metrics", &self.metrics.is_some())
            .finish()
    }
}
