//! Graph construction: full rebuild and incremental update.
//!
//! Both run in two stages. Staging calls the collaborators (embed, describe,
//! extract) and plans similarity edges without touching the store lock.
//! The commit then takes the write lock once and applies everything, so
//! queries never see a half-cleared graph and a cancelled or failed staging
//! leaves the store as it was.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;

use crate::collaborators::{
    call_with_timeout, Collaborators, DescriptionGenerator, FeatureBag,
    DEFAULT_COLLABORATOR_TIMEOUT_MS,
};
use crate::error::{GraphError, Result};
use crate::graph::{read_store, store_image_features, write_store, GraphStore, SharedStore};
use crate::paths::{normalize_with_prefix, DEFAULT_PATH_PREFIX};
use crate::similarity::{plan_edges, validate_embedding, validate_threshold, PairPlan, PairSide};
use crate::storage::EdgeRecord;

/// Cooperative cancellation flag, checked between items.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(GraphError::Cancelled)
        } else {
            Ok(())
        }
    }
}

#[derive(Debug, Clone)]
pub struct BuildOptions {
    /// Minimum similarity for an edge
    pub threshold: f32,
    pub with_descriptions: bool,
    pub with_features: bool,
    pub cancel: CancelToken,
    /// Deadline for each collaborator call; `None` runs calls inline without one
    pub timeout: Option<Duration>,
    /// Plan pairs on the rayon pool
    pub parallel: bool,
    /// Prefix stripped before taking the file name as key
    pub path_prefix: String,
}

impl Default for BuildOptions {
    fn default() -> Self {
        Self {
            threshold: 0.35,
            with_descriptions: false,
            with_features: false,
            cancel: CancelToken::new(),
            timeout: Some(Duration::from_millis(DEFAULT_COLLABORATOR_TIMEOUT_MS)),
            parallel: true,
            path_prefix: DEFAULT_PATH_PREFIX.to_string(),
        }
    }
}

impl BuildOptions {
    pub fn with_threshold(mut self, threshold: f32) -> Self {
        self.threshold = threshold;
        self
    }

    pub fn with_descriptions(mut self, enabled: bool) -> Self {
        self.with_descriptions = enabled;
        self
    }

    pub fn with_features(mut self, enabled: bool) -> Self {
        self.with_features = enabled;
        self
    }

    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_parallel(mut self, parallel: bool) -> Self {
        self.parallel = parallel;
        self
    }
}

/// Outcome of a full rebuild.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct BuildReport {
    pub total_images: usize,
    pub successful_nodes: usize,
    pub failed_nodes: usize,
    /// Later occurrences of a key already seen in the same batch
    pub duplicate_keys: usize,
    pub descriptions_generated: usize,
    pub description_failures: usize,
    pub features_stored: usize,
    pub feature_failures: usize,
    /// Pairs whose similarity could not be computed or stored
    pub pair_failures: usize,
    pub edges_created: usize,
    pub elapsed_ms: u64,
}

/// Outcome of an incremental update.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct UpdateReport {
    pub initial_count: usize,
    pub added_count: usize,
    pub failed_count: usize,
    /// Inputs whose key already had a node
    pub skipped_existing: usize,
    pub duplicate_keys: usize,
    pub final_count: usize,
    pub new_relationships: usize,
    pub elapsed_ms: u64,
}

// ── Staging ────────────────────────────────────────────────────────

struct StagedImage {
    key: String,
    source: PathBuf,
    embedding: Vec<f32>,
    description: Option<String>,
    features: Option<FeatureBag>,
}

#[derive(Default)]
struct StageTally {
    failed: usize,
    duplicates: usize,
    skipped_existing: usize,
    descriptions_generated: usize,
    description_failures: usize,
    feature_failures: usize,
}

#[derive(Default)]
struct CommitTally {
    created: usize,
    create_failures: usize,
    features_stored: usize,
    feature_failures: usize,
    edges_created: usize,
    pair_failures: usize,
}

fn guarded<T, F, E>(timeout: Option<Duration>, call: F, timed_out: E) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T> + Send + 'static,
    E: FnOnce() -> GraphError,
{
    call_with_timeout(timeout, call).unwrap_or_else(|| Err(timed_out()))
}

fn timeout_reason(timeout: Option<Duration>) -> String {
    match timeout {
        Some(t) => format!("timed out after {}ms", t.as_millis()),
        None => "timed out".to_string(),
    }
}

fn check_dimension(embedding: Vec<f32>, expected: Option<usize>) -> Result<Vec<f32>> {
    validate_embedding(&embedding)?;
    match expected {
        Some(dim) if dim != embedding.len() => Err(GraphError::Computation(format!(
            "dimension mismatch: {} vs {}",
            embedding.len(),
            dim
        ))),
        _ => Ok(embedding),
    }
}

/// Run the collaborators over `images`. Keys in `skip` are left out.
fn stage(
    images: &[PathBuf],
    skip: &HashSet<String>,
    expected_dim: Option<usize>,
    collaborators: &Collaborators,
    options: &BuildOptions,
    tally: &mut StageTally,
) -> Result<Vec<StagedImage>> {
    let mut staged: Vec<StagedImage> = Vec::with_capacity(images.len());
    let mut seen: HashSet<String> = HashSet::new();
    let mut dim = expected_dim;

    for path in images {
        options.cancel.check()?;

        let key = normalize_with_prefix(&path.to_string_lossy(), &options.path_prefix);
        if key.is_empty() {
            tracing::warn!("Skipping {}: no file name", path.display());
            tally.failed += 1;
            continue;
        }
        if skip.contains(&key) {
            tally.skipped_existing += 1;
            continue;
        }
        if !seen.insert(key.clone()) {
            tracing::debug!("Duplicate key {} from {}", key, path.display());
            tally.duplicates += 1;
            continue;
        }

        let embedder = Arc::clone(&collaborators.embedder);
        let source = path.clone();
        let embedded = guarded(
            options.timeout,
            move || embedder.embed(&source),
            || GraphError::EmbeddingFailed {
                path: path.display().to_string(),
                reason: timeout_reason(options.timeout),
            },
        )
        .and_then(|v| check_dimension(v, dim));

        match embedded {
            Ok(embedding) => {
                dim.get_or_insert(embedding.len());
                staged.push(StagedImage {
                    key,
                    source: path.clone(),
                    embedding,
                    description: None,
                    features: None,
                });
            }
            Err(e) => {
                tracing::warn!("Failed to embed {}: {}", path.display(), e);
                tally.failed += 1;
            }
        }
    }

    if options.with_descriptions {
        if let Some(describer) = &collaborators.describer {
            describe_all(describer, &mut staged, options, tally)?;
        }
    }

    if options.with_features {
        if let Some(extractor) = &collaborators.extractor {
            for image in staged.iter_mut() {
                options.cancel.check()?;
                let worker = Arc::clone(extractor);
                let source = image.source.clone();
                let result = guarded(
                    options.timeout,
                    move || worker.extract(&source),
                    || GraphError::ExtractionFailed {
                        path: image.source.display().to_string(),
                        reason: timeout_reason(options.timeout),
                    },
                );
                match result {
                    Ok(bag) => image.features = Some(bag),
                    Err(e) => {
                        tracing::warn!("Feature extraction failed for {}: {}", image.key, e);
                        tally.feature_failures += 1;
                    }
                }
            }
        }
    }

    Ok(staged)
}

fn describe_all(
    describer: &Arc<dyn DescriptionGenerator>,
    staged: &mut [StagedImage],
    options: &BuildOptions,
    tally: &mut StageTally,
) -> Result<()> {
    if staged.is_empty() {
        return Ok(());
    }

    if describer.supports_batch() {
        options.cancel.check()?;
        let worker = Arc::clone(describer);
        let sources: Vec<PathBuf> = staged.iter().map(|s| s.source.clone()).collect();
        let batch = guarded(
            options.timeout,
            move || worker.describe_batch(&sources),
            || GraphError::DescriptionFailed {
                path: format!("batch of {}", staged.len()),
                reason: timeout_reason(options.timeout),
            },
        );
        match batch {
            Ok(mut texts) => {
                for image in staged.iter_mut() {
                    image.description = texts.remove(&image.source);
                    if image.description.is_some() {
                        tally.descriptions_generated += 1;
                    } else {
                        tally.description_failures += 1;
                    }
                }
                return Ok(());
            }
            Err(e) => tracing::warn!("Batch description failed, describing one by one: {}", e),
        }
    }

    for image in staged.iter_mut() {
        options.cancel.check()?;
        let worker = Arc::clone(describer);
        let source = image.source.clone();
        let result = guarded(
            options.timeout,
            move || worker.describe(&source),
            || GraphError::DescriptionFailed {
                path: image.source.display().to_string(),
                reason: timeout_reason(options.timeout),
            },
        );
        match result {
            Ok(text) => {
                image.description = Some(text);
                tally.descriptions_generated += 1;
            }
            Err(e) => {
                tracing::warn!("Description failed for {}: {}", image.key, e);
                tally.description_failures += 1;
            }
        }
    }
    Ok(())
}

// ── Commit ─────────────────────────────────────────────────────────

fn side_id(
    store: &dyn GraphStore,
    side: PairSide,
    fresh_ids: &[Option<u128>],
    existing_keys: &[String],
    resolved: &mut HashMap<usize, Option<u128>>,
) -> Result<Option<u128>> {
    match side {
        PairSide::Fresh(i) => Ok(fresh_ids.get(i).copied().flatten()),
        PairSide::Existing(j) => {
            if let Some(id) = resolved.get(&j) {
                return Ok(*id);
            }
            let id = match existing_keys.get(j) {
                Some(key) => store.find_image_by_key(key)?.map(|image| image.id),
                None => None,
            };
            resolved.insert(j, id);
            Ok(id)
        }
    }
}

/// Apply staged images and planned edges. Caller holds the write lock.
///
/// Store failures abort with an error; anything else is counted.
fn commit(
    store: &mut dyn GraphStore,
    staged: Vec<StagedImage>,
    plan: &PairPlan,
    existing_keys: &[String],
) -> Result<CommitTally> {
    let mut tally = CommitTally::default();
    let mut fresh_ids: Vec<Option<u128>> = Vec::with_capacity(staged.len());

    for image in staged {
        let id = match store.create_image_node(&image.key, image.embedding, image.description) {
            Ok(id) => id,
            Err(e) if e.is_store_failure() => return Err(e),
            Err(e) => {
                tracing::warn!("Failed to create node for {}: {}", image.key, e);
                tally.create_failures += 1;
                fresh_ids.push(None);
                continue;
            }
        };
        tally.created += 1;
        fresh_ids.push(Some(id));

        if let Some(bag) = &image.features {
            match store_image_features(store, &image.key, bag) {
                Ok(true) => tally.features_stored += 1,
                Ok(false) => tally.feature_failures += 1,
                Err(e) if e.is_store_failure() => return Err(e),
                Err(e) => {
                    tracing::warn!("Failed to store features for {}: {}", image.key, e);
                    tally.feature_failures += 1;
                }
            }
        }
    }

    let mut resolved: HashMap<usize, Option<u128>> = HashMap::new();
    for edge in &plan.edges {
        let left = side_id(&*store, edge.left, &fresh_ids, existing_keys, &mut resolved)?;
        let right = side_id(&*store, edge.right, &fresh_ids, existing_keys, &mut resolved)?;
        let (Some(a), Some(b)) = (left, right) else {
            tally.pair_failures += 1;
            continue;
        };
        match store.merge_edge(EdgeRecord::similar(a, b, edge.similarity)) {
            Ok(()) => tally.edges_created += 1,
            Err(e) if e.is_store_failure() => return Err(e),
            Err(e) => {
                tracing::warn!("Failed to create similarity edge: {}", e);
                tally.pair_failures += 1;
            }
        }
    }

    store.flush()?;
    Ok(tally)
}

// ── Entry points ───────────────────────────────────────────────────

/// Replace the whole graph with one built from `images`.
///
/// Per-image collaborator failures are counted in the report. Store
/// failures and cancellation return an error; cancellation before the
/// commit leaves the previous graph untouched.
pub fn rebuild_graph(
    store: &SharedStore,
    images: &[PathBuf],
    collaborators: &Collaborators,
    options: &BuildOptions,
) -> Result<BuildReport> {
    validate_threshold(options.threshold)?;
    let started = Instant::now();
    tracing::info!(
        "Rebuilding similarity graph from {} images (threshold {})",
        images.len(),
        options.threshold
    );

    let mut stage_tally = StageTally::default();
    let staged = stage(images, &HashSet::new(), None, collaborators, options, &mut stage_tally)?;

    options.cancel.check()?;
    let plan = {
        let fresh: Vec<&[f32]> = staged.iter().map(|s| s.embedding.as_slice()).collect();
        plan_edges(&fresh, &[], options.threshold, options.parallel)
    };
    tracing::info!(
        "Planned {} edges from {} comparisons ({} failed)",
        plan.edges.len(),
        plan.comparisons,
        plan.failures
    );
    options.cancel.check()?;

    let commit_tally = {
        let mut guard = write_store(store);
        guard.clear_all()?;
        commit(guard.as_mut(), staged, &plan, &[])?
    };

    let report = BuildReport {
        total_images: images.len(),
        successful_nodes: commit_tally.created,
        failed_nodes: stage_tally.failed + commit_tally.create_failures,
        duplicate_keys: stage_tally.duplicates,
        descriptions_generated: stage_tally.descriptions_generated,
        description_failures: stage_tally.description_failures,
        features_stored: commit_tally.features_stored,
        feature_failures: stage_tally.feature_failures + commit_tally.feature_failures,
        pair_failures: plan.failures + commit_tally.pair_failures,
        edges_created: commit_tally.edges_created,
        elapsed_ms: started.elapsed().as_millis() as u64,
    };
    tracing::info!(
        "Rebuild complete: {} nodes, {} failed, {} edges in {}ms",
        report.successful_nodes,
        report.failed_nodes,
        report.edges_created,
        report.elapsed_ms
    );
    Ok(report)
}

/// Add the images in `images` that are not in the graph yet.
///
/// New images are compared with every existing image (embeddings read back
/// from the store) and with each other; existing pairs are left alone.
pub fn update_graph(
    store: &SharedStore,
    images: &[PathBuf],
    collaborators: &Collaborators,
    options: &BuildOptions,
) -> Result<UpdateReport> {
    validate_threshold(options.threshold)?;
    let started = Instant::now();

    let existing = read_store(store).list_image_embeddings()?;
    let initial_count = existing.len();
    let existing_keys: Vec<String> = existing.iter().map(|(k, _)| k.clone()).collect();
    let skip: HashSet<String> = existing_keys.iter().cloned().collect();
    let expected_dim = existing.first().map(|(_, v)| v.len());
    tracing::info!(
        "Updating similarity graph: {} existing images, {} candidates",
        initial_count,
        images.len()
    );

    let mut stage_tally = StageTally::default();
    let staged = stage(images, &skip, expected_dim, collaborators, options, &mut stage_tally)?;

    options.cancel.check()?;
    let plan = {
        let fresh: Vec<&[f32]> = staged.iter().map(|s| s.embedding.as_slice()).collect();
        let old: Vec<&[f32]> = existing.iter().map(|(_, v)| v.as_slice()).collect();
        plan_edges(&fresh, &old, options.threshold, options.parallel)
    };
    options.cancel.check()?;

    let (commit_tally, final_count) = {
        let mut guard = write_store(store);
        let tally = commit(guard.as_mut(), staged, &plan, &existing_keys)?;
        (tally, guard.count_images()?)
    };

    let report = UpdateReport {
        initial_count,
        added_count: commit_tally.created,
        failed_count: stage_tally.failed + commit_tally.create_failures,
        skipped_existing: stage_tally.skipped_existing,
        duplicate_keys: stage_tally.duplicates,
        final_count,
        new_relationships: commit_tally.edges_created,
        elapsed_ms: started.elapsed().as_millis() as u64,
    };
    tracing::info!(
        "Update complete: {} -> {} images, {} added, {} failed, {} new relationships",
        report.initial_count,
        report.final_count,
        report.added_count,
        report.failed_count,
        report.new_relationships
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::{BasicFeatures, Embedder, FeatureExtractor};
    use crate::graph::MemoryGraphStore;
    use crate::storage::EdgeKind;
    use std::collections::BTreeMap;
    use std::path::Path;
    use std::sync::atomic::AtomicUsize;
    use std::sync::RwLock;

    fn at_angle(rad: f32) -> Vec<f32> {
        vec![rad.cos(), rad.sin()]
    }

    /// A=(1,0), B at sim 0.8 from A, C at sim 0.9 from B (and ~0.46 from A).
    fn abc_vectors() -> HashMap<String, Vec<f32>> {
        HashMap::from([
            ("a.jpg".to_string(), at_angle(0.0)),
            ("b.jpg".to_string(), at_angle(0.8f32.acos())),
            ("c.jpg".to_string(), at_angle(0.8f32.acos() + 0.9f32.acos())),
        ])
    }

    fn table_embedder(table: HashMap<String, Vec<f32>>) -> Arc<dyn Embedder> {
        Arc::new(move |p: &Path| -> Result<Vec<f32>> {
            let name = p.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_default();
            table.get(&name).cloned().ok_or(GraphError::EmbeddingFailed {
                path: p.display().to_string(),
                reason: "no vector".into(),
            })
        })
    }

    fn new_store() -> SharedStore {
        RwLock::new(Box::new(MemoryGraphStore::create_ephemeral()))
    }

    fn paths(names: &[&str]) -> Vec<PathBuf> {
        names.iter().map(|n| PathBuf::from(format!("images/{}", n))).collect()
    }

    fn opts() -> BuildOptions {
        BuildOptions::default().with_threshold(0.5)
    }

    #[test]
    fn test_rebuild_threshold_edges() {
        let store = new_store();
        let collab = Collaborators::new(table_embedder(abc_vectors()));

        let report =
            rebuild_graph(&store, &paths(&["a.jpg", "b.jpg", "c.jpg"]), &collab, &opts()).unwrap();

        assert_eq!(report.total_images, 3);
        assert_eq!(report.successful_nodes, 3);
        assert_eq!(report.failed_nodes, 0);
        assert_eq!(report.edges_created, 2);

        let guard = read_store(&store);
        assert_eq!(guard.count_edges(Some(EdgeKind::SimilarTo)).unwrap(), 2);
        let a = guard.find_image_by_key("a.jpg").unwrap().unwrap();
        let from_a = guard.similar_neighbors(a.id, 0.5, 10).unwrap();
        assert_eq!(from_a.len(), 1);
        assert_eq!(from_a[0].path, "b.jpg");
    }

    #[test]
    fn test_rebuild_replaces_previous_graph() {
        let store = new_store();
        let collab = Collaborators::new(table_embedder(abc_vectors()));
        rebuild_graph(&store, &paths(&["a.jpg", "b.jpg", "c.jpg"]), &collab, &opts()).unwrap();

        let report = rebuild_graph(&store, &paths(&["a.jpg"]), &collab, &opts()).unwrap();

        assert_eq!(report.successful_nodes, 1);
        let guard = read_store(&store);
        assert_eq!(guard.list_all_image_paths().unwrap(), vec!["a.jpg"]);
        assert_eq!(guard.count_edges(None).unwrap(), 0);
    }

    #[test]
    fn test_failures_are_isolated() {
        let store = new_store();
        let mut table = abc_vectors();
        table.insert("zero.jpg".into(), vec![0.0, 0.0]);
        table.insert("wide.jpg".into(), vec![1.0, 0.0, 0.0]);
        let collab = Collaborators::new(table_embedder(table));

        let report = rebuild_graph(
            &store,
            &paths(&["a.jpg", "missing.jpg", "zero.jpg", "wide.jpg", "b.jpg"]),
            &collab,
            &opts(),
        )
        .unwrap();

        assert_eq!(report.total_images, 5);
        assert_eq!(report.successful_nodes, 2);
        assert_eq!(report.failed_nodes, 3);
        assert_eq!(report.edges_created, 1);
    }

    #[test]
    fn test_duplicate_keys_first_wins() {
        let store = new_store();
        let collab = Collaborators::new(table_embedder(abc_vectors()));
        let images = vec![
            PathBuf::from("/one/a.jpg"),
            PathBuf::from("/two/a.jpg"),
            PathBuf::from("images/b.jpg"),
        ];

        let report = rebuild_graph(&store, &images, &collab, &opts()).unwrap();

        assert_eq!(report.successful_nodes, 2);
        assert_eq!(report.duplicate_keys, 1);
        assert_eq!(report.edges_created, 1);
    }

    #[test]
    fn test_cancelled_rebuild_leaves_store_untouched() {
        let store = new_store();
        let collab = Collaborators::new(table_embedder(abc_vectors()));
        rebuild_graph(&store, &paths(&["a.jpg", "b.jpg"]), &collab, &opts()).unwrap();

        let cancel = CancelToken::new();
        cancel.cancel();
        let err = rebuild_graph(&store, &paths(&["c.jpg"]), &collab, &opts().with_cancel(cancel))
            .unwrap_err();

        assert!(matches!(err, GraphError::Cancelled));
        let guard = read_store(&store);
        assert_eq!(guard.list_all_image_paths().unwrap(), vec!["a.jpg", "b.jpg"]);
        assert_eq!(guard.count_edges(None).unwrap(), 1);
    }

    #[test]
    fn test_invalid_threshold_rejected() {
        let store = new_store();
        let collab = Collaborators::new(table_embedder(abc_vectors()));
        let err = rebuild_graph(&store, &paths(&["a.jpg"]), &collab, &opts().with_threshold(1.5))
            .unwrap_err();
        assert!(matches!(err, GraphError::InvalidThreshold(_)));
    }

    #[test]
    fn test_embed_timeout_counts_as_failure() {
        let store = new_store();
        let slow: Arc<dyn Embedder> = Arc::new(|p: &Path| -> Result<Vec<f32>> {
            if p.ends_with("slow.jpg") {
                std::thread::sleep(Duration::from_millis(500));
            }
            Ok(vec![1.0, 0.0])
        });
        let collab = Collaborators::new(slow);

        let report = rebuild_graph(
            &store,
            &paths(&["fast.jpg", "slow.jpg"]),
            &collab,
            &opts().with_timeout(Some(Duration::from_millis(50))),
        )
        .unwrap();

        assert_eq!(report.successful_nodes, 1);
        assert_eq!(report.failed_nodes, 1);
    }

    #[test]
    fn test_default_options_bound_a_hanging_embedder() {
        let store = new_store();
        let hanging: Arc<dyn Embedder> = Arc::new(|p: &Path| -> Result<Vec<f32>> {
            if p.ends_with("hang.jpg") {
                std::thread::sleep(Duration::from_secs(3600));
            }
            Ok(vec![1.0, 0.0])
        });
        let options = BuildOptions::default();
        assert_eq!(options.timeout, Some(Duration::from_millis(DEFAULT_COLLABORATOR_TIMEOUT_MS)));

        let started = Instant::now();
        let report = rebuild_graph(
            &store,
            &paths(&["a.jpg", "hang.jpg", "b.jpg"]),
            &Collaborators::new(hanging),
            &options,
        )
        .unwrap();

        assert!(started.elapsed() < Duration::from_secs(120));
        assert_eq!(report.successful_nodes, 2);
        assert_eq!(report.failed_nodes, 1);
        assert_eq!(read_store(&store).count_images().unwrap(), 2);
    }

    struct BatchDescriber {
        fail_batch: bool,
        batch_calls: AtomicUsize,
        single_calls: AtomicUsize,
    }

    impl BatchDescriber {
        fn new(fail_batch: bool) -> Self {
            Self { fail_batch, batch_calls: AtomicUsize::new(0), single_calls: AtomicUsize::new(0) }
        }
    }

    impl DescriptionGenerator for BatchDescriber {
        fn describe(&self, image: &Path) -> Result<String> {
            self.single_calls.fetch_add(1, Ordering::SeqCst);
            Ok(format!("single {}", image.display()))
        }

        fn supports_batch(&self) -> bool {
            true
        }

        fn describe_batch(&self, images: &[PathBuf]) -> Result<BTreeMap<PathBuf, String>> {
            self.batch_calls.fetch_add(1, Ordering::SeqCst);
            if self.fail_batch {
                return Err(GraphError::DescriptionFailed {
                    path: "batch".into(),
                    reason: "model offline".into(),
                });
            }
            // Leaves the last image out
            Ok(images
                .iter()
                .take(images.len().saturating_sub(1))
                .map(|p| (p.clone(), format!("batch {}", p.display())))
                .collect())
        }
    }

    #[test]
    fn test_batch_descriptions() {
        let store = new_store();
        let describer = Arc::new(BatchDescriber::new(false));
        let collab = Collaborators::new(table_embedder(abc_vectors())).with_describer(describer.clone());

        let report = rebuild_graph(
            &store,
            &paths(&["a.jpg", "b.jpg", "c.jpg"]),
            &collab,
            &opts().with_descriptions(true),
        )
        .unwrap();

        assert_eq!(describer.batch_calls.load(Ordering::SeqCst), 1);
        assert_eq!(describer.single_calls.load(Ordering::SeqCst), 0);
        assert_eq!(report.descriptions_generated, 2);
        assert_eq!(report.description_failures, 1);
        let a = read_store(&store).find_image_by_key("a.jpg").unwrap().unwrap();
        assert_eq!(a.description.as_deref(), Some("batch images/a.jpg"));
    }

    #[test]
    fn test_batch_failure_falls_back_to_single() {
        let store = new_store();
        let describer = Arc::new(BatchDescriber::new(true));
        let collab = Collaborators::new(table_embedder(abc_vectors())).with_describer(describer.clone());

        let report = rebuild_graph(
            &store,
            &paths(&["a.jpg", "b.jpg"]),
            &collab,
            &opts().with_descriptions(true),
        )
        .unwrap();

        assert_eq!(describer.single_calls.load(Ordering::SeqCst), 2);
        assert_eq!(report.descriptions_generated, 2);
        let b = read_store(&store).find_image_by_key("b.jpg").unwrap().unwrap();
        assert_eq!(b.description.as_deref(), Some("single images/b.jpg"));
    }

    #[test]
    fn test_descriptions_skipped_when_disabled() {
        let store = new_store();
        let describer = Arc::new(BatchDescriber::new(false));
        let collab = Collaborators::new(table_embedder(abc_vectors())).with_describer(describer.clone());

        let report = rebuild_graph(&store, &paths(&["a.jpg"]), &collab, &opts()).unwrap();

        assert_eq!(report.descriptions_generated, 0);
        assert_eq!(describer.batch_calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_features_stored_best_effort() {
        let store = new_store();
        let extractor: Arc<dyn FeatureExtractor> = Arc::new(|p: &Path| -> Result<FeatureBag> {
            if p.ends_with("c.jpg") {
                return Err(GraphError::ExtractionFailed {
                    path: p.display().to_string(),
                    reason: "corrupt".into(),
                });
            }
            Ok(FeatureBag {
                basic: Some(BasicFeatures::from_dimensions(4, 3)),
                tags: vec!["landscape".into()],
                ..Default::default()
            })
        });
        let collab = Collaborators::new(table_embedder(abc_vectors())).with_extractor(extractor);

        let report = rebuild_graph(
            &store,
            &paths(&["a.jpg", "b.jpg", "c.jpg"]),
            &collab,
            &opts().with_features(true),
        )
        .unwrap();

        assert_eq!(report.successful_nodes, 3);
        assert_eq!(report.features_stored, 2);
        assert_eq!(report.feature_failures, 1);
        assert_eq!(read_store(&store).count_edges(Some(EdgeKind::HasTag)).unwrap(), 2);
    }

    #[test]
    fn test_update_compares_new_against_existing() {
        let store = new_store();
        let collab = Collaborators::new(table_embedder(abc_vectors()));
        rebuild_graph(&store, &paths(&["a.jpg", "b.jpg"]), &collab, &opts()).unwrap();

        let report =
            update_graph(&store, &paths(&["b.jpg", "c.jpg", "c.jpg"]), &collab, &opts()).unwrap();

        assert_eq!(report.initial_count, 2);
        assert_eq!(report.added_count, 1);
        assert_eq!(report.skipped_existing, 1);
        assert_eq!(report.duplicate_keys, 1);
        assert_eq!(report.failed_count, 0);
        assert_eq!(report.final_count, 3);
        assert_eq!(report.new_relationships, 1);

        let guard = read_store(&store);
        assert_eq!(guard.count_edges(Some(EdgeKind::SimilarTo)).unwrap(), 2);
    }

    #[test]
    fn test_update_with_nothing_new() {
        let store = new_store();
        let collab = Collaborators::new(table_embedder(abc_vectors()));
        rebuild_graph(&store, &paths(&["a.jpg"]), &collab, &opts()).unwrap();

        let report = update_graph(&store, &paths(&["a.jpg"]), &collab, &opts()).unwrap();

        assert_eq!(report.added_count, 0);
        assert_eq!(report.new_relationships, 0);
        assert_eq!(report.final_count, 1);
    }

    #[test]
    fn test_update_rejects_dimension_mismatch() {
        let store = new_store();
        let mut table = abc_vectors();
        table.insert("wide.jpg".into(), vec![1.0, 0.0, 0.0]);
        let collab = Collaborators::new(table_embedder(table));
        rebuild_graph(&store, &paths(&["a.jpg"]), &collab, &opts()).unwrap();

        let report = update_graph(&store, &paths(&["wide.jpg"]), &collab, &opts()).unwrap();

        assert_eq!(report.failed_count, 1);
        assert_eq!(report.final_count, 1);
    }
}
