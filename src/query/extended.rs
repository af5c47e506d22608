//! Bounded breadth-first traversal
//!
//! Three limits apply at once: `depth` (levels below the center),
//! `limit_per_level` (neighbors fetched per expanded node) and `max_nodes`
//! (total nodes returned). Nodes are deduplicated by store ID and keep the
//! level at which they were first reached; edges are deduplicated by their
//! order-independent ID so a mutual edge appears once.

use std::collections::{HashSet, VecDeque};

use super::{resolve_image, ExtendedQuery, GraphEdge, GraphNode, GraphView};
use crate::error::Result;
use crate::graph::{edge_id, GraphStore};

pub fn extended_neighbors(
    store: &dyn GraphStore,
    raw: &str,
    prefix: &str,
    query: &ExtendedQuery,
) -> Result<GraphView> {
    let mut queue: VecDeque<(String, usize)> = VecDeque::new();
    queue.push_back((raw.to_string(), 0));
    let mut processed: HashSet<String> = HashSet::new();

    let mut view = GraphView::empty();
    let mut node_ids: HashSet<u128> = HashSet::new();
    let mut edge_ids: HashSet<String> = HashSet::new();

    while let Some((path, level)) = queue.pop_front() {
        if view.nodes.len() >= query.max_nodes {
            break;
        }
        if !processed.insert(path.clone()) {
            continue;
        }

        let resolved = if level == 0 {
            resolve_image(store, &path, prefix)?
        } else {
            store.find_image_by_key(&path)?
        };
        let Some(image) = resolved else {
            tracing::debug!("Skipping unresolved {} at level {}", path, level);
            continue;
        };
        processed.insert(image.path.clone());

        if node_ids.insert(image.id) {
            view.nodes.push(GraphNode::from_image(&image, level == 0, Some(level)));
        }

        if level >= query.depth {
            continue;
        }

        for neighbor in store.similar_neighbors(image.id, query.threshold, query.limit_per_level)? {
            if !node_ids.contains(&neighbor.id) {
                if view.nodes.len() >= query.max_nodes {
                    // Over the cap: no node, so no edge either
                    continue;
                }
                node_ids.insert(neighbor.id);
                view.nodes.push(GraphNode::neighbor(&neighbor, Some(level + 1)));
            }
            if !processed.contains(&neighbor.path) {
                queue.push_back((neighbor.path.clone(), level + 1));
            }
            if edge_ids.insert(edge_id(image.id, neighbor.id)) {
                view.edges.push(GraphEdge::new(image.id, neighbor.id, neighbor.similarity));
            }
        }
    }

    tracing::debug!(
        "Extended traversal from {}: {} nodes, {} edges",
        raw,
        view.nodes.len(),
        view.edges.len()
    );
    Ok(view)
}
