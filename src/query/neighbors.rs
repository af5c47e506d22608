//! Direct neighborhood of one image

use super::{resolve_image, GraphEdge, GraphNode, GraphView, NeighborQuery};
use crate::error::Result;
use crate::graph::GraphStore;

/// Center image plus its strongest neighbors above `query.threshold`.
///
/// An unresolvable center yields an empty view. Neighbors come back in
/// store order: similarity descending, node ID ascending on ties.
pub fn neighbors(
    store: &dyn GraphStore,
    raw: &str,
    prefix: &str,
    query: &NeighborQuery,
) -> Result<GraphView> {
    let Some(center) = resolve_image(store, raw, prefix)? else {
        tracing::debug!("No image node for {}", raw);
        return Ok(GraphView::empty());
    };

    let found = store.similar_neighbors(center.id, query.threshold, query.limit)?;

    let mut view = GraphView {
        nodes: Vec::with_capacity(found.len() + 1),
        edges: Vec::with_capacity(found.len()),
    };
    view.nodes.push(GraphNode::from_image(&center, true, None));
    for neighbor in &found {
        view.nodes.push(GraphNode::neighbor(neighbor, None));
        view.edges.push(GraphEdge::new(center.id, neighbor.id, neighbor.similarity));
    }
    Ok(view)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::paths::DEFAULT_PATH_PREFIX;
    use crate::query::test_support::{abc_store, store_with};

    fn query(threshold: f32, limit: usize) -> NeighborQuery {
        NeighborQuery { threshold, limit }
    }

    #[test]
    fn test_center_and_neighbors() {
        let store = abc_store();

        let view = neighbors(&store, "images/a.jpg", DEFAULT_PATH_PREFIX, &query(0.5, 10)).unwrap();

        assert_eq!(view.nodes.len(), 2);
        assert_eq!(view.nodes[0].path, "a.jpg");
        assert!(view.nodes[0].is_center);
        assert_eq!(view.nodes[1].path, "b.jpg");
        assert!(!view.nodes[1].is_center);
        assert!(view.nodes.iter().all(|n| n.level.is_none()));

        assert_eq!(view.edges.len(), 1);
        assert_eq!(view.edges[0].source, view.nodes[0].id);
        assert_eq!(view.edges[0].target, view.nodes[1].id);
        assert!((view.edges[0].weight - 0.8).abs() < 1e-6);
    }

    #[test]
    fn test_unknown_center_is_empty() {
        let store = abc_store();
        let view = neighbors(&store, "nope.jpg", DEFAULT_PATH_PREFIX, &query(0.5, 10)).unwrap();
        assert!(view.is_empty());
        assert!(view.edges.is_empty());
    }

    #[test]
    fn test_threshold_and_limit() {
        let store = store_with(
            &["hub.jpg", "n1.jpg", "n2.jpg", "n3.jpg", "n4.jpg"],
            &[
                ("hub.jpg", "n1.jpg", 0.55),
                ("hub.jpg", "n2.jpg", 0.95),
                ("hub.jpg", "n3.jpg", 0.75),
                ("hub.jpg", "n4.jpg", 0.45),
            ],
        );

        let view = neighbors(&store, "hub.jpg", DEFAULT_PATH_PREFIX, &query(0.5, 2)).unwrap();
        let paths: Vec<&str> = view.nodes.iter().skip(1).map(|n| n.path.as_str()).collect();
        assert_eq!(paths, vec!["n2.jpg", "n3.jpg"]);

        let all = neighbors(&store, "hub.jpg", DEFAULT_PATH_PREFIX, &query(0.5, 10)).unwrap();
        assert_eq!(all.nodes.len(), 4);

        let none = neighbors(&store, "hub.jpg", DEFAULT_PATH_PREFIX, &query(0.5, 0)).unwrap();
        assert_eq!(none.nodes.len(), 1);
        assert!(none.edges.is_empty());
    }

    #[test]
    fn test_description_carried() {
        let mut store = abc_store();
        let b = store.find_image_by_key("b.jpg").unwrap().unwrap();
        store.set_description(b.id, "a red car".into()).unwrap();

        let view = neighbors(&store, "a.jpg", DEFAULT_PATH_PREFIX, &query(0.5, 10)).unwrap();
        assert_eq!(view.nodes[1].description.as_deref(), Some("a red car"));
    }
}
