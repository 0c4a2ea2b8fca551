//! Structured query engine — filtered subgraph retrieval.
//!
//! Two phases: resolve seed nodes from entity names (case-insensitive,
//! aliases included), then BFS out to `max_hops`. Edges are filtered by
//! relation and confidence; retracted, archived, and expired edges are
//! excluded unless `include_inactive` is set (audit only). Sealed nodes
//! never appear on this path.

use serde::Serialize;

use crate::graph::{Edge, Node, PrivacyLevel};
use crate::store::{GraphStore, Result};

/// Query parameters
#[derive(Debug, Clone, Default)]
pub struct QueryRequest {
    /// Entity names to seed from; None = whole graph
    pub entities: Option<Vec<String>>,
    /// Relation types to include; None = all
    pub relations: Option<Vec<String>>,
    pub min_confidence: f64,
    pub max_hops: u32,
    /// Audit only: include retracted/archived/expired edges
    pub include_inactive: bool,
}

/// Result of a structured graph query
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryResult {
    pub nodes: Vec<Node>,
    pub edges: Vec<Edge>,
    pub seed_node_ids: Vec<String>,
    pub hops_traversed: u32,
    /// Set when the store was unreachable and an empty result stands in;
    /// the agent treats this as "I do not know yet", not an error.
    pub degraded: bool,
}

impl QueryResult {
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty() && self.edges.is_empty()
    }

    pub fn degraded_empty() -> Self {
        Self { degraded: true, ..Default::default() }
    }
}

/// Execute a structured query against the store.
pub fn query_subgraph(store: &GraphStore, request: &QueryRequest) -> Result<QueryResult> {
    // Phase 1 — seed resolution.
    let (seed_ids, seeded) = match &request.entities {
        Some(names) if !names.is_empty() => {
            let mut ids = Vec::new();
            for name in names {
                if let Some(node) = store.resolve_name(name)? {
                    if !ids.contains(&node.id) {
                        ids.push(node.id);
                    }
                    continue;
                }
                // Fall back to substring match when no exact alias hits.
                for node in store.find_nodes(None, Some(name))? {
                    if !ids.contains(&node.id) {
                        ids.push(node.id);
                    }
                }
            }
            if ids.is_empty() {
                return Ok(QueryResult {
                    hops_traversed: request.max_hops,
                    ..Default::default()
                });
            }
            (ids, true)
        }
        _ => {
            let ids = store.find_nodes(None, None)?.into_iter().map(|n| n.id).collect();
            (ids, false)
        }
    };

    // Phase 2 — BFS expansion from the seeds.
    let mut reachable: Vec<String> = seed_ids.clone();
    if seeded && request.max_hops > 0 {
        let mut frontier = seed_ids.clone();
        for _ in 0..request.max_hops {
            let edges = store.adjacent_edges(
                &frontier,
                request.relations.as_deref(),
                request.min_confidence,
                request.include_inactive,
            )?;
            let mut next = Vec::new();
            for edge in &edges {
                for candidate in [&edge.source_id, &edge.target_id] {
                    if !reachable.contains(candidate) {
                        reachable.push(candidate.clone());
                        next.push(candidate.clone());
                    }
                }
            }
            if next.is_empty() {
                break;
            }
            frontier = next;
        }
    }

    // Phase 3 — collect nodes, dropping sealed ones.
    let mut nodes = Vec::new();
    for id in &reachable {
        if let Some(node) = store.get_node(id)? {
            if node.privacy < PrivacyLevel::Sealed {
                nodes.push(node);
            }
        }
    }
    let visible_ids: Vec<&String> = nodes.iter().map(|n| &n.id).collect();

    // Phase 4 — collect edges with both endpoints in the visible set.
    let mut edges = store.adjacent_edges(
        &reachable,
        request.relations.as_deref(),
        request.min_confidence,
        request.include_inactive,
    )?;
    edges.retain(|e| visible_ids.contains(&&e.source_id) && visible_ids.contains(&&e.target_id));

    // Order: confidence first, reinforcement recency as the tiebreaker.
    edges.sort_by(|a, b| {
        b.confidence
            .partial_cmp(&a.confidence)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(b.last_reinforced.cmp(&a.last_reinforced))
    });
    edges.dedup_by(|a, b| a.id == b.id);

    Ok(QueryResult {
        nodes,
        edges,
        seed_node_ids: seed_ids,
        hops_traversed: request.max_hops,
        degraded: false,
    })
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::confidence::ConfidenceParams;
    use crate::graph::{EdgeInput, Episode, NodeInput, NodeKind};
    use chrono::Utc;
    use tempfile::TempDir;

    fn seeded_store() -> (GraphStore, TempDir) {
        let dir = TempDir::new().unwrap();
        let store = GraphStore::new(Some(dir.path().join("test.db"))).unwrap();
        store
            .create_episode(&Episode {
                id: "ep1".to_string(),
                occurred_at: Utc::now(),
                session_id: "s1".to_string(),
                turn_number: 1,
                channel: "chat".to_string(),
                sentiment: 0.0,
                outcome: 0.0,
                edge_ids: vec![],
            })
            .unwrap();

        let cfg = ConfidenceParams::default();
        let (user, _) = store.upsert_node(&NodeInput::new(NodeKind::Person, "User"), "t").unwrap();
        let (lena, _) = store.upsert_node(&NodeInput::new(NodeKind::Person, "Lena"), "t").unwrap();
        let (malbec, _) =
            store.upsert_node(&NodeInput::new(NodeKind::Concept, "Malbec"), "t").unwrap();

        let mut married = EdgeInput::new(user.id.clone(), lena.id.clone(), "married_to", 0.9);
        married.episode_id = Some("ep1".to_string());
        store.create_edge(&married, &cfg, "t").unwrap();

        let mut loves = EdgeInput::new(lena.id.clone(), malbec.id.clone(), "loves", 0.85);
        loves.episode_id = Some("ep1".to_string());
        store.create_edge(&loves, &cfg, "t").unwrap();

        (store, dir)
    }

    #[test]
    fn test_seeded_one_hop() {
        let (store, _dir) = seeded_store();
        let result = query_subgraph(
            &store,
            &QueryRequest {
                entities: Some(vec!["Lena".to_string()]),
                max_hops: 1,
                ..Default::default()
            },
        )
        .unwrap();
        assert_eq!(result.seed_node_ids.len(), 1);
        assert_eq!(result.nodes.len(), 3); // Lena + User + Malbec
        assert_eq!(result.edges.len(), 2);
    }

    #[test]
    fn test_zero_hops_returns_edges_between_seeds_only() {
        let (store, _dir) = seeded_store();
        let result = query_subgraph(
            &store,
            &QueryRequest {
                entities: Some(vec!["Lena".to_string(), "Malbec".to_string()]),
                max_hops: 0,
                ..Default::default()
            },
        )
        .unwrap();
        assert_eq!(result.nodes.len(), 2);
        assert_eq!(result.edges.len(), 1);
        assert_eq!(result.edges[0].relation, "loves");
    }

    #[test]
    fn test_relation_filter() {
        let (store, _dir) = seeded_store();
        let result = query_subgraph(
            &store,
            &QueryRequest {
                entities: Some(vec!["Lena".to_string()]),
                relations: Some(vec!["loves".to_string()]),
                max_hops: 1,
                ..Default::default()
            },
        )
        .unwrap();
        assert_eq!(result.edges.len(), 1);
        assert_eq!(result.edges[0].relation, "loves");
    }

    #[test]
    fn test_min_confidence_filter() {
        let (store, _dir) = seeded_store();
        let result = query_subgraph(
            &store,
            &QueryRequest {
                entities: Some(vec!["Lena".to_string()]),
                min_confidence: 0.87,
                max_hops: 1,
                ..Default::default()
            },
        )
        .unwrap();
        assert_eq!(result.edges.len(), 1);
        assert_eq!(result.edges[0].relation, "married_to");
    }

    #[test]
    fn test_unknown_entity_gives_empty_result() {
        let (store, _dir) = seeded_store();
        let result = query_subgraph(
            &store,
            &QueryRequest {
                entities: Some(vec!["Zorp".to_string()]),
                max_hops: 2,
                ..Default::default()
            },
        )
        .unwrap();
        assert!(result.is_empty());
        assert!(!result.degraded);
    }

    #[test]
    fn test_whole_graph_query() {
        let (store, _dir) = seeded_store();
        let result = query_subgraph(&store, &QueryRequest::default()).unwrap();
        assert_eq!(result.nodes.len(), 3);
        assert_eq!(result.edges.len(), 2);
        // Ordered by descending confidence
        assert!(result.edges[0].confidence >= result.edges[1].confidence);
    }

    #[test]
    fn test_retracted_edges_excluded_by_default() {
        let (store, _dir) = seeded_store();
        let edges = store.edges(&crate::store::EdgeFilter::default()).unwrap();
        let loves = edges.iter().find(|e| e.relation == "loves").unwrap();
        store.retract_edge(&loves.id, "test", "t").unwrap();

        let result = query_subgraph(&store, &QueryRequest::default()).unwrap();
        assert_eq!(result.edges.len(), 1);

        let audit_view = query_subgraph(
            &store,
            &QueryRequest { include_inactive: true, ..Default::default() },
        )
        .unwrap();
        assert_eq!(audit_view.edges.len(), 2);
    }

    #[test]
    fn test_sealed_nodes_never_returned() {
        let (store, _dir) = seeded_store();
        let mut sealed = NodeInput::new(NodeKind::Person, "Hidden");
        sealed.privacy = crate::graph::PrivacyLevel::Sealed;
        store.upsert_node(&sealed, "t").unwrap();

        let result = query_subgraph(&store, &QueryRequest::default()).unwrap();
        assert!(!result.nodes.iter().any(|n| n.name == "Hidden"));
    }
}
