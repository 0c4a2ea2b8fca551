//! Context-block assembly — a compact, ranked description of what the
//! graph knows about the current conversational moment, under a token
//! budget.
//!
//! Relevance per fact:
//! `0.40 * entity_match + 0.25 * topic_match + 0.20 * confidence + 0.15 * recency`

use chrono::Utc;
use serde::Serialize;

use crate::graph::{fold_name, Edge, TemporalType};
use crate::queues::outbound::OutboundQueue;
use crate::store::{GraphStore, Result};

use super::structured::{query_subgraph, QueryRequest};

/// Chars-per-token heuristic used for the budget
const CHARS_PER_TOKEN: usize = 4;

/// A ranked, budgeted context packet for the agent
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ContextBlock {
    /// Rendered fact lines, highest relevance first
    pub facts: Vec<String>,
    /// Pending probes that fit the moment (not consumed)
    pub pending_probes: Vec<serde_json::Value>,
    /// Active wishes/reminders approaching expiry
    pub reminders: Vec<String>,
    pub tokens_used: usize,
    pub token_budget: usize,
}

/// Assemble a context block for the active entities and topics.
pub fn assemble_context_block(
    store: &GraphStore,
    outbound: &OutboundQueue,
    active_entities: &[String],
    active_topics: &[String],
    token_budget: usize,
) -> Result<ContextBlock> {
    let now = Utc::now();
    let mut block = ContextBlock { token_budget, ..Default::default() };

    // Pull the neighborhood of the active entities (or the whole graph
    // when nothing is active yet — cold start stays useful).
    let request = QueryRequest {
        entities: if active_entities.is_empty() {
            None
        } else {
            Some(active_entities.to_vec())
        },
        max_hops: 1,
        ..Default::default()
    };
    let subgraph = query_subgraph(store, &request)?;

    let folded_entities: Vec<String> = active_entities.iter().map(|e| fold_name(e)).collect();
    let folded_topics: Vec<String> = active_topics.iter().map(|t| fold_name(t)).collect();

    // Score and render every edge as a fact line.
    let mut scored: Vec<(f64, String)> = Vec::new();
    for edge in &subgraph.edges {
        let source = subgraph.nodes.iter().find(|n| n.id == edge.source_id);
        let target = subgraph.nodes.iter().find(|n| n.id == edge.target_id);
        let (Some(source), Some(target)) = (source, target) else { continue };

        let entity_match = if folded_entities.is_empty() {
            0.0
        } else {
            let hit = folded_entities
                .iter()
                .any(|e| source.matches_name(e) || target.matches_name(e));
            if hit { 1.0 } else { 0.0 }
        };
        let topic_match = if folded_topics.is_empty() {
            0.0
        } else {
            let hits = edge
                .context_tags
                .iter()
                .filter(|t| folded_topics.contains(&fold_name(t)))
                .count();
            (hits as f64 / folded_topics.len() as f64).min(1.0)
        };
        let age_days = (now - edge.last_reinforced).num_hours() as f64 / 24.0;
        let recency = 0.5_f64.powf(age_days.max(0.0) / 30.0);

        let relevance =
            0.40 * entity_match + 0.25 * topic_match + 0.20 * edge.confidence + 0.15 * recency;
        let line = render_fact(source.name.as_str(), edge, target.name.as_str());
        scored.push((relevance, line));
    }
    scored.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));

    // Fill under the budget, reserving a slice for probes and reminders.
    let budget_chars = token_budget.saturating_mul(CHARS_PER_TOKEN);
    let fact_budget = budget_chars.saturating_mul(7) / 10;
    let mut used_chars = 0usize;
    for (_, line) in scored {
        if used_chars + line.len() > fact_budget {
            break;
        }
        used_chars += line.len();
        block.facts.push(line);
    }

    // Pending probes that fit the moment, peeked not consumed.
    for (item, fit) in outbound.peek_matching(active_topics, active_entities, now, 3)? {
        let rendered = serde_json::json!({
            "id": item.id,
            "subtype": item.subtype,
            "contextFit": (fit * 1000.0).round() / 1000.0,
            "payload": item.payload,
        });
        let len = rendered.to_string().len();
        if used_chars + len > budget_chars {
            break;
        }
        used_chars += len;
        block.pending_probes.push(rendered);
    }

    // Wishes approaching expiry become reminders.
    for edge in &subgraph.edges {
        if edge.temporal_type != TemporalType::Wish {
            continue;
        }
        let Some(expiry) = edge.expiry else { continue };
        let days_left = (expiry - now).num_days();
        if !(0..=14).contains(&days_left) {
            continue;
        }
        let source = subgraph.nodes.iter().find(|n| n.id == edge.source_id);
        let target = subgraph.nodes.iter().find(|n| n.id == edge.target_id);
        if let (Some(source), Some(target)) = (source, target) {
            let line = format!(
                "{} {} {} (expires in {} days)",
                source.name, edge.relation, target.name, days_left
            );
            if used_chars + line.len() > budget_chars {
                break;
            }
            used_chars += line.len();
            block.reminders.push(line);
        }
    }

    block.tokens_used = used_chars.div_ceil(CHARS_PER_TOKEN);
    Ok(block)
}

fn render_fact(source: &str, edge: &Edge, target: &str) -> String {
    let mut line = format!("{} {} {} ({:.2})", source, edge.relation, target, edge.confidence);
    if edge.secondhand {
        line.push_str(" [secondhand]");
    }
    if edge.attribution_uncertain {
        line.push_str(" [uncertain]");
    }
    line
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::confidence::ConfidenceParams;
    use crate::graph::{EdgeInput, Episode, NodeInput, NodeKind};
    use crate::queues::outbound::{OutboundItem, ProbingLimits};
    use std::sync::Arc;
    use tempfile::TempDir;

    fn context_fixture() -> (Arc<GraphStore>, OutboundQueue, TempDir) {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(GraphStore::new(Some(dir.path().join("test.db"))).unwrap());
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
        let (lena, _) = store.upsert_node(&NodeInput::new(NodeKind::Person, "Lena"), "t").unwrap();
        let (malbec, _) =
            store.upsert_node(&NodeInput::new(NodeKind::Concept, "Malbec"), "t").unwrap();
        let mut loves = EdgeInput::new(lena.id, malbec.id, "loves", 0.9);
        loves.episode_id = Some("ep1".to_string());
        loves.context_tags = vec!["wine".to_string()];
        store.create_edge(&loves, &cfg, "t").unwrap();

        let outbound = OutboundQueue::new(Arc::clone(&store), ProbingLimits::default());
        (store, outbound, dir)
    }

    #[test]
    fn test_context_block_contains_relevant_fact() {
        let (store, outbound, _dir) = context_fixture();
        let block = assemble_context_block(
            &store,
            &outbound,
            &["Lena".to_string()],
            &["wine".to_string()],
            500,
        )
        .unwrap();
        assert_eq!(block.facts.len(), 1);
        assert!(block.facts[0].contains("Lena loves Malbec"));
        assert!(block.tokens_used <= block.token_budget);
    }

    #[test]
    fn test_tiny_budget_truncates_facts() {
        let (store, outbound, _dir) = context_fixture();
        let block =
            assemble_context_block(&store, &outbound, &["Lena".to_string()], &[], 1).unwrap();
        assert!(block.facts.is_empty());
    }

    #[test]
    fn test_pending_probe_included_when_matching() {
        let (store, outbound, _dir) = context_fixture();
        let mut probe = OutboundItem::probe(
            "preference-discovery",
            serde_json::json!({"question": "Does Lena prefer a vintage?"}),
        );
        probe.context_tags = vec!["wine".to_string()];
        probe.entities = vec!["Lena".to_string()];
        outbound.push(&probe, "test").unwrap();

        let block = assemble_context_block(
            &store,
            &outbound,
            &["Lena".to_string()],
            &["wine".to_string()],
            500,
        )
        .unwrap();
        assert_eq!(block.pending_probes.len(), 1);
        // Peeking does not consume
        assert_eq!(outbound.pending_count().unwrap(), 1);
    }

    #[test]
    fn test_cold_start_empty_graph() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(GraphStore::new(Some(dir.path().join("test.db"))).unwrap());
        let outbound = OutboundQueue::new(Arc::clone(&store), ProbingLimits::default());
        let block = assemble_context_block(&store, &outbound, &[], &[], 100).unwrap();
        assert!(block.facts.is_empty());
        assert!(block.pending_probes.is_empty());
        assert_eq!(block.tokens_used, 0);
    }
}
