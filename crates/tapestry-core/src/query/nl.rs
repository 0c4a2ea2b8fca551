//! Natural-language query planner.
//!
//! Translates free-text questions ("what does my wife like?") into a
//! structured `QueryPlan` by showing the small LLM the current graph
//! schema. Unparseable plans fall back to a broad whole-graph search
//! ranked by recency × confidence — the safest answer to a question we
//! could not understand.

use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use tracing::{info, warn};

use crate::extraction::{repair_llm_json, LlmCapability};
use crate::store::{GraphStore, Result};

use super::structured::{query_subgraph, QueryRequest, QueryResult};

const PLANNER_SYSTEM_PROMPT: &str = "\
You are a query planner for a knowledge graph. Translate a natural language \
question into a structured graph query.

The knowledge graph contains these ENTITIES (nodes):
{entity_list}

The graph has these RELATION TYPES (edges):
{relation_list}

RULES:
- Identify which entities in the graph are relevant to the question.
- Identify which relation types would help answer it.
- Choose max_hops (1 = direct connections, 2 = two steps out).
- If the question names a person by relationship (\"my wife\"), resolve it \
to the actual entity name from the graph.
- If the question is very broad or no specific entity fits, return an empty \
entities list (this triggers a whole-graph search).
- If no specific relation types are needed, set relations to null.

Respond with ONLY valid JSON in this exact format, no other text:

{
  \"entities\": [\"name1\"],
  \"relations\": [\"relation1\"] ,
  \"minConfidence\": 0.0,
  \"maxHops\": 1,
  \"reasoning\": \"Brief explanation\"
}";

/// A structured plan produced by the planner; maps 1:1 onto
/// `QueryRequest` parameters.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryPlan {
    pub entities: Vec<String>,
    pub relations: Option<Vec<String>>,
    pub min_confidence: f64,
    pub max_hops: u32,
    pub reasoning: String,
    /// True when this is the broad fallback rather than a parsed plan
    pub fallback: bool,
}

impl QueryPlan {
    pub fn is_broad(&self) -> bool {
        self.entities.is_empty()
    }

    fn broad_fallback(reasoning: &str) -> Self {
        Self {
            entities: vec![],
            relations: None,
            min_confidence: 0.0,
            max_hops: 2,
            reasoning: reasoning.to_string(),
            fallback: true,
        }
    }
}

/// NL planner over the small LLM tier
pub struct NlPlanner {
    llm: Arc<LlmCapability>,
    store: Arc<GraphStore>,
}

impl NlPlanner {
    pub fn new(llm: Arc<LlmCapability>, store: Arc<GraphStore>) -> Self {
        Self { llm, store }
    }

    /// Translate a question into a plan. LLM failure or unparseable
    /// output gives the broad fallback; this never errors.
    pub async fn plan(&self, question: &str) -> Result<QueryPlan> {
        let system = self.build_system_prompt()?;
        let raw = match self.llm.complete(&system, question).await {
            Ok(raw) => raw,
            Err(e) => {
                warn!(error = %e, "planner LLM unavailable, broad fallback");
                return Ok(QueryPlan::broad_fallback("planner unavailable"));
            }
        };

        let Some(parsed) = repair_llm_json(&raw) else {
            warn!("planner output unparseable, broad fallback");
            return Ok(QueryPlan::broad_fallback("unparseable plan"));
        };

        let entities: Vec<String> = parsed
            .get("entities")
            .and_then(|v| v.as_array())
            .map(|items| {
                items
                    .iter()
                    .filter_map(|v| v.as_str())
                    .map(|s| s.to_string())
                    .collect()
            })
            .unwrap_or_default();
        let relations = parsed
            .get("relations")
            .and_then(|v| v.as_array())
            .map(|items| {
                items
                    .iter()
                    .filter_map(|v| v.as_str())
                    .map(|s| s.to_string())
                    .collect::<Vec<_>>()
            })
            .filter(|v: &Vec<String>| !v.is_empty());
        let min_confidence = parsed
            .get("minConfidence")
            .and_then(|v| v.as_f64())
            .unwrap_or(0.0)
            .clamp(0.0, 1.0);
        let max_hops =
            parsed.get("maxHops").and_then(|v| v.as_u64()).unwrap_or(1).min(10) as u32;
        let reasoning = parsed
            .get("reasoning")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string();

        let plan = QueryPlan {
            entities,
            relations,
            min_confidence,
            max_hops,
            reasoning,
            fallback: false,
        };
        info!(
            entities = plan.entities.len(),
            max_hops = plan.max_hops,
            broad = plan.is_broad(),
            "query plan ready"
        );
        Ok(plan)
    }

    /// Execute a plan against the structured engine. Broad plans are
    /// re-ranked by recency × confidence.
    pub fn execute(&self, plan: &QueryPlan) -> Result<QueryResult> {
        let request = QueryRequest {
            entities: if plan.entities.is_empty() { None } else { Some(plan.entities.clone()) },
            relations: plan.relations.clone(),
            min_confidence: plan.min_confidence,
            max_hops: plan.max_hops,
            include_inactive: false,
        };
        let mut result = query_subgraph(&self.store, &request)?;

        if plan.is_broad() {
            let now = Utc::now();
            result.edges.sort_by(|a, b| {
                let score = |e: &crate::graph::Edge| {
                    let age_days = (now - e.last_reinforced).num_hours() as f64 / 24.0;
                    let recency = 0.5_f64.powf(age_days.max(0.0) / 30.0);
                    recency * e.confidence
                };
                score(b).partial_cmp(&score(a)).unwrap_or(std::cmp::Ordering::Equal)
            });
        }
        Ok(result)
    }

    /// Plan + execute in one call.
    pub async fn query(&self, question: &str) -> Result<(QueryResult, QueryPlan)> {
        let plan = self.plan(question).await?;
        let result = self.execute(&plan)?;
        Ok((result, plan))
    }

    fn build_system_prompt(&self) -> Result<String> {
        let snapshot = self.store.snapshot(false)?;
        let entity_list = if snapshot.nodes.is_empty() {
            "  (graph is empty)".to_string()
        } else {
            snapshot
                .nodes
                .iter()
                .map(|n| format!("  - {} ({})", n.name, n.kind))
                .collect::<Vec<_>>()
                .join("\n")
        };
        let mut relation_types: Vec<&str> =
            snapshot.edges.iter().map(|e| e.relation.as_str()).collect();
        relation_types.sort_unstable();
        relation_types.dedup();
        let relation_list = if relation_types.is_empty() {
            "  (no relations yet)".to_string()
        } else {
            relation_types
                .iter()
                .map(|r| format!("  - {r}"))
                .collect::<Vec<_>>()
                .join("\n")
        };

        Ok(PLANNER_SYSTEM_PROMPT
            .replace("{entity_list}", &entity_list)
            .replace("{relation_list}", &relation_list))
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::confidence::ConfidenceParams;
    use crate::extraction::MockLanguageModel;
    use crate::graph::{EdgeInput, Episode, NodeInput, NodeKind};
    use serde_json::json;
    use tempfile::TempDir;

    fn planner_with(mock: Arc<MockLanguageModel>) -> (NlPlanner, TempDir) {
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
        store.create_edge(&loves, &cfg, "t").unwrap();

        let planner = NlPlanner::new(Arc::new(LlmCapability::small(mock)), store);
        (planner, dir)
    }

    #[tokio::test]
    async fn test_plan_parses_llm_output() {
        let mock = Arc::new(MockLanguageModel::new());
        mock.respond_when(
            "query planner",
            "wife",
            json!({
                "entities": ["Lena"],
                "relations": ["loves", "prefers"],
                "minConfidence": 0.0,
                "maxHops": 1,
                "reasoning": "User's wife is Lena"
            }),
        );
        let (planner, _dir) = planner_with(mock);

        let plan = planner.plan("what does my wife like?").await.unwrap();
        assert_eq!(plan.entities, vec!["Lena".to_string()]);
        assert_eq!(plan.relations.as_ref().unwrap().len(), 2);
        assert!(!plan.fallback);

        let result = planner.execute(&plan).unwrap();
        assert_eq!(result.edges.len(), 1);
        assert_eq!(result.edges[0].relation, "loves");
    }

    #[tokio::test]
    async fn test_unparseable_plan_falls_back_broad() {
        let mock = Arc::new(MockLanguageModel::new());
        mock.respond_raw("query planner", "anything", "I have no idea what you mean.");
        let (planner, _dir) = planner_with(mock);

        let plan = planner.plan("anything at all").await.unwrap();
        assert!(plan.fallback);
        assert!(plan.is_broad());
        assert_eq!(plan.max_hops, 2);

        // Broad execution still returns the whole graph
        let result = planner.execute(&plan).unwrap();
        assert_eq!(result.edges.len(), 1);
    }

    #[tokio::test]
    async fn test_llm_failure_falls_back_broad() {
        let mock = Arc::new(MockLanguageModel::new());
        mock.fail_next(5);
        let (planner, _dir) = planner_with(mock);
        let plan = planner.plan("what do you know?").await.unwrap();
        assert!(plan.fallback);
    }

    #[tokio::test]
    async fn test_schema_prompt_lists_graph_contents() {
        let mock = Arc::new(MockLanguageModel::new());
        let (planner, _dir) = planner_with(mock);
        let prompt = planner.build_system_prompt().unwrap();
        assert!(prompt.contains("Lena (person)"));
        assert!(prompt.contains("- loves"));
    }

    #[tokio::test]
    async fn test_plan_clamps_hops_and_confidence() {
        let mock = Arc::new(MockLanguageModel::new());
        mock.respond_when(
            "query planner",
            "everything",
            json!({
                "entities": [],
                "relations": null,
                "minConfidence": 7.5,
                "maxHops": 99,
                "reasoning": "broad"
            }),
        );
        let (planner, _dir) = planner_with(mock);
        let plan = planner.plan("tell me everything").await.unwrap();
        assert!(plan.min_confidence <= 1.0);
        assert!(plan.max_hops <= 10);
    }
}
