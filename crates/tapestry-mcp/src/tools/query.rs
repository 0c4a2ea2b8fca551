//! query tool — structured subgraph retrieval.

use std::sync::Arc;

use tapestry_core::{QueryRequest, Tapestry};

use super::{arg_f64, arg_str_list, arg_u64};

pub fn schema() -> serde_json::Value {
    serde_json::json!({
        "type": "object",
        "properties": {
            "entities": {
                "type": "array",
                "items": {"type": "string"},
                "description": "Entity names to seed the traversal; omit for a whole-graph query"
            },
            "relations": {
                "type": "array",
                "items": {"type": "string"},
                "description": "Relation types to include; omit for all"
            },
            "minConfidence": {
                "type": "number",
                "description": "Minimum edge confidence (0-1)",
                "default": 0.0
            },
            "maxHops": {
                "type": "integer",
                "description": "BFS depth from the seed entities (0 = seeds only)",
                "default": 1,
                "maximum": 10
            }
        }
    })
}

pub async fn execute(
    service: &Arc<Tapestry>,
    args: Option<serde_json::Value>,
) -> Result<serde_json::Value, String> {
    let entities = arg_str_list(&args, "entities");
    let relations = arg_str_list(&args, "relations");
    let request = QueryRequest {
        entities: if entities.is_empty() { None } else { Some(entities) },
        relations: if relations.is_empty() { None } else { Some(relations) },
        min_confidence: arg_f64(&args, "minConfidence").unwrap_or(0.0).clamp(0.0, 1.0),
        max_hops: arg_u64(&args, "maxHops").unwrap_or(1).min(10) as u32,
        include_inactive: false,
    };

    let result = service.query(&request);
    serde_json::to_value(&result).map_err(|e| e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{ingest_wife_loves_malbec, test_service};

    #[tokio::test]
    async fn test_query_seeded() {
        let (service, _dir) = test_service();
        ingest_wife_loves_malbec(&service).await;

        let result = execute(
            &service,
            Some(serde_json::json!({"entities": ["Lena"], "maxHops": 1})),
        )
        .await
        .unwrap();
        assert_eq!(result["edges"].as_array().unwrap().len(), 2);
        assert_eq!(result["degraded"], false);
    }

    #[tokio::test]
    async fn test_query_whole_graph_on_empty_store() {
        let (service, _dir) = test_service();
        let result = execute(&service, None).await.unwrap();
        assert!(result["nodes"].as_array().unwrap().is_empty());
        assert!(result["edges"].as_array().unwrap().is_empty());
    }

    #[test]
    fn test_schema_is_valid() {
        let s = schema();
        assert_eq!(s["type"], "object");
        assert!(s["properties"]["maxHops"].is_object());
    }
}
