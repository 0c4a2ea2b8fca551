//! query_nl tool — natural-language graph query via the planner.

use std::sync::Arc;

use tapestry_core::Tapestry;

use super::arg_str;

pub fn schema() -> serde_json::Value {
    serde_json::json!({
        "type": "object",
        "properties": {
            "text": {
                "type": "string",
                "description": "Free-text question about the knowledge graph"
            }
        },
        "required": ["text"]
    })
}

pub async fn execute(
    service: &Arc<Tapestry>,
    args: Option<serde_json::Value>,
) -> Result<serde_json::Value, String> {
    let text = arg_str(&args, "text").ok_or("text is required")?;
    let (result, plan) = service.query_nl(&text).await;
    Ok(serde_json::json!({
        "subgraph": result,
        "plan": plan,
    }))
}
