//! get_provenance tool — the chain from an edge back to the episodes
//! and audit records that produced it.

use std::sync::Arc;

use tapestry_core::Tapestry;

use super::arg_str;

pub fn schema() -> serde_json::Value {
    serde_json::json!({
        "type": "object",
        "properties": {
            "edgeId": {
                "type": "string",
                "description": "The edge whose provenance to trace"
            }
        },
        "required": ["edgeId"]
    })
}

pub async fn execute(
    service: &Arc<Tapestry>,
    args: Option<serde_json::Value>,
) -> Result<serde_json::Value, String> {
    let edge_id = arg_str(&args, "edgeId").ok_or("edgeId is required")?;
    let chain = service.get_provenance(&edge_id).map_err(|e| e.to_string())?;
    serde_json::to_value(&chain).map_err(|e| e.to_string())
}
