//! get_starters tool — ranked system-initiated conversation openings.

use std::sync::Arc;

use tapestry_core::Tapestry;

use super::arg_u64;

pub fn schema() -> serde_json::Value {
    serde_json::json!({
        "type": "object",
        "properties": {
            "channel": {"type": "string", "default": "chat"},
            "maxResults": {
                "type": "integer",
                "description": "Maximum starters to return",
                "default": 3,
                "maximum": 10
            }
        }
    })
}

pub async fn execute(
    service: &Arc<Tapestry>,
    args: Option<serde_json::Value>,
) -> Result<serde_json::Value, String> {
    let max_results = arg_u64(&args, "maxResults").unwrap_or(3).min(10) as usize;
    let starters = service.get_starters(max_results).map_err(|e| e.to_string())?;
    Ok(serde_json::json!({ "starters": starters }))
}
