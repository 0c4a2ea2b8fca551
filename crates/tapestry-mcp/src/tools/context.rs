//! get_context tool — process one message and return relevant graph
//! context in a single call. The common per-turn agent operation.

use std::sync::Arc;

use tapestry_core::{InteractionEvent, Tapestry};

use super::{arg_f64, arg_str, arg_str_list, arg_u64};

pub fn schema() -> serde_json::Value {
    serde_json::json!({
        "type": "object",
        "properties": {
            "sessionId": {"type": "string"},
            "turnNumber": {"type": "integer"},
            "channel": {"type": "string", "default": "chat"},
            "text": {
                "type": "string",
                "description": "The user's message: extracted into the graph AND used as the context query"
            },
            "entitiesHint": {"type": "array", "items": {"type": "string"}},
            "sttConfidence": {"type": "number"}
        },
        "required": ["sessionId", "turnNumber", "text"]
    })
}

pub async fn execute(
    service: &Arc<Tapestry>,
    args: Option<serde_json::Value>,
) -> Result<serde_json::Value, String> {
    let session_id = arg_str(&args, "sessionId").ok_or("sessionId is required")?;
    let turn_number = arg_u64(&args, "turnNumber").ok_or("turnNumber is required")? as u32;
    let text = arg_str(&args, "text").ok_or("text is required")?;

    let mut event = InteractionEvent::new(session_id, turn_number, text);
    if let Some(channel) = arg_str(&args, "channel") {
        event.channel = channel;
    }
    event.entities_hint = arg_str_list(&args, "entitiesHint");
    event.stt_confidence = arg_f64(&args, "sttConfidence");

    let result = service.get_context(event).await.map_err(|e| e.to_string())?;
    serde_json::to_value(&result).map_err(|e| e.to_string())
}
