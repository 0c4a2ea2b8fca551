//! report_interaction tool — push one interaction event into the inbound
//! queue. Non-blocking: the ack returns before extraction runs.

use std::sync::Arc;

use tapestry_core::{InteractionEvent, Tapestry};

use super::{arg_f64, arg_str, arg_str_list, arg_u64};

pub fn schema() -> serde_json::Value {
    serde_json::json!({
        "type": "object",
        "properties": {
            "sessionId": {
                "type": "string",
                "description": "Conversation session identifier"
            },
            "turnNumber": {
                "type": "integer",
                "description": "Turn within the session; (sessionId, turnNumber) is the idempotency key"
            },
            "channel": {
                "type": "string",
                "description": "Channel tag (chat, voice, ...)",
                "default": "chat"
            },
            "text": {
                "type": "string",
                "description": "The user's utterance"
            },
            "entitiesHint": {
                "type": "array",
                "items": {"type": "string"},
                "description": "Entity names the agent already knows are in scope"
            },
            "sttConfidence": {
                "type": "number",
                "description": "Speech-to-text confidence (0-1) for voice channels"
            }
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

    let result = service.report_interaction(event).map_err(|e| e.to_string())?;
    Ok(serde_json::json!({
        "accepted": result == tapestry_core::EnqueueResult::Accepted,
        "duplicate": result == tapestry_core::EnqueueResult::Duplicate,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::test_service;

    #[tokio::test]
    async fn test_report_enqueues_and_dedupes() {
        let (service, _dir) = test_service();
        let args = serde_json::json!({
            "sessionId": "s1",
            "turnNumber": 1,
            "text": "My wife Lena loves Malbec"
        });

        let first = execute(&service, Some(args.clone())).await.unwrap();
        assert_eq!(first["accepted"], true);

        let second = execute(&service, Some(args)).await.unwrap();
        assert_eq!(second["duplicate"], true);
    }

    #[tokio::test]
    async fn test_report_requires_fields() {
        let (service, _dir) = test_service();
        let err = execute(&service, Some(serde_json::json!({"text": "hi"}))).await.unwrap_err();
        assert!(err.contains("sessionId"));
    }

    #[test]
    fn test_schema_is_valid() {
        let s = schema();
        assert_eq!(s["type"], "object");
        assert!(s["properties"]["sessionId"].is_object());
        assert!(s["required"].as_array().unwrap().len() >= 3);
    }
}
