//! get_probes tool — pull the single best-fit probe for the moment, and
//! feed back what the user did with it.

use std::sync::Arc;

use tapestry_core::Tapestry;

use super::{arg_str, arg_str_list, arg_u64};

pub fn schema() -> serde_json::Value {
    serde_json::json!({
        "type": "object",
        "properties": {
            "sessionId": {
                "type": "string",
                "description": "Conversation session (per-conversation probe cap)"
            },
            "activeTopics": {
                "type": "array",
                "items": {"type": "string"},
                "description": "Topics live in the conversation right now"
            },
            "entitiesInScope": {
                "type": "array",
                "items": {"type": "string"},
                "description": "Entities currently being discussed"
            },
            "channel": {"type": "string", "default": "chat"},
            "turnNumber": {
                "type": "integer",
                "description": "Current conversational turn (minimum turn gating)"
            }
        },
        "required": ["sessionId", "turnNumber"]
    })
}

pub fn feedback_schema() -> serde_json::Value {
    serde_json::json!({
        "type": "object",
        "properties": {
            "probeId": {"type": "string"},
            "feedback": {
                "type": "string",
                "enum": ["accepted", "ignored", "deflected"],
                "description": "What the user did with the delivered probe"
            }
        },
        "required": ["probeId", "feedback"]
    })
}

pub async fn execute(
    service: &Arc<Tapestry>,
    args: Option<serde_json::Value>,
) -> Result<serde_json::Value, String> {
    let session_id = arg_str(&args, "sessionId").ok_or("sessionId is required")?;
    let turn_number = arg_u64(&args, "turnNumber").ok_or("turnNumber is required")? as u32;
    let topics = arg_str_list(&args, "activeTopics");
    let entities = arg_str_list(&args, "entitiesInScope");

    let delivered = service
        .get_probes(&session_id, &topics, &entities, turn_number)
        .map_err(|e| e.to_string())?;

    Ok(match delivered {
        Some((probe, score)) => serde_json::json!({
            "probe": probe,
            "contextFit": (score * 1000.0).round() / 1000.0,
        }),
        None => serde_json::json!({ "probe": null }),
    })
}

pub async fn execute_feedback(
    service: &Arc<Tapestry>,
    args: Option<serde_json::Value>,
) -> Result<serde_json::Value, String> {
    let probe_id = arg_str(&args, "probeId").ok_or("probeId is required")?;
    let feedback = arg_str(&args, "feedback").ok_or("feedback is required")?;
    service.probe_feedback(&probe_id, &feedback).map_err(|e| e.to_string())?;
    Ok(serde_json::json!({ "applied": true }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::test_service;

    #[tokio::test]
    async fn test_empty_queue_returns_null_probe() {
        let (service, _dir) = test_service();
        let result = execute(
            &service,
            Some(serde_json::json!({"sessionId": "s1", "turnNumber": 5})),
        )
        .await
        .unwrap();
        assert!(result["probe"].is_null());
    }

    #[tokio::test]
    async fn test_feedback_on_unknown_probe_errors() {
        let (service, _dir) = test_service();
        let result = execute_feedback(
            &service,
            Some(serde_json::json!({"probeId": "nope", "feedback": "bogus"})),
        )
        .await;
        assert!(result.is_err());
    }

    #[test]
    fn test_schemas_are_valid() {
        assert_eq!(schema()["type"], "object");
        assert_eq!(feedback_schema()["properties"]["feedback"]["enum"][0], "accepted");
    }
}
