//! user_correction tool — explicit revise / delete / retract. Always
//! applied, never gated by confidence.

use std::sync::Arc;

use tapestry_core::{Tapestry, UserCorrection};

pub fn schema() -> serde_json::Value {
    serde_json::json!({
        "type": "object",
        "properties": {
            "kind": {
                "type": "string",
                "enum": ["revise", "delete", "retract"],
                "description": "revise replaces a value; delete erases physically; retract hides but keeps audit"
            },
            "entity": {
                "type": "string",
                "description": "Entity name or alias the correction applies to"
            },
            "relation": {
                "type": "string",
                "description": "Restrict to one relation (required for revise)"
            },
            "oldValue": {
                "type": "string",
                "description": "Current value, to disambiguate parallel edges"
            },
            "newValue": {
                "type": "string",
                "description": "Replacement value (required for revise)"
            }
        },
        "required": ["kind", "entity"]
    })
}

pub async fn execute(
    service: &Arc<Tapestry>,
    args: Option<serde_json::Value>,
) -> Result<serde_json::Value, String> {
    let args = args.ok_or("correction arguments required")?;
    let correction: UserCorrection =
        serde_json::from_value(args).map_err(|e| format!("invalid correction: {e}"))?;
    let outcome = service.user_correction(&correction).map_err(|e| e.to_string())?;
    serde_json::to_value(&outcome).map_err(|e| e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{ingest_wife_loves_malbec, test_service};

    #[tokio::test]
    async fn test_retract_correction() {
        let (service, _dir) = test_service();
        ingest_wife_loves_malbec(&service).await;

        let result = execute(
            &service,
            Some(serde_json::json!({
                "kind": "retract",
                "entity": "Lena",
                "relation": "loves"
            })),
        )
        .await
        .unwrap();
        assert_eq!(result["edgesRetracted"], 1);

        // Retracted edges are gone from queries
        let stats = service.store().stats().unwrap();
        assert_eq!(stats.active_edge_count, 1);
        assert_eq!(stats.total_edge_count, 2);
    }

    #[tokio::test]
    async fn test_unknown_entity_surfaces_error() {
        let (service, _dir) = test_service();
        let result = execute(
            &service,
            Some(serde_json::json!({"kind": "delete", "entity": "Zorp"})),
        )
        .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_unknown_field_rejected() {
        let (service, _dir) = test_service();
        let result = execute(
            &service,
            Some(serde_json::json!({"kind": "delete", "entity": "Lena", "sneaky": 1})),
        )
        .await;
        assert!(result.is_err());
    }
}
