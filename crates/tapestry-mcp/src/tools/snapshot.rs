//! graph_snapshot tool — full export as JSON or GraphML.

use std::sync::Arc;

use tapestry_core::{SnapshotFormat, SnapshotOutput, Tapestry};

use super::arg_str;

pub fn schema() -> serde_json::Value {
    serde_json::json!({
        "type": "object",
        "properties": {
            "format": {
                "type": "string",
                "enum": ["full", "graphml"],
                "default": "full"
            }
        }
    })
}

pub async fn execute(
    service: &Arc<Tapestry>,
    args: Option<serde_json::Value>,
) -> Result<serde_json::Value, String> {
    let format = match arg_str(&args, "format").as_deref() {
        Some("graphml") => SnapshotFormat::Graphml,
        _ => SnapshotFormat::Full,
    };
    let output = service.graph_snapshot(format).map_err(|e| e.to_string())?;
    match output {
        SnapshotOutput::Full(snapshot) => serde_json::to_value(&snapshot).map_err(|e| e.to_string()),
        SnapshotOutput::Graphml { graphml } => Ok(serde_json::json!({ "graphml": graphml })),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{ingest_wife_loves_malbec, test_service};

    #[tokio::test]
    async fn test_full_snapshot() {
        let (service, _dir) = test_service();
        ingest_wife_loves_malbec(&service).await;
        let result = execute(&service, None).await.unwrap();
        assert_eq!(result["stats"]["edgeCount"], 2);
    }

    #[tokio::test]
    async fn test_graphml_snapshot() {
        let (service, _dir) = test_service();
        ingest_wife_loves_malbec(&service).await;
        let result = execute(&service, Some(serde_json::json!({"format": "graphml"}))).await.unwrap();
        assert!(result["graphml"].as_str().unwrap().contains("<graphml"));
    }
}
