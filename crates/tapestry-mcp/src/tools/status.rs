//! system_status tool — component-wise health with breaker states.

use std::sync::Arc;

use tapestry_core::Tapestry;

pub fn schema() -> serde_json::Value {
    serde_json::json!({
        "type": "object",
        "properties": {}
    })
}

pub async fn execute(
    service: &Arc<Tapestry>,
    _args: Option<serde_json::Value>,
) -> Result<serde_json::Value, String> {
    let health = service.health().await;
    serde_json::to_value(&health).map_err(|e| e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::test_service;

    #[tokio::test]
    async fn test_status_reports_healthy() {
        let (service, _dir) = test_service();
        let result = execute(&service, None).await.unwrap();
        assert_eq!(result["status"], "healthy");
        assert_eq!(result["llmSmall"]["breaker"], "closed");
        assert!(result["store"]["nodeCount"].is_number());
    }
}
