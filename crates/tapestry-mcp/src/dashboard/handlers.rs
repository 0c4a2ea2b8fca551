//! Dashboard HTTP handlers — read-only views over the service.

use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use tapestry_core::SnapshotFormat;

use super::state::AppState;

/// GET /api/graph — full graph snapshot for visualization
pub async fn get_graph(
    State(state): State<AppState>,
) -> Result<Json<serde_json::Value>, StatusCode> {
    match state.service.graph_snapshot(SnapshotFormat::Full) {
        Ok(output) => {
            serde_json::to_value(&output).map(Json).map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)
        }
        Err(_) => Err(StatusCode::INTERNAL_SERVER_ERROR),
    }
}

/// GET /api/health — component-wise health with breaker states
pub async fn get_health(State(state): State<AppState>) -> Json<serde_json::Value> {
    let health = state.service.health().await;
    Json(serde_json::to_value(&health).unwrap_or_else(|_| serde_json::json!({"status": "unknown"})))
}

/// GET /api/audit — recent audit records, newest first
pub async fn get_audit(
    State(state): State<AppState>,
) -> Result<Json<serde_json::Value>, StatusCode> {
    match state.service.store().audit_recent(100) {
        Ok(records) => Ok(Json(serde_json::json!({ "records": records }))),
        Err(_) => Err(StatusCode::INTERNAL_SERVER_ERROR),
    }
}
