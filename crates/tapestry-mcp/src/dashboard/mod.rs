//! Live dashboard — read-only HTTP API plus a WebSocket event stream.
//!
//! This is the visualization/subscription surface: `/api/graph` for the
//! current snapshot, `/api/health` for component status, `/ws` for graph
//! mutation events as they happen. Runs on localhost inside the MCP
//! server process.

pub mod events;
pub mod handlers;
pub mod state;
pub mod websocket;

use std::net::SocketAddr;

use axum::routing::get;
use axum::Router;
use tower::ServiceBuilder;
use tower_http::cors::CorsLayer;
use tower_http::set_header::SetResponseHeaderLayer;
use tracing::{info, warn};

use state::AppState;

/// Build the axum router with all dashboard routes
pub fn build_router(state: AppState, port: u16) -> Router {
    let origin = format!("http://127.0.0.1:{}", port)
        .parse::<axum::http::HeaderValue>()
        .expect("valid origin");
    let cors = CorsLayer::new()
        .allow_origin(origin)
        .allow_methods([axum::http::Method::GET])
        .allow_headers([axum::http::header::CONTENT_TYPE]);

    let csp = SetResponseHeaderLayer::overriding(
        axum::http::header::CONTENT_SECURITY_POLICY,
        axum::http::HeaderValue::from_static("default-src 'self'"),
    );

    Router::new()
        .route("/api/graph", get(handlers::get_graph))
        .route("/api/health", get(handlers::get_health))
        .route("/api/audit", get(handlers::get_audit))
        .route("/ws", get(websocket::ws_handler))
        .layer(ServiceBuilder::new().concurrency_limit(16).layer(cors).layer(csp))
        .with_state(state)
}

/// Start the dashboard as a background task. A bind failure is logged
/// and swallowed — the MCP server keeps running without a dashboard.
pub async fn start_background(state: AppState, port: u16) -> Result<(), std::io::Error> {
    let app = build_router(state, port);
    let addr = SocketAddr::from(([127, 0, 0, 1], port));

    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(l) => l,
        Err(e) => {
            warn!(
                "Dashboard could not bind to port {}: {} (MCP server continues without dashboard)",
                port, e
            );
            return Err(e);
        }
    };

    info!("Dashboard available at http://127.0.0.1:{}", port);
    axum::serve(listener, app).await?;
    Ok(())
}
