//! Dashboard event frames, broadcast to all connected WebSocket clients.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tapestry_core::{GraphEvent, Subscriber};
use tokio::sync::broadcast;

/// A frame pushed over the dashboard WebSocket
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum DashboardEvent {
    /// Sent once on connect
    Connected {
        version: String,
        timestamp: DateTime<Utc>,
    },
    /// A graph mutation, forwarded from the service event bus
    Graph {
        event: GraphEvent,
        timestamp: DateTime<Utc>,
    },
    /// Periodic liveness frame with headline stats
    Heartbeat {
        uptime_secs: u64,
        node_count: usize,
        edge_count: usize,
        timestamp: DateTime<Utc>,
    },
}

impl DashboardEvent {
    pub fn graph(event: GraphEvent) -> Self {
        Self::Graph { event, timestamp: Utc::now() }
    }

    /// Serialize for WebSocket transmission.
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| "{}".to_string())
    }
}

/// Event-bus subscriber that forwards graph mutations into the
/// dashboard broadcast channel.
pub struct DashboardForwarder {
    tx: broadcast::Sender<DashboardEvent>,
}

impl DashboardForwarder {
    pub fn new(tx: broadcast::Sender<DashboardEvent>) -> Self {
        Self { tx }
    }
}

#[async_trait]
impl Subscriber for DashboardForwarder {
    async fn handle(&self, event: GraphEvent) -> Result<(), String> {
        // No receivers connected is fine; frames are simply dropped.
        let _ = self.tx.send(DashboardEvent::graph(event));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_graph_event_frame_shape() {
        let frame = DashboardEvent::graph(GraphEvent::EdgeArchived { edge_id: "e1".to_string() });
        let json: serde_json::Value = serde_json::from_str(&frame.to_json()).unwrap();
        assert_eq!(json["type"], "graph");
        assert_eq!(json["data"]["event"]["type"], "edge_archived");
    }
}
