//! Dashboard shared state.

use std::sync::Arc;
use std::time::Instant;

use tapestry_core::Tapestry;
use tokio::sync::broadcast;

use super::events::DashboardEvent;

/// Shared application state for the dashboard
#[derive(Clone)]
pub struct AppState {
    pub service: Arc<Tapestry>,
    pub events: broadcast::Sender<DashboardEvent>,
    pub start_time: Instant,
}

impl AppState {
    pub fn new(service: Arc<Tapestry>, events: broadcast::Sender<DashboardEvent>) -> Self {
        Self { service, events, start_time: Instant::now() }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DashboardEvent> {
        self.events.subscribe()
    }
}
