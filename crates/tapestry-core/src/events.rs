//! Event bus — typed pub/sub over graph mutations.
//!
//! Subscribers register an async handler with an optional event-type
//! filter. Emission never blocks the writer: each subscriber has its own
//! bounded channel drained by its own task, so a slow subscriber cannot
//! stall others and delivery order is preserved per subscriber. A handler
//! exceeding the soft deadline logs a warning but is not cancelled;
//! handler errors are counted and never propagate to the emitter.
//!
//! Under back-pressure the bus sheds the *incoming* non-critical event
//! rather than blocking; critical events (adds, retractions, corrections)
//! are always enqueued.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::graph::{Edge, Node};

// ============================================================================
// EVENTS
// ============================================================================

/// Event type tags, used for subscription filters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum GraphEventType {
    NodeAdded,
    NodeUpdated,
    EdgeAdded,
    EdgeUpdated,
    EdgeArchived,
    EdgeRetracted,
}

/// A graph mutation event
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum GraphEvent {
    NodeAdded { node: Node },
    NodeUpdated { node: Node },
    EdgeAdded { edge: Edge },
    EdgeUpdated { edge: Edge },
    EdgeArchived { edge_id: String },
    EdgeRetracted { edge_id: String, reason: String },
}

impl GraphEvent {
    pub fn event_type(&self) -> GraphEventType {
        match self {
            GraphEvent::NodeAdded { .. } => GraphEventType::NodeAdded,
            GraphEvent::NodeUpdated { .. } => GraphEventType::NodeUpdated,
            GraphEvent::EdgeAdded { .. } => GraphEventType::EdgeAdded,
            GraphEvent::EdgeUpdated { .. } => GraphEventType::EdgeUpdated,
            GraphEvent::EdgeArchived { .. } => GraphEventType::EdgeArchived,
            GraphEvent::EdgeRetracted { .. } => GraphEventType::EdgeRetracted,
        }
    }

    /// Critical events are never shed under back-pressure.
    pub fn is_critical(&self) -> bool {
        matches!(
            self,
            GraphEvent::NodeAdded { .. }
                | GraphEvent::EdgeAdded { .. }
                | GraphEvent::EdgeRetracted { .. }
        )
    }
}

// ============================================================================
// SUBSCRIBERS
// ============================================================================

/// An event handler. Errors are caught and counted, never propagated.
#[async_trait]
pub trait Subscriber: Send + Sync {
    async fn handle(&self, event: GraphEvent) -> std::result::Result<(), String>;
}

/// Default soft deadline for a single handler invocation
pub const DEFAULT_HANDLER_TIMEOUT: Duration = Duration::from_secs(5);

/// Per-subscriber channel capacity before shedding starts
const SUBSCRIBER_BUFFER: usize = 256;

struct Subscription {
    label: String,
    filter: Option<HashSet<GraphEventType>>,
    tx: mpsc::Sender<GraphEvent>,
}

// ============================================================================
// BUS
// ============================================================================

/// Async pub/sub bus for graph mutation events
pub struct EventBus {
    subscriptions: Mutex<Vec<Subscription>>,
    handler_timeout: Duration,
    emit_count: AtomicU64,
    dropped_count: AtomicU64,
    error_count: Arc<AtomicU64>,
    timeout_count: Arc<AtomicU64>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_HANDLER_TIMEOUT)
    }
}

impl EventBus {
    pub fn new(handler_timeout: Duration) -> Self {
        Self {
            subscriptions: Mutex::new(Vec::new()),
            handler_timeout,
            emit_count: AtomicU64::new(0),
            dropped_count: AtomicU64::new(0),
            error_count: Arc::new(AtomicU64::new(0)),
            timeout_count: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Register a subscriber under a unique label. Subscribing the same
    /// label twice is a no-op. `filter = None` receives all events.
    pub fn subscribe(
        &self,
        label: impl Into<String>,
        filter: Option<HashSet<GraphEventType>>,
        subscriber: Arc<dyn Subscriber>,
    ) {
        let label = label.into();
        let mut subs = self.subscriptions.lock().expect("subscription lock");
        if subs.iter().any(|s| s.label == label) {
            warn!(label = %label, "duplicate subscription ignored");
            return;
        }

        let (tx, mut rx) = mpsc::channel::<GraphEvent>(SUBSCRIBER_BUFFER);
        let timeout = self.handler_timeout;
        let errors = Arc::clone(&self.error_count);
        let timeouts = Arc::clone(&self.timeout_count);
        let task_label = label.clone();

        // One drain task per subscriber preserves emission order for that
        // subscriber while isolating it from the others.
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                let event_type = event.event_type();
                match tokio::time::timeout(timeout, subscriber.handle(event)).await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => {
                        errors.fetch_add(1, Ordering::Relaxed);
                        warn!(label = %task_label, ?event_type, error = %e, "subscriber handler failed");
                    }
                    Err(_) => {
                        timeouts.fetch_add(1, Ordering::Relaxed);
                        warn!(
                            label = %task_label,
                            ?event_type,
                            timeout_secs = timeout.as_secs_f64(),
                            "subscriber handler exceeded soft deadline"
                        );
                    }
                }
            }
            debug!(label = %task_label, "subscriber drain task finished");
        });

        info!(label = %label, total = subs.len() + 1, "subscriber registered");
        subs.push(Subscription { label, filter, tx });
    }

    /// Remove a subscriber. Unsubscribing an unknown label is a no-op.
    pub fn unsubscribe(&self, label: &str) {
        let mut subs = self.subscriptions.lock().expect("subscription lock");
        let before = subs.len();
        subs.retain(|s| s.label != label);
        if subs.len() < before {
            info!(label = %label, total = subs.len(), "subscriber removed");
        }
    }

    /// Fire an event to all matching subscribers. Returns immediately.
    pub fn emit(&self, event: GraphEvent) {
        self.emit_count.fetch_add(1, Ordering::Relaxed);
        let subs = self.subscriptions.lock().expect("subscription lock");
        for sub in subs.iter() {
            if let Some(filter) = &sub.filter {
                if !filter.contains(&event.event_type()) {
                    continue;
                }
            }
            match sub.tx.try_send(event.clone()) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(ev)) => {
                    if ev.is_critical() {
                        // Critical events must be delivered; hand the send
                        // to a task rather than blocking the writer.
                        let tx = sub.tx.clone();
                        let label = sub.label.clone();
                        tokio::spawn(async move {
                            if tx.send(ev).await.is_err() {
                                warn!(label = %label, "subscriber channel closed mid-send");
                            }
                        });
                    } else {
                        self.dropped_count.fetch_add(1, Ordering::Relaxed);
                        warn!(label = %sub.label, "subscriber buffer full, shedding non-critical event");
                    }
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    warn!(label = %sub.label, "subscriber channel closed");
                }
            }
        }
    }

    /// Emit a batch of events in order.
    pub fn emit_all(&self, events: impl IntoIterator<Item = GraphEvent>) {
        for event in events {
            self.emit(event);
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscriptions.lock().expect("subscription lock").len()
    }

    pub fn emit_count(&self) -> u64 {
        self.emit_count.load(Ordering::Relaxed)
    }

    pub fn dropped_count(&self) -> u64 {
        self.dropped_count.load(Ordering::Relaxed)
    }

    pub fn error_count(&self) -> u64 {
        self.error_count.load(Ordering::Relaxed)
    }

    pub fn timeout_count(&self) -> u64 {
        self.timeout_count.load(Ordering::Relaxed)
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{NodeKind, PrivacyLevel};
    use chrono::Utc;
    use std::sync::atomic::AtomicUsize;

    fn sample_node() -> Node {
        Node {
            id: "n1".to_string(),
            kind: NodeKind::Person,
            name: "Lena".to_string(),
            aliases: vec!["lena".to_string()],
            properties: serde_json::json!({}),
            privacy: PrivacyLevel::Personal,
            created_at: Utc::now(),
            last_reinforced: Utc::now(),
        }
    }

    struct Counter {
        seen: Arc<AtomicUsize>,
        fail: bool,
    }

    #[async_trait]
    impl Subscriber for Counter {
        async fn handle(&self, _event: GraphEvent) -> std::result::Result<(), String> {
            self.seen.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                Err("boom".to_string())
            } else {
                Ok(())
            }
        }
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    #[tokio::test]
    async fn test_emit_reaches_subscriber() {
        let bus = EventBus::default();
        let seen = Arc::new(AtomicUsize::new(0));
        bus.subscribe(
            "counter",
            None,
            Arc::new(Counter { seen: Arc::clone(&seen), fail: false }),
        );

        bus.emit(GraphEvent::NodeAdded { node: sample_node() });
        settle().await;
        assert_eq!(seen.load(Ordering::SeqCst), 1);
        assert_eq!(bus.emit_count(), 1);
    }

    #[tokio::test]
    async fn test_filter_excludes_other_types() {
        let bus = EventBus::default();
        let seen = Arc::new(AtomicUsize::new(0));
        let mut filter = HashSet::new();
        filter.insert(GraphEventType::EdgeRetracted);
        bus.subscribe(
            "retractions-only",
            Some(filter),
            Arc::new(Counter { seen: Arc::clone(&seen), fail: false }),
        );

        bus.emit(GraphEvent::NodeAdded { node: sample_node() });
        bus.emit(GraphEvent::EdgeRetracted {
            edge_id: "e1".to_string(),
            reason: "superseded".to_string(),
        });
        settle().await;
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_duplicate_subscribe_is_noop() {
        let bus = EventBus::default();
        let seen = Arc::new(AtomicUsize::new(0));
        let sub = Arc::new(Counter { seen: Arc::clone(&seen), fail: false });
        bus.subscribe("dup", None, Arc::clone(&sub) as Arc<dyn Subscriber>);
        bus.subscribe("dup", None, sub);
        assert_eq!(bus.subscriber_count(), 1);

        bus.emit(GraphEvent::NodeAdded { node: sample_node() });
        settle().await;
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_unsubscribe_unknown_is_noop() {
        let bus = EventBus::default();
        bus.unsubscribe("ghost");
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_handler_errors_are_counted_not_propagated() {
        let bus = EventBus::default();
        let seen = Arc::new(AtomicUsize::new(0));
        bus.subscribe(
            "failing",
            None,
            Arc::new(Counter { seen: Arc::clone(&seen), fail: true }),
        );

        bus.emit(GraphEvent::EdgeArchived { edge_id: "e1".to_string() });
        bus.emit(GraphEvent::EdgeArchived { edge_id: "e2".to_string() });
        settle().await;
        assert_eq!(seen.load(Ordering::SeqCst), 2);
        assert_eq!(bus.error_count(), 2);
    }

    #[tokio::test]
    async fn test_slow_handler_logs_timeout_but_completes() {
        struct Slow {
            seen: Arc<AtomicUsize>,
        }

        #[async_trait]
        impl Subscriber for Slow {
            async fn handle(&self, _event: GraphEvent) -> std::result::Result<(), String> {
                tokio::time::sleep(Duration::from_millis(50)).await;
                self.seen.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        }

        let bus = EventBus::new(Duration::from_millis(5));
        let seen = Arc::new(AtomicUsize::new(0));
        bus.subscribe("slow", None, Arc::new(Slow { seen: Arc::clone(&seen) }));

        bus.emit(GraphEvent::EdgeArchived { edge_id: "e1".to_string() });
        tokio::time::sleep(Duration::from_millis(120)).await;
        assert_eq!(bus.timeout_count(), 1);
    }

    #[tokio::test]
    async fn test_per_subscriber_order_preserved() {
        struct Recorder {
            order: Arc<Mutex<Vec<String>>>,
        }

        #[async_trait]
        impl Subscriber for Recorder {
            async fn handle(&self, event: GraphEvent) -> std::result::Result<(), String> {
                if let GraphEvent::EdgeArchived { edge_id } = event {
                    self.order.lock().unwrap().push(edge_id);
                }
                Ok(())
            }
        }

        let bus = EventBus::default();
        let order = Arc::new(Mutex::new(Vec::new()));
        bus.subscribe("recorder", None, Arc::new(Recorder { order: Arc::clone(&order) }));

        for i in 0..20 {
            bus.emit(GraphEvent::EdgeArchived { edge_id: format!("e{i}") });
        }
        settle().await;
        let seen = order.lock().unwrap().clone();
        let expected: Vec<String> = (0..20).map(|i| format!("e{i}")).collect();
        assert_eq!(seen, expected);
    }
}
