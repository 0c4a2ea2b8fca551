//! Inbound queue — durable, at-least-once interaction events.
//!
//! Idempotency is keyed on `(session_id, turn_number)`: the key is the
//! table's primary key, so duplicates within the retention window are
//! dropped at enqueue time and a crash between extraction and commit
//! leaves the key unclaimed for a clean retry. Failed processing retries
//! with exponential backoff and progressively less prior context; after
//! three failures the event moves to the dead-letter state for offline
//! review.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::store::{EnqueueResult, GraphStore, InboundRow, Result};

// ============================================================================
// EVENTS
// ============================================================================

/// An interaction event pushed by an agent
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct InteractionEvent {
    pub session_id: String,
    pub turn_number: u32,
    #[serde(default = "default_channel")]
    pub channel: String,
    pub text: String,
    /// Entities the agent already knows are in scope
    #[serde(default)]
    pub entities_hint: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_timestamp: Option<DateTime<Utc>>,
    /// Speech-to-text confidence, when the channel is voice
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stt_confidence: Option<f64>,
}

fn default_channel() -> String {
    "chat".to_string()
}

impl InteractionEvent {
    pub fn new(session_id: impl Into<String>, turn_number: u32, text: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            turn_number,
            channel: default_channel(),
            text: text.into(),
            entities_hint: vec![],
            client_timestamp: None,
            stt_confidence: None,
        }
    }

    /// The idempotency key for this event
    pub fn idempotency_key(&self) -> (String, u32) {
        (self.session_id.clone(), self.turn_number)
    }
}

/// How much prior context extraction may use on this attempt. Each retry
/// shrinks the window so an oversized context cannot wedge an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ContextWindow {
    Full,
    Half,
    Minimal,
}

impl ContextWindow {
    /// Window for the given (zero-based) attempt number
    pub fn for_attempt(attempt: u32) -> Self {
        match attempt {
            0 => ContextWindow::Full,
            1 => ContextWindow::Half,
            _ => ContextWindow::Minimal,
        }
    }

    /// Maximum characters of utterance passed to the LLM under this window
    pub fn max_chars(&self) -> usize {
        match self {
            ContextWindow::Full => 8_000,
            ContextWindow::Half => 4_000,
            ContextWindow::Minimal => 1_000,
        }
    }
}

// ============================================================================
// QUEUE
// ============================================================================

/// Retry backoff schedule: 1 s, 5 s, 30 s
pub const BACKOFF: [Duration; 3] = [
    Duration::from_secs(1),
    Duration::from_secs(5),
    Duration::from_secs(30),
];

/// Attempts before an event dead-letters
pub const MAX_ATTEMPTS: u32 = 3;

/// Default duplicate-suppression window
pub const DEFAULT_RETENTION_HOURS: i64 = 72;

/// Durable inbound queue over the graph store
pub struct InboundQueue {
    store: Arc<GraphStore>,
    retention_hours: i64,
}

impl InboundQueue {
    pub fn new(store: Arc<GraphStore>) -> Self {
        Self { store, retention_hours: DEFAULT_RETENTION_HOURS }
    }

    pub fn with_retention_hours(store: Arc<GraphStore>, retention_hours: i64) -> Self {
        Self { store, retention_hours }
    }

    /// Enqueue an event. Non-blocking from the agent's perspective: one
    /// indexed INSERT. Duplicates within the retention window are dropped.
    pub fn enqueue(&self, event: InteractionEvent) -> Result<EnqueueResult> {
        let result = self.store.enqueue_interaction(&event)?;
        match &result {
            EnqueueResult::Accepted => {
                info!(
                    session = %event.session_id,
                    turn = event.turn_number,
                    "interaction enqueued"
                );
            }
            EnqueueResult::Duplicate => {
                warn!(
                    session = %event.session_id,
                    turn = event.turn_number,
                    "duplicate interaction dropped"
                );
            }
        }
        Ok(result)
    }

    /// Claim the next due event, respecting per-session FIFO order.
    pub fn claim_next(&self) -> Result<Option<InboundRow>> {
        self.store.claim_next_inbound(Utc::now())
    }

    /// Record a processing failure; requeues with backoff or dead-letters.
    pub fn fail(&self, row: &InboundRow, error: &str) -> Result<()> {
        let attempts = row.attempts + 1;
        if attempts >= MAX_ATTEMPTS {
            warn!(
                session = %row.event.session_id,
                turn = row.event.turn_number,
                attempts,
                error,
                "interaction dead-lettered"
            );
            self.store.dead_letter_inbound(&row.event.session_id, row.event.turn_number, error)
        } else {
            let delay = BACKOFF[(attempts - 1).min(BACKOFF.len() as u32 - 1) as usize];
            let next = Utc::now() + chrono::Duration::from_std(delay).unwrap_or_default();
            self.store.requeue_inbound(
                &row.event.session_id,
                row.event.turn_number,
                attempts,
                next,
                error,
            )
        }
    }

    /// Release a claimed event without consuming an attempt (cancellation).
    pub fn release(&self, row: &InboundRow) -> Result<()> {
        self.store.requeue_inbound(
            &row.event.session_id,
            row.event.turn_number,
            row.attempts,
            Utc::now(),
            "released",
        )
    }

    /// List dead-lettered events for offline review.
    pub fn dead_letters(&self) -> Result<Vec<InboundRow>> {
        self.store.dead_lettered_inbound()
    }

    /// Drop processed rows past the retention window.
    pub fn purge_expired(&self) -> Result<usize> {
        let cutoff = Utc::now() - chrono::Duration::hours(self.retention_hours);
        self.store.purge_inbound_before(cutoff)
    }

    pub fn pending_count(&self) -> Result<usize> {
        self.store.inbound_pending_count()
    }
}

// ============================================================================
// TESTS
// ============================================================================
