//! # Tapestry Core
//!
//! Knowledge-graph memory engine for conversational agents. Utterances
//! go in; a typed, temporal, confidence-weighted graph comes out.
//!
//! - **Staged extraction**: preprocess → entities → relations →
//!   sentiment/hedge → temporal scope → confidence scoring → diff prep,
//!   with JSON repair and hallucination detection between the LLM and
//!   the graph. Every stage degrades gracefully.
//! - **Diff engine**: each prepared fact is classified INSERT /
//!   REINFORCE / CONTRADICT→REVISE / SKIP / MERGE and applied atomically
//!   per interaction.
//! - **Confidence lifecycle**: base scores by provenance mechanism,
//!   hedge multipliers, asymptotic reinforcement, per-temporal-type
//!   decay with a grace period, and archival below threshold.
//! - **Queues**: a durable at-least-once inbound queue with idempotency
//!   keys and dead-lettering; an outbound queue of probes and starters
//!   gated by context fit, frequency caps, and cooldowns.
//! - **Proactive engine**: knowledge-gap probes, external-event
//!   starters, and a risk model mapping (confidence, cost) to action.
//! - **Background workers**: decay, public-fact revision, cross-context
//!   inference, and episode clustering — all through the same store
//!   operations as the online path.
//! - **Audit log**: an append-only record of every mutation and
//!   proactive decision, written in the same transaction.
//!
//! ## Quick start
//!
//! ```rust,ignore
//! use tapestry_core::{InteractionEvent, Tapestry, TapestryConfig};
//!
//! let service = std::sync::Arc::new(Tapestry::new(TapestryConfig::default())?);
//! service.report_interaction(InteractionEvent::new("s1", 1, "My wife Lena loves Malbec"))?;
//! service.process_pending().await?;
//!
//! let (subgraph, plan) = service.query_nl("what does my wife like?").await;
//! ```

// ============================================================================
// MODULES
// ============================================================================

pub mod audit;
pub mod confidence;
pub mod config;
pub mod diff;
pub mod events;
pub mod extraction;
pub mod graph;
pub mod proactive;
pub mod query;
pub mod queues;
pub mod resilience;
pub mod service;
pub mod store;
pub mod workers;

// ============================================================================
// PUBLIC API RE-EXPORTS
// ============================================================================

// Graph types
pub use graph::{Edge, EdgeInput, Episode, Node, NodeInput, NodeKind, PrivacyLevel, Provenance, TemporalType};

// Confidence engine
pub use confidence::{ConfidenceParams, HedgeLevel};

// Store
pub use store::{
    EdgeFilter, EnqueueResult, GraphSnapshot, GraphStore, SnapshotStats, StoreError, StoreStats,
};

// Events
pub use events::{EventBus, GraphEvent, GraphEventType, Subscriber};

// Extraction
pub use extraction::{
    AnthropicModel, ExtractionConfig, ExtractionPipeline, LanguageModel, LlmCapability, LlmError,
    MockLanguageModel,
};

// Diff engine
pub use diff::{DeltaOutcome, PreparedDelta, ProposedEdge, ProposedNode};

// Queues
pub use queues::{ContextWindow, InteractionEvent};
pub use queues::outbound::{OutboundItem, OutboundKind, ProbeState, ProbingLimits};

// Proactive engine
pub use proactive::{
    assess_risk, CostCategory, ExternalEvent, ProactiveConfig, QuietHours, RiskAction,
    RiskThresholds,
};

// Query surface
pub use query::{ContextBlock, NlPlanner, QueryPlan, QueryRequest, QueryResult};

// Workers
pub use workers::{FactVerifier, NoopVerifier, Verdict, WorkerSchedules};

// Resilience
pub use resilience::{BreakerState, CircuitBreaker, CircuitConfig, RetryPolicy};

// Configuration
pub use config::{ProactivityPreset, TapestryConfig};

// Service facade
pub use service::{
    ContextResult, CorrectionKind, CorrectionOutcome, Health, ProvenanceChain, ServiceError,
    SnapshotFormat, SnapshotOutput, Tapestry, UserCorrection,
};

// ============================================================================
// VERSION INFO
// ============================================================================

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

// ============================================================================
// PRELUDE
// ============================================================================

/// Convenient imports for common usage
pub mod prelude {
    pub use crate::{
        ConfidenceParams, ContextResult, Edge, EnqueueResult, GraphEvent, GraphStore,
        InteractionEvent, Node, NodeKind, QueryRequest, QueryResult, ServiceError, Tapestry,
        TapestryConfig, UserCorrection,
    };
}
