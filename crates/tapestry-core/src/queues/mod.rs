//! Durable queues — inbound interaction events and outbound probes.
//!
//! Both queues persist in the graph store's database; these modules own
//! the domain types, the retry/backoff policy, and the context-fit
//! delivery gating. The SQL lives with the rest of the storage layer.

pub mod inbound;
pub mod outbound;

pub use inbound::{ContextWindow, InboundQueue, InteractionEvent};
pub use outbound::{
    context_fit, jaccard, OutboundItem, OutboundKind, OutboundQueue, ProbeState, ProbingLimits,
};
