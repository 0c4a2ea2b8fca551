//! Service facade — wires the store, pipeline, diff engine, queues,
//! proactive engine, and workers behind the operation surface agents
//! call.
//!
//! The facade owns the single-writer discipline: extraction runs on the
//! async pool and only produces prepared deltas; every mutation funnels
//! through `GraphStore::apply_delta` (or the correction path), then its
//! events fan out on the bus and feed probe generation.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::audit::{AuditEntry, AuditKind, AuditRecord, Operation};
use crate::config::TapestryConfig;
use crate::diff::DeltaOutcome;
use crate::events::{EventBus, GraphEvent, GraphEventType, Subscriber};
use crate::extraction::{
    AnthropicModel, ExtractionPipeline, LanguageModel, LlmCapability, MockLanguageModel,
};
use crate::graph::{Edge, Episode, NodeInput, NodeKind, Provenance};
use crate::proactive::{ExternalEvent, ProactiveEngine};
use crate::query::{assemble_context_block, ContextBlock, NlPlanner, QueryPlan, QueryRequest, QueryResult};
use crate::queues::inbound::{ContextWindow, InboundQueue, InteractionEvent};
use crate::queues::outbound::{OutboundItem, OutboundQueue};
use crate::resilience::BreakerState;
use crate::store::{EdgeFilter, EnqueueResult, GraphSnapshot, GraphStore, InboundRow, StoreError, StoreStats};
use crate::workers::{self, FactVerifier, NoopVerifier};

// ============================================================================
// ERRORS
// ============================================================================

#[non_exhaustive]
#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("not found: {0}")]
    NotFound(String),
}

pub type Result<T> = std::result::Result<T, ServiceError>;

// ============================================================================
// RESULT TYPES
// ============================================================================

/// What `get_context` returns: the extraction delta summary, the
/// relevant subgraph, and the plan that found it.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ContextResult {
    pub extraction: DeltaOutcome,
    pub subgraph: QueryResult,
    pub plan: QueryPlan,
    pub context_block: ContextBlock,
}

/// Provenance chain for one edge
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProvenanceChain {
    pub edge: Edge,
    pub episodes: Vec<Episode>,
    pub audit: Vec<AuditRecord>,
}

/// Export format for `graph_snapshot`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SnapshotFormat {
    Full,
    Graphml,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase", untagged)]
pub enum SnapshotOutput {
    Full(GraphSnapshot),
    Graphml { graphml: String },
}

/// Explicit user correction — always applied, never confidence-gated
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct UserCorrection {
    pub kind: CorrectionKind,
    /// Entity name or alias the correction is about
    pub entity: String,
    #[serde(default)]
    pub relation: Option<String>,
    #[serde(default)]
    pub old_value: Option<String>,
    #[serde(default)]
    pub new_value: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CorrectionKind {
    Revise,
    Delete,
    Retract,
}

#[derive(Debug, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CorrectionOutcome {
    pub edges_retracted: usize,
    pub edges_revised: usize,
    pub edges_deleted: usize,
    pub nodes_deleted: usize,
}

/// Component-wise health report
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Health {
    pub status: &'static str,
    pub uptime_secs: u64,
    pub store: Option<StoreStats>,
    pub llm_small: LlmHealth,
    pub llm_large: LlmHealth,
    pub bus_subscribers: usize,
    pub events_emitted: u64,
    pub events_dropped: u64,
    pub hallucinations_detected: u64,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LlmHealth {
    pub model: String,
    pub breaker: BreakerState,
    pub tokens_spent_today: u64,
}

// ============================================================================
// SERVICE
// ============================================================================

fn is_transient(tags: &[String]) -> bool {
    tags.iter().any(|t| {
        matches!(
            t.as_str(),
            "llm_circuit_open" | "llm_budget_exhausted" | "llm_timeout" | "llm_error"
        )
    })
}

pub struct Tapestry {
    config: TapestryConfig,
    store: Arc<GraphStore>,
    bus: Arc<EventBus>,
    pipeline: ExtractionPipeline,
    inbound: InboundQueue,
    outbound: Arc<OutboundQueue>,
    proactive: ProactiveEngine,
    planner: NlPlanner,
    llm_small: Arc<LlmCapability>,
    llm_large: Arc<LlmCapability>,
    verifier: Arc<dyn FactVerifier>,
    started_at: Instant,
}

impl Tapestry {
    /// Build a service from configuration, choosing the LLM provider.
    pub fn new(config: TapestryConfig) -> Result<Self> {
        let (small, large): (Arc<dyn LanguageModel>, Arc<dyn LanguageModel>) =
            match config.llm.provider.as_str() {
                "anthropic" => (
                    Arc::new(AnthropicModel::new(
                        config.llm.api_key.clone(),
                        config.llm.small_model.clone(),
                    )),
                    Arc::new(AnthropicModel::new(
                        config.llm.api_key.clone(),
                        config.llm.large_model.clone(),
                    )),
                ),
                _ => {
                    let mock = Arc::new(MockLanguageModel::new());
                    (Arc::clone(&mock) as Arc<dyn LanguageModel>, mock)
                }
            };
        Self::with_models(config, small, large, Arc::new(NoopVerifier))
    }

    /// Build with explicit capabilities (tests, embedding in other hosts).
    pub fn with_models(
        config: TapestryConfig,
        small: Arc<dyn LanguageModel>,
        large: Arc<dyn LanguageModel>,
        verifier: Arc<dyn FactVerifier>,
    ) -> Result<Self> {
        let store = Arc::new(GraphStore::new(config.data_dir.clone())?);
        let bus = Arc::new(EventBus::default());
        let llm_small = Arc::new(LlmCapability::small(small));
        let llm_large = Arc::new(LlmCapability::large(large));
        let pipeline = ExtractionPipeline::new(
            Arc::clone(&llm_small),
            config.confidence.clone(),
            config.extraction.clone(),
        );
        let inbound =
            InboundQueue::with_retention_hours(Arc::clone(&store), config.inbound_retention_hours);
        let outbound =
            Arc::new(OutboundQueue::new(Arc::clone(&store), config.probing.clone()));
        let proactive = ProactiveEngine::new(
            Arc::clone(&store),
            Arc::clone(&outbound),
            Arc::clone(&llm_large),
            config.proactive.clone(),
        );
        let planner = NlPlanner::new(Arc::clone(&llm_small), Arc::clone(&store));

        info!(provider = %config.llm.provider, "tapestry service initialized");
        Ok(Self {
            config,
            store,
            bus,
            pipeline,
            inbound,
            outbound,
            proactive,
            planner,
            llm_small,
            llm_large,
            verifier,
            started_at: Instant::now(),
        })
    }

    pub fn store(&self) -> &Arc<GraphStore> {
        &self.store
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    pub fn config(&self) -> &TapestryConfig {
        &self.config
    }

    // ========================================================================
    // WRITE PATH
    // ========================================================================

    /// Accept an interaction event. Non-blocking: one durable enqueue.
    pub fn report_interaction(&self, event: InteractionEvent) -> Result<EnqueueResult> {
        if event.text.len() > 64 * 1024 {
            return Err(ServiceError::InvalidRequest("utterance too large".to_string()));
        }
        if event.session_id.trim().is_empty() {
            return Err(ServiceError::InvalidRequest("session_id required".to_string()));
        }
        Ok(self.inbound.enqueue(event)?)
    }

    /// Drain the inbound queue: extract, diff, apply, publish, probe.
    /// Returns how many events were fully processed.
    pub async fn process_pending(&self) -> Result<usize> {
        let mut processed = 0usize;
        while let Some(row) = self.inbound.claim_next()? {
            match self.process_one(&row).await {
                Ok(()) => processed += 1,
                Err(e) => {
                    warn!(
                        session = %row.event.session_id,
                        turn = row.event.turn_number,
                        error = %e,
                        "interaction processing failed"
                    );
                    self.inbound.fail(&row, &e.to_string())?;
                }
            }
        }
        Ok(processed)
    }

    async fn process_one(&self, row: &InboundRow) -> Result<()> {
        let window = ContextWindow::for_attempt(row.attempts);
        let delta = self.pipeline.extract(&row.event, window).await;

        // Transient LLM trouble is a retry, not a result.
        if delta.skipped && is_transient(&delta.tags) {
            self.inbound.fail(row, "llm unavailable")?;
            return Ok(());
        }

        self.finish_delta(&row.event, delta).await?;
        Ok(())
    }

    /// Commit an extracted delta: hallucination audit, skip record, or
    /// atomic application followed by probe generation and event fan-out.
    async fn finish_delta(
        &self,
        event: &InteractionEvent,
        delta: crate::diff::PreparedDelta,
    ) -> Result<DeltaOutcome> {
        let correlation = delta.correlation_id.clone();

        if delta.tags.iter().any(|t| t == "hallucination_discarded") {
            self.store.audit_append(
                &AuditEntry::new(
                    correlation.clone(),
                    AuditKind::HallucinationDetected,
                    "pipeline",
                    Operation::Skip,
                )
                .session(event.session_id.clone())
                .reasoning("stage output discarded after repeated span failures"),
            )?;
        }

        if delta.skipped {
            self.store.mark_interaction_skipped(
                &event.session_id,
                event.turn_number,
                &event.channel,
                &correlation,
                delta.skip_reason.as_deref().unwrap_or("nothing_extracted"),
            )?;
            return Ok(DeltaOutcome { episode_id: delta.episode_id, ..Default::default() });
        }

        let (outcome, events) = self.store.apply_delta(&delta, &self.config.confidence)?;
        if outcome.already_processed {
            return Ok(outcome);
        }

        for request in &outcome.verification_requests {
            if let Err(e) = self.proactive.on_verification_request(request) {
                warn!(error = %e, "verification probe enqueue failed");
            }
        }
        for graph_event in &events {
            if let Err(e) = self.proactive.on_graph_event(graph_event).await {
                warn!(error = %e, "probe generation failed");
            }
        }
        self.bus.emit_all(events);

        info!(
            session = %event.session_id,
            turn = event.turn_number,
            inserted = outcome.inserted,
            reinforced = outcome.reinforced,
            revised = outcome.revised,
            "interaction applied"
        );
        Ok(outcome)
    }

    // ========================================================================
    // READ PATH
    // ========================================================================

    /// Structured query. Store trouble degrades to an empty marked
    /// result: a missing answer must look like "I do not know yet".
    pub fn query(&self, request: &QueryRequest) -> QueryResult {
        match crate::query::query_subgraph(&self.store, request) {
            Ok(result) => result,
            Err(e) => {
                error!(error = %e, "structured query failed, returning degraded empty");
                QueryResult::degraded_empty()
            }
        }
    }

    /// Natural-language query via the planner.
    pub async fn query_nl(&self, text: &str) -> (QueryResult, QueryPlan) {
        match self.planner.query(text).await {
            Ok(result) => result,
            Err(e) => {
                error!(error = %e, "nl query failed, returning degraded empty");
                (
                    QueryResult::degraded_empty(),
                    QueryPlan {
                        entities: vec![],
                        relations: None,
                        min_confidence: 0.0,
                        max_hops: 0,
                        reasoning: "store unavailable".to_string(),
                        fallback: true,
                    },
                )
            }
        }
    }

    /// Process a message AND query for relevant context in one call —
    /// the common per-turn operation for agent integration.
    pub async fn get_context(&self, event: InteractionEvent) -> Result<ContextResult> {
        let text = event.text.clone();
        let delta = self.pipeline.extract(&event, ContextWindow::Full).await;

        let extraction = if delta.skipped && is_transient(&delta.tags) {
            // Extraction will be retried by the drain loop; context can
            // still be served from what the graph already knows.
            self.inbound.enqueue(event.clone())?;
            DeltaOutcome { episode_id: delta.episode_id, ..Default::default() }
        } else {
            self.finish_delta(&event, delta).await?
        };

        let (subgraph, plan) = self.query_nl(&text).await;
        let context_block = assemble_context_block(
            &self.store,
            &self.outbound,
            &plan.entities,
            &[],
            800,
        )?;
        Ok(ContextResult { extraction, subgraph, plan, context_block })
    }

    /// Budgeted context packet without running extraction.
    pub fn context_block(
        &self,
        active_entities: &[String],
        active_topics: &[String],
        token_budget: usize,
    ) -> Result<ContextBlock> {
        Ok(assemble_context_block(
            &self.store,
            &self.outbound,
            active_entities,
            active_topics,
            token_budget,
        )?)
    }

    // ========================================================================
    // PROACTIVE SURFACE
    // ========================================================================

    /// The single best-fit probe for the moment, or none. Consumes the
    /// probe and counts the delivery.
    pub fn get_probes(
        &self,
        session_id: &str,
        active_topics: &[String],
        entities_in_scope: &[String],
        turn_number: u32,
    ) -> Result<Option<(OutboundItem, f64)>> {
        Ok(self.outbound.get_best_probe(
            session_id,
            active_topics,
            entities_in_scope,
            turn_number,
            Utc::now(),
        )?)
    }

    /// Ranked starters for the channel.
    pub fn get_starters(&self, max_results: usize) -> Result<Vec<OutboundItem>> {
        Ok(self.outbound.get_starters(max_results, Utc::now())?)
    }

    /// Feed one normalized external event through the proactive engine.
    pub async fn handle_external_event(&self, event: &ExternalEvent) -> Result<Option<String>> {
        Ok(self.proactive.on_external_event(event).await?)
    }

    /// Probe feedback from the agent.
    pub fn probe_feedback(&self, probe_id: &str, feedback: &str) -> Result<()> {
        match feedback {
            "accepted" => self.outbound.mark_accepted(probe_id)?,
            "ignored" => self.outbound.mark_ignored(probe_id)?,
            "deflected" => self.outbound.mark_deflected(probe_id)?,
            other => {
                return Err(ServiceError::InvalidRequest(format!(
                    "unknown probe feedback '{other}'"
                )))
            }
        }
        Ok(())
    }

    // ========================================================================
    // CORRECTIONS
    // ========================================================================

    /// Apply an explicit user correction. Always applied, never gated by
    /// confidence; errors (unknown entity) are surfaced to the caller.
    pub fn user_correction(&self, correction: &UserCorrection) -> Result<CorrectionOutcome> {
        let correlation = format!("correction-{}", Uuid::new_v4());
        let node = self
            .store
            .resolve_name(&correction.entity)?
            .ok_or_else(|| ServiceError::NotFound(format!("entity '{}'", correction.entity)))?;

        let mut outcome = CorrectionOutcome::default();
        let mut events: Vec<GraphEvent> = Vec::new();

        match correction.kind {
            CorrectionKind::Retract => {
                for edge in self.matching_edges(&node.id, correction)? {
                    self.store.retract_edge(&edge.id, "user_correction", &correlation)?;
                    events.push(GraphEvent::EdgeRetracted {
                        edge_id: edge.id,
                        reason: "user_correction".to_string(),
                    });
                    outcome.edges_retracted += 1;
                }
            }
            CorrectionKind::Delete => {
                if correction.relation.is_none() {
                    self.store.delete_node(&node.id, true, &correlation)?;
                    outcome.nodes_deleted += 1;
                } else {
                    for edge in self.matching_edges(&node.id, correction)? {
                        self.store.delete_edge(&edge.id, &correlation)?;
                        outcome.edges_deleted += 1;
                    }
                }
            }
            CorrectionKind::Revise => {
                let relation = correction.relation.as_deref().ok_or_else(|| {
                    ServiceError::InvalidRequest("revise requires a relation".to_string())
                })?;
                let new_value = correction.new_value.as_deref().ok_or_else(|| {
                    ServiceError::InvalidRequest("revise requires a new value".to_string())
                })?;
                let matches = self.matching_edges(&node.id, correction)?;
                let Some(edge) = matches.first() else {
                    return Err(ServiceError::NotFound(format!(
                        "no active '{}' edge for '{}'",
                        relation, correction.entity
                    )));
                };
                let (target, created) = self.store.upsert_node(
                    &NodeInput::new(NodeKind::Concept, new_value),
                    &correlation,
                )?;
                if created {
                    events.push(GraphEvent::NodeAdded { node: target.clone() });
                }
                let mut replacement = crate::graph::EdgeInput::new(
                    node.id.clone(),
                    target.id,
                    relation,
                    self.config.confidence.base_explicit,
                );
                replacement.temporal_type = edge.temporal_type;
                replacement.provenance = Provenance::UserCorrection;
                replacement.context_tags = edge.context_tags.clone();
                let (old, new) =
                    self.store
                        .revise_edge(&edge.id, &replacement, &self.config.confidence, &correlation)?;
                events.push(GraphEvent::EdgeRetracted {
                    edge_id: old.id,
                    reason: "user_correction".to_string(),
                });
                events.push(GraphEvent::EdgeAdded { edge: new });
                outcome.edges_revised += 1;
            }
        }

        self.store.audit_append(
            &AuditEntry::new(correlation, AuditKind::CorrectionApplied, "service", Operation::Revise)
                .node(node.id)
                .values(correction.old_value.clone(), correction.new_value.clone())
                .mechanism("user_correction"),
        )?;
        self.bus.emit_all(events);
        Ok(outcome)
    }

    fn matching_edges(&self, node_id: &str, correction: &UserCorrection) -> Result<Vec<Edge>> {
        let old_target_id = match &correction.old_value {
            Some(value) => self.store.resolve_name(value)?.map(|n| n.id),
            None => None,
        };
        let edges = self.store.edges(&EdgeFilter {
            source_id: Some(node_id),
            relation: correction.relation.as_deref(),
            ..Default::default()
        })?;
        Ok(edges
            .into_iter()
            .filter(|e| match &old_target_id {
                Some(target) => &e.target_id == target,
                None => true,
            })
            .collect())
    }

    // ========================================================================
    // PROVENANCE / EXPORT / SUBSCRIPTION
    // ========================================================================

    pub fn get_provenance(&self, edge_id: &str) -> Result<ProvenanceChain> {
        let edge = self
            .store
            .get_edge(edge_id)?
            .ok_or_else(|| ServiceError::NotFound(format!("edge '{edge_id}'")))?;
        let mut episodes = Vec::new();
        for episode_id in &edge.episode_ids {
            if let Some(episode) = self.store.get_episode(episode_id)? {
                episodes.push(episode);
            }
        }
        let audit = self
            .store
            .audit_recent(200)?
            .into_iter()
            .filter(|r| r.edge_id.as_deref() == Some(edge_id))
            .collect();
        Ok(ProvenanceChain { edge, episodes, audit })
    }

    pub fn graph_snapshot(&self, format: SnapshotFormat) -> Result<SnapshotOutput> {
        let snapshot = self.store.snapshot(false)?;
        Ok(match format {
            SnapshotFormat::Full => SnapshotOutput::Full(snapshot),
            SnapshotFormat::Graphml => SnapshotOutput::Graphml { graphml: snapshot.to_graphml() },
        })
    }

    pub fn subscribe(
        &self,
        label: impl Into<String>,
        filter: Option<HashSet<GraphEventType>>,
        subscriber: Arc<dyn Subscriber>,
    ) {
        self.bus.subscribe(label, filter, subscriber);
    }

    pub fn unsubscribe(&self, label: &str) {
        self.bus.unsubscribe(label);
    }

    // ========================================================================
    // HEALTH
    // ========================================================================

    pub async fn health(&self) -> Health {
        let store_stats = self.store.stats().ok();
        let small_breaker = self.llm_small.breaker_state().await;
        let large_breaker = self.llm_large.breaker_state().await;
        let degraded = store_stats.is_none()
            || small_breaker == BreakerState::Open
            || large_breaker == BreakerState::Open;

        Health {
            status: if degraded { "degraded" } else { "healthy" },
            uptime_secs: self.started_at.elapsed().as_secs(),
            store: store_stats,
            llm_small: LlmHealth {
                model: self.llm_small.model_name().to_string(),
                breaker: small_breaker,
                tokens_spent_today: self.llm_small.tokens_spent_today(),
            },
            llm_large: LlmHealth {
                model: self.llm_large.model_name().to_string(),
                breaker: large_breaker,
                tokens_spent_today: self.llm_large.tokens_spent_today(),
            },
            bus_subscribers: self.bus.subscriber_count(),
            events_emitted: self.bus.emit_count(),
            events_dropped: self.bus.dropped_count(),
            hallucinations_detected: self.pipeline.hallucination_count(),
        }
    }

    // ========================================================================
    // BACKGROUND WORKERS
    // ========================================================================

    /// Spawn the queue drain loop, maintenance loop, and scheduled
    /// cycles. Handles run until the service is dropped.
    pub fn spawn_background(self: &Arc<Self>) -> Vec<tokio::task::JoinHandle<()>> {
        let mut handles = Vec::new();
        let schedules = self.config.workers.clone();

        // Inbound drain loop — the single writer's feed.
        let service = Arc::clone(self);
        handles.push(tokio::spawn(async move {
            let mut tick = tokio::time::interval(std::time::Duration::from_millis(300));
            loop {
                tick.tick().await;
                if let Err(e) = service.process_pending().await {
                    warn!(error = %e, "queue drain failed");
                }
            }
        }));

        // Maintenance: retention purges and probe obsolescence.
        let service = Arc::clone(self);
        handles.push(tokio::spawn(async move {
            let mut tick = tokio::time::interval(std::time::Duration::from_secs(600));
            loop {
                tick.tick().await;
                if let Err(e) = service.inbound.purge_expired() {
                    warn!(error = %e, "inbound purge failed");
                }
                if let Err(e) = service.outbound.obsolete_expired(Utc::now()) {
                    warn!(error = %e, "probe obsolescence failed");
                }
            }
        }));

        if schedules.decay_enabled {
            let service = Arc::clone(self);
            let hours = schedules.decay_interval_hours;
            handles.push(tokio::spawn(async move {
                let mut tick =
                    tokio::time::interval(std::time::Duration::from_secs(hours * 3600));
                tick.tick().await; // first tick fires immediately; skip it
                loop {
                    tick.tick().await;
                    if let Err(e) =
                        workers::decay_cycle(&service.store, &service.bus, &service.config.confidence)
                    {
                        warn!(error = %e, "decay cycle failed");
                    }
                }
            }));
        }

        if schedules.revision_enabled {
            let service = Arc::clone(self);
            let hours = schedules.revision_interval_hours;
            handles.push(tokio::spawn(async move {
                let mut tick =
                    tokio::time::interval(std::time::Duration::from_secs(hours * 3600));
                tick.tick().await;
                loop {
                    tick.tick().await;
                    if let Err(e) = workers::revision_cycle(
                        &service.store,
                        &service.bus,
                        service.verifier.as_ref(),
                        &service.config.confidence,
                        &service.config.workers,
                    )
                    .await
                    {
                        warn!(error = %e, "revision cycle failed");
                    }
                }
            }));
        }

        if schedules.inference_enabled {
            let service = Arc::clone(self);
            let hours = schedules.inference_interval_hours;
            handles.push(tokio::spawn(async move {
                let mut tick =
                    tokio::time::interval(std::time::Duration::from_secs(hours * 3600));
                tick.tick().await;
                loop {
                    tick.tick().await;
                    if let Err(e) = workers::inference_cycle(
                        &service.store,
                        &service.bus,
                        &service.llm_large,
                        &service.config.confidence,
                        &service.config.workers,
                    )
                    .await
                    {
                        warn!(error = %e, "inference cycle failed");
                    }
                }
            }));
        }

        if schedules.clustering_enabled {
            let service = Arc::clone(self);
            let hours = schedules.clustering_interval_hours;
            handles.push(tokio::spawn(async move {
                let mut tick =
                    tokio::time::interval(std::time::Duration::from_secs(hours * 3600));
                tick.tick().await;
                loop {
                    tick.tick().await;
                    if let Err(e) = workers::clustering_cycle(
                        &service.store,
                        &service.bus,
                        &service.config.confidence,
                        &service.config.workers,
                    ) {
                        warn!(error = %e, "clustering cycle failed");
                    }
                }
            }));
        }

        handles
    }
}

// ============================================================================
// TESTS — end-to-end scenarios
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extraction::MockLanguageModel;
    use serde_json::json;
    use tempfile::TempDir;

    fn service_with(mock: Arc<MockLanguageModel>) -> (Arc<Tapestry>, TempDir) {
        let dir = TempDir::new().unwrap();
        let config = TapestryConfig {
            data_dir: Some(dir.path().join("tapestry.db")),
            ..Default::default()
        };
        let service = Tapestry::with_models(
            config,
            Arc::clone(&mock) as Arc<dyn LanguageModel>,
            mock,
            Arc::new(NoopVerifier),
        )
        .unwrap();
        (Arc::new(service), dir)
    }

    fn neutral_sentiment(mock: &MockLanguageModel, marker: &str) {
        mock.respond_when(
            "sentiment",
            marker,
            json!({"hedge": "none", "polarity": 0.0, "magnitude": 0.0}),
        );
    }

    /// Script the canonical "My wife Lena loves Malbec" extraction.
    fn script_wife_loves_malbec(mock: &MockLanguageModel) {
        mock.respond_when(
            "knowledge extraction",
            "lena loves malbec",
            json!({"entities": [
                {"name": "User", "kind": "person", "isNew": false},
                {"name": "Lena", "kind": "person", "isNew": true},
                {"name": "Malbec", "kind": "concept", "isNew": true}
            ]}),
        );
        mock.respond_when(
            "relation extraction",
            "lena loves malbec",
            json!({"relations": [
                {"source": "User", "target": "Lena", "relation": "married_to", "mechanism": "explicit"},
                {"source": "Lena", "target": "Malbec", "relation": "loves", "mechanism": "explicit"}
            ]}),
        );
        neutral_sentiment(mock, "lena loves malbec");
        mock.respond_when(
            "temporal scope",
            "lena loves malbec",
            json!({"relations": [
                {"index": 0, "temporalType": "trait", "expiry": null},
                {"index": 1, "temporalType": "trait", "expiry": null}
            ]}),
        );
    }

    async fn ingest(service: &Tapestry, session: &str, turn: u32, text: &str) {
        service
            .report_interaction(InteractionEvent::new(session, turn, text))
            .unwrap();
        service.process_pending().await.unwrap();
    }

    // ------------------------------------------------------------------
    // Scenario 1 — explicit preference
    // ------------------------------------------------------------------

    #[tokio::test]
    async fn test_scenario_explicit_preference() {
        let mock = Arc::new(MockLanguageModel::new());
        script_wife_loves_malbec(&mock);
        let (service, _dir) = service_with(mock);

        ingest(&service, "s1", 1, "My wife Lena loves Malbec").await;

        let snapshot = service.store().snapshot(false).unwrap();
        let names: HashSet<String> =
            snapshot.nodes.iter().map(|n| n.name.clone()).collect();
        assert!(names.contains("User"));
        assert!(names.contains("Lena"));
        assert!(names.contains("Malbec"));

        assert_eq!(snapshot.edges.len(), 2);
        let loves = snapshot.edges.iter().find(|e| e.relation == "loves").unwrap();
        assert!((loves.confidence - 0.90).abs() < 1e-9);
        assert_eq!(loves.temporal_type, crate::graph::TemporalType::Trait);
        assert_eq!(loves.provenance, Provenance::Explicit);
        assert_eq!(loves.episode_ids.len(), 1);

        // One episode, audit shows the inserts
        let stats = service.store().stats().unwrap();
        assert_eq!(stats.episode_count, 1);
        let audit = service.store().audit_by_correlation("s1:1").unwrap();
        let inserts = audit.iter().filter(|r| r.kind == "edge_inserted").count();
        assert_eq!(inserts, 2);
    }

    // ------------------------------------------------------------------
    // Scenario 2 — reinforcement + merge
    // ------------------------------------------------------------------

    #[tokio::test]
    async fn test_scenario_reinforcement_and_merge() {
        let mock = Arc::new(MockLanguageModel::new());
        script_wife_loves_malbec(&mock);
        mock.respond_when(
            "knowledge extraction",
            "malbec 2018",
            json!({"entities": [
                {"name": "Lena", "kind": "person", "isNew": false},
                {"name": "Malbec", "kind": "concept", "isNew": false},
                {"name": "Malbec 2018", "kind": "concept", "isNew": true}
            ]}),
        );
        mock.respond_when(
            "relation extraction",
            "malbec 2018",
            json!({"relations": [
                {"source": "Lena", "target": "Malbec", "relation": "loves", "mechanism": "explicit"},
                {"source": "Lena", "target": "Malbec 2018", "relation": "prefers", "mechanism": "explicit",
                 "refines": {"relation": "loves", "target": "Malbec"}}
            ]}),
        );
        neutral_sentiment(&mock, "malbec 2018");
        let (service, _dir) = service_with(mock);

        ingest(&service, "s1", 1, "My wife Lena loves Malbec").await;
        ingest(&service, "s1", 2, "Lena really loves the Malbec 2018 vintage").await;

        let snapshot = service.store().snapshot(false).unwrap();
        let loves = snapshot.edges.iter().find(|e| e.relation == "loves").unwrap();
        assert!((loves.confidence - 0.908).abs() < 1e-9);
        assert_eq!(loves.episode_ids.len(), 2);

        let prefers = snapshot.edges.iter().find(|e| e.relation == "prefers").unwrap();
        assert_eq!(prefers.refines.as_deref(), Some(loves.id.as_str()));

        let audit = service.store().audit_by_correlation("s1:2").unwrap();
        assert_eq!(audit.iter().filter(|r| r.kind == "edge_reinforced").count(), 1);
        assert_eq!(audit.iter().filter(|r| r.kind == "edge_merged").count(), 1);
    }

    // ------------------------------------------------------------------
    // Scenario 3 — contradiction and revise
    // ------------------------------------------------------------------

    #[tokio::test]
    async fn test_scenario_contradict_revise() {
        let mock = Arc::new(MockLanguageModel::new());
        mock.respond_when(
            "knowledge extraction",
            "lena is 47",
            json!({"entities": [
                {"name": "Lena", "kind": "person", "isNew": true},
                {"name": "47", "kind": "concept", "isNew": true}
            ]}),
        );
        mock.respond_when(
            "relation extraction",
            "lena is 47",
            json!({"relations": [
                {"source": "Lena", "target": "47", "relation": "age", "mechanism": "observational"}
            ]}),
        );
        neutral_sentiment(&mock, "lena is 47");

        mock.respond_when(
            "knowledge extraction",
            "actually lena is 46",
            json!({"entities": [
                {"name": "Lena", "kind": "person", "isNew": false},
                {"name": "46", "kind": "concept", "isNew": true}
            ]}),
        );
        mock.respond_when(
            "relation extraction",
            "actually lena is 46",
            json!({"relations": [
                {"source": "Lena", "target": "46", "relation": "age", "mechanism": "explicit"}
            ]}),
        );
        neutral_sentiment(&mock, "actually lena is 46");
        let (service, _dir) = service_with(mock);

        // Observational 0.65 first, explicit 0.90 second: margin met.
        ingest(&service, "s1", 1, "I think Lena is 47 or so").await;
        ingest(&service, "s1", 2, "Actually Lena is 46").await;

        let active = service.store().snapshot(false).unwrap();
        let age = active.edges.iter().find(|e| e.relation == "age").unwrap();
        let target = service.store().get_node(&age.target_id).unwrap().unwrap();
        assert_eq!(target.name, "46");
        assert!((age.confidence - 0.90).abs() < 1e-9);

        let all = service.store().snapshot(true).unwrap();
        let old = all.edges.iter().find(|e| e.retracted).unwrap();
        assert_eq!(old.retraction_reason.as_deref(), Some("superseded"));

        let audit = service.store().audit_by_correlation("s1:2").unwrap();
        assert_eq!(audit.iter().filter(|r| r.kind == "edge_revised").count(), 1);
        assert_eq!(audit.iter().filter(|r| r.kind == "edge_inserted").count(), 1);
    }

    // ------------------------------------------------------------------
    // Scenario 4 — hallucination rejection
    // ------------------------------------------------------------------

    #[tokio::test]
    async fn test_scenario_hallucination_rejected() {
        let mock = Arc::new(MockLanguageModel::new());
        mock.respond_when(
            "knowledge extraction",
            "nice day",
            json!({"entities": [
                {"name": "Boris", "kind": "person", "isNew": true},
                {"name": "Natasha", "kind": "person", "isNew": true},
                {"name": "Moose", "kind": "person", "isNew": true}
            ]}),
        );
        neutral_sentiment(&mock, "nice day");
        let (service, _dir) = service_with(mock);

        ingest(&service, "s1", 1, "nice day").await;

        // No mutation happened
        let stats = service.store().stats().unwrap();
        assert_eq!(stats.node_count, 0);
        assert_eq!(stats.active_edge_count, 0);

        // Counter and audit record exist
        assert!(service.health().await.hallucinations_detected >= 1);
        assert!(
            service
                .store()
                .audit_count_kind(AuditKind::HallucinationDetected)
                .unwrap()
                >= 1
        );
    }

    // ------------------------------------------------------------------
    // Scenario 5 — probe generation and gated delivery
    // ------------------------------------------------------------------

    #[tokio::test]
    async fn test_scenario_probe_generated_and_gated() {
        let mock = Arc::new(MockLanguageModel::new());
        script_wife_loves_malbec(&mock);
        mock.respond_when(
            "knowledge extraction",
            "getting into wine",
            json!({"entities": [
                {"name": "User", "kind": "person", "isNew": false},
                {"name": "wine", "kind": "concept", "isNew": true}
            ]}),
        );
        mock.respond_when(
            "relation extraction",
            "getting into wine",
            json!({"relations": [
                {"source": "User", "target": "wine", "relation": "interested_in", "mechanism": "explicit"}
            ]}),
        );
        neutral_sentiment(&mock, "getting into wine");
        let (service, _dir) = service_with(mock);

        // Lena exists but has no wine preference yet: the wine utterance
        // opens a knowledge gap.
        ingest(&service, "s1", 1, "My wife Lena loves Malbec").await;
        // Retract Lena's only wine-tagged edge so the gap is real.
        service
            .user_correction(&UserCorrection {
                kind: CorrectionKind::Retract,
                entity: "Lena".to_string(),
                relation: Some("loves".to_string()),
                old_value: None,
                new_value: None,
            })
            .unwrap();
        ingest(&service, "s1", 2, "I am getting into wine lately").await;

        assert!(service.store().outbound_pending_count().unwrap() >= 1);

        // Delivery at turn 4 with matching context
        let delivered = service
            .get_probes(
                "s1",
                &["wine".to_string(), "interested_in".to_string()],
                &["Lena".to_string()],
                4,
            )
            .unwrap();
        let (probe, _score) = delivered.expect("probe should be delivered");
        assert_eq!(probe.kind, crate::queues::outbound::OutboundKind::Probe);

        // Immediately asking again: max one probe per conversation.
        let second = service
            .get_probes("s1", &["wine".to_string()], &["Lena".to_string()], 5)
            .unwrap();
        assert!(second.is_none());
    }

    // ------------------------------------------------------------------
    // Boundary behaviors
    // ------------------------------------------------------------------

    #[tokio::test]
    async fn test_empty_and_punctuation_utterances_skip() {
        let mock = Arc::new(MockLanguageModel::new());
        let (service, _dir) = service_with(Arc::clone(&mock));

        ingest(&service, "s1", 1, "   ").await;
        ingest(&service, "s1", 2, "?!?!").await;
        ingest(&service, "s1", 3, "```\nlet x = 1;\n```").await;

        let stats = service.store().stats().unwrap();
        assert_eq!(stats.node_count, 0);
        assert_eq!(stats.episode_count, 0);
        assert_eq!(mock.call_count(), 0);
        // Only "skipped" audit records exist
        assert!(service.store().audit_count_kind(AuditKind::ExtractionSkipped).unwrap() >= 3);
    }

    #[tokio::test]
    async fn test_duplicate_idempotency_key_processed_once() {
        let mock = Arc::new(MockLanguageModel::new());
        script_wife_loves_malbec(&mock);
        let (service, _dir) = service_with(mock);

        let event = InteractionEvent::new("s1", 1, "My wife Lena loves Malbec");
        assert_eq!(
            service.report_interaction(event.clone()).unwrap(),
            EnqueueResult::Accepted
        );
        assert_eq!(
            service.report_interaction(event).unwrap(),
            EnqueueResult::Duplicate
        );
        service.process_pending().await.unwrap();

        let snapshot = service.store().snapshot(false).unwrap();
        assert_eq!(snapshot.edges.len(), 2);
        let loves = snapshot.edges.iter().find(|e| e.relation == "loves").unwrap();
        // Exactly one processing pass: no double reinforcement
        assert!((loves.confidence - 0.90).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_probe_retrieval_from_empty_queue() {
        let mock = Arc::new(MockLanguageModel::new());
        let (service, _dir) = service_with(mock);
        let probe = service.get_probes("s1", &["wine".to_string()], &[], 10).unwrap();
        assert!(probe.is_none());
        // Counters unchanged
        assert_eq!(service.store().counter_get("probe", "conversation:s1").unwrap(), 0);
    }

    #[tokio::test]
    async fn test_llm_outage_retries_then_dead_letters() {
        let mock = Arc::new(MockLanguageModel::new());
        mock.fail_next(1000);
        let (service, _dir) = service_with(mock);

        service
            .report_interaction(InteractionEvent::new("s1", 1, "My wife Lena loves Malbec"))
            .unwrap();

        // Drive the retry ladder by hand: after each failed pass, make
        // the backoff deadline due immediately and go again.
        for _ in 0..4 {
            service.process_pending().await.unwrap();
            if !service.inbound.dead_letters().unwrap().is_empty() {
                break;
            }
            if let Ok(Some(row)) = service
                .store()
                .claim_next_inbound(Utc::now() + chrono::Duration::seconds(600))
            {
                service.inbound.release(&row).unwrap();
            }
        }

        // Three failures moved the event to the dead-letter store; the
        // graph was never touched and nothing crashed.
        assert_eq!(service.inbound.dead_letters().unwrap().len(), 1);
        assert_eq!(service.store().stats().unwrap().node_count, 0);
    }

    // ------------------------------------------------------------------
    // Corrections
    // ------------------------------------------------------------------

    #[tokio::test]
    async fn test_user_correction_revise() {
        let mock = Arc::new(MockLanguageModel::new());
        script_wife_loves_malbec(&mock);
        let (service, _dir) = service_with(mock);
        ingest(&service, "s1", 1, "My wife Lena loves Malbec").await;

        let outcome = service
            .user_correction(&UserCorrection {
                kind: CorrectionKind::Revise,
                entity: "Lena".to_string(),
                relation: Some("loves".to_string()),
                old_value: Some("Malbec".to_string()),
                new_value: Some("Pinot Noir".to_string()),
            })
            .unwrap();
        assert_eq!(outcome.edges_revised, 1);

        let snapshot = service.store().snapshot(false).unwrap();
        let loves = snapshot.edges.iter().find(|e| e.relation == "loves").unwrap();
        let target = service.store().get_node(&loves.target_id).unwrap().unwrap();
        assert_eq!(target.name, "Pinot Noir");
        assert_eq!(loves.provenance, Provenance::UserCorrection);
    }

    #[tokio::test]
    async fn test_user_correction_unknown_entity_surfaces() {
        let mock = Arc::new(MockLanguageModel::new());
        let (service, _dir) = service_with(mock);
        let err = service
            .user_correction(&UserCorrection {
                kind: CorrectionKind::Retract,
                entity: "Nobody".to_string(),
                relation: None,
                old_value: None,
                new_value: None,
            })
            .unwrap_err();
        assert!(matches!(err, ServiceError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_user_correction_delete_erases_node() {
        let mock = Arc::new(MockLanguageModel::new());
        script_wife_loves_malbec(&mock);
        let (service, _dir) = service_with(mock);
        ingest(&service, "s1", 1, "My wife Lena loves Malbec").await;

        let outcome = service
            .user_correction(&UserCorrection {
                kind: CorrectionKind::Delete,
                entity: "Lena".to_string(),
                relation: None,
                old_value: None,
                new_value: None,
            })
            .unwrap();
        assert_eq!(outcome.nodes_deleted, 1);
        assert!(service.store().resolve_name("Lena").unwrap().is_none());
    }

    // ------------------------------------------------------------------
    // Provenance, snapshot, health
    // ------------------------------------------------------------------

    #[tokio::test]
    async fn test_provenance_chain_links_episode() {
        let mock = Arc::new(MockLanguageModel::new());
        script_wife_loves_malbec(&mock);
        let (service, _dir) = service_with(mock);
        ingest(&service, "s1", 1, "My wife Lena loves Malbec").await;

        let snapshot = service.store().snapshot(false).unwrap();
        let edge = &snapshot.edges[0];
        let chain = service.get_provenance(&edge.id).unwrap();
        assert_eq!(chain.episodes.len(), 1);
        assert_eq!(chain.episodes[0].session_id, "s1");
        assert!(!chain.audit.is_empty());
    }

    #[tokio::test]
    async fn test_snapshot_formats() {
        let mock = Arc::new(MockLanguageModel::new());
        script_wife_loves_malbec(&mock);
        let (service, _dir) = service_with(mock);
        ingest(&service, "s1", 1, "My wife Lena loves Malbec").await;

        match service.graph_snapshot(SnapshotFormat::Full).unwrap() {
            SnapshotOutput::Full(snapshot) => assert_eq!(snapshot.stats.edge_count, 2),
            _ => panic!("expected full snapshot"),
        }
        match service.graph_snapshot(SnapshotFormat::Graphml).unwrap() {
            SnapshotOutput::Graphml { graphml } => assert!(graphml.contains("<graphml")),
            _ => panic!("expected graphml"),
        }
    }

    #[tokio::test]
    async fn test_health_reports_components() {
        let mock = Arc::new(MockLanguageModel::new());
        let (service, _dir) = service_with(mock);
        let health = service.health().await;
        assert_eq!(health.status, "healthy");
        assert_eq!(health.llm_small.breaker, BreakerState::Closed);
        assert!(health.store.is_some());
    }

    #[tokio::test]
    async fn test_nl_query_after_ingest() {
        let mock = Arc::new(MockLanguageModel::new());
        script_wife_loves_malbec(&mock);
        mock.respond_when(
            "query planner",
            "what does my wife like",
            json!({
                "entities": ["Lena"],
                "relations": ["loves", "prefers"],
                "minConfidence": 0.0,
                "maxHops": 1,
                "reasoning": "wife resolves to Lena"
            }),
        );
        let (service, _dir) = service_with(mock);
        ingest(&service, "s1", 1, "My wife Lena loves Malbec").await;

        let (result, plan) = service.query_nl("what does my wife like?").await;
        assert!(!plan.fallback);
        assert_eq!(result.edges.len(), 1);
        assert_eq!(result.edges[0].relation, "loves");
    }

    #[tokio::test]
    async fn test_subscriber_sees_mutations() {
        use std::sync::atomic::{AtomicUsize, Ordering};

        struct Counting(Arc<AtomicUsize>);

        #[async_trait::async_trait]
        impl Subscriber for Counting {
            async fn handle(&self, _event: GraphEvent) -> std::result::Result<(), String> {
                self.0.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        }

        let mock = Arc::new(MockLanguageModel::new());
        script_wife_loves_malbec(&mock);
        let (service, _dir) = service_with(mock);

        let seen = Arc::new(AtomicUsize::new(0));
        service.subscribe("test", None, Arc::new(Counting(Arc::clone(&seen))));

        ingest(&service, "s1", 1, "My wife Lena loves Malbec").await;
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        // 3 node adds + 2 edge adds
        assert!(seen.load(Ordering::SeqCst) >= 5);
    }
}
