//! SQLite graph store implementation.
//!
//! The store is the single shared mutable state in the service. It keeps
//! separate reader/writer connections for interior mutability: all
//! methods take `&self`, so the service layer can hold `Arc<GraphStore>`
//! without an outer mutex. Mutations run on the writer inside a
//! transaction together with their audit records; an interaction's whole
//! delta commits atomically or not at all.

use std::path::PathBuf;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use directories::ProjectDirs;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension};
use serde::Serialize;
use uuid::Uuid;

use crate::audit::{AuditEntry, AuditKind, AuditRecord, Operation};
use crate::confidence::{self, ConfidenceParams};
use crate::diff::{self, DeltaOutcome, DiffAction, PreparedDelta, VerificationRequest};
use crate::events::GraphEvent;
use crate::graph::{
    fold_name, Edge, EdgeInput, Episode, Node, NodeInput, NodeKind, PrivacyLevel, Provenance,
    TemporalType,
};
use crate::queues::inbound::InteractionEvent;
use crate::queues::outbound::{OutboundItem, OutboundKind, ProbeState};

// ============================================================================
// ERROR TYPES
// ============================================================================

/// Store error type
#[non_exhaustive]
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Database error
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),
    /// Entity not found
    #[error("Not found: {0}")]
    NotFound(String),
    /// A graph invariant would be violated by the mutation
    #[error("Invariant violation: {0}")]
    InvariantViolation(String),
    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    /// Invalid stored timestamp
    #[error("Invalid timestamp: {0}")]
    InvalidTimestamp(String),
    /// Serialization error
    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),
    /// Initialization error
    #[error("Initialization error: {0}")]
    Init(String),
}

/// Store result type
pub type Result<T> = std::result::Result<T, StoreError>;

// ============================================================================
// RESULT TYPES
// ============================================================================

/// Outcome of an enqueue attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EnqueueResult {
    Accepted,
    Duplicate,
}

/// A claimed inbound queue row
#[derive(Debug, Clone)]
pub struct InboundRow {
    pub event: InteractionEvent,
    pub attempts: u32,
    pub enqueued_at: DateTime<Utc>,
    pub status: String,
    pub last_error: Option<String>,
}

/// Aggregate counts for a snapshot
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotStats {
    pub node_count: usize,
    pub edge_count: usize,
}

/// Full export of the graph
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GraphSnapshot {
    pub nodes: Vec<Node>,
    pub edges: Vec<Edge>,
    pub stats: SnapshotStats,
}

impl GraphSnapshot {
    /// Minimal GraphML rendering: nodes with kind/name, edges with
    /// relation/confidence.
    pub fn to_graphml(&self) -> String {
        let mut out = String::with_capacity(4096);
        out.push_str("<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n");
        out.push_str("<graphml xmlns=\"http://graphml.graphdrawing.org/xmlns\">\n");
        out.push_str("  <key id=\"name\" for=\"node\" attr.name=\"name\" attr.type=\"string\"/>\n");
        out.push_str("  <key id=\"kind\" for=\"node\" attr.name=\"kind\" attr.type=\"string\"/>\n");
        out.push_str("  <key id=\"relation\" for=\"edge\" attr.name=\"relation\" attr.type=\"string\"/>\n");
        out.push_str(
            "  <key id=\"confidence\" for=\"edge\" attr.name=\"confidence\" attr.type=\"double\"/>\n",
        );
        out.push_str("  <graph edgedefault=\"directed\">\n");
        for node in &self.nodes {
            out.push_str(&format!(
                "    <node id=\"{}\"><data key=\"name\">{}</data><data key=\"kind\">{}</data></node>\n",
                xml_escape(&node.id),
                xml_escape(&node.name),
                node.kind.as_str(),
            ));
        }
        for edge in &self.edges {
            out.push_str(&format!(
                "    <edge id=\"{}\" source=\"{}\" target=\"{}\"><data key=\"relation\">{}</data><data key=\"confidence\">{:.4}</data></edge>\n",
                xml_escape(&edge.id),
                xml_escape(&edge.source_id),
                xml_escape(&edge.target_id),
                xml_escape(&edge.relation),
                edge.confidence,
            ));
        }
        out.push_str("  </graph>\n</graphml>\n");
        out
    }
}

fn xml_escape(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

/// Store-level counters for health reporting
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreStats {
    pub node_count: usize,
    pub active_edge_count: usize,
    pub total_edge_count: usize,
    pub episode_count: usize,
    pub audit_count: usize,
    pub pending_inbound: usize,
    pub dead_letters: usize,
    pub pending_outbound: usize,
}

/// Filter for edge listing
#[derive(Debug, Clone, Default)]
pub struct EdgeFilter<'a> {
    pub source_id: Option<&'a str>,
    pub target_id: Option<&'a str>,
    pub relation: Option<&'a str>,
    pub min_confidence: f64,
    pub include_inactive: bool,
}

/// Lease applied when claiming an inbound row; an expired lease makes the
/// row reclaimable after a crash mid-processing.
const CLAIM_LEASE_SECS: i64 = 120;

const COMPONENT_STORE: &str = "store";
const COMPONENT_DIFF: &str = "diff";

// ============================================================================
// STORE
// ============================================================================

/// SQLite-backed graph store.
///
/// Writer and reader connections to the same WAL database; all mutation
/// paths serialize through the writer lock, which is what makes the
/// store a single logical writer.
pub struct GraphStore {
    writer: Mutex<Connection>,
    reader: Mutex<Connection>,
}

impl GraphStore {
    /// Apply performance pragmas to a connection
    fn configure_connection(conn: &Connection) -> Result<()> {
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;
             PRAGMA cache_size = -32000;
             PRAGMA temp_store = MEMORY;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )?;
        Ok(())
    }

    /// Create a store at the given path, or the platform data directory.
    pub fn new(db_path: Option<PathBuf>) -> Result<Self> {
        let path = match db_path {
            Some(p) => p,
            None => {
                let proj_dirs = ProjectDirs::from("ai", "tapestry", "core").ok_or_else(|| {
                    StoreError::Init("Could not determine project directories".to_string())
                })?;
                let data_dir = proj_dirs.data_dir();
                std::fs::create_dir_all(data_dir)?;
                data_dir.join("tapestry.db")
            }
        };

        let writer_conn = Connection::open(&path)?;
        Self::configure_connection(&writer_conn)?;
        super::migrations::apply_migrations(&writer_conn)?;

        let reader_conn = Connection::open(&path)?;
        Self::configure_connection(&reader_conn)?;

        Ok(Self { writer: Mutex::new(writer_conn), reader: Mutex::new(reader_conn) })
    }

    fn writer(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.writer.lock().map_err(|_| StoreError::Init("writer lock poisoned".to_string()))
    }

    fn reader(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.reader.lock().map_err(|_| StoreError::Init("reader lock poisoned".to_string()))
    }

    // ========================================================================
    // NODES
    // ========================================================================

    /// Upsert a node by alias equivalence. Returns the representative and
    /// whether it was newly created.
    pub fn upsert_node(&self, input: &NodeInput, correlation_id: &str) -> Result<(Node, bool)> {
        let mut conn = self.writer()?;
        let tx = conn.transaction()?;
        let result = upsert_node_tx(&tx, input, correlation_id)?;
        tx.commit()?;
        Ok(result)
    }

    pub fn get_node(&self, id: &str) -> Result<Option<Node>> {
        let conn = self.reader()?;
        get_node_conn(&conn, id)
    }

    /// Resolve a display name or alias to its representative node.
    pub fn resolve_name(&self, name: &str) -> Result<Option<Node>> {
        let conn = self.reader()?;
        resolve_name_conn(&conn, name)
    }

    /// Find nodes by kind and/or case-insensitive name substring.
    pub fn find_nodes(
        &self,
        kind: Option<NodeKind>,
        name_contains: Option<&str>,
    ) -> Result<Vec<Node>> {
        let conn = self.reader()?;
        let mut sql = "SELECT id FROM nodes WHERE 1=1".to_string();
        let mut args: Vec<String> = Vec::new();
        if let Some(k) = kind {
            sql.push_str(" AND kind = ?");
            args.push(k.as_str().to_string());
        }
        if let Some(fragment) = name_contains {
            sql.push_str(" AND name_folded LIKE ?");
            args.push(format!("%{}%", fold_name(fragment)));
        }
        sql.push_str(" ORDER BY created_at");

        let mut stmt = conn.prepare(&sql)?;
        let ids: Vec<String> = stmt
            .query_map(params_from_iter(args.iter()), |row| row.get(0))?
            .collect::<std::result::Result<_, _>>()?;
        drop(stmt);

        ids.iter()
            .map(|id| get_node_conn(&conn, id)?.ok_or_else(|| StoreError::NotFound(id.clone())))
            .collect()
    }

    /// Delete a node. With `cascade`, its edges go too; without it, a
    /// node with live edges is an invariant violation. Audit records keep
    /// metadata only.
    pub fn delete_node(&self, id: &str, cascade: bool, correlation_id: &str) -> Result<()> {
        let mut conn = self.writer()?;
        let tx = conn.transaction()?;

        let node = get_node_conn(&tx, id)?.ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        let edge_ids: Vec<String> = {
            let mut stmt =
                tx.prepare("SELECT id FROM edges WHERE source_id = ?1 OR target_id = ?1")?;
            let ids = stmt
                .query_map(params![id], |row| row.get(0))?
                .collect::<std::result::Result<_, _>>()?;
            ids
        };

        if !edge_ids.is_empty() && !cascade {
            return Err(StoreError::InvariantViolation(format!(
                "node {id} has {} edges; delete requires cascade",
                edge_ids.len()
            )));
        }

        for edge_id in &edge_ids {
            tx.execute("DELETE FROM edges WHERE id = ?1", params![edge_id])?;
            audit_tx(
                &tx,
                &AuditEntry::new(correlation_id, AuditKind::EdgeDeleted, COMPONENT_STORE, Operation::Delete)
                    .edge(edge_id.clone()),
            )?;
        }
        tx.execute("DELETE FROM nodes WHERE id = ?1", params![id])?;
        audit_tx(
            &tx,
            &AuditEntry::new(correlation_id, AuditKind::NodeDeleted, COMPONENT_STORE, Operation::Delete)
                .node(node.id),
        )?;
        tx.commit()?;
        Ok(())
    }

    // ========================================================================
    // EDGES
    // ========================================================================

    /// Create an edge. Fails with `InvariantViolation` when an endpoint is
    /// missing or the privacy spread is illegal (a sealed node may not be
    /// linked to a public one).
    pub fn create_edge(
        &self,
        input: &EdgeInput,
        params_cfg: &ConfidenceParams,
        correlation_id: &str,
    ) -> Result<Edge> {
        let mut conn = self.writer()?;
        let tx = conn.transaction()?;
        let edge = create_edge_tx(&tx, input, params_cfg, correlation_id)?;
        tx.commit()?;
        Ok(edge)
    }

    pub fn get_edge(&self, id: &str) -> Result<Option<Edge>> {
        let conn = self.reader()?;
        get_edge_conn(&conn, id)
    }

    /// List edges by filter, ordered by descending confidence then
    /// ascending first_observed.
    pub fn edges(&self, filter: &EdgeFilter<'_>) -> Result<Vec<Edge>> {
        let conn = self.reader()?;
        let mut sql = format!("SELECT {EDGE_COLUMNS} FROM edges WHERE confidence >= ?1");
        let mut args: Vec<rusqlite::types::Value> =
            vec![rusqlite::types::Value::Real(filter.min_confidence)];
        if let Some(s) = filter.source_id {
            sql.push_str(" AND source_id = ?");
            args.push(rusqlite::types::Value::Text(s.to_string()));
        }
        if let Some(t) = filter.target_id {
            sql.push_str(" AND target_id = ?");
            args.push(rusqlite::types::Value::Text(t.to_string()));
        }
        if let Some(r) = filter.relation {
            sql.push_str(" AND relation = ?");
            args.push(rusqlite::types::Value::Text(r.to_string()));
        }
        sql.push_str(" ORDER BY confidence DESC, first_observed ASC");

        let mut stmt = conn.prepare(&sql)?;
        let mut edges: Vec<Edge> = stmt
            .query_map(params_from_iter(args.iter()), row_to_edge)?
            .collect::<std::result::Result<_, _>>()?;
        drop(stmt);

        let now = Utc::now();
        for edge in edges.iter_mut() {
            edge.episode_ids = episode_ids_for_edge(&conn, &edge.id)?;
        }
        if !filter.include_inactive {
            edges.retain(|e| e.is_active_at(now));
        }
        Ok(edges)
    }

    /// Edges adjacent to any of the given nodes (either direction), for
    /// BFS frontier expansion.
    pub fn adjacent_edges(
        &self,
        node_ids: &[String],
        relation_filter: Option<&[String]>,
        min_confidence: f64,
        include_inactive: bool,
    ) -> Result<Vec<Edge>> {
        if node_ids.is_empty() {
            return Ok(vec![]);
        }
        let conn = self.reader()?;
        let placeholders = vec!["?"; node_ids.len()].join(",");
        let sql = format!(
            "SELECT {EDGE_COLUMNS} FROM edges
             WHERE (source_id IN ({placeholders}) OR target_id IN ({placeholders}))
             ORDER BY confidence DESC, first_observed ASC"
        );
        let mut args: Vec<&str> = node_ids.iter().map(|s| s.as_str()).collect();
        args.extend(node_ids.iter().map(|s| s.as_str()));

        let mut stmt = conn.prepare(&sql)?;
        let mut edges: Vec<Edge> = stmt
            .query_map(params_from_iter(args.iter()), row_to_edge)?
            .collect::<std::result::Result<_, _>>()?;
        drop(stmt);

        let now = Utc::now();
        edges.retain(|e| e.confidence >= min_confidence);
        if !include_inactive {
            edges.retain(|e| e.is_active_at(now));
        }
        if let Some(relations) = relation_filter {
            edges.retain(|e| relations.iter().any(|r| *r == e.relation));
        }
        for edge in edges.iter_mut() {
            edge.episode_ids = episode_ids_for_edge(&conn, &edge.id)?;
        }
        Ok(edges)
    }

    /// Nodes within `max_hops` of a node, BFS with per-level filters.
    pub fn neighbors(
        &self,
        node_id: &str,
        max_hops: u32,
        relation_filter: Option<&[String]>,
        min_confidence: f64,
    ) -> Result<Vec<Node>> {
        let mut visited: Vec<String> = vec![node_id.to_string()];
        let mut frontier: Vec<String> = vec![node_id.to_string()];

        for _ in 0..max_hops {
            let edges = self.adjacent_edges(&frontier, relation_filter, min_confidence, false)?;
            let mut next: Vec<String> = Vec::new();
            for edge in &edges {
                for candidate in [&edge.source_id, &edge.target_id] {
                    if !visited.contains(candidate) {
                        visited.push(candidate.clone());
                        next.push(candidate.clone());
                    }
                }
            }
            if next.is_empty() {
                break;
            }
            frontier = next;
        }

        visited
            .into_iter()
            .filter(|id| id != node_id)
            .map(|id| self.get_node(&id)?.ok_or(StoreError::NotFound(id)))
            .collect()
    }

    /// Reinforce an edge to a pre-computed confidence, appending the episode.
    pub fn reinforce_edge(
        &self,
        edge_id: &str,
        new_confidence: f64,
        episode_id: &str,
        correlation_id: &str,
    ) -> Result<Edge> {
        let mut conn = self.writer()?;
        let tx = conn.transaction()?;
        let edge = reinforce_edge_tx(&tx, edge_id, new_confidence, episode_id, correlation_id)?;
        tx.commit()?;
        Ok(edge)
    }

    /// Retract an edge (kept for audit, absent from queries).
    pub fn retract_edge(&self, edge_id: &str, reason: &str, correlation_id: &str) -> Result<Edge> {
        let mut conn = self.writer()?;
        let tx = conn.transaction()?;
        let edge = retract_edge_tx(&tx, edge_id, reason, correlation_id)?;
        tx.commit()?;
        Ok(edge)
    }

    /// Archive an edge whose confidence decayed below threshold.
    pub fn archive_edge(&self, edge_id: &str, correlation_id: &str) -> Result<Edge> {
        let mut conn = self.writer()?;
        let tx = conn.transaction()?;
        let before = get_edge_conn(&tx, edge_id)?
            .ok_or_else(|| StoreError::NotFound(edge_id.to_string()))?;
        tx.execute("UPDATE edges SET archived = 1 WHERE id = ?1", params![edge_id])?;
        audit_tx(
            &tx,
            &AuditEntry::new(correlation_id, AuditKind::EdgeArchived, COMPONENT_STORE, Operation::Archive)
                .edge(edge_id)
                .confidence(Some(before.confidence), Some(before.confidence)),
        )?;
        tx.commit()?;
        let mut after = before;
        after.archived = true;
        Ok(after)
    }

    /// Update an edge's confidence from the decay cycle.
    pub fn decay_edge(
        &self,
        edge_id: &str,
        new_confidence: f64,
        correlation_id: &str,
    ) -> Result<Edge> {
        let mut conn = self.writer()?;
        let tx = conn.transaction()?;
        let before = get_edge_conn(&tx, edge_id)?
            .ok_or_else(|| StoreError::NotFound(edge_id.to_string()))?;
        tx.execute(
            "UPDATE edges SET confidence = ?2 WHERE id = ?1",
            params![edge_id, new_confidence],
        )?;
        audit_tx(
            &tx,
            &AuditEntry::new(correlation_id, AuditKind::EdgeDecayed, COMPONENT_STORE, Operation::Revise)
                .edge(edge_id)
                .confidence(Some(before.confidence), Some(new_confidence)),
        )?;
        tx.commit()?;
        let mut after = before;
        after.confidence = new_confidence;
        Ok(after)
    }

    /// Retract an old edge and insert its replacement atomically.
    pub fn revise_edge(
        &self,
        old_edge_id: &str,
        replacement: &EdgeInput,
        params_cfg: &ConfidenceParams,
        correlation_id: &str,
    ) -> Result<(Edge, Edge)> {
        let mut conn = self.writer()?;
        let tx = conn.transaction()?;
        let (old, new) =
            revise_edge_tx(&tx, old_edge_id, replacement, params_cfg, correlation_id)?;
        tx.commit()?;
        Ok((old, new))
    }

    /// Physically delete an edge (user erasure only). The audit record
    /// carries metadata, never the deleted payload.
    pub fn delete_edge(&self, edge_id: &str, correlation_id: &str) -> Result<()> {
        let mut conn = self.writer()?;
        let tx = conn.transaction()?;
        let existing = get_edge_conn(&tx, edge_id)?
            .ok_or_else(|| StoreError::NotFound(edge_id.to_string()))?;
        tx.execute("DELETE FROM edges WHERE id = ?1", params![edge_id])?;
        audit_tx(
            &tx,
            &AuditEntry::new(correlation_id, AuditKind::EdgeDeleted, COMPONENT_STORE, Operation::Delete)
                .edge(existing.id),
        )?;
        tx.commit()?;
        Ok(())
    }

    // ========================================================================
    // EPISODES
    // ========================================================================

    pub fn create_episode(&self, episode: &Episode) -> Result<()> {
        let conn = self.writer()?;
        insert_episode_conn(&conn, episode)?;
        Ok(())
    }

    pub fn get_episode(&self, id: &str) -> Result<Option<Episode>> {
        let conn = self.reader()?;
        get_episode_conn(&conn, id)
    }

    /// Episodes recorded since a cutoff, newest last (clustering input).
    pub fn episodes_since(&self, cutoff: DateTime<Utc>) -> Result<Vec<Episode>> {
        let conn = self.reader()?;
        let mut stmt = conn.prepare(
            "SELECT id FROM episodes WHERE occurred_at >= ?1 ORDER BY occurred_at ASC",
        )?;
        let ids: Vec<String> = stmt
            .query_map(params![cutoff.to_rfc3339()], |row| row.get(0))?
            .collect::<std::result::Result<_, _>>()?;
        drop(stmt);
        ids.iter()
            .map(|id| get_episode_conn(&conn, id)?.ok_or_else(|| StoreError::NotFound(id.clone())))
            .collect()
    }

    // ========================================================================
    // SNAPSHOT / IMPORT
    // ========================================================================

    pub fn snapshot(&self, include_inactive: bool) -> Result<GraphSnapshot> {
        let nodes = self.find_nodes(None, None)?;
        let edges = self.edges(&EdgeFilter { include_inactive, ..Default::default() })?;
        let stats = SnapshotStats { node_count: nodes.len(), edge_count: edges.len() };
        Ok(GraphSnapshot { nodes, edges, stats })
    }

    /// Re-ingest a snapshot: node equivalence classes are rebuilt through
    /// the normal upsert path and active edges are re-created against a
    /// synthetic import episode.
    pub fn import_snapshot(&self, snapshot: &GraphSnapshot, params_cfg: &ConfidenceParams) -> Result<usize> {
        let correlation = format!("import-{}", Uuid::new_v4());
        let episode = Episode {
            id: Uuid::new_v4().to_string(),
            occurred_at: Utc::now(),
            session_id: "import".to_string(),
            turn_number: 0,
            channel: "import".to_string(),
            sentiment: 0.0,
            outcome: 0.0,
            edge_ids: vec![],
        };
        self.create_episode(&episode)?;

        let mut id_map: std::collections::HashMap<String, String> = std::collections::HashMap::new();
        for node in &snapshot.nodes {
            let input = NodeInput {
                kind: node.kind,
                name: node.name.clone(),
                aliases: node.aliases.clone(),
                properties: node.properties.clone(),
                privacy: node.privacy,
            };
            let (upserted, _) = self.upsert_node(&input, &correlation)?;
            id_map.insert(node.id.clone(), upserted.id);
        }

        let mut imported = 0;
        for edge in &snapshot.edges {
            if edge.retracted || edge.archived {
                continue;
            }
            let (Some(source), Some(target)) =
                (id_map.get(&edge.source_id), id_map.get(&edge.target_id))
            else {
                continue;
            };
            let input = EdgeInput {
                source_id: source.clone(),
                target_id: target.clone(),
                relation: edge.relation.clone(),
                confidence: edge.confidence,
                temporal_type: edge.temporal_type,
                provenance: edge.provenance,
                context_tags: edge.context_tags.clone(),
                episode_id: Some(episode.id.clone()),
                expiry: edge.expiry,
                refines: None,
                secondhand: edge.secondhand,
                hypothetical: edge.hypothetical,
                attribution_uncertain: edge.attribution_uncertain,
            };
            self.create_edge(&input, params_cfg, &correlation)?;
            imported += 1;
        }
        Ok(imported)
    }

    // ========================================================================
    // DELTA APPLICATION (the single-writer hot path)
    // ========================================================================

    /// Apply a prepared delta atomically: episode, node upserts, edge
    /// classification and mutation, retractions, idempotency-key commit,
    /// audit records. Returns the outcome and the events to publish.
    pub fn apply_delta(
        &self,
        delta: &PreparedDelta,
        params_cfg: &ConfidenceParams,
    ) -> Result<(DeltaOutcome, Vec<GraphEvent>)> {
        let mut conn = self.writer()?;
        let tx = conn.transaction()?;
        let mut outcome = DeltaOutcome { episode_id: delta.episode_id.clone(), ..Default::default() };
        let mut events: Vec<GraphEvent> = Vec::new();
        let correlation = delta.correlation_id.as_str();

        // Idempotency: a committed key makes reprocessing a no-op.
        let status: Option<String> = tx
            .query_row(
                "SELECT status FROM inbound_events WHERE session_id = ?1 AND turn_number = ?2",
                params![delta.session_id, delta.turn_number],
                |row| row.get(0),
            )
            .optional()?;
        if status.as_deref() == Some("done") {
            outcome.already_processed = true;
            return Ok((outcome, events));
        }

        let episode = Episode {
            id: delta.episode_id.clone(),
            occurred_at: Utc::now(),
            session_id: delta.session_id.clone(),
            turn_number: delta.turn_number,
            channel: delta.channel.clone(),
            sentiment: delta.sentiment,
            outcome: 0.0,
            edge_ids: vec![],
        };
        insert_episode_conn(&tx, &episode)?;
        audit_tx(
            &tx,
            &AuditEntry::new(correlation, AuditKind::EpisodeRecorded, COMPONENT_DIFF, Operation::Insert)
                .node(episode.id.clone())
                .session(delta.session_id.clone()),
        )?;

        // Ensure proposed nodes exist.
        for proposed in &delta.nodes {
            let (node, created) = upsert_node_tx(&tx, &proposed.input, correlation)?;
            if created {
                outcome.nodes_created += 1;
                events.push(GraphEvent::NodeAdded { node });
            } else {
                outcome.nodes_merged += 1;
                events.push(GraphEvent::NodeUpdated { node });
            }
        }

        // Edges: resolve names, classify, apply.
        for proposed in &delta.edges {
            let source = resolve_or_create_node(
                &tx,
                &proposed.source_name,
                correlation,
                &mut outcome,
                &mut events,
            )?;
            let target = resolve_or_create_node(
                &tx,
                &proposed.target_name,
                correlation,
                &mut outcome,
                &mut events,
            )?;

            let exact = find_active_edge(&tx, &source.id, &target.id, &proposed.relation)?;
            let siblings = active_relation_siblings(&tx, &source.id, &proposed.relation, &target.id)?;
            let general = match &proposed.refines {
                Some(hint) => match resolve_name_conn(&tx, &hint.target_name)? {
                    Some(hint_target) => {
                        find_active_edge(&tx, &source.id, &hint_target.id, &hint.relation)?
                    }
                    None => None,
                },
                None => None,
            };

            let action = diff::classify(
                params_cfg,
                proposed,
                &delta.episode_id,
                exact.as_ref(),
                &siblings,
                general.as_ref(),
            );

            match action {
                DiffAction::Insert => {
                    let input = diff::to_edge_input(
                        proposed,
                        source.id.clone(),
                        target.id.clone(),
                        &delta.episode_id,
                        None,
                    );
                    let edge = create_edge_tx(&tx, &input, params_cfg, correlation)?;
                    outcome.inserted += 1;
                    events.push(GraphEvent::EdgeAdded { edge });
                }
                DiffAction::Reinforce { edge_id, new_confidence } => {
                    let edge = reinforce_edge_tx(
                        &tx,
                        &edge_id,
                        new_confidence,
                        &delta.episode_id,
                        correlation,
                    )?;
                    outcome.reinforced += 1;
                    events.push(GraphEvent::EdgeUpdated { edge });
                }
                DiffAction::Revise { old_edge_id } => {
                    let input = diff::to_edge_input(
                        proposed,
                        source.id.clone(),
                        target.id.clone(),
                        &delta.episode_id,
                        None,
                    );
                    let (old, new) =
                        revise_edge_tx(&tx, &old_edge_id, &input, params_cfg, correlation)?;
                    outcome.revised += 1;
                    events.push(GraphEvent::EdgeRetracted {
                        edge_id: old.id.clone(),
                        reason: "superseded".to_string(),
                    });
                    events.push(GraphEvent::EdgeAdded { edge: new });
                }
                DiffAction::ContradictBelowMargin { old_edge_id } => {
                    if let Some(old) = get_edge_conn(&tx, &old_edge_id)? {
                        let old_target = get_node_conn(&tx, &old.target_id)?
                            .map(|n| n.name)
                            .unwrap_or_else(|| old.target_id.clone());
                        audit_tx(
                            &tx,
                            &AuditEntry::new(
                                correlation,
                                AuditKind::EdgeContradicted,
                                COMPONENT_DIFF,
                                Operation::Contradict,
                            )
                            .edge(old.id.clone())
                            .values(Some(old_target.clone()), Some(proposed.target_name.clone()))
                            .confidence(Some(old.confidence), Some(proposed.confidence))
                            .session(delta.session_id.clone())
                            .reasoning("new value below revision margin; asking instead"),
                        )?;
                        outcome.verification_requests.push(VerificationRequest {
                            edge_id: old.id,
                            source_name: source.name.clone(),
                            relation: proposed.relation.clone(),
                            old_value: old_target,
                            new_value: proposed.target_name.clone(),
                            context_tags: proposed.context_tags.clone(),
                        });
                    }
                    outcome.skipped += 1;
                }
                DiffAction::Skip { reason } => {
                    outcome.skipped += 1;
                    audit_tx(
                        &tx,
                        &AuditEntry::new(
                            correlation,
                            AuditKind::ExtractionSkipped,
                            COMPONENT_DIFF,
                            Operation::Skip,
                        )
                        .values(
                            None,
                            Some(format!(
                                "{} -{}-> {}",
                                proposed.source_name, proposed.relation, proposed.target_name
                            )),
                        )
                        .reasoning(format!("{reason:?}")),
                    )?;
                }
                DiffAction::Merge { general_edge_id } => {
                    let input = diff::to_edge_input(
                        proposed,
                        source.id.clone(),
                        target.id.clone(),
                        &delta.episode_id,
                        Some(general_edge_id.clone()),
                    );
                    let edge = create_edge_tx(&tx, &input, params_cfg, correlation)?;
                    audit_tx(
                        &tx,
                        &AuditEntry::new(correlation, AuditKind::EdgeMerged, COMPONENT_DIFF, Operation::Insert)
                            .edge(edge.id.clone())
                            .reasoning(format!("refines edge {general_edge_id}")),
                    )?;
                    outcome.merged += 1;
                    events.push(GraphEvent::EdgeAdded { edge });
                }
            }
        }

        // Retractions ("forget what I said about …").
        for retraction in &delta.retractions {
            let Some(source) = resolve_name_conn(&tx, &retraction.source_name)? else {
                continue;
            };
            let target_id = match &retraction.target_name {
                Some(name) => resolve_name_conn(&tx, name)?.map(|n| n.id),
                None => None,
            };
            let mut sql =
                format!("SELECT {EDGE_COLUMNS} FROM edges WHERE retracted = 0 AND archived = 0 AND source_id = ?1");
            let mut args: Vec<String> = vec![source.id.clone()];
            if let Some(relation) = &retraction.relation {
                sql.push_str(" AND relation = ?");
                args.push(relation.clone());
            }
            if let Some(tid) = &target_id {
                sql.push_str(" AND target_id = ?");
                args.push(tid.clone());
            }
            let matches: Vec<Edge> = {
                let mut stmt = tx.prepare(&sql)?;
                let rows = stmt
                    .query_map(params_from_iter(args.iter()), row_to_edge)?
                    .collect::<std::result::Result<_, _>>()?;
                rows
            };
            for edge in matches {
                retract_edge_tx(&tx, &edge.id, &retraction.reason, correlation)?;
                outcome.retracted += 1;
                events.push(GraphEvent::EdgeRetracted {
                    edge_id: edge.id,
                    reason: retraction.reason.clone(),
                });
            }
        }

        // Commit the idempotency key inside the same transaction.
        commit_inbound_done(&tx, &delta.session_id, delta.turn_number, &delta.channel)?;

        tx.commit()?;
        Ok((outcome, events))
    }

    /// Record that an interaction produced nothing worth storing. Writes
    /// the "skipped" audit record and commits the idempotency key.
    pub fn mark_interaction_skipped(
        &self,
        session_id: &str,
        turn_number: u32,
        channel: &str,
        correlation_id: &str,
        reason: &str,
    ) -> Result<()> {
        let mut conn = self.writer()?;
        let tx = conn.transaction()?;
        audit_tx(
            &tx,
            &AuditEntry::new(correlation_id, AuditKind::ExtractionSkipped, "pipeline", Operation::Skip)
                .session(session_id)
                .reasoning(reason),
        )?;
        commit_inbound_done(&tx, session_id, turn_number, channel)?;
        tx.commit()?;
        Ok(())
    }

    // ========================================================================
    // AUDIT
    // ========================================================================

    /// Append a standalone audit record (outside a mutation transaction).
    pub fn audit_append(&self, entry: &AuditEntry) -> Result<i64> {
        let conn = self.writer()?;
        audit_tx(&conn, entry)
    }

    pub fn audit_recent(&self, limit: usize) -> Result<Vec<AuditRecord>> {
        let conn = self.reader()?;
        let mut stmt = conn.prepare(
            "SELECT seq, timestamp, correlation_id, kind, component, operation, node_id, edge_id,
                    old_value, new_value, confidence_before, confidence_after, mechanism,
                    session_id, reasoning
             FROM audit_log ORDER BY seq DESC LIMIT ?1",
        )?;
        let records = stmt
            .query_map(params![limit as i64], row_to_audit)?
            .collect::<std::result::Result<_, _>>()?;
        Ok(records)
    }

    pub fn audit_by_correlation(&self, correlation_id: &str) -> Result<Vec<AuditRecord>> {
        let conn = self.reader()?;
        let mut stmt = conn.prepare(
            "SELECT seq, timestamp, correlation_id, kind, component, operation, node_id, edge_id,
                    old_value, new_value, confidence_before, confidence_after, mechanism,
                    session_id, reasoning
             FROM audit_log WHERE correlation_id = ?1 ORDER BY seq ASC",
        )?;
        let records = stmt
            .query_map(params![correlation_id], row_to_audit)?
            .collect::<std::result::Result<_, _>>()?;
        Ok(records)
    }

    pub fn audit_count_kind(&self, kind: AuditKind) -> Result<i64> {
        let conn = self.reader()?;
        let count = conn.query_row(
            "SELECT COUNT(*) FROM audit_log WHERE kind = ?1",
            params![kind.as_str()],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    // ========================================================================
    // INBOUND QUEUE
    // ========================================================================

    pub fn enqueue_interaction(&self, event: &InteractionEvent) -> Result<EnqueueResult> {
        let conn = self.writer()?;
        let now = Utc::now().to_rfc3339();
        let hint = serde_json::to_string(&event.entities_hint)?;
        let changed = conn.execute(
            "INSERT OR IGNORE INTO inbound_events
             (session_id, turn_number, channel, text, entities_hint, client_timestamp,
              stt_confidence, enqueued_at, status, attempts, next_attempt_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, 'queued', 0, ?8)",
            params![
                event.session_id,
                event.turn_number,
                event.channel,
                event.text,
                hint,
                event.client_timestamp.map(|t| t.to_rfc3339()),
                event.stt_confidence,
                now,
            ],
        )?;
        Ok(if changed > 0 { EnqueueResult::Accepted } else { EnqueueResult::Duplicate })
    }

    /// Claim the next due event. Per-session FIFO: a turn is only
    /// claimable once every earlier turn of its session has finished.
    pub fn claim_next_inbound(&self, now: DateTime<Utc>) -> Result<Option<InboundRow>> {
        let conn = self.writer()?;
        let row = conn
            .query_row(
                "SELECT session_id, turn_number, channel, text, entities_hint, client_timestamp,
                        stt_confidence, enqueued_at, status, attempts, last_error
                 FROM inbound_events e
                 WHERE status IN ('queued', 'processing') AND next_attempt_at <= ?1
                   AND NOT EXISTS (
                     SELECT 1 FROM inbound_events p
                     WHERE p.session_id = e.session_id
                       AND p.turn_number < e.turn_number
                       AND p.status IN ('queued', 'processing'))
                 ORDER BY enqueued_at ASC, turn_number ASC
                 LIMIT 1",
                params![now.to_rfc3339()],
                row_to_inbound,
            )
            .optional()?;

        if let Some(row) = &row {
            let lease = now + chrono::Duration::seconds(CLAIM_LEASE_SECS);
            conn.execute(
                "UPDATE inbound_events SET status = 'processing', next_attempt_at = ?3
                 WHERE session_id = ?1 AND turn_number = ?2",
                params![row.event.session_id, row.event.turn_number, lease.to_rfc3339()],
            )?;
        }
        Ok(row)
    }

    pub fn requeue_inbound(
        &self,
        session_id: &str,
        turn_number: u32,
        attempts: u32,
        next_attempt_at: DateTime<Utc>,
        error: &str,
    ) -> Result<()> {
        let conn = self.writer()?;
        conn.execute(
            "UPDATE inbound_events
             SET status = 'queued', attempts = ?3, next_attempt_at = ?4, last_error = ?5
             WHERE session_id = ?1 AND turn_number = ?2",
            params![session_id, turn_number, attempts, next_attempt_at.to_rfc3339(), error],
        )?;
        Ok(())
    }

    pub fn dead_letter_inbound(&self, session_id: &str, turn_number: u32, error: &str) -> Result<()> {
        let mut conn = self.writer()?;
        let tx = conn.transaction()?;
        tx.execute(
            "UPDATE inbound_events SET status = 'dead', last_error = ?3
             WHERE session_id = ?1 AND turn_number = ?2",
            params![session_id, turn_number, error],
        )?;
        audit_tx(
            &tx,
            &AuditEntry::new(
                format!("{session_id}:{turn_number}"),
                AuditKind::EventDeadLettered,
                "inbound",
                Operation::Skip,
            )
            .session(session_id)
            .reasoning(error),
        )?;
        tx.commit()?;
        Ok(())
    }

    pub fn dead_lettered_inbound(&self) -> Result<Vec<InboundRow>> {
        let conn = self.reader()?;
        let mut stmt = conn.prepare(
            "SELECT session_id, turn_number, channel, text, entities_hint, client_timestamp,
                    stt_confidence, enqueued_at, status, attempts, last_error
             FROM inbound_events WHERE status = 'dead' ORDER BY enqueued_at ASC",
        )?;
        let rows = stmt
            .query_map([], row_to_inbound)?
            .collect::<std::result::Result<_, _>>()?;
        Ok(rows)
    }

    pub fn purge_inbound_before(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        let conn = self.writer()?;
        let removed = conn.execute(
            "DELETE FROM inbound_events WHERE status = 'done' AND enqueued_at < ?1",
            params![cutoff.to_rfc3339()],
        )?;
        Ok(removed)
    }

    pub fn inbound_pending_count(&self) -> Result<usize> {
        let conn = self.reader()?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM inbound_events WHERE status IN ('queued', 'processing')",
            [],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    // ========================================================================
    // OUTBOUND QUEUE
    // ========================================================================

    pub fn outbound_push(&self, item: &OutboundItem, reasoning: &str) -> Result<()> {
        let mut conn = self.writer()?;
        let tx = conn.transaction()?;
        tx.execute(
            "INSERT INTO outbound_items
             (id, kind, subtype, priority, context_tags, entities, min_turn, earliest, latest,
              cooldown_until, state, payload, created_at, delivered_at, ignored_count)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, NULL, 0)",
            params![
                item.id,
                item.kind.as_str(),
                item.subtype,
                item.priority,
                serde_json::to_string(&item.context_tags)?,
                serde_json::to_string(&item.entities)?,
                item.min_turn,
                item.earliest.to_rfc3339(),
                item.latest.map(|t| t.to_rfc3339()),
                item.cooldown_until.map(|t| t.to_rfc3339()),
                item.state.as_str(),
                serde_json::to_string(&item.payload)?,
                item.created_at.to_rfc3339(),
            ],
        )?;
        let kind = match item.kind {
            OutboundKind::Probe => AuditKind::ProbeGenerated,
            OutboundKind::Starter => AuditKind::StarterGenerated,
        };
        audit_tx(
            &tx,
            &AuditEntry::new(item.id.clone(), kind, "proactive", Operation::Generate)
                .values(None, Some(item.payload.to_string()))
                .reasoning(reasoning),
        )?;
        tx.commit()?;
        Ok(())
    }

    pub fn outbound_similar_pending(
        &self,
        kind: OutboundKind,
        subtype: &str,
        entity: &str,
    ) -> Result<bool> {
        let conn = self.reader()?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM outbound_items
             WHERE kind = ?1 AND subtype = ?2 AND state = 'queued' AND entities LIKE ?3",
            params![kind.as_str(), subtype, format!("%{}%", entity.to_lowercase())],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    pub fn outbound_candidates(
        &self,
        kind: OutboundKind,
        now: DateTime<Utc>,
        turn_number: u32,
    ) -> Result<Vec<OutboundItem>> {
        let conn = self.reader()?;
        let now_str = now.to_rfc3339();
        let mut stmt = conn.prepare(
            "SELECT id, kind, subtype, priority, context_tags, entities, min_turn, earliest,
                    latest, cooldown_until, state, payload, created_at, delivered_at, ignored_count
             FROM outbound_items
             WHERE kind = ?1 AND state = 'queued'
               AND earliest <= ?2
               AND (latest IS NULL OR latest >= ?2)
               AND (cooldown_until IS NULL OR cooldown_until <= ?2)
               AND min_turn <= ?3
             ORDER BY priority DESC",
        )?;
        let items = stmt
            .query_map(params![kind.as_str(), now_str, turn_number], row_to_outbound)?
            .collect::<std::result::Result<_, _>>()?;
        Ok(items)
    }

    pub fn outbound_mark_delivered(&self, id: &str, now: DateTime<Utc>, score: f64) -> Result<()> {
        let mut conn = self.writer()?;
        let tx = conn.transaction()?;
        let kind: String = tx.query_row(
            "SELECT kind FROM outbound_items WHERE id = ?1",
            params![id],
            |row| row.get(0),
        )?;
        tx.execute(
            "UPDATE outbound_items SET state = 'delivered', delivered_at = ?2 WHERE id = ?1",
            params![id, now.to_rfc3339()],
        )?;
        let audit_kind = match OutboundKind::parse_name(&kind) {
            OutboundKind::Probe => AuditKind::ProbeDelivered,
            OutboundKind::Starter => AuditKind::StarterDelivered,
        };
        audit_tx(
            &tx,
            &AuditEntry::new(id, audit_kind, "outbound", Operation::Deliver)
                .reasoning(format!("context-fit score {score:.3}")),
        )?;
        tx.commit()?;
        Ok(())
    }

    pub fn outbound_requeue_after_cooldown(
        &self,
        id: &str,
        cooldown_until: DateTime<Utc>,
        priority_factor: f64,
    ) -> Result<()> {
        let mut conn = self.writer()?;
        let tx = conn.transaction()?;
        tx.execute(
            "UPDATE outbound_items
             SET state = 'queued', cooldown_until = ?2, priority = priority * ?3,
                 ignored_count = ignored_count + 1
             WHERE id = ?1",
            params![id, cooldown_until.to_rfc3339(), priority_factor],
        )?;
        audit_tx(
            &tx,
            &AuditEntry::new(id, AuditKind::ProbeCooldown, "outbound", Operation::Skip)
                .reasoning(format!("re-queued until {cooldown_until}")),
        )?;
        tx.commit()?;
        Ok(())
    }

    pub fn outbound_set_state(&self, id: &str, state: ProbeState) -> Result<()> {
        let conn = self.writer()?;
        conn.execute(
            "UPDATE outbound_items SET state = ?2 WHERE id = ?1",
            params![id, state.as_str()],
        )?;
        Ok(())
    }

    pub fn outbound_obsolete_expired(&self, now: DateTime<Utc>) -> Result<usize> {
        let mut conn = self.writer()?;
        let tx = conn.transaction()?;
        let ids: Vec<String> = {
            let mut stmt = tx.prepare(
                "SELECT id FROM outbound_items
                 WHERE state = 'queued' AND latest IS NOT NULL AND latest < ?1",
            )?;
            let ids = stmt
                .query_map(params![now.to_rfc3339()], |row| row.get(0))?
                .collect::<std::result::Result<_, _>>()?;
            ids
        };
        for id in &ids {
            tx.execute(
                "UPDATE outbound_items SET state = 'obsoleted' WHERE id = ?1",
                params![id],
            )?;
            audit_tx(
                &tx,
                &AuditEntry::new(id.clone(), AuditKind::ProbeObsoleted, "outbound", Operation::Archive)
                    .reasoning("delivery window passed"),
            )?;
        }
        tx.commit()?;
        Ok(ids.len())
    }

    pub fn outbound_pending_count(&self) -> Result<usize> {
        let conn = self.reader()?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM outbound_items WHERE state = 'queued'",
            [],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    // ========================================================================
    // COUNTERS
    // ========================================================================

    pub fn counter_get(&self, scope: &str, key: &str) -> Result<i64> {
        let conn = self.reader()?;
        let count: Option<i64> = conn
            .query_row(
                "SELECT count FROM delivery_counters WHERE scope = ?1 AND counter_key = ?2",
                params![scope, key],
                |row| row.get(0),
            )
            .optional()?;
        Ok(count.unwrap_or(0))
    }

    pub fn counter_bump(&self, scope: &str, key: &str) -> Result<()> {
        let conn = self.writer()?;
        conn.execute(
            "INSERT INTO delivery_counters (scope, counter_key, count) VALUES (?1, ?2, 1)
             ON CONFLICT(scope, counter_key) DO UPDATE SET count = count + 1",
            params![scope, key],
        )?;
        Ok(())
    }

    // ========================================================================
    // STATS
    // ========================================================================

    pub fn stats(&self) -> Result<StoreStats> {
        let conn = self.reader()?;
        let one = |sql: &str| -> Result<usize> {
            let n: i64 = conn.query_row(sql, [], |row| row.get(0))?;
            Ok(n as usize)
        };
        Ok(StoreStats {
            node_count: one("SELECT COUNT(*) FROM nodes")?,
            active_edge_count: one(
                "SELECT COUNT(*) FROM edges WHERE retracted = 0 AND archived = 0",
            )?,
            total_edge_count: one("SELECT COUNT(*) FROM edges")?,
            episode_count: one("SELECT COUNT(*) FROM episodes")?,
            audit_count: one("SELECT COUNT(*) FROM audit_log")?,
            pending_inbound: one(
                "SELECT COUNT(*) FROM inbound_events WHERE status IN ('queued','processing')",
            )?,
            dead_letters: one("SELECT COUNT(*) FROM inbound_events WHERE status = 'dead'")?,
            pending_outbound: one("SELECT COUNT(*) FROM outbound_items WHERE state = 'queued'")?,
        })
    }
}

// ============================================================================
// CONNECTION-LEVEL HELPERS (shared by public methods and apply_delta)
// ============================================================================

const EDGE_COLUMNS: &str = "id, source_id, target_id, relation, confidence, temporal_type, \
     first_observed, last_reinforced, decay_rate, context_tags, provenance, expiry, retracted, \
     retraction_reason, archived, refines, secondhand, hypothetical, attribution_uncertain";

fn parse_ts(s: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
        })
}

fn row_to_edge(row: &rusqlite::Row<'_>) -> rusqlite::Result<Edge> {
    let temporal: String = row.get(5)?;
    let provenance: String = row.get(10)?;
    let tags: String = row.get(9)?;
    let first_observed: String = row.get(6)?;
    let last_reinforced: String = row.get(7)?;
    let expiry: Option<String> = row.get(11)?;
    Ok(Edge {
        id: row.get(0)?,
        source_id: row.get(1)?,
        target_id: row.get(2)?,
        relation: row.get(3)?,
        confidence: row.get(4)?,
        temporal_type: TemporalType::parse_name(&temporal),
        first_observed: parse_ts(&first_observed)?,
        last_reinforced: parse_ts(&last_reinforced)?,
        decay_rate: row.get(8)?,
        context_tags: serde_json::from_str(&tags).unwrap_or_default(),
        episode_ids: vec![],
        provenance: Provenance::parse_name(&provenance),
        expiry: expiry.as_deref().map(parse_ts).transpose()?,
        retracted: row.get::<_, i64>(12)? != 0,
        retraction_reason: row.get(13)?,
        archived: row.get::<_, i64>(14)? != 0,
        refines: row.get(15)?,
        secondhand: row.get::<_, i64>(16)? != 0,
        hypothetical: row.get::<_, i64>(17)? != 0,
        attribution_uncertain: row.get::<_, i64>(18)? != 0,
    })
}

fn row_to_audit(row: &rusqlite::Row<'_>) -> rusqlite::Result<AuditRecord> {
    let ts: String = row.get(1)?;
    Ok(AuditRecord {
        seq: row.get(0)?,
        timestamp: parse_ts(&ts)?,
        correlation_id: row.get(2)?,
        kind: row.get(3)?,
        component: row.get(4)?,
        operation: row.get(5)?,
        node_id: row.get(6)?,
        edge_id: row.get(7)?,
        old_value: row.get(8)?,
        new_value: row.get(9)?,
        confidence_before: row.get(10)?,
        confidence_after: row.get(11)?,
        mechanism: row.get(12)?,
        session_id: row.get(13)?,
        reasoning: row.get(14)?,
    })
}

fn row_to_inbound(row: &rusqlite::Row<'_>) -> rusqlite::Result<InboundRow> {
    let hint: String = row.get(4)?;
    let client_ts: Option<String> = row.get(5)?;
    let enqueued: String = row.get(7)?;
    Ok(InboundRow {
        event: InteractionEvent {
            session_id: row.get(0)?,
            turn_number: row.get(1)?,
            channel: row.get(2)?,
            text: row.get(3)?,
            entities_hint: serde_json::from_str(&hint).unwrap_or_default(),
            client_timestamp: client_ts.as_deref().map(parse_ts).transpose()?,
            stt_confidence: row.get(6)?,
        },
        enqueued_at: parse_ts(&enqueued)?,
        status: row.get(8)?,
        attempts: row.get(9)?,
        last_error: row.get(10)?,
    })
}

fn row_to_outbound(row: &rusqlite::Row<'_>) -> rusqlite::Result<OutboundItem> {
    let kind: String = row.get(1)?;
    let tags: String = row.get(4)?;
    let entities: String = row.get(5)?;
    let earliest: String = row.get(7)?;
    let latest: Option<String> = row.get(8)?;
    let cooldown: Option<String> = row.get(9)?;
    let state: String = row.get(10)?;
    let payload: String = row.get(11)?;
    let created: String = row.get(12)?;
    let delivered: Option<String> = row.get(13)?;
    Ok(OutboundItem {
        id: row.get(0)?,
        kind: OutboundKind::parse_name(&kind),
        subtype: row.get(2)?,
        priority: row.get(3)?,
        context_tags: serde_json::from_str(&tags).unwrap_or_default(),
        entities: serde_json::from_str(&entities).unwrap_or_default(),
        min_turn: row.get(6)?,
        earliest: parse_ts(&earliest)?,
        latest: latest.as_deref().map(parse_ts).transpose()?,
        cooldown_until: cooldown.as_deref().map(parse_ts).transpose()?,
        state: ProbeState::parse_name(&state),
        payload: serde_json::from_str(&payload).unwrap_or(serde_json::Value::Null),
        created_at: parse_ts(&created)?,
        delivered_at: delivered.as_deref().map(parse_ts).transpose()?,
        ignored_count: row.get(14)?,
    })
}

fn get_node_conn(conn: &Connection, id: &str) -> Result<Option<Node>> {
    let row = conn
        .query_row(
            "SELECT id, kind, name, properties, privacy, created_at, last_reinforced
             FROM nodes WHERE id = ?1",
            params![id],
            |row| {
                let kind: String = row.get(1)?;
                let props: String = row.get(3)?;
                let privacy: i64 = row.get(4)?;
                let created: String = row.get(5)?;
                let reinforced: String = row.get(6)?;
                Ok(Node {
                    id: row.get(0)?,
                    kind: NodeKind::parse_name(&kind),
                    name: row.get(2)?,
                    aliases: vec![],
                    properties: serde_json::from_str(&props)
                        .unwrap_or(serde_json::Value::Object(Default::default())),
                    privacy: PrivacyLevel::from_level(privacy as u8),
                    created_at: parse_ts(&created)?,
                    last_reinforced: parse_ts(&reinforced)?,
                })
            },
        )
        .optional()?;

    let Some(mut node) = row else { return Ok(None) };
    let mut stmt =
        conn.prepare("SELECT alias FROM node_aliases WHERE node_id = ?1 ORDER BY alias")?;
    node.aliases = stmt
        .query_map(params![node.id], |row| row.get(0))?
        .collect::<std::result::Result<_, _>>()?;
    Ok(Some(node))
}

fn resolve_name_conn(conn: &Connection, name: &str) -> Result<Option<Node>> {
    let folded = fold_name(name);
    if folded.is_empty() {
        return Ok(None);
    }
    let id: Option<String> = conn
        .query_row(
            "SELECT n.id FROM nodes n
             LEFT JOIN node_aliases a ON a.node_id = n.id
             WHERE n.name_folded = ?1 OR a.alias = ?1
             ORDER BY n.created_at ASC LIMIT 1",
            params![folded],
            |row| row.get(0),
        )
        .optional()?;
    match id {
        Some(id) => get_node_conn(conn, &id),
        None => Ok(None),
    }
}

fn upsert_node_tx(
    conn: &Connection,
    input: &NodeInput,
    correlation_id: &str,
) -> Result<(Node, bool)> {
    let folded = input.folded_aliases();
    if folded.is_empty() {
        return Err(StoreError::InvariantViolation("node needs a non-empty name".to_string()));
    }

    // Find the representative of the alias equivalence class, same kind
    // only. When the input bridges two classes the oldest one wins; full
    // class unification is out of scope for alias merging by exact fold.
    let placeholders = vec!["?"; folded.len()].join(",");
    let sql = format!(
        "SELECT DISTINCT n.id FROM nodes n
         LEFT JOIN node_aliases a ON a.node_id = n.id
         WHERE n.kind = ? AND (n.name_folded IN ({placeholders}) OR a.alias IN ({placeholders}))
         ORDER BY n.created_at ASC LIMIT 1"
    );
    let mut args: Vec<String> = vec![input.kind.as_str().to_string()];
    args.extend(folded.iter().cloned());
    args.extend(folded.iter().cloned());
    let existing_id: Option<String> = conn
        .query_row(&sql, params_from_iter(args.iter()), |row| row.get(0))
        .optional()?;

    let now = Utc::now();
    if let Some(id) = existing_id {
        let existing = get_node_conn(conn, &id)?
            .ok_or_else(|| StoreError::NotFound(id.clone()))?;

        // Merge: add aliases, union properties (existing keys win),
        // raise privacy only. The canonical name never changes here.
        for alias in &folded {
            conn.execute(
                "INSERT OR IGNORE INTO node_aliases (node_id, alias) VALUES (?1, ?2)",
                params![id, alias],
            )?;
        }
        let mut merged_props = existing.properties.clone();
        if let (Some(obj), Some(new_obj)) =
            (merged_props.as_object_mut(), input.properties.as_object())
        {
            for (k, v) in new_obj {
                obj.entry(k.clone()).or_insert_with(|| v.clone());
            }
        }
        let privacy = existing.privacy.max(input.privacy);
        conn.execute(
            "UPDATE nodes SET properties = ?2, privacy = ?3, last_reinforced = ?4 WHERE id = ?1",
            params![id, serde_json::to_string(&merged_props)?, privacy.as_level(), now.to_rfc3339()],
        )?;
        audit_tx(
            conn,
            &AuditEntry::new(correlation_id, AuditKind::NodeMerged, COMPONENT_STORE, Operation::Reinforce)
                .node(id.clone()),
        )?;
        let node = get_node_conn(conn, &id)?.ok_or(StoreError::NotFound(id))?;
        return Ok((node, false));
    }

    let id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO nodes (id, kind, name, name_folded, properties, privacy, created_at, last_reinforced)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?7)",
        params![
            id,
            input.kind.as_str(),
            input.name,
            fold_name(&input.name),
            serde_json::to_string(&input.properties)?,
            input.privacy.as_level(),
            now.to_rfc3339(),
        ],
    )?;
    for alias in &folded {
        conn.execute(
            "INSERT OR IGNORE INTO node_aliases (node_id, alias) VALUES (?1, ?2)",
            params![id, alias],
        )?;
    }
    audit_tx(
        conn,
        &AuditEntry::new(correlation_id, AuditKind::NodeCreated, COMPONENT_STORE, Operation::Insert)
            .node(id.clone())
            .values(None, Some(input.name.clone())),
    )?;
    let node = get_node_conn(conn, &id)?.ok_or(StoreError::NotFound(id))?;
    Ok((node, true))
}

fn get_edge_conn(conn: &Connection, id: &str) -> Result<Option<Edge>> {
    let edge = conn
        .query_row(
            &format!("SELECT {EDGE_COLUMNS} FROM edges WHERE id = ?1"),
            params![id],
            row_to_edge,
        )
        .optional()?;
    match edge {
        Some(mut edge) => {
            edge.episode_ids = episode_ids_for_edge(conn, &edge.id)?;
            Ok(Some(edge))
        }
        None => Ok(None),
    }
}

fn episode_ids_for_edge(conn: &Connection, edge_id: &str) -> Result<Vec<String>> {
    let mut stmt = conn
        .prepare("SELECT episode_id FROM edge_episodes WHERE edge_id = ?1 ORDER BY episode_id")?;
    let ids = stmt
        .query_map(params![edge_id], |row| row.get(0))?
        .collect::<std::result::Result<_, _>>()?;
    Ok(ids)
}

fn find_active_edge(
    conn: &Connection,
    source_id: &str,
    target_id: &str,
    relation: &str,
) -> Result<Option<Edge>> {
    let edge = conn
        .query_row(
            &format!(
                "SELECT {EDGE_COLUMNS} FROM edges
                 WHERE source_id = ?1 AND target_id = ?2 AND relation = ?3
                   AND retracted = 0 AND archived = 0
                 LIMIT 1"
            ),
            params![source_id, target_id, relation],
            row_to_edge,
        )
        .optional()?;
    match edge {
        Some(mut edge) => {
            edge.episode_ids = episode_ids_for_edge(conn, &edge.id)?;
            Ok(Some(edge))
        }
        None => Ok(None),
    }
}

fn active_relation_siblings(
    conn: &Connection,
    source_id: &str,
    relation: &str,
    exclude_target: &str,
) -> Result<Vec<Edge>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {EDGE_COLUMNS} FROM edges
         WHERE source_id = ?1 AND relation = ?2 AND target_id != ?3
           AND retracted = 0 AND archived = 0"
    ))?;
    let mut edges: Vec<Edge> = stmt
        .query_map(params![source_id, relation, exclude_target], row_to_edge)?
        .collect::<std::result::Result<_, _>>()?;
    drop(stmt);
    for edge in edges.iter_mut() {
        edge.episode_ids = episode_ids_for_edge(conn, &edge.id)?;
    }
    Ok(edges)
}

fn create_edge_tx(
    conn: &Connection,
    input: &EdgeInput,
    params_cfg: &ConfidenceParams,
    correlation_id: &str,
) -> Result<Edge> {
    let source = get_node_conn(conn, &input.source_id)?.ok_or_else(|| {
        StoreError::InvariantViolation(format!("source node '{}' not found", input.source_id))
    })?;
    let target = get_node_conn(conn, &input.target_id)?.ok_or_else(|| {
        StoreError::InvariantViolation(format!("target node '{}' not found", input.target_id))
    })?;

    // A sealed node linked straight to a public one would leak through
    // public query paths.
    let max = source.privacy.max(target.privacy);
    let min = source.privacy.min(target.privacy);
    if max == PrivacyLevel::Sealed && min == PrivacyLevel::Public {
        return Err(StoreError::InvariantViolation(
            "cannot link a sealed node to a public node".to_string(),
        ));
    }

    if input.episode_id.is_none() && input.provenance != Provenance::UserCorrection {
        return Err(StoreError::InvariantViolation(
            "edge requires a source episode unless authored by user correction".to_string(),
        ));
    }

    let now = Utc::now();
    let id = Uuid::new_v4().to_string();
    let confidence = confidence::clamp(params_cfg, input.confidence);
    let decay_rate = params_cfg.decay_rate(input.temporal_type);

    conn.execute(
        &format!(
            "INSERT INTO edges ({EDGE_COLUMNS})
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?7, ?8, ?9, ?10, ?11, 0, NULL, 0, ?12, ?13, ?14, ?15)"
        ),
        params![
            id,
            input.source_id,
            input.target_id,
            input.relation,
            confidence,
            input.temporal_type.as_str(),
            now.to_rfc3339(),
            decay_rate,
            serde_json::to_string(&input.context_tags)?,
            input.provenance.as_str(),
            input.expiry.map(|t| t.to_rfc3339()),
            input.refines,
            input.secondhand as i64,
            input.hypothetical as i64,
            input.attribution_uncertain as i64,
        ],
    )?;
    if let Some(episode_id) = &input.episode_id {
        conn.execute(
            "INSERT OR IGNORE INTO edge_episodes (edge_id, episode_id) VALUES (?1, ?2)",
            params![id, episode_id],
        )?;
    }
    conn.execute(
        "UPDATE nodes SET last_reinforced = ?2 WHERE id IN (?1, ?3)",
        params![input.source_id, now.to_rfc3339(), input.target_id],
    )?;
    audit_tx(
        conn,
        &AuditEntry::new(correlation_id, AuditKind::EdgeInserted, COMPONENT_STORE, Operation::Insert)
            .edge(id.clone())
            .values(None, Some(format!("{} -{}-> {}", source.name, input.relation, target.name)))
            .confidence(None, Some(confidence))
            .mechanism(input.provenance.as_str()),
    )?;

    get_edge_conn(conn, &id)?.ok_or(StoreError::NotFound(id))
}

fn reinforce_edge_tx(
    conn: &Connection,
    edge_id: &str,
    new_confidence: f64,
    episode_id: &str,
    correlation_id: &str,
) -> Result<Edge> {
    let before =
        get_edge_conn(conn, edge_id)?.ok_or_else(|| StoreError::NotFound(edge_id.to_string()))?;
    let now = Utc::now();
    conn.execute(
        "UPDATE edges SET confidence = ?2, last_reinforced = ?3 WHERE id = ?1",
        params![edge_id, new_confidence, now.to_rfc3339()],
    )?;
    conn.execute(
        "INSERT OR IGNORE INTO edge_episodes (edge_id, episode_id) VALUES (?1, ?2)",
        params![edge_id, episode_id],
    )?;
    conn.execute(
        "UPDATE nodes SET last_reinforced = ?2 WHERE id IN (?1, ?3)",
        params![before.source_id, now.to_rfc3339(), before.target_id],
    )?;
    audit_tx(
        conn,
        &AuditEntry::new(correlation_id, AuditKind::EdgeReinforced, COMPONENT_DIFF, Operation::Reinforce)
            .edge(edge_id)
            .confidence(Some(before.confidence), Some(new_confidence)),
    )?;
    get_edge_conn(conn, edge_id)?.ok_or_else(|| StoreError::NotFound(edge_id.to_string()))
}

fn retract_edge_tx(
    conn: &Connection,
    edge_id: &str,
    reason: &str,
    correlation_id: &str,
) -> Result<Edge> {
    let before =
        get_edge_conn(conn, edge_id)?.ok_or_else(|| StoreError::NotFound(edge_id.to_string()))?;
    conn.execute(
        "UPDATE edges SET retracted = 1, retraction_reason = ?2 WHERE id = ?1",
        params![edge_id, reason],
    )?;
    audit_tx(
        conn,
        &AuditEntry::new(correlation_id, AuditKind::EdgeRetracted, COMPONENT_STORE, Operation::Retract)
            .edge(edge_id)
            .confidence(Some(before.confidence), Some(before.confidence))
            .reasoning(reason),
    )?;
    let mut after = before;
    after.retracted = true;
    after.retraction_reason = Some(reason.to_string());
    Ok(after)
}

fn revise_edge_tx(
    conn: &Connection,
    old_edge_id: &str,
    replacement: &EdgeInput,
    params_cfg: &ConfidenceParams,
    correlation_id: &str,
) -> Result<(Edge, Edge)> {
    let old = get_edge_conn(conn, old_edge_id)?
        .ok_or_else(|| StoreError::NotFound(old_edge_id.to_string()))?;
    conn.execute(
        "UPDATE edges SET retracted = 1, retraction_reason = 'superseded' WHERE id = ?1",
        params![old_edge_id],
    )?;
    let new = create_edge_tx(conn, replacement, params_cfg, correlation_id)?;
    audit_tx(
        conn,
        &AuditEntry::new(correlation_id, AuditKind::EdgeRevised, COMPONENT_DIFF, Operation::Revise)
            .edge(old_edge_id)
            .values(Some(old.target_id.clone()), Some(new.target_id.clone()))
            .confidence(Some(old.confidence), Some(new.confidence))
            .reasoning(format!("superseded by {}", new.id)),
    )?;
    let mut retracted_old = old;
    retracted_old.retracted = true;
    retracted_old.retraction_reason = Some("superseded".to_string());
    Ok((retracted_old, new))
}

fn insert_episode_conn(conn: &Connection, episode: &Episode) -> Result<()> {
    conn.execute(
        "INSERT OR IGNORE INTO episodes
         (id, occurred_at, session_id, turn_number, channel, sentiment, outcome)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            episode.id,
            episode.occurred_at.to_rfc3339(),
            episode.session_id,
            episode.turn_number,
            episode.channel,
            episode.sentiment,
            episode.outcome,
        ],
    )?;
    Ok(())
}

fn get_episode_conn(conn: &Connection, id: &str) -> Result<Option<Episode>> {
    let episode = conn
        .query_row(
            "SELECT id, occurred_at, session_id, turn_number, channel, sentiment, outcome
             FROM episodes WHERE id = ?1",
            params![id],
            |row| {
                let occurred: String = row.get(1)?;
                Ok(Episode {
                    id: row.get(0)?,
                    occurred_at: parse_ts(&occurred)?,
                    session_id: row.get(2)?,
                    turn_number: row.get(3)?,
                    channel: row.get(4)?,
                    sentiment: row.get(5)?,
                    outcome: row.get(6)?,
                    edge_ids: vec![],
                })
            },
        )
        .optional()?;
    match episode {
        Some(mut episode) => {
            let mut stmt = conn.prepare(
                "SELECT edge_id FROM edge_episodes WHERE episode_id = ?1 ORDER BY edge_id",
            )?;
            episode.edge_ids = stmt
                .query_map(params![episode.id], |row| row.get(0))?
                .collect::<std::result::Result<_, _>>()?;
            Ok(Some(episode))
        }
        None => Ok(None),
    }
}

fn resolve_or_create_node(
    conn: &Connection,
    name: &str,
    correlation_id: &str,
    outcome: &mut DeltaOutcome,
    events: &mut Vec<GraphEvent>,
) -> Result<Node> {
    if let Some(node) = resolve_name_conn(conn, name)? {
        return Ok(node);
    }
    // Extraction sometimes references an entity in a relation without
    // declaring it; create it with the safest kind rather than dropping
    // the edge.
    let input = NodeInput::new(NodeKind::Concept, name);
    let (node, created) = upsert_node_tx(conn, &input, correlation_id)?;
    if created {
        outcome.nodes_created += 1;
        events.push(GraphEvent::NodeAdded { node: node.clone() });
    }
    Ok(node)
}

fn commit_inbound_done(
    conn: &Connection,
    session_id: &str,
    turn_number: u32,
    channel: &str,
) -> Result<()> {
    let now = Utc::now().to_rfc3339();
    conn.execute(
        "INSERT INTO inbound_events
         (session_id, turn_number, channel, text, entities_hint, enqueued_at, status, attempts, next_attempt_at)
         VALUES (?1, ?2, ?3, '', '[]', ?4, 'done', 0, ?4)
         ON CONFLICT(session_id, turn_number) DO UPDATE SET status = 'done', text = ''",
        params![session_id, turn_number, channel, now],
    )?;
    Ok(())
}

fn audit_tx(conn: &Connection, entry: &AuditEntry) -> Result<i64> {
    conn.execute(
        "INSERT INTO audit_log
         (timestamp, correlation_id, kind, component, operation, node_id, edge_id, old_value,
          new_value, confidence_before, confidence_after, mechanism, session_id, reasoning)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
        params![
            Utc::now().to_rfc3339(),
            entry.correlation_id,
            entry.kind,
            entry.component,
            entry.operation,
            entry.node_id,
            entry.edge_id,
            entry.old_value,
            entry.new_value,
            entry.confidence_before,
            entry.confidence_after,
            entry.mechanism,
            entry.session_id,
            entry.reasoning,
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

// ============================================================================
// TESTS
// ============================================================================
