//! Database Migrations
//!
//! Schema migration definitions for the graph store.

/// Migration definitions
pub const MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        description: "Initial graph schema: nodes, aliases, edges, episodes",
        up: MIGRATION_V1_UP,
    },
    Migration {
        version: 2,
        description: "Append-only audit log",
        up: MIGRATION_V2_UP,
    },
    Migration {
        version: 3,
        description: "Durable inbound/outbound queues and delivery counters",
        up: MIGRATION_V3_UP,
    },
];

/// A database migration
#[derive(Debug, Clone)]
pub struct Migration {
    /// Version number
    pub version: u32,
    /// Description
    pub description: &'static str,
    /// SQL to apply
    pub up: &'static str,
}

/// V1: Core graph schema
const MIGRATION_V1_UP: &str = r#"
CREATE TABLE IF NOT EXISTS schema_version (
    version INTEGER NOT NULL,
    applied_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS nodes (
    id TEXT PRIMARY KEY,
    kind TEXT NOT NULL DEFAULT 'concept',
    name TEXT NOT NULL,
    name_folded TEXT NOT NULL,
    properties TEXT NOT NULL DEFAULT '{}',
    privacy INTEGER NOT NULL DEFAULT 2,
    created_at TEXT NOT NULL,
    last_reinforced TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_nodes_kind ON nodes(kind);
CREATE INDEX IF NOT EXISTS idx_nodes_name_folded ON nodes(name_folded);

-- Aliases are a function: one representative node per (kind, folded alias)
CREATE TABLE IF NOT EXISTS node_aliases (
    node_id TEXT NOT NULL REFERENCES nodes(id) ON DELETE CASCADE,
    alias TEXT NOT NULL,
    PRIMARY KEY (node_id, alias)
);

CREATE INDEX IF NOT EXISTS idx_aliases_alias ON node_aliases(alias);

CREATE TABLE IF NOT EXISTS edges (
    id TEXT PRIMARY KEY,
    source_id TEXT NOT NULL REFERENCES nodes(id),
    target_id TEXT NOT NULL REFERENCES nodes(id),
    relation TEXT NOT NULL,
    confidence REAL NOT NULL,
    temporal_type TEXT NOT NULL DEFAULT 'state',
    first_observed TEXT NOT NULL,
    last_reinforced TEXT NOT NULL,
    decay_rate REAL NOT NULL DEFAULT 0.08,
    context_tags TEXT NOT NULL DEFAULT '[]',
    provenance TEXT NOT NULL DEFAULT 'explicit',
    expiry TEXT,
    retracted INTEGER NOT NULL DEFAULT 0,
    retraction_reason TEXT,
    archived INTEGER NOT NULL DEFAULT 0,
    refines TEXT,
    secondhand INTEGER NOT NULL DEFAULT 0,
    hypothetical INTEGER NOT NULL DEFAULT 0,
    attribution_uncertain INTEGER NOT NULL DEFAULT 0
);

CREATE INDEX IF NOT EXISTS idx_edges_source ON edges(source_id);
CREATE INDEX IF NOT EXISTS idx_edges_target ON edges(target_id);
CREATE INDEX IF NOT EXISTS idx_edges_relation ON edges(relation);
CREATE INDEX IF NOT EXISTS idx_edges_active ON edges(retracted, archived);

CREATE TABLE IF NOT EXISTS episodes (
    id TEXT PRIMARY KEY,
    occurred_at TEXT NOT NULL,
    session_id TEXT NOT NULL,
    turn_number INTEGER NOT NULL,
    channel TEXT NOT NULL DEFAULT 'chat',
    sentiment REAL NOT NULL DEFAULT 0.0,
    outcome REAL NOT NULL DEFAULT 0.0
);

CREATE INDEX IF NOT EXISTS idx_episodes_session ON episodes(session_id, turn_number);

CREATE TABLE IF NOT EXISTS edge_episodes (
    edge_id TEXT NOT NULL REFERENCES edges(id) ON DELETE CASCADE,
    episode_id TEXT NOT NULL REFERENCES episodes(id),
    PRIMARY KEY (edge_id, episode_id)
);

CREATE INDEX IF NOT EXISTS idx_edge_episodes_episode ON edge_episodes(episode_id);

INSERT INTO schema_version (version, applied_at) VALUES (1, datetime('now'));
"#;

/// V2: Audit log
const MIGRATION_V2_UP: &str = r#"
CREATE TABLE IF NOT EXISTS audit_log (
    seq INTEGER PRIMARY KEY AUTOINCREMENT,
    timestamp TEXT NOT NULL,
    correlation_id TEXT NOT NULL,
    kind TEXT NOT NULL,
    component TEXT NOT NULL,
    operation TEXT NOT NULL,
    node_id TEXT,
    edge_id TEXT,
    old_value TEXT,
    new_value TEXT,
    confidence_before REAL,
    confidence_after REAL,
    mechanism TEXT,
    session_id TEXT,
    reasoning TEXT
);

CREATE INDEX IF NOT EXISTS idx_audit_correlation ON audit_log(correlation_id);
CREATE INDEX IF NOT EXISTS idx_audit_kind ON audit_log(kind);
CREATE INDEX IF NOT EXISTS idx_audit_edge ON audit_log(edge_id);

UPDATE schema_version SET version = 2, applied_at = datetime('now');
"#;

/// V3: Queues and delivery counters
const MIGRATION_V3_UP: &str = r#"
-- Inbound interaction events; the primary key is the idempotency key
CREATE TABLE IF NOT EXISTS inbound_events (
    session_id TEXT NOT NULL,
    turn_number INTEGER NOT NULL,
    channel TEXT NOT NULL DEFAULT 'chat',
    text TEXT NOT NULL,
    entities_hint TEXT NOT NULL DEFAULT '[]',
    client_timestamp TEXT,
    stt_confidence REAL,
    enqueued_at TEXT NOT NULL,
    status TEXT NOT NULL DEFAULT 'queued',
    attempts INTEGER NOT NULL DEFAULT 0,
    next_attempt_at TEXT NOT NULL,
    last_error TEXT,
    PRIMARY KEY (session_id, turn_number)
);

CREATE INDEX IF NOT EXISTS idx_inbound_status ON inbound_events(status, next_attempt_at);

-- Pending probes and starters
CREATE TABLE IF NOT EXISTS outbound_items (
    id TEXT PRIMARY KEY,
    kind TEXT NOT NULL,
    subtype TEXT NOT NULL,
    priority REAL NOT NULL,
    context_tags TEXT NOT NULL DEFAULT '[]',
    entities TEXT NOT NULL DEFAULT '[]',
    min_turn INTEGER NOT NULL DEFAULT 3,
    earliest TEXT NOT NULL,
    latest TEXT,
    cooldown_until TEXT,
    state TEXT NOT NULL DEFAULT 'queued',
    payload TEXT NOT NULL,
    created_at TEXT NOT NULL,
    delivered_at TEXT,
    ignored_count INTEGER NOT NULL DEFAULT 0
);

CREATE INDEX IF NOT EXISTS idx_outbound_state ON outbound_items(state, kind);

-- Probe/starter delivery counters: scope is 'day:<date>', 'week:<iso-week>'
-- or 'conversation:<session>'
CREATE TABLE IF NOT EXISTS delivery_counters (
    scope TEXT NOT NULL,
    counter_key TEXT NOT NULL,
    count INTEGER NOT NULL DEFAULT 0,
    PRIMARY KEY (scope, counter_key)
);

UPDATE schema_version SET version = 3, applied_at = datetime('now');
"#;

/// Get current schema version from database
pub fn get_current_version(conn: &rusqlite::Connection) -> rusqlite::Result<u32> {
    conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM schema_version",
        [],
        |row| row.get(0),
    )
    .or(Ok(0))
}

/// Apply pending migrations
pub fn apply_migrations(conn: &rusqlite::Connection) -> rusqlite::Result<u32> {
    let current_version = get_current_version(conn)?;
    let mut applied = 0;

    for migration in MIGRATIONS {
        if migration.version > current_version {
            tracing::info!(
                "Applying migration v{}: {}",
                migration.version,
                migration.description
            );
            conn.execute_batch(migration.up)?;
            applied += 1;
        }
    }

    Ok(applied)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_migrations_apply_cleanly() {
        let conn = rusqlite::Connection::open_in_memory().unwrap();
        let applied = apply_migrations(&conn).unwrap();
        assert_eq!(applied as usize, MIGRATIONS.len());
        assert_eq!(get_current_version(&conn).unwrap(), 3);
    }

    #[test]
    fn test_migrations_are_idempotent() {
        let conn = rusqlite::Connection::open_in_memory().unwrap();
        apply_migrations(&conn).unwrap();
        let applied = apply_migrations(&conn).unwrap();
        assert_eq!(applied, 0);
    }

    #[test]
    fn test_versions_are_strictly_increasing() {
        let mut last = 0;
        for m in MIGRATIONS {
            assert!(m.version > last, "migration versions must increase");
            last = m.version;
        }
    }
}
