//! Graph store — SQLite system of record for the knowledge graph.
//!
//! One logical writer per store: all mutations go through the writer
//! connection and commit atomically per interaction. Readers see the
//! most recent committed state (WAL). The audit log is written inside
//! the same transaction as the mutation it describes.

mod migrations;
mod sqlite;

pub use sqlite::{
    EdgeFilter, EnqueueResult, GraphSnapshot, GraphStore, InboundRow, Result, SnapshotStats,
    StoreError, StoreStats,
};
