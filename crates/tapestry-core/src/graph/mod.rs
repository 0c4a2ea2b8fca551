//! Graph domain types — nodes, edges, episodes.
//!
//! The knowledge graph is a typed directed multigraph: parallel edges
//! between the same node pair are allowed as long as their relations
//! differ. Everything here is plain data; mutation rules live in the
//! store and the diff engine.

mod edge;
mod episode;
mod node;

pub use edge::{Edge, EdgeInput, Provenance, TemporalType};
pub use episode::Episode;
pub use node::{fold_name, Node, NodeInput, NodeKind, PrivacyLevel};
