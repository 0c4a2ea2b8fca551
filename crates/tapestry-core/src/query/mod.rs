//! Query surface — structured subgraph queries, the NL planner, and
//! context-block assembly.
//!
//! The structured path is deterministic and fast; the NL path asks the
//! small LLM to translate a question into a structured plan and falls
//! back to a broad search when the plan is unusable.

mod context;
mod nl;
mod structured;

pub use context::{assemble_context_block, ContextBlock};
pub use nl::{NlPlanner, QueryPlan};
pub use structured::{query_subgraph, QueryRequest, QueryResult};
