//! Tapestry MCP server library — protocol layer, tool handlers, and the
//! live dashboard, shared between the server binary and tests.

pub mod dashboard;
pub mod protocol;
pub mod server;
pub mod tools;
