//! Tool handlers — one module per MCP tool.
//!
//! Every module follows the same shape: `schema()` returns the JSON
//! schema advertised by `tools/list`, `execute()` runs the call against
//! the shared service and returns a JSON value or an error string.

pub mod context;
pub mod correction;
pub mod probes;
pub mod provenance;
pub mod query;
pub mod query_nl;
pub mod report;
pub mod snapshot;
pub mod starters;
pub mod status;

/// Pull a string argument out of the tool call arguments.
pub(crate) fn arg_str(args: &Option<serde_json::Value>, key: &str) -> Option<String> {
    args.as_ref()
        .and_then(|a| a.get(key))
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
}

/// Pull a string-array argument out of the tool call arguments.
pub(crate) fn arg_str_list(args: &Option<serde_json::Value>, key: &str) -> Vec<String> {
    args.as_ref()
        .and_then(|a| a.get(key))
        .and_then(|v| v.as_array())
        .map(|items| {
            items
                .iter()
                .filter_map(|v| v.as_str())
                .map(|s| s.to_string())
                .collect()
        })
        .unwrap_or_default()
}

/// Pull a u64 argument out of the tool call arguments.
pub(crate) fn arg_u64(args: &Option<serde_json::Value>, key: &str) -> Option<u64> {
    args.as_ref().and_then(|a| a.get(key)).and_then(|v| v.as_u64())
}

/// Pull an f64 argument out of the tool call arguments.
pub(crate) fn arg_f64(args: &Option<serde_json::Value>, key: &str) -> Option<f64> {
    args.as_ref().and_then(|a| a.get(key)).and_then(|v| v.as_f64())
}
