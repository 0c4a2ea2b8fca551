//! MCP server core — routes JSON-RPC requests to tool handlers.

use std::collections::HashMap;
use std::sync::Arc;

use tapestry_core::Tapestry;
use tracing::{debug, info, warn};

use crate::protocol::messages::{
    CallToolRequest, CallToolResult, InitializeRequest, InitializeResult, ListToolsResult,
    ServerCapabilities, ServerInfo, ToolDescription, ToolResultContent,
};
use crate::protocol::types::{JsonRpcError, JsonRpcRequest, JsonRpcResponse, MCP_VERSION};
use crate::tools;

/// MCP server over the shared Tapestry service
pub struct McpServer {
    service: Arc<Tapestry>,
    initialized: bool,
}

impl McpServer {
    pub fn new(service: Arc<Tapestry>) -> Self {
        Self { service, initialized: false }
    }

    /// Handle an incoming JSON-RPC request. Notifications return None.
    pub async fn handle_request(&mut self, request: JsonRpcRequest) -> Option<JsonRpcResponse> {
        debug!("Handling request: {}", request.method);

        if !self.initialized
            && request.method != "initialize"
            && request.method != "notifications/initialized"
        {
            warn!("Rejecting request '{}': server not initialized", request.method);
            return Some(JsonRpcResponse::error(
                request.id,
                JsonRpcError::server_not_initialized(),
            ));
        }

        let result = match request.method.as_str() {
            "initialize" => self.handle_initialize(request.params).await,
            "notifications/initialized" => return None,
            "tools/list" => self.handle_tools_list().await,
            "tools/call" => self.handle_tools_call(request.params).await,
            "ping" => Ok(serde_json::json!({})),
            method => {
                warn!("Unknown method: {}", method);
                Err(JsonRpcError::method_not_found())
            }
        };

        Some(match result {
            Ok(result) => JsonRpcResponse::success(request.id, result),
            Err(error) => JsonRpcResponse::error(request.id, error),
        })
    }

    async fn handle_initialize(
        &mut self,
        params: Option<serde_json::Value>,
    ) -> Result<serde_json::Value, JsonRpcError> {
        let request: InitializeRequest = match params {
            Some(p) => serde_json::from_value(p)
                .map_err(|e| JsonRpcError::invalid_params(&e.to_string()))?,
            None => InitializeRequest::default(),
        };

        // Version negotiation: use the client's version when it is older
        // than ours; clients reject servers advertising newer protocols.
        let negotiated_version = if request.protocol_version.as_str() < MCP_VERSION {
            info!("Client requested older protocol version {}, using it", request.protocol_version);
            request.protocol_version.clone()
        } else {
            MCP_VERSION.to_string()
        };

        self.initialized = true;
        info!("MCP session initialized with protocol version {}", negotiated_version);

        let result = InitializeResult {
            protocol_version: negotiated_version,
            server_info: ServerInfo {
                name: "tapestry".to_string(),
                version: env!("CARGO_PKG_VERSION").to_string(),
            },
            capabilities: ServerCapabilities {
                tools: Some({
                    let mut map = HashMap::new();
                    map.insert("listChanged".to_string(), serde_json::json!(false));
                    map
                }),
                resources: None,
                prompts: None,
            },
            instructions: Some(
                "Tapestry is a knowledge-graph memory service. Report every user \
                 utterance with report_interaction (or get_context to also receive \
                 relevant knowledge back). Query with query/query_nl. Pull pending \
                 questions with get_probes at natural conversational moments and \
                 report the user's reaction with probe_feedback. Corrections the \
                 user states explicitly go through user_correction — they always win."
                    .to_string(),
            ),
        };

        serde_json::to_value(result).map_err(|e| JsonRpcError::internal_error(&e.to_string()))
    }

    async fn handle_tools_list(&self) -> Result<serde_json::Value, JsonRpcError> {
        let tools = vec![
            ToolDescription {
                name: "report_interaction".to_string(),
                description: Some(
                    "Report one user utterance for knowledge extraction. Non-blocking: \
                     returns an ack before extraction runs. Idempotent on (sessionId, turnNumber)."
                        .to_string(),
                ),
                input_schema: tools::report::schema(),
            },
            ToolDescription {
                name: "get_context".to_string(),
                description: Some(
                    "Process one message AND return relevant graph context in a single call. \
                     The common per-turn operation: extraction summary, subgraph, query plan, \
                     and a token-budgeted context block."
                        .to_string(),
                ),
                input_schema: tools::context::schema(),
            },
            ToolDescription {
                name: "query".to_string(),
                description: Some(
                    "Structured subgraph query: seed entities, BFS depth, relation and \
                     confidence filters. Retracted and archived knowledge is excluded."
                        .to_string(),
                ),
                input_schema: tools::query::schema(),
            },
            ToolDescription {
                name: "query_nl".to_string(),
                description: Some(
                    "Natural-language graph query. The question is translated into a \
                     structured plan; unparseable plans fall back to a broad search."
                        .to_string(),
                ),
                input_schema: tools::query_nl::schema(),
            },
            ToolDescription {
                name: "get_probes".to_string(),
                description: Some(
                    "Pull the single best-fit pending probe for the current conversational \
                     moment, or nothing. Delivery is gated by context fit, turn number, and \
                     frequency limits; retrieval consumes the probe."
                        .to_string(),
                ),
                input_schema: tools::probes::schema(),
            },
            ToolDescription {
                name: "probe_feedback".to_string(),
                description: Some(
                    "Report what the user did with a delivered probe: accepted, ignored \
                     (short cooldown), or deflected (long cooldown)."
                        .to_string(),
                ),
                input_schema: tools::probes::feedback_schema(),
            },
            ToolDescription {
                name: "get_starters".to_string(),
                description: Some(
                    "Ranked system-initiated conversation openings generated from external \
                     events (weather, calendar, news) that overlap the graph."
                        .to_string(),
                ),
                input_schema: tools::starters::schema(),
            },
            ToolDescription {
                name: "user_correction".to_string(),
                description: Some(
                    "Apply an explicit user correction: revise a value, retract a fact \
                     (kept for audit), or delete it physically. Always applied."
                        .to_string(),
                ),
                input_schema: tools::correction::schema(),
            },
            ToolDescription {
                name: "get_provenance".to_string(),
                description: Some(
                    "Trace an edge back to the episodes and audit records that produced it."
                        .to_string(),
                ),
                input_schema: tools::provenance::schema(),
            },
            ToolDescription {
                name: "graph_snapshot".to_string(),
                description: Some("Full graph export as JSON or GraphML.".to_string()),
                input_schema: tools::snapshot::schema(),
            },
            ToolDescription {
                name: "system_status".to_string(),
                description: Some(
                    "Component-wise health: store stats, LLM circuit-breaker states, \
                     token spend, queue depths, hallucination counters."
                        .to_string(),
                ),
                input_schema: tools::status::schema(),
            },
        ];

        let result = ListToolsResult { tools };
        serde_json::to_value(result).map_err(|e| JsonRpcError::internal_error(&e.to_string()))
    }

    async fn handle_tools_call(
        &self,
        params: Option<serde_json::Value>,
    ) -> Result<serde_json::Value, JsonRpcError> {
        let request: CallToolRequest = match params {
            Some(p) => serde_json::from_value(p)
                .map_err(|e| JsonRpcError::invalid_params(&e.to_string()))?,
            None => return Err(JsonRpcError::invalid_params("Missing tool call parameters")),
        };

        let result = match request.name.as_str() {
            "report_interaction" => tools::report::execute(&self.service, request.arguments).await,
            "get_context" => tools::context::execute(&self.service, request.arguments).await,
            "query" => tools::query::execute(&self.service, request.arguments).await,
            "query_nl" => tools::query_nl::execute(&self.service, request.arguments).await,
            "get_probes" => tools::probes::execute(&self.service, request.arguments).await,
            "probe_feedback" => {
                tools::probes::execute_feedback(&self.service, request.arguments).await
            }
            "get_starters" => tools::starters::execute(&self.service, request.arguments).await,
            "user_correction" => {
                tools::correction::execute(&self.service, request.arguments).await
            }
            "get_provenance" => {
                tools::provenance::execute(&self.service, request.arguments).await
            }
            "graph_snapshot" => tools::snapshot::execute(&self.service, request.arguments).await,
            "system_status" => tools::status::execute(&self.service, request.arguments).await,
            name => {
                return Err(JsonRpcError::method_not_found_with_message(&format!(
                    "Unknown tool: {}",
                    name
                )));
            }
        };

        let response = match result {
            Ok(content) => CallToolResult {
                content: vec![ToolResultContent {
                    content_type: "text".to_string(),
                    text: serde_json::to_string_pretty(&content)
                        .unwrap_or_else(|_| content.to_string()),
                }],
                is_error: Some(false),
            },
            Err(e) => CallToolResult {
                content: vec![ToolResultContent {
                    content_type: "text".to_string(),
                    text: serde_json::json!({ "error": e }).to_string(),
                }],
                is_error: Some(true),
            },
        };
        serde_json::to_value(response).map_err(|e| JsonRpcError::internal_error(&e.to_string()))
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::test_service;

    fn make_request(method: &str, params: Option<serde_json::Value>) -> JsonRpcRequest {
        JsonRpcRequest {
            jsonrpc: "2.0".to_string(),
            id: Some(serde_json::json!(1)),
            method: method.to_string(),
            params,
        }
    }

    async fn initialized_server() -> (McpServer, tempfile::TempDir) {
        let (service, dir) = test_service();
        let mut server = McpServer::new(service);
        server.handle_request(make_request("initialize", None)).await;
        (server, dir)
    }

    #[tokio::test]
    async fn test_request_before_initialize_rejected() {
        let (service, _dir) = test_service();
        let mut server = McpServer::new(service);

        let response = server
            .handle_request(make_request("tools/list", None))
            .await
            .unwrap();
        assert_eq!(response.error.unwrap().code, -32003);
    }

    #[tokio::test]
    async fn test_initialize_negotiates_version() {
        let (service, _dir) = test_service();
        let mut server = McpServer::new(service);

        let response = server
            .handle_request(make_request(
                "initialize",
                Some(serde_json::json!({
                    "protocolVersion": "2024-11-05",
                    "capabilities": {},
                    "clientInfo": {"name": "test", "version": "1.0"}
                })),
            ))
            .await
            .unwrap();
        let result = response.result.unwrap();
        assert_eq!(result["protocolVersion"], "2024-11-05");
        assert_eq!(result["serverInfo"]["name"], "tapestry");
    }

    #[tokio::test]
    async fn test_initialized_notification_returns_none() {
        let (mut server, _dir) = initialized_server().await;
        let response = server
            .handle_request(make_request("notifications/initialized", None))
            .await;
        assert!(response.is_none());
    }

    #[tokio::test]
    async fn test_tools_list_covers_agent_surface() {
        let (mut server, _dir) = initialized_server().await;
        let response = server
            .handle_request(make_request("tools/list", None))
            .await
            .unwrap();
        let result = response.result.unwrap();
        let names: Vec<&str> = result["tools"]
            .as_array()
            .unwrap()
            .iter()
            .map(|t| t["name"].as_str().unwrap())
            .collect();

        for expected in [
            "report_interaction",
            "get_context",
            "query",
            "query_nl",
            "get_probes",
            "probe_feedback",
            "get_starters",
            "user_correction",
            "get_provenance",
            "graph_snapshot",
            "system_status",
        ] {
            assert!(names.contains(&expected), "missing tool {expected}");
        }

        for tool in result["tools"].as_array().unwrap() {
            assert!(tool["description"].is_string());
            assert!(tool["inputSchema"].is_object());
        }
    }

    #[tokio::test]
    async fn test_unknown_tool_errors() {
        let (mut server, _dir) = initialized_server().await;
        let response = server
            .handle_request(make_request(
                "tools/call",
                Some(serde_json::json!({"name": "nonexistent", "arguments": {}})),
            ))
            .await
            .unwrap();
        assert_eq!(response.error.unwrap().code, -32601);
    }

    #[tokio::test]
    async fn test_tool_call_roundtrip() {
        let (mut server, _dir) = initialized_server().await;
        let response = server
            .handle_request(make_request(
                "tools/call",
                Some(serde_json::json!({
                    "name": "report_interaction",
                    "arguments": {"sessionId": "s1", "turnNumber": 1, "text": "hello world"}
                })),
            ))
            .await
            .unwrap();
        let result = response.result.unwrap();
        assert_eq!(result["isError"], false);
        let text = result["content"][0]["text"].as_str().unwrap();
        assert!(text.contains("accepted"));
    }

    #[tokio::test]
    async fn test_tool_error_is_marked() {
        let (mut server, _dir) = initialized_server().await;
        let response = server
            .handle_request(make_request(
                "tools/call",
                Some(serde_json::json!({"name": "query_nl", "arguments": {}})),
            ))
            .await
            .unwrap();
        let result = response.result.unwrap();
        assert_eq!(result["isError"], true);
    }

    #[tokio::test]
    async fn test_ping() {
        let (mut server, _dir) = initialized_server().await;
        let response = server.handle_request(make_request("ping", None)).await.unwrap();
        assert_eq!(response.result.unwrap(), serde_json::json!({}));
    }
}
