//! MCP Server Core
//!
//! Routes JSON-RPC requests to the tool handlers. Engine errors become the
//! uniform `{error_code, message, details}` envelope inside a tool result;
//! JSON-RPC errors are reserved for protocol-level failures.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{debug, info, warn};

use stackmemory_core::MemoryEngine;

use crate::protocol::messages::{
    CallToolRequest, CallToolResult, InitializeRequest, InitializeResult, ListToolsResult,
    ServerCapabilities, ServerInfo, ToolDescription,
};
use crate::protocol::types::{JsonRpcError, JsonRpcRequest, JsonRpcResponse, MCP_VERSION};
use crate::tools;

/// MCP server implementation
pub struct McpServer {
    engine: Arc<MemoryEngine>,
    initialized: bool,
}

impl McpServer {
    pub fn new(engine: Arc<MemoryEngine>) -> Self {
        Self {
            engine,
            initialized: false,
        }
    }

    /// Handle one request; `None` means a notification with no response.
    pub async fn handle_request(&mut self, request: JsonRpcRequest) -> Option<JsonRpcResponse> {
        debug!("handling {}", request.method);

        if !self.initialized
            && request.method != "initialize"
            && request.method != "notifications/initialized"
        {
            warn!("rejecting '{}': server not initialized", request.method);
            return Some(JsonRpcResponse::error(
                request.id,
                JsonRpcError::server_not_initialized(),
            ));
        }

        let result = match request.method.as_str() {
            "initialize" => self.handle_initialize(request.params),
            "notifications/initialized" => return None,
            "tools/list" => self.handle_tools_list(),
            "tools/call" => self.handle_tools_call(request.params),
            "ping" => Ok(serde_json::json!({})),
            method => Err(JsonRpcError::method_not_found(method)),
        };

        Some(match result {
            Ok(value) => JsonRpcResponse::success(request.id, value),
            Err(error) => JsonRpcResponse::error(request.id, error),
        })
    }

    fn handle_initialize(
        &mut self,
        params: Option<serde_json::Value>,
    ) -> Result<serde_json::Value, JsonRpcError> {
        let request: InitializeRequest = match params {
            Some(params) => serde_json::from_value(params)
                .map_err(|e| JsonRpcError::invalid_params(&e.to_string()))?,
            None => InitializeRequest::default(),
        };

        // Use the client's version when it is older; clients reject servers
        // that answer with a newer protocol than they asked for.
        let negotiated = if request.protocol_version.as_str() < MCP_VERSION {
            request.protocol_version.clone()
        } else {
            MCP_VERSION.to_string()
        };

        self.initialized = true;
        info!(protocol = %negotiated, "MCP session initialized");

        let result = InitializeResult {
            protocol_version: negotiated,
            server_info: ServerInfo {
                name: "stackmemory".to_string(),
                version: env!("CARGO_PKG_VERSION").to_string(),
            },
            capabilities: ServerCapabilities {
                tools: Some({
                    let mut map = HashMap::new();
                    map.insert("listChanged".to_string(), serde_json::json!(false));
                    map
                }),
            },
            instructions: Some(
                "StackMemory is the assistant's working memory. Open a frame with start_frame \
                 when beginning a unit of work, append_event as you act, pin important facts \
                 with add_anchor (decisions via add_decision), and close_frame when done. \
                 Call get_context at session start or before a context switch to receive a \
                 token-budgeted bundle of anchors, the hot stack, and relevant digests."
                    .to_string(),
            ),
        };
        serde_json::to_value(result).map_err(|e| JsonRpcError::internal_error(&e.to_string()))
    }

    fn handle_tools_list(&self) -> Result<serde_json::Value, JsonRpcError> {
        let describe = |name: &str, description: &str, schema: serde_json::Value| ToolDescription {
            name: name.to_string(),
            description: Some(description.to_string()),
            input_schema: schema,
        };

        let tools = vec![
            describe(
                "start_frame",
                "Open a frame: a scoped unit of work pushed onto the session stack.",
                tools::frames::start_frame_schema(),
            ),
            describe(
                "close_frame",
                "Close a frame (the stack top when unspecified), producing its digest. Closing a non-top frame closes descendants first.",
                tools::frames::close_frame_schema(),
            ),
            describe(
                "append_event",
                "Append a tool_call / tool_result / note / error / decision_log event to an active frame.",
                tools::events::schema(),
            ),
            describe(
                "add_anchor",
                "Pin a typed fact (FACT, DECISION, CONSTRAINT, INTERFACE_CONTRACT, TODO, RISK) with priority 1-10. Anchors outrank everything in retrieval.",
                tools::anchors::add_anchor_schema(),
            ),
            describe(
                "add_decision",
                "Shorthand for add_anchor(DECISION, ...) on the current frame.",
                tools::anchors::add_decision_schema(),
            ),
            describe(
                "get_context",
                "Token-budgeted context bundle: anchors, hot stack, and re-ranked digests for an optional query.",
                tools::context::schema(),
            ),
            describe(
                "get_hot_stack",
                "The active frame chain with recent-event previews and anchor counts.",
                tools::frames::get_hot_stack_schema(),
            ),
            describe(
                "search_frames",
                "Full-text search over frames, events, and anchors; returns frame headers.",
                tools::search::schema(),
            ),
            describe(
                "create_task",
                "Create a task in the companion task store.",
                tools::tasks::create_task_schema(),
            ),
            describe(
                "update_task_status",
                "Move a task through its lifecycle, optionally updating progress.",
                tools::tasks::update_task_status_schema(),
            ),
            describe(
                "get_active_tasks",
                "Open tasks, most urgent first.",
                tools::tasks::get_active_tasks_schema(),
            ),
            describe(
                "get_task_metrics",
                "Aggregate task counters and completion rate.",
                tools::tasks::get_task_metrics_schema(),
            ),
            describe(
                "add_task_dependency",
                "Record that one task depends on another.",
                tools::tasks::add_task_dependency_schema(),
            ),
            describe(
                "system_status",
                "Engine identity, store counters, and tier distribution.",
                tools::status::schema(),
            ),
        ];

        serde_json::to_value(ListToolsResult { tools })
            .map_err(|e| JsonRpcError::internal_error(&e.to_string()))
    }

    fn handle_tools_call(
        &self,
        params: Option<serde_json::Value>,
    ) -> Result<serde_json::Value, JsonRpcError> {
        let request: CallToolRequest = match params {
            Some(params) => serde_json::from_value(params)
                .map_err(|e| JsonRpcError::invalid_params(&e.to_string()))?,
            None => return Err(JsonRpcError::invalid_params("missing tool call params")),
        };

        let engine = &self.engine;
        let args = request.arguments;
        let outcome = match request.name.as_str() {
            "start_frame" => tools::frames::start_frame(engine, args),
            "close_frame" => tools::frames::close_frame(engine, args),
            "append_event" => tools::events::append_event(engine, args),
            "add_anchor" => tools::anchors::add_anchor(engine, args),
            "add_decision" => tools::anchors::add_decision(engine, args),
            "get_context" => tools::context::get_context(engine, args),
            "get_hot_stack" => tools::frames::get_hot_stack(engine, args),
            "search_frames" => tools::search::search_frames(engine, args),
            "create_task" => tools::tasks::create_task(engine, args),
            "update_task_status" => tools::tasks::update_task_status(engine, args),
            "get_active_tasks" => tools::tasks::get_active_tasks(engine, args),
            "get_task_metrics" => tools::tasks::get_task_metrics(engine, args),
            "add_task_dependency" => tools::tasks::add_task_dependency(engine, args),
            "system_status" => tools::status::system_status(engine, args),
            name => {
                return Err(JsonRpcError::method_not_found(&format!("tool {}", name)));
            }
        };

        let result = match outcome {
            Ok(output) => CallToolResult::ok(&output.value, output.metadata),
            Err(e) => {
                warn!(tool = %request.name, error = %e, "tool call failed");
                CallToolResult::error(e.error_code(), &e.to_string(), None)
            }
        };
        serde_json::to_value(result).map_err(|e| JsonRpcError::internal_error(&e.to_string()))
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;
    use tempfile::TempDir;

    fn server() -> (McpServer, TempDir) {
        let dir = TempDir::new().unwrap();
        let engine = Arc::new(
            MemoryEngine::init_at(dir.path().join("proj"), dir.path().join("home")).unwrap(),
        );
        (McpServer::new(engine), dir)
    }

    fn request(method: &str, params: Option<Value>) -> JsonRpcRequest {
        JsonRpcRequest {
            jsonrpc: "2.0".to_string(),
            id: Some(Value::Number(1.into())),
            method: method.to_string(),
            params,
        }
    }

    async fn initialized_server() -> (McpServer, TempDir) {
        let (mut server, dir) = server();
        server.handle_request(request("initialize", None)).await.unwrap();
        (server, dir)
    }

    #[tokio::test]
    async fn test_requests_require_initialize() {
        let (mut server, _dir) = server();
        let response = server.handle_request(request("tools/list", None)).await.unwrap();
        assert_eq!(response.error.unwrap().code, -32003);
    }

    #[tokio::test]
    async fn test_tools_list_names() {
        let (mut server, _dir) = initialized_server().await;
        let response = server.handle_request(request("tools/list", None)).await.unwrap();
        let tools = response.result.unwrap()["tools"]
            .as_array()
            .unwrap()
            .iter()
            .map(|t| t["name"].as_str().unwrap().to_string())
            .collect::<Vec<_>>();
        for expected in [
            "start_frame",
            "close_frame",
            "append_event",
            "add_anchor",
            "add_decision",
            "get_context",
            "get_hot_stack",
            "search_frames",
            "create_task",
            "update_task_status",
            "get_active_tasks",
            "get_task_metrics",
            "add_task_dependency",
            "system_status",
        ] {
            assert!(tools.contains(&expected.to_string()), "missing {}", expected);
        }
    }

    #[tokio::test]
    async fn test_tool_call_roundtrip() {
        let (mut server, _dir) = initialized_server().await;
        let response = server
            .handle_request(request(
                "tools/call",
                Some(serde_json::json!({
                    "name": "start_frame",
                    "arguments": {"name": "Implement auth"},
                })),
            ))
            .await
            .unwrap();
        let result = response.result.unwrap();
        assert!(result.get("isError").is_none());
        let body: Value = serde_json::from_str(result["content"][0]["text"].as_str().unwrap()).unwrap();
        assert!(body["frameId"].is_string());
    }

    #[tokio::test]
    async fn test_engine_errors_use_the_envelope() {
        let (mut server, _dir) = initialized_server().await;
        let response = server
            .handle_request(request(
                "tools/call",
                Some(serde_json::json!({
                    "name": "append_event",
                    "arguments": {"frame_id": "ghost", "event_type": "note", "payload": {}},
                })),
            ))
            .await
            .unwrap();
        let result = response.result.unwrap();
        assert_eq!(result["isError"], true);
        let body: Value = serde_json::from_str(result["content"][0]["text"].as_str().unwrap()).unwrap();
        assert_eq!(body["error_code"], "NotFound");
        assert!(body["message"].as_str().unwrap().contains("ghost"));
    }

    #[tokio::test]
    async fn test_unknown_tool_is_method_not_found() {
        let (mut server, _dir) = initialized_server().await;
        let response = server
            .handle_request(request(
                "tools/call",
                Some(serde_json::json!({"name": "dream", "arguments": {}})),
            ))
            .await
            .unwrap();
        assert_eq!(response.error.unwrap().code, -32601);
    }

    #[tokio::test]
    async fn test_notifications_get_no_response() {
        let (mut server, _dir) = server();
        let notification = JsonRpcRequest {
            jsonrpc: "2.0".to_string(),
            id: None,
            method: "notifications/initialized".to_string(),
            params: None,
        };
        assert!(server.handle_request(notification).await.is_none());
    }
}
