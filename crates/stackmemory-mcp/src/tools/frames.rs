//! Frame Lifecycle Tools
//!
//! `start_frame`, `close_frame`, and `get_hot_stack`.

use std::sync::Arc;

use serde::Deserialize;
use serde_json::Value;
use stackmemory_core::MemoryEngine;

use super::{deadline_from, optional_args, required_args, ToolResult};

pub fn start_frame_schema() -> Value {
    serde_json::json!({
        "type": "object",
        "properties": {
            "name": {
                "type": "string",
                "description": "Frame name, 1-200 characters"
            },
            "frame_type": {
                "type": "string",
                "enum": ["task", "subtask", "tool_scope", "context", "review", "write", "debug"],
                "description": "Kind of frame; defaults to task",
                "default": "task"
            },
            "constraints": {
                "type": "array",
                "items": { "type": "string" },
                "description": "Constraints pinned to the frame for its whole lifetime"
            },
            "definitions": {
                "type": "object",
                "description": "Structured definitions visible to retrieval"
            },
            "deadline_ms": { "type": "integer", "description": "Optional call deadline in milliseconds" }
        },
        "required": ["name"]
    })
}

#[derive(Debug, Deserialize)]
struct StartFrameArgs {
    name: String,
    frame_type: Option<String>,
    constraints: Option<Vec<String>>,
    definitions: Option<Value>,
    deadline_ms: Option<u64>,
}

pub fn start_frame(engine: &Arc<MemoryEngine>, args: Option<Value>) -> ToolResult {
    let args: StartFrameArgs = required_args(args)?;
    MemoryEngine::check_deadline(deadline_from(args.deadline_ms))?;
    let frame = engine.start_frame(
        &args.name,
        args.frame_type.as_deref(),
        args.constraints,
        args.definitions,
    )?;
    Ok(serde_json::json!({
        "frameId": frame.frame_id,
        "parentFrameId": frame.parent_frame_id,
        "depth": frame.depth,
    })
    .into())
}

pub fn close_frame_schema() -> Value {
    serde_json::json!({
        "type": "object",
        "properties": {
            "frame_id": {
                "type": "string",
                "description": "Frame to close; the stack top when omitted. Closing a non-top frame closes its descendants first."
            },
            "summary": {
                "type": "string",
                "description": "Optional caller summary recorded in the digest"
            },
            "deadline_ms": { "type": "integer" }
        }
    })
}

#[derive(Debug, Default, Deserialize)]
struct CloseFrameArgs {
    frame_id: Option<String>,
    summary: Option<String>,
    deadline_ms: Option<u64>,
}

pub fn close_frame(engine: &Arc<MemoryEngine>, args: Option<Value>) -> ToolResult {
    let args: CloseFrameArgs = optional_args(args)?;
    MemoryEngine::check_deadline(deadline_from(args.deadline_ms))?;
    let digest = engine.close_frame(args.frame_id.as_deref(), args.summary.as_deref())?;
    Ok(serde_json::to_value(digest)
        .unwrap_or(Value::Null)
        .into())
}

pub fn get_hot_stack_schema() -> Value {
    serde_json::json!({
        "type": "object",
        "properties": {
            "max_events": {
                "type": "integer",
                "description": "Recent events included per frame",
                "default": 10
            },
            "deadline_ms": { "type": "integer" }
        }
    })
}

#[derive(Debug, Default, Deserialize)]
struct HotStackArgs {
    max_events: Option<usize>,
    deadline_ms: Option<u64>,
}

pub fn get_hot_stack(engine: &Arc<MemoryEngine>, args: Option<Value>) -> ToolResult {
    let args: HotStackArgs = optional_args(args)?;
    MemoryEngine::check_deadline(deadline_from(args.deadline_ms))?;
    let hot = engine.get_hot_stack(args.max_events.unwrap_or(10))?;
    Ok(serde_json::to_value(hot).unwrap_or(Value::Null).into())
}

// ============================================================================
// TESTS
// ============================================================================
