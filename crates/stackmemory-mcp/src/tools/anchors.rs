//! Anchor Tools
//!
//! `add_anchor` and its `add_decision` shorthand. Anchors are pinned facts
//! with the highest retrieval weight.

use std::sync::Arc;

use serde::Deserialize;
use serde_json::Value;
use stackmemory_core::MemoryEngine;

use super::{deadline_from, required_args, ToolResult};

pub fn add_anchor_schema() -> Value {
    serde_json::json!({
        "type": "object",
        "properties": {
            "frame_id": {
                "type": "string",
                "description": "Frame to pin to; the current frame when omitted"
            },
            "type": {
                "type": "string",
                "enum": ["FACT", "DECISION", "CONSTRAINT", "INTERFACE_CONTRACT", "TODO", "RISK"],
                "description": "Anchor type"
            },
            "text": {
                "type": "string",
                "description": "The pinned fact, at most 4 KiB"
            },
            "priority": {
                "type": "integer",
                "minimum": 1,
                "maximum": 10,
                "description": "Retrieval weight, 1-10; defaults to 5"
            },
            "metadata": {
                "type": "object",
                "description": "Optional source metadata"
            },
            "deadline_ms": { "type": "integer" }
        },
        "required": ["type", "text"]
    })
}

#[derive(Debug, Deserialize)]
struct AddAnchorArgs {
    frame_id: Option<String>,
    #[serde(rename = "type")]
    anchor_type: String,
    text: String,
    priority: Option<u8>,
    metadata: Option<Value>,
    deadline_ms: Option<u64>,
}

pub fn add_anchor(engine: &Arc<MemoryEngine>, args: Option<Value>) -> ToolResult {
    let args: AddAnchorArgs = required_args(args)?;
    MemoryEngine::check_deadline(deadline_from(args.deadline_ms))?;
    let anchor = engine.add_anchor(
        args.frame_id.as_deref(),
        &args.anchor_type,
        &args.text,
        args.priority,
        args.metadata,
    )?;
    Ok(serde_json::json!({
        "anchorId": anchor.anchor_id,
        "frameId": anchor.frame_id,
        "priority": anchor.priority,
    })
    .into())
}

pub fn add_decision_schema() -> Value {
    serde_json::json!({
        "type": "object",
        "properties": {
            "text": {
                "type": "string",
                "description": "The decision to record on the current frame"
            },
            "deadline_ms": { "type": "integer" }
        },
        "required": ["text"]
    })
}

#[derive(Debug, Deserialize)]
struct AddDecisionArgs {
    text: String,
    deadline_ms: Option<u64>,
}

pub fn add_decision(engine: &Arc<MemoryEngine>, args: Option<Value>) -> ToolResult {
    let args: AddDecisionArgs = required_args(args)?;
    MemoryEngine::check_deadline(deadline_from(args.deadline_ms))?;
    let anchor = engine.add_decision(&args.text)?;
    Ok(serde_json::json!({"anchorId": anchor.anchor_id, "frameId": anchor.frame_id}).into())
}
