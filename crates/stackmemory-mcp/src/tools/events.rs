//! Event Tool
//!
//! `append_event`: append-only writes into a frame's log.

use std::sync::Arc;

use serde::Deserialize;
use serde_json::Value;
use stackmemory_core::MemoryEngine;

use super::{deadline_from, required_args, ToolResult};

pub fn schema() -> Value {
    serde_json::json!({
        "type": "object",
        "properties": {
            "frame_id": {
                "type": "string",
                "description": "Frame receiving the event; must be active"
            },
            "event_type": {
                "type": "string",
                "enum": ["tool_call", "tool_result", "note", "error", "decision_log", "anchor_add"],
                "description": "Kind of event"
            },
            "payload": {
                "type": "object",
                "description": "Structured payload; at most 1 MiB encoded"
            },
            "deadline_ms": { "type": "integer" }
        },
        "required": ["frame_id", "event_type", "payload"]
    })
}

#[derive(Debug, Deserialize)]
struct AppendEventArgs {
    frame_id: String,
    event_type: String,
    payload: Value,
    deadline_ms: Option<u64>,
}

pub fn append_event(engine: &Arc<MemoryEngine>, args: Option<Value>) -> ToolResult {
    let args: AppendEventArgs = required_args(args)?;
    MemoryEngine::check_deadline(deadline_from(args.deadline_ms))?;
    let event_id = engine.append_event(&args.frame_id, &args.event_type, args.payload)?;
    Ok(serde_json::json!({"eventId": event_id}).into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn engine_with_frame() -> (Arc<MemoryEngine>, String, TempDir) {
        let dir = TempDir::new().unwrap();
        let engine =
            MemoryEngine::init_at(dir.path().join("proj"), dir.path().join("home")).unwrap();
        let frame = engine.start_frame("events", None, None, None).unwrap();
        (Arc::new(engine), frame.frame_id, dir)
    }

    #[test]
    fn test_append_event() {
        let (engine, frame_id, _dir) = engine_with_frame();
        let out = append_event(
            &engine,
            Some(serde_json::json!({
                "frame_id": frame_id,
                "event_type": "tool_call",
                "payload": {"tool": "Write", "path": "a.rs"},
            })),
        )
        .unwrap();
        assert!(out.value["eventId"].is_string());
    }

    #[test]
    fn test_unknown_frame_is_not_found() {
        let (engine, _frame_id, _dir) = engine_with_frame();
        let err = append_event(
            &engine,
            Some(serde_json::json!({
                "frame_id": "ghost",
                "event_type": "note",
                "payload": {},
            })),
        )
        .unwrap_err();
        assert_eq!(err.error_code(), "NotFound");
    }

    #[test]
    fn test_unknown_event_type_is_invalid() {
        let (engine, frame_id, _dir) = engine_with_frame();
        let err = append_event(
            &engine,
            Some(serde_json::json!({
                "frame_id": frame_id,
                "event_type": "telemetry",
                "payload": {},
            })),
        )
        .unwrap_err();
        assert_eq!(err.error_code(), "InvalidArgument");
    }
}
