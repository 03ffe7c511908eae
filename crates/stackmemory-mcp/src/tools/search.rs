//! Search Tool
//!
//! `search_frames`: thin wrapper over the store's full-text index returning
//! frame headers.

use std::sync::Arc;

use serde::Deserialize;
use serde_json::Value;
use stackmemory_core::MemoryEngine;

use super::{deadline_from, required_args, ToolResult};

pub fn schema() -> Value {
    serde_json::json!({
        "type": "object",
        "properties": {
            "query": {
                "type": "string",
                "description": "Full-text query over frame names, event text, and anchor text"
            },
            "limit": {
                "type": "integer",
                "description": "Maximum frames returned",
                "default": 20
            },
            "deadline_ms": { "type": "integer" }
        },
        "required": ["query"]
    })
}

#[derive(Debug, Deserialize)]
struct SearchFramesArgs {
    query: String,
    limit: Option<usize>,
    deadline_ms: Option<u64>,
}

pub fn search_frames(engine: &Arc<MemoryEngine>, args: Option<Value>) -> ToolResult {
    let args: SearchFramesArgs = required_args(args)?;
    MemoryEngine::check_deadline(deadline_from(args.deadline_ms))?;
    let frames = engine.search_frames(&args.query, args.limit.unwrap_or(20))?;
    let count = frames.len();
    Ok(serde_json::json!({
        "frames": frames,
        "count": count,
    })
    .into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_search_returns_headers() {
        let dir = TempDir::new().unwrap();
        let engine = Arc::new(
            MemoryEngine::init_at(dir.path().join("proj"), dir.path().join("home")).unwrap(),
        );
        engine.start_frame("tune websocket pings", None, None, None).unwrap();

        let out = search_frames(&engine, Some(serde_json::json!({"query": "websocket"}))).unwrap();
        assert_eq!(out.value["count"], 1);
        assert_eq!(out.value["frames"][0]["name"], "tune websocket pings");
        assert_eq!(out.value["frames"][0]["state"], "active");
    }

    #[test]
    fn test_query_is_required() {
        let dir = TempDir::new().unwrap();
        let engine = Arc::new(
            MemoryEngine::init_at(dir.path().join("proj"), dir.path().join("home")).unwrap(),
        );
        assert!(search_frames(&engine, None).is_err());
    }
}
