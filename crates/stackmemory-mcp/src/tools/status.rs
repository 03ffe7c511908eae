//! Status Tool
//!
//! `system_status`: engine identity, store counters, and tier distribution
//! in one call.

use std::sync::Arc;

use serde::Deserialize;
use serde_json::Value;
use stackmemory_core::MemoryEngine;

use super::{deadline_from, optional_args, ToolResult};

pub fn schema() -> Value {
    serde_json::json!({
        "type": "object",
        "properties": {
            "deadline_ms": { "type": "integer" }
        }
    })
}

#[derive(Debug, Default, Deserialize)]
struct SystemStatusArgs {
    deadline_ms: Option<u64>,
}

pub fn system_status(engine: &Arc<MemoryEngine>, args: Option<Value>) -> ToolResult {
    let args: SystemStatusArgs = optional_args(args)?;
    MemoryEngine::check_deadline(deadline_from(args.deadline_ms))?;

    let stats = engine.stats()?;
    let status = if stats.active_frames + stats.closed_frames == 0 {
        "empty"
    } else if stats.queue_depth as usize >= engine.config().queue_soft_ceiling {
        "degraded"
    } else {
        "healthy"
    };

    Ok(serde_json::json!({
        "status": status,
        "version": env!("CARGO_PKG_VERSION"),
        "projectId": engine.project_id(),
        "sessionId": engine.session_id(),
        "stackDepth": engine.get_hot_stack(0)?.frames.len(),
        "stats": stats,
    })
    .into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_status_reflects_activity() {
        let dir = TempDir::new().unwrap();
        let engine = Arc::new(
            MemoryEngine::init_at(dir.path().join("proj"), dir.path().join("home")).unwrap(),
        );

        let out = system_status(&engine, None).unwrap();
        assert_eq!(out.value["status"], "empty");

        engine.start_frame("warmup", None, None, None).unwrap();
        let out = system_status(&engine, None).unwrap();
        assert_eq!(out.value["status"], "healthy");
        assert_eq!(out.value["stackDepth"], 1);
        assert_eq!(out.value["stats"]["activeFrames"], 1);
    }
}
