//! Context Tool
//!
//! `get_context`: the token-budgeted bundle of anchors, hot stack, and
//! re-ranked digests. The active weight profile rides along in the response
//! metadata so rankings are reproducible.

use std::sync::Arc;

use serde::Deserialize;
use serde_json::Value;
use stackmemory_core::{ContextFilters, ContextRequest, MemoryEngine};

use super::{deadline_from, optional_args, ToolOutput, ToolResult};

pub fn schema() -> Value {
    serde_json::json!({
        "type": "object",
        "properties": {
            "query": {
                "type": "string",
                "description": "Optional query. Empty returns anchors + hot stack; identifiers match lexically; prose also consults the semantic index when configured."
            },
            "budget_tokens": {
                "type": "integer",
                "description": "Token budget for the bundle",
                "default": 10000
            },
            "filters": {
                "type": "object",
                "properties": {
                    "frameType": { "type": "string" },
                    "since": { "type": "string", "format": "date-time" }
                },
                "description": "Optional narrowing of lexical hits"
            },
            "deadline_ms": { "type": "integer" }
        }
    })
}

#[derive(Debug, Default, Deserialize)]
struct GetContextArgs {
    query: Option<String>,
    budget_tokens: Option<usize>,
    filters: Option<ContextFilters>,
    deadline_ms: Option<u64>,
}

pub fn get_context(engine: &Arc<MemoryEngine>, args: Option<Value>) -> ToolResult {
    let args: GetContextArgs = optional_args(args)?;
    let deadline = deadline_from(args.deadline_ms);
    MemoryEngine::check_deadline(deadline)?;

    let mut request = ContextRequest::new(
        args.query,
        args.budget_tokens.unwrap_or(engine.config().budget_tokens),
    );
    request.filters = args.filters.unwrap_or_default();
    request.deadline = deadline;

    let bundle = engine.get_context(&request)?;
    let metadata = Some(bundle.metadata.clone());
    Ok(ToolOutput {
        value: serde_json::to_value(bundle).unwrap_or(Value::Null),
        metadata,
    })
}
