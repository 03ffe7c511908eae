//! MCP Tools
//!
//! One module per tool family, each exposing `schema()` functions and
//! `execute` handlers. Handlers return engine values; the server folds them
//! into the uniform response envelope.

pub mod anchors;
pub mod context;
pub mod events;
pub mod frames;
pub mod search;
pub mod status;
pub mod tasks;

use std::time::{Duration, Instant};

use serde::de::DeserializeOwned;
use serde_json::Value;
use stackmemory_core::{EngineError, Result};

/// A tool's successful output: the response body plus optional envelope
/// metadata (used by `get_context` to surface its weight profile).
#[derive(Debug)]
pub struct ToolOutput {
    pub value: Value,
    pub metadata: Option<Value>,
}

impl From<Value> for ToolOutput {
    fn from(value: Value) -> Self {
        Self {
            value,
            metadata: None,
        }
    }
}

/// Every tool resolves to an engine result
pub type ToolResult = Result<ToolOutput>;

/// Parse arguments for a tool that requires them.
pub(crate) fn required_args<T: DeserializeOwned>(args: Option<Value>) -> Result<T> {
    let args = args.ok_or_else(|| EngineError::InvalidArgument("missing arguments".to_string()))?;
    serde_json::from_value(args)
        .map_err(|e| EngineError::InvalidArgument(format!("invalid arguments: {}", e)))
}

/// Parse arguments for a tool where every field is optional.
pub(crate) fn optional_args<T: DeserializeOwned + Default>(args: Option<Value>) -> Result<T> {
    match args {
        None | Some(Value::Null) => Ok(T::default()),
        Some(args) => serde_json::from_value(args)
            .map_err(|e| EngineError::InvalidArgument(format!("invalid arguments: {}", e))),
    }
}

/// Convert a per-call `deadline_ms` into an absolute instant.
pub(crate) fn deadline_from(deadline_ms: Option<u64>) -> Option<Instant> {
    deadline_ms.map(|ms| Instant::now() + Duration::from_millis(ms))
}
