//! Frame Digest
//!
//! A bounded structured summary produced when a frame closes. Deterministic:
//! the same event/anchor history always yields the same digest, which is what
//! makes the idempotent re-close guarantee byte-exact.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{Anchor, AnchorType, Event, EventType, Frame};

/// Decisions listed in a digest are capped here
const MAX_DIGEST_DECISIONS: usize = 10;

// ============================================================================
// DIGEST TYPES
// ============================================================================

/// Outcome inferred from the frame's history
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DigestStatus {
    Success,
    Failure,
    Partial,
    Ongoing,
}

impl DigestStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DigestStatus::Success => "success",
            DigestStatus::Failure => "failure",
            DigestStatus::Partial => "partial",
            DigestStatus::Ongoing => "ongoing",
        }
    }
}

/// Suggested follow-up, derived from status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum NextStep {
    CommitAndTest,
    FixErrors,
    ReviewAndContinue,
    CheckStatus,
}

impl NextStep {
    fn for_status(status: DigestStatus) -> Self {
        match status {
            DigestStatus::Success => NextStep::CommitAndTest,
            DigestStatus::Failure => NextStep::FixErrors,
            DigestStatus::Partial => NextStep::ReviewAndContinue,
            DigestStatus::Ongoing => NextStep::CheckStatus,
        }
    }
}

/// File operation observed in a tool_call event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileOperation {
    Create,
    Modify,
    Delete,
}

/// A file the frame touched
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileChange {
    pub path: String,
    pub operation: FileOperation,
}

/// Test outcomes summarized as pass/fail counts
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestSummary {
    pub passed: u64,
    pub failed: u64,
}

impl TestSummary {
    pub fn any(&self) -> bool {
        self.passed > 0 || self.failed > 0
    }
}

/// The structured summary of a closed frame
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FrameDigest {
    pub status: DigestStatus,
    pub files_modified: Vec<FileChange>,
    pub tests_run: TestSummary,
    pub decisions: Vec<String>,
    pub risks: Vec<String>,
    pub tool_call_count: u64,
    pub unresolved_errors: u64,
    pub next_step_hint: NextStep,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
}

// ============================================================================
// CONSTRUCTION
// ============================================================================

/// Event ids resolved by a later `note` payload of the form
/// `{"resolves": "<event_id>"}`.
pub(crate) fn resolved_event_ids(events: &[Event]) -> HashSet<String> {
    events
        .iter()
        .filter(|e| e.event_type == EventType::Note)
        .filter_map(|e| e.payload.get("resolves"))
        .filter_map(|v| v.as_str())
        .map(|s| s.to_string())
        .collect()
}

/// Count of error events without a later resolution note.
pub(crate) fn unresolved_error_count(events: &[Event]) -> u64 {
    let resolved = resolved_event_ids(events);
    events
        .iter()
        .filter(|e| e.event_type == EventType::Error && !resolved.contains(&e.event_id))
        .count() as u64
}

fn operation_for_tool(tool: &str) -> FileOperation {
    let lower = tool.to_ascii_lowercase();
    if lower.contains("delete") || lower.contains("remove") || lower == "rm" {
        FileOperation::Delete
    } else if lower.contains("edit") || lower.contains("update") || lower.contains("patch") {
        FileOperation::Modify
    } else {
        FileOperation::Create
    }
}

fn extract_file_changes(events: &[Event]) -> Vec<FileChange> {
    let mut changes: Vec<FileChange> = Vec::new();
    for event in events {
        if event.event_type != EventType::ToolCall {
            continue;
        }
        let Some(path) = event
            .payload
            .get("path")
            .or_else(|| event.payload.get("file_path"))
            .and_then(Value::as_str)
        else {
            continue;
        };
        let operation = event
            .payload
            .get("operation")
            .and_then(Value::as_str)
            .and_then(|s| match s {
                "create" => Some(FileOperation::Create),
                "modify" => Some(FileOperation::Modify),
                "delete" => Some(FileOperation::Delete),
                _ => None,
            })
            .unwrap_or_else(|| {
                event
                    .payload
                    .get("tool")
                    .and_then(Value::as_str)
                    .map(operation_for_tool)
                    .unwrap_or(FileOperation::Modify)
            });

        match changes.iter_mut().find(|c| c.path == path) {
            // A later delete wins; otherwise the first observed operation holds.
            Some(existing) => {
                if operation == FileOperation::Delete {
                    existing.operation = FileOperation::Delete;
                }
            }
            None => changes.push(FileChange {
                path: path.to_string(),
                operation,
            }),
        }
    }
    changes
}

fn extract_tests(events: &[Event]) -> TestSummary {
    let mut tests = TestSummary::default();
    for event in events {
        if event.event_type != EventType::ToolResult {
            continue;
        }
        if let Some(passed) = event.payload.get("passed").and_then(Value::as_u64) {
            tests.passed += passed;
        }
        if let Some(failed) = event.payload.get("failed").and_then(Value::as_u64) {
            tests.failed += failed;
        }
    }
    tests
}

/// Build the digest for a closing frame. Pure over the frame's history.
pub fn build_digest(
    _frame: &Frame,
    events: &[Event],
    anchors: &[Anchor],
    summary: Option<&str>,
) -> FrameDigest {
    let files_modified = extract_file_changes(events);
    let tests_run = extract_tests(events);
    let unresolved_errors = unresolved_error_count(events);
    let tool_call_count = events
        .iter()
        .filter(|e| e.event_type == EventType::ToolCall)
        .count() as u64;

    let decisions: Vec<String> = anchors
        .iter()
        .filter(|a| a.anchor_type == AnchorType::Decision)
        .take(MAX_DIGEST_DECISIONS)
        .map(|a| a.text.clone())
        .collect();
    let risks: Vec<String> = anchors
        .iter()
        .filter(|a| a.anchor_type == AnchorType::Risk)
        .map(|a| a.text.clone())
        .collect();

    let status = if unresolved_errors > 0 || tests_run.failed > 0 {
        DigestStatus::Failure
    } else if !files_modified.is_empty() && tests_run.passed > 0 {
        DigestStatus::Success
    } else if !files_modified.is_empty() {
        DigestStatus::Partial
    } else {
        DigestStatus::Ongoing
    };

    FrameDigest {
        status,
        files_modified,
        tests_run,
        decisions,
        risks,
        tool_call_count,
        unresolved_errors,
        next_step_hint: NextStep::for_status(status),
        summary: summary.map(|s| s.to_string()),
    }
}

// ============================================================================
// TESTS
// ============================================================================
