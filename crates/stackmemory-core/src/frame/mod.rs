//! Frame Stack Data Model
//!
//! Frames are the scoped units of work. A session holds a stack of active
//! frames; events append to frames; anchors pin the facts worth keeping.
//! Closing a frame freezes it, scores it, digests it, and snapshots it into
//! the tier layer.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub mod digest;
pub mod manager;
pub mod score;

pub use digest::{build_digest, DigestStatus, FileChange, FileOperation, FrameDigest, NextStep, TestSummary};
pub use manager::{FrameLocks, FrameManager, HotFrame, HotStack};
pub use score::importance_score;

// ============================================================================
// FRAME TYPES
// ============================================================================

/// Kinds of frames on the stack
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum FrameType {
    /// A top-level unit of work
    #[default]
    Task,
    /// A child unit under a task
    Subtask,
    /// Scope wrapping a single tool invocation
    ToolScope,
    /// Context-gathering work
    Context,
    /// Review work
    Review,
    /// Writing / editing work
    Write,
    /// Debugging work
    Debug,
}

impl FrameType {
    pub fn as_str(&self) -> &'static str {
        match self {
            FrameType::Task => "task",
            FrameType::Subtask => "subtask",
            FrameType::ToolScope => "tool_scope",
            FrameType::Context => "context",
            FrameType::Review => "review",
            FrameType::Write => "write",
            FrameType::Debug => "debug",
        }
    }

    /// Strict parse; unknown names are a caller error.
    pub fn parse_name(s: &str) -> Option<Self> {
        match s {
            "task" => Some(FrameType::Task),
            "subtask" => Some(FrameType::Subtask),
            "tool_scope" => Some(FrameType::ToolScope),
            "context" => Some(FrameType::Context),
            "review" => Some(FrameType::Review),
            "write" => Some(FrameType::Write),
            "debug" => Some(FrameType::Debug),
            _ => None,
        }
    }
}

impl std::fmt::Display for FrameType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Frame lifecycle state. Terminal state is `Closed`; no resurrection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum FrameState {
    #[default]
    Active,
    Closed,
}

impl FrameState {
    pub fn as_str(&self) -> &'static str {
        match self {
            FrameState::Active => "active",
            FrameState::Closed => "closed",
        }
    }

    pub fn parse_name(s: &str) -> Self {
        match s {
            "closed" => FrameState::Closed,
            _ => FrameState::Active,
        }
    }
}

/// A frame row
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Frame {
    pub frame_id: String,
    pub session_id: String,
    pub project_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_frame_id: Option<String>,
    pub frame_type: FrameType,
    pub name: String,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub closed_at: Option<DateTime<Utc>>,
    pub state: FrameState,
    /// Position on the session stack at creation time (root = 0)
    pub depth: usize,
    #[serde(default)]
    pub constraints: Vec<String>,
    #[serde(default)]
    pub definitions: Value,
    #[serde(default)]
    pub inputs: Value,
    #[serde(default)]
    pub outputs: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub digest: Option<FrameDigest>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub importance_score: Option<i64>,
}

impl Frame {
    pub fn is_active(&self) -> bool {
        self.state == FrameState::Active
    }
}

// ============================================================================
// EVENTS
// ============================================================================

/// Kinds of events appended to a frame
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    ToolCall,
    ToolResult,
    #[default]
    Note,
    Error,
    DecisionLog,
    AnchorAdd,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::ToolCall => "tool_call",
            EventType::ToolResult => "tool_result",
            EventType::Note => "note",
            EventType::Error => "error",
            EventType::DecisionLog => "decision_log",
            EventType::AnchorAdd => "anchor_add",
        }
    }

    pub fn parse_name(s: &str) -> Option<Self> {
        match s {
            "tool_call" => Some(EventType::ToolCall),
            "tool_result" => Some(EventType::ToolResult),
            "note" => Some(EventType::Note),
            "error" => Some(EventType::Error),
            "decision_log" => Some(EventType::DecisionLog),
            "anchor_add" => Some(EventType::AnchorAdd),
            _ => None,
        }
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// An append-only event. `event_id`s are never rewritten; deletion happens
/// only through whole-frame pruning at the coldest tier.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    pub event_id: String,
    pub frame_id: String,
    pub event_type: EventType,
    pub payload: Value,
    pub ts: DateTime<Utc>,
}

// ============================================================================
// ANCHORS
// ============================================================================

/// Pinned fact types. Anchors carry the highest retrieval weight and never
/// flow through age-based tiering.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AnchorType {
    Fact,
    Decision,
    Constraint,
    InterfaceContract,
    Todo,
    Risk,
}

impl AnchorType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AnchorType::Fact => "FACT",
            AnchorType::Decision => "DECISION",
            AnchorType::Constraint => "CONSTRAINT",
            AnchorType::InterfaceContract => "INTERFACE_CONTRACT",
            AnchorType::Todo => "TODO",
            AnchorType::Risk => "RISK",
        }
    }

    pub fn parse_name(s: &str) -> Option<Self> {
        match s.to_ascii_uppercase().as_str() {
            "FACT" => Some(AnchorType::Fact),
            "DECISION" => Some(AnchorType::Decision),
            "CONSTRAINT" => Some(AnchorType::Constraint),
            "INTERFACE_CONTRACT" => Some(AnchorType::InterfaceContract),
            "TODO" => Some(AnchorType::Todo),
            "RISK" => Some(AnchorType::Risk),
            _ => None,
        }
    }
}

impl std::fmt::Display for AnchorType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Default anchor priority when the caller does not supply one
pub const DEFAULT_ANCHOR_PRIORITY: u8 = 5;

/// A pinned fact attached to a frame
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Anchor {
    pub anchor_id: String,
    pub frame_id: String,
    pub anchor_type: AnchorType,
    pub text: String,
    /// 1..=10, higher is pinned harder
    pub priority: u8,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
}

// ============================================================================
// FRAME SNAPSHOT (tier-layer payload)
// ============================================================================

/// The serialized form stored per frame in `storage_items`. Retention
/// policies rewrite this as the item migrates to colder tiers.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FrameSnapshot {
    pub frame: Frame,
    pub events: Vec<Event>,
    pub anchors: Vec<Anchor>,
}

impl FrameSnapshot {
    pub fn to_bytes(&self) -> crate::error::Result<Vec<u8>> {
        serde_json::to_vec(self)
            .map_err(|e| crate::error::EngineError::StoreUnavailable(format!("snapshot encode: {}", e)))
    }

    pub fn from_bytes(bytes: &[u8]) -> crate::error::Result<Self> {
        serde_json::from_slice(bytes)
            .map_err(|e| crate::error::EngineError::CorruptRecord(format!("snapshot decode: {}", e)))
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_type_roundtrip() {
        for frame_type in [
            FrameType::Task,
            FrameType::Subtask,
            FrameType::ToolScope,
            FrameType::Context,
            FrameType::Review,
            FrameType::Write,
            FrameType::Debug,
        ] {
            assert_eq!(FrameType::parse_name(frame_type.as_str()), Some(frame_type));
        }
        assert_eq!(FrameType::parse_name("epic"), None);
    }

    #[test]
    fn test_event_type_roundtrip() {
        for event_type in [
            EventType::ToolCall,
            EventType::ToolResult,
            EventType::Note,
            EventType::Error,
            EventType::DecisionLog,
            EventType::AnchorAdd,
        ] {
            assert_eq!(EventType::parse_name(event_type.as_str()), Some(event_type));
        }
    }

    #[test]
    fn test_anchor_type_parse_is_case_insensitive() {
        assert_eq!(AnchorType::parse_name("decision"), Some(AnchorType::Decision));
        assert_eq!(
            AnchorType::parse_name("interface_contract"),
            Some(AnchorType::InterfaceContract)
        );
        assert_eq!(AnchorType::parse_name("HOPE"), None);
    }

    #[test]
    fn test_snapshot_roundtrip() {
        let now = Utc::now();
        let snapshot = FrameSnapshot {
            frame: Frame {
                frame_id: "f1".into(),
                session_id: "s1".into(),
                project_id: "p1".into(),
                parent_frame_id: None,
                frame_type: FrameType::Task,
                name: "work".into(),
                created_at: now,
                closed_at: None,
                state: FrameState::Active,
                depth: 0,
                constraints: vec!["no panics".into()],
                definitions: serde_json::json!({}),
                inputs: serde_json::json!({}),
                outputs: serde_json::json!({}),
                digest: None,
                importance_score: None,
            },
            events: vec![Event {
                event_id: "e1".into(),
                frame_id: "f1".into(),
                event_type: EventType::Note,
                payload: serde_json::json!({"text": "frame opened"}),
                ts: now,
            }],
            anchors: vec![],
        };

        let bytes = snapshot.to_bytes().unwrap();
        let back = FrameSnapshot::from_bytes(&bytes).unwrap();
        assert_eq!(back.frame.frame_id, "f1");
        assert_eq!(back.events.len(), 1);
        assert_eq!(back.frame.constraints, vec!["no panics".to_string()]);
    }
}
