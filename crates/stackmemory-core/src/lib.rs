//! # StackMemory Core
//!
//! Durable, queryable working-memory engine for AI coding assistants.
//!
//! Assistants emit a dense stream of activity across many short sessions;
//! this crate ingests that stream and keeps the parts worth keeping:
//!
//! - **Frame stack**: hierarchical scoped units of work with an append-only
//!   event log and pinned anchors (facts, decisions, constraints, risks)
//! - **Tiered storage**: young/mature/old/archive bands with per-tier
//!   retention and compression (none → LZ4 → ZSTD) on SQLite + FTS5
//! - **Importance scoring**: anchors, errors, and activity feed retention
//!   and ranking
//! - **Hybrid retrieval**: anchor sweep + hot-stack slice + BM25 lexical
//!   re-rank, with optional semantic augmentation merged by RRF, all under a
//!   token budget
//! - **Daemon**: filesystem watcher, tier migration loop, session sweeper,
//!   and debounced lifecycle hooks
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use stackmemory_core::{ContextRequest, MemoryEngine};
//!
//! let engine = MemoryEngine::init(None)?;
//!
//! let frame = engine.start_frame("Implement auth", Some("task"), None, None)?;
//! engine.add_decision("Use JWT with SameSite=Lax")?;
//! engine.append_event(
//!     &frame.frame_id,
//!     "tool_call",
//!     serde_json::json!({"tool": "Write", "path": "auth.ts"}),
//! )?;
//! let digest = engine.close_frame(Some(&frame.frame_id), None)?;
//!
//! let bundle = engine.get_context(&ContextRequest::new(Some("auth".into()), 10_000))?;
//! ```

// ============================================================================
// MODULES
// ============================================================================

pub mod codec;
pub mod config;
pub mod daemon;
pub mod engine;
pub mod error;
pub mod frame;
pub mod identity;
pub mod retrieval;
pub mod storage;
pub mod task;
pub mod tier;

// ============================================================================
// PUBLIC API RE-EXPORTS
// ============================================================================

// Engine façade
pub use engine::{FrameHeader, MemoryEngine, ENV_TEST_SKIP_DB};

// Errors
pub use error::{EngineError, Result};

// Configuration & layout
pub use config::{EngineConfig, Paths};

// Identity
pub use identity::{
    normalize_project_id, resolve_project, resolve_session, ProjectRegistry, ResolvedProject,
    Session, SessionState, ENV_PROJECT, ENV_SESSION,
};

// Frame model
pub use frame::{
    build_digest, importance_score, Anchor, AnchorType, DigestStatus, Event, EventType,
    FileChange, FileOperation, Frame, FrameDigest, FrameLocks, FrameManager, FrameSnapshot,
    FrameState, FrameType, HotFrame, HotStack, NextStep, TestSummary, DEFAULT_ANCHOR_PRIORITY,
};

// Storage
pub use storage::{FtsHit, ProjectRow, QueueEntry, StorageItem, Store, StoreStats};

// Codec & tiers
pub use codec::Compression;
pub use tier::{apply_retention, MigrationReport, Tier, TierManager};

// Retrieval
pub use retrieval::{
    classify_query, reciprocal_rank_fusion, AnchorRef, BytesPerToken, ContextBundle,
    ContextFilters, ContextRequest, DigestHit, HotFrameSlice, QueryMode, Retriever,
    SemanticIndex, TokenEstimator,
};

// Tasks
pub use task::{ExternalLink, NewTask, Task, TaskMetrics, TaskPriority, TaskStatus};

// Daemon
pub use daemon::{Daemon, HookEvent, HookFn, HookKind, HookRegistry, WatcherConfig};

// ============================================================================
// VERSION INFO
// ============================================================================

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

// ============================================================================
// PRELUDE
// ============================================================================

/// Convenient imports for common usage
pub mod prelude {
    pub use crate::{
        Anchor, AnchorType, ContextBundle, ContextRequest, EngineConfig, EngineError, Event,
        EventType, Frame, FrameDigest, FrameType, HotStack, MemoryEngine, Result, Session, Task,
        TaskPriority, TaskStatus, Tier,
    };
}
