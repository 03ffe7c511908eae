//! Memory Engine Façade
//!
//! Wires identity, store, frame manager, tier manager, and retriever into
//! one `Send + Sync` object. The tool surface holds an `Arc<MemoryEngine>`
//! and every method takes `&self`; interior locking lives in the parts.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::broadcast;
use tracing::info;

use crate::config::{EngineConfig, Paths};
use crate::daemon::hooks::HookEvent;
use crate::error::{EngineError, Result};
use crate::frame::{
    Anchor, AnchorType, Frame, FrameDigest, FrameLocks, FrameManager, FrameState, FrameType,
    HotStack,
};
use crate::identity::{self, ProjectRegistry, ResolvedProject, Session};
use crate::retrieval::{ContextBundle, ContextRequest, Retriever, SemanticIndex};
use crate::storage::{Store, StoreStats};
use crate::task::{NewTask, Task, TaskMetrics, TaskStatus};
use crate::tier::TierManager;

/// Environment variable that swaps the on-disk store for an in-memory one
pub const ENV_TEST_SKIP_DB: &str = "STACKMEMORY_TEST_SKIP_DB";

/// Hook bus capacity; slow subscribers lag rather than block writers
const HOOK_BUS_CAPACITY: usize = 1024;

/// A frame as returned by `search_frames`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FrameHeader {
    pub frame_id: String,
    pub name: String,
    pub frame_type: FrameType,
    pub state: FrameState,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub closed_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub importance_score: Option<i64>,
}

impl From<Frame> for FrameHeader {
    fn from(frame: Frame) -> Self {
        Self {
            frame_id: frame.frame_id,
            name: frame.name,
            frame_type: frame.frame_type,
            state: frame.state,
            created_at: frame.created_at,
            closed_at: frame.closed_at,
            importance_score: frame.importance_score,
        }
    }
}

/// The engine
pub struct MemoryEngine {
    project: ResolvedProject,
    paths: Paths,
    config: Arc<EngineConfig>,
    store: Arc<Store>,
    frames: FrameManager,
    tiers: Arc<TierManager>,
    retriever: Retriever,
    hook_bus: broadcast::Sender<HookEvent>,
}

impl MemoryEngine {
    /// Initialize in (or above) the given directory, defaulting to the
    /// current one. `STACKMEMORY_PROJECT` overrides the root.
    pub fn init(root: Option<PathBuf>) -> Result<Self> {
        let root = match root {
            Some(root) => root,
            None => match std::env::var(identity::ENV_PROJECT) {
                Ok(dir) if !dir.is_empty() => PathBuf::from(dir),
                _ => std::env::current_dir()?,
            },
        };
        std::fs::create_dir_all(&root)?;
        let project = identity::resolve_project(&root)?;
        let paths = Paths::new(project.root_path.clone())?;
        Self::build(project, paths, None)
    }

    /// Initialize with explicit project and home directories (tests,
    /// embedders that relocate state).
    pub fn init_at(root: PathBuf, home: PathBuf) -> Result<Self> {
        Self::init_at_with(root, home, None)
    }

    /// `init_at` plus an external semantic index for retrieval.
    pub fn init_at_with(
        root: PathBuf,
        home: PathBuf,
        semantic: Option<Arc<dyn SemanticIndex>>,
    ) -> Result<Self> {
        // The root must exist before identity resolution so the id derives
        // from the canonical path every time.
        std::fs::create_dir_all(&root)?;
        let project = identity::resolve_project(&root)?;
        let paths = Paths::with_home(project.root_path.clone(), home);
        Self::build(project, paths, semantic)
    }

    fn build(
        project: ResolvedProject,
        paths: Paths,
        semantic: Option<Arc<dyn SemanticIndex>>,
    ) -> Result<Self> {
        paths.ensure_dirs()?;
        let config = Arc::new(EngineConfig::load(&paths.config_json())?);

        let skip_db = std::env::var(ENV_TEST_SKIP_DB)
            .map(|v| !v.is_empty() && v != "0")
            .unwrap_or(false);
        let store = Arc::new(if skip_db {
            Store::open_in_memory()?
        } else {
            Store::open(&paths.context_db())?
        });

        let now = Utc::now();
        store.upsert_project(&project.project_id, &project.root_path, now)?;
        if !skip_db {
            // Best-effort: the registry is a convenience index, not truth.
            match ProjectRegistry::open(&paths.projects_db()) {
                Ok(registry) => {
                    let _ = registry.record(&project.project_id, &project.root_path, now);
                }
                Err(e) => tracing::warn!(error = %e, "project registry unavailable"),
            }
        }

        let session = identity::resolve_session(
            &store,
            &project.project_id,
            project.branch.as_deref(),
            None,
            config.session_stale_hours,
        )?;
        info!(
            project_id = %project.project_id,
            session_id = %session.session_id,
            "engine initialized"
        );

        // Session continuity marker: lets out-of-process tooling find the
        // live session without opening the project store.
        let continuity = paths.sessions_dir().join(format!("{}.json", session.session_id));
        let marker = serde_json::json!({
            "sessionId": session.session_id,
            "projectId": project.project_id,
            "branch": session.branch,
            "lastActiveAt": session.last_active_at,
        });
        if let Err(e) = std::fs::write(&continuity, marker.to_string()) {
            tracing::warn!(error = %e, "could not write session continuity file");
        }

        let (hook_bus, _) = broadcast::channel(HOOK_BUS_CAPACITY);
        let locks = FrameLocks::new();
        let frames = FrameManager::attach(
            Arc::clone(&store),
            Arc::clone(&config),
            session,
            Arc::clone(&locks),
            Some(hook_bus.clone()),
        )?;
        let tiers = Arc::new(TierManager::new(
            Arc::clone(&store),
            Arc::clone(&config),
            locks,
            paths.clone(),
        ));
        let retriever = Retriever::new(
            Arc::clone(&store),
            Arc::clone(&config),
            Arc::clone(&tiers),
            semantic,
        );

        Ok(Self {
            project,
            paths,
            config,
            store,
            frames,
            tiers,
            retriever,
            hook_bus,
        })
    }

    // ========================================================================
    // ACCESSORS
    // ========================================================================

    pub fn project_id(&self) -> &str {
        &self.project.project_id
    }

    pub fn session(&self) -> &Session {
        self.frames.session()
    }

    pub fn session_id(&self) -> &str {
        &self.frames.session().session_id
    }

    pub fn paths(&self) -> &Paths {
        &self.paths
    }

    pub fn config(&self) -> &Arc<EngineConfig> {
        &self.config
    }

    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    pub fn tiers(&self) -> &Arc<TierManager> {
        &self.tiers
    }

    pub fn hook_bus(&self) -> broadcast::Sender<HookEvent> {
        self.hook_bus.clone()
    }

    /// Foreground deadline check: already-expired deadlines fail fast with
    /// no work started, so no partial state can leak.
    pub fn check_deadline(deadline: Option<Instant>) -> Result<()> {
        match deadline {
            Some(deadline) if Instant::now() >= deadline => {
                Err(EngineError::Timeout("deadline expired before start".to_string()))
            }
            _ => Ok(()),
        }
    }

    // ========================================================================
    // FRAME LIFECYCLE
    // ========================================================================

    pub fn start_frame(
        &self,
        name: &str,
        frame_type: Option<&str>,
        constraints: Option<Vec<String>>,
        definitions: Option<Value>,
    ) -> Result<Frame> {
        let frame_type = match frame_type {
            None => FrameType::Task,
            Some(raw) => FrameType::parse_name(raw)
                .ok_or_else(|| EngineError::InvalidArgument(format!("unknown frame type '{}'", raw)))?,
        };
        self.frames.start_frame(name, frame_type, constraints, definitions)
    }

    pub fn append_event(&self, frame_id: &str, event_type: &str, payload: Value) -> Result<String> {
        let event_type = crate::frame::EventType::parse_name(event_type)
            .ok_or_else(|| EngineError::InvalidArgument(format!("unknown event type '{}'", event_type)))?;
        self.frames.append_event(frame_id, event_type, payload)
    }

    pub fn add_anchor(
        &self,
        frame_id: Option<&str>,
        anchor_type: &str,
        text: &str,
        priority: Option<u8>,
        metadata: Option<Value>,
    ) -> Result<Anchor> {
        let anchor_type = AnchorType::parse_name(anchor_type)
            .ok_or_else(|| EngineError::InvalidArgument(format!("unknown anchor type '{}'", anchor_type)))?;
        self.frames.add_anchor(frame_id, anchor_type, text, priority, metadata)
    }

    /// Sugar for `add_anchor(DECISION, …)` on the current frame.
    pub fn add_decision(&self, text: &str) -> Result<Anchor> {
        self.frames.add_anchor(None, AnchorType::Decision, text, None, None)
    }

    pub fn close_frame(&self, frame_id: Option<&str>, summary: Option<&str>) -> Result<FrameDigest> {
        self.frames.close_frame(frame_id, summary)
    }

    pub fn get_hot_stack(&self, max_events_per_frame: usize) -> Result<HotStack> {
        self.frames.get_hot_stack(max_events_per_frame)
    }

    // ========================================================================
    // RETRIEVAL
    // ========================================================================

    pub fn get_context(&self, request: &ContextRequest) -> Result<ContextBundle> {
        self.retriever.get_context(&self.frames, request)
    }

    /// Thin wrapper on store full-text: distinct matching frames, best hit
    /// first.
    pub fn search_frames(&self, query: &str, limit: usize) -> Result<Vec<FrameHeader>> {
        let hits = self
            .store
            .search_fulltext(query, &self.project.project_id, limit.max(1) * 4)?;
        let mut seen = std::collections::HashSet::new();
        let mut headers = Vec::new();
        for hit in hits {
            if !seen.insert(hit.frame_id.clone()) {
                continue;
            }
            if let Some(frame) = self.store.get_frame(&hit.frame_id)? {
                headers.push(FrameHeader::from(frame));
            }
            if headers.len() >= limit {
                break;
            }
        }
        Ok(headers)
    }

    // ========================================================================
    // TASKS
    // ========================================================================

    pub fn create_task(&self, input: NewTask) -> Result<Task> {
        self.store.create_task(input)
    }

    pub fn update_task_status(
        &self,
        task_id: &str,
        status: TaskStatus,
        progress: Option<u8>,
    ) -> Result<Task> {
        self.store.update_task_status(task_id, status, progress)
    }

    pub fn get_active_tasks(&self, limit: usize) -> Result<Vec<Task>> {
        self.store.get_active_tasks(limit)
    }

    pub fn get_task_metrics(&self) -> Result<TaskMetrics> {
        self.store.get_task_metrics()
    }

    pub fn add_task_dependency(&self, task_id: &str, depends_on: &str) -> Result<()> {
        self.store.add_task_dependency(task_id, depends_on)
    }

    // ========================================================================
    // MAINTENANCE
    // ========================================================================

    pub fn stats(&self) -> Result<StoreStats> {
        self.store.stats()
    }

    pub fn backup(&self, dest: &std::path::Path) -> Result<()> {
        self.store.backup(dest)
    }
}

// ============================================================================
// TESTS
// ============================================================================
