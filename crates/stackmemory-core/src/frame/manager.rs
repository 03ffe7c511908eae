//! Frame Manager
//!
//! Owns the per-session active stack. The stack holds frame ids only; rows
//! live in the store (stack-of-ids + store-lookup, no shared mutable
//! pointer graphs). All operations take `&self`; the stack is guarded by a
//! mutex and write visibility goes through the store's transactions.

use std::collections::HashSet;
use std::sync::{Arc, Condvar, Mutex};

use chrono::{Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::config::EngineConfig;
use crate::daemon::hooks::{HookEvent, HookKind};
use crate::error::{EngineError, Result};
use crate::identity::Session;
use crate::storage::Store;

use super::{
    build_digest, importance_score, Anchor, AnchorType, Event, EventType, Frame, FrameDigest,
    FrameSnapshot, FrameState, FrameType, DEFAULT_ANCHOR_PRIORITY,
};

/// Frame names are bounded
const MAX_FRAME_NAME_LEN: usize = 200;

// ============================================================================
// ADVISORY FRAME LOCKS
// ============================================================================

/// Per-frame advisory locks shared between the frame manager (writes) and
/// the tier manager (migrations). Migrations `try_lock` and skip; foreground
/// writes block until the frame is free.
#[derive(Debug)]
pub struct FrameLocks {
    held: Mutex<HashSet<String>>,
    freed: Condvar,
}

impl FrameLocks {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            held: Mutex::new(HashSet::new()),
            freed: Condvar::new(),
        })
    }

    /// Non-blocking acquire; `None` when another holder has the frame.
    pub fn try_lock(self: &Arc<Self>, frame_id: &str) -> Option<FrameWriteGuard> {
        let mut held = self.held.lock().ok()?;
        if held.contains(frame_id) {
            return None;
        }
        held.insert(frame_id.to_string());
        Some(FrameWriteGuard {
            locks: Arc::clone(self),
            frame_id: frame_id.to_string(),
        })
    }

    /// Blocking acquire for foreground writes.
    pub fn lock(self: &Arc<Self>, frame_id: &str) -> Result<FrameWriteGuard> {
        let mut held = self
            .held
            .lock()
            .map_err(|_| EngineError::StoreUnavailable("frame lock poisoned".to_string()))?;
        while held.contains(frame_id) {
            held = self
                .freed
                .wait(held)
                .map_err(|_| EngineError::StoreUnavailable("frame lock poisoned".to_string()))?;
        }
        held.insert(frame_id.to_string());
        Ok(FrameWriteGuard {
            locks: Arc::clone(self),
            frame_id: frame_id.to_string(),
        })
    }
}

/// RAII guard releasing the advisory lock on drop
pub struct FrameWriteGuard {
    locks: Arc<FrameLocks>,
    frame_id: String,
}

impl Drop for FrameWriteGuard {
    fn drop(&mut self) {
        if let Ok(mut held) = self.locks.held.lock() {
            held.remove(&self.frame_id);
            self.locks.freed.notify_all();
        }
    }
}

// ============================================================================
// HOT STACK
// ============================================================================

/// One frame on the active stack with a bounded preview
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HotFrame {
    pub frame: Frame,
    /// Stack position, root = 0
    pub depth: usize,
    pub recent_events: Vec<Event>,
    pub anchor_count: u64,
}

/// The currently active chain of frames for a session
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HotStack {
    pub session_id: String,
    pub frames: Vec<HotFrame>,
}

// ============================================================================
// FRAME MANAGER
// ============================================================================

/// Maintains the active frame stack for one session.
#[derive(Debug)]
pub struct FrameManager {
    store: Arc<Store>,
    config: Arc<EngineConfig>,
    session: Session,
    stack: Mutex<Vec<String>>,
    locks: Arc<FrameLocks>,
    hook_tx: Option<broadcast::Sender<HookEvent>>,
}

impl FrameManager {
    /// Attach to a session, reconstructing the stack from the store so a new
    /// process resumes exactly where the previous one stopped.
    pub fn attach(
        store: Arc<Store>,
        config: Arc<EngineConfig>,
        session: Session,
        locks: Arc<FrameLocks>,
        hook_tx: Option<broadcast::Sender<HookEvent>>,
    ) -> Result<Self> {
        if !session.is_active() {
            return Err(EngineError::SessionNotActive(session.session_id.clone()));
        }
        let stack: Vec<String> = store
            .active_frames_for_session(&session.session_id)?
            .into_iter()
            .map(|f| f.frame_id)
            .collect();
        debug!(
            session_id = %session.session_id,
            depth = stack.len(),
            "attached frame manager"
        );
        Ok(Self {
            store,
            config,
            session,
            stack: Mutex::new(stack),
            locks,
            hook_tx,
        })
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn locks(&self) -> Arc<FrameLocks> {
        Arc::clone(&self.locks)
    }

    /// Current stack depth
    pub fn depth(&self) -> usize {
        self.stack.lock().map(|s| s.len()).unwrap_or(0)
    }

    fn stack_guard(&self) -> Result<std::sync::MutexGuard<'_, Vec<String>>> {
        self.stack
            .lock()
            .map_err(|_| EngineError::StoreUnavailable("stack lock poisoned".to_string()))
    }

    fn emit(&self, kind: HookKind, payload: Value) {
        if let Some(tx) = &self.hook_tx {
            let _ = tx.send(HookEvent::new(kind, payload));
        }
    }

    fn check_blob_size(&self, label: &str, value: &Value) -> Result<()> {
        let size = value.to_string().len();
        if size > self.config.max_anchor_bytes {
            return Err(EngineError::InvalidArgument(format!(
                "{} is {} bytes, limit is {}",
                label, size, self.config.max_anchor_bytes
            )));
        }
        Ok(())
    }

    // ========================================================================
    // START
    // ========================================================================

    /// Push a frame: child of the current top, or a root when the stack is
    /// empty. Returns only after the row is durably visible.
    pub fn start_frame(
        &self,
        name: &str,
        frame_type: FrameType,
        constraints: Option<Vec<String>>,
        definitions: Option<Value>,
    ) -> Result<Frame> {
        let name = name.trim();
        if name.is_empty() || name.len() > MAX_FRAME_NAME_LEN {
            return Err(EngineError::InvalidArgument(format!(
                "frame name must be 1..={} chars",
                MAX_FRAME_NAME_LEN
            )));
        }
        let constraints = constraints.unwrap_or_default();
        self.check_blob_size("constraints", &serde_json::json!(constraints))?;
        let definitions = definitions.unwrap_or_else(|| serde_json::json!({}));
        self.check_blob_size("definitions", &definitions)?;

        let mut stack = self.stack_guard()?;
        let depth = stack.len();
        if depth >= self.config.max_frame_depth {
            return Err(EngineError::FrameStackOverflow {
                depth,
                bound: self.config.max_frame_depth,
            });
        }

        let now = Utc::now();
        let frame = Frame {
            frame_id: uuid::Uuid::new_v4().to_string(),
            session_id: self.session.session_id.clone(),
            project_id: self.session.project_id.clone(),
            parent_frame_id: stack.last().cloned(),
            frame_type,
            name: name.to_string(),
            created_at: now,
            closed_at: None,
            state: FrameState::Active,
            depth,
            constraints,
            definitions,
            inputs: serde_json::json!({}),
            outputs: serde_json::json!({}),
            digest: None,
            importance_score: None,
        };
        let open_event = Event {
            event_id: uuid::Uuid::new_v4().to_string(),
            frame_id: frame.frame_id.clone(),
            event_type: EventType::Note,
            payload: serde_json::json!({"text": "frame opened", "name": name}),
            ts: now,
        };

        let _guard = self.locks.lock(&frame.frame_id)?;
        self.store.create_frame(&frame, &open_event)?;
        stack.push(frame.frame_id.clone());

        self.store.touch_session(&self.session.session_id, now)?;
        Ok(frame)
    }

    // ========================================================================
    // APPEND
    // ========================================================================

    /// Append an event to an active frame. Errors here leave the frame and
    /// the stack intact.
    pub fn append_event(&self, frame_id: &str, event_type: EventType, payload: Value) -> Result<String> {
        let encoded_len = payload.to_string().len();
        if encoded_len > self.config.max_payload_bytes {
            return Err(EngineError::PayloadTooLarge {
                size: encoded_len,
                limit: self.config.max_payload_bytes,
            });
        }

        let event = Event {
            event_id: uuid::Uuid::new_v4().to_string(),
            frame_id: frame_id.to_string(),
            event_type,
            payload,
            ts: Utc::now(),
        };

        let _guard = self.locks.lock(frame_id)?;
        self.store.append_event(&event, &self.session.project_id)?;
        self.store.touch_session(&self.session.session_id, event.ts)?;
        Ok(event.event_id)
    }

    // ========================================================================
    // ANCHORS
    // ========================================================================

    /// Pin an anchor. With no frame id the current top of the stack is used.
    /// Anchors are visible to retrieval immediately.
    pub fn add_anchor(
        &self,
        frame_id: Option<&str>,
        anchor_type: AnchorType,
        text: &str,
        priority: Option<u8>,
        metadata: Option<Value>,
    ) -> Result<Anchor> {
        if text.trim().is_empty() {
            return Err(EngineError::InvalidArgument("anchor text is empty".to_string()));
        }
        if text.len() > self.config.max_anchor_bytes {
            return Err(EngineError::InvalidArgument(format!(
                "anchor text is {} bytes, limit is {}",
                text.len(),
                self.config.max_anchor_bytes
            )));
        }
        let priority = priority.unwrap_or(DEFAULT_ANCHOR_PRIORITY);
        if !(1..=10).contains(&priority) {
            return Err(EngineError::InvalidArgument(format!(
                "anchor priority {} outside 1..=10",
                priority
            )));
        }

        let frame_id = match frame_id {
            Some(id) => id.to_string(),
            None => self
                .stack_guard()?
                .last()
                .cloned()
                .ok_or_else(|| EngineError::InvalidArgument("no active frame".to_string()))?,
        };

        let anchor = Anchor {
            anchor_id: uuid::Uuid::new_v4().to_string(),
            frame_id: frame_id.clone(),
            anchor_type,
            text: text.to_string(),
            priority,
            created_at: Utc::now(),
            metadata,
        };

        let _guard = self.locks.lock(&frame_id)?;
        self.store.insert_anchor(&anchor, &self.session.project_id)?;

        // Anchors also land in the event log so the frame history is complete.
        let event = Event {
            event_id: uuid::Uuid::new_v4().to_string(),
            frame_id: frame_id.clone(),
            event_type: EventType::AnchorAdd,
            payload: serde_json::json!({
                "anchorId": anchor.anchor_id,
                "anchorType": anchor.anchor_type.as_str(),
                "priority": anchor.priority,
            }),
            ts: anchor.created_at,
        };
        self.store.append_event(&event, &self.session.project_id)?;
        self.store.touch_session(&self.session.session_id, anchor.created_at)?;
        Ok(anchor)
    }

    // ========================================================================
    // CLOSE
    // ========================================================================

    /// Close a frame (the stack top when unspecified). Closing a non-top
    /// frame closes all its descendants first, in LIFO order. Idempotent on
    /// an already-closed frame: the stored digest comes back unchanged.
    pub fn close_frame(&self, frame_id: Option<&str>, summary: Option<&str>) -> Result<FrameDigest> {
        let mut stack = self.stack_guard()?;

        let target = match frame_id {
            Some(id) => id.to_string(),
            None => stack
                .last()
                .cloned()
                .ok_or_else(|| EngineError::InvalidArgument("no active frame to close".to_string()))?,
        };

        match stack.iter().position(|id| *id == target) {
            Some(position) => {
                let mut digest = None;
                while stack.len() > position {
                    // Descendants first; only the requested frame gets the
                    // summary. Pop after the close commits so a failure
                    // leaves the stack intact.
                    let closing = stack
                        .last()
                        .cloned()
                        .ok_or_else(|| EngineError::NotFound(format!("frame {}", target)))?;
                    let is_target = closing == target;
                    let result = self.close_one(&closing, if is_target { summary } else { None })?;
                    stack.pop();
                    if is_target {
                        digest = Some(result);
                    }
                }
                digest.ok_or_else(|| EngineError::NotFound(format!("frame {}", target)))
            }
            None => {
                // Not on this stack: closed already (return the stored digest)
                // or an orphan row from a crashed process.
                let frame = self
                    .store
                    .get_frame(&target)?
                    .ok_or_else(|| EngineError::NotFound(format!("frame {}", target)))?;
                match frame.state {
                    FrameState::Closed => self
                        .store
                        .get_digest(&target)?
                        .ok_or_else(|| EngineError::CorruptRecord(format!("closed frame {} has no digest", target))),
                    FrameState::Active => self.close_one(&target, summary),
                }
            }
        }
    }

    fn close_one(&self, frame_id: &str, summary: Option<&str>) -> Result<FrameDigest> {
        let _guard = self.locks.lock(frame_id)?;

        let frame = self
            .store
            .get_frame(frame_id)?
            .ok_or_else(|| EngineError::NotFound(format!("frame {}", frame_id)))?;
        if frame.state == FrameState::Closed {
            return self
                .store
                .get_digest(frame_id)?
                .ok_or_else(|| EngineError::CorruptRecord(format!("closed frame {} has no digest", frame_id)));
        }

        let events = self.store.events_for_frame(frame_id)?;
        let anchors = self.store.anchors_for_frame(frame_id)?;
        let closed_at = Utc::now();

        let importance = importance_score(&frame, &events, &anchors, closed_at);
        let digest = build_digest(&frame, &events, &anchors, summary);

        let mut closed = frame.clone();
        closed.state = FrameState::Closed;
        closed.closed_at = Some(closed_at);
        closed.digest = Some(digest.clone());
        closed.importance_score = Some(importance);
        let snapshot = FrameSnapshot {
            frame: closed,
            events,
            anchors,
        };

        let queue_depth = self.store.queue_len()?;
        let enqueue = queue_depth < self.config.queue_soft_ceiling;
        if !enqueue {
            warn!(
                queue_depth,
                ceiling = self.config.queue_soft_ceiling,
                "migration queue over soft ceiling; frame stays at young tier longer"
            );
        }

        let migration_due = closed_at + Duration::hours(self.config.young_window_hours);
        self.store.close_frame_atomic(
            frame_id,
            closed_at,
            &digest,
            importance,
            &snapshot.to_bytes()?,
            migration_due,
            enqueue,
        )?;

        self.emit(
            HookKind::FrameClosed,
            serde_json::json!({
                "frameId": frame_id,
                "sessionId": self.session.session_id,
                "status": digest.status.as_str(),
                "importance": importance,
            }),
        );

        Ok(digest)
    }

    // ========================================================================
    // HOT STACK
    // ========================================================================

    /// Bounded view of the active stack with recent-event previews.
    pub fn get_hot_stack(&self, max_events_per_frame: usize) -> Result<HotStack> {
        let ids = self.stack_guard()?.clone();
        let mut frames = Vec::with_capacity(ids.len());
        for (depth, frame_id) in ids.iter().enumerate() {
            let Some(frame) = self.store.get_frame(frame_id)? else {
                continue;
            };
            let recent_events = self.store.recent_events(frame_id, max_events_per_frame)?;
            let anchor_count = self.store.anchor_count_for_frame(frame_id)?;
            frames.push(HotFrame {
                frame,
                depth,
                recent_events,
                anchor_count,
            });
        }
        Ok(HotStack {
            session_id: self.session.session_id.clone(),
            frames,
        })
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::digest::DigestStatus;
    use tempfile::TempDir;

    fn manager() -> (FrameManager, Arc<Store>, TempDir) {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(Store::open(&dir.path().join("context.db")).unwrap());
        let session = Session::new("proj-1".to_string(), Some("main".to_string()), Utc::now());
        store.insert_session(&session).unwrap();
        let manager = FrameManager::attach(
            Arc::clone(&store),
            Arc::new(EngineConfig::default()),
            session,
            FrameLocks::new(),
            None,
        )
        .unwrap();
        (manager, store, dir)
    }

    #[test]
    fn test_start_frame_writes_open_event() {
        let (manager, store, _dir) = manager();
        let frame = manager.start_frame("Implement auth", FrameType::Task, None, None).unwrap();
        assert_eq!(frame.depth, 0);
        assert!(frame.parent_frame_id.is_none());

        let events = store.events_for_frame(&frame.frame_id).unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].payload["text"], "frame opened");
    }

    #[test]
    fn test_children_stack_under_parent() {
        let (manager, _store, _dir) = manager();
        let root = manager.start_frame("root", FrameType::Task, None, None).unwrap();
        let child = manager.start_frame("child", FrameType::Subtask, None, None).unwrap();
        assert_eq!(child.parent_frame_id.as_deref(), Some(root.frame_id.as_str()));
        assert_eq!(child.depth, 1);
        assert_eq!(manager.depth(), 2);
    }

    #[test]
    fn test_frame_name_validation() {
        let (manager, _store, _dir) = manager();
        assert!(manager.start_frame("", FrameType::Task, None, None).is_err());
        assert!(manager.start_frame("  ", FrameType::Task, None, None).is_err());
        let long = "x".repeat(201);
        assert!(manager.start_frame(&long, FrameType::Task, None, None).is_err());
        let at_limit = "x".repeat(200);
        assert!(manager.start_frame(&at_limit, FrameType::Task, None, None).is_ok());
    }

    #[test]
    fn test_payload_limit_boundary() {
        let (manager, _store, _dir) = manager();
        let frame = manager.start_frame("big payloads", FrameType::Task, None, None).unwrap();

        // {"d":"<pad>"} serializes to pad + 8 bytes.
        let limit = EngineConfig::default().max_payload_bytes;
        let exact = serde_json::json!({"d": "y".repeat(limit - 8)});
        assert!(manager
            .append_event(&frame.frame_id, EventType::Note, exact)
            .is_ok());

        let over = serde_json::json!({"d": "y".repeat(limit - 7)});
        let err = manager
            .append_event(&frame.frame_id, EventType::Note, over)
            .unwrap_err();
        assert_eq!(err.error_code(), "PayloadTooLarge");
        // The failed append left the frame open and usable.
        assert!(manager
            .append_event(&frame.frame_id, EventType::Note, serde_json::json!({"ok": true}))
            .is_ok());
    }

    #[test]
    fn test_anchor_validation_and_default_priority() {
        let (manager, _store, _dir) = manager();
        manager.start_frame("anchored", FrameType::Task, None, None).unwrap();

        let anchor = manager
            .add_anchor(None, AnchorType::Decision, "Use JWT", None, None)
            .unwrap();
        assert_eq!(anchor.priority, 5);

        assert!(manager
            .add_anchor(None, AnchorType::Fact, "", None, None)
            .is_err());
        assert!(manager
            .add_anchor(None, AnchorType::Fact, "p0", Some(0), None)
            .is_err());
        assert!(manager
            .add_anchor(None, AnchorType::Fact, "p11", Some(11), None)
            .is_err());
        let big = "x".repeat(4097);
        assert!(manager
            .add_anchor(None, AnchorType::Fact, &big, None, None)
            .is_err());
    }

    #[test]
    fn test_close_top_and_idempotent_reclose() {
        let (manager, _store, _dir) = manager();
        let frame = manager.start_frame("closing", FrameType::Task, None, None).unwrap();
        manager
            .append_event(
                &frame.frame_id,
                EventType::ToolCall,
                serde_json::json!({"tool": "Write", "path": "auth.ts"}),
            )
            .unwrap();

        let digest = manager.close_frame(None, None).unwrap();
        assert_eq!(digest.status, DigestStatus::Partial);
        assert_eq!(manager.depth(), 0);

        let again = manager.close_frame(Some(&frame.frame_id), Some("ignored")).unwrap();
        assert_eq!(
            serde_json::to_vec(&again).unwrap(),
            serde_json::to_vec(&digest).unwrap()
        );
    }

    #[test]
    fn test_closing_non_top_closes_descendants_lifo() {
        let (manager, store, _dir) = manager();
        let a = manager.start_frame("a", FrameType::Task, None, None).unwrap();
        let b = manager.start_frame("b", FrameType::Subtask, None, None).unwrap();
        let c = manager.start_frame("c", FrameType::Subtask, None, None).unwrap();

        manager.close_frame(Some(&a.frame_id), None).unwrap();
        assert_eq!(manager.depth(), 0);

        // All three closed; descendants closed no later than the parent.
        let fa = store.get_frame(&a.frame_id).unwrap().unwrap();
        let fb = store.get_frame(&b.frame_id).unwrap().unwrap();
        let fc = store.get_frame(&c.frame_id).unwrap().unwrap();
        assert_eq!(fa.state, FrameState::Closed);
        assert_eq!(fb.state, FrameState::Closed);
        assert_eq!(fc.state, FrameState::Closed);
        assert!(fc.closed_at.unwrap() <= fb.closed_at.unwrap());
        assert!(fb.closed_at.unwrap() <= fa.closed_at.unwrap());
    }

    #[test]
    fn test_stack_survives_reattach() {
        let (manager, store, _dir) = manager();
        let root = manager.start_frame("persisted", FrameType::Task, None, None).unwrap();
        manager.start_frame("child", FrameType::Subtask, None, None).unwrap();
        let session = manager.session().clone();
        drop(manager);

        let resumed = FrameManager::attach(
            Arc::clone(&store),
            Arc::new(EngineConfig::default()),
            session,
            FrameLocks::new(),
            None,
        )
        .unwrap();
        assert_eq!(resumed.depth(), 2);
        let hot = resumed.get_hot_stack(10).unwrap();
        assert_eq!(hot.frames[0].frame.frame_id, root.frame_id);
        assert_eq!(hot.frames[0].depth, 0);
    }

    #[test]
    fn test_depth_bound_enforced_with_stack_intact() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(Store::open(&dir.path().join("context.db")).unwrap());
        let session = Session::new("proj-1".to_string(), None, Utc::now());
        store.insert_session(&session).unwrap();
        // The configured floor is clamped to 10,000; drive the bound directly
        // instead of opening ten thousand frames.
        let mut config = EngineConfig::default();
        config.max_frame_depth = 10_000;
        let manager = FrameManager::attach(
            Arc::clone(&store),
            Arc::new(config),
            session,
            FrameLocks::new(),
            None,
        )
        .unwrap();

        {
            let mut stack = manager.stack.lock().unwrap();
            for i in 0..10_000 {
                stack.push(format!("synthetic-{}", i));
            }
        }

        let err = manager
            .start_frame("one too many", FrameType::Task, None, None)
            .unwrap_err();
        assert_eq!(err.error_code(), "FrameStackOverflow");
        assert_eq!(manager.depth(), 10_000);
    }

    #[test]
    fn test_hot_stack_previews_are_bounded() {
        let (manager, _store, _dir) = manager();
        let frame = manager.start_frame("busy", FrameType::Task, None, None).unwrap();
        for i in 0..25 {
            manager
                .append_event(&frame.frame_id, EventType::Note, serde_json::json!({"n": i}))
                .unwrap();
        }
        let hot = manager.get_hot_stack(10).unwrap();
        assert_eq!(hot.frames.len(), 1);
        assert_eq!(hot.frames[0].recent_events.len(), 10);
        // Newest events win the preview.
        assert_eq!(hot.frames[0].recent_events.last().unwrap().payload["n"], 24);
    }

    #[test]
    fn test_attach_requires_active_session() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(Store::open(&dir.path().join("context.db")).unwrap());
        let mut session = Session::new("proj-1".to_string(), None, Utc::now());
        session.state = crate::identity::SessionState::Suspended;
        store.insert_session(&session).unwrap();

        let err = FrameManager::attach(
            store,
            Arc::new(EngineConfig::default()),
            session,
            FrameLocks::new(),
            None,
        )
        .unwrap_err();
        assert_eq!(err.error_code(), "SessionNotActive");
    }
}
