//! SQLite Store Implementation
//!
//! Uses separate reader/writer connections for interior mutability. All
//! methods take `&self` (not `&mut self`), making the store `Send + Sync` so
//! callers can share an `Arc<Store>` instead of `Arc<Mutex<Store>>`. Writes
//! are transactional at the operation level: `close_frame_atomic` commits the
//! frame closure, the tier snapshot, and the migration enqueue together or
//! not at all.

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OpenFlags, OptionalExtension, Row};
use serde_json::Value;

use crate::codec::Compression;
use crate::error::{EngineError, Result};
use crate::frame::{Anchor, AnchorType, Event, EventType, Frame, FrameDigest, FrameState, FrameType};
use crate::identity::{Session, SessionState};
use crate::tier::Tier;

use super::migrations;

// ============================================================================
// ROW TYPES
// ============================================================================

/// A known project
#[derive(Debug, Clone)]
pub struct ProjectRow {
    pub project_id: String,
    pub root_path: PathBuf,
    pub created_at: DateTime<Utc>,
}

/// Tier-layer record wrapping one frame snapshot
#[derive(Debug, Clone)]
pub struct StorageItem {
    pub item_id: String,
    pub frame_id: String,
    pub project_id: String,
    pub tier: Tier,
    pub blob: Vec<u8>,
    pub compression: Compression,
    pub size_bytes: u64,
    pub importance_score: i64,
    pub created_at: DateTime<Utc>,
    pub migrated_at: Option<DateTime<Utc>>,
}

/// A claimed migration-queue entry
#[derive(Debug, Clone)]
pub struct QueueEntry {
    pub queue_id: i64,
    pub item_id: String,
    pub frame_id: String,
    pub target_tier: Tier,
    pub band: i64,
    pub attempts: i64,
}

/// One full-text hit with its BM25 relevance (higher is better)
#[derive(Debug, Clone)]
pub struct FtsHit {
    pub doc_id: String,
    pub kind: String,
    pub frame_id: String,
    pub content: String,
    pub bm25: f64,
}

/// Store-wide counters for status reporting
#[derive(Debug, Clone, Default, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreStats {
    pub sessions: u64,
    pub active_frames: u64,
    pub closed_frames: u64,
    pub events: u64,
    pub anchors: u64,
    pub tasks: u64,
    pub queue_depth: u64,
    pub items_young: u64,
    pub items_mature: u64,
    pub items_old: u64,
    pub items_archive: u64,
    pub blob_bytes: u64,
}

// ============================================================================
// FTS HELPERS
// ============================================================================

/// Strip FTS5 operators and quote every term. Bare user input is never passed
/// to MATCH.
pub fn sanitize_fts_query(query: &str) -> String {
    query
        .split(|c: char| !c.is_alphanumeric() && c != '_')
        .filter(|t| !t.is_empty())
        .map(|t| format!("\"{}\"", t))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Collect the string leaves of a JSON payload into searchable text.
pub fn flatten_payload_text(value: &Value) -> String {
    fn walk(value: &Value, out: &mut String) {
        match value {
            Value::String(s) => {
                if !out.is_empty() {
                    out.push(' ');
                }
                out.push_str(s);
            }
            Value::Array(items) => items.iter().for_each(|v| walk(v, out)),
            Value::Object(map) => map.values().for_each(|v| walk(v, out)),
            _ => {}
        }
    }
    let mut out = String::new();
    walk(value, &mut out);
    out
}

fn fts_insert(
    conn: &Connection,
    doc_id: &str,
    kind: &str,
    project_id: &str,
    frame_id: &str,
    content: &str,
) -> rusqlite::Result<()> {
    if content.trim().is_empty() {
        return Ok(());
    }
    conn.execute(
        "INSERT INTO memory_fts (doc_id, kind, project_id, frame_id, content)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![doc_id, kind, project_id, frame_id, content],
    )?;
    Ok(())
}

// ============================================================================
// ROW MAPPERS
// ============================================================================

fn json_column<T: serde::de::DeserializeOwned>(row: &Row, idx: usize) -> rusqlite::Result<T> {
    let raw: String = row.get(idx)?;
    serde_json::from_str(&raw).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
    })
}

fn frame_from_row(row: &Row) -> rusqlite::Result<Frame> {
    let frame_type_raw: String = row.get(4)?;
    let state_raw: String = row.get(8)?;
    let digest_raw: Option<String> = row.get(14)?;
    let digest = match digest_raw {
        Some(raw) => Some(serde_json::from_str::<FrameDigest>(&raw).map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(14, rusqlite::types::Type::Text, Box::new(e))
        })?),
        None => None,
    };
    Ok(Frame {
        frame_id: row.get(0)?,
        session_id: row.get(1)?,
        project_id: row.get(2)?,
        parent_frame_id: row.get(3)?,
        frame_type: FrameType::parse_name(&frame_type_raw).unwrap_or_default(),
        name: row.get(5)?,
        created_at: row.get(6)?,
        closed_at: row.get(7)?,
        state: FrameState::parse_name(&state_raw),
        depth: row.get::<_, i64>(9)? as usize,
        constraints: json_column(row, 10)?,
        definitions: json_column(row, 11)?,
        inputs: json_column(row, 12)?,
        outputs: json_column(row, 13)?,
        digest,
        importance_score: row.get(15)?,
    })
}

const FRAME_COLUMNS: &str = "frame_id, session_id, project_id, parent_frame_id, frame_type, name, \
     created_at, closed_at, state, depth, constraints, definitions, inputs, outputs, digest, \
     importance_score";

fn event_from_row(row: &Row) -> rusqlite::Result<Event> {
    let event_type_raw: String = row.get(2)?;
    Ok(Event {
        event_id: row.get(0)?,
        frame_id: row.get(1)?,
        event_type: EventType::parse_name(&event_type_raw).unwrap_or_default(),
        payload: json_column(row, 3)?,
        ts: row.get(4)?,
    })
}

const EVENT_COLUMNS: &str = "event_id, frame_id, event_type, payload, ts";

fn anchor_from_row(row: &Row) -> rusqlite::Result<Anchor> {
    let anchor_type_raw: String = row.get(2)?;
    let metadata_raw: Option<String> = row.get(6)?;
    let metadata = match metadata_raw {
        Some(raw) => Some(serde_json::from_str(&raw).map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(6, rusqlite::types::Type::Text, Box::new(e))
        })?),
        None => None,
    };
    Ok(Anchor {
        anchor_id: row.get(0)?,
        frame_id: row.get(1)?,
        anchor_type: AnchorType::parse_name(&anchor_type_raw).unwrap_or(AnchorType::Fact),
        text: row.get(3)?,
        priority: row.get::<_, i64>(4)? as u8,
        created_at: row.get(5)?,
        metadata,
    })
}

const ANCHOR_COLUMNS: &str = "anchor_id, frame_id, anchor_type, text, priority, created_at, metadata";

fn session_from_row(row: &Row) -> rusqlite::Result<Session> {
    let state_raw: String = row.get(5)?;
    Ok(Session {
        session_id: row.get(0)?,
        project_id: row.get(1)?,
        branch: row.get(2)?,
        started_at: row.get(3)?,
        last_active_at: row.get(4)?,
        state: SessionState::parse_name(&state_raw),
        metadata: json_column(row, 6)?,
    })
}

const SESSION_COLUMNS: &str =
    "session_id, project_id, branch, started_at, last_active_at, state, metadata";

fn item_from_row(row: &Row) -> rusqlite::Result<StorageItem> {
    let tier_raw: String = row.get(3)?;
    let compression_raw: String = row.get(5)?;
    Ok(StorageItem {
        item_id: row.get(0)?,
        frame_id: row.get(1)?,
        project_id: row.get(2)?,
        tier: Tier::parse_name(&tier_raw).unwrap_or(Tier::Young),
        blob: row.get(4)?,
        compression: Compression::parse_name(&compression_raw).unwrap_or(Compression::None),
        size_bytes: row.get::<_, i64>(6)? as u64,
        importance_score: row.get(7)?,
        created_at: row.get(8)?,
        migrated_at: row.get(9)?,
    })
}

const ITEM_COLUMNS: &str = "item_id, frame_id, project_id, tier, blob, compression_type, \
     size_bytes, importance_score, created_at, migrated_at";

// ============================================================================
// STORE
// ============================================================================

/// The context store
#[derive(Debug)]
pub struct Store {
    writer: Mutex<Connection>,
    reader: Mutex<Connection>,
}

impl Store {
    /// Apply PRAGMAs to a connection
    fn configure_connection(conn: &Connection) -> Result<()> {
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;
             PRAGMA cache_size = -64000;
             PRAGMA temp_store = MEMORY;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )?;
        Ok(())
    }

    /// Open (creating if needed) the store at the given path.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let writer = Connection::open(path)?;
        Self::configure_connection(&writer)?;
        migrations::apply_migrations(&writer)?;

        let reader = Connection::open(path)?;
        Self::configure_connection(&reader)?;

        Ok(Self {
            writer: Mutex::new(writer),
            reader: Mutex::new(reader),
        })
    }

    /// Open the store if it already exists; `ProjectNotInitialized` otherwise.
    pub fn open_existing(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(EngineError::ProjectNotInitialized(format!(
                "no store at {}",
                path.display()
            )));
        }
        Self::open(path)
    }

    /// In-memory store (shared-cache URI so the reader and writer see the
    /// same database). Used under `STACKMEMORY_TEST_SKIP_DB`.
    pub fn open_in_memory() -> Result<Self> {
        let uri = format!(
            "file:stackmemory-{}?mode=memory&cache=shared",
            uuid::Uuid::new_v4()
        );
        let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_CREATE
            | OpenFlags::SQLITE_OPEN_URI;

        let writer = Connection::open_with_flags(&uri, flags)?;
        Self::configure_connection(&writer)?;
        migrations::apply_migrations(&writer)?;

        let reader = Connection::open_with_flags(&uri, flags)?;
        Self::configure_connection(&reader)?;

        Ok(Self {
            writer: Mutex::new(writer),
            reader: Mutex::new(reader),
        })
    }

    fn writer(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.writer
            .lock()
            .map_err(|_| EngineError::StoreUnavailable("writer lock poisoned".to_string()))
    }

    fn reader(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.reader
            .lock()
            .map_err(|_| EngineError::StoreUnavailable("reader lock poisoned".to_string()))
    }

    /// Run a closure against the writer connection. Crate-internal seam for
    /// sibling modules that own their own tables (tasks).
    pub(crate) fn with_task_writer<T>(
        &self,
        f: impl FnOnce(&Connection) -> Result<T>,
    ) -> Result<T> {
        let writer = self.writer()?;
        f(&writer)
    }

    pub(crate) fn with_task_reader<T>(
        &self,
        f: impl FnOnce(&Connection) -> Result<T>,
    ) -> Result<T> {
        let reader = self.reader()?;
        f(&reader)
    }

    /// Copy the database to a backup file.
    pub fn backup(&self, dest: &Path) -> Result<()> {
        let reader = self.reader()?;
        let mut dst = Connection::open(dest)?;
        let backup = rusqlite::backup::Backup::new(&reader, &mut dst)?;
        backup.run_to_completion(64, std::time::Duration::from_millis(20), None)?;
        Ok(())
    }

    // ========================================================================
    // PROJECTS
    // ========================================================================

    pub fn upsert_project(&self, project_id: &str, root_path: &Path, now: DateTime<Utc>) -> Result<()> {
        let writer = self.writer()?;
        writer.execute(
            "INSERT INTO projects (project_id, root_path, created_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(project_id) DO UPDATE SET root_path = excluded.root_path",
            params![project_id, root_path.to_string_lossy(), now],
        )?;
        Ok(())
    }

    pub fn get_project(&self, project_id: &str) -> Result<Option<ProjectRow>> {
        let reader = self.reader()?;
        let row = reader
            .query_row(
                "SELECT project_id, root_path, created_at FROM projects WHERE project_id = ?1",
                params![project_id],
                |row| {
                    Ok(ProjectRow {
                        project_id: row.get(0)?,
                        root_path: PathBuf::from(row.get::<_, String>(1)?),
                        created_at: row.get(2)?,
                    })
                },
            )
            .optional()?;
        Ok(row)
    }

    // ========================================================================
    // SESSIONS
    // ========================================================================

    pub fn insert_session(&self, session: &Session) -> Result<()> {
        let writer = self.writer()?;
        let metadata = serde_json::to_string(&session.metadata).unwrap_or_else(|_| "{}".to_string());
        writer.execute(
            "INSERT INTO sessions (session_id, project_id, branch, started_at, last_active_at, state, metadata)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                session.session_id,
                session.project_id,
                session.branch,
                session.started_at,
                session.last_active_at,
                session.state.as_str(),
                metadata,
            ],
        )?;
        Ok(())
    }

    pub fn get_session(&self, session_id: &str) -> Result<Option<Session>> {
        let reader = self.reader()?;
        let row = reader
            .query_row(
                &format!("SELECT {} FROM sessions WHERE session_id = ?1", SESSION_COLUMNS),
                params![session_id],
                session_from_row,
            )
            .optional()?;
        Ok(row)
    }

    pub fn touch_session(&self, session_id: &str, now: DateTime<Utc>) -> Result<()> {
        let writer = self.writer()?;
        writer.execute(
            "UPDATE sessions SET last_active_at = ?2 WHERE session_id = ?1",
            params![session_id, now],
        )?;
        Ok(())
    }

    pub fn set_session_state(&self, session_id: &str, state: SessionState, now: DateTime<Utc>) -> Result<()> {
        let writer = self.writer()?;
        writer.execute(
            "UPDATE sessions SET state = ?2, last_active_at = ?3 WHERE session_id = ?1",
            params![session_id, state.as_str(), now],
        )?;
        Ok(())
    }

    /// Most recently active session in `active` state. With a branch, only
    /// exact branch matches count; without, any branch qualifies.
    pub fn latest_active_session(&self, project_id: &str, branch: Option<&str>) -> Result<Option<Session>> {
        let reader = self.reader()?;
        let row = match branch {
            Some(branch) => reader
                .query_row(
                    &format!(
                        "SELECT {} FROM sessions
                         WHERE project_id = ?1 AND state = 'active' AND branch = ?2
                         ORDER BY last_active_at DESC LIMIT 1",
                        SESSION_COLUMNS
                    ),
                    params![project_id, branch],
                    session_from_row,
                )
                .optional()?,
            None => reader
                .query_row(
                    &format!(
                        "SELECT {} FROM sessions
                         WHERE project_id = ?1 AND state = 'active'
                         ORDER BY last_active_at DESC LIMIT 1",
                        SESSION_COLUMNS
                    ),
                    params![project_id],
                    session_from_row,
                )
                .optional()?,
        };
        Ok(row)
    }

    /// Suspend every active session idle since before the cutoff.
    pub fn suspend_sessions_idle_since(&self, cutoff: DateTime<Utc>, now: DateTime<Utc>) -> Result<usize> {
        let writer = self.writer()?;
        let changed = writer.execute(
            "UPDATE sessions SET state = 'suspended', last_active_at = ?2
             WHERE state = 'active' AND last_active_at < ?1",
            params![cutoff, now],
        )?;
        Ok(changed)
    }

    // ========================================================================
    // FRAMES
    // ========================================================================

    /// Insert a frame together with its synthetic "frame opened" event.
    pub fn create_frame(&self, frame: &Frame, open_event: &Event) -> Result<()> {
        let mut writer = self.writer()?;
        let tx = writer.transaction()?;

        let inserted = tx.execute(
            &format!(
                "INSERT OR IGNORE INTO frames ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)",
                FRAME_COLUMNS
            ),
            params![
                frame.frame_id,
                frame.session_id,
                frame.project_id,
                frame.parent_frame_id,
                frame.frame_type.as_str(),
                frame.name,
                frame.created_at,
                frame.closed_at,
                frame.state.as_str(),
                frame.depth as i64,
                serde_json::to_string(&frame.constraints).unwrap_or_else(|_| "[]".to_string()),
                frame.definitions.to_string(),
                frame.inputs.to_string(),
                frame.outputs.to_string(),
                Option::<String>::None,
                frame.importance_score,
            ],
        )?;
        if inserted == 0 {
            return Err(EngineError::Conflict(format!(
                "duplicate frame id {}",
                frame.frame_id
            )));
        }

        tx.execute(
            &format!("INSERT INTO events ({}) VALUES (?1, ?2, ?3, ?4, ?5)", EVENT_COLUMNS),
            params![
                open_event.event_id,
                open_event.frame_id,
                open_event.event_type.as_str(),
                open_event.payload.to_string(),
                open_event.ts,
            ],
        )?;

        fts_insert(&tx, &frame.frame_id, "frame", &frame.project_id, &frame.frame_id, &frame.name)?;

        tx.commit()?;
        Ok(())
    }

    pub fn get_frame(&self, frame_id: &str) -> Result<Option<Frame>> {
        let reader = self.reader()?;
        let row = reader
            .query_row(
                &format!("SELECT {} FROM frames WHERE frame_id = ?1", FRAME_COLUMNS),
                params![frame_id],
                frame_from_row,
            )
            .optional()?;
        Ok(row)
    }

    /// Active frames for a session, bottom of the stack first.
    pub fn active_frames_for_session(&self, session_id: &str) -> Result<Vec<Frame>> {
        let reader = self.reader()?;
        let mut stmt = reader.prepare(&format!(
            "SELECT {} FROM frames WHERE session_id = ?1 AND state = 'active' ORDER BY depth ASC",
            FRAME_COLUMNS
        ))?;
        let frames = stmt
            .query_map(params![session_id], frame_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(frames)
    }

    pub fn select_frames_by_project(
        &self,
        project_id: &str,
        state: Option<FrameState>,
        limit: usize,
    ) -> Result<Vec<Frame>> {
        let reader = self.reader()?;
        let frames = match state {
            Some(state) => {
                let mut stmt = reader.prepare(&format!(
                    "SELECT {} FROM frames WHERE project_id = ?1 AND state = ?2
                     ORDER BY created_at DESC LIMIT ?3",
                    FRAME_COLUMNS
                ))?;
                let rows = stmt
                    .query_map(params![project_id, state.as_str(), limit as i64], frame_from_row)?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                rows
            }
            None => {
                let mut stmt = reader.prepare(&format!(
                    "SELECT {} FROM frames WHERE project_id = ?1 ORDER BY created_at DESC LIMIT ?2",
                    FRAME_COLUMNS
                ))?;
                let rows = stmt
                    .query_map(params![project_id, limit as i64], frame_from_row)?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                rows
            }
        };
        Ok(frames)
    }

    // ========================================================================
    // EVENTS
    // ========================================================================

    /// Append one event. The frame must still be active.
    pub fn append_event(&self, event: &Event, project_id: &str) -> Result<()> {
        let mut writer = self.writer()?;
        let tx = writer.transaction()?;

        let state: Option<String> = tx
            .query_row(
                "SELECT state FROM frames WHERE frame_id = ?1",
                params![event.frame_id],
                |row| row.get(0),
            )
            .optional()?;
        match state.as_deref() {
            None => return Err(EngineError::NotFound(format!("frame {}", event.frame_id))),
            Some("active") => {}
            Some(_) => {
                return Err(EngineError::Conflict(format!(
                    "frame {} is closed",
                    event.frame_id
                )))
            }
        }

        tx.execute(
            &format!("INSERT INTO events ({}) VALUES (?1, ?2, ?3, ?4, ?5)", EVENT_COLUMNS),
            params![
                event.event_id,
                event.frame_id,
                event.event_type.as_str(),
                event.payload.to_string(),
                event.ts,
            ],
        )?;

        let text = flatten_payload_text(&event.payload);
        fts_insert(&tx, &event.event_id, "event", project_id, &event.frame_id, &text)?;

        tx.commit()?;
        Ok(())
    }

    /// All events for a frame in append order.
    pub fn events_for_frame(&self, frame_id: &str) -> Result<Vec<Event>> {
        let reader = self.reader()?;
        let mut stmt = reader.prepare(&format!(
            "SELECT {} FROM events WHERE frame_id = ?1 ORDER BY seq ASC",
            EVENT_COLUMNS
        ))?;
        let events = stmt
            .query_map(params![frame_id], event_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(events)
    }

    /// Most recent `limit` events for a frame, oldest of them first.
    pub fn recent_events(&self, frame_id: &str, limit: usize) -> Result<Vec<Event>> {
        let reader = self.reader()?;
        let mut stmt = reader.prepare(&format!(
            "SELECT {} FROM events WHERE frame_id = ?1 ORDER BY seq DESC LIMIT ?2",
            EVENT_COLUMNS
        ))?;
        let mut events = stmt
            .query_map(params![frame_id, limit as i64], event_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        events.reverse();
        Ok(events)
    }

    // ========================================================================
    // ANCHORS
    // ========================================================================

    pub fn insert_anchor(&self, anchor: &Anchor, project_id: &str) -> Result<()> {
        let mut writer = self.writer()?;
        let tx = writer.transaction()?;

        let state: Option<String> = tx
            .query_row(
                "SELECT state FROM frames WHERE frame_id = ?1",
                params![anchor.frame_id],
                |row| row.get(0),
            )
            .optional()?;
        match state.as_deref() {
            None => return Err(EngineError::NotFound(format!("frame {}", anchor.frame_id))),
            Some("active") => {}
            Some(_) => {
                return Err(EngineError::Conflict(format!(
                    "frame {} is closed",
                    anchor.frame_id
                )))
            }
        }

        tx.execute(
            &format!("INSERT INTO anchors ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)", ANCHOR_COLUMNS),
            params![
                anchor.anchor_id,
                anchor.frame_id,
                anchor.anchor_type.as_str(),
                anchor.text,
                anchor.priority as i64,
                anchor.created_at,
                anchor.metadata.as_ref().map(|m| m.to_string()),
            ],
        )?;

        fts_insert(&tx, &anchor.anchor_id, "anchor", project_id, &anchor.frame_id, &anchor.text)?;

        tx.commit()?;
        Ok(())
    }

    pub fn anchors_for_frame(&self, frame_id: &str) -> Result<Vec<Anchor>> {
        let reader = self.reader()?;
        let mut stmt = reader.prepare(&format!(
            "SELECT {} FROM anchors WHERE frame_id = ?1 ORDER BY priority DESC, created_at DESC",
            ANCHOR_COLUMNS
        ))?;
        let anchors = stmt
            .query_map(params![frame_id], anchor_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(anchors)
    }

    /// Anchors on the session's active stack, strongest pins first.
    pub fn anchors_for_active_stack(&self, session_id: &str) -> Result<Vec<Anchor>> {
        let reader = self.reader()?;
        let mut stmt = reader.prepare(&format!(
            "SELECT {} FROM anchors a
             WHERE a.frame_id IN (SELECT frame_id FROM frames WHERE session_id = ?1 AND state = 'active')
             ORDER BY a.priority DESC, a.created_at DESC",
            "a.anchor_id, a.frame_id, a.anchor_type, a.text, a.priority, a.created_at, a.metadata"
        ))?;
        let anchors = stmt
            .query_map(params![session_id], anchor_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(anchors)
    }

    pub fn anchor_count_for_frame(&self, frame_id: &str) -> Result<u64> {
        let reader = self.reader()?;
        let count: i64 = reader.query_row(
            "SELECT COUNT(*) FROM anchors WHERE frame_id = ?1",
            params![frame_id],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }

    // ========================================================================
    // FRAME CLOSURE (operation-level transaction)
    // ========================================================================

    /// Close a frame: flip its state, persist the digest and score, write the
    /// young-tier snapshot, and (unless back-pressured) enqueue the migration
    /// record. All in one transaction; a failure leaves nothing visible.
    #[allow(clippy::too_many_arguments)]
    pub fn close_frame_atomic(
        &self,
        frame_id: &str,
        closed_at: DateTime<Utc>,
        digest: &FrameDigest,
        importance: i64,
        snapshot_blob: &[u8],
        migration_due_at: DateTime<Utc>,
        enqueue: bool,
    ) -> Result<()> {
        let digest_json = serde_json::to_string(digest)
            .map_err(|e| EngineError::StoreUnavailable(format!("digest encode: {}", e)))?;

        let mut writer = self.writer()?;
        let tx = writer.transaction()?;

        let project_id: String = tx
            .query_row(
                "SELECT project_id FROM frames WHERE frame_id = ?1 AND state = 'active'",
                params![frame_id],
                |row| row.get(0),
            )
            .optional()?
            .ok_or_else(|| EngineError::Conflict(format!("frame {} already closed", frame_id)))?;

        tx.execute(
            "UPDATE frames SET state = 'closed', closed_at = ?2, digest = ?3, importance_score = ?4
             WHERE frame_id = ?1",
            params![frame_id, closed_at, digest_json, importance],
        )?;

        let item_id = uuid::Uuid::new_v4().to_string();
        tx.execute(
            &format!(
                "INSERT INTO storage_items ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                ITEM_COLUMNS
            ),
            params![
                item_id,
                frame_id,
                project_id,
                Tier::Young.as_str(),
                snapshot_blob,
                Compression::None.as_str(),
                snapshot_blob.len() as i64,
                importance,
                closed_at,
                Option::<DateTime<Utc>>::None,
            ],
        )?;

        if enqueue {
            tx.execute(
                "INSERT OR IGNORE INTO migration_queue
                     (item_id, frame_id, target_tier, band, attempts, next_attempt_at, enqueued_at)
                 VALUES (?1, ?2, ?3, 0, 0, ?4, ?5)",
                params![item_id, frame_id, Tier::Mature.as_str(), migration_due_at, closed_at],
            )?;
        }

        tx.commit()?;
        Ok(())
    }

    /// Digest of an already-closed frame, if any.
    pub fn get_digest(&self, frame_id: &str) -> Result<Option<FrameDigest>> {
        let reader = self.reader()?;
        let raw: Option<Option<String>> = reader
            .query_row(
                "SELECT digest FROM frames WHERE frame_id = ?1",
                params![frame_id],
                |row| row.get(0),
            )
            .optional()?;
        match raw.flatten() {
            Some(json) => {
                let digest = serde_json::from_str(&json)
                    .map_err(|e| EngineError::CorruptRecord(format!("stored digest: {}", e)))?;
                Ok(Some(digest))
            }
            None => Ok(None),
        }
    }

    // ========================================================================
    // STORAGE ITEMS & MIGRATION QUEUE
    // ========================================================================

    pub fn get_storage_item(&self, item_id: &str) -> Result<Option<StorageItem>> {
        let reader = self.reader()?;
        let row = reader
            .query_row(
                &format!("SELECT {} FROM storage_items WHERE item_id = ?1", ITEM_COLUMNS),
                params![item_id],
                item_from_row,
            )
            .optional()?;
        Ok(row)
    }

    pub fn get_storage_item_by_frame(&self, frame_id: &str) -> Result<Option<StorageItem>> {
        let reader = self.reader()?;
        let row = reader
            .query_row(
                &format!("SELECT {} FROM storage_items WHERE frame_id = ?1", ITEM_COLUMNS),
                params![frame_id],
                item_from_row,
            )
            .optional()?;
        Ok(row)
    }

    pub fn queue_len(&self) -> Result<usize> {
        let reader = self.reader()?;
        let count: i64 = reader.query_row("SELECT COUNT(*) FROM migration_queue", [], |row| row.get(0))?;
        Ok(count as usize)
    }

    /// Enqueue a migration, idempotent by `(item_id, target_tier)`.
    pub fn enqueue_migration(
        &self,
        item_id: &str,
        frame_id: &str,
        target_tier: Tier,
        band: i64,
        due_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let writer = self.writer()?;
        writer.execute(
            "INSERT OR IGNORE INTO migration_queue
                 (item_id, frame_id, target_tier, band, attempts, next_attempt_at, enqueued_at)
             VALUES (?1, ?2, ?3, ?4, 0, ?5, ?6)",
            params![item_id, frame_id, target_tier.as_str(), band, due_at, now],
        )?;
        Ok(())
    }

    /// Enqueue age-due migrations for every item older than its tier window.
    /// Also repairs entries dropped earlier under queue backpressure.
    pub fn enqueue_due_age_migrations(
        &self,
        now: DateTime<Utc>,
        young_cutoff: DateTime<Utc>,
        mature_cutoff: DateTime<Utc>,
        old_cutoff: DateTime<Utc>,
    ) -> Result<usize> {
        let writer = self.writer()?;
        let mut enqueued = 0;
        for (tier, target, cutoff) in [
            (Tier::Young, Tier::Mature, young_cutoff),
            (Tier::Mature, Tier::Old, mature_cutoff),
            (Tier::Old, Tier::Archive, old_cutoff),
        ] {
            enqueued += writer.execute(
                "INSERT OR IGNORE INTO migration_queue
                     (item_id, frame_id, target_tier, band, attempts, next_attempt_at, enqueued_at)
                 SELECT item_id, frame_id, ?1, 0, 0, ?2, ?2
                 FROM storage_items
                 WHERE tier = ?3 AND COALESCE(migrated_at, created_at) < ?4",
                params![target.as_str(), now, tier.as_str(), cutoff],
            )?;
        }
        Ok(enqueued)
    }

    /// Enqueue demotions for items scoring below their tier's retain
    /// threshold, without waiting out the age window.
    pub fn enqueue_low_importance_migrations(
        &self,
        now: DateTime<Utc>,
        thresholds: &[(Tier, Tier, i64)],
    ) -> Result<usize> {
        let writer = self.writer()?;
        let mut enqueued = 0;
        for (tier, target, threshold) in thresholds {
            enqueued += writer.execute(
                "INSERT OR IGNORE INTO migration_queue
                     (item_id, frame_id, target_tier, band, attempts, next_attempt_at, enqueued_at)
                 SELECT item_id, frame_id, ?1, 0, 0, ?2, ?2
                 FROM storage_items
                 WHERE tier = ?3 AND importance_score < ?4",
                params![target.as_str(), now, tier.as_str(), threshold],
            )?;
        }
        Ok(enqueued)
    }

    /// Items eligible for size-pressure demotion, least important first.
    pub fn demotion_candidates(&self, limit: usize) -> Result<Vec<StorageItem>> {
        let reader = self.reader()?;
        let mut stmt = reader.prepare(&format!(
            "SELECT {} FROM storage_items WHERE tier != 'archive'
             ORDER BY importance_score ASC, created_at ASC LIMIT ?1",
            ITEM_COLUMNS
        ))?;
        let items = stmt
            .query_map(params![limit as i64], item_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(items)
    }

    pub fn total_blob_size(&self) -> Result<u64> {
        let reader = self.reader()?;
        let total: i64 = reader.query_row(
            "SELECT COALESCE(SUM(size_bytes), 0) FROM storage_items",
            [],
            |row| row.get(0),
        )?;
        Ok(total as u64)
    }

    /// Claim a batch of due queue entries under a lease. FIFO within each
    /// priority band; age-triggered entries sort before size-triggered.
    pub fn claim_queue_batch(
        &self,
        now: DateTime<Utc>,
        lease_until: DateTime<Utc>,
        worker: &str,
        batch: usize,
    ) -> Result<Vec<QueueEntry>> {
        let mut writer = self.writer()?;
        let tx = writer.transaction()?;

        let entries = {
            let mut stmt = tx.prepare(
                "SELECT queue_id, item_id, frame_id, target_tier, band, attempts
                 FROM migration_queue
                 WHERE (lease_until IS NULL OR lease_until <= ?1)
                   AND (next_attempt_at IS NULL OR next_attempt_at <= ?1)
                 ORDER BY band ASC, queue_id ASC
                 LIMIT ?2",
            )?;
            let rows = stmt
                .query_map(params![now, batch as i64], |row| {
                    let tier_raw: String = row.get(3)?;
                    Ok(QueueEntry {
                        queue_id: row.get(0)?,
                        item_id: row.get(1)?,
                        frame_id: row.get(2)?,
                        target_tier: Tier::parse_name(&tier_raw).unwrap_or(Tier::Mature),
                        band: row.get(4)?,
                        attempts: row.get(5)?,
                    })
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            rows
        };

        for entry in &entries {
            tx.execute(
                "UPDATE migration_queue SET lease_until = ?2, leased_by = ?3 WHERE queue_id = ?1",
                params![entry.queue_id, lease_until, worker],
            )?;
        }

        tx.commit()?;
        Ok(entries)
    }

    /// Commit a completed migration: rewrite the item row and drop the queue
    /// entry in one transaction.
    #[allow(clippy::too_many_arguments)]
    pub fn commit_migration(
        &self,
        queue_id: i64,
        item_id: &str,
        tier: Tier,
        blob: &[u8],
        compression: Compression,
        migrated_at: DateTime<Utc>,
    ) -> Result<()> {
        let mut writer = self.writer()?;
        let tx = writer.transaction()?;
        tx.execute(
            "UPDATE storage_items
             SET tier = ?2, blob = ?3, compression_type = ?4, size_bytes = ?5, migrated_at = ?6
             WHERE item_id = ?1",
            params![item_id, tier.as_str(), blob, compression.as_str(), blob.len() as i64, migrated_at],
        )?;
        tx.execute("DELETE FROM migration_queue WHERE queue_id = ?1", params![queue_id])?;
        tx.commit()?;
        Ok(())
    }

    pub fn delete_queue_entry(&self, queue_id: i64) -> Result<()> {
        let writer = self.writer()?;
        writer.execute("DELETE FROM migration_queue WHERE queue_id = ?1", params![queue_id])?;
        Ok(())
    }

    /// Record a failed attempt: bump the counter, schedule the retry, release
    /// the lease.
    pub fn backoff_queue_entry(
        &self,
        queue_id: i64,
        attempts: i64,
        next_attempt_at: DateTime<Utc>,
    ) -> Result<()> {
        let writer = self.writer()?;
        writer.execute(
            "UPDATE migration_queue
             SET attempts = ?2, next_attempt_at = ?3, lease_until = NULL, leased_by = NULL
             WHERE queue_id = ?1",
            params![queue_id, attempts, next_attempt_at],
        )?;
        Ok(())
    }

    /// Release a lease without consuming an attempt (frame had an active write).
    pub fn release_lease(&self, queue_id: i64) -> Result<()> {
        let writer = self.writer()?;
        writer.execute(
            "UPDATE migration_queue SET lease_until = NULL, leased_by = NULL WHERE queue_id = ?1",
            params![queue_id],
        )?;
        Ok(())
    }

    /// Whole-frame prune at the coldest tier: the only path that deletes
    /// events. Removes the frame, its events/anchors, FTS rows, the storage
    /// item, and any queue entries.
    pub fn prune_frame(&self, frame_id: &str) -> Result<()> {
        let mut writer = self.writer()?;
        let tx = writer.transaction()?;
        tx.execute("DELETE FROM memory_fts WHERE frame_id = ?1", params![frame_id])?;
        tx.execute("DELETE FROM events WHERE frame_id = ?1", params![frame_id])?;
        tx.execute("DELETE FROM anchors WHERE frame_id = ?1", params![frame_id])?;
        tx.execute("DELETE FROM migration_queue WHERE frame_id = ?1", params![frame_id])?;
        tx.execute("DELETE FROM storage_items WHERE frame_id = ?1", params![frame_id])?;
        tx.execute("DELETE FROM frames WHERE frame_id = ?1", params![frame_id])?;
        tx.commit()?;
        Ok(())
    }

    // ========================================================================
    // FULL-TEXT SEARCH
    // ========================================================================

    /// BM25-ranked full-text search within a project. The raw rank from
    /// SQLite is lower-is-better; it is negated here so callers see
    /// higher-is-better.
    pub fn search_fulltext(&self, query: &str, project_id: &str, limit: usize) -> Result<Vec<FtsHit>> {
        let sanitized = sanitize_fts_query(query);
        if sanitized.is_empty() {
            return Ok(Vec::new());
        }

        let reader = self.reader()?;
        let mut stmt = reader.prepare(
            "SELECT doc_id, kind, frame_id, content, bm25(memory_fts) AS rank
             FROM memory_fts
             WHERE memory_fts MATCH ?1 AND project_id = ?2
             ORDER BY rank LIMIT ?3",
        )?;
        let hits = stmt
            .query_map(params![sanitized, project_id, limit as i64], |row| {
                Ok(FtsHit {
                    doc_id: row.get(0)?,
                    kind: row.get(1)?,
                    frame_id: row.get(2)?,
                    content: row.get(3)?,
                    bm25: -row.get::<_, f64>(4)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(hits)
    }

    // ========================================================================
    // STATS
    // ========================================================================

    pub fn stats(&self) -> Result<StoreStats> {
        let reader = self.reader()?;
        let one = |sql: &str| -> Result<u64> {
            let n: i64 = reader.query_row(sql, [], |row| row.get(0))?;
            Ok(n as u64)
        };
        let tier_count = |tier: &str| -> Result<u64> {
            let n: i64 = reader.query_row(
                "SELECT COUNT(*) FROM storage_items WHERE tier = ?1",
                params![tier],
                |row| row.get(0),
            )?;
            Ok(n as u64)
        };
        Ok(StoreStats {
            sessions: one("SELECT COUNT(*) FROM sessions")?,
            active_frames: one("SELECT COUNT(*) FROM frames WHERE state = 'active'")?,
            closed_frames: one("SELECT COUNT(*) FROM frames WHERE state = 'closed'")?,
            events: one("SELECT COUNT(*) FROM events")?,
            anchors: one("SELECT COUNT(*) FROM anchors")?,
            tasks: one("SELECT COUNT(*) FROM tasks")?,
            queue_depth: one("SELECT COUNT(*) FROM migration_queue")?,
            items_young: tier_count("young")?,
            items_mature: tier_count("mature")?,
            items_old: tier_count("old")?,
            items_archive: tier_count("archive")?,
            blob_bytes: self.total_blob_size()?,
        })
    }
}

// ============================================================================
// TESTS
// ============================================================================
