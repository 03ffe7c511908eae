//! Database Migrations
//!
//! Versioned, forward-only schema definitions for the context store. The
//! engine refuses to open a database stamped with a newer version than it
//! knows about.

use crate::error::{EngineError, Result};

/// Migration definitions
pub const MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        description: "Initial schema: frames, events, anchors, sessions, tiers, FTS5",
        up: MIGRATION_V1_UP,
    },
    Migration {
        version: 2,
        description: "Task dependencies and external ticket links",
        up: MIGRATION_V2_UP,
    },
    Migration {
        version: 3,
        description: "Claim-and-lease columns on the migration queue",
        up: MIGRATION_V3_UP,
    },
];

/// A database migration
#[derive(Debug, Clone)]
pub struct Migration {
    /// Version number
    pub version: u32,
    /// Description
    pub description: &'static str,
    /// SQL to apply
    pub up: &'static str,
}

/// V1: Initial schema
const MIGRATION_V1_UP: &str = r#"
CREATE TABLE IF NOT EXISTS projects (
    project_id TEXT PRIMARY KEY,
    root_path TEXT NOT NULL,
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS sessions (
    session_id TEXT PRIMARY KEY,
    project_id TEXT NOT NULL,
    branch TEXT,
    started_at TEXT NOT NULL,
    last_active_at TEXT NOT NULL,
    state TEXT NOT NULL DEFAULT 'active',  -- 'active', 'suspended', 'closed'
    metadata TEXT NOT NULL DEFAULT '{}'
);

CREATE INDEX IF NOT EXISTS idx_sessions_project_state ON sessions(project_id, state);
CREATE INDEX IF NOT EXISTS idx_sessions_last_active ON sessions(last_active_at);

CREATE TABLE IF NOT EXISTS frames (
    frame_id TEXT PRIMARY KEY,
    session_id TEXT NOT NULL,
    project_id TEXT NOT NULL,
    parent_frame_id TEXT,
    frame_type TEXT NOT NULL DEFAULT 'task',
    name TEXT NOT NULL,
    created_at TEXT NOT NULL,
    closed_at TEXT,
    state TEXT NOT NULL DEFAULT 'active',  -- 'active', 'closed'
    depth INTEGER NOT NULL DEFAULT 0,
    constraints TEXT NOT NULL DEFAULT '[]',
    definitions TEXT NOT NULL DEFAULT '{}',
    inputs TEXT NOT NULL DEFAULT '{}',
    outputs TEXT NOT NULL DEFAULT '{}',
    digest TEXT,
    importance_score INTEGER
);

CREATE INDEX IF NOT EXISTS idx_frames_session_state ON frames(session_id, state);
CREATE INDEX IF NOT EXISTS idx_frames_project ON frames(project_id);
CREATE INDEX IF NOT EXISTS idx_frames_parent ON frames(parent_frame_id);
CREATE INDEX IF NOT EXISTS idx_frames_closed ON frames(closed_at);

-- Append-only event log. seq preserves call order per frame.
CREATE TABLE IF NOT EXISTS events (
    seq INTEGER PRIMARY KEY AUTOINCREMENT,
    event_id TEXT NOT NULL UNIQUE,
    frame_id TEXT NOT NULL,
    event_type TEXT NOT NULL,
    payload TEXT NOT NULL,
    ts TEXT NOT NULL,
    FOREIGN KEY (frame_id) REFERENCES frames(frame_id) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_events_frame ON events(frame_id);

CREATE TABLE IF NOT EXISTS anchors (
    anchor_id TEXT PRIMARY KEY,
    frame_id TEXT NOT NULL,
    anchor_type TEXT NOT NULL,  -- 'FACT', 'DECISION', 'CONSTRAINT', 'INTERFACE_CONTRACT', 'TODO', 'RISK'
    text TEXT NOT NULL,
    priority INTEGER NOT NULL DEFAULT 5,
    created_at TEXT NOT NULL,
    metadata TEXT,
    FOREIGN KEY (frame_id) REFERENCES frames(frame_id) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_anchors_frame ON anchors(frame_id);
CREATE INDEX IF NOT EXISTS idx_anchors_priority ON anchors(priority);

CREATE TABLE IF NOT EXISTS tasks (
    task_id TEXT PRIMARY KEY,
    title TEXT NOT NULL,
    description TEXT,
    status TEXT NOT NULL DEFAULT 'pending',  -- 'pending', 'in_progress', 'blocked', 'completed', 'cancelled'
    priority TEXT NOT NULL DEFAULT 'medium', -- 'low', 'medium', 'high', 'urgent'
    tags TEXT NOT NULL DEFAULT '[]',
    parent_task_id TEXT,
    progress INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    completed_at TEXT
);

CREATE INDEX IF NOT EXISTS idx_tasks_status ON tasks(status);
CREATE INDEX IF NOT EXISTS idx_tasks_parent ON tasks(parent_task_id);

-- Tier-layer record wrapping one frame snapshot.
CREATE TABLE IF NOT EXISTS storage_items (
    item_id TEXT PRIMARY KEY,
    frame_id TEXT NOT NULL UNIQUE,
    project_id TEXT NOT NULL,
    tier TEXT NOT NULL DEFAULT 'young',  -- 'young', 'mature', 'old', 'archive'
    blob BLOB NOT NULL,
    compression_type TEXT NOT NULL DEFAULT 'none',
    size_bytes INTEGER NOT NULL,
    importance_score INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL,
    migrated_at TEXT
);

CREATE INDEX IF NOT EXISTS idx_items_tier ON storage_items(tier);
CREATE INDEX IF NOT EXISTS idx_items_importance ON storage_items(importance_score);
CREATE INDEX IF NOT EXISTS idx_items_created ON storage_items(created_at);

-- FIFO per priority band: band 0 = age-triggered, band 1 = size-triggered.
CREATE TABLE IF NOT EXISTS migration_queue (
    queue_id INTEGER PRIMARY KEY AUTOINCREMENT,
    item_id TEXT NOT NULL,
    frame_id TEXT NOT NULL,
    target_tier TEXT NOT NULL,
    band INTEGER NOT NULL DEFAULT 0,
    attempts INTEGER NOT NULL DEFAULT 0,
    next_attempt_at TEXT,
    enqueued_at TEXT NOT NULL,
    UNIQUE(item_id, target_tier)
);

CREATE INDEX IF NOT EXISTS idx_queue_band ON migration_queue(band, queue_id);

-- Full-text index over frame names, event text, and anchor text.
-- Rows are written explicitly by the store; event content is a flattened
-- rendering of the JSON payload that triggers cannot express.
CREATE VIRTUAL TABLE IF NOT EXISTS memory_fts USING fts5(
    doc_id,
    kind,
    project_id,
    frame_id,
    content,
    tokenize='porter ascii'
);

CREATE TABLE IF NOT EXISTS schema_version (
    version INTEGER PRIMARY KEY,
    applied_at TEXT NOT NULL
);

INSERT OR IGNORE INTO schema_version (version, applied_at) VALUES (1, datetime('now'));
"#;

/// V2: Task dependencies and external ticket links
const MIGRATION_V2_UP: &str = r#"
ALTER TABLE tasks ADD COLUMN external_system TEXT;
ALTER TABLE tasks ADD COLUMN external_id TEXT;

CREATE TABLE IF NOT EXISTS task_links (
    task_id TEXT NOT NULL,
    depends_on TEXT NOT NULL,
    created_at TEXT NOT NULL,
    PRIMARY KEY (task_id, depends_on),
    FOREIGN KEY (task_id) REFERENCES tasks(task_id) ON DELETE CASCADE,
    FOREIGN KEY (depends_on) REFERENCES tasks(task_id) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_task_links_depends ON task_links(depends_on);

UPDATE schema_version SET version = 2, applied_at = datetime('now');
"#;

/// V3: Claim-and-lease on the migration queue so multiple workers can share
/// it without double-claiming; expired leases make items re-eligible.
const MIGRATION_V3_UP: &str = r#"
ALTER TABLE migration_queue ADD COLUMN lease_until TEXT;
ALTER TABLE migration_queue ADD COLUMN leased_by TEXT;

CREATE INDEX IF NOT EXISTS idx_queue_lease ON migration_queue(lease_until);

UPDATE schema_version SET version = 3, applied_at = datetime('now');
"#;

/// Get current schema version from database
pub fn get_current_version(conn: &rusqlite::Connection) -> rusqlite::Result<u32> {
    conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM schema_version",
        [],
        |row| row.get(0),
    )
    .or(Ok(0))
}

/// Newest schema version this build understands
pub fn latest_version() -> u32 {
    MIGRATIONS.last().map(|m| m.version).unwrap_or(0)
}

/// Apply pending migrations. Refuses a database from the future.
pub fn apply_migrations(conn: &rusqlite::Connection) -> Result<u32> {
    let current_version = get_current_version(conn)?;
    let known = latest_version();
    if current_version > known {
        return Err(EngineError::Conflict(format!(
            "database schema v{} is newer than supported v{}",
            current_version, known
        )));
    }

    let mut applied = 0;
    for migration in MIGRATIONS {
        if migration.version > current_version {
            tracing::info!(
                "Applying migration v{}: {}",
                migration.version,
                migration.description
            );
            conn.execute_batch(migration.up)?;
            applied += 1;
        }
    }

    Ok(applied)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rusqlite::Connection;

    #[test]
    fn test_migrations_apply_cleanly() {
        let conn = Connection::open_in_memory().unwrap();
        let applied = apply_migrations(&conn).unwrap();
        assert_eq!(applied as usize, MIGRATIONS.len());
        assert_eq!(get_current_version(&conn).unwrap(), latest_version());
    }

    #[test]
    fn test_migrations_are_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        apply_migrations(&conn).unwrap();
        let applied_again = apply_migrations(&conn).unwrap();
        assert_eq!(applied_again, 0);
    }

    #[test]
    fn test_versions_are_strictly_increasing() {
        for pair in MIGRATIONS.windows(2) {
            assert!(pair[0].version < pair[1].version);
        }
    }

    #[test]
    fn test_newer_schema_is_refused() {
        let conn = Connection::open_in_memory().unwrap();
        apply_migrations(&conn).unwrap();
        conn.execute(
            "UPDATE schema_version SET version = ?1",
            [latest_version() + 10],
        )
        .unwrap();
        let err = apply_migrations(&conn).unwrap_err();
        assert_eq!(err.error_code(), "Conflict");
    }
}
