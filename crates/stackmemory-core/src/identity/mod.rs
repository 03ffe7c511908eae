//! Project & Session Identity
//!
//! Stable project ids derived from the VCS origin URL (or the absolute path
//! when there is no origin), and session discovery with resume semantics.
//! The normalization function here is the only source of project ids.

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Duration, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{EngineError, Result};
use crate::storage::Store;

/// Project ids are right-truncated to this many characters
const PROJECT_ID_MAX_LEN: usize = 50;

/// Environment variable pinning an explicit session id
pub const ENV_SESSION: &str = "STACKMEMORY_SESSION";

/// Environment variable overriding the project root directory
pub const ENV_PROJECT: &str = "STACKMEMORY_PROJECT";

// ============================================================================
// PROJECT IDENTITY
// ============================================================================

/// Normalize an origin URL or absolute path into a project id.
///
/// Strip a trailing `.git`, collapse every non-alphanumeric run to a single
/// `-`, lowercase, and keep the last 50 characters. Idempotent: the same
/// input always yields the same id.
pub fn normalize_project_id(input: &str) -> String {
    let trimmed = input.strip_suffix(".git").unwrap_or(input);

    let mut out = String::with_capacity(trimmed.len());
    let mut last_dash = true; // suppress a leading dash
    for c in trimmed.chars() {
        if c.is_ascii_alphanumeric() {
            out.push(c.to_ascii_lowercase());
            last_dash = false;
        } else if !last_dash {
            out.push('-');
            last_dash = true;
        }
    }
    while out.ends_with('-') {
        out.pop();
    }

    if out.len() > PROJECT_ID_MAX_LEN {
        let cut = out.len() - PROJECT_ID_MAX_LEN;
        // Keep the tail; it carries the repo name.
        out = out[cut..].trim_start_matches('-').to_string();
    }
    out
}

/// A resolved project identity
#[derive(Debug, Clone)]
pub struct ResolvedProject {
    pub project_id: String,
    pub root_path: PathBuf,
    /// Present when the id came from a VCS origin URL
    pub origin_url: Option<String>,
    /// Current branch shorthand, when the directory is a repo
    pub branch: Option<String>,
}

/// Derive the project identity for a directory: origin URL when the
/// directory sits in a git repo with an `origin` remote, absolute path
/// otherwise.
pub fn resolve_project(cwd: &Path) -> Result<ResolvedProject> {
    let root_path = cwd
        .canonicalize()
        .unwrap_or_else(|_| cwd.to_path_buf());

    let mut origin_url = None;
    let mut branch = None;
    let mut repo_root = None;

    if let Ok(repo) = git2::Repository::discover(&root_path) {
        if let Some(workdir) = repo.workdir() {
            repo_root = Some(workdir.to_path_buf());
        }
        if let Ok(remote) = repo.find_remote("origin") {
            origin_url = remote.url().map(|u| u.to_string());
        }
        if let Ok(head) = repo.head() {
            branch = head.shorthand().map(|s| s.to_string());
        }
    }

    let root_path = repo_root.unwrap_or(root_path);
    let source = origin_url
        .clone()
        .unwrap_or_else(|| root_path.to_string_lossy().into_owned());

    Ok(ResolvedProject {
        project_id: normalize_project_id(&source),
        root_path,
        origin_url,
        branch,
    })
}

// ============================================================================
// SESSIONS
// ============================================================================

/// Session lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    #[default]
    Active,
    Suspended,
    Closed,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Active => "active",
            SessionState::Suspended => "suspended",
            SessionState::Closed => "closed",
        }
    }

    pub fn parse_name(s: &str) -> Self {
        match s {
            "suspended" => SessionState::Suspended,
            "closed" => SessionState::Closed,
            _ => SessionState::Active,
        }
    }
}

/// One continuous stretch of assistant work within a project
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub session_id: String,
    pub project_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub branch: Option<String>,
    pub started_at: DateTime<Utc>,
    pub last_active_at: DateTime<Utc>,
    pub state: SessionState,
    #[serde(default)]
    pub metadata: Value,
}

impl Session {
    pub fn new(project_id: String, branch: Option<String>, now: DateTime<Utc>) -> Self {
        Self {
            session_id: uuid::Uuid::new_v4().to_string(),
            project_id,
            branch,
            started_at: now,
            last_active_at: now,
            state: SessionState::Active,
            metadata: serde_json::json!({}),
        }
    }

    pub fn is_active(&self) -> bool {
        self.state == SessionState::Active
    }
}

/// Discover or create the session for a project. Priority order: explicit id,
/// `STACKMEMORY_SESSION`, most recent non-stale active session for
/// (project, branch), most recent active for the project alone, then a new
/// session. Sessions idle past the staleness window are suspended on the way.
pub fn resolve_session(
    store: &Store,
    project_id: &str,
    branch: Option<&str>,
    explicit_session_id: Option<&str>,
    stale_after_hours: i64,
) -> Result<Session> {
    resolve_session_at(
        store,
        project_id,
        branch,
        explicit_session_id,
        stale_after_hours,
        Utc::now(),
    )
}

/// `resolve_session` with an injectable clock.
pub fn resolve_session_at(
    store: &Store,
    project_id: &str,
    branch: Option<&str>,
    explicit_session_id: Option<&str>,
    stale_after_hours: i64,
    now: DateTime<Utc>,
) -> Result<Session> {
    let pinned = explicit_session_id
        .map(|s| s.to_string())
        .or_else(|| std::env::var(ENV_SESSION).ok().filter(|s| !s.is_empty()));

    if let Some(session_id) = pinned {
        let session = store
            .get_session(&session_id)?
            .ok_or_else(|| EngineError::NotFound(format!("session {}", session_id)))?;
        if !session.is_active() {
            return Err(EngineError::SessionNotActive(session_id));
        }
        store.touch_session(&session.session_id, now)?;
        return Ok(session);
    }

    let cutoff = now - Duration::hours(stale_after_hours);

    let candidate = match store.latest_active_session(project_id, branch)? {
        Some(session) => Some(session),
        None => store.latest_active_session(project_id, None)?,
    };

    if let Some(session) = candidate {
        if session.last_active_at >= cutoff {
            store.touch_session(&session.session_id, now)?;
            let mut resumed = session;
            resumed.last_active_at = now;
            return Ok(resumed);
        }
        // Stale: suspend it and fall through to a fresh session.
        store.set_session_state(&session.session_id, SessionState::Suspended, now)?;
        tracing::info!(session_id = %session.session_id, "suspended stale session");
    }

    let session = Session::new(project_id.to_string(), branch.map(|b| b.to_string()), now);
    store.insert_session(&session)?;
    Ok(session)
}

// ============================================================================
// GLOBAL PROJECT REGISTRY
// ============================================================================

/// The user-home registry of known projects (`~/.stackmemory/projects.db`).
pub struct ProjectRegistry {
    conn: Mutex<Connection>,
}

impl ProjectRegistry {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA busy_timeout = 5000;
             CREATE TABLE IF NOT EXISTS known_projects (
                 project_id TEXT PRIMARY KEY,
                 root_path TEXT NOT NULL,
                 first_seen TEXT NOT NULL,
                 last_seen TEXT NOT NULL
             );",
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn record(&self, project_id: &str, root_path: &Path, now: DateTime<Utc>) -> Result<()> {
        let conn = self
            .conn
            .lock()
            .map_err(|_| EngineError::StoreUnavailable("registry lock poisoned".to_string()))?;
        conn.execute(
            "INSERT INTO known_projects (project_id, root_path, first_seen, last_seen)
             VALUES (?1, ?2, ?3, ?3)
             ON CONFLICT(project_id) DO UPDATE SET root_path = excluded.root_path, last_seen = ?3",
            params![project_id, root_path.to_string_lossy(), now],
        )?;
        Ok(())
    }

    pub fn lookup(&self, project_id: &str) -> Result<Option<PathBuf>> {
        let conn = self
            .conn
            .lock()
            .map_err(|_| EngineError::StoreUnavailable("registry lock poisoned".to_string()))?;
        let path: Option<String> = conn
            .query_row(
                "SELECT root_path FROM known_projects WHERE project_id = ?1",
                params![project_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(path.map(PathBuf::from))
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_normalize_https_origin() {
        assert_eq!(
            normalize_project_id("https://github.com/acme/Widget.git"),
            "https-github-com-acme-widget"
        );
    }

    #[test]
    fn test_normalize_ssh_origin() {
        assert_eq!(
            normalize_project_id("git@github.com:acme/Widget.git"),
            "git-github-com-acme-widget"
        );
        assert_eq!(
            normalize_project_id("git@github.com:user/repo.git"),
            "git-github-com-user-repo"
        );
    }

    #[test]
    fn test_normalize_path() {
        assert_eq!(normalize_project_id("/home/u/w/Widget"), "home-u-w-widget");
    }

    #[test]
    fn test_normalize_collapses_runs_and_truncates() {
        assert_eq!(normalize_project_id("a--!!__b"), "a-b");
        let long = format!("/very/long/{}", "x".repeat(80));
        let id = normalize_project_id(&long);
        assert!(id.len() <= 50);
        assert!(id.ends_with('x'));
        assert!(!id.starts_with('-'));
    }

    #[test]
    fn test_normalize_is_idempotent() {
        for input in [
            "https://github.com/acme/Widget.git",
            "git@github.com:acme/Widget.git",
            "/home/u/w/Widget",
            "C:\\Users\\dev\\proj",
        ] {
            let once = normalize_project_id(input);
            assert_eq!(normalize_project_id(input), once);
            // Normalizing an already-normalized id is a fixpoint.
            assert_eq!(normalize_project_id(&once), once);
        }
    }

    #[test]
    fn test_resolve_project_without_repo_uses_path() {
        let dir = TempDir::new().unwrap();
        let resolved = resolve_project(dir.path()).unwrap();
        assert!(resolved.origin_url.is_none());
        let expected = normalize_project_id(&resolved.root_path.to_string_lossy());
        assert_eq!(resolved.project_id, expected);
    }

    #[test]
    fn test_resolve_session_creates_then_resumes() {
        let (store, _dir) = store();
        let first = resolve_session_at(&store, "p1", Some("main"), None, 24, Utc::now()).unwrap();
        let second = resolve_session_at(&store, "p1", Some("main"), None, 24, Utc::now()).unwrap();
        assert_eq!(first.session_id, second.session_id);
    }

    #[test]
    fn test_resolve_session_falls_back_across_branches() {
        let (store, _dir) = store();
        let main = resolve_session_at(&store, "p1", Some("main"), None, 24, Utc::now()).unwrap();
        // No session for `dev`, so the project-level active session is reused.
        let dev = resolve_session_at(&store, "p1", Some("dev"), None, 24, Utc::now()).unwrap();
        assert_eq!(main.session_id, dev.session_id);
    }

    #[test]
    fn test_stale_session_is_suspended_and_replaced() {
        let (store, _dir) = store();
        let now = Utc::now();
        let old = resolve_session_at(&store, "p1", Some("main"), None, 24, now).unwrap();

        let later = now + Duration::hours(25);
        let fresh = resolve_session_at(&store, "p1", Some("main"), None, 24, later).unwrap();
        assert_ne!(old.session_id, fresh.session_id);

        let suspended = store.get_session(&old.session_id).unwrap().unwrap();
        assert_eq!(suspended.state, SessionState::Suspended);
    }

    #[test]
    fn test_explicit_session_id_wins() {
        let (store, _dir) = store();
        let now = Utc::now();
        let pinned = Session::new("p1".to_string(), None, now);
        store.insert_session(&pinned).unwrap();
        let _other = resolve_session_at(&store, "p1", Some("main"), None, 24, now).unwrap();

        let resolved =
            resolve_session_at(&store, "p1", Some("main"), Some(&pinned.session_id), 24, now).unwrap();
        assert_eq!(resolved.session_id, pinned.session_id);

        let missing = resolve_session_at(&store, "p1", None, Some("nope"), 24, now);
        assert!(missing.is_err());
    }

    #[test]
    fn test_registry_roundtrip() {
        let dir = TempDir::new().unwrap();
        let registry = ProjectRegistry::open(&dir.path().join("projects.db")).unwrap();
        registry.record("p1", Path::new("/work/p1"), Utc::now()).unwrap();
        registry.record("p1", Path::new("/work/p1-moved"), Utc::now()).unwrap();
        assert_eq!(registry.lookup("p1").unwrap(), Some(PathBuf::from("/work/p1-moved")));
        assert_eq!(registry.lookup("p2").unwrap(), None);
    }

    fn store() -> (Store, TempDir) {
        let dir = TempDir::new().unwrap();
        let store = Store::open(&dir.path().join("context.db")).unwrap();
        (store, dir)
    }
}
