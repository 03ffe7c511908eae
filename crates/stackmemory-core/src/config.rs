//! Engine Configuration
//!
//! Typed configuration with serde defaults, loaded from the per-project
//! `.stackmemory/config.json` when present. Every knob has a documented
//! default matching the engine's contract.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{EngineError, Result};

/// Default frame stack depth bound
const DEFAULT_MAX_FRAME_DEPTH: usize = 10_000;

/// Maximum encoded event payload size (1 MiB)
const DEFAULT_MAX_PAYLOAD_BYTES: usize = 1024 * 1024;

/// Maximum anchor text / constraint blob size (4 KiB)
const DEFAULT_MAX_ANCHOR_BYTES: usize = 4096;

/// Local storage soft limit before size-pressure demotion (2 GiB)
const DEFAULT_MAX_LOCAL_BYTES: u64 = 2 * 1024 * 1024 * 1024;

/// Migration queue soft ceiling before close_frame stops enqueueing
const DEFAULT_QUEUE_SOFT_CEILING: usize = 10_000;

fn default_max_frame_depth() -> usize {
    DEFAULT_MAX_FRAME_DEPTH
}
fn default_max_payload_bytes() -> usize {
    DEFAULT_MAX_PAYLOAD_BYTES
}
fn default_max_anchor_bytes() -> usize {
    DEFAULT_MAX_ANCHOR_BYTES
}
fn default_max_local_bytes() -> u64 {
    DEFAULT_MAX_LOCAL_BYTES
}
fn default_queue_soft_ceiling() -> usize {
    DEFAULT_QUEUE_SOFT_CEILING
}
fn default_migration_batch() -> usize {
    50
}
fn default_migration_interval_secs() -> u64 {
    60
}
fn default_lease_secs() -> i64 {
    300
}
fn default_young_window_hours() -> i64 {
    24
}
fn default_mature_window_days() -> i64 {
    7
}
fn default_old_window_days() -> i64 {
    30
}
fn default_retain_importance() -> i64 {
    1
}
fn default_session_stale_hours() -> i64 {
    24
}
fn default_budget_tokens() -> usize {
    10_000
}
fn default_anchor_budget_fraction() -> f64 {
    0.4
}
fn default_hot_stack_fraction() -> f64 {
    0.3
}
fn default_bytes_per_token() -> usize {
    4
}
fn default_semantic_timeout_ms() -> u64 {
    500
}
fn default_recency_half_life_days() -> f64 {
    7.0
}
fn default_weight_bm25() -> f64 {
    0.6
}
fn default_weight_importance() -> f64 {
    0.3
}
fn default_weight_recency() -> f64 {
    0.1
}
fn default_hook_debounce_ms() -> u64 {
    2_000
}
fn default_hook_cooldown_ms() -> u64 {
    10_000
}
fn default_hook_budget_secs() -> u64 {
    30
}

/// Engine-wide configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EngineConfig {
    /// Frame stack depth bound; values below 10,000 are clamped up
    pub max_frame_depth: usize,
    /// Maximum encoded event payload in bytes
    pub max_payload_bytes: usize,
    /// Maximum anchor text / constraint blob in bytes
    pub max_anchor_bytes: usize,
    /// Local tier-storage size limit in bytes
    pub max_local_bytes: u64,
    /// Migration queue soft ceiling
    pub queue_soft_ceiling: usize,
    /// Migration batch size per tier-loop tick
    pub migration_batch: usize,
    /// Tier loop interval in seconds
    pub migration_interval_secs: u64,
    /// Queue claim lease in seconds
    pub lease_secs: i64,
    /// Young tier age window in hours
    pub young_window_hours: i64,
    /// Mature tier age window in days
    pub mature_window_days: i64,
    /// Old tier age window in days
    pub old_window_days: i64,
    /// Items scoring below a tier's retain threshold demote without waiting
    /// out the age window. The defaults only fast-track zero-score frames.
    pub retain_importance_young: i64,
    pub retain_importance_mature: i64,
    pub retain_importance_old: i64,
    /// Keep archive-tier blobs instead of dropping them
    pub archive_retention: bool,
    /// Sessions idle longer than this are suspended on discovery
    pub session_stale_hours: i64,
    /// Default retrieval token budget
    pub budget_tokens: usize,
    /// Fraction of the budget reserved for the anchor sweep
    pub anchor_budget_fraction: f64,
    /// Fraction of the remaining budget for the hot-stack slice
    pub hot_stack_fraction: f64,
    /// Bytes-per-token ratio for the default estimator
    pub bytes_per_token: usize,
    /// Hard timeout for the semantic augmentation stage
    pub semantic_timeout_ms: u64,
    /// Recency decay half-life in days
    pub recency_half_life_days: f64,
    /// Lexical re-rank weight for BM25
    pub weight_bm25: f64,
    /// Lexical re-rank weight for importance
    pub weight_importance: f64,
    /// Lexical re-rank weight for recency decay
    pub weight_recency: f64,
    /// Hook dispatch debounce in milliseconds
    pub hook_debounce_ms: u64,
    /// Per-hook cooldown in milliseconds
    pub hook_cooldown_ms: u64,
    /// Wall budget for a single hook invocation in seconds
    pub hook_budget_secs: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_frame_depth: default_max_frame_depth(),
            max_payload_bytes: default_max_payload_bytes(),
            max_anchor_bytes: default_max_anchor_bytes(),
            max_local_bytes: default_max_local_bytes(),
            queue_soft_ceiling: default_queue_soft_ceiling(),
            migration_batch: default_migration_batch(),
            migration_interval_secs: default_migration_interval_secs(),
            lease_secs: default_lease_secs(),
            young_window_hours: default_young_window_hours(),
            mature_window_days: default_mature_window_days(),
            old_window_days: default_old_window_days(),
            retain_importance_young: default_retain_importance(),
            retain_importance_mature: default_retain_importance(),
            retain_importance_old: default_retain_importance(),
            archive_retention: false,
            session_stale_hours: default_session_stale_hours(),
            budget_tokens: default_budget_tokens(),
            anchor_budget_fraction: default_anchor_budget_fraction(),
            hot_stack_fraction: default_hot_stack_fraction(),
            bytes_per_token: default_bytes_per_token(),
            semantic_timeout_ms: default_semantic_timeout_ms(),
            recency_half_life_days: default_recency_half_life_days(),
            weight_bm25: default_weight_bm25(),
            weight_importance: default_weight_importance(),
            weight_recency: default_weight_recency(),
            hook_debounce_ms: default_hook_debounce_ms(),
            hook_cooldown_ms: default_hook_cooldown_ms(),
            hook_budget_secs: default_hook_budget_secs(),
        }
    }
}

impl EngineConfig {
    /// Load from `config.json`, falling back to defaults when the file is
    /// missing. A malformed file is an error; silently ignoring it would hide
    /// operator typos.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let raw = std::fs::read_to_string(path)?;
        let mut config: EngineConfig = serde_json::from_str(&raw)
            .map_err(|e| EngineError::InvalidArgument(format!("bad config {}: {}", path.display(), e)))?;
        config.clamp();
        Ok(config)
    }

    /// Enforce hard floors on configured values.
    pub fn clamp(&mut self) {
        if self.max_frame_depth < DEFAULT_MAX_FRAME_DEPTH {
            self.max_frame_depth = DEFAULT_MAX_FRAME_DEPTH;
        }
        if self.migration_batch == 0 {
            self.migration_batch = default_migration_batch();
        }
        if self.bytes_per_token == 0 {
            self.bytes_per_token = default_bytes_per_token();
        }
    }
}

/// On-disk layout. Both roots are overridable upstream of this.
#[derive(Debug, Clone)]
pub struct Paths {
    /// Project root directory
    pub project_root: PathBuf,
    /// `<project_root>/.stackmemory`
    pub project_dir: PathBuf,
    /// User-home `.stackmemory` directory
    pub home_dir: PathBuf,
}

impl Paths {
    /// Resolve the layout for a project root. The home directory comes from
    /// the platform base dirs; tests may point it anywhere.
    pub fn new(project_root: PathBuf) -> Result<Self> {
        let base = directories::BaseDirs::new().ok_or_else(|| {
            EngineError::StoreUnavailable("could not determine home directory".to_string())
        })?;
        Ok(Self::with_home(project_root, base.home_dir().join(".stackmemory")))
    }

    /// Layout with an explicit home-side directory.
    pub fn with_home(project_root: PathBuf, home_dir: PathBuf) -> Self {
        let project_dir = project_root.join(".stackmemory");
        Self {
            project_root,
            project_dir,
            home_dir,
        }
    }

    /// Primary store: `<project>/.stackmemory/context.db`
    pub fn context_db(&self) -> PathBuf {
        self.project_dir.join("context.db")
    }

    /// Per-project config: `<project>/.stackmemory/config.json`
    pub fn config_json(&self) -> PathBuf {
        self.project_dir.join("config.json")
    }

    /// Global registry of known projects
    pub fn projects_db(&self) -> PathBuf {
        self.home_dir.join("projects.db")
    }

    /// Session continuity files
    pub fn sessions_dir(&self) -> PathBuf {
        self.home_dir.join("sessions")
    }

    /// Daemon pid file
    pub fn hooks_pid(&self) -> PathBuf {
        self.home_dir.join("hooks.pid")
    }

    /// Daemon log file
    pub fn hooks_log(&self) -> PathBuf {
        self.home_dir.join("hooks.log")
    }

    /// Tier-migration retries that exhausted in-band attempts
    pub fn offline_queue(&self) -> PathBuf {
        self.home_dir.join("offline-queue.json")
    }

    /// Create both directory trees.
    pub fn ensure_dirs(&self) -> Result<()> {
        std::fs::create_dir_all(&self.project_dir)?;
        std::fs::create_dir_all(self.sessions_dir())?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.max_frame_depth, 10_000);
        assert_eq!(config.max_payload_bytes, 1024 * 1024);
        assert_eq!(config.migration_batch, 50);
        assert_eq!(config.bytes_per_token, 4);
        assert!((config.weight_bm25 - 0.6).abs() < f64::EPSILON);
        assert!(!config.archive_retention);
    }

    #[test]
    fn test_load_missing_file_uses_defaults() {
        let dir = TempDir::new().unwrap();
        let config = EngineConfig::load(&dir.path().join("config.json")).unwrap();
        assert_eq!(config.budget_tokens, 10_000);
    }

    #[test]
    fn test_load_partial_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{"budgetTokens": 2000, "archiveRetention": true}"#).unwrap();
        let config = EngineConfig::load(&path).unwrap();
        assert_eq!(config.budget_tokens, 2000);
        assert!(config.archive_retention);
        assert_eq!(config.migration_batch, 50);
    }

    #[test]
    fn test_depth_bound_is_clamped_up() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{"maxFrameDepth": 100}"#).unwrap();
        let config = EngineConfig::load(&path).unwrap();
        assert_eq!(config.max_frame_depth, 10_000);
    }

    #[test]
    fn test_malformed_config_is_an_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, "not json").unwrap();
        assert!(EngineConfig::load(&path).is_err());
    }

    #[test]
    fn test_paths_layout() {
        let paths = Paths::with_home(PathBuf::from("/work/proj"), PathBuf::from("/home/u/.stackmemory"));
        assert_eq!(paths.context_db(), PathBuf::from("/work/proj/.stackmemory/context.db"));
        assert_eq!(paths.projects_db(), PathBuf::from("/home/u/.stackmemory/projects.db"));
        assert_eq!(paths.hooks_pid(), PathBuf::from("/home/u/.stackmemory/hooks.pid"));
    }
}
