//! Filesystem Watcher
//!
//! Bridges `notify` events onto the daemon's hook bus as `file_change`
//! events, with extension and ignore-list filtering.

use std::path::{Path, PathBuf};

use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::error::{EngineError, Result};

use super::hooks::{HookEvent, HookKind};

/// Watcher configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct WatcherConfig {
    /// Directories to watch recursively
    pub roots: Vec<PathBuf>,
    /// Extensions that produce events; empty means every file
    pub extensions: Vec<String>,
    /// Path components that mute a file entirely
    pub ignore: Vec<String>,
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            roots: Vec::new(),
            extensions: vec![
                "rs", "ts", "tsx", "js", "jsx", "py", "go", "java", "c", "h", "cpp", "md", "toml",
                "json", "yaml", "yml", "sql",
            ]
            .into_iter()
            .map(String::from)
            .collect(),
            ignore: vec![".git", ".stackmemory", "target", "node_modules", "dist", ".venv"]
                .into_iter()
                .map(String::from)
                .collect(),
        }
    }
}

impl WatcherConfig {
    /// Whether a changed path should reach the bus.
    pub fn should_emit(&self, path: &Path) -> bool {
        for component in path.components() {
            let name = component.as_os_str().to_string_lossy();
            if self.ignore.iter().any(|ignored| *ignored == name) {
                return false;
            }
        }
        if self.extensions.is_empty() {
            return true;
        }
        match path.extension().map(|e| e.to_string_lossy().to_lowercase()) {
            Some(ext) => self.extensions.iter().any(|allowed| *allowed == ext),
            None => false,
        }
    }
}

fn change_kind(kind: &EventKind) -> Option<&'static str> {
    match kind {
        EventKind::Create(_) => Some("create"),
        EventKind::Modify(_) => Some("modify"),
        EventKind::Remove(_) => Some("delete"),
        _ => None,
    }
}

/// Start watching the configured roots. The returned watcher must be kept
/// alive for events to flow.
pub fn spawn_watcher(
    config: WatcherConfig,
    bus: broadcast::Sender<HookEvent>,
) -> Result<RecommendedWatcher> {
    let filter = config.clone();
    let mut watcher = notify::recommended_watcher(move |result: notify::Result<Event>| {
        let event = match result {
            Ok(event) => event,
            Err(e) => {
                warn!(error = %e, "filesystem watcher error");
                return;
            }
        };
        let Some(kind) = change_kind(&event.kind) else {
            return;
        };
        for path in event.paths {
            if !filter.should_emit(&path) {
                continue;
            }
            debug!(path = %path.display(), kind, "file change");
            let _ = bus.send(HookEvent::new(
                HookKind::FileChange,
                serde_json::json!({
                    "path": path.to_string_lossy(),
                    "change": kind,
                }),
            ));
        }
    })
    .map_err(|e| EngineError::StoreUnavailable(format!("watcher init: {}", e)))?;

    for root in &config.roots {
        watcher
            .watch(root, RecursiveMode::Recursive)
            .map_err(|e| EngineError::StoreUnavailable(format!("watch {}: {}", root.display(), e)))?;
    }
    Ok(watcher)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ignore_list_mutes_paths() {
        let config = WatcherConfig::default();
        assert!(config.should_emit(Path::new("/proj/src/main.rs")));
        assert!(!config.should_emit(Path::new("/proj/target/debug/main.rs")));
        assert!(!config.should_emit(Path::new("/proj/.git/HEAD")));
        assert!(!config.should_emit(Path::new("/proj/.stackmemory/context.db")));
    }

    #[test]
    fn test_extension_filter() {
        let config = WatcherConfig::default();
        assert!(config.should_emit(Path::new("/proj/notes.md")));
        assert!(!config.should_emit(Path::new("/proj/photo.png")));
        assert!(!config.should_emit(Path::new("/proj/Makefile")));

        let everything = WatcherConfig {
            extensions: Vec::new(),
            ..WatcherConfig::default()
        };
        assert!(everything.should_emit(Path::new("/proj/Makefile")));
    }
}
