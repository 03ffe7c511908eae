//! Daemon Supervisor
//!
//! Long-running side of the engine: the filesystem watcher, the tier
//! migration loop, the expired-session sweeper, and the lifecycle-hook
//! dispatcher. Single instance per user, enforced with an advisory lock on
//! the pid file. Background failures never surface to foreground calls;
//! they are logged and rescheduled.

pub mod hooks;
pub mod watcher;

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use fs2::FileExt;
use notify::RecommendedWatcher;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::engine::MemoryEngine;
use crate::error::{EngineError, Result};

pub use hooks::{HookEvent, HookFn, HookKind, HookRegistry};
pub use watcher::{spawn_watcher, WatcherConfig};

/// Dispatcher wake-up cadence
const DISPATCH_TICK: Duration = Duration::from_millis(200);

/// Sweeper cadence for suspending idle sessions
const SWEEP_INTERVAL: Duration = Duration::from_secs(3600);

// ============================================================================
// PID FILE LOCK
// ============================================================================

/// Advisory exclusive lock on the daemon pid file. Held for the daemon's
/// lifetime; a second daemon for the same user fails to start.
#[derive(Debug)]
pub struct PidLock {
    file: File,
    path: PathBuf,
}

impl PidLock {
    pub fn acquire(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(path)?;
        file.try_lock_exclusive().map_err(|_| {
            EngineError::Conflict(format!(
                "another daemon holds the pid lock at {}",
                path.display()
            ))
        })?;
        file.set_len(0)?;
        writeln!(file, "{}", std::process::id())?;
        file.sync_all()?;
        Ok(Self {
            file,
            path: path.to_path_buf(),
        })
    }
}

impl Drop for PidLock {
    fn drop(&mut self) {
        let _ = fs2::FileExt::unlock(&self.file);
        let _ = std::fs::remove_file(&self.path);
    }
}

// ============================================================================
// DISPATCHER
// ============================================================================

/// Debounce / cooldown / budget knobs for the hook dispatcher
#[derive(Debug, Clone, Copy)]
pub struct DispatcherSettings {
    pub debounce: Duration,
    pub cooldown: Duration,
    pub budget: Duration,
}

impl DispatcherSettings {
    fn from_config(config: &crate::config::EngineConfig) -> Self {
        Self {
            debounce: Duration::from_millis(config.hook_debounce_ms),
            cooldown: Duration::from_millis(config.hook_cooldown_ms),
            budget: Duration::from_secs(config.hook_budget_secs),
        }
    }
}

/// Run the hook dispatcher until shutdown. Bursts coalesce per handler: only
/// the latest event within the debounce window is delivered, and a handler
/// in cooldown keeps accumulating instead of firing.
pub(crate) fn spawn_dispatcher(
    registry: Arc<HookRegistry>,
    mut rx: broadcast::Receiver<HookEvent>,
    settings: DispatcherSettings,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        // handler id -> (latest event, first-seen due time)
        let mut pending: HashMap<String, (HookEvent, Instant)> = HashMap::new();
        let mut tick = tokio::time::interval(DISPATCH_TICK);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                received = rx.recv() => {
                    match received {
                        Ok(event) => {
                            let due = Instant::now() + settings.debounce;
                            for id in registry.subscribers(event.kind) {
                                pending
                                    .entry(id)
                                    .and_modify(|slot| slot.0 = event.clone())
                                    .or_insert((event.clone(), due));
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(missed)) => {
                            warn!(missed, "hook bus lagged; events coalesced");
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
                _ = tick.tick() => {
                    let now = Instant::now();
                    let due_ids: Vec<String> = pending
                        .iter()
                        .filter(|(_, (_, due))| *due <= now)
                        .map(|(id, _)| id.clone())
                        .collect();
                    for id in due_ids {
                        let Some(callback) = registry.callback(&id) else {
                            pending.remove(&id);
                            continue;
                        };
                        // In cooldown: leave pending, keep coalescing.
                        if !registry.try_begin_invocation(&id, now, settings.cooldown) {
                            continue;
                        }
                        let Some((event, _)) = pending.remove(&id) else {
                            continue;
                        };
                        invoke_handler(Arc::clone(&registry), id, callback, event, settings.budget);
                    }
                }
            }
        }
        debug!("hook dispatcher stopped");
    })
}

/// Run one handler invocation off-thread with a wall budget. Panics and
/// errors are contained; the handler stays registered either way.
fn invoke_handler(
    registry: Arc<HookRegistry>,
    id: String,
    callback: HookFn,
    event: HookEvent,
    budget: Duration,
) {
    tokio::spawn(async move {
        let kind = event.kind;
        let work = tokio::task::spawn_blocking(move || callback(&event));
        match tokio::time::timeout(budget, work).await {
            Ok(Ok(Ok(()))) => {}
            Ok(Ok(Err(e))) => {
                warn!(hook = %id, kind = kind.as_str(), error = %e, "hook handler returned an error");
            }
            Ok(Err(join_error)) => {
                warn!(hook = %id, kind = kind.as_str(), error = %join_error, "hook handler panicked");
            }
            Err(_) => {
                registry.mark_degraded(&id);
                warn!(
                    hook = %id,
                    kind = kind.as_str(),
                    budget_secs = budget.as_secs(),
                    "hook handler exceeded its wall budget; abandoned for this invocation"
                );
            }
        }
    });
}

// ============================================================================
// DAEMON
// ============================================================================

/// The running supervisor. Dropping it (or calling `stop`) shuts the loops
/// down and releases the pid lock.
pub struct Daemon {
    registry: Arc<HookRegistry>,
    bus: broadcast::Sender<HookEvent>,
    shutdown_tx: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
    log_path: PathBuf,
    _pid_lock: PidLock,
    _watcher: Option<RecommendedWatcher>,
}

/// Append one timestamped line to the daemon's operational log.
fn log_line(path: &Path, message: &str) {
    let appended = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .and_then(|mut f| writeln!(f, "{} pid={} {}", Utc::now().to_rfc3339(), std::process::id(), message));
    if let Err(e) = appended {
        debug!(error = %e, "could not append to hooks.log");
    }
}

impl Daemon {
    /// Start the supervisor for an engine. Must run inside a tokio runtime.
    pub fn start(engine: Arc<MemoryEngine>, watcher_config: Option<WatcherConfig>) -> Result<Self> {
        let pid_lock = PidLock::acquire(&engine.paths().hooks_pid())?;

        let bus = engine.hook_bus();
        let registry = HookRegistry::new();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let settings = DispatcherSettings::from_config(engine.config().as_ref());

        let mut tasks = Vec::new();
        tasks.push(spawn_dispatcher(
            Arc::clone(&registry),
            bus.subscribe(),
            settings,
            shutdown_rx.clone(),
        ));
        tasks.push(spawn_tier_loop(Arc::clone(&engine), shutdown_rx.clone()));
        tasks.push(spawn_session_sweeper(Arc::clone(&engine), shutdown_rx));

        let mut watcher_config = watcher_config.unwrap_or_default();
        if watcher_config.roots.is_empty() {
            watcher_config.roots = vec![engine.paths().project_root.clone()];
        }
        let watcher = match spawn_watcher(watcher_config, bus.clone()) {
            Ok(watcher) => Some(watcher),
            Err(e) => {
                warn!(error = %e, "filesystem watcher unavailable; daemon continues without it");
                None
            }
        };

        let _ = bus.send(HookEvent::new(
            HookKind::SessionStart,
            serde_json::json!({"sessionId": engine.session_id()}),
        ));
        log_line(&engine.paths().hooks_log(), "daemon started");
        info!("daemon started");

        Ok(Self {
            registry,
            bus,
            shutdown_tx,
            tasks,
            log_path: engine.paths().hooks_log(),
            _pid_lock: pid_lock,
            _watcher: watcher,
        })
    }

    /// Subscribe a lifecycle hook; the id unsubscribes it.
    pub fn on(&self, kind: HookKind, callback: HookFn) -> String {
        self.registry.register(kind, callback)
    }

    pub fn off(&self, id: &str) -> bool {
        self.registry.unregister(id)
    }

    pub fn registry(&self) -> &Arc<HookRegistry> {
        &self.registry
    }

    /// Emit an event onto the bus (used for `context_switch` and
    /// `suggestion_ready`, which originate outside the engine core).
    pub fn emit(&self, event: HookEvent) {
        let _ = self.bus.send(event);
    }

    /// Orderly shutdown: session_end fires, loops stop, pid lock releases.
    pub async fn stop(mut self) {
        let _ = self.bus.send(HookEvent::new(HookKind::SessionEnd, serde_json::json!({})));
        let _ = self.shutdown_tx.send(true);
        for task in self.tasks.drain(..) {
            task.abort();
        }
        log_line(&self.log_path, "daemon stopped");
        info!("daemon stopped");
    }
}

fn spawn_tier_loop(engine: Arc<MemoryEngine>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let period = Duration::from_secs(engine.config().migration_interval_secs.max(1));
        let mut tick = tokio::time::interval(period);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                _ = tick.tick() => {
                    let tiers = engine.tiers().clone();
                    let result = tokio::task::spawn_blocking(move || tiers.run_once(Utc::now())).await;
                    match result {
                        Ok(Ok(report)) => {
                            if report.migrated > 0 || report.failed > 0 {
                                debug!(migrated = report.migrated, failed = report.failed, "tier loop tick");
                            }
                        }
                        Ok(Err(e)) => warn!(error = %e, "tier loop tick failed"),
                        Err(e) => warn!(error = %e, "tier loop task failed"),
                    }
                }
            }
        }
    })
}

fn spawn_session_sweeper(engine: Arc<MemoryEngine>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(SWEEP_INTERVAL);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                _ = tick.tick() => {
                    let store = engine.store().clone();
                    let stale_hours = engine.config().session_stale_hours;
                    let result = tokio::task::spawn_blocking(move || {
                        let now = Utc::now();
                        store.suspend_sessions_idle_since(now - chrono::Duration::hours(stale_hours), now)
                    })
                    .await;
                    match result {
                        Ok(Ok(0)) => {}
                        Ok(Ok(suspended)) => info!(suspended, "suspended idle sessions"),
                        Ok(Err(e)) => warn!(error = %e, "session sweep failed"),
                        Err(e) => warn!(error = %e, "session sweep task failed"),
                    }
                }
            }
        }
    })
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    #[test]
    fn test_pid_lock_is_exclusive() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("hooks.pid");
        let first = PidLock::acquire(&path).unwrap();
        let err = PidLock::acquire(&path).unwrap_err();
        assert_eq!(err.error_code(), "Conflict");

        drop(first);
        let _second = PidLock::acquire(&path).unwrap();
    }

    fn fast_settings() -> DispatcherSettings {
        DispatcherSettings {
            debounce: Duration::from_millis(50),
            cooldown: Duration::from_millis(400),
            budget: Duration::from_secs(2),
        }
    }

    #[tokio::test]
    async fn test_burst_coalesces_into_one_invocation() {
        let registry = HookRegistry::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_in = Arc::clone(&calls);
        registry.register(
            HookKind::FileChange,
            Arc::new(move |_| {
                calls_in.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }),
        );

        let (bus, _) = broadcast::channel(64);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = spawn_dispatcher(Arc::clone(&registry), bus.subscribe(), fast_settings(), shutdown_rx);

        for i in 0..10 {
            bus.send(HookEvent::new(
                HookKind::FileChange,
                serde_json::json!({"path": format!("f{}.rs", i)}),
            ))
            .unwrap();
        }
        tokio::time::sleep(Duration::from_millis(350)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        let _ = shutdown_tx.send(true);
        let _ = task.await;
    }

    #[tokio::test]
    async fn test_failing_handler_stays_registered() {
        let registry = HookRegistry::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_in = Arc::clone(&calls);
        let id = registry.register(
            HookKind::FrameClosed,
            Arc::new(move |_| {
                calls_in.fetch_add(1, Ordering::SeqCst);
                Err("handler bug".to_string())
            }),
        );

        let (bus, _) = broadcast::channel(64);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = spawn_dispatcher(Arc::clone(&registry), bus.subscribe(), fast_settings(), shutdown_rx);

        bus.send(HookEvent::new(HookKind::FrameClosed, serde_json::json!({}))).unwrap();
        tokio::time::sleep(Duration::from_millis(350)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(registry.len(), 1);

        // A later event reaches the same handler once the cooldown passes.
        tokio::time::sleep(Duration::from_millis(300)).await;
        bus.send(HookEvent::new(HookKind::FrameClosed, serde_json::json!({}))).unwrap();
        tokio::time::sleep(Duration::from_millis(350)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(registry.degraded_invocations(&id), 0);

        let _ = shutdown_tx.send(true);
        let _ = task.await;
    }

    #[tokio::test]
    async fn test_over_budget_handler_is_marked_degraded() {
        let registry = HookRegistry::new();
        let id = registry.register(
            HookKind::SuggestionReady,
            Arc::new(|_| {
                std::thread::sleep(Duration::from_millis(500));
                Ok(())
            }),
        );

        let settings = DispatcherSettings {
            debounce: Duration::from_millis(20),
            cooldown: Duration::from_millis(50),
            budget: Duration::from_millis(100),
        };
        let (bus, _) = broadcast::channel(64);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = spawn_dispatcher(Arc::clone(&registry), bus.subscribe(), settings, shutdown_rx);

        bus.send(HookEvent::new(HookKind::SuggestionReady, serde_json::json!({}))).unwrap();
        tokio::time::sleep(Duration::from_millis(600)).await;
        assert_eq!(registry.degraded_invocations(&id), 1);
        // Still registered after the abandoned invocation.
        assert_eq!(registry.len(), 1);

        let _ = shutdown_tx.send(true);
        let _ = task.await;
    }
}
