//! Tier Manager
//!
//! Background migration of frame snapshots across young/mature/old/archive
//! tiers. Age, size pressure, and importance all feed the same queue; the
//! queue is FIFO per priority band with claim-and-lease semantics so several
//! workers can share it. Migrations are idempotent by `(item_id, target_tier)`
//! and the tier of a record only ever advances.

use std::collections::HashMap;
use std::io::Write as _;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::codec::{self, Compression};
use crate::config::{EngineConfig, Paths};
use crate::error::{EngineError, Result};
use crate::frame::{EventType, FrameLocks, FrameSnapshot};
use crate::storage::{QueueEntry, Store};

/// In-band retry ceiling; past it the entry spills to the offline queue
const MAX_ATTEMPTS: i64 = 5;

/// Backoff base for failed migrations
const BACKOFF_BASE_SECS: i64 = 60;

/// Cold reads within this window count toward promotion
const PROMOTION_WINDOW: Duration = Duration::hours(1);

/// Cold reads above this count promote the frame into the hot cache
const PROMOTION_THRESHOLD: usize = 3;

// ============================================================================
// TIERS
// ============================================================================

/// Durability/compression band. Declaration order is the migration order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    #[default]
    Young,
    Mature,
    Old,
    Archive,
}

impl Tier {
    pub fn as_str(&self) -> &'static str {
        match self {
            Tier::Young => "young",
            Tier::Mature => "mature",
            Tier::Old => "old",
            Tier::Archive => "archive",
        }
    }

    pub fn parse_name(s: &str) -> Option<Self> {
        match s {
            "young" => Some(Tier::Young),
            "mature" => Some(Tier::Mature),
            "old" => Some(Tier::Old),
            "archive" => Some(Tier::Archive),
            _ => None,
        }
    }

    /// The next colder tier
    pub fn next(&self) -> Option<Tier> {
        match self {
            Tier::Young => Some(Tier::Mature),
            Tier::Mature => Some(Tier::Old),
            Tier::Old => Some(Tier::Archive),
            Tier::Archive => None,
        }
    }

    /// Codec policy per tier
    pub fn compression(&self) -> Compression {
        match self {
            Tier::Young => Compression::None,
            Tier::Mature => Compression::Lz4,
            Tier::Old | Tier::Archive => Compression::Zstd,
        }
    }
}

impl std::fmt::Display for Tier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// ============================================================================
// RETENTION
// ============================================================================

/// Rewrite a snapshot for its target tier.
///
/// mature: complete event list, but chatty tool_result payload bodies are
/// dropped. old/archive: critical only (decisions, errors, anchors, frame
/// header).
pub fn apply_retention(mut snapshot: FrameSnapshot, target: Tier) -> FrameSnapshot {
    match target {
        Tier::Young => snapshot,
        Tier::Mature => {
            for event in &mut snapshot.events {
                if event.event_type == EventType::ToolResult {
                    event.payload = serde_json::json!({"truncated": true});
                }
            }
            snapshot
        }
        Tier::Old | Tier::Archive => {
            snapshot.events.retain(|e| {
                matches!(e.event_type, EventType::DecisionLog | EventType::Error)
            });
            snapshot
        }
    }
}

// ============================================================================
// REPORT
// ============================================================================

/// Outcome of one tier-loop tick
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MigrationReport {
    pub enqueued: usize,
    pub migrated: usize,
    pub pruned: usize,
    pub demotions_enqueued: usize,
    pub skipped_locked: usize,
    pub failed: usize,
    pub spilled: usize,
}

// ============================================================================
// TIER MANAGER
// ============================================================================

/// Owns tier transitions and the promotion cache. The only mutator of the
/// `tier` and blob columns.
pub struct TierManager {
    store: Arc<Store>,
    config: Arc<EngineConfig>,
    locks: Arc<FrameLocks>,
    paths: Paths,
    worker_id: String,
    hot_cache: Mutex<HashMap<String, FrameSnapshot>>,
    access_log: Mutex<HashMap<String, Vec<DateTime<Utc>>>>,
}

impl TierManager {
    pub fn new(store: Arc<Store>, config: Arc<EngineConfig>, locks: Arc<FrameLocks>, paths: Paths) -> Self {
        Self {
            store,
            config,
            locks,
            paths,
            worker_id: format!("tier-{}", std::process::id()),
            hot_cache: Mutex::new(HashMap::new()),
            access_log: Mutex::new(HashMap::new()),
        }
    }

    /// One tick of the migration loop: enqueue what is due, apply size
    /// pressure, then drain one claimed batch. Never surfaces an error per
    /// item; failures back off or spill.
    pub fn run_once(&self, now: DateTime<Utc>) -> Result<MigrationReport> {
        let mut report = MigrationReport::default();

        report.enqueued = self.store.enqueue_due_age_migrations(
            now,
            now - Duration::hours(self.config.young_window_hours),
            now - Duration::days(self.config.mature_window_days),
            now - Duration::days(self.config.old_window_days),
        )?;

        report.enqueued += self.store.enqueue_low_importance_migrations(
            now,
            &[
                (Tier::Young, Tier::Mature, self.config.retain_importance_young),
                (Tier::Mature, Tier::Old, self.config.retain_importance_mature),
                (Tier::Old, Tier::Archive, self.config.retain_importance_old),
            ],
        )?;

        report.demotions_enqueued = self.enqueue_size_pressure(now)?;

        let lease_until = now + Duration::seconds(self.config.lease_secs);
        let batch = self
            .store
            .claim_queue_batch(now, lease_until, &self.worker_id, self.config.migration_batch)?;

        for entry in batch {
            // Never migrate under an active write; the lease is released and
            // the entry becomes re-eligible immediately.
            let Some(_guard) = self.locks.try_lock(&entry.frame_id) else {
                self.store.release_lease(entry.queue_id)?;
                report.skipped_locked += 1;
                continue;
            };

            match self.process_entry(&entry, now) {
                Ok(MigrationOutcome::Migrated) => report.migrated += 1,
                Ok(MigrationOutcome::Pruned) => report.pruned += 1,
                Ok(MigrationOutcome::AlreadyDone) => {}
                Err(e) => {
                    report.failed += 1;
                    let attempts = entry.attempts + 1;
                    if attempts >= MAX_ATTEMPTS {
                        self.spill_offline(&entry, &e, now);
                        // Park rather than delete: the row keeps its
                        // (item_id, target_tier) slot so the age sweep
                        // cannot re-enqueue it in-band.
                        self.store
                            .backoff_queue_entry(entry.queue_id, attempts, now + Duration::days(365 * 100))?;
                        report.spilled += 1;
                    } else {
                        let delay = BACKOFF_BASE_SECS << attempts.min(10);
                        self.store.backoff_queue_entry(
                            entry.queue_id,
                            attempts,
                            now + Duration::seconds(delay),
                        )?;
                        warn!(
                            item_id = %entry.item_id,
                            attempts,
                            delay_secs = delay,
                            error = %e,
                            "migration failed; backing off"
                        );
                    }
                }
            }
        }

        if report.migrated > 0 || report.pruned > 0 || report.failed > 0 {
            info!(
                migrated = report.migrated,
                pruned = report.pruned,
                failed = report.failed,
                skipped_locked = report.skipped_locked,
                "tier migration tick"
            );
        }
        Ok(report)
    }

    /// When local blob size exceeds the limit, demote the lowest-importance
    /// items first (band 1 sorts after age-triggered work).
    fn enqueue_size_pressure(&self, now: DateTime<Utc>) -> Result<usize> {
        let total = self.store.total_blob_size()?;
        if total <= self.config.max_local_bytes {
            return Ok(0);
        }
        warn!(
            total_bytes = total,
            limit = self.config.max_local_bytes,
            "local storage over limit; demoting lowest-importance items"
        );
        let mut enqueued = 0;
        for item in self.store.demotion_candidates(self.config.migration_batch)? {
            if let Some(target) = item.tier.next() {
                self.store
                    .enqueue_migration(&item.item_id, &item.frame_id, target, 1, now, now)?;
                enqueued += 1;
            }
        }
        Ok(enqueued)
    }

    fn process_entry(&self, entry: &QueueEntry, now: DateTime<Utc>) -> Result<MigrationOutcome> {
        let Some(item) = self.store.get_storage_item(&entry.item_id)? else {
            // Item pruned since enqueue; nothing to do.
            self.store.delete_queue_entry(entry.queue_id)?;
            return Ok(MigrationOutcome::AlreadyDone);
        };

        // Tier never regresses; a replayed entry for a finished migration is
        // consumed without touching the row.
        if item.tier >= entry.target_tier {
            self.store.delete_queue_entry(entry.queue_id)?;
            return Ok(MigrationOutcome::AlreadyDone);
        }

        if entry.target_tier == Tier::Archive && !self.config.archive_retention {
            // Open-ended retention is opt-in; otherwise the archive step is
            // the whole-frame prune.
            self.store.prune_frame(&entry.frame_id)?;
            debug!(frame_id = %entry.frame_id, "pruned frame at archive boundary");
            return Ok(MigrationOutcome::Pruned);
        }

        let raw = codec::decode(&item.blob, item.compression)?;
        let snapshot = FrameSnapshot::from_bytes(&raw)?;
        let retained = apply_retention(snapshot, entry.target_tier);
        let encoded = codec::encode(&retained.to_bytes()?, entry.target_tier.compression())?;

        self.store.commit_migration(
            entry.queue_id,
            &entry.item_id,
            entry.target_tier,
            &encoded,
            entry.target_tier.compression(),
            now,
        )?;
        Ok(MigrationOutcome::Migrated)
    }

    fn spill_offline(&self, entry: &QueueEntry, error: &EngineError, now: DateTime<Utc>) {
        let line = serde_json::json!({
            "itemId": entry.item_id,
            "frameId": entry.frame_id,
            "targetTier": entry.target_tier.as_str(),
            "attempts": entry.attempts + 1,
            "error": error.to_string(),
            "spilledAt": now,
        });
        let path = self.paths.offline_queue();
        let written = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .and_then(|mut f| writeln!(f, "{}", line));
        match written {
            Ok(()) => warn!(item_id = %entry.item_id, "migration exhausted retries; spilled to offline queue"),
            Err(e) => warn!(item_id = %entry.item_id, error = %e, "failed to spill migration to offline queue"),
        }
    }

    // ========================================================================
    // READ PATH & PROMOTION
    // ========================================================================

    /// Decode the stored snapshot for a frame. Repeated cold reads within an
    /// hour promote the decoded form into an in-memory cache; the stored tier
    /// is never rewritten by reads.
    pub fn fetch_snapshot(&self, frame_id: &str, now: DateTime<Utc>) -> Result<Option<FrameSnapshot>> {
        if let Ok(cache) = self.hot_cache.lock() {
            if let Some(snapshot) = cache.get(frame_id) {
                return Ok(Some(snapshot.clone()));
            }
        }

        let Some(item) = self.store.get_storage_item_by_frame(frame_id)? else {
            return Ok(None);
        };
        let raw = codec::decode(&item.blob, item.compression)?;
        let snapshot = FrameSnapshot::from_bytes(&raw)?;

        if item.tier > Tier::Young && self.record_access(frame_id, now) > PROMOTION_THRESHOLD {
            if let Ok(mut cache) = self.hot_cache.lock() {
                cache.insert(frame_id.to_string(), snapshot.clone());
                debug!(frame_id, "promoted cold frame into hot cache");
            }
        }

        Ok(Some(snapshot))
    }

    fn record_access(&self, frame_id: &str, now: DateTime<Utc>) -> usize {
        let mut log = match self.access_log.lock() {
            Ok(log) => log,
            Err(_) => return 0,
        };
        let cutoff = now - PROMOTION_WINDOW;
        let accesses = log.entry(frame_id.to_string()).or_default();
        accesses.retain(|t| *t >= cutoff);
        accesses.push(now);
        accesses.len()
    }
}

enum MigrationOutcome {
    Migrated,
    Pruned,
    AlreadyDone,
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{
        build_digest, Event, EventType, Frame, FrameState, FrameType,
    };
    use crate::identity::Session;
    use tempfile::TempDir;

    fn setup() -> (TierManager, Arc<Store>, Session, TempDir) {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(Store::open(&dir.path().join("context.db")).unwrap());
        let session = Session::new("proj-1".to_string(), None, Utc::now());
        store.insert_session(&session).unwrap();
        let paths = Paths::with_home(dir.path().to_path_buf(), dir.path().join("home"));
        std::fs::create_dir_all(&paths.home_dir).unwrap();
        let manager = TierManager::new(
            Arc::clone(&store),
            Arc::new(EngineConfig::default()),
            FrameLocks::new(),
            paths,
        );
        (manager, store, session, dir)
    }

    fn close_frame_with_events(store: &Store, session: &Session, name: &str, n_events: usize) -> Frame {
        let now = Utc::now();
        let frame = Frame {
            frame_id: uuid::Uuid::new_v4().to_string(),
            session_id: session.session_id.clone(),
            project_id: session.project_id.clone(),
            parent_frame_id: None,
            frame_type: FrameType::Task,
            name: name.to_string(),
            created_at: now,
            closed_at: None,
            state: FrameState::Active,
            depth: 0,
            constraints: vec![],
            definitions: serde_json::json!({}),
            inputs: serde_json::json!({}),
            outputs: serde_json::json!({}),
            digest: None,
            importance_score: None,
        };
        let open = Event {
            event_id: uuid::Uuid::new_v4().to_string(),
            frame_id: frame.frame_id.clone(),
            event_type: EventType::Note,
            payload: serde_json::json!({"text": "frame opened"}),
            ts: now,
        };
        store.create_frame(&frame, &open).unwrap();

        let mut events = vec![open];
        for i in 0..n_events {
            let event = Event {
                event_id: uuid::Uuid::new_v4().to_string(),
                frame_id: frame.frame_id.clone(),
                event_type: if i % 2 == 0 { EventType::ToolCall } else { EventType::ToolResult },
                payload: serde_json::json!({
                    "tool": "Bash",
                    "output": "the quick brown fox jumps over the lazy dog ".repeat(8),
                }),
                ts: Utc::now(),
            };
            store.append_event(&event, &session.project_id).unwrap();
            events.push(event);
        }

        let digest = build_digest(&frame, &events, &[], None);
        let snapshot = FrameSnapshot {
            frame: frame.clone(),
            events,
            anchors: vec![],
        };
        store
            .close_frame_atomic(
                &frame.frame_id,
                now,
                &digest,
                1,
                &snapshot.to_bytes().unwrap(),
                now + Duration::hours(24),
                true,
            )
            .unwrap();
        frame
    }

    #[test]
    fn test_tier_order_and_codecs() {
        assert!(Tier::Young < Tier::Mature);
        assert!(Tier::Old < Tier::Archive);
        assert_eq!(Tier::Young.next(), Some(Tier::Mature));
        assert_eq!(Tier::Archive.next(), None);
        assert_eq!(Tier::Young.compression(), Compression::None);
        assert_eq!(Tier::Mature.compression(), Compression::Lz4);
        assert_eq!(Tier::Old.compression(), Compression::Zstd);
    }

    #[test]
    fn test_aged_frames_migrate_to_mature_with_lz4() {
        let (manager, store, session, _dir) = setup();
        let mut frames = Vec::new();
        for i in 0..100 {
            frames.push(close_frame_with_events(&store, &session, &format!("f{}", i), 4));
        }
        let sizes_before: Vec<u64> = frames
            .iter()
            .map(|f| store.get_storage_item_by_frame(&f.frame_id).unwrap().unwrap().size_bytes)
            .collect();

        // Not due yet: a tick right now migrates nothing.
        let report = manager.run_once(Utc::now()).unwrap();
        assert_eq!(report.migrated, 0);

        // 25h later everything crosses the young window. Two ticks because
        // the batch size is 50.
        let later = Utc::now() + Duration::hours(25);
        let first = manager.run_once(later).unwrap();
        let second = manager.run_once(later).unwrap();
        assert_eq!(first.migrated + second.migrated, 100);

        for (frame, before) in frames.iter().zip(sizes_before) {
            let item = store.get_storage_item_by_frame(&frame.frame_id).unwrap().unwrap();
            assert_eq!(item.tier, Tier::Mature);
            assert_eq!(item.compression, Compression::Lz4);
            assert!(before >= 256, "test payloads should be non-trivial");
            assert!(item.size_bytes < before, "lz4 must shrink {}B payloads", before);
        }
        assert_eq!(store.queue_len().unwrap(), 0);
    }

    #[test]
    fn test_mature_retention_truncates_tool_results() {
        let (manager, store, session, _dir) = setup();
        let frame = close_frame_with_events(&store, &session, "chatty", 6);

        let later = Utc::now() + Duration::hours(25);
        manager.run_once(later).unwrap();

        let snapshot = manager.fetch_snapshot(&frame.frame_id, later).unwrap().unwrap();
        let tool_results: Vec<_> = snapshot
            .events
            .iter()
            .filter(|e| e.event_type == EventType::ToolResult)
            .collect();
        assert!(!tool_results.is_empty());
        for event in tool_results {
            assert_eq!(event.payload, serde_json::json!({"truncated": true}));
        }
        // tool_call payloads survive the mature tier.
        assert!(snapshot
            .events
            .iter()
            .any(|e| e.event_type == EventType::ToolCall && e.payload.get("tool").is_some()));
    }

    #[test]
    fn test_old_retention_keeps_critical_only() {
        let snapshot = {
            let (_, store, session, _dir) = setup();
            let frame = close_frame_with_events(&store, &session, "old", 4);
            let item = store.get_storage_item_by_frame(&frame.frame_id).unwrap().unwrap();
            FrameSnapshot::from_bytes(&codec::decode(&item.blob, item.compression).unwrap()).unwrap()
        };
        let retained = apply_retention(snapshot, Tier::Old);
        assert!(retained
            .events
            .iter()
            .all(|e| matches!(e.event_type, EventType::DecisionLog | EventType::Error)));
    }

    #[test]
    fn test_tier_never_regresses() {
        let (manager, store, session, _dir) = setup();
        let frame = close_frame_with_events(&store, &session, "mono", 2);
        let item = store.get_storage_item_by_frame(&frame.frame_id).unwrap().unwrap();

        let later = Utc::now() + Duration::hours(25);
        manager.run_once(later).unwrap();
        let migrated = store.get_storage_item_by_frame(&frame.frame_id).unwrap().unwrap();
        assert_eq!(migrated.tier, Tier::Mature);

        // A stale replayed entry targeting the tier it already reached is a
        // no-op, not a rewrite.
        store
            .enqueue_migration(&item.item_id, &frame.frame_id, Tier::Mature, 0, later, later)
            .unwrap();
        let report = manager.run_once(later).unwrap();
        assert_eq!(report.migrated, 0);
        let after = store.get_storage_item_by_frame(&frame.frame_id).unwrap().unwrap();
        assert_eq!(after.tier, Tier::Mature);
        assert_eq!(after.migrated_at, migrated.migrated_at);
    }

    #[test]
    fn test_archive_without_retention_prunes() {
        let (manager, store, session, _dir) = setup();
        let frame = close_frame_with_events(&store, &session, "ephemeral", 2);

        // Walk it young -> mature -> old -> archive. Each later tick is far
        // enough past the previous migration to clear that tier's window.
        manager.run_once(Utc::now() + Duration::hours(25)).unwrap();
        manager.run_once(Utc::now() + Duration::days(9)).unwrap();
        manager.run_once(Utc::now() + Duration::days(40)).unwrap();

        assert!(store.get_frame(&frame.frame_id).unwrap().is_none());
        assert!(store.get_storage_item_by_frame(&frame.frame_id).unwrap().is_none());
    }

    #[test]
    fn test_archive_with_retention_keeps_zstd_blob() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(Store::open(&dir.path().join("context.db")).unwrap());
        let session = Session::new("proj-1".to_string(), None, Utc::now());
        store.insert_session(&session).unwrap();
        let mut config = EngineConfig::default();
        config.archive_retention = true;
        let paths = Paths::with_home(dir.path().to_path_buf(), dir.path().join("home"));
        std::fs::create_dir_all(&paths.home_dir).unwrap();
        let manager = TierManager::new(Arc::clone(&store), Arc::new(config), FrameLocks::new(), paths);

        let frame = close_frame_with_events(&store, &session, "kept", 2);
        manager.run_once(Utc::now() + Duration::hours(25)).unwrap();
        manager.run_once(Utc::now() + Duration::days(9)).unwrap();
        manager.run_once(Utc::now() + Duration::days(40)).unwrap();

        let item = store.get_storage_item_by_frame(&frame.frame_id).unwrap().unwrap();
        assert_eq!(item.tier, Tier::Archive);
        assert_eq!(item.compression, Compression::Zstd);
    }

    #[test]
    fn test_locked_frame_is_skipped_not_failed() {
        let (manager, store, session, _dir) = setup();
        let frame = close_frame_with_events(&store, &session, "busy", 2);

        let _guard = manager.locks.lock(&frame.frame_id).unwrap();
        let report = manager.run_once(Utc::now() + Duration::hours(25)).unwrap();
        assert_eq!(report.migrated, 0);
        assert_eq!(report.skipped_locked, 1);
        assert_eq!(report.failed, 0);
        // Entry is still queued for the next tick.
        assert_eq!(store.queue_len().unwrap(), 1);
    }

    #[test]
    fn test_corrupt_blob_backs_off_then_spills() {
        let (manager, store, session, _dir) = setup();
        let frame = close_frame_with_events(&store, &session, "corrupt", 2);
        let item = store.get_storage_item_by_frame(&frame.frame_id).unwrap().unwrap();

        // Stamp the row lz4 while the blob is tagged none.
        store
            .commit_migration(
                -1,
                &item.item_id,
                Tier::Young,
                &item.blob,
                Compression::Lz4,
                Utc::now(),
            )
            .unwrap();
        // commit_migration consumed no real queue entry (id -1); re-enqueue.
        store
            .enqueue_migration(&item.item_id, &frame.frame_id, Tier::Mature, 0, Utc::now(), Utc::now())
            .unwrap();

        // Eight ticks: four backoffs, the fifth attempt spills, and the
        // parked entry is never retried after that.
        let mut when = Utc::now() + Duration::hours(25);
        let mut spilled = 0;
        for _ in 0..8 {
            let report = manager.run_once(when).unwrap();
            spilled += report.spilled;
            when = when + Duration::days(2);
        }
        assert_eq!(spilled, 1);
        // The entry stays parked so the age sweep cannot resurrect it.
        assert_eq!(store.queue_len().unwrap(), 1);
        assert!(manager.paths.offline_queue().exists());
        let contents = std::fs::read_to_string(manager.paths.offline_queue()).unwrap();
        assert!(contents.contains(&item.item_id));
    }

    #[test]
    fn test_promotion_caches_after_repeated_cold_reads() {
        let (manager, store, session, _dir) = setup();
        let frame = close_frame_with_events(&store, &session, "popular", 2);
        let later = Utc::now() + Duration::hours(25);
        manager.run_once(later).unwrap();
        let tier_before = store.get_storage_item_by_frame(&frame.frame_id).unwrap().unwrap().tier;

        for _ in 0..5 {
            manager.fetch_snapshot(&frame.frame_id, later).unwrap().unwrap();
        }
        assert!(manager.hot_cache.lock().unwrap().contains_key(&frame.frame_id));
        // Reads never rewrite the stored tier.
        let tier_after = store.get_storage_item_by_frame(&frame.frame_id).unwrap().unwrap().tier;
        assert_eq!(tier_before, tier_after);
    }
}
