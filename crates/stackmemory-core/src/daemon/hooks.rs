//! Lifecycle Hooks
//!
//! User code subscribes to engine lifecycle events and receives them with
//! bounded debounce and per-hook cooldown. A handler that fails is logged
//! and stays registered; one that overruns its wall budget is abandoned and
//! marked degraded for that invocation.

use std::sync::{Arc, Mutex};
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

// ============================================================================
// EVENTS
// ============================================================================

/// Subscribable lifecycle moments
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HookKind {
    SessionStart,
    FileChange,
    ContextSwitch,
    SessionEnd,
    FrameClosed,
    SuggestionReady,
}

impl HookKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            HookKind::SessionStart => "session_start",
            HookKind::FileChange => "file_change",
            HookKind::ContextSwitch => "context_switch",
            HookKind::SessionEnd => "session_end",
            HookKind::FrameClosed => "frame_closed",
            HookKind::SuggestionReady => "suggestion_ready",
        }
    }

    pub fn parse_name(s: &str) -> Option<Self> {
        match s {
            "session_start" => Some(HookKind::SessionStart),
            "file_change" => Some(HookKind::FileChange),
            "context_switch" => Some(HookKind::ContextSwitch),
            "session_end" => Some(HookKind::SessionEnd),
            "frame_closed" => Some(HookKind::FrameClosed),
            "suggestion_ready" => Some(HookKind::SuggestionReady),
            _ => None,
        }
    }
}

/// One event on the internal bus
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HookEvent {
    pub kind: HookKind,
    pub payload: Value,
    pub ts: DateTime<Utc>,
}

impl HookEvent {
    pub fn new(kind: HookKind, payload: Value) -> Self {
        Self {
            kind,
            payload,
            ts: Utc::now(),
        }
    }
}

// ============================================================================
// REGISTRY
// ============================================================================

/// Handler callback. Runs off the caller's thread; must be Send + Sync.
pub type HookFn = Arc<dyn Fn(&HookEvent) -> std::result::Result<(), String> + Send + Sync>;

struct HandlerState {
    id: String,
    kind: HookKind,
    callback: HookFn,
    cooldown_until: Option<Instant>,
    degraded_invocations: u64,
}

/// Registered handlers with cooldown bookkeeping
#[derive(Default)]
pub struct HookRegistry {
    handlers: Mutex<Vec<HandlerState>>,
}

impl HookRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Register a handler; the returned id unregisters it.
    pub fn register(&self, kind: HookKind, callback: HookFn) -> String {
        let id = uuid::Uuid::new_v4().to_string();
        if let Ok(mut handlers) = self.handlers.lock() {
            handlers.push(HandlerState {
                id: id.clone(),
                kind,
                callback,
                cooldown_until: None,
                degraded_invocations: 0,
            });
        }
        id
    }

    pub fn unregister(&self, id: &str) -> bool {
        match self.handlers.lock() {
            Ok(mut handlers) => {
                let before = handlers.len();
                handlers.retain(|h| h.id != id);
                handlers.len() != before
            }
            Err(_) => false,
        }
    }

    pub fn len(&self) -> usize {
        self.handlers.lock().map(|h| h.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Handler ids subscribed to a kind (cooldown state not consulted here;
    /// the dispatcher owns timing).
    pub fn subscribers(&self, kind: HookKind) -> Vec<String> {
        self.handlers
            .lock()
            .map(|handlers| {
                handlers
                    .iter()
                    .filter(|h| h.kind == kind)
                    .map(|h| h.id.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Callback for a handler id, if still registered.
    pub fn callback(&self, id: &str) -> Option<HookFn> {
        self.handlers
            .lock()
            .ok()?
            .iter()
            .find(|h| h.id == id)
            .map(|h| Arc::clone(&h.callback))
    }

    /// True when the handler is free to run now; arms the cooldown when so.
    pub fn try_begin_invocation(&self, id: &str, now: Instant, cooldown: std::time::Duration) -> bool {
        let Ok(mut handlers) = self.handlers.lock() else {
            return false;
        };
        let Some(handler) = handlers.iter_mut().find(|h| h.id == id) else {
            return false;
        };
        if handler.cooldown_until.is_some_and(|until| now < until) {
            return false;
        }
        handler.cooldown_until = Some(now + cooldown);
        true
    }

    /// Mark one abandoned (over-budget) invocation.
    pub fn mark_degraded(&self, id: &str) {
        if let Ok(mut handlers) = self.handlers.lock() {
            if let Some(handler) = handlers.iter_mut().find(|h| h.id == id) {
                handler.degraded_invocations += 1;
            }
        }
    }

    pub fn degraded_invocations(&self, id: &str) -> u64 {
        self.handlers
            .lock()
            .ok()
            .and_then(|handlers| {
                handlers
                    .iter()
                    .find(|h| h.id == id)
                    .map(|h| h.degraded_invocations)
            })
            .unwrap_or(0)
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[test]
    fn test_register_and_unregister() {
        let registry = HookRegistry::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_in = Arc::clone(&calls);
        let id = registry.register(
            HookKind::FrameClosed,
            Arc::new(move |_| {
                calls_in.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }),
        );
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.subscribers(HookKind::FrameClosed), vec![id.clone()]);
        assert!(registry.subscribers(HookKind::FileChange).is_empty());

        assert!(registry.unregister(&id));
        assert!(!registry.unregister(&id));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_cooldown_gates_invocations() {
        let registry = HookRegistry::new();
        let id = registry.register(HookKind::FileChange, Arc::new(|_| Ok(())));
        let now = Instant::now();
        let cooldown = Duration::from_secs(10);

        assert!(registry.try_begin_invocation(&id, now, cooldown));
        assert!(!registry.try_begin_invocation(&id, now + Duration::from_secs(5), cooldown));
        assert!(registry.try_begin_invocation(&id, now + Duration::from_secs(11), cooldown));
    }

    #[test]
    fn test_degraded_counter() {
        let registry = HookRegistry::new();
        let id = registry.register(HookKind::SuggestionReady, Arc::new(|_| Ok(())));
        assert_eq!(registry.degraded_invocations(&id), 0);
        registry.mark_degraded(&id);
        registry.mark_degraded(&id);
        assert_eq!(registry.degraded_invocations(&id), 2);
    }

    #[test]
    fn test_kind_roundtrip() {
        for kind in [
            HookKind::SessionStart,
            HookKind::FileChange,
            HookKind::ContextSwitch,
            HookKind::SessionEnd,
            HookKind::FrameClosed,
            HookKind::SuggestionReady,
        ] {
            assert_eq!(HookKind::parse_name(kind.as_str()), Some(kind));
        }
    }
}
