//! Retriever
//!
//! Answers `get_context` with a token-bounded bundle. Stage order: anchor
//! sweep, hot-stack slice, query routing, lexical re-rank, optional semantic
//! augmentation, assembly. Every stage past the anchor sweep is best-effort;
//! a stage that errors or misses the deadline is skipped and noted, never
//! fatal.

pub mod fuse;
pub mod tokens;

use std::collections::{HashMap, HashSet};
use std::sync::mpsc;
use std::sync::Arc;
use std::time::{Duration as StdDuration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use crate::config::EngineConfig;
use crate::error::Result;
use crate::frame::{AnchorType, Event, EventType, Frame, FrameManager, FrameType};
use crate::storage::Store;
use crate::tier::TierManager;

pub use fuse::{reciprocal_rank_fusion, RRF_K};
pub use tokens::{BytesPerToken, TokenEstimator};

/// Lexical candidates fetched before re-ranking
const LEXICAL_FETCH_LIMIT: usize = 50;

/// Semantic neighbors requested from the index
const SEMANTIC_TOP_K: usize = 20;

/// Raw events included per frame when no digest exists
const EVENTS_PER_BARE_FRAME: usize = 3;

// ============================================================================
// SEMANTIC INDEX SEAM
// ============================================================================

/// Optional external similarity index. Providers live outside the engine;
/// the retriever only needs ranked frame ids.
pub trait SemanticIndex: Send + Sync + 'static {
    /// Top-k frames similar to the query, best first.
    fn similar(&self, query: &str, k: usize) -> std::result::Result<Vec<(String, f32)>, String>;
}

// ============================================================================
// REQUEST / RESPONSE SHAPES
// ============================================================================

/// Optional narrowing of retrieval results
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ContextFilters {
    /// Restrict lexical hits to frames of this type
    pub frame_type: Option<FrameType>,
    /// Restrict lexical hits to frames created after this point
    pub since: Option<DateTime<Utc>>,
}

/// A `get_context` request
#[derive(Debug, Clone)]
pub struct ContextRequest {
    pub query: Option<String>,
    pub budget_tokens: usize,
    pub filters: ContextFilters,
    /// Cooperative deadline; the retriever truncates rather than breach it
    pub deadline: Option<Instant>,
}

impl ContextRequest {
    pub fn new(query: Option<String>, budget_tokens: usize) -> Self {
        Self {
            query,
            budget_tokens,
            filters: ContextFilters::default(),
            deadline: None,
        }
    }
}

/// Anchor as it appears in a bundle
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnchorRef {
    #[serde(rename = "type")]
    pub anchor_type: AnchorType,
    pub text: String,
    pub priority: u8,
}

/// Hot-stack frame as it appears in a bundle
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HotFrameSlice {
    pub frame_id: String,
    pub name: String,
    pub frame_type: FrameType,
    pub depth: usize,
    pub constraints: Vec<String>,
    pub recent_events: Vec<Value>,
}

/// Re-ranked search result as it appears in a bundle
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DigestHit {
    pub frame_id: String,
    pub name: String,
    /// Stored digest when present, else a small raw-event preview
    pub summary: Value,
    pub score: f64,
}

/// The assembled, token-bounded retrieval result
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContextBundle {
    pub hot_stack: Vec<HotFrameSlice>,
    pub anchors: Vec<AnchorRef>,
    pub relevant_digests: Vec<DigestHit>,
    pub pointers: Vec<Value>,
    pub total_tokens: usize,
    pub truncated: bool,
    pub metadata: Value,
}

// ============================================================================
// QUERY ROUTING
// ============================================================================

/// How a query string is handled
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum QueryMode {
    /// No query: anchors + hot stack only
    Empty,
    /// Identifier-ish: lexical match only
    Exact,
    /// Natural-language prose: lexical plus semantic augmentation
    Semantic,
}

/// Classify a query. Questions and multi-word prose route to semantic mode;
/// short or symbol-heavy strings (code, identifiers, paths) stay exact.
pub fn classify_query(query: &str) -> QueryMode {
    let trimmed = query.trim();
    if trimmed.is_empty() {
        return QueryMode::Empty;
    }

    let lower = trimmed.to_lowercase();
    let is_question = trimmed.contains('?')
        || lower.starts_with("what ")
        || lower.starts_with("how ")
        || lower.starts_with("why ")
        || lower.starts_with("when ")
        || lower.starts_with("where ");

    let has_code_chars = trimmed
        .chars()
        .any(|c| matches!(c, '(' | ')' | '{' | '}' | '=' | ';' | ':' | '/' | '\\'))
        || trimmed.contains("::")
        || trimmed.contains('_');

    let word_count = trimmed.split_whitespace().count();

    if is_question || (word_count >= 3 && !has_code_chars) {
        QueryMode::Semantic
    } else {
        QueryMode::Exact
    }
}

// ============================================================================
// RETRIEVER
// ============================================================================

/// Query router and bundle assembler
pub struct Retriever {
    store: Arc<Store>,
    config: Arc<EngineConfig>,
    tiers: Arc<TierManager>,
    semantic: Option<Arc<dyn SemanticIndex>>,
    estimator: Arc<dyn TokenEstimator>,
}

impl Retriever {
    pub fn new(
        store: Arc<Store>,
        config: Arc<EngineConfig>,
        tiers: Arc<TierManager>,
        semantic: Option<Arc<dyn SemanticIndex>>,
    ) -> Self {
        let estimator: Arc<dyn TokenEstimator> =
            Arc::new(BytesPerToken(config.bytes_per_token));
        Self {
            store,
            config,
            tiers,
            semantic,
            estimator,
        }
    }

    /// Swap in a real tokenizer.
    pub fn with_estimator(mut self, estimator: Arc<dyn TokenEstimator>) -> Self {
        self.estimator = estimator;
        self
    }

    fn expired(deadline: Option<Instant>) -> bool {
        deadline.is_some_and(|d| Instant::now() >= d)
    }

    /// Assemble a context bundle for the manager's session. Always returns at
    /// least the anchor sweep.
    pub fn get_context(&self, manager: &FrameManager, request: &ContextRequest) -> Result<ContextBundle> {
        let budget = request.budget_tokens;
        let session = manager.session();
        let mut used = 0usize;
        let mut truncated = false;
        let mut degraded: Vec<&'static str> = Vec::new();

        // -- Stage 1: anchor sweep (never skipped) ---------------------------
        // Store order is (priority desc, created desc), so packing a prefix
        // keeps the no-priority-inversion property.
        let anchor_budget = (budget as f64 * self.config.anchor_budget_fraction) as usize;
        let mut anchors = Vec::new();
        for anchor in self.store.anchors_for_active_stack(&session.session_id)? {
            let cost = self.estimator.estimate(&anchor.text);
            if used + cost > anchor_budget {
                truncated = true;
                break;
            }
            used += cost;
            anchors.push(AnchorRef {
                anchor_type: anchor.anchor_type,
                text: anchor.text,
                priority: anchor.priority,
            });
        }

        // -- Stage 2: hot-stack slice ----------------------------------------
        let mut hot_stack = Vec::new();
        if !Self::expired(request.deadline) {
            let stack_budget = ((budget - used) as f64 * self.config.hot_stack_fraction) as usize;
            let mut stack_used = 0usize;
            match manager.get_hot_stack(10) {
                Ok(hot) => {
                    // Top of the stack first; it is the live context.
                    for hot_frame in hot.frames.into_iter().rev() {
                        let slice = HotFrameSlice {
                            frame_id: hot_frame.frame.frame_id.clone(),
                            name: hot_frame.frame.name.clone(),
                            frame_type: hot_frame.frame.frame_type,
                            depth: hot_frame.depth,
                            constraints: hot_frame.frame.constraints.clone(),
                            recent_events: hot_frame
                                .recent_events
                                .iter()
                                .map(|e| serde_json::json!({"type": e.event_type.as_str(), "payload": e.payload}))
                                .collect(),
                        };
                        let cost = self.estimator.estimate(
                            &serde_json::to_string(&slice).unwrap_or_default(),
                        );
                        if stack_used + cost > stack_budget {
                            truncated = true;
                            break;
                        }
                        stack_used += cost;
                        hot_stack.push(slice);
                    }
                    used += stack_used;
                }
                Err(e) => {
                    warn!(error = %e, "hot-stack stage failed; continuing without it");
                    degraded.push("hot_stack");
                }
            }
        } else {
            truncated = true;
        }

        // -- Stage 3: query routing ------------------------------------------
        let query = request.query.as_deref().unwrap_or("");
        let mode = classify_query(query);

        // -- Stages 4+5: candidate ranking -----------------------------------
        let mut candidates: Vec<(String, f64)> = Vec::new();
        if mode != QueryMode::Empty && !Self::expired(request.deadline) {
            match self.lexical_candidates(query, &session.project_id, &request.filters) {
                Ok(lexical) => {
                    candidates = lexical;
                }
                Err(e) => {
                    warn!(error = %e, "lexical stage failed; continuing without it");
                    degraded.push("lexical");
                }
            }

            if mode == QueryMode::Semantic {
                match self.semantic_candidates(query, request.deadline) {
                    Some(semantic) => {
                        let lexical_f32: Vec<(String, f32)> = candidates
                            .iter()
                            .map(|(id, s)| (id.clone(), *s as f32))
                            .collect();
                        candidates = reciprocal_rank_fusion(&lexical_f32, &semantic, RRF_K)
                            .into_iter()
                            .map(|(id, s)| (id, s as f64))
                            .collect();
                    }
                    None => {
                        if self.semantic.is_some() {
                            degraded.push("semantic");
                        }
                    }
                }
            }
        }

        // -- Stage 6: assembly ------------------------------------------------
        let mut relevant_digests = Vec::new();
        let in_hot: HashSet<&str> = hot_stack.iter().map(|h| h.frame_id.as_str()).collect();
        for (frame_id, score) in candidates {
            if Self::expired(request.deadline) {
                truncated = true;
                break;
            }
            if in_hot.contains(frame_id.as_str()) {
                continue;
            }
            let Ok(Some(frame)) = self.store.get_frame(&frame_id) else {
                continue;
            };
            let summary = match &frame.digest {
                Some(digest) => serde_json::to_value(digest).unwrap_or(Value::Null),
                // No stored digest: read the tier snapshot (counting the
                // cold access for promotion), else fall back to the event log.
                None => match self.tiers.fetch_snapshot(&frame_id, Utc::now()) {
                    Ok(Some(snapshot)) => Self::event_preview_of(&snapshot.events),
                    _ => self.event_preview(&frame),
                },
            };
            let hit = DigestHit {
                frame_id: frame.frame_id.clone(),
                name: frame.name.clone(),
                summary,
                score,
            };
            let cost = self
                .estimator
                .estimate(&serde_json::to_string(&hit).unwrap_or_default());
            if used + cost > budget {
                truncated = true;
                break;
            }
            used += cost;
            relevant_digests.push(hit);
        }

        debug!(
            mode = ?mode,
            anchors = anchors.len(),
            hot = hot_stack.len(),
            hits = relevant_digests.len(),
            tokens = used,
            truncated,
            "assembled context bundle"
        );

        Ok(ContextBundle {
            hot_stack,
            anchors,
            relevant_digests,
            pointers: Vec::new(),
            total_tokens: used,
            truncated,
            metadata: serde_json::json!({
                "queryMode": mode,
                "estimator": self.estimator.name(),
                "weights": {
                    "bm25": self.config.weight_bm25,
                    "importance": self.config.weight_importance,
                    "recency": self.config.weight_recency,
                    "recencyHalfLifeDays": self.config.recency_half_life_days,
                },
                "degradedStages": degraded,
            }),
        })
    }

    /// Full-text hits grouped by frame and re-ranked by
    /// `α·bm25 + β·importance + γ·recency`.
    fn lexical_candidates(
        &self,
        query: &str,
        project_id: &str,
        filters: &ContextFilters,
    ) -> Result<Vec<(String, f64)>> {
        let hits = self.store.search_fulltext(query, project_id, LEXICAL_FETCH_LIMIT)?;
        if hits.is_empty() {
            return Ok(Vec::new());
        }

        let mut best_bm25: HashMap<String, f64> = HashMap::new();
        for hit in &hits {
            let entry = best_bm25.entry(hit.frame_id.clone()).or_insert(f64::MIN);
            if hit.bm25 > *entry {
                *entry = hit.bm25;
            }
        }
        let max_bm25 = best_bm25
            .values()
            .fold(f64::MIN, |acc, v| acc.max(*v))
            .max(f64::EPSILON);

        let now = Utc::now();
        let half_life = self.config.recency_half_life_days.max(0.01);
        let mut scored: Vec<(String, f64, Option<DateTime<Utc>>)> = Vec::new();
        for (frame_id, bm25) in best_bm25 {
            let Some(frame) = self.store.get_frame(&frame_id)? else {
                continue;
            };
            if let Some(wanted) = filters.frame_type {
                if frame.frame_type != wanted {
                    continue;
                }
            }
            if let Some(since) = filters.since {
                if frame.created_at < since {
                    continue;
                }
            }

            let importance = (frame.importance_score.unwrap_or(0) as f64 / 100.0).clamp(0.0, 1.0);
            let reference = frame.closed_at.unwrap_or(frame.created_at);
            let age_days = (now - reference).num_seconds().max(0) as f64 / 86_400.0;
            let recency = 0.5_f64.powf(age_days / half_life);

            let score = self.config.weight_bm25 * (bm25 / max_bm25).max(0.0)
                + self.config.weight_importance * importance
                + self.config.weight_recency * recency;
            scored.push((frame_id, score, frame.closed_at));
        }

        // Ties break toward the most recently closed.
        scored.sort_by(|a, b| {
            b.1.partial_cmp(&a.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| b.2.cmp(&a.2))
        });
        Ok(scored.into_iter().map(|(id, score, _)| (id, score)).collect())
    }

    /// Query the semantic index on a helper thread under the configured
    /// timeout (and the request deadline when tighter). `None` means skip.
    fn semantic_candidates(
        &self,
        query: &str,
        deadline: Option<Instant>,
    ) -> Option<Vec<(String, f32)>> {
        let index = self.semantic.clone()?;

        let mut timeout = StdDuration::from_millis(self.config.semantic_timeout_ms);
        if let Some(deadline) = deadline {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return None;
            }
            timeout = timeout.min(remaining);
        }

        let (tx, rx) = mpsc::channel();
        let query = query.to_string();
        std::thread::spawn(move || {
            let _ = tx.send(index.similar(&query, SEMANTIC_TOP_K));
        });

        match rx.recv_timeout(timeout) {
            Ok(Ok(results)) => Some(results),
            Ok(Err(e)) => {
                warn!(error = %e, "semantic index error; stage skipped");
                None
            }
            Err(_) => {
                warn!(timeout_ms = timeout.as_millis() as u64, "semantic index timed out; stage skipped");
                None
            }
        }
    }

    /// Raw-event preview for frames without a digest: the highest-signal
    /// events first, deterministically.
    fn event_preview(&self, frame: &Frame) -> Value {
        let events = match self.store.events_for_frame(&frame.frame_id) {
            Ok(events) => events,
            Err(_) => Vec::new(),
        };
        Self::event_preview_of(&events)
    }

    fn event_preview_of(events: &[Event]) -> Value {
        let mut ranked: Vec<&Event> = events.iter().collect();
        ranked.sort_by_key(|e| {
            let weight = match e.event_type {
                EventType::DecisionLog => 0,
                EventType::Error => 1,
                EventType::AnchorAdd => 2,
                EventType::ToolCall => 3,
                EventType::ToolResult => 4,
                EventType::Note => 5,
            };
            (weight, std::cmp::Reverse(e.ts))
        });
        let preview: Vec<Value> = ranked
            .into_iter()
            .take(EVENTS_PER_BARE_FRAME)
            .map(|e| serde_json::json!({"type": e.event_type.as_str(), "payload": e.payload}))
            .collect();
        serde_json::json!({"events": preview})
    }
}

// ============================================================================
// TESTS
// ============================================================================
