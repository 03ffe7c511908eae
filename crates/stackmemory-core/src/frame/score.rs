//! Importance Scorer
//!
//! Pure function over a frame's history, used by the tier layer for
//! retention and by retrieval for ranking. Signals are additive; the result
//! spans roughly 0..100 for typical frames and is clamped non-negative.

use chrono::{DateTime, Utc};

use super::digest::unresolved_error_count;
use super::{Anchor, AnchorType, Event, EventType, Frame};

/// Weight per DECISION anchor
const DECISION_WEIGHT: i64 = 10;
/// Weight per CONSTRAINT or INTERFACE_CONTRACT anchor
const CONTRACT_WEIGHT: i64 = 15;
/// Weight per error event still unresolved at close
const UNRESOLVED_ERROR_WEIGHT: i64 = 5;
/// Weight per tool_call event
const TOOL_CALL_WEIGHT: i64 = 1;
/// Flat bonus for any activity at all
const ACTIVITY_BONUS: i64 = 2;
/// Penalty for frames open under 30s with at most one event
const SHORT_FRAME_PENALTY: i64 = -3;
/// Lifetime below which the short-frame penalty applies
const SHORT_FRAME_SECS: i64 = 30;

/// Compute the importance score for a closing frame.
pub fn importance_score(
    frame: &Frame,
    events: &[Event],
    anchors: &[Anchor],
    closed_at: DateTime<Utc>,
) -> i64 {
    let mut score: i64 = 0;

    for anchor in anchors {
        score += match anchor.anchor_type {
            AnchorType::Decision => DECISION_WEIGHT,
            AnchorType::Constraint | AnchorType::InterfaceContract => CONTRACT_WEIGHT,
            _ => 0,
        };
    }

    score += unresolved_error_count(events) as i64 * UNRESOLVED_ERROR_WEIGHT;
    score += events
        .iter()
        .filter(|e| e.event_type == EventType::ToolCall)
        .count() as i64
        * TOOL_CALL_WEIGHT;

    if !events.is_empty() {
        score += ACTIVITY_BONUS;
    }

    let open_secs = (closed_at - frame.created_at).num_seconds();
    if open_secs < SHORT_FRAME_SECS && events.len() <= 1 {
        score += SHORT_FRAME_PENALTY;
    }

    score.max(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{FrameState, FrameType};
    use chrono::Duration;

    fn frame(created_at: DateTime<Utc>) -> Frame {
        Frame {
            frame_id: "f1".into(),
            session_id: "s1".into(),
            project_id: "p1".into(),
            parent_frame_id: None,
            frame_type: FrameType::Task,
            name: "work".into(),
            created_at,
            closed_at: None,
            state: FrameState::Active,
            depth: 0,
            constraints: vec![],
            definitions: serde_json::json!({}),
            inputs: serde_json::json!({}),
            outputs: serde_json::json!({}),
            digest: None,
            importance_score: None,
        }
    }

    fn event(id: &str, event_type: EventType) -> Event {
        Event {
            event_id: id.into(),
            frame_id: "f1".into(),
            event_type,
            payload: serde_json::json!({}),
            ts: Utc::now(),
        }
    }

    fn anchor(anchor_type: AnchorType) -> Anchor {
        Anchor {
            anchor_id: uuid::Uuid::new_v4().to_string(),
            frame_id: "f1".into(),
            anchor_type,
            text: "t".into(),
            priority: 5,
            created_at: Utc::now(),
            metadata: None,
        }
    }

    #[test]
    fn test_anchor_weights() {
        let now = Utc::now();
        let f = frame(now - Duration::minutes(5));
        let anchors = vec![
            anchor(AnchorType::Decision),
            anchor(AnchorType::Constraint),
            anchor(AnchorType::InterfaceContract),
            anchor(AnchorType::Fact),
        ];
        // 10 + 15 + 15, no events so no activity bonus
        assert_eq!(importance_score(&f, &[], &anchors, now), 40);
    }

    #[test]
    fn test_events_and_activity_bonus() {
        let now = Utc::now();
        let f = frame(now - Duration::minutes(5));
        let events = vec![
            event("e1", EventType::ToolCall),
            event("e2", EventType::ToolCall),
            event("e3", EventType::Error),
        ];
        // 2 tool calls + 1 unresolved error * 5 + activity bonus 2
        assert_eq!(importance_score(&f, &events, &[], now), 2 + 5 + 2);
    }

    #[test]
    fn test_short_frame_penalty_clamps_at_zero() {
        let now = Utc::now();
        let f = frame(now - Duration::seconds(5));
        assert_eq!(importance_score(&f, &[], &[], now), 0);

        // One cheap event still penalized: 1 + 2 - 3 = 0
        let events = vec![event("e1", EventType::ToolCall)];
        assert_eq!(importance_score(&f, &events, &[], now), 0);
    }

    #[test]
    fn test_short_frame_with_two_events_escapes_penalty() {
        let now = Utc::now();
        let f = frame(now - Duration::seconds(5));
        let events = vec![event("e1", EventType::ToolCall), event("e2", EventType::Note)];
        assert_eq!(importance_score(&f, &events, &[], now), 1 + 2);
    }

    #[test]
    fn test_penalized_frame_never_outranks_decision_frame() {
        let now = Utc::now();
        let quick = frame(now - Duration::seconds(3));
        let quick_score = importance_score(&quick, &[event("e1", EventType::Note)], &[], now);

        let older = frame(now - Duration::hours(2));
        let older_score =
            importance_score(&older, &[], &[anchor(AnchorType::Decision)], now - Duration::hours(1));

        assert!(quick_score < older_score);
    }

    #[test]
    fn test_resolved_errors_score_nothing() {
        let now = Utc::now();
        let f = frame(now - Duration::minutes(2));
        let events = vec![
            event("e1", EventType::Error),
            Event {
                event_id: "e2".into(),
                frame_id: "f1".into(),
                event_type: EventType::Note,
                payload: serde_json::json!({"resolves": "e1"}),
                ts: Utc::now(),
            },
        ];
        assert_eq!(importance_score(&f, &events, &[], now), 2);
    }
}
