//! Result Fusion
//!
//! Reciprocal Rank Fusion for merging lexical and semantic result lists.
//! RRF normalizes across scoring scales and rewards items appearing in both
//! lists; the k constant (typically 60) dampens the effect of high ranks.

use std::collections::HashMap;

/// Standard RRF dampening constant
pub const RRF_K: f32 = 60.0;

/// Merge two ranked lists: `score(d) = Σ 1/(k + rank(d))`.
pub fn reciprocal_rank_fusion(
    lexical: &[(String, f32)],
    semantic: &[(String, f32)],
    k: f32,
) -> Vec<(String, f32)> {
    let mut scores: HashMap<String, f32> = HashMap::new();

    for (rank, (key, _)) in lexical.iter().enumerate() {
        *scores.entry(key.clone()).or_default() += 1.0 / (k + rank as f32);
    }
    for (rank, (key, _)) in semantic.iter().enumerate() {
        *scores.entry(key.clone()).or_default() += 1.0 / (k + rank as f32);
    }

    let mut results: Vec<(String, f32)> = scores.into_iter().collect();
    results.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
    results
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_items_in_both_lists_rank_first() {
        let lexical = vec![
            ("f1".to_string(), 4.2),
            ("f2".to_string(), 3.0),
            ("f3".to_string(), 1.0),
        ];
        let semantic = vec![("f2".to_string(), 0.9), ("f4".to_string(), 0.8)];

        let fused = reciprocal_rank_fusion(&lexical, &semantic, RRF_K);
        assert_eq!(fused[0].0, "f2");
        for pair in fused.windows(2) {
            assert!(pair[0].1 >= pair[1].1);
        }
    }

    #[test]
    fn test_empty_side_passes_through() {
        let semantic = vec![("f1".to_string(), 0.9)];
        let fused = reciprocal_rank_fusion(&[], &semantic, RRF_K);
        assert_eq!(fused.len(), 1);
        assert_eq!(fused[0].0, "f1");
    }
}
