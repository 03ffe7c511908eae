//! Token Accounting
//!
//! The budget math is pluggable: the default estimator approximates 1 token
//! per 4 UTF-8 bytes of English text, and a real tokenizer can be dropped in
//! behind the same trait. The estimator in use is echoed into bundle
//! metadata so rankings stay reproducible.

/// Pluggable token estimator
pub trait TokenEstimator: Send + Sync {
    /// Estimated token count for a piece of text
    fn estimate(&self, text: &str) -> usize;
    /// Name recorded in bundle metadata
    fn name(&self) -> &'static str;
}

/// Default estimator: fixed bytes-per-token ratio, rounding up.
#[derive(Debug, Clone, Copy)]
pub struct BytesPerToken(pub usize);

impl Default for BytesPerToken {
    fn default() -> Self {
        Self(4)
    }
}

impl TokenEstimator for BytesPerToken {
    fn estimate(&self, text: &str) -> usize {
        let ratio = self.0.max(1);
        text.len().div_ceil(ratio)
    }

    fn name(&self) -> &'static str {
        "bytes-per-token"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_ratio() {
        let estimator = BytesPerToken::default();
        assert_eq!(estimator.estimate(""), 0);
        assert_eq!(estimator.estimate("abcd"), 1);
        assert_eq!(estimator.estimate("abcde"), 2);
        assert_eq!(estimator.estimate(&"x".repeat(800)), 200);
    }

    #[test]
    fn test_multibyte_counts_bytes_not_chars() {
        let estimator = BytesPerToken::default();
        // Four 3-byte glyphs: 12 bytes, 3 tokens.
        assert_eq!(estimator.estimate("日本語字"), 3);
    }

    #[test]
    fn test_zero_ratio_is_safe() {
        let estimator = BytesPerToken(0);
        assert_eq!(estimator.estimate("abc"), 3);
    }
}
