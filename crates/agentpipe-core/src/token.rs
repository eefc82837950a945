//! Token estimation used by `ContextReducer` to detect oversized context before
//! it is handed to the next stage's agent invocation.

const CHARS_PER_TOKEN: f64 = 4.0;

#[derive(Debug, Clone, Copy, Default)]
pub struct TokenEstimator;

impl TokenEstimator {
    pub fn new() -> Self {
        Self
    }

    /// Character-count/4 approximation — not exact, adequate for threshold checks.
    pub fn estimate_text(&self, text: &str) -> u64 {
        let chars = text.chars().count() as f64;
        (chars / CHARS_PER_TOKEN).ceil() as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn estimates_roughly_chars_over_four() {
        let estimator = TokenEstimator::new();
        let text = "a".repeat(400);
        let tokens = estimator.estimate_text(&text);
        assert_eq!(tokens, 100);
    }

    #[test]
    fn empty_text_is_zero_tokens() {
        assert_eq!(TokenEstimator::new().estimate_text(""), 0);
    }
}
