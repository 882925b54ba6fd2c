//! Character-ratio token estimation.
//!
//! Every component in this crate sizes content through a [`TokenEstimator`].
//! It is an approximation: `ceil(chars / ratio)`. It makes no attempt to
//! match any model's byte-pair encoding, so callers must not expect exact
//! agreement with provider-reported usage.

/// Default characters per token (conservative estimate for English text).
pub const DEFAULT_CHARS_PER_TOKEN: f64 = 4.0;

/// Converts text into an approximate token count.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TokenEstimator {
    chars_per_token: f64,
}

impl TokenEstimator {
    /// Create an estimator with the given characters-per-token ratio.
    ///
    /// Non-finite or non-positive ratios fall back to
    /// [`DEFAULT_CHARS_PER_TOKEN`].
    pub fn new(chars_per_token: f64) -> Self {
        let chars_per_token = if chars_per_token.is_finite() && chars_per_token > 0.0 {
            chars_per_token
        } else {
            DEFAULT_CHARS_PER_TOKEN
        };
        Self { chars_per_token }
    }

    /// The configured characters-per-token ratio.
    pub fn ratio(&self) -> f64 {
        self.chars_per_token
    }

    /// Estimate tokens for `text`. Empty text is 0 tokens.
    pub fn estimate(&self, text: &str) -> usize {
        self.estimate_chars(text.chars().count())
    }

    /// Estimate tokens for a raw character count.
    pub fn estimate_chars(&self, chars: usize) -> usize {
        if chars == 0 {
            return 0;
        }
        (chars as f64 / self.chars_per_token).ceil() as usize
    }
}

impl Default for TokenEstimator {
    fn default() -> Self {
        Self::new(DEFAULT_CHARS_PER_TOKEN)
    }
}

impl From<f64> for TokenEstimator {
    fn from(ratio: f64) -> Self {
        Self::new(ratio)
    }
}
