//! Token estimation for context budgets.
//!
//! The default [`HeuristicCounter`] uses ~4 characters per token, which is
//! within ~10% of BPE tokenizers on English text. With the `hf-tokenizer`
//! feature a real vocabulary can be loaded instead.

/// Counts tokens in a piece of text.
pub trait TokenCounter: Send + Sync {
    fn count(&self, text: &str) -> usize;
}

/// Character-based estimate: 1 token ≈ 4 bytes, rounded up.
#[derive(Debug, Clone, Copy, Default)]
pub struct HeuristicCounter;

impl TokenCounter for HeuristicCounter {
    fn count(&self, text: &str) -> usize {
        estimate_tokens(text)
    }
}

/// Estimate the token count for a string.
pub fn estimate_tokens(text: &str) -> usize {
    if text.is_empty() {
        return 0;
    }
    text.len().div_ceil(4)
}

#[cfg(feature = "hf-tokenizer")]
pub use hf::HfTokenCounter;

#[cfg(feature = "hf-tokenizer")]
mod hf {
    use std::path::Path;

    use super::{TokenCounter, estimate_tokens};

    /// Counts with a `tokenizer.json` vocabulary.
    pub struct HfTokenCounter {
        tokenizer: tokenizers::Tokenizer,
    }

    impl HfTokenCounter {
        pub fn from_file(path: &Path) -> Result<Self, TokenizerLoadError> {
            let tokenizer =
                tokenizers::Tokenizer::from_file(path).map_err(|e| TokenizerLoadError {
                    path: path.display().to_string(),
                    reason: e.to_string(),
                })?;
            Ok(Self { tokenizer })
        }
    }

    impl TokenCounter for HfTokenCounter {
        fn count(&self, text: &str) -> usize {
            match self.tokenizer.encode(text, false) {
                Ok(encoding) => encoding.len(),
                Err(e) => {
                    tracing::warn!("Tokenizer failed, falling back to estimate: {e}");
                    estimate_tokens(text)
                }
            }
        }
    }

    #[derive(Debug, thiserror::Error)]
    #[error("failed to load tokenizer from {path}: {reason}")]
    pub struct TokenizerLoadError {
        pub path: String,
        pub reason: String,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_string_is_zero() {
        assert_eq!(estimate_tokens(""), 0);
    }

    #[test]
    fn four_chars_is_one_token() {
        assert_eq!(estimate_tokens("test"), 1);
    }

    #[test]
    fn five_chars_rounds_up() {
        assert_eq!(HeuristicCounter.count("hello"), 2);
    }

    #[test]
    fn hundred_chars() {
        assert_eq!(estimate_tokens(&"a".repeat(100)), 25);
    }
}
