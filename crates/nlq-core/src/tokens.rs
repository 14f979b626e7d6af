//! Token estimation for prompt budgeting.
//!
//! Two counters are provided: a fast character heuristic and a BPE counter
//! backed by tiktoken's cl100k encoding. Both are pure and safe to share
//! across sessions.

use std::fmt;
use std::sync::Arc;

use tiktoken_rs::CoreBPE;
use tracing::warn;

use crate::error::{NlqError, Result};

/// Estimates the token cost of text for one model family.
pub trait TokenCounter: Send + Sync {
    /// Token cost of `text`.
    fn count(&self, text: &str) -> usize;

    /// Longest prefix of `text` whose cost does not exceed `max_tokens`.
    ///
    /// The default implementation binary-searches over char boundaries, so it
    /// works for any counter whose cost grows with prefix length.
    fn truncate(&self, text: &str, max_tokens: usize) -> String {
        if self.count(text) <= max_tokens {
            return text.to_string();
        }
        let boundaries: Vec<usize> = text
            .char_indices()
            .map(|(i, _)| i)
            .chain(std::iter::once(text.len()))
            .collect();

        // Invariant: boundaries[lo] fits, boundaries[hi] does not.
        let (mut lo, mut hi) = (0usize, boundaries.len() - 1);
        while hi - lo > 1 {
            let mid = lo + (hi - lo) / 2;
            if self.count(&text[..boundaries[mid]]) <= max_tokens {
                lo = mid;
            } else {
                hi = mid;
            }
        }
        text[..boundaries[lo]].to_string()
    }
}

// =============================================================================
// HeuristicCounter
// =============================================================================

/// Character-ratio estimate: about four Latin characters per token, one
/// token per CJK ideograph.
#[derive(Debug, Clone, Copy)]
pub struct HeuristicCounter {
    chars_per_token: f64,
}

impl HeuristicCounter {
    pub fn new(chars_per_token: f64) -> Self {
        Self {
            chars_per_token: if chars_per_token > 0.0 {
                chars_per_token
            } else {
                4.0
            },
        }
    }
}

impl Default for HeuristicCounter {
    fn default() -> Self {
        Self::new(4.0)
    }
}

impl TokenCounter for HeuristicCounter {
    fn count(&self, text: &str) -> usize {
        let mut cjk = 0usize;
        let mut other = 0usize;
        for c in text.chars() {
            if is_cjk(c) {
                cjk += 1;
            } else {
                other += 1;
            }
        }
        cjk + (other as f64 / self.chars_per_token).ceil() as usize
    }
}

fn is_cjk(c: char) -> bool {
    matches!(c as u32,
        0x3040..=0x30FF      // Hiragana, Katakana
        | 0x3400..=0x4DBF    // CJK Extension A
        | 0x4E00..=0x9FFF    // CJK Unified Ideographs
        | 0xAC00..=0xD7AF    // Hangul syllables
        | 0xF900..=0xFAFF    // CJK Compatibility Ideographs
        | 0xFF00..=0xFFEF)   // Full-width forms
}

// =============================================================================
// BpeCounter
// =============================================================================

/// Exact counts using the cl100k_base byte-pair encoding.
pub struct BpeCounter {
    bpe: CoreBPE,
}

impl BpeCounter {
    pub fn new() -> Result<Self> {
        let bpe = tiktoken_rs::cl100k_base().map_err(|e| NlqError::Tokenizer(e.to_string()))?;
        Ok(Self { bpe })
    }
}

impl TokenCounter for BpeCounter {
    fn count(&self, text: &str) -> usize {
        if text.is_empty() {
            return 0;
        }
        self.bpe.encode_with_special_tokens(text).len()
    }
}

// =============================================================================
// ModelFamily
// =============================================================================

/// Model families with distinct tokenization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ModelFamily {
    /// cl100k-tokenized models.
    OpenAi,
    /// Claude-style models; cl100k is a close approximation.
    Anthropic,
    /// Anything else, including locally hosted models.
    Generic,
}

impl ModelFamily {
    /// Build the counter for this family.
    ///
    /// Falls back to the heuristic if the BPE tables cannot be loaded.
    pub fn counter(&self) -> Arc<dyn TokenCounter> {
        match self {
            ModelFamily::OpenAi | ModelFamily::Anthropic => match BpeCounter::new() {
                Ok(counter) => Arc::new(counter),
                Err(e) => {
                    warn!(error = %e, family = %self, "BPE tokenizer unavailable, using heuristic");
                    Arc::new(HeuristicCounter::default())
                }
            },
            ModelFamily::Generic => Arc::new(HeuristicCounter::default()),
        }
    }
}

impl fmt::Display for ModelFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ModelFamily::OpenAi => write!(f, "openai"),
            ModelFamily::Anthropic => write!(f, "anthropic"),
            ModelFamily::Generic => write!(f, "generic"),
        }
    }
}

impl std::str::FromStr for ModelFamily {
    type Err = String;
    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "openai" | "gpt" => Ok(ModelFamily::OpenAi),
            "anthropic" | "claude" => Ok(ModelFamily::Anthropic),
            "generic" | "local" => Ok(ModelFamily::Generic),
            _ => Err(format!("Unknown model family: {}", s)),
        }
    }
}
