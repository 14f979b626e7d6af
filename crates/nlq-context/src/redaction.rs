//! Redaction gate for the remote-safe transcript.
//!
//! Analysis text is written from full query results and may quote cell
//! values. Before such text enters the remote transcript every known cell
//! value of the session is replaced with a placeholder.

use std::collections::BTreeSet;

use regex::{NoExpand, Regex};

/// Placeholder written in place of a scrubbed cell value.
pub const VALUE_PLACEHOLDER: &str = "[VALUE]";

/// Decision made by the gate about a piece of text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RedactionDecision {
    /// Text contains no known cell value.
    Allow,
    /// Text is safe after redaction.
    Redacted {
        text: String,
        redaction_count: usize,
    },
}

/// Scrubs known result values out of text bound for the remote transcript.
#[derive(Debug, Clone)]
pub struct RedactionGate {
    min_len: usize,
}

impl RedactionGate {
    /// Values shorter than `min_len` characters are only replaced where they
    /// stand as whole words, so `1` is scrubbed from "1 order" but not from
    /// "12 orders".
    pub fn new(min_len: usize) -> Self {
        Self {
            min_len: min_len.max(1),
        }
    }

    /// Whether a cell value is tracked. Every non-blank value is.
    pub fn tracks(&self, value: &str) -> bool {
        !value.trim().is_empty()
    }

    pub fn check(&self, text: &str, values: &BTreeSet<String>) -> RedactionDecision {
        // Longest first so that "Northwind Traders" wins over "Northwind".
        let mut ordered: Vec<&str> = values
            .iter()
            .map(|v| v.trim())
            .filter(|v| self.tracks(v))
            .collect();
        ordered.sort_by(|a, b| b.len().cmp(&a.len()).then_with(|| a.cmp(b)));
        ordered.dedup();

        let mut redacted = text.to_string();
        let mut count = 0usize;
        for value in ordered {
            let pattern = if value.chars().count() < self.min_len {
                whole_word_pattern(value)
            } else {
                None
            };
            count += match pattern {
                Some(re) => {
                    let hits = re.find_iter(&redacted).count();
                    if hits > 0 {
                        redacted = re
                            .replace_all(&redacted, NoExpand(VALUE_PLACEHOLDER))
                            .into_owned();
                    }
                    hits
                }
                None => {
                    let hits = redacted.matches(value).count();
                    if hits > 0 {
                        redacted = redacted.replace(value, VALUE_PLACEHOLDER);
                    }
                    hits
                }
            };
        }

        if count > 0 {
            RedactionDecision::Redacted {
                text: redacted,
                redaction_count: count,
            }
        } else {
            RedactionDecision::Allow
        }
    }

    /// Convenience: return the scrubbed text.
    pub fn redact(&self, text: &str, values: &BTreeSet<String>) -> String {
        match self.check(text, values) {
            RedactionDecision::Allow => text.to_string(),
            RedactionDecision::Redacted { text, .. } => text,
        }
    }
}

fn is_word_char(c: char) -> bool {
    c.is_alphanumeric() || c == '_'
}

/// Pattern matching `value` only where it is not glued to surrounding word
/// characters. Boundaries are asserted only on sides that are word characters.
fn whole_word_pattern(value: &str) -> Option<Regex> {
    let lead = value.chars().next().is_some_and(is_word_char);
    let tail = value.chars().last().is_some_and(is_word_char);
    let pattern = format!(
        "{}{}{}",
        if lead { r"\b" } else { "" },
        regex::escape(value),
        if tail { r"\b" } else { "" }
    );
    Regex::new(&pattern).ok()
}

impl Default for RedactionGate {
    fn default() -> Self {
        Self::new(3)
    }
}
