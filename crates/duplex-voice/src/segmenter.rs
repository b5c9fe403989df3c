//! Clause and turn segmentation rules for generated text.
//!
//! Decides when a run of generated tokens closes a clause (punctuation),
//! ends the turn (stop pattern), or starts with a role tag the model should
//! not have produced. Matching works on raw detokenized bytes, since a
//! single token may hold an incomplete UTF-8 sequence.

use duplex_core::GenerationConfig;

#[derive(Debug, Clone)]
pub struct ClauseSegmenter {
    stop_patterns: Vec<Vec<u8>>,
    role_patterns: Vec<Vec<u8>>,
    max_role_len: usize,
    punctuation: Vec<String>,
}

impl ClauseSegmenter {
    pub fn new(config: &GenerationConfig) -> Self {
        let role_patterns: Vec<Vec<u8>> = config
            .role_patterns
            .iter()
            .map(|p| p.as_bytes().to_vec())
            .collect();
        let max_role_len = role_patterns.iter().map(Vec::len).max().unwrap_or(0);
        Self {
            stop_patterns: config
                .stop_patterns
                .iter()
                .map(|p| p.as_bytes().to_vec())
                .collect(),
            role_patterns,
            max_role_len,
            punctuation: config
                .punctuation
                .iter()
                .filter(|p| !p.is_empty())
                .cloned()
                .collect(),
        }
    }

    /// A token closes a clause when its visible text ends with punctuation.
    pub fn is_clause_boundary(&self, token_text: &str) -> bool {
        let visible = token_text.trim();
        !visible.is_empty() && self.punctuation.iter().any(|p| visible.ends_with(p.as_str()))
    }

    /// Byte length of the first stop pattern the text ends with.
    pub fn stop_pattern_at_tail(&self, text: &[u8]) -> Option<usize> {
        self.stop_patterns
            .iter()
            .find(|p| text.ends_with(p))
            .map(Vec::len)
    }

    /// Byte length of a role pattern the turn opens with. Only checked while
    /// the text, ignoring leading whitespace, is no longer than the longest
    /// role pattern.
    pub fn role_pattern_at_opening(&self, text: &[u8]) -> Option<usize> {
        let start = text
            .iter()
            .position(|b| !b.is_ascii_whitespace())
            .unwrap_or(text.len());
        let opening = &text[start..];
        if opening.is_empty() || opening.len() > self.max_role_len {
            return None;
        }
        self.role_patterns
            .iter()
            .find(|p| opening.ends_with(p))
            .map(Vec::len)
    }
}

/// How many trailing tokens, given their byte lengths, are needed to cover
/// `bytes` bytes.
pub fn covering_suffix(token_lens: &[usize], bytes: usize) -> usize {
    let mut covered = 0;
    let mut count = 0;
    for len in token_lens.iter().rev() {
        if covered >= bytes {
            break;
        }
        covered += len;
        count += 1;
    }
    count
}

/// A token made of nothing but newlines.
pub fn is_newline_token(text: &str) -> bool {
    !text.is_empty() && text.chars().all(|c| c == '\n' || c == '\r')
}
