//! Word-to-audio alignment for synthesized clauses.
//!
//! The synthesizer reports a duration per input token in its own frame unit.
//! Summing those durations up to every word boundary gives a list of sample
//! offsets where each word ends; each fixed-size audio chunk is then labelled
//! with the word audible at its end.

/// Sample offsets at which each word of a clause ends.
///
/// A word ends where a run of space tokens begins, and at the last token of
/// the clause.
pub fn word_breakpoints(tokens: &[u32], durations: &[f32], space_token: u32, frames_per_unit: u32) -> Vec<usize> {
    let mut breakpoints = Vec::new();
    let mut elapsed = 0.0f64;
    let mut after_word = false;
    for (&token, &duration) in tokens.iter().zip(durations) {
        if token == space_token {
            if after_word {
                breakpoints.push(to_samples(elapsed, frames_per_unit));
            }
            after_word = false;
        } else {
            after_word = true;
        }
        elapsed += duration.max(0.0) as f64;
    }
    if after_word {
        breakpoints.push(to_samples(elapsed, frames_per_unit));
    }
    breakpoints.dedup();
    breakpoints
}

fn to_samples(units: f64, frames_per_unit: u32) -> usize {
    (units * frames_per_unit as f64).round() as usize
}

/// Word index for each chunk: the first word whose breakpoint lies beyond
/// the chunk's end offset, or the last word for trailing padding.
pub fn assign_words(breakpoints: &[usize], n_chunks: usize, chunk_len: usize) -> Vec<usize> {
    let last = breakpoints.len().saturating_sub(1);
    (0..n_chunks)
        .map(|i| {
            let end = (i + 1) * chunk_len;
            breakpoints.iter().position(|&bp| end < bp).unwrap_or(last)
        })
        .collect()
}

/// Split audio into chunks of `chunk_len` samples, zero-padding the last one.
pub fn split_chunks(samples: &[i16], chunk_len: usize) -> Vec<Vec<i16>> {
    if chunk_len == 0 {
        return Vec::new();
    }
    samples
        .chunks(chunk_len)
        .map(|chunk| {
            let mut chunk = chunk.to_vec();
            chunk.resize(chunk_len, 0);
            chunk
        })
        .collect()
}

/// Index of the generator token holding the last character of each
/// whitespace-separated word.
pub fn word_groups<S: AsRef<str>>(texts: &[S]) -> Vec<usize> {
    let mut ends = Vec::new();
    let mut open = None;
    for (i, text) in texts.iter().enumerate() {
        for c in text.as_ref().chars() {
            if c.is_whitespace() {
                if let Some(end) = open.take() {
                    ends.push(end);
                }
            } else {
                open = Some(i);
            }
        }
    }
    ends.extend(open);
    ends
}
