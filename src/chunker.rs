//! Sliding-window token chunker.
//!
//! Splits document text into overlapping token-bounded pieces: a window of
//! `chunk_size_tokens` advances by `chunk_size_tokens - overlap_tokens` per
//! step, so consecutive chunks of the same document share exactly
//! `overlap_tokens` tokens (the final chunk may be shorter). Tokens are
//! whitespace-separated words; chunk text is the window's tokens rejoined
//! with single spaces, which makes the output deterministic and lets the
//! original token sequence be reconstructed by stripping overlaps.
//!
//! Empty or whitespace-only input yields zero chunks, not an error.

/// Whitespace tokenization, shared by the chunker, context builder, and
/// embedding truncation so all token budgets agree.
pub fn tokenize(text: &str) -> Vec<&str> {
    text.split_whitespace().collect()
}

/// Number of whitespace tokens in `text`.
pub fn token_count(text: &str) -> usize {
    text.split_whitespace().count()
}

/// One chunk of text produced by [`split`], before storage assigns IDs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkPiece {
    pub index: i64,
    pub text: String,
    pub token_count: i64,
}

/// Split `text` into overlapping token windows.
///
/// Callers must guarantee `chunk_size_tokens > 0` and
/// `overlap_tokens < chunk_size_tokens`; config validation enforces both
/// before the pipeline runs. Indices are assigned in traversal order from 0.
pub fn split(text: &str, chunk_size_tokens: usize, overlap_tokens: usize) -> Vec<ChunkPiece> {
    debug_assert!(chunk_size_tokens > 0);
    debug_assert!(overlap_tokens < chunk_size_tokens);

    let tokens = tokenize(text);
    if tokens.is_empty() {
        return Vec::new();
    }

    let stride = chunk_size_tokens - overlap_tokens;
    let mut pieces = Vec::new();
    let mut start = 0usize;
    let mut index: i64 = 0;

    loop {
        let end = (start + chunk_size_tokens).min(tokens.len());
        let window = &tokens[start..end];
        pieces.push(ChunkPiece {
            index,
            text: window.join(" "),
            token_count: window.len() as i64,
        });
        index += 1;

        if end == tokens.len() {
            break;
        }
        start += stride;
    }

    pieces
}
