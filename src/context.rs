//! Token-budgeted context assembly.
//!
//! Takes retrieval results and produces the context section of the prompt:
//! chunks in descending score order, identical texts deduplicated (highest
//! score kept), accumulated until the next chunk would overflow the token
//! budget. If even the single best chunk is over budget it is truncated to
//! exactly the budget rather than dropped, so a query never loses its best
//! evidence to an oversized chunk.
//!
//! Only chunk text counts toward the budget; the `[Source N]` labels do not.
//! Output is deterministic for identical input.

use crate::chunker::tokenize;
use crate::models::RetrievedChunk;

#[derive(Debug, Clone)]
pub struct BuiltContext {
    /// Labeled context blocks, ready to drop into a prompt. Empty string
    /// when nothing was retrieved.
    pub text: String,
    /// Chunk IDs included, in inclusion order.
    pub included_chunk_ids: Vec<String>,
    /// Whitespace tokens of included chunk text.
    pub token_count: usize,
}

pub fn build(hits: &[RetrievedChunk], max_context_tokens: usize) -> BuiltContext {
    // Stable sort keeps retrieval order for equal scores
    let mut ordered: Vec<&RetrievedChunk> = hits.iter().collect();
    ordered.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    let mut seen_texts: Vec<&str> = Vec::new();
    let mut blocks: Vec<String> = Vec::new();
    let mut included_chunk_ids = Vec::new();
    let mut token_count = 0usize;

    for hit in ordered {
        if seen_texts.contains(&hit.chunk.text.as_str()) {
            continue;
        }

        let tokens = tokenize(&hit.chunk.text);

        if blocks.is_empty() && tokens.len() > max_context_tokens {
            // Best chunk alone overflows: truncate to exactly the budget
            let cut = tokens[..max_context_tokens].join(" ");
            blocks.push(format_block(blocks.len() + 1, hit.score, &cut));
            included_chunk_ids.push(hit.chunk.id.clone());
            token_count = max_context_tokens;
            break;
        }

        if token_count + tokens.len() > max_context_tokens {
            break;
        }

        token_count += tokens.len();
        blocks.push(format_block(blocks.len() + 1, hit.score, &hit.chunk.text));
        included_chunk_ids.push(hit.chunk.id.clone());
        seen_texts.push(&hit.chunk.text);
    }

    BuiltContext {
        text: blocks.join("\n\n"),
        included_chunk_ids,
        token_count,
    }
}

fn format_block(number: usize, score: f32, text: &str) -> String {
    format!("[Source {}] (score {:.2})\n{}", number, score, text)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Chunk;

    fn hit(id: &str, score: f32, text: &str) -> RetrievedChunk {
        RetrievedChunk {
            chunk: Chunk {
                id: id.to_string(),
                document_id: "d".to_string(),
                chunk_index: 0,
                chunk_total: 1,
                text: text.to_string(),
                token_count: text.split_whitespace().count() as i64,
                metadata_json: "{}".to_string(),
            },
            score,
        }
    }

    #[test]
    fn test_empty_hits_empty_context() {
        let built = build(&[], 100);
        assert!(built.text.is_empty());
        assert!(built.included_chunk_ids.is_empty());
        assert_eq!(built.token_count, 0);
    }

    #[test]
    fn test_descending_score_order() {
        let hits = vec![
            hit("low", 0.3, "low scored text"),
            hit("high", 0.9, "high scored text"),
            hit("mid", 0.6, "mid scored text"),
        ];
        let built = build(&hits, 100);
        assert_eq!(built.included_chunk_ids, vec!["high", "mid", "low"]);
        assert!(built.text.starts_with("[Source 1] (score 0.90)\nhigh scored text"));
    }

    #[test]
    fn test_dedupe_keeps_highest_score() {
        let hits = vec![
            hit("a", 0.9, "identical words here"),
            hit("b", 0.5, "identical words here"),
            hit("c", 0.4, "different words entirely"),
        ];
        let built = build(&hits, 100);
        assert_eq!(built.included_chunk_ids, vec!["a", "c"]);
        assert_eq!(built.token_count, 6);
    }

    #[test]
    fn test_budget_stops_before_overflow() {
        let hits = vec![
            hit("a", 0.9, "one two three"),
            hit("b", 0.8, "four five six seven"),
            hit("c", 0.7, "eight"),
        ];
        // Budget of 5 fits "a" (3) but not "a"+"b" (7); assembly stops at
        // the first chunk that would overflow
        let built = build(&hits, 5);
        assert_eq!(built.included_chunk_ids, vec!["a"]);
        assert_eq!(built.token_count, 3);
    }

    #[test]
    fn test_single_oversized_chunk_truncated_to_budget() {
        let long: String = (0..50).map(|i| format!("w{} ", i)).collect();
        let hits = vec![hit("big", 0.95, long.trim()), hit("small", 0.5, "tiny text")];
        let built = build(&hits, 10);
        assert_eq!(built.included_chunk_ids, vec!["big"]);
        assert_eq!(built.token_count, 10);
        // The truncated block carries exactly the budget in chunk tokens
        let body = built.text.splitn(2, '\n').nth(1).unwrap();
        assert_eq!(body.split_whitespace().count(), 10);
    }

    #[test]
    fn test_exact_fit_is_included() {
        let hits = vec![hit("a", 0.9, "one two three four five")];
        let built = build(&hits, 5);
        assert_eq!(built.included_chunk_ids, vec!["a"]);
        assert_eq!(built.token_count, 5);
    }

    #[test]
    fn test_deterministic() {
        let hits = vec![
            hit("a", 0.9, "alpha beta"),
            hit("b", 0.9, "gamma delta"),
            hit("c", 0.2, "epsilon"),
        ];
        let one = build(&hits, 10);
        let two = build(&hits, 10);
        assert_eq!(one.text, two.text);
        assert_eq!(one.included_chunk_ids, two.included_chunk_ids);
        // Equal scores keep input order
        assert_eq!(one.included_chunk_ids[0], "a");
    }
}
