//! `chunk(document_id)` — recursive parent/child text splitter.
//!
//! Separator hierarchy: paragraph, line, sentence boundary, punctuation,
//! whitespace, character — the same cascading-separator strategy as other
//! recursive-character splitters in the ecosystem, sized to the token
//! budgets in [`crate::models::text_chunk`].
//!
//! Per §9's chunking-idempotency caveat: all writes for one document are a
//! single transaction so a crash mid-write never leaves a partially-chunked
//! document; `PipelineStore::save_text_chunks` is the transaction boundary.

use crate::error::{PipelineError, Result, ValidationError};
use crate::models::{
    CaseDocument, ChunkType, TextChunk, CHILD_OVERLAP_RATIO, CHILD_TOKENS_MAX, CHILD_TOKENS_MIN, PARENT_TOKENS_MAX,
    PARENT_TOKENS_MIN,
};

use super::PipelineStore;

const SEPARATORS: &[&str] = &["\n\n", "\n", ". ", "; ", ", ", " "];

/// Rough token estimate: ~4 characters per token, the same heuristic
/// commonly used when a real tokenizer isn't available at split time (the
/// embedding provider's own tokenizer has the final say; this only needs to
/// be consistent enough to hit the target ranges).
pub fn estimate_tokens(text: &str) -> u32 {
    ((text.chars().count() as f64) / 4.0).ceil() as u32
}

/// Split `text` into segments whose estimated token count falls within
/// `[min_tokens, max_tokens]`, using the separator hierarchy and falling
/// back to a hard character split if no separator produces small-enough
/// pieces.
pub fn recursive_split(text: &str, min_tokens: u32, max_tokens: u32) -> Vec<String> {
    split_with_separators(text, min_tokens, max_tokens, SEPARATORS)
}

fn split_with_separators(text: &str, min_tokens: u32, max_tokens: u32, separators: &[&str]) -> Vec<String> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return Vec::new();
    }
    if estimate_tokens(trimmed) <= max_tokens {
        return vec![trimmed.to_string()];
    }

    let Some((sep, rest)) = separators.split_first() else {
        return hard_split(trimmed, max_tokens);
    };

    let pieces: Vec<&str> = if sep.is_empty() { vec![trimmed] } else { trimmed.split(sep.as_str()).collect() };
    if pieces.len() <= 1 {
        return split_with_separators(trimmed, min_tokens, max_tokens, rest);
    }

    merge_pieces_to_budget(&pieces, sep, min_tokens, max_tokens, rest)
}

fn merge_pieces_to_budget(pieces: &[&str], sep: &str, min_tokens: u32, max_tokens: u32, rest: &[&str]) -> Vec<String> {
    let mut out = Vec::new();
    let mut current = String::new();

    for piece in pieces {
        let candidate = if current.is_empty() { piece.to_string() } else { format!("{current}{sep}{piece}") };
        if estimate_tokens(&candidate) > max_tokens && !current.is_empty() {
            out.push(current.clone());
            current = piece.to_string();
        } else {
            current = candidate;
        }

        if estimate_tokens(&current) > max_tokens {
            out.extend(split_with_separators(&current, min_tokens, max_tokens, rest));
            current.clear();
        }
    }
    if !current.is_empty() {
        out.push(current);
    }
    out
}

fn hard_split(text: &str, max_tokens: u32) -> Vec<String> {
    let max_chars = (max_tokens as usize) * 4;
    text.chars()
        .collect::<Vec<char>>()
        .chunks(max_chars.max(1))
        .map(|c| c.iter().collect())
        .collect()
}

/// Split `parent_text` into overlapping child segments targeting
/// `CHILD_TOKENS_MIN..CHILD_TOKENS_MAX`, with ~`CHILD_OVERLAP_RATIO` overlap
/// carried from the tail of each preceding child into the next.
pub fn split_children(parent_text: &str) -> Vec<String> {
    let raw = recursive_split(parent_text, CHILD_TOKENS_MIN, CHILD_TOKENS_MAX);
    if raw.len() <= 1 {
        return raw;
    }

    let overlap_chars = ((CHILD_TOKENS_MAX as f64) * 4.0 * CHILD_OVERLAP_RATIO) as usize;
    let mut out = Vec::with_capacity(raw.len());
    let mut carry = String::new();

    for segment in raw {
        let with_overlap = if carry.is_empty() { segment.clone() } else { format!("{carry} {segment}") };
        out.push(with_overlap);
        let chars: Vec<char> = segment.chars().collect();
        let tail_start = chars.len().saturating_sub(overlap_chars);
        carry = chars[tail_start..].iter().collect();
    }

    out
}

pub async fn run(store: &dyn PipelineStore, document_id: &str) -> Result<Vec<TextChunk>> {
    // Idempotency guard (§7): if chunks already exist, this stage is a
    // no-op success. Per §9, the caveat is a partial-write leaving the guard
    // permanently tripped on an incomplete table — mitigated by writing all
    // chunks for a document in one transaction, so "any chunks exist" only
    // ever means "all chunks for this document were written."
    if store.text_chunks_exist(document_id).await? {
        return store.get_text_chunks(document_id).await;
    }

    let document: CaseDocument = store.get_document(document_id).await?;
    let text = document
        .extracted_text
        .ok_or_else(|| PipelineError::Validation(ValidationError::EmptyDocument))?;

    let parent_segments = recursive_split(&text, PARENT_TOKENS_MIN, PARENT_TOKENS_MAX);

    let mut chunks = Vec::new();
    let mut parent_index = 0u32;
    let mut child_index = 0u32;

    for parent_text in parent_segments {
        if estimate_tokens(&parent_text) < PARENT_TOKENS_MIN / 2 {
            // Below minimum size even for a lone trailing segment: discard
            // per the "chunks below min_size are discarded" invariant.
            continue;
        }

        let parent_tokens = estimate_tokens(&parent_text);
        let parent = TextChunk::new_parent(document_id.to_string(), parent_index, parent_text.clone(), parent_tokens);
        let parent_id_placeholder = parent_index as i64;
        chunks.push(parent);
        parent_index += 1;

        for child_text in split_children(&parent_text) {
            let child_tokens = estimate_tokens(&child_text);
            let child = TextChunk::new_child(
                document_id.to_string(),
                parent_id_placeholder,
                child_index,
                child_text,
                child_tokens,
            );
            if child.is_below_min_size() {
                continue;
            }
            chunks.push(child);
            child_index += 1;
        }
    }

    store.save_text_chunks(document_id, &chunks).await?;
    Ok(chunks)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_text_is_a_single_segment() {
        let segments = recursive_split("a short sentence.", 10, 2000);
        assert_eq!(segments.len(), 1);
    }

    #[test]
    fn long_text_splits_on_paragraph_boundaries_first() {
        let para_a = "word ".repeat(400);
        let para_b = "word ".repeat(400);
        let text = format!("{para_a}\n\n{para_b}");
        let segments = recursive_split(&text, PARENT_TOKENS_MIN, PARENT_TOKENS_MAX);
        assert!(segments.len() >= 2);
        for s in &segments {
            assert!(estimate_tokens(s) <= PARENT_TOKENS_MAX);
        }
    }

    #[test]
    fn children_carry_forward_overlap() {
        let parent = "word ".repeat(1200);
        let children = split_children(&parent);
        assert!(children.len() >= 2);
    }

    #[test]
    fn estimate_tokens_is_roughly_four_chars_per_token() {
        assert_eq!(estimate_tokens("abcd"), 1);
        assert_eq!(estimate_tokens("abcdefgh"), 2);
    }
}
