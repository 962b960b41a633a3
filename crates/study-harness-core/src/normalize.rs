//! Text normalization and prompt-sized chunking.
//!
//! Turns raw extracted segments into chunks that respect a configurable
//! `max_tokens` limit:
//!
//! 1. Strip control characters and collapse every whitespace run to a single space.
//! 2. Split any segment longer than the limit at the last sentence boundary
//!    inside the limit, falling back to a hard character cut.
//! 3. Greedily merge neighbouring segments while the result stays within the
//!    limit, never across a page or section boundary and never mixing
//!    low-confidence OCR text with confident text.
//! 4. Renumber ordinals contiguously from 0.
//!
//! Token counts use a 4 chars/token heuristic. The output is a pure function
//! of the input sequence and the limit, which downstream deduplication relies on.

use crate::models::{Provenance, TextSegment};

/// Approximate characters-per-token ratio.
pub const CHARS_PER_TOKEN: usize = 4;

/// Estimated token count of `text` (rounded up).
pub fn estimate_tokens(text: &str) -> usize {
    text.chars().count().div_ceil(CHARS_PER_TOKEN)
}

/// Remove control characters and collapse whitespace to single spaces.
pub fn clean_text(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut pending_space = false;
    for ch in raw.chars() {
        if ch.is_whitespace() {
            pending_space = true;
            continue;
        }
        if ch.is_control() || matches!(ch, '\u{feff}' | '\u{200b}' | '\u{00ad}') {
            continue;
        }
        if pending_space && !out.is_empty() {
            out.push(' ');
        }
        pending_space = false;
        out.push(ch);
    }
    out
}

/// Splits and merges extracted segments into prompt-sized chunks.
#[derive(Debug, Clone, Copy)]
pub struct TextNormalizer {
    max_tokens: usize,
}

impl TextNormalizer {
    pub fn new(max_tokens: usize) -> Self {
        Self {
            max_tokens: max_tokens.max(1),
        }
    }

    pub fn max_tokens(&self) -> usize {
        self.max_tokens
    }

    fn max_chars(&self) -> usize {
        self.max_tokens * CHARS_PER_TOKEN
    }

    /// Normalize a document's segments. Input must be in reading order and
    /// belong to a single document.
    pub fn normalize(&self, segments: &[TextSegment]) -> Vec<TextSegment> {
        let Some(first) = segments.first() else {
            return Vec::new();
        };
        let document_id = first.source_document_id.clone();
        let max_chars = self.max_chars();

        let mut pieces: Vec<(Provenance, String)> = Vec::new();
        for segment in segments {
            let cleaned = clean_text(&segment.text);
            if cleaned.is_empty() {
                continue;
            }
            for (part, piece) in split_oversized(&cleaned, max_chars).into_iter().enumerate() {
                let mut provenance = segment.provenance.clone();
                provenance.part = part as u32;
                pieces.push((provenance, piece));
            }
        }

        let mut merged: Vec<(Provenance, String, usize)> = Vec::new();
        for (provenance, text) in pieces {
            let len = text.chars().count();
            if let Some((last_prov, last_text, last_len)) = merged.last_mut() {
                let mergeable = last_prov.locator.same_boundary(&provenance.locator)
                    && last_prov.low_confidence == provenance.low_confidence
                    && *last_len + 1 + len <= max_chars;
                if mergeable {
                    last_text.push(' ');
                    last_text.push_str(&text);
                    *last_len += 1 + len;
                    last_prov.locator = last_prov.locator.extend(&provenance.locator);
                    last_prov.confidence = match (last_prov.confidence, provenance.confidence) {
                        (Some(a), Some(b)) => Some(a.min(b)),
                        (a, b) => a.or(b),
                    };
                    continue;
                }
            }
            merged.push((provenance, text, len));
        }

        merged
            .into_iter()
            .enumerate()
            .map(|(ordinal, (provenance, text, _))| {
                TextSegment::new(&document_id, ordinal as u32, provenance, text)
            })
            .collect()
    }
}

/// Split cleaned text into pieces of at most `max_chars` characters.
fn split_oversized(text: &str, max_chars: usize) -> Vec<String> {
    let mut pieces = Vec::new();
    let mut rest = text;
    loop {
        let limit = match rest.char_indices().nth(max_chars) {
            Some((byte_idx, _)) => byte_idx,
            None => break,
        };
        let cut = last_sentence_boundary(rest, limit).unwrap_or(limit);
        let (head, tail) = rest.split_at(cut);
        let head = head.trim_end();
        if !head.is_empty() {
            pieces.push(head.to_string());
        }
        rest = tail.trim_start();
    }
    if !rest.is_empty() {
        pieces.push(rest.to_string());
    }
    pieces
}

/// Byte offset just past the last sentence terminator at or before `limit`
/// that is followed by whitespace.
fn last_sentence_boundary(text: &str, limit: usize) -> Option<usize> {
    let mut best = None;
    for (idx, ch) in text.char_indices() {
        let end = idx + ch.len_utf8();
        if end > limit {
            break;
        }
        if matches!(ch, '.' | '!' | '?' | '。' | '…')
            && text[end..].chars().next().is_some_and(char::is_whitespace)
        {
            best = Some(end);
        }
    }
    best
}
