//! Canonical text construction for embedding.
//!
//! An issue's title, body, and comments are flattened into a single string
//! with a fixed layout so that embeddings are comparable across refreshes.
//! The result is capped at a character budget (a cheap proxy bound applied
//! before exact token counting); the halving helper handles the case where
//! the exact token count still exceeds the limit.

/// Build the canonical text for an issue and cap it at `max_chars` characters.
///
/// Layout: `"Title: {title}\nBody: {body}\nComments: {comment bodies joined
/// by single spaces}"`. Truncation counts characters, not bytes, so it is
/// always UTF-8 safe.
pub fn canonical_text(title: &str, body: &str, comments: &[String], max_chars: usize) -> String {
    let comments_text = comments.join(" ");
    let full = format!("Title: {}\nBody: {}\nComments: {}", title, body, comments_text);
    truncate_chars(&full, max_chars)
}

/// Keep the first half of `text`, by character count.
///
/// Used when the exact token count exceeds the limit: a single coarse cut
/// rather than token-aware trimming.
pub fn halve_chars(text: &str) -> String {
    truncate_chars(text, text.chars().count() / 2)
}

/// Truncate `text` to at most `max_chars` characters.
pub fn truncate_chars(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((byte_idx, _)) => text[..byte_idx].to_string(),
        None => text.to_string(),
    }
}
