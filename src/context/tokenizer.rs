//! Keyword tokenization shared by indexing and querying.

use std::collections::HashSet;

/// Shortest token kept.
const MIN_TOKEN_LEN: usize = 3;

/// Common words that carry no search signal. Words shorter than
/// [`MIN_TOKEN_LEN`] are already filtered and not listed.
const STOP_WORDS: &[&str] = &[
    "all", "and", "any", "are", "but", "can", "for", "from", "has", "have", "into", "its", "may",
    "not", "that", "the", "their", "then", "there", "these", "this", "was", "were", "when",
    "which", "will", "with", "you", "your",
];

pub fn is_stop_word(token: &str) -> bool {
    STOP_WORDS.contains(&token)
}

/// Lower-case `text`, split on anything that is not a letter or digit, and
/// keep unique tokens longer than two characters that are not stop words.
///
/// Order of first appearance is preserved.
pub fn tokenize(text: &str) -> Vec<String> {
    let mut seen = HashSet::new();
    let mut tokens = Vec::new();
    for part in text.split(|c: char| !c.is_alphanumeric()) {
        if part.chars().count() < MIN_TOKEN_LEN {
            continue;
        }
        let normalized = part.to_lowercase();
        if is_stop_word(&normalized) {
            continue;
        }
        if seen.insert(normalized.clone()) {
            tokens.push(normalized);
        }
    }
    tokens
}

/// Tokenize several fields as one item.
pub fn tokenize_fields<'a>(fields: impl IntoIterator<Item = &'a str>) -> Vec<String> {
    let joined: Vec<&str> = fields.into_iter().collect();
    tokenize(&joined.join(" "))
}
