//! Topic exchange routing-key matching.
//!
//! Keys are words separated by dots. In a binding pattern:
//! - `*` matches exactly one word: `orders.*` matches `orders.created`
//! - `#` matches zero or more words: `orders.#` matches `orders` and `orders.eu.created`

pub const WILDCARD_SINGLE: &str = "*";
pub const WILDCARD_MULTI: &str = "#";

/// Returns true when `routing_key` is routed by a binding with `pattern`.
pub fn topic_matches(pattern: &str, routing_key: &str) -> bool {
    let pattern: Vec<&str> = pattern.split('.').collect();
    let key: Vec<&str> = routing_key.split('.').collect();
    match_words(&pattern, &key)
}

fn match_words(pattern: &[&str], key: &[&str]) -> bool {
    match pattern.split_first() {
        None => key.is_empty(),
        Some((&WILDCARD_MULTI, rest)) => {
            // `#` may swallow any number of words, including none
            (0..=key.len()).any(|skip| match_words(rest, &key[skip..]))
        }
        Some((&word, rest)) => match key.split_first() {
            Some((&first, key_rest)) if word == WILDCARD_SINGLE || word == first => {
                match_words(rest, key_rest)
            }
            _ => false,
        },
    }
}
