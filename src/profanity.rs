// Client-side profanity masking applied before moderation
//
// Matching is substring based, so words that merely contain a denylisted
// entry are masked as well ("uglyness" becomes "****ness").

use once_cell::sync::Lazy;
use regex::{Captures, Regex};

/// Words masked by `filter_profanity`
pub const DENYLIST: &[&str] = &[
    "badword1",
    "profane",
    "inappropriate",
    "offensive",
    "ugly",
    "terrible",
];

pub const MASK_CHAR: char = '*';

static DENYLIST_PATTERN: Lazy<Regex> = Lazy::new(|| {
    let alternation = DENYLIST
        .iter()
        .map(|word| regex::escape(word))
        .collect::<Vec<_>>()
        .join("|");
    Regex::new(&format!("(?i-u){}", alternation)).expect("denylist pattern is built from escaped literals")
});

/// Replace every case-insensitive denylist occurrence with mask characters of equal length.
pub fn filter_profanity(text: &str) -> String {
    DENYLIST_PATTERN
        .replace_all(text, |caps: &Captures| {
            MASK_CHAR.to_string().repeat(caps[0].chars().count())
        })
        .into_owned()
}

pub fn contains_profanity(text: &str) -> bool {
    DENYLIST_PATTERN.is_match(text)
}
