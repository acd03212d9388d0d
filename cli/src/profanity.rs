use once_cell::sync::Lazy;
use regex::{Captures, Regex};
use std::collections::HashSet;

const REPLACEMENT: &str = "❤️";

const DEFAULT_WORDS: &[&str] = &[
    "fuck", "fucking", "fucked", "fck", "f*ck", "fuk", "shit", "sh*t", "shyt", "ass", "asshole",
    "a$$", "bitch", "b*tch", "dick", "d*ck", "pussy", "p*ssy", "cock", "c*ck", "damn", "dammit",
    "bastard", "cunt", "c*nt",
];

// Masked spellings keep their `*` and `$` inside a single token.
static TOKEN: Lazy<Regex> = Lazy::new(|| Regex::new(r"[\w*$]+").expect("token pattern is valid"));

/// Whole-word, case-insensitive word filter for user-entered lyrics.
#[derive(Debug, Clone)]
pub struct ProfanityFilter {
    words: HashSet<String>,
}

impl Default for ProfanityFilter {
    fn default() -> Self {
        Self { words: DEFAULT_WORDS.iter().map(|word| word.to_string()).collect() }
    }
}

impl ProfanityFilter {
    /// Returns the cleaned text and whether anything was replaced.
    pub fn clean_text(&self, text: &str) -> (String, bool) {
        let mut filtered = false;
        let cleaned = TOKEN.replace_all(text, |caps: &Captures| {
            let token = &caps[0];
            if self.words.contains(&token.to_lowercase()) {
                filtered = true;
                REPLACEMENT.to_string()
            } else {
                token.to_string()
            }
        });
        (cleaned.into_owned(), filtered)
    }

    pub fn is_clean(&self, text: &str) -> bool {
        !self.clean_text(text).1
    }
}
