//! Speech text preparation — markdown stripping before synthesis.
//!
//! The transcript shows the raw model output; only the copy handed to the
//! speech renderer goes through here, since markdown reads badly aloud.

use regex::Regex;
use std::sync::LazyLock;

/// Rewrite rules applied in order. Tables go before fenced code because a
/// table can sit inside a fence.
static RULES: LazyLock<Vec<(Regex, &'static str)>> = LazyLock::new(|| {
    [
        (r"(?m)(?:^|\n)(\|[^\n]+\|(?:\n\|[^\n]+\|)*)", "\nSee the table in our conversation.\n"),
        (r"(?s)```.*?```", " See the code in our conversation. "),
        // A reply cut off inside a fence.
        (r"(?s)```.*", " See the code in our conversation. "),
        (r"`[^`]+`", ""),
        (r"(?m)^[\s]*[-*_]{3,}[\s]*$", ""),
        (r"\*\*([^*]+)\*\*", "$1"),
        (r"\*([^*]+)\*", "$1"),
        (r"#{1,6}\s*", ""),
        (r"\[([^\]]+)\]\([^)]+\)", "$1"),
        // List items become short pauses.
        (r"(?m)^[\s]*[-*]\s+", ". "),
        (r"(?m)^[\s]*\d+\.\s+", ". "),
        (r"^\.\s*", ""),
        (r"\.\s*\.", "."),
        (r"\s{2,}", " "),
    ]
    .into_iter()
    .map(|(pattern, replacement)| (Regex::new(pattern).unwrap(), replacement))
    .collect()
});

/// Strip markdown formatting so text reads naturally when spoken.
pub fn clean_text_for_tts(text: &str) -> String {
    let cleaned = RULES.iter().fold(text.to_string(), |acc, (re, replacement)| {
        re.replace_all(&acc, *replacement).into_owned()
    });
    cleaned.trim().to_string()
}

/// Whether cleaned text is worth sending to the synthesizer at all.
pub fn is_speakable(text: &str) -> bool {
    text.trim().len() >= 2 && text.chars().any(char::is_alphanumeric)
}
