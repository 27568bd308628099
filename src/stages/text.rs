//! Text measurement and marker parsing shared by the stages.

use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

/// A line holding nothing but `[NAME]`.
static MARKER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^[ \t]*\[([^\[\]\n]+)\][ \t]*\r?$").unwrap());

/// How chapter length is measured.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LengthUnit {
    /// Every non-whitespace character
    #[default]
    Chars,
    /// CJK ideographs only (punctuation and latin text are not counted)
    Cjk,
}

impl std::fmt::Display for LengthUnit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LengthUnit::Chars => write!(f, "chars"),
            LengthUnit::Cjk => write!(f, "cjk"),
        }
    }
}

pub fn is_cjk(c: char) -> bool {
    matches!(c as u32,
        0x4E00..=0x9FFF | 0x3400..=0x4DBF | 0x20000..=0x2A6DF | 0xF900..=0xFAFF)
}

pub fn measure(text: &str, unit: LengthUnit) -> usize {
    match unit {
        LengthUnit::Chars => text.chars().filter(|c| !c.is_whitespace()).count(),
        LengthUnit::Cjk => text.chars().filter(|c| is_cjk(*c)).count(),
    }
}

const SENTENCE_ENDS: &[char] = &['.', '!', '?', '。', '！', '？', '…', '"', '”', '」'];

/// Cut `text` so it measures at most `max`, ending on a sentence boundary
/// when one exists. Returns the text unchanged if it already fits.
pub fn trim_to_sentence(text: &str, max: usize, unit: LengthUnit) -> String {
    if measure(text, unit) <= max {
        return text.to_string();
    }

    let mut counted = 0;
    let mut hard_cut = text.len();
    let mut last_boundary = None;
    for (idx, c) in text.char_indices() {
        let weight = measure(c.encode_utf8(&mut [0; 4]), unit);
        if counted + weight > max {
            hard_cut = idx;
            break;
        }
        counted += weight;
        if SENTENCE_ENDS.contains(&c) {
            last_boundary = Some(idx + c.len_utf8());
        }
    }

    let cut = last_boundary.unwrap_or(hard_cut);
    text[..cut].trim_end().to_string()
}

/// Truncate to `limit` characters, appending "..." when anything was dropped.
pub fn truncate_chars(text: &str, limit: usize) -> String {
    if text.chars().count() <= limit {
        return text.to_string();
    }
    let kept: String = text.chars().take(limit.saturating_sub(3)).collect();
    format!("{kept}...")
}

/// The last `limit` characters of `text`.
pub fn tail_chars(text: &str, limit: usize) -> String {
    let total = text.chars().count();
    text.chars().skip(total.saturating_sub(limit)).collect()
}

/// Split model output into `[MARKER]` delimited sections.
///
/// Marker names are upper-cased; text before the first marker is returned
/// under the empty name.
pub fn sections(output: &str) -> Vec<(String, String)> {
    let mut result = Vec::new();
    let mut current = String::new();
    let mut start = 0;

    for cap in MARKER.captures_iter(output) {
        let (Some(line), Some(name)) = (cap.get(0), cap.get(1)) else {
            continue;
        };
        push_section(&mut result, std::mem::take(&mut current), &output[start..line.start()]);
        current = name.as_str().trim().to_uppercase();
        start = line.end();
    }
    push_section(&mut result, current, &output[start..]);
    result
}

fn push_section(result: &mut Vec<(String, String)>, name: String, body: &str) {
    let body = body.trim();
    if !name.is_empty() || !body.is_empty() {
        result.push((name, body.to_string()));
    }
}

pub fn section<'a>(sections: &'a [(String, String)], name: &str) -> Option<&'a str> {
    sections
        .iter()
        .find(|(n, _)| n == name)
        .map(|(_, body)| body.as_str())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_measure_ignores_whitespace() {
        assert_eq!(measure("a b\nc", LengthUnit::Chars), 3);
        assert_eq!(measure("他说：hello。", LengthUnit::Cjk), 2);
        assert_eq!(measure("他说：hello。", LengthUnit::Chars), 9);
    }

    #[test]
    fn test_trim_to_sentence_prefers_boundary() {
        let text = "One. Two. Three four five.";
        let trimmed = trim_to_sentence(text, 10, LengthUnit::Chars);
        assert_eq!(trimmed, "One. Two.");
        assert!(measure(&trimmed, LengthUnit::Chars) <= 10);
    }

    #[test]
    fn test_trim_to_sentence_hard_cut_without_boundary() {
        let trimmed = trim_to_sentence("abcdefghij", 4, LengthUnit::Chars);
        assert_eq!(trimmed, "abcd");
    }

    #[test]
    fn test_trim_noop_when_within_limit() {
        assert_eq!(trim_to_sentence("short", 100, LengthUnit::Chars), "short");
    }

    #[test]
    fn test_trim_cjk_text() {
        let text = "他走了。她来了。天黑了。";
        let trimmed = trim_to_sentence(text, 7, LengthUnit::Chars);
        assert_eq!(trimmed, "他走了。");
    }

    #[test]
    fn test_truncate_and_tail() {
        assert_eq!(truncate_chars("abcdefgh", 6), "abc...");
        assert_eq!(truncate_chars("abc", 6), "abc");
        assert_eq!(tail_chars("abcdef", 2), "ef");
        assert_eq!(tail_chars("ab", 5), "ab");
    }

    #[test]
    fn test_sections_split_on_markers() {
        let output = "preamble\n[TITLE]\nThe Gate\n[TEXT]\nLine one\nLine two\n";
        let parsed = sections(output);
        assert_eq!(section(&parsed, ""), Some("preamble"));
        assert_eq!(section(&parsed, "TITLE"), Some("The Gate"));
        assert_eq!(section(&parsed, "TEXT"), Some("Line one\nLine two"));
        assert_eq!(section(&parsed, "NOTES"), None);
    }

    #[test]
    fn test_sections_marker_names_case_insensitive() {
        let parsed = sections("[key characters]\nAnna, Bo");
        assert_eq!(section(&parsed, "KEY CHARACTERS"), Some("Anna, Bo"));
    }

    #[test]
    fn test_sections_ignore_inline_brackets() {
        let output = "[TEXT]\r\nShe read [the letter] twice.\n  [ NOTES ]  \nnone\n[]\n";
        let parsed = sections(output);
        assert_eq!(section(&parsed, "TEXT"), Some("She read [the letter] twice."));
        assert_eq!(section(&parsed, "NOTES"), Some("none\n[]"));
    }
}
