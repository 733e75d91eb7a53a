use std::borrow::Cow;

use scraper::{Html, Node};

/// Elements whose text content is never part of the readable body.
const SKIPPED_ELEMENTS: [&str; 4] = ["script", "style", "noscript", "template"];

/// Converts an HTML (or plain text) fragment into whitespace-collapsed plain text.
///
/// Entities are decoded by the HTML parser, text inside `<script>`/`<style>`
/// is discarded, and adjacent text nodes are separated by a single space.
/// Input without any markup characters skips the parser entirely.
///
/// # Examples
///
/// ```
/// use feedloom::util::strip_markup;
///
/// assert_eq!(strip_markup("<p>Fish &amp; chips</p>"), "Fish & chips");
/// assert_eq!(strip_markup("plain   text"), "plain text");
/// ```
pub fn strip_markup(input: &str) -> String {
    if !input.contains('<') && !input.contains('&') {
        return collapse_whitespace(&strip_control_chars(input));
    }

    let fragment = Html::parse_fragment(input);
    let mut out = String::with_capacity(input.len());

    for node in fragment.tree.root().descendants() {
        let Node::Text(text) = node.value() else {
            continue;
        };
        let skipped = node.ancestors().any(|ancestor| match ancestor.value() {
            Node::Element(element) => SKIPPED_ELEMENTS.contains(&element.name()),
            _ => false,
        });
        if !skipped {
            out.push_str(text);
            out.push(' ');
        }
    }

    collapse_whitespace(&strip_control_chars(&out))
}

/// Trims the string and collapses every internal whitespace run to one space.
pub fn collapse_whitespace(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Removes control characters except tab, newline and carriage return.
///
/// Returns `Cow::Borrowed` when the input is already clean (the common case).
pub fn strip_control_chars(s: &str) -> Cow<'_, str> {
    let is_stripped = |c: char| c.is_control() && !matches!(c, '\t' | '\n' | '\r');

    if !s.chars().any(is_stripped) {
        return Cow::Borrowed(s);
    }

    Cow::Owned(s.chars().filter(|&c| !is_stripped(c)).collect())
}

/// Truncates `s` to at most `max_chars` characters, never splitting a code point.
///
/// Counts Unicode scalar values, not bytes, so CJK text is not cut short.
pub fn truncate_chars(s: &str, max_chars: usize) -> Cow<'_, str> {
    match s.char_indices().nth(max_chars) {
        Some((byte_end, _)) => Cow::Owned(s[..byte_end].trim_end().to_string()),
        None => Cow::Borrowed(s),
    }
}

/// Number of whitespace-separated words.
pub fn word_count(s: &str) -> usize {
    s.split_whitespace().count()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strip_markup_removes_tags() {
        assert_eq!(
            strip_markup("<div><p>Hello <em>there</em>,</p><p>reader</p></div>"),
            "Hello there , reader"
        );
    }

    #[test]
    fn test_strip_markup_drops_script_and_style() {
        let html = "<style>p { color: red }</style><p>Visible</p><script>alert(1)</script>";
        assert_eq!(strip_markup(html), "Visible");
    }

    #[test]
    fn test_strip_markup_decodes_entities() {
        assert_eq!(strip_markup("Tom &amp; Jerry &lt;3"), "Tom & Jerry <3");
    }

    #[test]
    fn test_strip_markup_plain_text_fast_path() {
        assert_eq!(strip_markup("  already\n\tplain  "), "already plain");
    }

    #[test]
    fn test_strip_control_chars_borrowed_when_clean() {
        let input = "line1\nline2\ttabbed";
        assert!(matches!(strip_control_chars(input), Cow::Borrowed(_)));
    }

    #[test]
    fn test_strip_control_chars_removes_controls() {
        assert_eq!(strip_control_chars("he\x00ll\x07o\x1b"), "hello");
    }

    #[test]
    fn test_truncate_chars_respects_code_points() {
        assert_eq!(truncate_chars("日本語テスト", 3), "日本語");
        assert_eq!(truncate_chars("short", 10), "short");
        assert_eq!(truncate_chars("", 0), "");
    }

    #[test]
    fn test_truncate_chars_trims_trailing_space() {
        assert_eq!(truncate_chars("hello world", 6), "hello");
    }

    #[test]
    fn test_word_count() {
        assert_eq!(word_count(" one two\tthree\n"), 3);
        assert_eq!(word_count(""), 0);
    }
}
