//! Small text helpers for titles and snippets.

/// Collapse every whitespace run into a single space and trim the ends.
pub fn collapse_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// First `max_chars` characters of `text`, with trailing whitespace trimmed.
pub fn truncate_chars(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((cut, _)) => text[..cut].trim_end().to_string(),
        None => text.to_string(),
    }
}

/// Collapsed, truncated excerpt; `None` when nothing remains.
pub fn snippet(text: &str, max_chars: usize) -> Option<String> {
    let collapsed = collapse_whitespace(text);
    if collapsed.is_empty() {
        return None;
    }
    Some(truncate_chars(&collapsed, max_chars))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn collapses_runs() {
        assert_eq!(collapse_whitespace("  Fed\n\n holds \t rates "), "Fed holds rates");
        assert_eq!(collapse_whitespace(" \n "), "");
    }

    #[test]
    fn truncates_on_char_boundaries() {
        assert_eq!(truncate_chars("héllo wörld", 5), "héllo");
        assert_eq!(truncate_chars("abc def", 4), "abc");
        assert_eq!(truncate_chars("short", 50), "short");
    }

    #[test]
    fn snippet_of_blank_is_none() {
        assert_eq!(snippet("   ", 10), None);
        assert_eq!(snippet("a  b c", 3).as_deref(), Some("a b"));
    }
}
