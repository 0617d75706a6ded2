//! Small string helpers shared by prompts and rendered output.

/// Folds every whitespace run (newlines included) into one space, so web
/// titles and user text cannot open a new prompt section or list item.
pub(crate) fn single_line(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Source title as markdown link text: one line, brackets and backslashes
/// escaped.
pub(crate) fn link_text(title: &str) -> String {
    let mut out = String::with_capacity(title.len());
    for c in single_line(title).chars() {
        if matches!(c, '\\' | '[' | ']') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

/// URL as a markdown link target. Parentheses and spaces would end the
/// target early, so they are percent-encoded.
pub(crate) fn link_target(url: &str) -> String {
    url.trim()
        .replace(' ', "%20")
        .replace('(', "%28")
        .replace(')', "%29")
}

/// Truncates to at most `max` chars, never splitting a character.
pub(crate) fn truncate_chars(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}
