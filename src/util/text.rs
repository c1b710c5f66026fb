use std::borrow::Cow;

/// Removes control characters that could corrupt terminal or log output.
///
/// C0 controls, DEL and C1 controls are dropped. Tab, newline and carriage
/// return survive. Returns `Cow::Borrowed` when nothing needed stripping.
pub fn strip_control_chars(s: &str) -> Cow<'_, str> {
    let is_stripped =
        |c: char| c.is_control() && c != '\t' && c != '\n' && c != '\r';

    if !s.chars().any(is_stripped) {
        return Cow::Borrowed(s);
    }
    Cow::Owned(s.chars().filter(|&c| !is_stripped(c)).collect())
}

/// Cleans a user- or feed-supplied display name (group or source title).
///
/// Strips control characters, folds any run of whitespace (including line
/// breaks) into one space and trims. Returns `None` when nothing is left.
pub fn sanitize_name(name: &str) -> Option<String> {
    let cleaned = strip_control_chars(name);
    let folded = cleaned.split_whitespace().collect::<Vec<_>>().join(" ");
    if folded.is_empty() {
        None
    } else {
        Some(folded)
    }
}

/// Canonical form of a category label: sanitized, then lower-cased.
pub fn normalize_category(name: &str) -> Option<String> {
    sanitize_name(name).map(|n| n.to_lowercase())
}
