//! UTF-8 safe string helpers.
//!
//! Tool output and summaries are truncated by characters, never by byte
//! index, so multibyte text cannot cause a panic.

/// Return the first `n` characters of `s`.
pub fn prefix_chars(s: &str, n: usize) -> String {
    s.chars().take(n).collect()
}

/// Return `s` cut to `n` characters, with a trailing `...` if it was longer.
pub fn preview(s: &str, n: usize) -> String {
    let mut prefix = prefix_chars(s, n);
    if s.chars().count() > n {
        prefix.push_str("...");
    }
    prefix
}

/// Cut `s` to `n` characters and note how much was dropped.
///
/// Used for tool output returned to the model.
pub fn truncate_with_notice(s: &str, n: usize) -> String {
    let total = s.chars().count();
    if total <= n {
        return s.to_string();
    }
    format!(
        "{}\n... [truncated {} of {} characters]",
        prefix_chars(s, n),
        total - n,
        total
    )
}
