//! Shell escaping and quoting utilities.

/// Escape a value for use inside single quotes.
/// Replaces `'` with `'\''` (end quote, escaped quote, start quote).
pub fn escape_single_quote_content(value: &str) -> String {
    value.replace('\'', "'\\''")
}

/// Quote a path for shell execution (always quotes).
pub fn quote_path(path: &str) -> String {
    format!("'{}'", escape_single_quote_content(path))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quote_path_wraps_and_escapes() {
        assert_eq!(quote_path("/tmp/a b"), "'/tmp/a b'");
        assert_eq!(quote_path("it's"), "'it'\\''s'");
    }

    #[test]
    fn single_quotes_are_broken_out() {
        assert_eq!(escape_single_quote_content("a'b"), "a'\\''b");
    }
}
