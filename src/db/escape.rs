//! SQL literal quoting.

/// Wrap `s` in `quote_char`, escaping embedded quotes.
///
/// # Arguments
/// * `s` - The string to quote
/// * `quote_char` - The quote character (`'` for literals, `"` for identifiers)
/// * `escape_backslash` - Also double backslashes, for dialects where `\` is an escape character
pub fn quote_with(s: &str, quote_char: char, escape_backslash: bool) -> String {
    let mut result = String::with_capacity(s.len() + 2);
    result.push(quote_char);
    for c in s.chars() {
        match c {
            '\\' if escape_backslash => result.push_str("\\\\"),
            c if c == quote_char => {
                result.push(c);
                result.push(c);
            }
            c => result.push(c),
        }
    }
    result.push(quote_char);
    result
}

/// Single-quoted literal with quotes and backslashes doubled.
#[inline]
pub fn escape_string(s: &str) -> String {
    quote_with(s, '\'', true)
}

/// Single-quoted literal for standard-conforming dialects (only quotes doubled).
#[inline]
pub fn escape_string_standard(s: &str) -> String {
    quote_with(s, '\'', false)
}

/// Double-quoted identifier.
#[inline]
pub fn quote_identifier(s: &str) -> String {
    quote_with(s, '"', false)
}

/// Reverse of [`escape_string`]: strip the quotes and undo doubling.
pub fn unescape_string(literal: &str) -> Option<String> {
    let inner = literal.strip_prefix('\'')?.strip_suffix('\'')?;
    let mut result = String::with_capacity(inner.len());
    let mut chars = inner.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '\\' | '\'' => {
                if chars.peek() == Some(&c) {
                    chars.next();
                }
                result.push(c);
            }
            c => result.push(c),
        }
    }
    Some(result)
}

/// True for plain or dotted identifiers such as `name` or `customer.name`.
pub fn is_identifier(s: &str) -> bool {
    !s.is_empty()
        && s.split('.').all(|part| {
            let mut chars = part.chars();
            matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
                && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
        })
}
