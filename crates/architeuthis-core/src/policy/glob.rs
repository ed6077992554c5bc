//! Star-only glob matching for host patterns and rule operands.
//!
//! `*` matches any run of characters (including none); `\*` is a literal
//! asterisk. There are no other metacharacters, so `?` and brackets in
//! config values are matched verbatim.

/// Returns `true` if `pattern` contains at least one unescaped `*`.
#[must_use]
pub fn is_glob(pattern: &str) -> bool {
    let mut chars = pattern.chars();
    while let Some(c) = chars.next() {
        match c {
            '\\' => {
                // Escaped character, skip whatever follows.
                chars.next();
            }
            '*' => return true,
            _ => {}
        }
    }
    false
}

/// Replaces every `\*` with a literal `*`.
#[must_use]
pub fn unescape(pattern: &str) -> String {
    pattern.replace("\\*", "*")
}

/// Splits a pattern into literal segments separated by unescaped wildcards.
///
/// `\*` contributes a literal `*` to the current segment.
fn segments(pattern: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut current = String::new();
    let mut chars = pattern.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '\\' if chars.peek() == Some(&'*') => {
                chars.next();
                current.push('*');
            }
            '*' => {
                out.push(std::mem::take(&mut current));
                // Collapse runs of wildcards.
                while chars.peek() == Some(&'*') {
                    chars.next();
                }
            }
            _ => current.push(c),
        }
    }
    out.push(current);
    out
}

/// Matches `text` against `pattern`.
#[must_use]
pub fn glob_match(pattern: &str, text: &str) -> bool {
    let segs = segments(pattern);

    // No wildcard at all: exact comparison on the unescaped literal.
    if segs.len() == 1 {
        return segs[0] == text;
    }

    let first = &segs[0];
    let last = &segs[segs.len() - 1];

    if !text.starts_with(first.as_str()) {
        return false;
    }
    let mut rest = &text[first.len()..];

    // Middle segments must appear in order.
    for seg in &segs[1..segs.len() - 1] {
        if seg.is_empty() {
            continue;
        }
        match rest.find(seg.as_str()) {
            Some(idx) => rest = &rest[idx + seg.len()..],
            None => return false,
        }
    }

    rest.ends_with(last.as_str())
}
