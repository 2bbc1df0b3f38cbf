//! Key validation and pattern translation.
//!
//! Cache patterns use the key model's glob syntax: `*` matches one key
//! segment, `**` matches any number of segments. Each backend scans with its
//! own dialect, so patterns are tokenized once and rendered per backend.
//! Everything that is not a placeholder is a literal; in particular the `/`
//! separator never acts as a wildcard or escape.

use glob::Pattern;
use regex::Regex;
use strata_core::{CacheError, CacheResult, KEY_SEPARATOR};

#[derive(Debug, Clone, PartialEq, Eq)]
enum Token {
    Literal(String),
    OneLevel,
    AnyLevel,
}

fn tokenize(pattern: &str) -> Vec<Token> {
    let mut tokens = Vec::new();
    let mut literal = String::new();
    let mut chars = pattern.chars().peekable();

    while let Some(c) = chars.next() {
        if c != '*' {
            literal.push(c);
            continue;
        }
        if !literal.is_empty() {
            tokens.push(Token::Literal(std::mem::take(&mut literal)));
        }
        if chars.peek() == Some(&'*') {
            while chars.peek() == Some(&'*') {
                chars.next();
            }
            tokens.push(Token::AnyLevel);
        } else {
            tokens.push(Token::OneLevel);
        }
    }
    if !literal.is_empty() {
        tokens.push(Token::Literal(literal));
    }
    tokens
}

/// Render a pattern as an anchored regex in which every placeholder matches
/// any characters, separators included.
pub fn glob_to_regex(pattern: &str) -> Result<Regex, regex::Error> {
    let mut source = String::with_capacity(pattern.len() + 8);
    source.push('^');
    for token in tokenize(pattern) {
        match token {
            Token::Literal(text) => source.push_str(&regex::escape(&text)),
            Token::OneLevel | Token::AnyLevel => source.push_str(".*"),
        }
    }
    source.push('$');
    Regex::new(&source)
}

/// Render a pattern as a path glob.
///
/// `*` stays within one path component and `**` spans directories. Literal
/// text is escaped so `?`, `[` and `]` in keys match themselves.
pub fn glob_to_path(pattern: &str) -> String {
    let mut rendered = String::with_capacity(pattern.len() + 4);
    for token in tokenize(pattern) {
        match token {
            Token::Literal(text) => rendered.push_str(&Pattern::escape(&text)),
            Token::OneLevel => rendered.push('*'),
            Token::AnyLevel => rendered.push_str("**"),
        }
    }
    rendered
}

/// Render a pattern in Redis `SCAN MATCH` syntax.
///
/// Backslashes are escaped first so that literal separators from any platform
/// reach the server as literals; `?`, `[` and `]` are escaped because Redis
/// treats them as glob syntax.
pub fn glob_to_redis(pattern: &str) -> String {
    let mut rendered = String::with_capacity(pattern.len() + 4);
    for token in tokenize(pattern) {
        match token {
            Token::Literal(text) => {
                for c in text.chars() {
                    if matches!(c, '\\' | '?' | '[' | ']') {
                        rendered.push('\\');
                    }
                    rendered.push(c);
                }
            }
            Token::OneLevel | Token::AnyLevel => rendered.push('*'),
        }
    }
    rendered
}

/// Reject keys that cannot be stored.
///
/// A stored key must be non-empty, must not contain placeholders (they would
/// collide with scans), and must not climb out of its namespace with `..`.
pub fn validate_key(key: &str) -> CacheResult<()> {
    let reason = if key.trim().is_empty() {
        "key is empty"
    } else if key.contains('*') {
        "wildcards are only valid in patterns"
    } else if key.contains('\0') {
        "key contains a NUL byte"
    } else if key.split(KEY_SEPARATOR).any(|segment| segment == "..") {
        "parent segments are not allowed"
    } else {
        return Ok(());
    };
    Err(CacheError::InvalidKey {
        key: key.to_string(),
        reason: reason.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_regex_placeholders_cross_segments() {
        let re = glob_to_regex("datasets/d1/*").expect("valid regex");
        assert!(re.is_match("datasets/d1/items/i1/object"));
        assert!(!re.is_match("datasets/d10"));

        let re = glob_to_regex("projects/**/datasets/*").expect("valid regex");
        assert!(re.is_match("projects/a/b/datasets/d1"));
        assert!(!re.is_match("orgs/projects/p1/datasets/d1"));
    }

    #[test]
    fn test_regex_significant_literals_are_escaped() {
        let re = glob_to_regex("items/a.b+c(1)/*").expect("valid regex");
        assert!(re.is_match("items/a.b+c(1)/object"));
        assert!(!re.is_match("items/aXb+c(1)/object"));
    }

    #[test]
    fn test_redis_rendering() {
        assert_eq!(glob_to_redis("datasets/*/items/i1/*"), "datasets/*/items/i1/*");
        assert_eq!(glob_to_redis("projects/**/datasets/*"), "projects/*/datasets/*");
        assert_eq!(glob_to_redis(r"items\i1/*"), r"items\\i1/*");
        assert_eq!(glob_to_redis("items/a?[b]/*"), r"items/a\?\[b\]/*");
    }

    #[test]
    fn test_path_rendering() {
        assert_eq!(glob_to_path("projects/**/datasets/*"), "projects/**/datasets/*");
        assert_eq!(glob_to_path("items/a?[b]/*"), "items/a[?][[]b[]]/*");

        let glob = Pattern::new(&glob_to_path("items/a[1]/*")).expect("valid glob");
        assert!(glob.matches("items/a[1]/object"));
        assert!(!glob.matches("items/a1/object"));
    }

    #[test]
    fn test_validate_key() {
        assert!(validate_key("items/i1/object").is_ok());
        assert!(validate_key("datasets/d1/items/i1/binary").is_ok());

        for bad in ["", "   ", "items/*/object", "items/../object", "a\0b"] {
            let err = validate_key(bad).expect_err("key should be rejected");
            assert!(matches!(err, CacheError::InvalidKey { .. }), "{bad:?}");
        }
    }
}
