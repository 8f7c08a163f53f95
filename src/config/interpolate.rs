//! `{token}` substitution in descriptor strings.

use crate::config::types::NameMap;
use once_cell::sync::Lazy;
use regex::{Captures, Regex};

// Constant pattern, compiled by the `token_pattern_compiles` test.
static TOKEN_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\{\{|\}\}|\{([^{}]*)\}").expect("token pattern is valid"));

/// Token dictionary for one scope. Keys are case-insensitive; a `null` token value is
/// kept so that it can shadow an inherited one.
pub type Tokens = NameMap<Option<String>>;

/// Replace `{name}` with the token's value; unknown or null tokens become empty.
/// `{{` and `}}` produce literal braces.
pub fn interpolate(text: &str, tokens: &Tokens) -> String {
    if !text.contains('{') && !text.contains('}') {
        return text.to_string();
    }
    TOKEN_RE
        .replace_all(text, |caps: &Captures| match caps.get(1) {
            Some(name) => tokens
                .get(name.as_str())
                .and_then(|v| v.clone())
                .unwrap_or_default(),
            None => caps[0][..1].to_string(),
        })
        .into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tokens() -> Tokens {
        let mut t = Tokens::new();
        t.insert("db", Some("SalesDb".into()));
        t.insert("Schema", Some("dbo".into()));
        t.insert("nothing", None);
        t
    }

    #[test]
    fn token_pattern_compiles() {
        assert_eq!(Lazy::force(&TOKEN_RE).captures_len(), 2);
    }

    #[test]
    fn replaces_known_tokens_case_insensitively() {
        assert_eq!(interpolate("{schema}.Orders in {DB}", &tokens()), "dbo.Orders in SalesDb");
    }

    #[test]
    fn unknown_and_null_tokens_are_empty() {
        assert_eq!(interpolate("a{missing}b{nothing}c", &tokens()), "abc");
    }

    #[test]
    fn doubled_braces_escape() {
        assert_eq!(interpolate("{{db}} {db}", &tokens()), "{db} SalesDb");
        assert_eq!(interpolate("}}", &tokens()), "}");
    }

    #[test]
    fn text_without_braces_is_untouched() {
        assert_eq!(interpolate("SELECT 1", &tokens()), "SELECT 1");
    }
}
