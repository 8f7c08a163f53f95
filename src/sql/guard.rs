//! Lexical guard over SQL clause fragments.
//!
//! Nothing here parses SQL. Fragments are scanned for comments, statement separators,
//! `*` and keywords that would let one clause leak into the next. String literals
//! (`'...'` with `''`), bracketed identifiers (`[...]`) and double-quoted identifiers
//! (`"..."` with `""`) are opaque to every check.

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GuardError {
    #[error("No asterisks are allowed in any query clause")]
    Asterisk,
    #[error("No semicolons are allowed in any query clause")]
    Semicolon,
    #[error("Too many closing parentheses encountered")]
    TooManyClosing,
    #[error("{depth} {} left unclosed", paren_noun(.depth))]
    Unclosed { depth: usize },
}

fn paren_noun(depth: &usize) -> &'static str {
    if *depth == 1 {
        "parenthesis"
    } else {
        "parentheses"
    }
}

/// `@` followed by a regular T-SQL identifier, at most 128 characters in all.
pub fn is_variable_name(name: &str) -> bool {
    let mut chars = name.chars();
    name.len() <= 128
        && chars.next() == Some('@')
        && chars.next().is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '@' | '#' | '$'))
}

/// Names the driver binds positional values to (`@P1`, `@p2`, ...). Variable names
/// compare case-insensitively on the server.
pub fn is_positional_name(name: &str) -> bool {
    let digits = name.get(2..).unwrap_or_default();
    name.get(..2).is_some_and(|p| p.eq_ignore_ascii_case("@p"))
        && !digits.is_empty()
        && digits.bytes().all(|b| b.is_ascii_digit())
}

/// Remove `--` and `/* */` comments outside string literals.
///
/// A `*` or `;` outside a string literal or comment is an error. Line comments stop
/// before the line break, which is kept.
pub fn strip_comments(s: &str) -> Result<String, GuardError> {
    let mut out = String::with_capacity(s.len());
    let mut chars = s.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '\'' => {
                out.push('\'');
                while let Some(c) = chars.next() {
                    out.push(c);
                    if c == '\'' {
                        if chars.peek() == Some(&'\'') {
                            chars.next();
                            out.push('\'');
                        } else {
                            break;
                        }
                    }
                }
            }
            '-' if chars.peek() == Some(&'-') => {
                while let Some(&c) = chars.peek() {
                    if c == '\r' || c == '\n' {
                        break;
                    }
                    chars.next();
                }
            }
            '/' if chars.peek() == Some(&'*') => {
                chars.next();
                while let Some(c) = chars.next() {
                    if c == '*' && chars.peek() == Some(&'/') {
                        chars.next();
                        break;
                    }
                }
            }
            '*' => return Err(GuardError::Asterisk),
            ';' => return Err(GuardError::Semicolon),
            c => out.push(c),
        }
    }
    Ok(out)
}

/// Index just past the quoted run opened at `open`. `doubled` allows the closing
/// character to be escaped by repeating it. Unterminated runs extend to the end.
fn skip_quoted(chars: &[char], open: usize, close: char, doubled: bool) -> usize {
    let mut i = open + 1;
    while i < chars.len() {
        if chars[i] == close {
            if doubled && chars.get(i + 1) == Some(&close) {
                i += 2;
                continue;
            }
            return i + 1;
        }
        i += 1;
    }
    i
}

/// True if a run of letters/underscores at parenthesis depth 0 equals (ignoring case)
/// one of `keywords`. Unbalanced parentheses, `*` and `;` are errors.
pub fn contains_keywords(s: &str, keywords: &[&str]) -> Result<bool, GuardError> {
    let chars: Vec<char> = s.chars().collect();
    let is_keyword = |start: usize, end: usize| {
        let word: String = chars[start..end].iter().collect();
        keywords.iter().any(|k| k.eq_ignore_ascii_case(&word))
    };

    let mut depth: usize = 0;
    let mut word_start: Option<usize> = None;
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        if c.is_alphabetic() || c == '_' {
            word_start.get_or_insert(i);
            i += 1;
            continue;
        }
        if let Some(start) = word_start.take() {
            if depth == 0 && is_keyword(start, i) {
                return Ok(true);
            }
        }
        match c {
            '\'' => i = skip_quoted(&chars, i, '\'', true),
            '"' => i = skip_quoted(&chars, i, '"', true),
            '[' => i = skip_quoted(&chars, i, ']', false),
            '(' => {
                depth += 1;
                i += 1;
            }
            ')' => {
                depth = depth.checked_sub(1).ok_or(GuardError::TooManyClosing)?;
                i += 1;
            }
            '*' => return Err(GuardError::Asterisk),
            ';' => return Err(GuardError::Semicolon),
            _ => i += 1,
        }
    }

    if depth > 0 {
        return Err(GuardError::Unclosed { depth });
    }
    if let Some(start) = word_start {
        if is_keyword(start, chars.len()) {
            return Ok(true);
        }
    }
    Ok(false)
}
