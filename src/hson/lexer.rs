//! Pull-based HSON lexer.
//!
//! HSON is JSON plus `//` and `/* */` comments, `@"..."` verbatim (multi-line) string
//! literals and `@import("path")` directives. [`HsonLexer`] yields the equivalent
//! strict JSON one character at a time and records a [`SourceMap`] for everything it
//! emitted. The JSON subset is only tokenized here, never validated; a JSON parser
//! downstream reports structural errors.

use crate::error::LexError;
use crate::hson::import::{HsonSource, ImportResolver};
use crate::hson::source_map::SourceMap;
use std::collections::VecDeque;
use std::sync::Arc;

/// How whitespace from the HSON source is carried into the JSON output.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum WhitespaceHandling {
    /// Drop all whitespace.
    #[default]
    NoWhitespace,
    /// Drop all whitespace but emit one space after each `:` and `,`.
    OnlySpaceAfterCommaColon,
    /// Keep source whitespace verbatim, including newlines inside comments.
    Untouched,
}

impl std::str::FromStr for WhitespaceHandling {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "none" | "nowhitespace" => Ok(WhitespaceHandling::NoWhitespace),
            "comma-colon" | "onlyspaceaftercommacolon" => Ok(WhitespaceHandling::OnlySpaceAfterCommaColon),
            "untouched" => Ok(WhitespaceHandling::Untouched),
            other => Err(format!("unknown whitespace handling '{}'", other)),
        }
    }
}

fn is_word_char(c: char) -> bool {
    c.is_alphanumeric() || c == '_' || c == '.'
}

/// Character cursor tracking 1-based line/column of the next character.
struct Cursor {
    chars: Vec<char>,
    index: usize,
    line: u32,
    column: u32,
}

impl Cursor {
    fn new(text: &str) -> Self {
        Cursor {
            chars: text.chars().collect(),
            index: 0,
            line: 1,
            column: 1,
        }
    }

    fn peek(&self) -> Option<char> {
        self.chars.get(self.index).copied()
    }

    fn position(&self) -> (u32, u32) {
        (self.line, self.column)
    }

    fn bump(&mut self) -> Option<char> {
        let c = self.peek()?;
        self.index += 1;
        match c {
            // CR does not move the column.
            '\r' => {}
            '\n' => {
                self.line += 1;
                self.column = 1;
            }
            _ => self.column += 1,
        }
        Some(c)
    }
}

struct ActiveImport {
    lexer: HsonLexer,
    /// Output offset at which the imported stream started.
    start: usize,
}

/// Lazily transpiles one HSON source (and its imports) into strict JSON characters.
///
/// The iterator is finite and not restartable; after the first `Err` it yields `None`.
pub struct HsonLexer {
    name: Arc<str>,
    cursor: Cursor,
    whitespace: WhitespaceHandling,
    resolver: Arc<dyn ImportResolver>,
    /// Names of the sources currently being lexed, outermost first, this one last.
    chain: Vec<Arc<str>>,
    pending: VecDeque<(char, u32, u32)>,
    import: Option<Box<ActiveImport>>,
    map: SourceMap,
    offset: usize,
    expected: Option<(u32, u32)>,
    finished: bool,
}

impl HsonLexer {
    pub fn new(source: HsonSource, whitespace: WhitespaceHandling, resolver: Arc<dyn ImportResolver>) -> Self {
        Self::with_chain(source, whitespace, resolver, Vec::new())
    }

    fn with_chain(
        source: HsonSource,
        whitespace: WhitespaceHandling,
        resolver: Arc<dyn ImportResolver>,
        mut chain: Vec<Arc<str>>,
    ) -> Self {
        let name: Arc<str> = Arc::from(source.name.as_str());
        chain.push(name.clone());
        HsonLexer {
            name,
            cursor: Cursor::new(&source.text),
            whitespace,
            resolver,
            chain,
            pending: VecDeque::with_capacity(64),
            import: None,
            map: SourceMap::new(),
            offset: 0,
            expected: None,
            finished: false,
        }
    }

    pub fn source_map(&self) -> &SourceMap {
        &self.map
    }

    pub fn into_source_map(self) -> SourceMap {
        self.map
    }

    /// Bytes emitted so far.
    pub fn output_len(&self) -> usize {
        self.offset
    }

    fn error_at(&self, (line, column): (u32, u32), message: impl Into<String>) -> LexError {
        LexError {
            source_name: self.name.to_string(),
            line,
            column,
            message: message.into(),
        }
    }

    fn push(&mut self, c: char, (line, column): (u32, u32)) {
        self.pending.push_back((c, line, column));
    }

    fn emit(&mut self, c: char, line: u32, column: u32) -> char {
        if self.expected != Some((line, column)) {
            self.map.record(self.offset, self.name.clone(), line, column);
        }
        // Multi-byte output breaks the byte/column correspondence within a segment.
        self.expected = if c.len_utf8() == 1 { Some((line, column + 1)) } else { None };
        self.offset += c.len_utf8();
        c
    }

    /// Lex one token into `pending`, or open an import. Returns false at end of input.
    fn lex(&mut self) -> Result<bool, LexError> {
        let pos = self.cursor.position();
        let c = match self.cursor.bump() {
            Some(c) => c,
            None => return Ok(false),
        };
        match c {
            '/' => self.comment(pos)?,
            '@' => self.directive(pos)?,
            '"' => self.string(pos)?,
            '{' | '}' | '[' | ']' => self.push(c, pos),
            ':' | ',' => {
                self.push(c, pos);
                if self.whitespace == WhitespaceHandling::OnlySpaceAfterCommaColon {
                    self.push(' ', pos);
                }
            }
            c if c.is_whitespace() => {
                if self.whitespace == WhitespaceHandling::Untouched {
                    self.push(c, pos);
                }
            }
            c if is_word_char(c) => self.word(c, pos),
            other => {
                return Err(self.error_at(pos, format!("Unexpected character '{}'", other.escape_default())));
            }
        }
        Ok(true)
    }

    fn comment(&mut self, start: (u32, u32)) -> Result<(), LexError> {
        let pos = self.cursor.position();
        match self.cursor.bump() {
            Some('/') => {
                // The terminating newline is left for the whitespace rule.
                while let Some(c) = self.cursor.peek() {
                    if c == '\r' || c == '\n' {
                        break;
                    }
                    self.cursor.bump();
                }
                Ok(())
            }
            Some('*') => loop {
                let pos = self.cursor.position();
                match self.cursor.bump() {
                    None => return Err(self.error_at(pos, "Unterminated block comment")),
                    Some('*') if self.cursor.peek() == Some('/') => {
                        self.cursor.bump();
                        return Ok(());
                    }
                    Some(c @ ('\r' | '\n')) if self.whitespace == WhitespaceHandling::Untouched => self.push(c, pos),
                    Some(_) => {}
                }
            },
            None => Err(self.error_at(pos, "Unexpected end of stream")),
            Some(_) => Err(self.error_at(start, "Unknown comment type")),
        }
    }

    fn string(&mut self, open: (u32, u32)) -> Result<(), LexError> {
        self.push('"', open);
        loop {
            let pos = self.cursor.position();
            match self.cursor.bump() {
                None => return Err(self.error_at(pos, "Unterminated string literal")),
                Some('"') => {
                    self.push('"', pos);
                    return Ok(());
                }
                Some('\\') => {
                    // Escapes are forwarded untouched; only `\"` matters for termination.
                    self.push('\\', pos);
                    let pos = self.cursor.position();
                    match self.cursor.bump() {
                        None => return Err(self.error_at(pos, "Unterminated string literal")),
                        Some(c) => self.push(c, pos),
                    }
                }
                Some(c) => self.push(c, pos),
            }
        }
    }

    fn verbatim_string(&mut self, open: (u32, u32)) -> Result<(), LexError> {
        self.push('"', open);
        loop {
            let pos = self.cursor.position();
            match self.cursor.bump() {
                None => return Err(self.error_at(pos, "Unterminated @\"...\" string literal")),
                Some('"') => {
                    if self.cursor.peek() == Some('"') {
                        let second = self.cursor.position();
                        self.cursor.bump();
                        self.push('\\', pos);
                        self.push('"', second);
                    } else {
                        self.push('"', pos);
                        return Ok(());
                    }
                }
                Some('\\') => {
                    self.push('\\', pos);
                    self.push('\\', pos);
                }
                Some('\r') => {
                    self.push('\\', pos);
                    self.push('r', pos);
                }
                Some('\n') => {
                    self.push('\\', pos);
                    self.push('n', pos);
                }
                Some(c) => self.push(c, pos),
            }
        }
    }

    fn directive(&mut self, at: (u32, u32)) -> Result<(), LexError> {
        let pos = self.cursor.position();
        match self.cursor.peek() {
            None => Err(self.error_at(pos, "Unexpected end of stream")),
            Some('"') => {
                self.cursor.bump();
                self.verbatim_string(pos)
            }
            Some(c) if c.is_alphabetic() => {
                let mut word = String::with_capacity(8);
                while let Some(c) = self.cursor.peek().filter(|c| c.is_alphabetic()) {
                    word.push(c);
                    self.cursor.bump();
                }
                if word == "import" {
                    self.import(at)
                } else {
                    Err(self.error_at(at, format!("Unknown directive '@{}'", word)))
                }
            }
            Some(_) => Err(self.error_at(pos, "Unknown @directive")),
        }
    }

    fn expect(&mut self, expected: char) -> Result<(), LexError> {
        let pos = self.cursor.position();
        match self.cursor.bump() {
            Some(c) if c == expected => Ok(()),
            _ => Err(self.error_at(pos, format!("Expected '{}'", expected))),
        }
    }

    fn import(&mut self, at: (u32, u32)) -> Result<(), LexError> {
        self.expect('(')?;
        self.expect('"')?;
        let mut path = String::with_capacity(64);
        loop {
            let pos = self.cursor.position();
            match self.cursor.bump() {
                None => return Err(self.error_at(pos, "Expected '\"'")),
                Some('"') => break,
                Some(c) => path.push(c),
            }
        }
        self.expect(')')?;

        let source = self
            .resolver
            .resolve(&self.name, &path)
            .map_err(|e| self.error_at(at, format!("Could not import '{}': {}", path, e)))?;
        if self.chain.iter().any(|open| **open == *source.name) {
            return Err(self.error_at(at, format!("Recursive import of '{}'", source.name)));
        }
        tracing::debug!(importer = %self.name, imported = %source.name, "hson import");
        let lexer = HsonLexer::with_chain(source, self.whitespace, self.resolver.clone(), self.chain.clone());
        self.import = Some(Box::new(ActiveImport {
            lexer,
            start: self.offset,
        }));
        Ok(())
    }

    fn word(&mut self, first: char, pos: (u32, u32)) {
        self.push(first, pos);
        while let Some(c) = self.cursor.peek().filter(|&c| is_word_char(c)) {
            let pos = self.cursor.position();
            self.cursor.bump();
            self.push(c, pos);
        }
    }
}

impl Iterator for HsonLexer {
    type Item = Result<char, LexError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if self.finished {
                return None;
            }
            if let Some(import) = self.import.as_mut() {
                match import.lexer.next() {
                    Some(Ok(c)) => {
                        self.offset += c.len_utf8();
                        return Some(Ok(c));
                    }
                    Some(Err(e)) => {
                        self.finished = true;
                        return Some(Err(e));
                    }
                    None => {}
                }
                if let Some(done) = self.import.take() {
                    self.map.append_shifted(done.lexer.map, done.start);
                    self.expected = None;
                }
                continue;
            }
            if let Some((c, line, column)) = self.pending.pop_front() {
                return Some(Ok(self.emit(c, line, column)));
            }
            match self.lex() {
                Ok(true) => continue,
                Ok(false) => {
                    self.finished = true;
                    return None;
                }
                Err(e) => {
                    self.finished = true;
                    return Some(Err(e));
                }
            }
        }
    }
}

/// Strict JSON text and the map back to its HSON sources.
#[derive(Debug)]
pub struct Transpiled {
    pub json: String,
    pub source_map: SourceMap,
}

/// Run the lexer to completion.
pub fn transpile(
    source: HsonSource,
    whitespace: WhitespaceHandling,
    resolver: Arc<dyn ImportResolver>,
) -> Result<Transpiled, LexError> {
    let mut lexer = HsonLexer::new(source, whitespace, resolver);
    let mut json = String::new();
    for c in lexer.by_ref() {
        json.push(c?);
    }
    Ok(Transpiled {
        json,
        source_map: lexer.into_source_map(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hson::import::{MemoryResolver, NoImports};

    fn lex(text: &str) -> Result<String, LexError> {
        lex_with(text, WhitespaceHandling::NoWhitespace)
    }

    fn lex_with(text: &str, ws: WhitespaceHandling) -> Result<String, LexError> {
        transpile(HsonSource::new("test.hson", text), ws, Arc::new(NoImports)).map(|t| t.json)
    }

    #[test]
    fn passes_plain_json_through_without_whitespace() {
        assert_eq!(lex("{ \"key\" : [1, 2.5, true, null] }").unwrap(), "{\"key\":[1,2.5,true,null]}");
        assert_eq!(lex("").unwrap(), "");
        assert_eq!(lex("\"word!\"").unwrap(), "\"word!\"");
    }

    #[test]
    fn drops_comments() {
        assert_eq!(lex("/* hello world*/{}").unwrap(), "{}");
        assert_eq!(lex("// hello world\n{}").unwrap(), "{}");
        assert_eq!(lex("{}// trailing").unwrap(), "{}");
        assert_eq!(lex("/********/").unwrap(), "");
        assert_eq!(lex("[/* help! */1,2,3/*toomuch*/4]").unwrap(), "[1,2,3,4]");
    }

    #[test]
    fn string_escapes_are_forwarded_verbatim() {
        assert_eq!(lex(r#""abc\"word""#).unwrap(), r#""abc\"word""#);
        assert_eq!(lex(r#""a\u01C3bcd""#).unwrap(), r#""a\u01C3bcd""#);
    }

    #[test]
    fn verbatim_literal_escapes_quotes_backslashes_and_newlines() {
        let out = lex("@\"multiline\r\ntest \"\"here\"\" c:\\x\"").unwrap();
        assert_eq!(out, r#""multiline\r\ntest \"here\" c:\\x""#);
    }

    #[test]
    fn space_after_comma_colon_mode() {
        let out = lex_with("{\"a\":1,\"b\" :  [1,2]}", WhitespaceHandling::OnlySpaceAfterCommaColon).unwrap();
        assert_eq!(out, "{\"a\": 1, \"b\": [1, 2]}");
    }

    #[test]
    fn untouched_mode_keeps_whitespace_and_comment_newlines() {
        let out = lex_with("{\n  /* a\n b */ \"a\": 1 // x\n}", WhitespaceHandling::Untouched).unwrap();
        assert_eq!(out, "{\n  \n \"a\": 1 \n}");
    }

    #[test]
    fn failures_carry_positions() {
        for (input, line, column) in [
            ("/********", 1, 10),
            ("@\"", 1, 3),
            ("\"", 1, 2),
            ("\"\\", 1, 3),
            ("/+", 1, 1),
            ("{\n  a / b", 2, 5),
        ] {
            let err = lex(input).unwrap_err();
            assert_eq!((err.line, err.column), (line, column), "input {:?}: {}", input, err);
        }
    }

    #[test]
    fn unknown_directive_and_bad_characters() {
        assert!(lex("@include(\"x\")").unwrap_err().message.contains("Unknown directive"));
        assert!(lex("@1").unwrap_err().message.contains("Unknown @directive"));
        assert!(lex("{\"a\": -1}").unwrap_err().message.contains("Unexpected character"));
        assert!(lex("@import(x)").unwrap_err().message.contains("Expected '\"'"));
        assert!(lex("@import \"x\"").unwrap_err().message.contains("Expected '('"));
    }

    #[test]
    fn imports_splice_output_and_shift_source_map() {
        let resolver = MemoryResolver::new().with_file("cfg/types.hson", "{ \"int\": 1 }");
        let t = transpile(
            HsonSource::new("cfg/main.hson", "{\"t\": @import(\"types.hson\"), \"z\": 2}"),
            WhitespaceHandling::NoWhitespace,
            Arc::new(resolver),
        )
        .unwrap();
        assert_eq!(t.json, "{\"t\":{\"int\":1},\"z\":2}");

        let inner = t.json.find("\"int\"").unwrap();
        let pos = t.source_map.locate(inner).unwrap();
        assert!(pos.name.ends_with("types.hson"));
        assert_eq!((pos.line, pos.column), (1, 3));

        let after = t.json.find("\"z\"").unwrap();
        let pos = t.source_map.locate(after).unwrap();
        assert_eq!(&*pos.name, "cfg/main.hson");
        assert_eq!((pos.line, pos.column), (1, 30));
    }

    #[test]
    fn recursive_import_fails() {
        let resolver = MemoryResolver::new()
            .with_file("cfg/a.hson", "[@import(\"b.hson\")]")
            .with_file("cfg/b.hson", "[@import(\"a.hson\")]");
        let err = transpile(
            HsonSource::new("cfg/a.hson", "[@import(\"b.hson\")]"),
            WhitespaceHandling::NoWhitespace,
            Arc::new(resolver),
        )
        .unwrap_err();
        assert!(err.message.contains("Recursive import"), "{}", err);
    }

    #[test]
    fn source_map_locates_every_output_byte() {
        let src = "{\n  // note\n  \"name\" :  @\"a\nb\",\n  \"n\": 12\n}";
        let t = transpile(HsonSource::new("m.hson", src), WhitespaceHandling::NoWhitespace, Arc::new(NoImports)).unwrap();
        let lines: Vec<Vec<char>> = src.split('\n').map(|l| l.chars().collect()).collect();
        for (offset, out) in t.json.char_indices() {
            let pos = t.source_map.locate(offset).unwrap();
            let origin = lines[(pos.line - 1) as usize]
                .get((pos.column - 1) as usize)
                .copied()
                .unwrap_or('\n');
            let plausible = origin == out
                || (origin == '\n' && (out == '\\' || out == 'n'))
                || (origin == '@' && out == '"');
            assert!(plausible, "offset {} '{}' mapped to '{}' at {}:{}", offset, out, origin, pos.line, pos.column);
        }
    }

    #[test]
    fn relexing_output_is_idempotent() {
        let first = lex("{ /* c */ \"a\" : @\"x\ny\", \"b\": [ true, null ] }").unwrap();
        assert_eq!(lex(&first).unwrap(), first);
    }

    #[test]
    fn comments_and_whitespace_only_differences_produce_identical_json() {
        let commented = lex("// header\n{\n  \"a\": 1, /* inline */ \"b\": [ 2 , 3 ]\n}\n").unwrap();
        let plain = lex("{\"a\":1,\"b\":[2,3]}").unwrap();
        assert_eq!(commented, plain);
    }
}
