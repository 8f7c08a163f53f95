//! Reads an HSON source into a JSON value, hashing the exact JSON bytes produced.

use crate::error::{LexError, LoadError};
use crate::hson::import::{HsonSource, ImportResolver};
use crate::hson::lexer::{HsonLexer, WhitespaceHandling};
use crate::hson::source_map::SourceMap;
use sha2::{Digest, Sha256};
use std::io::{self, Read};
use std::sync::Arc;

/// A parsed configuration document and the digest of the JSON text it was parsed from.
#[derive(Debug)]
pub struct HashedDocument {
    pub value: serde_json::Value,
    /// Lowercase hex SHA-256.
    pub hash: String,
    pub source_map: SourceMap,
}

/// Adapts the lexer's character stream to `io::Read` for `serde_json::from_reader`.
struct JsonStream {
    lexer: HsonLexer,
    hasher: Sha256,
    /// Output offset of the first byte of each output line.
    line_starts: Vec<usize>,
    written: usize,
    carry: [u8; 4],
    carry_len: usize,
    carry_pos: usize,
    error: Option<LexError>,
}

impl JsonStream {
    fn new(lexer: HsonLexer) -> Self {
        JsonStream {
            lexer,
            hasher: Sha256::new(),
            line_starts: vec![0],
            written: 0,
            carry: [0; 4],
            carry_len: 0,
            carry_pos: 0,
            error: None,
        }
    }

    /// Translate a 1-based (line, column) of the JSON text to a byte offset.
    fn offset_of(&self, line: usize, column: usize) -> usize {
        let start = self
            .line_starts
            .get(line.saturating_sub(1))
            .copied()
            .unwrap_or(self.written);
        start + column.saturating_sub(1)
    }
}

impl Read for JsonStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut n = 0;
        while n < buf.len() {
            if self.carry_pos < self.carry_len {
                buf[n] = self.carry[self.carry_pos];
                self.carry_pos += 1;
                n += 1;
                continue;
            }
            match self.lexer.next() {
                None => break,
                Some(Err(e)) => {
                    self.error = Some(e);
                    return Err(io::Error::new(io::ErrorKind::InvalidData, "HSON lexer error"));
                }
                Some(Ok(c)) => {
                    let mut utf8 = [0u8; 4];
                    let bytes = c.encode_utf8(&mut utf8).as_bytes();
                    self.hasher.update(bytes);
                    self.written += bytes.len();
                    if c == '\n' {
                        self.line_starts.push(self.written);
                    }
                    self.carry[..bytes.len()].copy_from_slice(bytes);
                    self.carry_len = bytes.len();
                    self.carry_pos = 0;
                }
            }
        }
        Ok(n)
    }
}

/// Lex `source`, parse the result as JSON, and hash the JSON bytes.
///
/// Lexical errors surface as [`LoadError::Lex`]; JSON syntax errors are mapped back to
/// the HSON source through the source map and surface as [`LoadError::Json`].
pub fn read_document(
    source: HsonSource,
    whitespace: WhitespaceHandling,
    resolver: Arc<dyn ImportResolver>,
) -> Result<HashedDocument, LoadError> {
    let root_name = source.name.clone();
    let mut stream = JsonStream::new(HsonLexer::new(source, whitespace, resolver));
    let parsed: Result<serde_json::Value, serde_json::Error> = serde_json::from_reader(&mut stream);
    if let Some(e) = stream.error.take() {
        return Err(LoadError::Lex(e));
    }
    match parsed {
        Ok(value) => Ok(HashedDocument {
            value,
            hash: hex::encode(stream.hasher.finalize()),
            source_map: stream.lexer.into_source_map(),
        }),
        Err(e) => {
            let offset = stream.offset_of(e.line(), e.column());
            let message = json_error_message(&e);
            let located = match stream.lexer.source_map().locate(offset) {
                Some(pos) => format!("{}: {}", pos, message),
                None => format!("{}: {}", root_name, message),
            };
            Err(LoadError::Json(located))
        }
    }
}

/// serde_json appends " at line L column C"; the caller supplies source coordinates instead.
fn json_error_message(e: &serde_json::Error) -> String {
    let text = e.to_string();
    match text.rfind(" at line ") {
        Some(i) => text[..i].to_string(),
        None => text,
    }
}

/// Lex and parse strict JSON text received without a directory context (e.g. over HTTP).
pub fn read_json_text(name: &str, text: String, whitespace: WhitespaceHandling) -> Result<HashedDocument, LoadError> {
    read_document(
        HsonSource::new(name, text),
        whitespace,
        Arc::new(crate::hson::import::NoImports),
    )
}
