//! HSON: JSON with comments, verbatim multi-line strings and file imports.

pub mod import;
pub mod lexer;
pub mod reader;
pub mod source_map;

pub use import::{FileResolver, HsonSource, ImportResolver, MemoryResolver, NoImports};
pub use lexer::{transpile, HsonLexer, Transpiled, WhitespaceHandling};
pub use reader::{read_document, read_json_text, HashedDocument};
pub use source_map::{Segment, SourceMap, SourcePosition};
