//! Output-offset to source-position table built while lexing HSON.

use serde::Serialize;
use std::sync::Arc;

/// Start of a run of output bytes that map one-to-one onto consecutive source columns.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Segment {
    /// 0-based byte offset into the emitted JSON text.
    pub output_offset: usize,
    pub source_name: Arc<str>,
    /// 1-based.
    pub source_line: u32,
    /// 1-based.
    pub source_column: u32,
}

/// A resolved original location.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SourcePosition {
    pub name: Arc<str>,
    pub line: u32,
    pub column: u32,
}

impl std::fmt::Display for SourcePosition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} (line {}, col {})", self.name, self.line, self.column)
    }
}

#[derive(Clone, Debug, Default)]
pub struct SourceMap {
    segments: Vec<Segment>,
}

impl SourceMap {
    pub fn new() -> Self {
        SourceMap {
            segments: Vec::with_capacity(256),
        }
    }

    /// Append a segment. Offsets must be strictly increasing; recording again at the
    /// last offset replaces that segment.
    pub fn record(&mut self, output_offset: usize, source_name: Arc<str>, source_line: u32, source_column: u32) {
        if let Some(last) = self.segments.last() {
            debug_assert!(last.output_offset <= output_offset);
            if last.output_offset == output_offset {
                self.segments.pop();
            }
        }
        self.segments.push(Segment {
            output_offset,
            source_name,
            source_line,
            source_column,
        });
    }

    /// Merge the map of an imported stream whose output began at `shift`.
    pub fn append_shifted(&mut self, other: SourceMap, shift: usize) {
        for seg in other.segments {
            self.record(seg.output_offset + shift, seg.source_name, seg.source_line, seg.source_column);
        }
    }

    /// Exact match, else the segment with the greatest offset not exceeding `output_offset`.
    pub fn lookup(&self, output_offset: usize) -> Option<&Segment> {
        match self
            .segments
            .binary_search_by_key(&output_offset, |s| s.output_offset)
        {
            Ok(i) => Some(&self.segments[i]),
            Err(0) => None,
            Err(i) => Some(&self.segments[i - 1]),
        }
    }

    /// Source position of the character that produced the byte at `output_offset`.
    pub fn locate(&self, output_offset: usize) -> Option<SourcePosition> {
        let seg = self.lookup(output_offset)?;
        let delta = (output_offset - seg.output_offset) as u32;
        Some(SourcePosition {
            name: seg.source_name.clone(),
            line: seg.source_line,
            column: seg.source_column + delta,
        })
    }

    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    pub fn len(&self) -> usize {
        self.segments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }
}
