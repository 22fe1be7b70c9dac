//! Splits a job's captured flow output into JSON records.
//!
//! Each non-blank line is one of: a JSON array of objects, a single JSON
//! object, or noise. Noise is skipped and a malformed line only costs itself.

use std::collections::VecDeque;

use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq)]
#[error("line {line}: {reason}, content: `{content}`")]
pub struct RecordParseError {
    // 1-based, counting non-blank lines only
    pub line: usize,
    pub content: String,
    pub reason: String,
}

#[derive(Debug, PartialEq)]
pub enum ParsedLine<'a> {
    Record(Value),

    // not json at all
    Skipped(&'a str),

    Failed(RecordParseError),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ParseStats {
    pub lines: usize,
    pub records: usize,
    pub skipped: usize,
    pub failed: usize,
}

// \R: line feed, vertical tab, form feed, carriage return, NEL, LS, PS
pub(crate) fn is_line_break(c: char) -> bool {
    matches!(c, '\n' | '\u{0B}' | '\u{0C}' | '\r' | '\u{85}' | '\u{2028}' | '\u{2029}')
}

/// Lazily classifies `output`, line by line.
pub fn parse(output: &str) -> RecordStream<'_> {
    RecordStream {
        lines: Box::new(
            output
                .split(is_line_break)
                .map(str::trim)
                .filter(|line| !line.is_empty())
        ),
        pending: VecDeque::new(),
        stats: ParseStats::default(),
    }
}

pub struct RecordStream<'a> {
    lines: Box<dyn Iterator<Item = &'a str> + Send + 'a>,
    // objects of an array line not handed out yet
    pending: VecDeque<ParsedLine<'a>>,
    stats: ParseStats,
}

impl<'a> RecordStream<'a> {
    /// Counts so far; final once the stream is exhausted.
    pub fn stats(&self) -> ParseStats {
        self.stats
    }

    fn classify(&mut self, line: &'a str) {
        self.stats.lines += 1;
        let number = self.stats.lines;
        let failed = |reason: String| ParsedLine::Failed(RecordParseError {
            line: number,
            content: line.to_string(),
            reason: reason,
        });
        if line.starts_with('[') {
            match serde_json::from_str::<Vec<Value>>(line) {
                Ok(items) => {
                    for (index, item) in items.into_iter().enumerate() {
                        if item.is_object() {
                            self.pending.push_back(ParsedLine::Record(item));
                        } else {
                            self.pending.push_back(ParsedLine::Failed(RecordParseError {
                                line: number,
                                content: item.to_string(),
                                reason: format!("array element {index} is not an object"),
                            }));
                        }
                    }
                },

                Err(e) => self.pending.push_back(failed(e.to_string())),
            }
        } else if line.starts_with('{') {
            match serde_json::from_str::<Value>(line) {
                Ok(value) => self.pending.push_back(ParsedLine::Record(value)),

                Err(e) => self.pending.push_back(failed(e.to_string())),
            }
        } else {
            self.pending.push_back(ParsedLine::Skipped(line));
        }
    }
}

impl<'a> Iterator for RecordStream<'a> {
    type Item = ParsedLine<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(parsed) = self.pending.pop_front() {
                match &parsed {
                    ParsedLine::Record(_) => self.stats.records += 1,

                    ParsedLine::Skipped(_) => self.stats.skipped += 1,

                    ParsedLine::Failed(_) => self.stats.failed += 1,
                }
                return Some(parsed);
            }
            let line = self.lines.next()?;
            self.classify(line);
        }
    }
}
