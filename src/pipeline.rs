//! Synchronous flow engine: decode a source, evaluate an expression over each
//! record, encode the results into a caller-owned sink.
//!
//! ```text
//! Flow::start()
//!     .source(Encoding::JsonArray, Source::File(path))
//!     .eval(expression)
//!     .sink(Encoding::JsonObject, &mut buffer)
//!     .execute(&ctx)?
//! ```

use std::{
    fs,
    io::{self, Write},
    path::PathBuf,
    sync::Arc,
};

use chrono::DateTime;
use log::{info, warn};
use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;

use crate::records::is_line_break;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Encoding {
    // a json array of objects on the way in, one array line on the way out
    JsonArray,

    // one json object per line
    JsonObject,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EpochUnit {
    Millis,

    Seconds,
}

#[derive(Debug)]
pub enum Source {
    Bytes(Vec<u8>),

    File(PathBuf),
}

#[derive(Debug, Error)]
pub enum EvalError {
    #[error("record is not an object")]
    NotAnObject,

    #[error("field `{0}` is missing or not an integer")]
    Field(&'static str),

    #[error("`{0}` overflows")]
    Overflow(i64),

    #[error("epoch `{0}` is out of range")]
    Epoch(i64),
}

#[derive(Debug, Error)]
pub enum FlowError {
    #[error("flow has no {0}")]
    Incomplete(&'static str),

    #[error("failed to read source `{path}`: {source}")]
    Source {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("source is not valid json: {0}")]
    Decode(String),

    #[error("failed to write sink: {0}")]
    Sink(#[from] io::Error),
}

/// A declarative transformation evaluated once per record.
pub trait Expression: Send + Sync {
    /// Textual form, for the logs.
    fn text(&self) -> &str;

    fn eval(&self, record: &Value) -> Result<Value, EvalError>;
}

/// Who is running the flow; only used for the logs.
#[derive(Debug, Clone, Default)]
pub struct RuntimeContext {
    pub node_id: String,
    pub service: String,
    pub job_id: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FlowReport {
    // source lines that were not json at all
    pub lines_rejected: usize,
    pub records_in: usize,
    pub records_out: usize,
    pub records_dropped: usize,
}

pub struct Flow;

impl Flow {
    pub fn start<'a>() -> FlowBuilder<'a> {
        FlowBuilder {
            source: None,
            stages: vec![],
            sink: None,
        }
    }
}

pub struct FlowBuilder<'a> {
    source: Option<(Encoding, Source)>,
    stages: Vec<Arc<dyn Expression>>,
    sink: Option<(Encoding, &'a mut dyn Write)>,
}

impl<'a> FlowBuilder<'a> {
    pub fn source(mut self, encoding: Encoding, location: Source) -> Self {
        self.source = Some((encoding, location));
        self
    }

    pub fn eval(mut self, expression: Arc<dyn Expression>) -> Self {
        self.stages.push(expression);
        self
    }

    pub fn sink(mut self, encoding: Encoding, destination: &'a mut dyn Write) -> Self {
        self.sink = Some((encoding, destination));
        self
    }

    /// Runs the flow to completion on the calling thread.
    pub fn execute(self, ctx: &RuntimeContext) -> Result<FlowReport, FlowError> {
        let (source_encoding, location) = self.source.ok_or(FlowError::Incomplete("source"))?;
        let (sink_encoding, sink) = self.sink.ok_or(FlowError::Incomplete("sink"))?;
        let bytes = match location {
            Source::Bytes(bytes) => bytes,

            Source::File(path) => fs::read(&path)
                .map_err(|e| FlowError::Source {
                    path: path,
                    source: e,
                })?,
        };
        let (records, lines_rejected) = decode(source_encoding, &bytes, ctx)?;
        let mut report = FlowReport {
            lines_rejected: lines_rejected,
            records_in: records.len(),
            ..Default::default()
        };
        let mut outputs = Vec::with_capacity(records.len());
        'records: for (index, record) in records.into_iter().enumerate() {
            let mut current = record;
            for stage in &self.stages {
                match stage.eval(&current) {
                    Ok(next) => current = next,

                    Err(e) => {
                        warn!(
                            "[{}] record `{index}` dropped by `{}`: `{e}`, record: `{current}`",
                            ctx.job_id,
                            stage.text(),
                        );
                        report.records_dropped += 1;
                        continue 'records;
                    }
                }
            }
            outputs.push(current);
        }
        report.records_out = outputs.len();
        encode(sink_encoding, &outputs, sink)?;
        info!(
            "[{}] flow on `{}`/`{}` done: `{}` in, `{}` out, `{}` dropped, `{}` lines rejected",
            ctx.job_id,
            ctx.node_id,
            ctx.service,
            report.records_in,
            report.records_out,
            report.records_dropped,
            report.lines_rejected
        );
        Ok(report)
    }
}

// non-blank lines, numbered from 1, split on every line break the output parser knows
fn source_lines(text: &str) -> impl Iterator<Item = (usize, &str)> {
    text.split(is_line_break)
        .filter(|line| !line.trim().is_empty())
        .enumerate()
        .map(|(index, line)| (index + 1, line))
}

// arrays are flattened one level; bare and concatenated values pass through
fn decode_values(bytes: &[u8]) -> Result<Vec<Value>, serde_json::Error> {
    let mut records = vec![];
    for value in serde_json::Deserializer::from_slice(bytes).into_iter::<Value>() {
        match value? {
            Value::Array(items) => records.extend(items),

            other => records.push(other),
        }
    }
    Ok(records)
}

/// Returns the decoded records and the number of rejected source lines.
fn decode(
    encoding: Encoding,
    bytes: &[u8],
    ctx: &RuntimeContext,
) -> Result<(Vec<Value>, usize), FlowError> {
    let mut records = vec![];
    let mut rejected = 0;
    match encoding {
        Encoding::JsonArray => match decode_values(bytes) {
            Ok(values) => records = values,

            // not a json document as a whole, so every line stands alone
            Err(_) => {
                let text = String::from_utf8_lossy(bytes);
                for (number, line) in source_lines(&text) {
                    match decode_values(line.as_bytes()) {
                        Ok(values) => records.extend(values),

                        Err(e) => {
                            warn!(
                                "[{}] source line {number} rejected: `{e}`, line: `{line}`",
                                ctx.job_id
                            );
                            rejected += 1;
                        },
                    }
                }
            },
        },

        Encoding::JsonObject => {
            let text = String::from_utf8_lossy(bytes);
            for (number, line) in source_lines(&text) {
                let value = serde_json::from_str::<Value>(line)
                    .map_err(|e| FlowError::Decode(format!("line {number}: {e}")))?;
                records.push(value);
            }
        },
    }
    Ok((records, rejected))
}

fn encode(
    encoding: Encoding,
    records: &[Value],
    sink: &mut dyn Write,
) -> Result<(), FlowError> {
    match encoding {
        Encoding::JsonObject => {
            for record in records {
                serde_json::to_writer(&mut *sink, record).map_err(io::Error::from)?;
                sink.write_all(b"\n")?;
            }
        },

        Encoding::JsonArray => {
            if false == records.is_empty() {
                serde_json::to_writer(&mut *sink, records).map_err(io::Error::from)?;
                sink.write_all(b"\n")?;
            }
        },
    }
    sink.flush()?;
    Ok(())
}

/// Renders an epoch as a UTC date-time string with a strftime `pattern`.
pub fn epoch_to_ts_str(epoch: i64, unit: EpochUnit, pattern: &str) -> Option<String> {
    let ts = match unit {
        EpochUnit::Millis => DateTime::from_timestamp_millis(epoch)?,

        EpochUnit::Seconds => DateTime::from_timestamp(epoch, 0)?,
    };
    Some(ts.format(pattern).to_string())
}
