use std::{
    sync::Arc,
    time::Instant,
};

use log::info;
use serde_json::{json, Value};
use thiserror::Error;

use crate::{
    config::TransformConfig,
    job::{Job, JobId, StagedInput},
    pipeline::{
        epoch_to_ts_str, Encoding, EpochUnit, EvalError, Expression, Flow, FlowError,
        FlowReport, RuntimeContext, Source,
    },
};

pub const STATUS_PROCESSED: &str = "processed";

#[derive(Debug, Error)]
pub enum PipelineExecutionError {
    #[error("pipeline failed for job `{job_id}`: {source}")]
    Flow {
        job_id: JobId,
        #[source]
        source: FlowError,
    },

    #[error("pipeline task for job `{job_id}` did not complete: {reason}")]
    Task {
        job_id: JobId,
        reason: String,
    },
}

/// `dict(original_value=$.value, doubled_value=$.value*2, status='processed',
/// timestamp=epoch_to_ts_str($.timestamp, <pattern>))`
pub struct TransformExpression {
    text: String,
    pattern: String,
    unit: EpochUnit,
}

impl TransformExpression {
    pub fn new(pattern: &str, unit: EpochUnit) -> Self {
        Self {
            text: format!(
                "dict(original_value=$.value, doubled_value=$.value*2, \
                 status='{STATUS_PROCESSED}', timestamp=epoch_to_ts_str($.timestamp, \"{pattern}\"))"
            ),
            pattern: pattern.to_string(),
            unit: unit,
        }
    }
}

impl Expression for TransformExpression {
    fn text(&self) -> &str {
        &self.text
    }

    fn eval(&self, record: &Value) -> Result<Value, EvalError> {
        let fields = record.as_object().ok_or(EvalError::NotAnObject)?;
        let value = fields
            .get("value")
            .and_then(Value::as_i64)
            .ok_or(EvalError::Field("value"))?;
        let doubled = value.checked_mul(2).ok_or(EvalError::Overflow(value))?;
        let epoch = fields
            .get("timestamp")
            .and_then(Value::as_i64)
            .ok_or(EvalError::Field("timestamp"))?;
        let timestamp = epoch_to_ts_str(epoch, self.unit, &self.pattern)
            .ok_or(EvalError::Epoch(epoch))?;
        Ok(json!({
            "original_value": value,
            "doubled_value": doubled,
            "status": STATUS_PROCESSED,
            "timestamp": timestamp,
        }))
    }
}

#[derive(Debug)]
pub struct Invocation {
    // what the flow wrote to this job's own sink
    pub output: Vec<u8>,

    pub elapsed_millis: u64,

    pub report: FlowReport,
}

pub struct Invoker {
    expression: Arc<TransformExpression>,
    sink_encoding: Encoding,
    node_id: String,
    service: String,
}

impl Invoker {
    pub fn new(
        config: &TransformConfig,
        node_id: &str,
        service: &str,
    ) -> Self {
        Self {
            expression: Arc::new(TransformExpression::new(
                &config.timestamp_pattern,
                config.epoch_unit,
            )),
            sink_encoding: config.sink_encoding,
            node_id: node_id.to_string(),
            service: service.to_string(),
        }
    }

    /// Runs the job's staged input through the flow on a blocking thread.
    ///
    /// The staged input is released as soon as the flow returns, success or not.
    pub async fn invoke(&self, job: Job) -> Result<Invocation, PipelineExecutionError> {
        let job_id = job.id.clone();
        let ctx = RuntimeContext {
            node_id: self.node_id.clone(),
            service: self.service.clone(),
            job_id: job_id.to_string(),
        };
        let expression: Arc<dyn Expression> = self.expression.clone();
        let sink_encoding = self.sink_encoding;
        let handle = tokio::task::spawn_blocking(move || {
            let Job { id, input, .. } = job;
            // keeps a staged file alive until the flow is done with it
            let (location, staged) = match input {
                StagedInput::Memory(bytes) => (Source::Bytes(bytes), None),

                StagedInput::File(file) => (Source::File(file.path().to_path_buf()), Some(file)),
            };
            let mut output = Vec::new();
            info!("Executing flow for job `{id}`...");
            let start = Instant::now();
            let result = Flow::start()
                .source(Encoding::JsonArray, location)
                .eval(expression)
                .sink(sink_encoding, &mut output)
                .execute(&ctx);
            let elapsed_millis = start.elapsed().as_millis() as u64;
            if let Some(file) = staged {
                info!("Discarding staged input `{}`", file.path().display());
                drop(file);
            }
            result.map(|report| Invocation {
                output: output,
                elapsed_millis: elapsed_millis,
                report: report,
            })
        });
        match handle.await {
            Ok(Ok(invocation)) => {
                info!(
                    "Flow for job `{job_id}` executed in `{}ms`",
                    invocation.elapsed_millis
                );
                Ok(invocation)
            },

            Ok(Err(e)) => Err(PipelineExecutionError::Flow {
                job_id: job_id,
                source: e,
            }),

            Err(e) => Err(PipelineExecutionError::Task {
                job_id: job_id,
                reason: e.to_string(),
            }),
        }
    }
}
