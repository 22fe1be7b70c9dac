//! Inserts parsed records into the store, one connection per record or one
//! per job.

use std::sync::Arc;

use log::{debug, warn};
use serde::Deserialize;
use serde_json::Value;

use crate::{
    db::{InsertError, SchemaValidationError, Store, StoreSession, TransformedRecord},
    job::JobId,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConnectionScope {
    // connect, insert, release for every record
    PerRecord,

    // one session for the whole job, reopened after a failure
    PerJob,
}

#[derive(Debug)]
pub enum RecordResult {
    Inserted,

    Invalid(SchemaValidationError),

    Failed(InsertError),
}

impl RecordResult {
    pub fn is_inserted(&self) -> bool {
        matches!(self, RecordResult::Inserted)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WriteSummary {
    pub attempted: usize,
    pub inserted: usize,
    pub invalid: usize,
    pub failed: usize,
}

pub struct Writer {
    store: Arc<dyn Store>,
    scope: ConnectionScope,
}

impl Writer {
    pub fn new(store: Arc<dyn Store>, scope: ConnectionScope) -> Self {
        Self {
            store: store,
            scope: scope,
        }
    }

    pub fn begin(&self, job_id: &JobId) -> WriteBatch<'_> {
        WriteBatch {
            writer: self,
            job_id: job_id.clone(),
            session: None,
            summary: WriteSummary::default(),
        }
    }

    /// Writes every record of `values`, in order; one failure never stops
    /// the rest.
    pub async fn write_all(&self, job_id: &JobId, values: &[Value]) -> WriteSummary {
        let mut batch = self.begin(job_id);
        for value in values {
            batch.write(value).await;
        }
        batch.finish()
    }
}

/// The records of one job on their way into the store.
pub struct WriteBatch<'a> {
    writer: &'a Writer,
    job_id: JobId,
    // only kept for `ConnectionScope::PerJob`
    session: Option<Box<dyn StoreSession>>,
    summary: WriteSummary,
}

impl<'a> WriteBatch<'a> {
    pub async fn write(&mut self, value: &Value) -> RecordResult {
        self.summary.attempted += 1;
        let result = match TransformedRecord::from_json(value) {
            Ok(record) => match self.insert(&record).await {
                Ok(()) => RecordResult::Inserted,

                Err(e) => RecordResult::Failed(e),
            },

            Err(e) => RecordResult::Invalid(e),
        };
        match &result {
            RecordResult::Inserted => {
                self.summary.inserted += 1;
                debug!("[{}] inserted `{value}`", self.job_id);
            },

            RecordResult::Invalid(e) => {
                self.summary.invalid += 1;
                warn!("[{}] record rejected: `{e}`, record: `{value}`", self.job_id);
            },

            RecordResult::Failed(e) => {
                self.summary.failed += 1;
                warn!("[{}] insert failed: `{e}`, record: `{value}`", self.job_id);
            },
        }
        result
    }

    pub fn summary(&self) -> WriteSummary {
        self.summary
    }

    /// Releases a per-job session, if one is open.
    pub fn finish(self) -> WriteSummary {
        self.summary
    }

    async fn insert(&mut self, record: &TransformedRecord) -> Result<(), InsertError> {
        match self.writer.scope {
            ConnectionScope::PerRecord => {
                let mut session = self.writer.store.connect().await?;
                session.insert(record).await
            },

            ConnectionScope::PerJob => {
                let mut session = match self.session.take() {
                    Some(session) => session,

                    None => self.writer.store.connect().await?,
                };
                let result = session.insert(record).await;
                // a failed session may be broken, the next record reconnects
                if result.is_ok() {
                    self.session = Some(session);
                }
                result
            },
        }
    }
}
