use std::{
    io,
    path::PathBuf,
    time::Duration,
};

use futures::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use log::info;
use serde::Deserialize;
use thiserror::Error;

use crate::{
    config::IngestConfig,
    job::{Job, JobId, StagedFile},
    transport::Connection,
};

/// How a request body is delimited on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Framing {
    // read until the peer closes its write side
    StreamToEof,

    // read exactly one line
    LineDelimited,
}

/// Where a job's raw input waits for the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Staging {
    File,

    Memory,
}

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("payload is empty")]
    Empty,

    #[error("payload exceeds `{limit}` bytes")]
    TooLarge { limit: usize },

    #[error("no payload within `{0:?}`")]
    Timeout(Duration),

    #[error("failed to read payload: {0}")]
    Io(#[from] io::Error),

    #[error("failed to stage payload at `{path}`: {source}")]
    Staging {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl IngestError {
    /// Empty input skips the job, it is not a failure.
    pub fn is_tolerated(&self) -> bool {
        matches!(self, IngestError::Empty)
    }
}

pub struct Ingestor {
    framing: Framing,
    staging: Staging,
    staging_dir: PathBuf,
    max_payload_bytes: usize,
    read_timeout: Duration,
}

impl Ingestor {
    pub fn new(config: &IngestConfig) -> Self {
        Self {
            framing: config.framing,
            staging: config.staging,
            staging_dir: config.staging_dir(),
            max_payload_bytes: config.max_payload_bytes,
            read_timeout: config.read_timeout(),
        }
    }

    pub fn framing(&self) -> Framing {
        self.framing
    }

    /// Reads the request off `conn` and stages it as a job.
    pub async fn ingest(
        &self,
        id: JobId,
        conn: &mut Connection,
    ) -> Result<Job, IngestError> {
        let payload = match tokio::time::timeout(
            self.read_timeout,
            self.read_payload(conn)
        ).await {
            Ok(payload) => payload?,

            Err(_) => return Err(IngestError::Timeout(self.read_timeout)),
        };
        if payload.iter().all(u8::is_ascii_whitespace) {
            return Err(IngestError::Empty);
        }
        let staged = match self.staging {
            Staging::Memory => None,

            Staging::File => Some(self.stage_to_file(&id, &payload).await?),
        };
        let job = Job::new(id, conn.peer(), payload, staged);
        info!(
            "Job `{}` received `{}` bytes from `{}`, digest: `{:016x}`",
            job.id,
            job.size,
            job.peer,
            job.digest
        );
        Ok(job)
    }

    async fn read_payload(
        &self,
        conn: &mut Connection,
    ) -> Result<Vec<u8>, IngestError> {
        // one extra byte tells an exact fit from an overflow
        let limit = self.max_payload_bytes as u64 + 1;
        let mut payload = Vec::new();
        match self.framing {
            Framing::StreamToEof => {
                (&mut *conn).take(limit).read_to_end(&mut payload).await?;
            },

            Framing::LineDelimited => {
                // plus room for a `\r\n` that is not part of the payload
                let mut reader = BufReader::new((&mut *conn).take(limit + 2));
                reader.read_until(b'\n', &mut payload).await?;
                if payload.last() == Some(&b'\n') {
                    payload.pop();
                    if payload.last() == Some(&b'\r') {
                        payload.pop();
                    }
                }
            },
        }
        if payload.len() > self.max_payload_bytes {
            return Err(IngestError::TooLarge { limit: self.max_payload_bytes });
        }
        Ok(payload)
    }

    async fn stage_to_file(
        &self,
        id: &JobId,
        payload: &[u8],
    ) -> Result<StagedFile, IngestError> {
        let path = self.staging_dir.join(format!("{id}-input.json"));
        let staging_err = |e: io::Error| IngestError::Staging {
            path: path.clone(),
            source: e,
        };
        tokio::fs::create_dir_all(&self.staging_dir)
            .await
            .map_err(staging_err)?;
        // own the path before writing so a partial file is cleaned up too
        let staged = StagedFile::new(path.clone());
        tokio::fs::write(&path, payload)
            .await
            .map_err(staging_err)?;
        info!("Job `{id}` input staged at `{}`", path.display());
        Ok(staged)
    }
}
