//! The accept loop: every inbound connection becomes one job that is
//! ingested, transformed, parsed and written, on a bounded pool of tasks.

use std::{
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

use log::{debug, error, info, warn};
use thiserror::Error;
use tokio::{
    sync::Semaphore,
    task::JoinSet,
};
use tokio_util::sync::CancellationToken;

use crate::{
    config::SupervisorConfig,
    ingest::{IngestError, Ingestor},
    invoke::{Invoker, PipelineExecutionError},
    job::{Job, JobId},
    pipeline::FlowReport,
    records::{self, ParseStats, ParsedLine},
    transport::{Acceptor, Connection, TransportError},
    writer::{WriteSummary, Writer},
};

#[derive(Debug, Error)]
pub enum JobError {
    #[error(transparent)]
    Ingest(#[from] IngestError),

    #[error(transparent)]
    Pipeline(#[from] PipelineExecutionError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobSummary {
    pub flow: FlowReport,
    pub lines: ParseStats,
    pub writes: WriteSummary,
    pub elapsed_millis: u64,
}

#[derive(Debug)]
pub enum JobOutcome {
    Completed(JobSummary),

    // nothing to do, e.g. an empty payload
    Skipped,

    Failed(JobError),
}

#[derive(Debug)]
pub struct JobReport {
    pub job_id: JobId,
    pub peer: String,
    pub outcome: JobOutcome,
}

/// Everything one job needs, shared by all job tasks.
pub struct JobRunner {
    ingestor: Ingestor,
    invoker: Invoker,
    writer: Writer,
}

impl JobRunner {
    pub fn new(
        ingestor: Ingestor,
        invoker: Invoker,
        writer: Writer,
    ) -> Self {
        Self {
            ingestor: ingestor,
            invoker: invoker,
            writer: writer,
        }
    }

    /// Runs the whole life of one connection. The connection is closed right
    /// after its payload is read, whatever happens next.
    pub async fn run(&self, mut conn: Connection) -> JobReport {
        let job_id = JobId::next();
        let peer = conn.peer().to_string();
        info!("[{job_id}] Accepted a connection from `{peer}`, framing: `{:?}`", self.ingestor.framing());
        let ingested = self.ingestor
            .ingest(job_id.clone(), &mut conn)
            .await;
        if let Err(e) = conn.close().await {
            debug!("[{job_id}] Connection did not close cleanly: `{e}`");
        }
        let outcome = match ingested {
            Ok(job) => self.process(job).await,

            Err(e) if e.is_tolerated() => {
                info!("[{job_id}] Skipped: `{e}`");
                JobOutcome::Skipped
            },

            Err(e) => JobOutcome::Failed(e.into()),
        };
        JobReport {
            job_id: job_id,
            peer: peer,
            outcome: outcome,
        }
    }

    async fn process(&self, job: Job) -> JobOutcome {
        let job_id = job.id.clone();
        let start = Instant::now();
        let invocation = match self.invoker.invoke(job).await {
            Ok(invocation) => invocation,

            Err(e) => return JobOutcome::Failed(e.into()),
        };
        let output = String::from_utf8_lossy(&invocation.output);
        let mut lines = records::parse(&output);
        let mut batch = self.writer.begin(&job_id);
        while let Some(line) = lines.next() {
            match line {
                ParsedLine::Record(value) => {
                    batch.write(&value).await;
                },

                ParsedLine::Skipped(text) => {
                    debug!("[{job_id}] Not a record: `{text}`");
                },

                ParsedLine::Failed(e) => {
                    warn!("[{job_id}] Output line could not be parsed, {e}");
                },
            }
        }
        let summary = JobSummary {
            flow: invocation.report,
            lines: lines.stats(),
            writes: batch.finish(),
            elapsed_millis: start.elapsed().as_millis() as u64,
        };
        info!(
            "[{job_id}] Done in `{}ms`: `{}` records parsed, `{}` inserted, `{}` invalid, `{}` failed",
            summary.elapsed_millis,
            summary.lines.records,
            summary.writes.inserted,
            summary.writes.invalid,
            summary.writes.failed
        );
        JobOutcome::Completed(summary)
    }
}

#[derive(Debug, Default)]
pub struct SupervisorStats {
    jobs_completed: AtomicU64,
    jobs_skipped: AtomicU64,
    jobs_failed: AtomicU64,
    rows_inserted: AtomicU64,
    rows_failed: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub jobs_completed: u64,
    pub jobs_skipped: u64,
    pub jobs_failed: u64,
    pub rows_inserted: u64,
    pub rows_failed: u64,
}

impl SupervisorStats {
    pub fn record(&self, outcome: &JobOutcome) {
        match outcome {
            JobOutcome::Completed(summary) => {
                self.jobs_completed.fetch_add(1, Ordering::Relaxed);
                self.rows_inserted.fetch_add(summary.writes.inserted as u64, Ordering::Relaxed);
                self.rows_failed.fetch_add(
                    (summary.writes.invalid + summary.writes.failed) as u64,
                    Ordering::Relaxed
                );
            },

            JobOutcome::Skipped => {
                self.jobs_skipped.fetch_add(1, Ordering::Relaxed);
            },

            JobOutcome::Failed(_) => {
                self.jobs_failed.fetch_add(1, Ordering::Relaxed);
            },
        }
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            jobs_completed: self.jobs_completed.load(Ordering::Relaxed),
            jobs_skipped: self.jobs_skipped.load(Ordering::Relaxed),
            jobs_failed: self.jobs_failed.load(Ordering::Relaxed),
            rows_inserted: self.rows_inserted.load(Ordering::Relaxed),
            rows_failed: self.rows_failed.load(Ordering::Relaxed),
        }
    }
}

pub struct Supervisor<A: Acceptor> {
    acceptor: A,
    runner: Arc<JobRunner>,
    max_concurrent_jobs: usize,
    backoff: Duration,
    stats: Arc<SupervisorStats>,
}

impl<A: Acceptor> Supervisor<A> {
    pub fn new(
        acceptor: A,
        runner: JobRunner,
        config: &SupervisorConfig,
    ) -> Self {
        Self {
            acceptor: acceptor,
            runner: Arc::new(runner),
            max_concurrent_jobs: config.max_concurrent_jobs.max(1),
            backoff: config.backoff(),
            stats: Arc::new(SupervisorStats::default()),
        }
    }

    /// Accepts and processes connections until `shutdown` fires or the
    /// transport goes away, then waits for the jobs in flight.
    pub async fn run(mut self, shutdown: CancellationToken) -> StatsSnapshot {
        let semaphore = Arc::new(Semaphore::new(self.max_concurrent_jobs));
        let mut jobs = JoinSet::new();
        info!(
            "Supervisor is accepting connections, at most `{}` job(s) in flight.",
            self.max_concurrent_jobs
        );
        loop {
            while let Some(result) = jobs.try_join_next() {
                if let Err(e) = result {
                    error!("Job task panicked: `{e}`");
                }
            }
            // a free slot first, then a connection to fill it
            let permit = tokio::select! {
                biased;

                _ = shutdown.cancelled() => break,

                permit = semaphore.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,

                    Err(_) => break,
                },
            };
            let accepted = tokio::select! {
                biased;

                _ = shutdown.cancelled() => break,

                accepted = self.acceptor.accept() => accepted,
            };
            match accepted {
                Ok(conn) => {
                    let runner = self.runner.clone();
                    let stats = self.stats.clone();
                    let backoff = self.backoff;
                    jobs.spawn(async move {
                        let report = runner.run(conn).await;
                        stats.record(&report.outcome);
                        if let JobOutcome::Failed(e) = &report.outcome {
                            error!(
                                "[{}] Job from `{}` failed: `{e}`, backing off for `{backoff:?}`",
                                report.job_id,
                                report.peer
                            );
                            tokio::time::sleep(backoff).await;
                        }
                        drop(permit);
                    });
                },

                Err(TransportError::Shutdown) => {
                    warn!("Transport is gone, no more connections will be accepted.");
                    break;
                },

                Err(e) => {
                    drop(permit);
                    error!("Failed to accept a connection: `{e}`, backing off for `{:?}`", self.backoff);
                    tokio::select! {
                        _ = shutdown.cancelled() => break,

                        _ = tokio::time::sleep(self.backoff) => {},
                    }
                },
            }
        }
        if false == jobs.is_empty() {
            info!("Draining `{}` job(s) in flight...", jobs.len());
        }
        while let Some(result) = jobs.join_next().await {
            if let Err(e) = result {
                error!("Job task panicked: `{e}`");
            }
        }
        let stats = self.stats.snapshot();
        info!("Supervisor stopped: `{stats:?}`");
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{
        io,
        sync::atomic::AtomicUsize,
    };
    use futures::io::Cursor;
    use crate::{
        config::{IngestConfig, TransformConfig},
        ingest::{Framing, Staging},
        testing::{tracked_connection, ChannelAcceptor, MemoryStore, TrackedStream},
        writer::ConnectionScope,
    };

    struct Harness {
        store: MemoryStore,
        runner: JobRunner,
        staging: tempfile::TempDir,
    }

    fn harness(staging: Staging) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let store = MemoryStore::default();
        let ingestor = Ingestor::new(&IngestConfig {
            framing: Framing::StreamToEof,
            staging: staging,
            staging_dir: Some(dir.path().to_path_buf()),
            max_payload_bytes: 4096,
            read_timeout_secs: 5,
        });
        let invoker = Invoker::new(&TransformConfig::default(), "node-a", "/transform");
        let writer = Writer::new(Arc::new(store.clone()), ConnectionScope::PerRecord);
        Harness {
            store: store,
            runner: JobRunner::new(ingestor, invoker, writer),
            staging: dir,
        }
    }

    async fn submit(harness: &Harness, payload: &str) -> (JobReport, Arc<AtomicUsize>) {
        let (conn, closes) = tracked_connection("peer-a", payload.as_bytes());
        (harness.runner.run(conn).await, closes)
    }

    fn completed(report: &JobReport) -> &JobSummary {
        match &report.outcome {
            JobOutcome::Completed(summary) => summary,
            other => panic!("unexpected outcome {other:?}"),
        }
    }

    #[tokio::test]
    async fn every_record_is_inserted_once_and_doubled() {
        let h = harness(Staging::File);
        let payload = (1..=5)
            .map(|v| format!("{{\"value\": {v}, \"timestamp\": 1700000000}}"))
            .collect::<Vec<_>>()
            .join("\n");
        let (report, closes) = submit(&h, &payload).await;
        assert_eq!(completed(&report).writes.inserted, 5);
        assert_eq!(h.store.connects(), 5);
        let rows = h.store.rows();
        assert_eq!(rows.len(), 5);
        assert!(rows.iter().all(|row| row.doubled_value == 2 * row.original_value));
        assert_eq!(closes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn single_record_scenario() {
        let h = harness(Staging::Memory);
        submit(&h, r#"{"value": 5, "timestamp": 1700000000}"#).await;
        let rows = h.store.rows();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].original_value, 5);
        assert_eq!(rows[0].doubled_value, 10);
        assert_eq!(rows[0].status, "processed");
        assert_eq!(rows[0].timestamp.to_string(), "1970-01-20 16:13:20");
    }

    #[tokio::test]
    async fn empty_payload_is_skipped_and_closed() {
        let h = harness(Staging::File);
        for payload in ["", "  \n\t "] {
            let (report, closes) = submit(&h, payload).await;
            assert!(matches!(report.outcome, JobOutcome::Skipped));
            assert_eq!(closes.load(Ordering::SeqCst), 1);
        }
        assert_eq!(h.store.connects(), 0);
    }

    #[tokio::test]
    async fn malformed_line_does_not_stop_its_siblings() {
        let h = harness(Staging::File);
        let payload = "{\"value\": 1, \"timestamp\": 0}\n{\"value\": \n{\"value\": 3, \"timestamp\": 0}";
        let (report, _) = submit(&h, payload).await;
        assert_eq!(completed(&report).flow.lines_rejected, 1);
        assert_eq!(h.store.original_values(), vec![1, 3]);
    }

    #[tokio::test]
    async fn not_json_is_skipped_without_failing_the_job() {
        let h = harness(Staging::Memory);
        let (report, _) = submit(&h, "not json").await;
        let summary = completed(&report);
        assert_eq!(summary.flow.lines_rejected, 1);
        assert_eq!(summary.writes.attempted, 0);
        assert!(h.store.rows().is_empty());
    }

    #[tokio::test]
    async fn insert_failure_does_not_stop_later_records() {
        let h = harness(Staging::Memory);
        h.store.fail_on(2);
        let payload = r#"[{"value": 1, "timestamp": 0}, {"value": 2, "timestamp": 0}, {"value": 3, "timestamp": 0}]"#;
        let (report, _) = submit(&h, payload).await;
        let summary = completed(&report);
        assert_eq!(summary.writes.attempted, 3);
        assert_eq!(summary.writes.failed, 1);
        assert_eq!(h.store.original_values(), vec![1, 3]);
    }

    #[tokio::test]
    async fn array_input_keeps_its_order() {
        let h = harness(Staging::File);
        submit(&h, r#"[{"value": 7, "timestamp": 0}, {"value": 3, "timestamp": 0}]"#).await;
        assert_eq!(h.store.original_values(), vec![7, 3]);
    }

    #[tokio::test]
    async fn resubmitting_inserts_duplicates() {
        let h = harness(Staging::File);
        let payload = r#"{"value": 9, "timestamp": 0}"#;
        submit(&h, payload).await;
        submit(&h, payload).await;
        assert_eq!(h.store.original_values(), vec![9, 9]);
    }

    #[tokio::test]
    async fn oversized_payload_fails_the_job() {
        let h = harness(Staging::Memory);
        let (report, closes) = submit(&h, &"x".repeat(5000)).await;
        assert!(matches!(
            report.outcome,
            JobOutcome::Failed(JobError::Ingest(IngestError::TooLarge { .. }))
        ));
        assert_eq!(closes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn silent_peer_fails_the_job_and_is_closed() {
        let h = harness(Staging::File);
        let (stream, closes) = TrackedStream::stalled();
        let report = h.runner.run(Connection::new("peer-a", stream)).await;
        match &report.outcome {
            JobOutcome::Failed(JobError::Ingest(e)) => {
                assert!(matches!(e, IngestError::Timeout(_)));
                assert!(!e.is_tolerated());
            },
            other => panic!("unexpected outcome {other:?}"),
        }
        assert_eq!(closes.load(Ordering::SeqCst), 1);
        assert_eq!(h.store.connects(), 0);
    }

    #[tokio::test]
    async fn staging_directory_is_left_empty() {
        let h = harness(Staging::File);
        submit(&h, r#"{"value": 1, "timestamp": 0}"#).await;
        submit(&h, "not json").await;
        assert_eq!(std::fs::read_dir(h.staging.path()).unwrap().count(), 0);
    }

    fn supervisor(h: Harness, acceptor: ChannelAcceptor, jobs: usize) -> Supervisor<ChannelAcceptor> {
        Supervisor::new(acceptor, h.runner, &SupervisorConfig {
            max_concurrent_jobs: jobs,
            backoff_millis: 10,
        })
    }

    #[tokio::test]
    async fn failed_jobs_and_accept_errors_do_not_stop_the_loop() {
        let h = harness(Staging::Memory);
        let store = h.store.clone();
        let (tx, acceptor) = ChannelAcceptor::new();
        let supervisor = supervisor(h, acceptor, 1);
        tx.unbounded_send(Ok(Connection::new("peer-a", Cursor::new(vec![b'x'; 5000])))).unwrap();
        tx.unbounded_send(Err(TransportError::Accept(io::Error::other("reset")))).unwrap();
        tx.unbounded_send(Ok(Connection::new("peer-b", Cursor::new(Vec::new())))).unwrap();
        tx.unbounded_send(Ok(Connection::new(
            "peer-c",
            Cursor::new(br#"{"value": 4, "timestamp": 0}"#.to_vec()),
        ))).unwrap();
        drop(tx);
        let stats = supervisor.run(CancellationToken::new()).await;
        assert_eq!(stats, StatsSnapshot {
            jobs_completed: 1,
            jobs_skipped: 1,
            jobs_failed: 1,
            rows_inserted: 1,
            rows_failed: 0,
        });
        assert_eq!(store.original_values(), vec![4]);
    }

    #[tokio::test]
    async fn concurrent_jobs_are_isolated() {
        let h = harness(Staging::File);
        let store = h.store.clone();
        let (tx, acceptor) = ChannelAcceptor::new();
        let supervisor = supervisor(h, acceptor, 4);
        for value in 1..=8 {
            let payload = format!("[{{\"value\": {value}, \"timestamp\": 0}}, {{\"value\": {}, \"timestamp\": 0}}]", value * 100);
            tx.unbounded_send(Ok(Connection::new("peer", Cursor::new(payload.into_bytes())))).unwrap();
        }
        drop(tx);
        let stats = supervisor.run(CancellationToken::new()).await;
        assert_eq!(stats.jobs_completed, 8);
        assert_eq!(stats.rows_inserted, 16);
        let mut values = store.original_values();
        values.sort();
        let mut expected: Vec<i32> = (1..=8).chain((1..=8).map(|v| v * 100)).collect();
        expected.sort();
        assert_eq!(values, expected);
    }

    #[tokio::test]
    async fn cancellation_stops_accepting_and_drains() {
        let h = harness(Staging::Memory);
        let store = h.store.clone();
        let (tx, acceptor) = ChannelAcceptor::new();
        let supervisor = supervisor(h, acceptor, 2);
        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(supervisor.run(shutdown.clone()));
        let (conn, closes) = tracked_connection("peer-a", br#"{"value": 2, "timestamp": 0}"#);
        tx.unbounded_send(Ok(conn)).unwrap();
        while closes.load(Ordering::SeqCst) == 0 {
            tokio::task::yield_now().await;
        }
        shutdown.cancel();
        let stats = handle.await.unwrap();
        assert_eq!(stats.jobs_completed, 1);
        assert_eq!(store.original_values(), vec![2]);
        drop(tx);
    }
}
