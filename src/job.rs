use std::{
    fmt,
    fs,
    io,
    path::{Path, PathBuf},
    sync::atomic::{AtomicU64, Ordering},
};

use chrono::{DateTime, Utc};
use log::warn;
use uuid::Uuid;
use xxhash_rust::xxh3;

// process-wide job sequence, ids stay ordered in the logs
static NEXT_JOB_SEQ: AtomicU64 = AtomicU64::new(1);

/// Identifier of a single accepted connection's request-to-persist lifecycle.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct JobId(String);

impl JobId {
    pub fn next() -> Self {
        let seq = NEXT_JOB_SEQ.fetch_add(1, Ordering::Relaxed);
        let suffix = Uuid::new_v4().simple().to_string()[..8].to_string();
        Self(format!("job-{seq:06}-{suffix}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Raw input written to disk between receipt and transformation.
///
/// The file is removed when the handle is dropped, so every exit path of a
/// job releases its staging space.
#[derive(Debug)]
pub struct StagedFile {
    path: PathBuf,
}

impl StagedFile {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path: path,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for StagedFile {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_file(&self.path) {
            if e.kind() != io::ErrorKind::NotFound {
                warn!(
                    "Failed to discard staged input `{}`: `{e:?}`",
                    self.path.display()
                );
            }
        }
    }
}

#[derive(Debug)]
pub enum StagedInput {
    Memory(Vec<u8>),

    File(StagedFile),
}

// maintains lifecycle for a job
#[derive(Debug)]
pub struct Job {
    pub id: JobId,

    // who submitted it
    pub peer: String,

    pub created_at: DateTime<Utc>,

    // payload size in bytes
    pub size: usize,

    // xxh3 of the payload, handy to spot resubmissions
    pub digest: u64,

    pub input: StagedInput,
}

impl Job {
    // payload stays in memory unless it was staged to a file
    pub fn new(
        id: JobId,
        peer: &str,
        payload: Vec<u8>,
        staged: Option<StagedFile>,
    ) -> Job {
        let size = payload.len();
        let digest = xxh3::xxh3_64(&payload);
        Job {
            id: id,
            peer: peer.to_string(),
            created_at: Utc::now(),
            size: size,
            digest: digest,
            input: match staged {
                Some(file) => StagedInput::File(file),

                None => StagedInput::Memory(payload),
            },
        }
    }
}

// get base staging path of the host
pub fn get_staging_path() -> PathBuf {
    match home::home_dir() {
        Some(home_dir) => home_dir.join(".flowrunner").join("staging"),

        None => std::env::temp_dir().join("flowrunner-staging"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn job_ids_are_unique_and_ordered() {
        let ids: Vec<JobId> = (0..64).map(|_| JobId::next()).collect();
        let unique: HashSet<_> = ids.iter().cloned().collect();
        assert_eq!(unique.len(), ids.len());
        for pair in ids.windows(2) {
            let seq = |id: &JobId| id.as_str()[4..10].parse::<u64>().unwrap();
            assert!(seq(&pair[0]) < seq(&pair[1]));
        }
    }

    #[test]
    fn staged_file_is_removed_on_drop() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("job-input.json");
        fs::write(&path, b"{}").unwrap();
        let staged = StagedFile::new(path.clone());
        assert!(staged.path().exists());
        drop(staged);
        assert!(!path.exists());
    }

    #[test]
    fn dropping_a_missing_staged_file_is_quiet() {
        let dir = tempfile::tempdir().unwrap();
        let staged = StagedFile::new(dir.path().join("never-written.json"));
        drop(staged);
    }

    #[test]
    fn job_records_size_and_digest() {
        let payload = br#"{"value": 5, "timestamp": 1700000000}"#;
        let job = Job::new(JobId::next(), "peer-a", payload.to_vec(), None);
        assert_eq!(job.size, payload.len());
        assert_eq!(job.digest, xxh3::xxh3_64(payload));
        assert_eq!(job.peer, "peer-a");
        assert!(matches!(job.input, StagedInput::Memory(ref bytes) if bytes == payload));
    }
}
