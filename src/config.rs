use std::{
    env,
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::{bail, Context};
use chrono::format::{Item, StrftimeItems};
use serde::Deserialize;

use crate::{
    ingest::{Framing, Staging},
    job,
    pipeline::{EpochUnit, Encoding},
    writer::ConnectionScope,
};

pub const PASSWORD_ENV: &str = "FLOWRUNNER_DB_PASSWORD";

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct OverlayConfig {
    // seconds to wait after bind before traffic routes correctly
    pub settle_secs: u64,

    pub listen: Vec<String>,

    pub bootnodes: Vec<String>,

    // inbound streams held while every job slot is busy
    pub backlog: usize,
}

impl Default for OverlayConfig {
    fn default() -> Self {
        Self {
            settle_secs: 20,
            listen: vec!["/ip4/0.0.0.0/tcp/0".to_string()],
            bootnodes: vec![],
            backlog: 128,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct IngestConfig {
    pub framing: Framing,

    pub staging: Staging,

    // defaults to ~/.flowrunner/staging
    pub staging_dir: Option<PathBuf>,

    pub max_payload_bytes: usize,

    pub read_timeout_secs: u64,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            framing: Framing::StreamToEof,
            staging: Staging::File,
            staging_dir: None,
            max_payload_bytes: 16 * 1024 * 1024,
            read_timeout_secs: 30,
        }
    }
}

impl IngestConfig {
    pub fn staging_dir(&self) -> PathBuf {
        self.staging_dir
            .clone()
            .unwrap_or_else(job::get_staging_path)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_secs(self.read_timeout_secs)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TransformConfig {
    // strftime pattern for the formatted timestamp
    pub timestamp_pattern: String,

    pub epoch_unit: EpochUnit,

    pub sink_encoding: Encoding,
}

impl Default for TransformConfig {
    fn default() -> Self {
        Self {
            timestamp_pattern: "%Y-%m-%d %H:%M:%S".to_string(),
            epoch_unit: EpochUnit::Millis,
            sink_encoding: Encoding::JsonObject,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub database: String,

    pub user: String,

    pub password: String,

    pub table: String,

    pub connection_scope: ConnectionScope,

    pub connect_timeout_secs: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            database: "mydb".to_string(),
            user: "myuser".to_string(),
            password: String::new(),
            table: "transform".to_string(),
            connection_scope: ConnectionScope::PerRecord,
            connect_timeout_secs: 10,
        }
    }
}

impl StoreConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SupervisorConfig {
    // 1 keeps a single job in flight
    pub max_concurrent_jobs: usize,

    pub backoff_millis: u64,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            max_concurrent_jobs: 1,
            backoff_millis: 1000,
        }
    }
}

impl SupervisorConfig {
    pub fn backoff(&self) -> Duration {
        Duration::from_millis(self.backoff_millis)
    }
}

/// Service settings as read in from disk; every section is optional.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub overlay: OverlayConfig,

    pub ingest: IngestConfig,

    pub transform: TransformConfig,

    pub store: StoreConfig,

    pub supervisor: SupervisorConfig,
}

impl Config {
    pub fn load(path: Option<&Path>) -> anyhow::Result<Config> {
        let mut config = match path {
            Some(path) => Self::from_toml(
                &fs::read_to_string(path)
                    .with_context(|| format!("failed to read config `{}`", path.display()))?
            )
            .with_context(|| format!("invalid config `{}`", path.display()))?,

            None => Config::default(),
        };
        if let Ok(password) = env::var(PASSWORD_ENV) {
            config.store.password = password;
        }
        Ok(config)
    }

    pub fn from_toml(text: &str) -> anyhow::Result<Config> {
        let config: Config = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.supervisor.max_concurrent_jobs == 0 {
            bail!("`supervisor.max_concurrent_jobs` must be at least 1");
        }
        if self.overlay.backlog == 0 {
            bail!("`overlay.backlog` must be at least 1");
        }
        if self.ingest.max_payload_bytes == 0 {
            bail!("`ingest.max_payload_bytes` must be positive");
        }
        if StrftimeItems::new(&self.transform.timestamp_pattern)
            .any(|item| matches!(item, Item::Error))
        {
            bail!(
                "`transform.timestamp_pattern` is not a valid pattern: `{}`",
                self.transform.timestamp_pattern
            );
        }
        if false == is_table_name(&self.store.table) {
            bail!("`store.table` is not a plain table name: `{}`", self.store.table);
        }
        Ok(())
    }
}

// `table` or `schema.table`, letters, digits and underscores only
fn is_table_name(name: &str) -> bool {
    let parts: Vec<&str> = name.split('.').collect();
    parts.len() <= 2 &&
    parts.iter().all(|part| {
        !part.is_empty() &&
        !part.starts_with(|c: char| c.is_ascii_digit()) &&
        part.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
    })
}
