use std::{
    fmt,
    str::FromStr,
    time::Duration,
};

use async_trait::async_trait;
use chrono::NaiveDateTime;
use libp2p::{PeerId, StreamProtocol};
use libp2p_stream::Control;
use log::{info, warn};
use serde_json::Value;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_postgres::{
    tls::NoTlsStream,
    Client, Config as PgConfig, NoTls,
};
use tokio_util::compat::FuturesAsyncReadCompatExt;

use crate::{
    config::StoreConfig,
    transport,
};

pub const DEFAULT_PG_PORT: u16 = 5432;

// parse side of the timestamp column; the fraction is optional
const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.f";

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SchemaValidationError {
    #[error("record is not an object")]
    NotAnObject,

    #[error("field `{0}` is missing")]
    Missing(&'static str),

    #[error("field `{field}` should be {expected}")]
    Mistyped {
        field: &'static str,
        expected: &'static str,
    },

    #[error("timestamp `{0}` is not `yyyy-MM-dd HH:mm:ss[.f]`")]
    Timestamp(String),
}

#[derive(Debug, Error)]
pub enum InsertError {
    #[error("store connection failed: {0}")]
    Connect(String),

    #[error("store connection timed out after `{0:?}`")]
    Timeout(Duration),

    #[error("insert failed: {0}")]
    Execute(String),
}

/// A row of the `transform` table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransformedRecord {
    pub original_value: i32,

    // original_value * 2
    pub doubled_value: i32,

    pub status: String,

    pub timestamp: NaiveDateTime,
}

impl TransformedRecord {
    pub fn from_json(value: &Value) -> Result<Self, SchemaValidationError> {
        let fields = value.as_object().ok_or(SchemaValidationError::NotAnObject)?;
        let field = |name: &'static str| {
            fields.get(name).ok_or(SchemaValidationError::Missing(name))
        };
        let int = |name: &'static str| -> Result<i32, SchemaValidationError> {
            field(name)?
                .as_i64()
                .and_then(|v| i32::try_from(v).ok())
                .ok_or(SchemaValidationError::Mistyped {
                    field: name,
                    expected: "a 32-bit integer",
                })
        };
        let original_value = int("original_value")?;
        let doubled_value = int("doubled_value")?;
        let status = field("status")?
            .as_str()
            .ok_or(SchemaValidationError::Mistyped {
                field: "status",
                expected: "a string",
            })?;
        let timestamp = field("timestamp")?
            .as_str()
            .ok_or(SchemaValidationError::Mistyped {
                field: "timestamp",
                expected: "a string",
            })?;
        Ok(Self {
            original_value: original_value,
            doubled_value: doubled_value,
            status: status.to_string(),
            timestamp: NaiveDateTime::parse_from_str(timestamp.trim(), TIMESTAMP_FORMAT)
                .map_err(|_| SchemaValidationError::Timestamp(timestamp.to_string()))?,
        })
    }
}

/// Connection factory for the relational store.
#[async_trait]
pub trait Store: Send + Sync {
    async fn connect(&self) -> Result<Box<dyn StoreSession>, InsertError>;
}

/// One logical store connection; released when dropped.
#[async_trait]
pub trait StoreSession: Send {
    async fn insert(&mut self, record: &TransformedRecord) -> Result<(), InsertError>;
}

/// Where the database lives: plain TCP, or a peer on the overlay that relays
/// the PostgreSQL protocol.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreAddress {
    Tcp { host: String, port: u16 },

    Overlay { peer: PeerId, service: StreamProtocol },
}

impl FromStr for StoreAddress {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Some(rest) = s.strip_prefix("p2p://") {
            let (peer, service) = rest
                .split_once('/')
                .ok_or_else(|| anyhow::anyhow!("expected `p2p://<peer-id>/<service>`, got `{s}`"))?;
            return Ok(StoreAddress::Overlay {
                peer: peer.parse()?,
                service: transport::service_protocol(service)?,
            });
        }
        let (host, port) = match s.rsplit_once(':') {
            // a bare ipv6 address has colons but no port
            Some((host, port)) if !host.is_empty() && !host.ends_with(':') => {
                (host, port.parse::<u16>()?)
            },

            _ => (s, DEFAULT_PG_PORT),
        };
        let host = host.trim_start_matches('[').trim_end_matches(']');
        if host.is_empty() {
            anyhow::bail!("store address is empty");
        }
        Ok(StoreAddress::Tcp {
            host: host.to_string(),
            port: port,
        })
    }
}

impl fmt::Display for StoreAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreAddress::Tcp { host, port } => write!(f, "{host}:{port}"),

            StoreAddress::Overlay { peer, service } => write!(f, "p2p://{peer}{}", service.as_ref()),
        }
    }
}

/// PostgreSQL behind a `StoreAddress`.
pub struct PgStore {
    address: StoreAddress,
    pg: PgConfig,
    insert_sql: String,
    connect_timeout: Duration,
    // opens overlay streams for `StoreAddress::Overlay`
    control: Option<Control>,
}

impl PgStore {
    pub fn new(
        address: StoreAddress,
        config: &StoreConfig,
        control: Option<Control>,
    ) -> anyhow::Result<Self> {
        if matches!(address, StoreAddress::Overlay { .. }) && control.is_none() {
            anyhow::bail!("`{address}` needs the overlay transport");
        }
        let mut pg = PgConfig::new();
        pg.user(&config.user);
        if false == config.password.is_empty() {
            pg.password(&config.password);
        }
        pg.dbname(&config.database);
        pg.application_name("flowrunner");
        Ok(Self {
            address: address,
            pg: pg,
            insert_sql: insert_statement(&config.table),
            connect_timeout: config.connect_timeout(),
            control: control,
        })
    }

    async fn open(&self) -> Result<Client, InsertError> {
        match &self.address {
            StoreAddress::Tcp { host, port } => {
                let mut pg = self.pg.clone();
                pg.host(host);
                pg.port(*port);
                let (client, connection) = pg
                    .connect(NoTls)
                    .await
                    .map_err(|e| InsertError::Connect(format!("`{}`: {e}", self.address)))?;
                drive(connection);
                Ok(client)
            },

            StoreAddress::Overlay { peer, service } => {
                let mut control = self.control
                    .clone()
                    .ok_or_else(|| InsertError::Connect("overlay transport is not available".to_string()))?;
                let stream = control
                    .open_stream(*peer, service.clone())
                    .await
                    .map_err(|e| InsertError::Connect(format!("`{}`: {e}", self.address)))?;
                let (client, connection) = self.pg
                    .connect_raw(stream.compat(), NoTls)
                    .await
                    .map_err(|e| InsertError::Connect(format!("`{}`: {e}", self.address)))?;
                drive(connection);
                Ok(client)
            },
        }
    }
}

#[async_trait]
impl Store for PgStore {
    async fn connect(&self) -> Result<Box<dyn StoreSession>, InsertError> {
        let client = tokio::time::timeout(self.connect_timeout, self.open())
            .await
            .map_err(|_| InsertError::Timeout(self.connect_timeout))??;
        Ok(Box::new(PgSession {
            client: client,
            insert_sql: self.insert_sql.clone(),
        }))
    }
}

struct PgSession {
    client: Client,
    insert_sql: String,
}

#[async_trait]
impl StoreSession for PgSession {
    async fn insert(&mut self, record: &TransformedRecord) -> Result<(), InsertError> {
        info!(
            "Inserting: doubled=`{}`, original=`{}`, status=`{}`, timestamp=`{}`",
            record.doubled_value,
            record.original_value,
            record.status,
            record.timestamp
        );
        self.client
            .execute(
                &self.insert_sql,
                &[
                    &record.doubled_value,
                    &record.original_value,
                    &record.status,
                    &record.timestamp,
                ],
            )
            .await
            .map_err(|e| InsertError::Execute(e.to_string()))?;
        Ok(())
    }
}

pub fn insert_statement(table: &str) -> String {
    format!(
        "INSERT INTO {table} (doubled_value, original_value, status, timestamp) VALUES ($1, $2, $3, $4)"
    )
}

// the connection half does the actual io; it ends when the client is dropped
fn drive<S>(connection: tokio_postgres::Connection<S, NoTlsStream>)
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        if let Err(e) = connection.await {
            warn!("PostgreSQL connection error: `{e}`");
        }
    });
}
