//! In-memory stand-ins for the overlay and the database.

use std::{
    collections::HashSet,
    io,
    pin::Pin,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
    task::{Context, Poll},
};

use async_trait::async_trait;
use futures::{
    channel::mpsc,
    io::{AsyncRead, AsyncWrite, Cursor},
    StreamExt,
};

use crate::{
    db::{InsertError, Store, StoreSession, TransformedRecord},
    transport::{Acceptor, Connection, TransportError},
};

#[derive(Default)]
struct MemoryState {
    rows: Vec<TransformedRecord>,
    connects: usize,
    failing: HashSet<i32>,
    refuse: bool,
}

#[derive(Clone, Default)]
pub struct MemoryStore {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryStore {
    /// Inserts of this `original_value` fail.
    pub fn fail_on(&self, original_value: i32) {
        self.state.lock().unwrap().failing.insert(original_value);
    }

    pub fn refuse_connections(&self) {
        self.state.lock().unwrap().refuse = true;
    }

    pub fn connects(&self) -> usize {
        self.state.lock().unwrap().connects
    }

    pub fn rows(&self) -> Vec<TransformedRecord> {
        self.state.lock().unwrap().rows.clone()
    }

    pub fn original_values(&self) -> Vec<i32> {
        self.rows().iter().map(|row| row.original_value).collect()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn connect(&self) -> Result<Box<dyn StoreSession>, InsertError> {
        let mut state = self.state.lock().unwrap();
        if state.refuse {
            return Err(InsertError::Connect("refused".to_string()));
        }
        state.connects += 1;
        Ok(Box::new(MemorySession {
            state: self.state.clone(),
        }))
    }
}

struct MemorySession {
    state: Arc<Mutex<MemoryState>>,
}

#[async_trait]
impl StoreSession for MemorySession {
    async fn insert(&mut self, record: &TransformedRecord) -> Result<(), InsertError> {
        let mut state = self.state.lock().unwrap();
        if state.failing.contains(&record.original_value) {
            return Err(InsertError::Execute(format!("rejected `{}`", record.original_value)));
        }
        state.rows.push(record.clone());
        Ok(())
    }
}

/// A readable stream that counts how often it was closed.
pub struct TrackedStream {
    inner: Cursor<Vec<u8>>,
    closes: Arc<AtomicUsize>,
    // a peer that never sends anything nor closes its side
    stalled: bool,
}

impl TrackedStream {
    pub fn new(bytes: &[u8]) -> (Self, Arc<AtomicUsize>) {
        let closes = Arc::new(AtomicUsize::new(0));
        let stream = Self {
            inner: Cursor::new(bytes.to_vec()),
            closes: closes.clone(),
            stalled: false,
        };
        (stream, closes)
    }

    pub fn stalled() -> (Self, Arc<AtomicUsize>) {
        let (mut stream, closes) = Self::new(b"");
        stream.stalled = true;
        (stream, closes)
    }
}

impl AsyncRead for TrackedStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut [u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        if this.stalled {
            return Poll::Pending;
        }
        Pin::new(&mut this.inner).poll_read(cx, buf)
    }
}

impl AsyncWrite for TrackedStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().inner).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_close(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.closes.fetch_add(1, Ordering::SeqCst);
        Poll::Ready(Ok(()))
    }
}

/// Connections pushed through a channel; dropping every sender shuts it down.
pub struct ChannelAcceptor {
    incoming: mpsc::UnboundedReceiver<Result<Connection, TransportError>>,
}

impl ChannelAcceptor {
    pub fn new() -> (mpsc::UnboundedSender<Result<Connection, TransportError>>, Self) {
        let (tx, rx) = mpsc::unbounded();
        (tx, Self { incoming: rx })
    }
}

#[async_trait]
impl Acceptor for ChannelAcceptor {
    async fn accept(&mut self) -> Result<Connection, TransportError> {
        self.incoming
            .next()
            .await
            .unwrap_or(Err(TransportError::Shutdown))
    }
}

pub fn tracked_connection(peer: &str, bytes: &[u8]) -> (Connection, Arc<AtomicUsize>) {
    let (stream, closes) = TrackedStream::new(bytes);
    (Connection::new(peer, stream), closes)
}
