//! Overlay transport: a libp2p swarm whose stream behaviour lets the service
//! bind a named protocol and accept raw byte streams on it.

use std::{
    fmt,
    fs,
    io,
    path::Path,
    pin::Pin,
    task::{Context, Poll},
    time::Duration,
};

use async_trait::async_trait;
use futures::{
    io::{AsyncRead, AsyncWrite, AsyncWriteExt},
    select,
    stream::{Stream, StreamExt},
    FutureExt,
};
use libp2p::{
    identify, identity, mdns, noise, tcp, yamux,
    swarm::{NetworkBehaviour, SwarmEvent},
    Multiaddr, PeerId, StreamProtocol, Swarm,
};
use libp2p_stream::Control;
use log::{info, warn};
use thiserror::Error;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio_util::sync::CancellationToken;

#[derive(Debug, Error)]
pub enum BindError {
    #[error("identity `{path}` could not be loaded: {reason}")]
    Identity { path: String, reason: String },

    #[error("service name `{0}` is not a valid protocol name")]
    InvalidService(String),

    #[error("service `{0}` is already bound")]
    AlreadyBound(String),

    #[error("overlay transport failed to start: {0}")]
    Transport(String),
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("overlay transport has shut down")]
    Shutdown,

    #[error("accept failed: {0}")]
    Accept(#[from] io::Error),
}

/// Anything that can carry a job's bytes in both directions.
pub trait ByteStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T> ByteStream for T where T: AsyncRead + AsyncWrite + Send + Unpin {}

/// An inbound connection. Closing consumes it, so it is closed at most once.
pub struct Connection {
    peer: String,
    stream: Box<dyn ByteStream>,
}

impl Connection {
    pub fn new(peer: impl Into<String>, stream: impl ByteStream + 'static) -> Self {
        Self {
            peer: peer.into(),
            stream: Box::new(stream),
        }
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    pub async fn close(mut self) -> io::Result<()> {
        self.stream.close().await
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("peer", &self.peer)
            .finish_non_exhaustive()
    }
}

impl AsyncRead for Connection {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut [u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().stream).poll_read(cx, buf)
    }
}

impl AsyncWrite for Connection {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().stream).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().stream).poll_flush(cx)
    }

    fn poll_close(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().stream).poll_close(cx)
    }
}

/// Source of inbound connections.
///
/// `accept` waits until a peer connects; it only fails when the transport is
/// gone or on a transport-level fault. It must be cancel safe.
#[async_trait]
pub trait Acceptor: Send {
    async fn accept(&mut self) -> Result<Connection, TransportError>;
}

#[derive(NetworkBehaviour)]
pub struct MyBehaviour {
    pub stream: libp2p_stream::Behaviour,
    pub mdns: mdns::tokio::Behaviour,
    pub identify: identify::Behaviour,
}

/// Running overlay node. The swarm itself lives on a background task.
pub struct Overlay {
    peer_id: PeerId,
    control: Control,
}

impl Overlay {
    pub fn start(
        local_key: identity::Keypair,
        listen_addrs: &[Multiaddr],
        bootnodes: &[Multiaddr],
        shutdown: CancellationToken,
    ) -> Result<Self, BindError> {
        let peer_id = PeerId::from_public_key(&local_key.public());
        let mut swarm = setup_swarm(local_key)
            .map_err(|e| BindError::Transport(e.to_string()))?;
        let control = swarm.behaviour().stream.new_control();
        for addr in listen_addrs {
            swarm
                .listen_on(addr.clone())
                .map_err(|e| BindError::Transport(format!("listen on `{addr}`: {e}")))?;
        }
        // get to know bootnodes
        for addr in bootnodes {
            if let Err(e) = swarm.dial(addr.clone()) {
                warn!("Failed to dial bootnode `{addr}`: `{e:?}`");
            }
        }
        tokio::spawn(drive_swarm(swarm, shutdown));
        Ok(Self {
            peer_id: peer_id,
            control: control,
        })
    }

    pub fn peer_id(&self) -> PeerId {
        self.peer_id
    }

    /// A handle that opens outbound streams, shared with the store dialer.
    pub fn control(&self) -> Control {
        self.control.clone()
    }

    /// Binds `service_name`; up to `backlog` inbound streams wait for `accept`.
    pub fn bind(
        &self,
        service_name: &str,
        backlog: usize,
    ) -> Result<OverlayListener, BindError> {
        let protocol = service_protocol(service_name)?;
        let incoming = self.control
            .clone()
            .accept(protocol.clone())
            .map_err(|_| BindError::AlreadyBound(service_name.to_string()))?;
        info!("Bound service `{protocol}` on `{}`, backlog: `{backlog}`", self.peer_id);
        let incoming = incoming.map(|(peer, stream)| Connection::new(peer.to_string(), stream));
        Ok(OverlayListener::queued(protocol, incoming, backlog))
    }
}

pub struct OverlayListener {
    protocol: StreamProtocol,
    queue: mpsc::Receiver<Connection>,
}

impl OverlayListener {
    // the swarm hands streams over one slot at a time and drops the rest, so
    // they are pulled out eagerly and wait here instead
    fn queued<S>(protocol: StreamProtocol, incoming: S, backlog: usize) -> Self
    where
        S: Stream<Item = Connection> + Send + Unpin + 'static,
    {
        let (tx, rx) = mpsc::channel(backlog.max(1));
        tokio::spawn(pump_incoming(protocol.clone(), incoming, tx));
        Self {
            protocol: protocol,
            queue: rx,
        }
    }

    pub fn protocol(&self) -> &StreamProtocol {
        &self.protocol
    }
}

#[async_trait]
impl Acceptor for OverlayListener {
    async fn accept(&mut self) -> Result<Connection, TransportError> {
        self.queue
            .recv()
            .await
            .ok_or(TransportError::Shutdown)
    }
}

async fn pump_incoming<S>(
    protocol: StreamProtocol,
    mut incoming: S,
    queue: mpsc::Sender<Connection>,
)
where
    S: Stream<Item = Connection> + Unpin,
{
    while let Some(conn) = incoming.next().await {
        match queue.try_send(conn) {
            Ok(()) => {},

            Err(TrySendError::Full(conn)) => {
                warn!(
                    "Backlog of `{protocol}` is full (`{}`), dropping the connection from `{}`",
                    queue.max_capacity(),
                    conn.peer()
                );
            },

            // listener is gone
            Err(TrySendError::Closed(_)) => break,
        }
    }
}

/// Maps a service name onto a stream protocol, `transform` -> `/transform`.
pub fn service_protocol(service_name: &str) -> Result<StreamProtocol, BindError> {
    let trimmed = service_name.trim();
    if trimmed.is_empty() || trimmed == "/" || trimmed.chars().any(char::is_whitespace) {
        return Err(BindError::InvalidService(service_name.to_string()));
    }
    let name = if trimmed.starts_with('/') {
        trimmed.to_string()
    } else {
        format!("/{trimmed}")
    };
    StreamProtocol::try_from_owned(name)
        .map_err(|_| BindError::InvalidService(service_name.to_string()))
}

/// Loads the protobuf-encoded keypair at `path`, optionally generating one
/// when the file does not exist yet.
pub fn load_identity(
    path: &Path,
    generate_if_missing: bool,
) -> Result<identity::Keypair, BindError> {
    let identity_err = |reason: String| BindError::Identity {
        path: path.display().to_string(),
        reason: reason,
    };
    if false == path.exists() && true == generate_if_missing {
        let new_key = identity::Keypair::generate_ed25519();
        let bytes = new_key
            .to_protobuf_encoding()
            .map_err(|e| identity_err(e.to_string()))?;
        fs::write(path, bytes).map_err(|e| identity_err(e.to_string()))?;
        warn!(
            "No identity was found, so one has been generated and saved to `{}`.",
            path.display()
        );
        return Ok(new_key);
    }
    let bytes = fs::read(path).map_err(|e| identity_err(e.to_string()))?;
    identity::Keypair::from_protobuf_encoding(&bytes)
        .map_err(|e| identity_err(e.to_string()))
}

fn setup_swarm(
    local_key: identity::Keypair,
) -> anyhow::Result<Swarm<MyBehaviour>> {
    let swarm = libp2p::SwarmBuilder::with_existing_identity(local_key)
        .with_tokio()
        .with_tcp(
            tcp::Config::default(),
            noise::Config::new,
            yamux::Config::default,
        )?
        .with_behaviour(|key| -> Result<MyBehaviour, Box<dyn std::error::Error + Send + Sync>> {
            let mdns = mdns::tokio::Behaviour::new(
                mdns::Config::default(),
                key.public().to_peer_id(),
            )?;
            let identify = identify::Behaviour::new(
                identify::Config::new(
                    "/flowrunner/1.0.0".to_string(),
                    key.public(),
                )
            );
            Ok(MyBehaviour {
                stream: libp2p_stream::Behaviour::new(),
                mdns: mdns,
                identify: identify,
            })
        })?
        .with_swarm_config(|c| c.with_idle_connection_timeout(Duration::from_secs(60)))
        .build();
    Ok(swarm)
}

async fn drive_swarm(
    mut swarm: Swarm<MyBehaviour>,
    shutdown: CancellationToken,
) {
    let mut cancelled = Box::pin(shutdown.cancelled().fuse());
    loop {
        select! {
            () = cancelled => {
                info!("Overlay transport is shutting down.");
                break;
            },

            // libp2p events
            event = swarm.select_next_some() => match event {
                SwarmEvent::NewListenAddr { address, .. } => {
                    info!("Local node is listening on {address}");
                },

                // mdns events
                SwarmEvent::Behaviour(
                    MyBehaviourEvent::Mdns(
                        mdns::Event::Discovered(list)
                    )
                ) => {
                    for (peer_id, multiaddr) in list {
                        info!("mDNS discovered a new peer: {peer_id}");
                        swarm.add_peer_address(peer_id, multiaddr);
                    }
                },

                SwarmEvent::Behaviour(
                    MyBehaviourEvent::Mdns(
                        mdns::Event::Expired(list)
                    )
                ) => {
                    for (peer_id, _multiaddr) in list {
                        info!("mDNS discovered peer has expired: {peer_id}");
                    }
                },

                // identify events
                SwarmEvent::Behaviour(MyBehaviourEvent::Identify(identify::Event::Received {
                    peer_id,
                    info,
                    ..
                })) => {
                    for addr in info.listen_addrs {
                        swarm.add_peer_address(peer_id, addr);
                    }
                },

                SwarmEvent::ConnectionEstablished { peer_id, .. } => {
                    info!("Connection established with `{peer_id}`");
                },

                SwarmEvent::OutgoingConnectionError { peer_id, error, .. } => {
                    warn!("Outgoing connection to `{peer_id:?}` failed: `{error}`");
                },

                _ => {},
            },
        }
    }
}
