//! Peer endpoint lifecycle.
//!
//! A [`PeerEndpoint`] drives one side of a two-party link: the
//! *listener* accepts a single inbound connection on a loopback port
//! (the local end of the hidden service), the *connector* dials the
//! peer's hidden address through the SOCKS proxy. Both run the same
//! mutual-ack handshake and expose the same send surface and event
//! stream.
//!
//! At most one session is live per endpoint. A new inbound connection
//! replaces the previous session: the old one is closed first, and its
//! dispatch task recognizes by generation that it no longer owns the
//! endpoint, so the replacement never misreports a disconnect.

use crate::address::HiddenAddress;
use crate::error::{Error, Result};
use crate::logging::ShortAddr;
use crate::protocol::{FrameKind, ProtocolSession, SessionReceiver, SessionSender};
use crate::socks::Socks5Dialer;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, watch, Mutex};
use tracing::{debug, info, warn};

/// Default SOCKS5 proxy port for a local Tor daemon.
pub const DEFAULT_SOCKS_PORT: u16 = 9050;

/// Conventional hidden-service rendezvous port.
pub const DEFAULT_HIDDEN_PORT: u16 = 9999;

/// Endpoint configuration.
///
/// The defaults are the normative timeouts; tests shrink them.
#[derive(Debug, Clone)]
pub struct EndpointConfig {
    /// Local SOCKS5 proxy address.
    pub socks_addr: SocketAddr,
    /// Remote hidden-service port to dial.
    pub remote_port: u16,
    /// Per-read/write deadline during the SOCKS exchange.
    pub socks_io_timeout: Duration,
    /// Deadline for the whole handshake, both roles.
    pub handshake_timeout: Duration,
    /// Capacity of the event channel.
    pub event_capacity: usize,
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            socks_addr: SocketAddr::from(([127, 0, 0, 1], DEFAULT_SOCKS_PORT)),
            remote_port: DEFAULT_HIDDEN_PORT,
            socks_io_timeout: Duration::from_secs(120),
            handshake_timeout: Duration::from_secs(60),
            event_capacity: 64,
        }
    }
}

/// Which side of the link this endpoint plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Accepts the inbound connection behind the hidden service.
    Listener,
    /// Dials the peer's hidden address through SOCKS.
    Connector,
}

/// Endpoint lifecycle phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// No connection activity.
    Idle,
    /// Connector is dialing through the proxy.
    Dialing,
    /// Key exchange and mutual ack in progress.
    Handshaking,
    /// Session established; messages flow.
    Live,
    /// Teardown in progress.
    Closing,
    /// Endpoint shut down.
    Closed,
}

/// Events emitted by an endpoint.
///
/// Subscribe before starting connection activity; the channel is
/// bounded and slow consumers miss events rather than blocking the
/// session.
#[derive(Debug, Clone)]
pub enum PeerEvent {
    /// A connection attempt started (inbound accept or outbound dial).
    Connecting,
    /// Handshake completed; the session is live.
    Connected,
    /// The live session ended unexpectedly or the peer closed it.
    Disconnected,
    /// A chat message arrived.
    MessageReceived {
        /// Decrypted message text.
        text: String,
    },
    /// The peer is typing.
    TypingReceived,
    /// The peer displayed a message we sent.
    ReadReceiptReceived,
}

/// A live session as held by the endpoint.
struct LiveSession {
    sender: SessionSender<OwnedWriteHalf>,
    generation: u64,
    close_tx: watch::Sender<bool>,
}

struct Shared {
    role: Role,
    config: EndpointConfig,
    phase: std::sync::Mutex<Phase>,
    live: Mutex<Option<LiveSession>>,
    generation: AtomicU64,
    events: broadcast::Sender<PeerEvent>,
    shutdown_tx: watch::Sender<bool>,
}

/// One side of the anonymous two-party link.
pub struct PeerEndpoint {
    shared: Arc<Shared>,
}

impl PeerEndpoint {
    /// Create a listener-role endpoint. Call
    /// [`listen`](PeerEndpoint::listen) to start accepting.
    pub fn listener(config: EndpointConfig) -> Self {
        Self::with_role(Role::Listener, config)
    }

    /// Create a connector-role endpoint. Call
    /// [`connect`](PeerEndpoint::connect) to dial.
    pub fn connector(config: EndpointConfig) -> Self {
        Self::with_role(Role::Connector, config)
    }

    fn with_role(role: Role, config: EndpointConfig) -> Self {
        let (events, _) = broadcast::channel(config.event_capacity);
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            shared: Arc::new(Shared {
                role,
                config,
                phase: std::sync::Mutex::new(Phase::Idle),
                live: Mutex::new(None),
                generation: AtomicU64::new(0),
                events,
                shutdown_tx,
            }),
        }
    }

    /// This endpoint's role.
    pub fn role(&self) -> Role {
        self.shared.role
    }

    /// Current lifecycle phase.
    pub fn phase(&self) -> Phase {
        self.shared.phase.lock().map(|p| *p).unwrap_or(Phase::Closed)
    }

    /// Subscribe to endpoint events.
    pub fn subscribe(&self) -> broadcast::Receiver<PeerEvent> {
        self.shared.events.subscribe()
    }

    /// Start accepting inbound connections on a loopback port.
    ///
    /// Returns the bound address (useful with port 0). The accept loop
    /// runs until [`stop`](PeerEndpoint::stop); a failed inbound
    /// handshake does not end it, and a fresh inbound replaces any
    /// existing session.
    pub async fn listen(&self, port: u16) -> Result<SocketAddr> {
        self.ensure_role(Role::Listener)?;

        let listener = TcpListener::bind(("127.0.0.1", port)).await?;
        let addr = listener.local_addr()?;
        info!(%addr, "listening for peer");

        let shared = Arc::clone(&self.shared);
        tokio::spawn(accept_loop(shared, listener));
        Ok(addr)
    }

    /// Dial the peer's hidden address through the SOCKS proxy and run
    /// the connector-role handshake.
    ///
    /// The session key pair does not exist until the tunnel is up; a
    /// SOCKS failure therefore leaves no crypto state behind.
    pub async fn connect(&self, address: &HiddenAddress) -> Result<()> {
        self.ensure_role(Role::Connector)?;

        set_phase(&self.shared, Phase::Dialing);
        let _ = self.shared.events.send(PeerEvent::Connecting);
        info!(target = %ShortAddr(address.as_str()), "connecting to peer");

        let dialer = Socks5Dialer::new(
            self.shared.config.socks_addr,
            self.shared.config.socks_io_timeout,
        );

        // The dial is a suspension point like any other network
        // operation: racing it against shutdown aborts the in-flight
        // TCP connect instead of letting it run out its own timeouts.
        let mut shutdown = self.shared.shutdown_tx.subscribe();
        if *shutdown.borrow() {
            set_phase(&self.shared, Phase::Closed);
            return Err(Error::Cancelled);
        }
        let stream = tokio::select! {
            _ = shutdown.changed() => {
                set_phase(&self.shared, Phase::Closed);
                return Err(Error::Cancelled);
            }
            res = dialer.connect(address, self.shared.config.remote_port) => match res {
                Ok(stream) => stream,
                Err(e) => {
                    set_phase(&self.shared, Phase::Idle);
                    return Err(e);
                }
            }
        };

        close_current(&self.shared).await;
        establish(&self.shared, stream).await
    }

    /// Run the connector-role handshake over an already-established
    /// stream, bypassing the SOCKS dial.
    ///
    /// For transports set up externally, and for harnesses that connect
    /// the two roles directly.
    pub async fn connect_stream(&self, stream: TcpStream) -> Result<()> {
        self.ensure_role(Role::Connector)?;

        let _ = self.shared.events.send(PeerEvent::Connecting);
        close_current(&self.shared).await;
        establish(&self.shared, stream).await
    }

    /// Encrypt and send a chat message on the live session.
    pub async fn send_message(&self, text: &str) -> Result<()> {
        self.current_sender().await?.send_message(text).await
    }

    /// Send a typing indicator on the live session.
    pub async fn send_typing(&self) -> Result<()> {
        self.current_sender().await?.send_typing().await
    }

    /// Send a read receipt on the live session.
    pub async fn send_read_receipt(&self) -> Result<()> {
        self.current_sender().await?.send_read_receipt().await
    }

    /// Shut the endpoint down.
    ///
    /// Closes the live session if any, stops the accept loop, and
    /// zeroizes session keys. A local stop is not a peer disconnect:
    /// no [`PeerEvent::Disconnected`] is emitted.
    pub async fn stop(&self) {
        set_phase(&self.shared, Phase::Closing);
        let _ = self.shared.shutdown_tx.send(true);
        close_current(&self.shared).await;
        set_phase(&self.shared, Phase::Closed);
        info!(role = ?self.shared.role, "endpoint stopped");
    }

    async fn current_sender(&self) -> Result<SessionSender<OwnedWriteHalf>> {
        let live = self.shared.live.lock().await;
        live.as_ref()
            .map(|l| l.sender.clone())
            .ok_or(Error::NotConnected)
    }

    fn ensure_role(&self, expected: Role) -> Result<()> {
        if self.shared.role != expected {
            return Err(Error::Protocol(format!(
                "operation requires {:?} role",
                expected
            )));
        }
        Ok(())
    }
}

/// Accept inbound connections until shutdown.
async fn accept_loop(shared: Arc<Shared>, listener: TcpListener) {
    let mut shutdown = shared.shutdown_tx.subscribe();
    if *shutdown.borrow() {
        return;
    }

    loop {
        let stream = tokio::select! {
            _ = shutdown.changed() => break,
            res = listener.accept() => match res {
                Ok((stream, addr)) => {
                    debug!(%addr, "inbound connection");
                    stream
                }
                Err(e) => {
                    warn!(error = %e, "accept failed");
                    tokio::time::sleep(Duration::from_secs(1)).await;
                    continue;
                }
            }
        };

        let _ = shared.events.send(PeerEvent::Connecting);

        // At most one session: a fresh inbound closes the old session
        // before its replacement handshakes.
        close_current(&shared).await;

        match establish(&shared, stream).await {
            Ok(()) => {}
            Err(Error::Cancelled) => break,
            Err(e) => warn!(error = %e, "inbound handshake failed"),
        }
    }

    debug!("accept loop stopped");
}

/// Run the handshake on a fresh stream and install the live session.
async fn establish(shared: &Arc<Shared>, stream: TcpStream) -> Result<()> {
    set_phase(shared, Phase::Handshaking);

    let (read_half, write_half) = stream.into_split();
    let mut proto = ProtocolSession::new(read_half, write_half);

    let mut shutdown = shared.shutdown_tx.subscribe();
    if *shutdown.borrow() {
        set_phase(shared, Phase::Closed);
        return Err(Error::Cancelled);
    }
    let handshake = async {
        match shared.role {
            Role::Listener => proto.handshake_listener().await,
            Role::Connector => proto.handshake_connector().await,
        }
    };

    let result = tokio::select! {
        _ = shutdown.changed() => Err(Error::Cancelled),
        res = tokio::time::timeout(shared.config.handshake_timeout, handshake) => {
            match res {
                Ok(inner) => inner,
                Err(_) => Err(Error::Timeout),
            }
        }
    };

    if let Err(e) = result {
        // The failed stream and its key pair drop here; crypto material
        // is zeroized by the session's drop.
        set_phase(
            shared,
            if matches!(e, Error::Cancelled) {
                Phase::Closed
            } else {
                Phase::Idle
            },
        );
        return Err(e);
    }

    let (sender, receiver) = proto.into_live();
    let generation = shared.generation.fetch_add(1, Ordering::SeqCst) + 1;
    let (close_tx, close_rx) = watch::channel(false);

    {
        let mut live = shared.live.lock().await;
        if let Some(old) = live.take() {
            let _ = old.close_tx.send(true);
        }
        *live = Some(LiveSession {
            sender: sender.clone(),
            generation,
            close_tx,
        });
    }
    set_phase(shared, Phase::Live);
    let _ = shared.events.send(PeerEvent::Connected);
    info!(role = ?shared.role, generation, "session live");

    let shared = Arc::clone(shared);
    tokio::spawn(dispatch_loop(shared, receiver, sender, generation, close_rx));
    Ok(())
}

/// Read frames on a live session and react until it ends.
///
/// Termination fires [`PeerEvent::Disconnected`] only when this task's
/// session is still the endpoint's current one; a replaced or locally
/// closed session ends silently.
async fn dispatch_loop(
    shared: Arc<Shared>,
    mut receiver: SessionReceiver<OwnedReadHalf>,
    sender: SessionSender<OwnedWriteHalf>,
    generation: u64,
    mut close_rx: watch::Receiver<bool>,
) {
    let mut shutdown = shared.shutdown_tx.subscribe();

    let error = loop {
        tokio::select! {
            _ = shutdown.changed() => break None,
            _ = close_rx.changed() => break None,
            res = receiver.receive() => match res {
                Ok((FrameKind::EncryptedMessage, Some(text))) => {
                    let _ = shared.events.send(PeerEvent::MessageReceived { text });
                    if let Err(e) = sender.send_read_receipt().await {
                        break Some(e);
                    }
                }
                Ok((FrameKind::TypingIndicator, _)) => {
                    let _ = shared.events.send(PeerEvent::TypingReceived);
                }
                Ok((FrameKind::ReadReceipt, _)) => {
                    let _ = shared.events.send(PeerEvent::ReadReceiptReceived);
                }
                Ok((kind, _)) => {
                    break Some(Error::Protocol(format!(
                        "unexpected {:?} frame in live session",
                        kind
                    )));
                }
                Err(e) => break Some(e),
            }
        }
    };

    match error {
        Some(e) => {
            let mut live = shared.live.lock().await;
            let owns = live
                .as_ref()
                .map(|l| l.generation == generation)
                .unwrap_or(false);
            if owns {
                *live = None;
                drop(live);
                set_phase(
                    &shared,
                    match shared.role {
                        Role::Listener => Phase::Idle,
                        Role::Connector => Phase::Closed,
                    },
                );
                warn!(generation, error = %e, "session ended");
                let _ = shared.events.send(PeerEvent::Disconnected);
            } else {
                debug!(generation, "stale session ended");
            }
        }
        None => {
            debug!(generation, "session closed locally");
        }
    }
}

async fn close_current(shared: &Shared) {
    let mut live = shared.live.lock().await;
    if let Some(old) = live.take() {
        let _ = old.close_tx.send(true);
        debug!(generation = old.generation, "session closed");
    }
}

fn set_phase(shared: &Shared, phase: Phase) {
    if let Ok(mut p) = shared.phase.lock() {
        *p = phase;
    }
}
