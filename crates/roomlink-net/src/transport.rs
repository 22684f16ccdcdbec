//! Client transport: one reliable stream and one datagram channel to a
//! single room server.
//!
//! [`NetClient`] owns a small tokio runtime. Background tasks read the
//! stream, write queued outbound records, and run the datagram channel;
//! all of them only decode bytes and push [`ServerEvent`]s into the
//! [`Inbox`]. Session state is never touched off the apply loop.
//!
//! When the server cannot be reached the client switches to offline mode:
//! outbound records are answered by a [`Loopback`] and its replies go
//! through the same decoder as server traffic.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::net::{TcpStream, UdpSocket};
use tokio::runtime::Runtime;
use tokio::sync::{mpsc, watch};

use crate::codec::Writer;
use crate::datagram::run_datagram_channel;
use crate::framing::{FrameError, RecordDecoder, read_records};
use crate::inbox::{DEFAULT_INBOX_CAPACITY, Inbox, InboxSender};
use crate::loopback::Loopback;
use crate::platform::{SocketConfig, configure_stream, create_datagram_socket, resolve};
use crate::protocol::{ServerEvent, UserId};

// ---------------------------------------------------------------------------
// Connection state
// ---------------------------------------------------------------------------

/// Connection lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Attempting to establish the stream connection.
    Connecting,
    /// Stream connection established.
    Connected,
    /// No server reachable; a local loopback answers instead.
    Offline,
    /// Connection lost or intentionally closed.
    Disconnected,
}

/// Observable connection state backed by a [`watch`] channel.
pub struct ConnectionStateWatch {
    tx: watch::Sender<ConnectionState>,
    rx: watch::Receiver<ConnectionState>,
}

impl Default for ConnectionStateWatch {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionStateWatch {
    /// Create a new watch initialized to [`ConnectionState::Disconnected`].
    pub fn new() -> Self {
        let (tx, rx) = watch::channel(ConnectionState::Disconnected);
        Self { tx, rx }
    }

    /// Set the current connection state, notifying all subscribers.
    pub fn set(&self, state: ConnectionState) {
        let _ = self.tx.send(state);
    }

    /// Return a new subscriber receiver.
    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.rx.clone()
    }

    /// Return the current state without blocking.
    pub fn current(&self) -> ConnectionState {
        *self.rx.borrow()
    }
}

// ---------------------------------------------------------------------------
// Transport trait
// ---------------------------------------------------------------------------

/// The seam between the session and the network.
///
/// Outbound reliable bytes are complete client records; outbound unreliable
/// bytes are complete datagrams. Inbound traffic is collected with
/// [`Transport::drain`] once per tick.
pub trait Transport {
    /// Start connecting. Completion is reported by a
    /// [`ServerEvent::Connected`] in the inbox.
    fn connect(&mut self);

    /// Close everything and forget the previous connection so no
    /// reconnect is attempted.
    fn disconnect(&mut self);

    /// Current lifecycle state.
    fn state(&self) -> ConnectionState;

    /// Whether a real server connection was established since the last
    /// explicit disconnect.
    fn was_connected(&self) -> bool;

    /// Queue a record on the reliable stream.
    ///
    /// Returns `false` when the stream is known to be down.
    fn send_reliable(&mut self, bytes: &[u8]) -> bool;

    /// Best-effort datagram send. Always returns `true`.
    fn send_unreliable(&mut self, datagram: &[u8]) -> bool;

    /// Begin the datagram handshake for `user_id`.
    fn start_datagrams(&mut self, user_id: UserId);

    /// Move pending inbound events into `out`, oldest first.
    fn drain(&mut self, out: &mut Vec<ServerEvent>);

    /// Whether the session can operate (online or offline).
    fn is_connected(&self) -> bool {
        matches!(
            self.state(),
            ConnectionState::Connected | ConnectionState::Offline
        )
    }

    /// Whether the loopback is answering instead of a server.
    fn is_offline(&self) -> bool {
        self.state() == ConnectionState::Offline
    }
}

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Settings for a [`NetClient`].
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Server host name or address.
    pub host: String,
    /// Server port, shared by the stream and datagram channels.
    pub port: u16,
    /// Give up on a connection attempt after this long. Default: 5s.
    pub connect_timeout: Duration,
    /// Datagram hello resend interval. Default: 100ms.
    pub hello_interval: Duration,
    /// Inbox capacity. Default: 1000.
    pub inbox_capacity: usize,
    /// Socket options.
    pub socket: SocketConfig,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 5000,
            connect_timeout: Duration::from_secs(5),
            hello_interval: Duration::from_millis(100),
            inbox_capacity: DEFAULT_INBOX_CAPACITY,
            socket: SocketConfig::default(),
        }
    }
}

/// Errors raised while setting up a [`NetClient`].
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// The background runtime could not be started.
    #[error("failed to start network runtime: {0}")]
    Runtime(#[source] std::io::Error),
}

// ---------------------------------------------------------------------------
// NetClient
// ---------------------------------------------------------------------------

struct Shared {
    state: ConnectionStateWatch,
    was_connected: AtomicBool,
    udp_ready: Arc<AtomicBool>,
    remote: watch::Sender<Option<SocketAddr>>,
    udp: watch::Sender<Option<Arc<UdpSocket>>>,
}

/// TCP + UDP transport with offline fallback.
pub struct NetClient {
    config: TransportConfig,
    runtime: Option<Runtime>,
    shared: Arc<Shared>,
    inbox: Inbox,
    inbox_tx: InboxSender,
    outbound: Option<mpsc::UnboundedSender<Vec<u8>>>,
    shutdown_tx: Option<watch::Sender<bool>>,
    udp_shutdown_tx: Option<watch::Sender<bool>>,
    loopback: Loopback,
    loopback_out: Writer,
    loopback_decoder: RecordDecoder<ServerEvent>,
}

impl NetClient {
    /// Create an idle client. Nothing is sent until [`Transport::connect`].
    pub fn new(config: TransportConfig) -> Result<Self, TransportError> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .thread_name("roomlink-net")
            .enable_all()
            .build()
            .map_err(TransportError::Runtime)?;
        let (inbox_tx, inbox) = Inbox::new(config.inbox_capacity);
        let shared = Arc::new(Shared {
            state: ConnectionStateWatch::new(),
            was_connected: AtomicBool::new(false),
            udp_ready: Arc::new(AtomicBool::new(false)),
            remote: watch::channel(None).0,
            udp: watch::channel(None).0,
        });
        Ok(Self {
            config,
            runtime: Some(runtime),
            shared,
            inbox,
            inbox_tx,
            outbound: None,
            shutdown_tx: None,
            udp_shutdown_tx: None,
            loopback: Loopback::new(),
            loopback_out: Writer::new(),
            loopback_decoder: RecordDecoder::new(),
        })
    }

    /// Settings this client was created with.
    pub fn config(&self) -> &TransportConfig {
        &self.config
    }

    /// Subscribe to connection state changes.
    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state.subscribe()
    }

    /// Whether the datagram handshake has completed.
    pub fn datagrams_ready(&self) -> bool {
        self.shared.udp_ready.load(Ordering::Acquire)
    }

    /// Events dropped because the inbox was full.
    pub fn dropped_events(&self) -> u64 {
        self.inbox.dropped()
    }

    fn spawn<F>(&self, fut: F)
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        if let Some(rt) = &self.runtime {
            rt.spawn(fut);
        }
    }

    fn stop_tasks(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(true);
        }
        self.stop_datagrams();
        self.outbound = None;
        self.shared.remote.send_replace(None);
    }

    fn stop_datagrams(&mut self) {
        if let Some(tx) = self.udp_shutdown_tx.take() {
            let _ = tx.send(true);
        }
        self.shared.udp_ready.store(false, Ordering::Release);
        self.shared.udp.send_replace(None);
    }

    fn feed_loopback(&mut self, bytes: &[u8]) {
        self.loopback_out.reset();
        if let Err(e) = self.loopback.handle_bytes(bytes, &mut self.loopback_out) {
            tracing::warn!("Offline loopback rejected outbound record: {e}");
        }
        self.loopback_decoder.push(self.loopback_out.as_slice());
        loop {
            match self.loopback_decoder.next_record() {
                Ok(Some(event)) => {
                    self.inbox_tx.push(event);
                }
                Ok(None) => break,
                Err(e) => {
                    tracing::warn!("Offline loopback produced a bad record: {e}");
                    break;
                }
            }
        }
    }
}

impl Transport for NetClient {
    fn connect(&mut self) {
        match self.shared.state.current() {
            ConnectionState::Connecting | ConnectionState::Connected => return,
            ConnectionState::Offline | ConnectionState::Disconnected => {}
        }
        self.stop_tasks();
        self.loopback = Loopback::new();
        self.shared.state.set(ConnectionState::Connecting);
        tracing::info!(
            "Connecting to {}:{}",
            self.config.host,
            self.config.port
        );

        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        self.outbound = Some(out_tx);
        self.shutdown_tx = Some(shutdown_tx);

        self.spawn(connection_task(
            self.config.clone(),
            Arc::clone(&self.shared),
            self.inbox_tx.clone(),
            out_rx,
            shutdown_rx,
        ));
    }

    fn disconnect(&mut self) {
        tracing::info!("Disconnecting from server");
        self.stop_tasks();
        self.loopback = Loopback::new();
        self.shared.was_connected.store(false, Ordering::Release);
        self.shared.state.set(ConnectionState::Disconnected);
    }

    fn state(&self) -> ConnectionState {
        self.shared.state.current()
    }

    fn was_connected(&self) -> bool {
        self.shared.was_connected.load(Ordering::Acquire)
    }

    fn send_reliable(&mut self, bytes: &[u8]) -> bool {
        match self.shared.state.current() {
            ConnectionState::Offline => {
                self.feed_loopback(bytes);
                true
            }
            ConnectionState::Connected => match &self.outbound {
                Some(tx) if tx.send(bytes.to_vec()).is_ok() => true,
                _ => {
                    tracing::error!("Reliable send failed, connection is gone");
                    self.shared.state.set(ConnectionState::Disconnected);
                    false
                }
            },
            state => {
                tracing::error!("Tried to send a reliable message while {state:?}");
                false
            }
        }
    }

    fn send_unreliable(&mut self, datagram: &[u8]) -> bool {
        if self.shared.state.current() != ConnectionState::Connected
            || !self.shared.udp_ready.load(Ordering::Acquire)
        {
            return true;
        }
        if let Some(socket) = self.shared.udp.borrow().as_ref() {
            if let Err(e) = socket.try_send(datagram) {
                tracing::trace!("Datagram dropped: {e}");
            }
        }
        true
    }

    fn start_datagrams(&mut self, user_id: UserId) {
        if self.shared.state.current() != ConnectionState::Connected {
            tracing::debug!("Skipping datagram channel, stream is not connected");
            return;
        }
        let Some(remote) = *self.shared.remote.borrow() else {
            return;
        };
        self.stop_datagrams();

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        self.udp_shutdown_tx = Some(shutdown_tx);
        let shared = Arc::clone(&self.shared);
        let inbox = self.inbox_tx.clone();
        let socket_config = self.config.socket.clone();
        let hello_interval = self.config.hello_interval;

        self.spawn(async move {
            let socket = match create_datagram_socket(remote, &socket_config).await {
                Ok(s) => Arc::new(s),
                Err(e) => {
                    tracing::warn!("Could not open datagram socket to {remote}: {e}");
                    return;
                }
            };
            shared.udp.send_replace(Some(Arc::clone(&socket)));
            run_datagram_channel(
                Arc::clone(&socket),
                user_id,
                hello_interval,
                inbox,
                Arc::clone(&shared.udp_ready),
                shutdown_rx,
            )
            .await;
            shared.udp.send_if_modified(|current| {
                let ours = current.as_ref().is_some_and(|s| Arc::ptr_eq(s, &socket));
                if ours {
                    *current = None;
                }
                ours
            });
        });
    }

    fn drain(&mut self, out: &mut Vec<ServerEvent>) {
        self.inbox.drain_into(out);
    }
}

impl Drop for NetClient {
    fn drop(&mut self) {
        self.stop_tasks();
        if let Some(rt) = self.runtime.take() {
            rt.shutdown_background();
        }
    }
}

/// Connect, then pump the stream in both directions until it fails or
/// `shutdown` fires.
async fn connection_task(
    config: TransportConfig,
    shared: Arc<Shared>,
    inbox: InboxSender,
    mut outbound: mpsc::UnboundedReceiver<Vec<u8>>,
    mut shutdown: watch::Receiver<bool>,
) {
    let attempt = async {
        let addr = resolve(&config.host, config.port).await?;
        let stream = tokio::time::timeout(config.connect_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| {
                std::io::Error::new(std::io::ErrorKind::TimedOut, "connect timed out")
            })??;
        configure_stream(&stream, &config.socket)?;
        Ok::<_, std::io::Error>((addr, stream))
    };

    let (addr, stream) = tokio::select! {
        result = attempt => match result {
            Ok(connected) => connected,
            Err(e) => {
                tracing::error!("Connection to {}:{} failed: {e}", config.host, config.port);
                tracing::error!("Switching to offline mode");
                shared.state.set(ConnectionState::Offline);
                inbox.push(ServerEvent::Connected);
                return;
            }
        },
        _ = shutdown.changed() => return,
    };

    tracing::info!("Connected to {addr}");
    shared.remote.send_replace(Some(addr));
    shared.was_connected.store(true, Ordering::Release);
    shared.state.set(ConnectionState::Connected);
    inbox.push(ServerEvent::Connected);

    let (mut reader, mut writer) = stream.into_split();
    let read = read_records::<ServerEvent, _, _>(&mut reader, |event| {
        tracing::trace!("Received {}", event.kind());
        inbox.push(event);
    });
    let write = async {
        while let Some(bytes) = outbound.recv().await {
            writer.write_all(&bytes).await?;
        }
        Ok::<(), std::io::Error>(())
    };

    tokio::select! {
        result = read => match result {
            Err(FrameError::ConnectionClosed) => tracing::info!("Server closed the connection"),
            Err(e) => tracing::warn!("Stream read failed: {e}"),
            Ok(()) => {}
        },
        result = write => {
            if let Err(e) = result {
                tracing::warn!("Stream write failed: {e}");
            }
        }
        _ = shutdown.changed() => return,
    }

    shared.state.set(ConnectionState::Disconnected);
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
