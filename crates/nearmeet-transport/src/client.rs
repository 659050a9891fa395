//! Outbound connection to a NearMeet server.
//!
//! ## Lifecycle
//!
//! `Disconnected -> Connecting -> Connected -> Disconnected`, plus
//! `Reconnecting` after a transport failure when
//! [`ReconnectPolicy::auto_reconnect`] is set.
//!
//! [`Client::connect`] opens the socket, sends the handshake frame and
//! waits for ACK(0), all within [`ClientConfig::connect_timeout`]. A
//! receive task then delivers every inbound frame to the registered
//! handlers as a [`Payload`].
//!
//! Every connect, disconnect and transport failure bumps a session
//! generation. Tasks belonging to an older generation never touch the
//! state of a newer one.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use nearmeet_crypto::keys::SymmetricKey;
use nearmeet_types::{
    ConnectionState, Message, DEFAULT_TIMEOUT_SECS, RECONNECT_ATTEMPTS, RECONNECT_INTERVAL_SECS,
};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use serde_json::Value;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};

use crate::dispatch::invoke_guarded;
use crate::framing::{self, FrameReader, FrameSender};
use crate::messages::{Control, Payload, HANDSHAKE_MESSAGE_ID};
use crate::wire;
use crate::{HandlerId, Result, TransportError};

/// When and how often to re-establish a lost connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ReconnectPolicy {
    /// Off by default: failures are reported and the caller decides.
    pub auto_reconnect: bool,
    pub max_attempts: u32,
    pub interval: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            auto_reconnect: false,
            max_attempts: RECONNECT_ATTEMPTS,
            interval: Duration::from_secs(RECONNECT_INTERVAL_SECS),
        }
    }
}

/// Client tuning.
#[derive(Clone, Debug)]
pub struct ClientConfig {
    /// Bound on socket connect plus handshake.
    pub connect_timeout: Duration,
    /// Read timeout in the receive loop. Expiry is not an error.
    pub read_timeout: Duration,
    pub reconnect: ReconnectPolicy,
    /// Send a HEARTBEAT this often while connected.
    pub heartbeat_interval: Option<Duration>,
    /// Session key for frames after the handshake.
    pub key: Option<SymmetricKey>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
            read_timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
            reconnect: ReconnectPolicy::default(),
            heartbeat_interval: None,
            key: None,
        }
    }
}

/// Callback invoked with every inbound payload.
pub type MessageHandler = Arc<dyn Fn(&Payload) -> anyhow::Result<()> + Send + Sync>;

struct Session {
    tx: FrameSender,
    /// Dropping or signalling this stops the receive and heartbeat tasks.
    shutdown: watch::Sender<bool>,
    remote: SocketAddr,
}

/// A freshly handshaken socket, not yet wired to tasks.
struct Link {
    reader: FrameReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
    remote: SocketAddr,
    ack: Value,
}

struct Shared {
    config: ClientConfig,
    handlers: RwLock<Vec<(HandlerId, MessageHandler)>>,
    next_handler_id: AtomicU64,
    next_message_id: AtomicU32,
    state: watch::Sender<ConnectionState>,
    session: Mutex<Option<Session>>,
    generation: AtomicU64,
    target: Mutex<Option<(String, u16)>>,
}

/// A single outbound peer connection.
///
/// Cheap to clone; clones share the connection. Call
/// [`Client::disconnect`] before dropping the last clone, since the
/// receive task keeps the connection alive on its own.
#[derive(Clone)]
pub struct Client {
    shared: Arc<Shared>,
}

impl Client {
    pub fn new(config: ClientConfig) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            shared: Arc::new(Shared {
                config,
                handlers: RwLock::new(Vec::new()),
                next_handler_id: AtomicU64::new(1),
                next_message_id: AtomicU32::new(1),
                state,
                session: Mutex::new(None),
                generation: AtomicU64::new(0),
                target: Mutex::new(None),
            }),
        }
    }

    /// Connect to `host:port` and complete the handshake.
    ///
    /// Any existing connection is closed first. On failure the client is
    /// left `Disconnected` and no retry is attempted; the reconnect policy
    /// only applies to connections lost after they were established.
    pub async fn connect(&self, host: &str, port: u16) -> Result<()> {
        let generation = {
            let mut session = self.shared.session.lock();
            let generation = self.shared.generation.fetch_add(1, Ordering::SeqCst) + 1;
            if let Some(old) = session.take() {
                let _ = old.shutdown.send(true);
            }
            *self.shared.target.lock() = Some((host.to_string(), port));
            self.shared.state.send_replace(ConnectionState::Connecting);
            generation
        };

        match establish(&self.shared.config, host, port).await {
            Ok(link) => {
                if install(&self.shared, link, generation) {
                    Ok(())
                } else {
                    Err(TransportError::Connection(
                        "connect superseded by another connect or disconnect".to_string(),
                    ))
                }
            }
            Err(e) => {
                tracing::warn!(host, port, "connect failed: {e}");
                let session = self.shared.session.lock();
                if self.shared.generation.load(Ordering::SeqCst) == generation {
                    *self.shared.target.lock() = None;
                    self.shared.state.send_replace(ConnectionState::Disconnected);
                }
                drop(session);
                Err(e)
            }
        }
    }

    /// Close the connection and cancel any pending reconnect. Idempotent.
    pub fn disconnect(&self) {
        let old = {
            let mut session = self.shared.session.lock();
            self.shared.generation.fetch_add(1, Ordering::SeqCst);
            *self.shared.target.lock() = None;
            self.shared.state.send_replace(ConnectionState::Disconnected);
            session.take()
        };
        if let Some(old) = old {
            let _ = old.shutdown.send(true);
            tracing::info!(remote = %old.remote, "disconnected");
        }
    }

    pub fn is_connected(&self) -> bool {
        self.state().is_connected()
    }

    pub fn state(&self) -> ConnectionState {
        *self.shared.state.borrow()
    }

    /// Observe state transitions.
    pub fn state_changes(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state.subscribe()
    }

    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.shared.session.lock().as_ref().map(|s| s.remote)
    }

    /// Register a handler for inbound payloads.
    pub fn add_handler<F>(&self, handler: F) -> HandlerId
    where
        F: Fn(&Payload) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let id = HandlerId(self.shared.next_handler_id.fetch_add(1, Ordering::Relaxed));
        self.shared.handlers.write().push((id, Arc::new(handler)));
        id
    }

    pub fn remove_handler(&self, id: HandlerId) -> bool {
        let mut handlers = self.shared.handlers.write();
        let before = handlers.len();
        handlers.retain(|(existing, _)| *existing != id);
        handlers.len() != before
    }

    /// Serialize, seal and queue `message`. Returns the frame id the
    /// server will ACK.
    pub fn send<T>(&self, message: &T) -> Result<u32>
    where
        T: Serialize + ?Sized,
    {
        self.shared.send(message)
    }

    pub fn send_json(&self, message: &Value) -> Result<u32> {
        self.send(message)
    }

    pub fn send_message(&self, message: &Message) -> Result<u32> {
        self.send(message)
    }
}

impl Shared {
    /// Frame ids start at 1; 0 belongs to the handshake.
    fn next_id(&self) -> u32 {
        match self.next_message_id.fetch_add(1, Ordering::Relaxed) {
            HANDSHAKE_MESSAGE_ID => self.next_message_id.fetch_add(1, Ordering::Relaxed),
            id => id,
        }
    }

    fn send<T>(&self, message: &T) -> Result<u32>
    where
        T: Serialize + ?Sized,
    {
        let tx = self
            .session
            .lock()
            .as_ref()
            .map(|session| session.tx.clone())
            .ok_or(TransportError::NotConnected)?;

        let message_id = self.next_id();
        let payload = framing::seal(self.config.key.as_ref(), serde_json::to_vec(message)?)?;
        let frame = wire::encode(&payload, message_id)?;
        tx.send(frame).map_err(|_| TransportError::NotConnected)?;
        Ok(message_id)
    }

    fn run_handlers(&self, payload: &Payload) {
        let handlers: Vec<MessageHandler> = self
            .handlers
            .read()
            .iter()
            .map(|(_, handler)| Arc::clone(handler))
            .collect();
        for handler in handlers {
            invoke_guarded("client", || handler(payload));
        }
    }

    /// Set `state` unless a newer session generation has taken over.
    fn set_state_if_current(&self, generation: u64, state: ConnectionState) -> bool {
        let _session = self.session.lock();
        if self.generation.load(Ordering::SeqCst) != generation {
            return false;
        }
        self.state.send_replace(state);
        true
    }
}

/// Open a socket, send the handshake and wait for ACK(0).
async fn establish(config: &ClientConfig, host: &str, port: u16) -> Result<Link> {
    let handshake = async {
        let stream = TcpStream::connect((host, port))
            .await
            .map_err(|e| TransportError::Connection(format!("{host}:{port}: {e}")))?;
        if let Err(e) = stream.set_nodelay(true) {
            tracing::debug!("set_nodelay failed: {e}");
        }
        let remote = stream.peer_addr()?;
        let (read_half, mut writer) = stream.into_split();

        let body = Control::handshake().to_bytes()?;
        framing::write_frame(&mut writer, &body, HANDSHAKE_MESSAGE_ID).await?;

        let mut reader = FrameReader::new(read_half);
        let frame = reader.read_frame().await?.ok_or_else(|| {
            TransportError::Handshake("server closed the connection".to_string())
        })?;
        let (message_id, payload) = wire::decode(&frame)?;
        let ack: Value = serde_json::from_slice(payload)
            .map_err(|e| TransportError::Handshake(format!("malformed ACK: {e}")))?;
        let acked = message_id == HANDSHAKE_MESSAGE_ID
            && Control::from_value(&ack).is_some_and(|c| c.is_ack_for(HANDSHAKE_MESSAGE_ID));
        if !acked {
            return Err(TransportError::Handshake(
                "first frame from server was not ACK(0)".to_string(),
            ));
        }

        Ok::<_, TransportError>(Link {
            reader,
            writer,
            remote,
            ack,
        })
    };

    tokio::time::timeout(config.connect_timeout, handshake)
        .await
        .map_err(|_| TransportError::Timeout(format!("connecting to {host}:{port}")))?
}

/// Wire a handshaken link to its writer, receive and heartbeat tasks.
///
/// Returns `false`, dropping the link, if `generation` is stale.
fn install(shared: &Arc<Shared>, link: Link, generation: u64) -> bool {
    let Link {
        reader,
        writer,
        remote,
        ack,
    } = link;
    {
        let mut session = shared.session.lock();
        if shared.generation.load(Ordering::SeqCst) != generation {
            return false;
        }

        let (tx, rx) = mpsc::unbounded_channel();
        framing::spawn_writer(writer, rx);
        let (shutdown, shutdown_rx) = watch::channel(false);
        tokio::spawn(receive_loop(
            Arc::clone(shared),
            reader,
            Payload::Json(ack),
            generation,
            shutdown_rx.clone(),
        ));
        if let Some(interval) = shared.config.heartbeat_interval {
            tokio::spawn(heartbeat_loop(Arc::clone(shared), interval, shutdown_rx));
        }

        *session = Some(Session {
            tx,
            shutdown,
            remote,
        });
        shared.state.send_replace(ConnectionState::Connected);
    }

    tracing::info!(%remote, "connected");
    true
}

/// Deliver the handshake ACK, then every inbound frame, to the handlers.
async fn receive_loop(
    shared: Arc<Shared>,
    mut reader: FrameReader<OwnedReadHalf>,
    handshake_ack: Payload,
    generation: u64,
    mut shutdown: watch::Receiver<bool>,
) {
    shared.run_handlers(&handshake_ack);
    let reason = loop {
        let frame = tokio::select! {
            _ = shutdown.changed() => return,
            read = tokio::time::timeout(shared.config.read_timeout, reader.read_frame()) => match read {
                Err(_elapsed) => continue,
                Ok(Ok(Some(frame))) => frame,
                Ok(Ok(None)) => break "server closed the connection".to_string(),
                Ok(Err(e)) => break e.to_string(),
            },
        };

        let (message_id, payload) = match wire::decode(&frame) {
            Ok(decoded) => decoded,
            Err(e) => {
                tracing::warn!("bad frame: {e}");
                continue;
            }
        };
        let plaintext = match framing::open(shared.config.key.as_ref(), payload) {
            Ok(plaintext) => plaintext,
            Err(e) => {
                tracing::warn!(message_id, "discarding frame: {e}");
                continue;
            }
        };

        tracing::debug!(message_id, "frame received");
        shared.run_handlers(&Payload::parse(&plaintext));
    };

    connection_lost(shared, generation, &reason);
}

async fn heartbeat_loop(
    shared: Arc<Shared>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = ticker.tick() => {
                if let Err(e) = shared.send(&Control::heartbeat()) {
                    tracing::debug!("heartbeat stopped: {e}");
                    break;
                }
            }
        }
    }
}

/// Tear down the session after a transport failure and either give up
/// or start reconnecting, per policy.
fn connection_lost(shared: Arc<Shared>, generation: u64, reason: &str) {
    let target = {
        let mut session = shared.session.lock();
        if shared.generation.load(Ordering::SeqCst) != generation {
            return;
        }
        session.take();
        shared.target.lock().clone()
    };
    tracing::warn!(reason, "connection lost");

    let policy = shared.config.reconnect;
    match target {
        Some((host, port)) if policy.auto_reconnect && policy.max_attempts > 0 => {
            if shared.set_state_if_current(generation, ConnectionState::Reconnecting) {
                tokio::spawn(reconnect_loop(shared, host, port, generation));
            }
        }
        _ => {
            shared.set_state_if_current(generation, ConnectionState::Disconnected);
        }
    }
}

async fn reconnect_loop(shared: Arc<Shared>, host: String, port: u16, generation: u64) {
    let policy = shared.config.reconnect;
    for attempt in 1..=policy.max_attempts {
        tokio::time::sleep(policy.interval).await;
        if shared.generation.load(Ordering::SeqCst) != generation {
            return;
        }

        tracing::info!(attempt, max = policy.max_attempts, %host, port, "reconnecting");
        match establish(&shared.config, &host, port).await {
            Ok(link) => {
                install(&shared, link, generation);
                return;
            }
            Err(e) => tracing::warn!(attempt, "reconnect failed: {e}"),
        }
    }

    if shared.set_state_if_current(generation, ConnectionState::Disconnected) {
        tracing::error!(attempts = policy.max_attempts, "giving up on reconnect");
    }
}
