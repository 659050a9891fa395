//! TCP connection server for NearMeet peers.
//!
//! ## Lifecycle
//!
//! `Stopped -> Starting -> Listening -> Stopped`
//!
//! 1. [`Server::start`] binds the listener and spawns the accept loop.
//! 2. Every accepted socket gets its own task. The task waits for the
//!    handshake frame, which must carry well-formed JSON, then queues
//!    ACK(0) and registers the peer.
//! 3. Each later frame is decoded, opened with the session key if one is
//!    configured, handed to every server handler, and ACKed with its own id.
//! 4. EOF, a read error, or too many consecutive bad frames end the task
//!    and remove the peer from the registry.
//!
//! Writes go through a per-peer writer task, so [`Server::broadcast`] and
//! [`Server::send_to`] never touch a socket while the registry lock is
//! held, and may be called from handlers.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use nearmeet_crypto::keys::SymmetricKey;
use nearmeet_types::{ServerState, DEFAULT_TIMEOUT_SECS, MAX_CLIENTS};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use serde_json::Value;
use tokio::io::AsyncRead;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::dispatch::invoke_guarded;
use crate::framing::{self, FrameReader, FrameSender};
use crate::messages::{Control, Payload, HANDSHAKE_MESSAGE_ID};
use crate::wire;
use crate::{HandlerId, Result, TransportError};

/// Consecutive undecodable frames tolerated before a peer is dropped.
pub const DEFAULT_MAX_FRAME_ERRORS: u32 = 3;

/// Pause after a failed `accept` so a persistent error cannot spin.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Server tuning.
#[derive(Clone, Debug)]
pub struct ServerConfig {
    /// Connections beyond this many registered peers are closed on accept.
    pub max_clients: usize,
    /// Read timeout. Expiry is not an error; the loop re-checks shutdown.
    pub io_timeout: Duration,
    /// Consecutive framing errors after which a connection is dropped.
    pub max_frame_errors: u32,
    /// Session key for frames after the handshake.
    pub key: Option<SymmetricKey>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            max_clients: MAX_CLIENTS,
            io_timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
            max_frame_errors: DEFAULT_MAX_FRAME_ERRORS,
            key: None,
        }
    }
}

/// Callback invoked with `(peer_address, message)` for every JSON frame.
pub type ServerHandler = Arc<dyn Fn(SocketAddr, &Value) -> anyhow::Result<()> + Send + Sync>;

/// Registry entry for one connected peer.
struct PeerHandle {
    tx: FrameSender,
    connected_at: Instant,
    last_activity: Instant,
}

/// Point-in-time view of a registered peer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PeerInfo {
    pub addr: SocketAddr,
    pub connected_for: Duration,
    pub idle_for: Duration,
}

struct Shared {
    config: ServerConfig,
    registry: Mutex<HashMap<SocketAddr, PeerHandle>>,
    handlers: RwLock<Vec<(HandlerId, ServerHandler)>>,
    next_handler_id: AtomicU64,
    next_message_id: AtomicU32,
    state: watch::Sender<ServerState>,
    shutdown: watch::Sender<bool>,
    listener: Mutex<Option<(SocketAddr, JoinHandle<()>)>>,
}

/// Accepts peers, tracks them, and relays messages between them.
///
/// Cheap to clone; clones share the same listener and registry.
#[derive(Clone)]
pub struct Server {
    shared: Arc<Shared>,
}

impl Server {
    pub fn new(config: ServerConfig) -> Self {
        let (state, _) = watch::channel(ServerState::Stopped);
        let (shutdown, _) = watch::channel(false);
        Self {
            shared: Arc::new(Shared {
                config,
                registry: Mutex::new(HashMap::new()),
                handlers: RwLock::new(Vec::new()),
                next_handler_id: AtomicU64::new(1),
                next_message_id: AtomicU32::new(1),
                state,
                shutdown,
                listener: Mutex::new(None),
            }),
        }
    }

    /// Bind `host:port` and start accepting peers.
    ///
    /// Port 0 binds an ephemeral port; the bound address is returned.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::AlreadyRunning`] unless the server is
    /// stopped, and [`TransportError::Bind`] if the address cannot be
    /// bound. Bind failures are not retried.
    pub async fn start(&self, host: &str, port: u16) -> Result<SocketAddr> {
        let claimed = self.shared.state.send_if_modified(|state| {
            if *state == ServerState::Stopped {
                *state = ServerState::Starting;
                true
            } else {
                false
            }
        });
        if !claimed {
            return Err(TransportError::AlreadyRunning);
        }

        let addr = format!("{host}:{port}");
        let bound = match TcpListener::bind(&addr).await {
            Ok(listener) => listener.local_addr().map(|local| (listener, local)),
            Err(e) => Err(e),
        };
        let (listener, local_addr) = match bound {
            Ok(bound) => bound,
            Err(source) => {
                self.shared.state.send_replace(ServerState::Stopped);
                return Err(TransportError::Bind { addr, source });
            }
        };

        self.shared.shutdown.send_replace(false);
        let shutdown = self.shared.shutdown.subscribe();
        let task = tokio::spawn(accept_loop(Arc::clone(&self.shared), listener, shutdown));
        *self.shared.listener.lock() = Some((local_addr, task));
        self.shared.state.send_replace(ServerState::Listening);

        tracing::info!(%local_addr, "server listening");
        Ok(local_addr)
    }

    /// Stop accepting, force-close every peer, and release the listener.
    ///
    /// Safe to call repeatedly and while workers are mid-read.
    pub async fn stop(&self) {
        let Some((local_addr, task)) = self.shared.listener.lock().take() else {
            return;
        };

        self.shared.shutdown.send_replace(true);
        let dropped = {
            let mut registry = self.shared.registry.lock();
            let count = registry.len();
            registry.clear();
            count
        };
        if let Err(e) = task.await {
            tracing::warn!("accept loop ended abnormally: {e}");
        }

        self.shared.state.send_replace(ServerState::Stopped);
        tracing::info!(%local_addr, dropped, "server stopped");
    }

    /// Send `message` to every registered peer except `exclude`.
    ///
    /// The payload is serialized and sealed once. Per-peer failures are
    /// logged and skipped. Returns the number of peers the frame was
    /// queued for.
    pub fn broadcast<T>(&self, message: &T, exclude: Option<SocketAddr>) -> Result<usize>
    where
        T: Serialize + ?Sized,
    {
        let frame = self.shared.frame_for(message, self.shared.next_id())?;
        let targets: Vec<(SocketAddr, FrameSender)> = self
            .shared
            .registry
            .lock()
            .iter()
            .filter(|(addr, _)| Some(**addr) != exclude)
            .map(|(addr, peer)| (*addr, peer.tx.clone()))
            .collect();

        let mut delivered = 0;
        for (peer, tx) in targets {
            match tx.send(frame.clone()) {
                Ok(()) => delivered += 1,
                Err(_) => tracing::warn!(%peer, "broadcast to closed connection skipped"),
            }
        }
        tracing::debug!(delivered, ?exclude, "broadcast");
        Ok(delivered)
    }

    /// Send `message` to one peer.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::NotConnected`] if `peer` is not registered
    /// or its connection is already closing.
    pub fn send_to<T>(&self, peer: SocketAddr, message: &T) -> Result<()>
    where
        T: Serialize + ?Sized,
    {
        let frame = self.shared.frame_for(message, self.shared.next_id())?;
        let tx = self
            .shared
            .registry
            .lock()
            .get(&peer)
            .map(|handle| handle.tx.clone())
            .ok_or(TransportError::NotConnected)?;
        tx.send(frame).map_err(|_| TransportError::NotConnected)
    }

    /// Register a handler for inbound JSON messages.
    pub fn add_handler<F>(&self, handler: F) -> HandlerId
    where
        F: Fn(SocketAddr, &Value) -> anyhow::Result<()> + Send + Sync + 'static,
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

    pub fn client_count(&self) -> usize {
        self.shared.registry.lock().len()
    }

    pub fn is_connected(&self, peer: SocketAddr) -> bool {
        self.shared.registry.lock().contains_key(&peer)
    }

    pub fn connected_peers(&self) -> Vec<PeerInfo> {
        let now = Instant::now();
        let mut peers: Vec<PeerInfo> = self
            .shared
            .registry
            .lock()
            .iter()
            .map(|(addr, handle)| PeerInfo {
                addr: *addr,
                connected_for: now.saturating_duration_since(handle.connected_at),
                idle_for: now.saturating_duration_since(handle.last_activity),
            })
            .collect();
        peers.sort_by_key(|peer| peer.addr);
        peers
    }

    /// Address the listener is bound to, while running.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.shared.listener.lock().as_ref().map(|(addr, _)| *addr)
    }

    pub fn state(&self) -> ServerState {
        *self.shared.state.borrow()
    }

    pub fn is_running(&self) -> bool {
        self.state() == ServerState::Listening
    }

    /// Observe state transitions.
    pub fn state_changes(&self) -> watch::Receiver<ServerState> {
        self.shared.state.subscribe()
    }
}

impl Shared {
    fn next_id(&self) -> u32 {
        self.next_message_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Serialize, seal and frame an outbound message.
    fn frame_for<T>(&self, message: &T, message_id: u32) -> Result<Vec<u8>>
    where
        T: Serialize + ?Sized,
    {
        let payload = framing::seal(self.config.key.as_ref(), serde_json::to_vec(message)?)?;
        Ok(wire::encode(&payload, message_id)?)
    }

    fn touch(&self, peer: SocketAddr) {
        if let Some(handle) = self.registry.lock().get_mut(&peer) {
            handle.last_activity = Instant::now();
        }
    }

    fn run_handlers(&self, peer: SocketAddr, message: &Value) {
        let handlers: Vec<ServerHandler> = self
            .handlers
            .read()
            .iter()
            .map(|(_, handler)| Arc::clone(handler))
            .collect();
        for handler in handlers {
            invoke_guarded("server", || handler(peer, message));
        }
    }
}

async fn accept_loop(
    shared: Arc<Shared>,
    listener: TcpListener,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    if shared.registry.lock().len() >= shared.config.max_clients {
                        tracing::warn!(%peer, max = shared.config.max_clients, "client limit reached, refusing");
                        continue;
                    }
                    if let Err(e) = stream.set_nodelay(true) {
                        tracing::debug!(%peer, "set_nodelay failed: {e}");
                    }
                    tokio::spawn(handle_connection(
                        Arc::clone(&shared),
                        stream,
                        peer,
                        shutdown.clone(),
                    ));
                }
                Err(e) => {
                    tracing::warn!("accept failed: {e}");
                    tokio::time::sleep(ACCEPT_BACKOFF).await;
                }
            },
        }
    }
    tracing::debug!("accept loop exited");
}

async fn handle_connection(
    shared: Arc<Shared>,
    stream: TcpStream,
    peer: SocketAddr,
    mut shutdown: watch::Receiver<bool>,
) {
    tracing::info!(%peer, "connection accepted");
    let (read_half, write_half) = stream.into_split();
    let mut reader = FrameReader::new(read_half);

    let handshake = tokio::select! {
        _ = shutdown.changed() => {
            tracing::debug!(%peer, "server stopping, abandoning handshake");
            return;
        }
        result = accept_handshake(&shared, &mut reader) => result,
    };
    if let Err(e) = handshake {
        tracing::warn!(%peer, "handshake failed: {e}");
        return;
    }

    let ack = match Control::ack(HANDSHAKE_MESSAGE_ID)
        .to_bytes()
        .and_then(|body| wire::encode(&body, HANDSHAKE_MESSAGE_ID).map_err(TransportError::from))
    {
        Ok(frame) => frame,
        Err(e) => {
            tracing::error!(%peer, "failed to build handshake ACK: {e}");
            return;
        }
    };

    let (tx, rx) = mpsc::unbounded_channel();
    framing::spawn_writer(write_half, rx);
    {
        // ACK(0) is queued before the peer becomes visible to broadcast.
        let mut registry = shared.registry.lock();
        if *shutdown.borrow() {
            tracing::debug!(%peer, "server stopped during handshake, closing");
            return;
        }
        if tx.send(ack).is_err() {
            return;
        }
        let now = Instant::now();
        registry.insert(
            peer,
            PeerHandle {
                tx: tx.clone(),
                connected_at: now,
                last_activity: now,
            },
        );
    }
    tracing::info!(%peer, "peer registered");

    let result = read_loop(&shared, &mut reader, peer, &tx, &mut shutdown).await;
    shared.registry.lock().remove(&peer);
    match result {
        Ok(()) => tracing::info!(%peer, "peer disconnected"),
        Err(e) => tracing::warn!(%peer, "connection dropped: {e}"),
    }
}

/// Wait for the handshake frame and require a JSON body.
async fn accept_handshake<R>(shared: &Shared, reader: &mut FrameReader<R>) -> Result<()>
where
    R: AsyncRead + Unpin,
{
    let frame = tokio::time::timeout(shared.config.io_timeout, reader.read_frame())
        .await
        .map_err(|_| TransportError::Timeout("waiting for handshake".to_string()))??
        .ok_or_else(|| TransportError::Handshake("peer closed before handshake".to_string()))?;

    let (_, payload) = wire::decode(&frame)?;
    let body: Value = serde_json::from_slice(payload)
        .map_err(|e| TransportError::Handshake(format!("malformed handshake: {e}")))?;

    match Control::from_value(&body) {
        Some(Control::Handshake {
            protocol_version, ..
        }) => tracing::debug!(protocol_version, "handshake received"),
        _ => tracing::debug!("handshake body is not a HANDSHAKE control message, accepting"),
    }
    Ok(())
}

async fn read_loop<R>(
    shared: &Shared,
    reader: &mut FrameReader<R>,
    peer: SocketAddr,
    tx: &FrameSender,
    shutdown: &mut watch::Receiver<bool>,
) -> Result<()>
where
    R: AsyncRead + Unpin,
{
    let mut frame_errors = 0u32;
    loop {
        let frame = tokio::select! {
            _ = shutdown.changed() => return Ok(()),
            read = tokio::time::timeout(shared.config.io_timeout, reader.read_frame()) => match read {
                Err(_elapsed) => continue,
                Ok(Ok(Some(frame))) => frame,
                Ok(Ok(None)) => return Ok(()),
                Ok(Err(e)) => return Err(e),
            },
        };

        let (message_id, payload) = match wire::decode(&frame) {
            Ok(decoded) => {
                frame_errors = 0;
                decoded
            }
            Err(e) => {
                frame_errors += 1;
                tracing::warn!(%peer, frame_errors, "bad frame: {e}");
                if frame_errors >= shared.config.max_frame_errors {
                    return Err(e.into());
                }
                continue;
            }
        };
        shared.touch(peer);

        let plaintext = match framing::open(shared.config.key.as_ref(), payload) {
            Ok(plaintext) => plaintext,
            Err(e) => {
                tracing::warn!(%peer, message_id, "discarding frame: {e}");
                continue;
            }
        };

        match Payload::parse(&plaintext) {
            Payload::Json(message) => {
                tracing::debug!(%peer, message_id, "message received");
                shared.run_handlers(peer, &message);
                let ack = shared.frame_for(&Control::ack(message_id), message_id)?;
                tx.send(ack)
                    .map_err(|_| TransportError::Connection("writer closed".to_string()))?;
            }
            Payload::Raw(text) => {
                tracing::warn!(%peer, message_id, len = text.len(), "non-JSON payload ignored");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nearmeet_crypto::keys::generate_key;
    use nearmeet_types::Message;
    use tokio::io::AsyncWriteExt;
    use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};

    const WAIT: Duration = Duration::from_secs(5);

    async fn start_server(config: ServerConfig) -> (Server, SocketAddr) {
        let server = Server::new(config);
        let addr = server.start("127.0.0.1", 0).await.expect("start");
        (server, addr)
    }

    /// Connect a raw socket, handshake, and consume ACK(0).
    async fn raw_peer(addr: SocketAddr) -> (FrameReader<OwnedReadHalf>, OwnedWriteHalf) {
        let stream = TcpStream::connect(addr).await.expect("connect");
        let (read_half, mut write_half) = stream.into_split();
        let body = Control::handshake().to_bytes().expect("handshake");
        framing::write_frame(&mut write_half, &body, HANDSHAKE_MESSAGE_ID)
            .await
            .expect("send handshake");
        let mut reader = FrameReader::new(read_half);
        let ack = next_json(&mut reader, None).await;
        assert!(Control::from_value(&ack).expect("control").is_ack_for(0));
        (reader, write_half)
    }

    async fn next_json(
        reader: &mut FrameReader<OwnedReadHalf>,
        key: Option<&SymmetricKey>,
    ) -> Value {
        let frame = tokio::time::timeout(WAIT, reader.read_frame())
            .await
            .expect("timely frame")
            .expect("read")
            .expect("frame");
        let (_, payload) = wire::decode(&frame).expect("decode");
        let plaintext = framing::open(key, payload).expect("open");
        serde_json::from_slice(&plaintext).expect("json")
    }

    async fn wait_for_clients(server: &Server, count: usize) {
        tokio::time::timeout(WAIT, async {
            while server.client_count() != count {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("client count");
    }

    #[tokio::test]
    async fn test_state_transitions() {
        let server = Server::new(ServerConfig::default());
        assert_eq!(server.state(), ServerState::Stopped);
        assert!(server.local_addr().is_none());

        let addr = server.start("127.0.0.1", 0).await.expect("start");
        assert_eq!(server.state(), ServerState::Listening);
        assert_eq!(server.local_addr(), Some(addr));
        assert!(matches!(
            server.start("127.0.0.1", 0).await,
            Err(TransportError::AlreadyRunning)
        ));

        server.stop().await;
        assert_eq!(server.state(), ServerState::Stopped);
        server.stop().await;
    }

    #[tokio::test]
    async fn test_bind_failure_is_reported() {
        let (first, addr) = start_server(ServerConfig::default()).await;
        let second = Server::new(ServerConfig::default());
        let err = second
            .start("127.0.0.1", addr.port())
            .await
            .expect_err("port in use");
        assert!(matches!(err, TransportError::Bind { .. }));
        assert_eq!(second.state(), ServerState::Stopped);
        first.stop().await;
    }

    #[tokio::test]
    async fn test_handshake_registers_peer() {
        let (server, addr) = start_server(ServerConfig::default()).await;
        let (_reader, _writer) = raw_peer(addr).await;
        assert_eq!(server.client_count(), 1);
        assert_eq!(server.connected_peers().len(), 1);
        server.stop().await;
    }

    #[tokio::test]
    async fn test_malformed_handshake_closes_connection() {
        let (server, addr) = start_server(ServerConfig::default()).await;
        let stream = TcpStream::connect(addr).await.expect("connect");
        let (read_half, mut write_half) = stream.into_split();
        framing::write_frame(&mut write_half, b"not json", 0)
            .await
            .expect("send");
        let mut reader = FrameReader::new(read_half);
        let read = tokio::time::timeout(WAIT, reader.read_frame())
            .await
            .expect("timely close");
        assert!(matches!(read, Ok(None) | Err(_)));
        assert_eq!(server.client_count(), 0);
        server.stop().await;
    }

    #[tokio::test]
    async fn test_messages_are_handled_and_acked_in_order() {
        let (server, addr) = start_server(ServerConfig::default()).await;
        let (seen_tx, mut seen_rx) = mpsc::unbounded_channel();
        server.add_handler(move |peer, message| {
            seen_tx.send((peer, message.clone()))?;
            Ok(())
        });

        let (mut reader, mut writer) = raw_peer(addr).await;
        for id in 1..=3u32 {
            let body = Message::text("alice", format!("msg {id}"))
                .to_json()
                .expect("json");
            framing::write_frame(&mut writer, body.as_bytes(), id)
                .await
                .expect("send");
        }

        for id in 1..=3u32 {
            let ack = next_json(&mut reader, None).await;
            assert!(Control::from_value(&ack).expect("ack").is_ack_for(id));
            let (_, message) = seen_rx.recv().await.expect("handled");
            assert_eq!(message["content"]["text"], format!("msg {id}"));
        }
        server.stop().await;
    }

    #[tokio::test]
    async fn test_failing_handler_does_not_block_others() {
        let (server, addr) = start_server(ServerConfig::default()).await;
        server.add_handler(|_, _| Err(anyhow::anyhow!("broken handler")));
        let (seen_tx, mut seen_rx) = mpsc::unbounded_channel();
        server.add_handler(move |_, message| {
            seen_tx.send(message.clone())?;
            Ok(())
        });

        let (mut reader, mut writer) = raw_peer(addr).await;
        let body = Message::text("alice", "hi").to_json().expect("json");
        framing::write_frame(&mut writer, body.as_bytes(), 1)
            .await
            .expect("send");
        assert!(Control::from_value(&next_json(&mut reader, None).await)
            .expect("ack")
            .is_ack_for(1));
        assert!(seen_rx.recv().await.is_some());
        server.stop().await;
    }

    #[tokio::test]
    async fn test_remove_handler() {
        let server = Server::new(ServerConfig::default());
        let id = server.add_handler(|_, _| Ok(()));
        assert!(server.remove_handler(id));
        assert!(!server.remove_handler(id));
    }

    #[tokio::test]
    async fn test_broadcast_excludes_sender() {
        let (server, addr) = start_server(ServerConfig::default()).await;
        let (mut r1, w1) = raw_peer(addr).await;
        let (mut r2, _w2) = raw_peer(addr).await;
        let (mut r3, _w3) = raw_peer(addr).await;
        let excluded = w1.local_addr().expect("local addr");

        let message = Message::text("server", "hello all");
        let delivered = server.broadcast(&message, Some(excluded)).expect("broadcast");
        assert_eq!(delivered, 2);

        for reader in [&mut r2, &mut r3] {
            let got = next_json(reader, None).await;
            assert_eq!(got["content"]["text"], "hello all");
        }
        let nothing = tokio::time::timeout(Duration::from_millis(100), r1.read_frame()).await;
        assert!(nothing.is_err());
        server.stop().await;
    }

    #[tokio::test]
    async fn test_send_to_unknown_peer() {
        let (server, _) = start_server(ServerConfig::default()).await;
        let nobody: SocketAddr = "127.0.0.1:9".parse().expect("addr");
        assert!(matches!(
            server.send_to(nobody, &Control::heartbeat()),
            Err(TransportError::NotConnected)
        ));
        server.stop().await;
    }

    #[tokio::test]
    async fn test_repeated_bad_frames_drop_connection() {
        let config = ServerConfig {
            max_frame_errors: 2,
            ..ServerConfig::default()
        };
        let (server, addr) = start_server(config).await;
        let (mut reader, mut writer) = raw_peer(addr).await;

        for _ in 0..2 {
            let mut frame = wire::encode(b"{}", 1).expect("encode");
            frame[..4].copy_from_slice(b"XXXX");
            writer.write_all(&frame).await.expect("send");
        }
        let read = tokio::time::timeout(WAIT, reader.read_frame())
            .await
            .expect("timely close");
        assert!(matches!(read, Ok(None) | Err(_)));
        wait_for_clients(&server, 0).await;
        server.stop().await;
    }

    #[tokio::test]
    async fn test_single_bad_frame_is_not_fatal() {
        let (server, addr) = start_server(ServerConfig::default()).await;
        let (mut reader, mut writer) = raw_peer(addr).await;

        let mut bad = wire::encode(b"{}", 1).expect("encode");
        bad[4] = 9;
        writer.write_all(&bad).await.expect("send");
        framing::write_frame(&mut writer, br#"{"type":"HEARTBEAT"}"#, 2)
            .await
            .expect("send");

        let ack = next_json(&mut reader, None).await;
        assert!(Control::from_value(&ack).expect("ack").is_ack_for(2));
        assert_eq!(server.client_count(), 1);
        server.stop().await;
    }

    #[tokio::test]
    async fn test_client_limit() {
        let config = ServerConfig {
            max_clients: 1,
            ..ServerConfig::default()
        };
        let (server, addr) = start_server(config).await;
        let (_r1, _w1) = raw_peer(addr).await;

        let stream = TcpStream::connect(addr).await.expect("connect");
        let (read_half, _write_half) = stream.into_split();
        let mut reader = FrameReader::new(read_half);
        let read = tokio::time::timeout(WAIT, reader.read_frame())
            .await
            .expect("timely close");
        assert!(matches!(read, Ok(None) | Err(_)));
        assert_eq!(server.client_count(), 1);
        server.stop().await;
    }

    #[tokio::test]
    async fn test_stop_closes_peers() {
        let (server, addr) = start_server(ServerConfig::default()).await;
        let (mut reader, _writer) = raw_peer(addr).await;
        server.stop().await;

        assert_eq!(server.client_count(), 0);
        let read = tokio::time::timeout(WAIT, reader.read_frame())
            .await
            .expect("timely close");
        assert!(matches!(read, Ok(None) | Err(_)));
        assert!(TcpStream::connect(addr).await.is_err());
    }

    #[tokio::test]
    async fn test_stop_abandons_pending_handshakes() {
        let (server, addr) = start_server(ServerConfig::default()).await;
        let stream = TcpStream::connect(addr).await.expect("connect");
        let (read_half, mut write_half) = stream.into_split();
        tokio::time::sleep(Duration::from_millis(100)).await;

        server.stop().await;
        assert_eq!(server.state(), ServerState::Stopped);

        // The write may already fail once the worker has gone away.
        let body = Control::handshake().to_bytes().expect("handshake");
        let _ = framing::write_frame(&mut write_half, &body, HANDSHAKE_MESSAGE_ID).await;

        let mut reader = FrameReader::new(read_half);
        let read = tokio::time::timeout(WAIT, reader.read_frame())
            .await
            .expect("timely close");
        assert!(matches!(read, Ok(None) | Err(_)));
        assert_eq!(server.client_count(), 0);
    }

    #[tokio::test]
    async fn test_encrypted_session() {
        let key = generate_key();
        let config = ServerConfig {
            key: Some(key.clone()),
            ..ServerConfig::default()
        };
        let (server, addr) = start_server(config).await;
        let (seen_tx, mut seen_rx) = mpsc::unbounded_channel();
        server.add_handler(move |_, message| {
            seen_tx.send(message.clone())?;
            Ok(())
        });
        let (mut reader, mut writer) = raw_peer(addr).await;

        let body = Message::text("alice", "sealed").to_json().expect("json");
        let sealed = framing::seal(Some(&key), body.into_bytes()).expect("seal");
        framing::write_frame(&mut writer, &sealed, 1)
            .await
            .expect("send");
        let ack = next_json(&mut reader, Some(&key)).await;
        assert!(Control::from_value(&ack).expect("ack").is_ack_for(1));
        let message = seen_rx.recv().await.expect("handled");
        assert_eq!(message["content"]["text"], "sealed");

        // Plaintext after the handshake is discarded, not ACKed.
        framing::write_frame(&mut writer, br#"{"type":"HEARTBEAT"}"#, 2)
            .await
            .expect("send");
        let nothing = tokio::time::timeout(Duration::from_millis(100), reader.read_frame()).await;
        assert!(nothing.is_err());
        assert_eq!(server.client_count(), 1);
        server.stop().await;
    }
}
