//! Integration test: peers exchanging messages through a relay server.
//!
//! Exercises the full connection lifecycle over loopback TCP:
//! 1. Handshake and ACK(0) before a client reports connected
//! 2. Per-message ACKs arriving in send order
//! 3. Relay through the server with the sender excluded
//! 4. Dispatcher replies routed back to the sending peer
//! 5. Passphrase-derived session keys, matching and mismatched
//! 6. Misbehaving raw sockets not disturbing registered peers
//! 7. Server shutdown propagating to every client

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use nearmeet_crypto::kdf::{derive_key, KdfParams};
use nearmeet_crypto::keys::Salt;
use nearmeet_transport::client::{Client, ClientConfig};
use nearmeet_transport::dispatch::Dispatcher;
use nearmeet_transport::messages::Control;
use nearmeet_transport::server::{Server, ServerConfig};
use nearmeet_types::{ConnectionState, Message, MessageType};
use serde_json::Value;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::sync::mpsc;

const WAIT: Duration = Duration::from_secs(5);
const QUIET: Duration = Duration::from_millis(200);

fn client_config() -> ClientConfig {
    ClientConfig {
        connect_timeout: Duration::from_secs(2),
        read_timeout: Duration::from_millis(200),
        ..ClientConfig::default()
    }
}

async fn start_server(config: ServerConfig) -> (Server, SocketAddr) {
    let server = Server::new(config);
    let addr = server.start("127.0.0.1", 0).await.expect("server start");
    (server, addr)
}

async fn connect(config: ClientConfig, addr: SocketAddr) -> Client {
    let client = Client::new(config);
    client
        .connect("127.0.0.1", addr.port())
        .await
        .expect("client connect");
    client
}

/// Forward every JSON payload a client receives into a channel.
fn capture(client: &Client) -> mpsc::UnboundedReceiver<Value> {
    let (tx, rx) = mpsc::unbounded_channel();
    client.add_handler(move |payload| {
        if let Some(value) = payload.as_json() {
            tx.send(value.clone())?;
        }
        Ok(())
    });
    rx
}

/// Next captured payload that is not an ACK.
async fn next_non_ack(rx: &mut mpsc::UnboundedReceiver<Value>) -> Value {
    tokio::time::timeout(WAIT, async {
        loop {
            let value = rx.recv().await.expect("channel open");
            if !matches!(Control::from_value(&value), Some(Control::Ack { .. })) {
                return value;
            }
        }
    })
    .await
    .expect("payload in time")
}

async fn wait_for_clients(server: &Server, count: usize) {
    tokio::time::timeout(WAIT, async {
        while server.client_count() != count {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("client count reached");
}

async fn wait_for_state(client: &Client, want: ConnectionState) {
    let mut changes = client.state_changes();
    tokio::time::timeout(WAIT, changes.wait_for(|state| *state == want))
        .await
        .expect("state in time")
        .expect("state channel open");
}

/// Relay every TEXT message to all peers except its sender.
fn install_relay(server: &Server) {
    let relay = server.clone();
    server.add_handler(move |peer, message| {
        if message.get("message_type").and_then(Value::as_str) == Some(MessageType::Text.as_str())
        {
            relay.broadcast(message, Some(peer))?;
        }
        Ok(())
    });
}

#[tokio::test]
async fn test_connect_registers_peer_after_handshake_ack() {
    let (server, addr) = start_server(ServerConfig::default()).await;
    let client = Client::new(client_config());
    let mut acks = capture(&client);

    client
        .connect("127.0.0.1", addr.port())
        .await
        .expect("connect");
    assert!(client.is_connected());
    assert_eq!(client.remote_addr(), Some(addr));
    assert_eq!(server.client_count(), 1);

    let first = tokio::time::timeout(WAIT, acks.recv())
        .await
        .expect("ack in time")
        .expect("ack");
    assert!(Control::from_value(&first)
        .expect("control")
        .is_ack_for(0));

    client.disconnect();
    wait_for_clients(&server, 0).await;
    server.stop().await;
}

#[tokio::test]
async fn test_acks_follow_send_order() {
    let (server, addr) = start_server(ServerConfig::default()).await;
    let client = Client::new(client_config());
    let mut inbound = capture(&client);
    client
        .connect("127.0.0.1", addr.port())
        .await
        .expect("connect");

    let mut sent = Vec::new();
    for n in 0..5 {
        let id = client
            .send_message(&Message::text("alice", format!("line {n}")))
            .expect("send");
        sent.push(id);
    }
    assert_eq!(sent, [1, 2, 3, 4, 5]);

    let mut acked = Vec::new();
    tokio::time::timeout(WAIT, async {
        while acked.len() < 6 {
            let value = inbound.recv().await.expect("channel open");
            if let Some(Control::Ack { message_id, .. }) = Control::from_value(&value) {
                acked.push(message_id);
            }
        }
    })
    .await
    .expect("all acks");
    assert_eq!(acked, [0, 1, 2, 3, 4, 5]);

    client.disconnect();
    server.stop().await;
}

#[tokio::test]
async fn test_text_is_relayed_to_everyone_but_the_sender() {
    let (server, addr) = start_server(ServerConfig::default()).await;
    install_relay(&server);

    let alice = connect(client_config(), addr).await;
    let bob = connect(client_config(), addr).await;
    let carol = connect(client_config(), addr).await;
    let mut alice_rx = capture(&alice);
    let mut bob_rx = capture(&bob);
    let mut carol_rx = capture(&carol);
    wait_for_clients(&server, 3).await;

    alice
        .send_message(&Message::text("alice", "hello everyone").with_id("m-1"))
        .expect("send");

    for rx in [&mut bob_rx, &mut carol_rx] {
        let got = next_non_ack(rx).await;
        let message = Message::from_value(&got).expect("message");
        assert_eq!(message.sender, "alice");
        assert_eq!(message.text_body(), Some("hello everyone"));
        assert_eq!(message.message_id.as_deref(), Some("m-1"));
    }

    // Alice only ever sees ACKs.
    tokio::time::sleep(QUIET).await;
    while let Ok(value) = alice_rx.try_recv() {
        assert!(matches!(
            Control::from_value(&value),
            Some(Control::Ack { .. })
        ));
    }

    for client in [&alice, &bob, &carol] {
        client.disconnect();
    }
    server.stop().await;
}

#[tokio::test]
async fn test_dispatcher_reply_reaches_sender() {
    let (server, addr) = start_server(ServerConfig::default()).await;
    let dispatcher = Arc::new(Dispatcher::with_default_handlers());
    let replier = server.clone();
    server.add_handler(move |peer, message| {
        if let Some(reply) = dispatcher.dispatch(message) {
            replier.send_to(peer, &reply)?;
        }
        Ok(())
    });

    let client = connect(client_config(), addr).await;
    let mut inbound = capture(&client);

    client
        .send_message(&Message::text("alice", "ping").with_id("abc"))
        .expect("send");
    let reply = next_non_ack(&mut inbound).await;
    assert_eq!(reply["status"], "received");
    assert_eq!(reply["message_id"], "abc");

    client.send(&Control::heartbeat()).expect("heartbeat");
    let reply = next_non_ack(&mut inbound).await;
    assert_eq!(reply["type"], "HEARTBEAT_ACK");

    client.disconnect();
    server.stop().await;
}

#[tokio::test]
async fn test_shared_passphrase_session() {
    let salt = Salt::generate();
    let (server_key, _) =
        derive_key("correct horse battery", Some(&salt), KdfParams::default()).expect("derive");
    let (client_key, _) =
        derive_key("correct horse battery", Some(&salt), KdfParams::default()).expect("derive");

    let (server, addr) = start_server(ServerConfig {
        key: Some(server_key),
        ..ServerConfig::default()
    })
    .await;
    let (seen_tx, mut seen_rx) = mpsc::unbounded_channel();
    server.add_handler(move |_, message| {
        seen_tx.send(message.clone())?;
        Ok(())
    });

    let client = connect(
        ClientConfig {
            key: Some(client_key),
            ..client_config()
        },
        addr,
    )
    .await;
    let mut inbound = capture(&client);

    let id = client
        .send_message(&Message::text("alice", "sealed hello"))
        .expect("send");
    let seen = tokio::time::timeout(WAIT, seen_rx.recv())
        .await
        .expect("handled in time")
        .expect("handled");
    assert_eq!(seen["content"]["text"], "sealed hello");

    let acked = tokio::time::timeout(WAIT, async {
        loop {
            let value = inbound.recv().await.expect("channel open");
            if Control::from_value(&value).is_some_and(|c| c.is_ack_for(id)) {
                return;
            }
        }
    })
    .await;
    assert!(acked.is_ok());

    client.disconnect();
    server.stop().await;
}

#[tokio::test]
async fn test_mismatched_passphrase_drops_messages() {
    let salt = Salt::generate();
    let (server_key, _) = derive_key("server secret", Some(&salt), KdfParams::default())
        .expect("derive");
    let (client_key, _) = derive_key("client secret", Some(&salt), KdfParams::default())
        .expect("derive");

    let (server, addr) = start_server(ServerConfig {
        key: Some(server_key),
        ..ServerConfig::default()
    })
    .await;
    let (seen_tx, mut seen_rx) = mpsc::unbounded_channel::<Value>();
    server.add_handler(move |_, message| {
        seen_tx.send(message.clone())?;
        Ok(())
    });

    // The handshake is plaintext, so the connection itself succeeds.
    let client = connect(
        ClientConfig {
            key: Some(client_key),
            ..client_config()
        },
        addr,
    )
    .await;
    client
        .send_message(&Message::text("alice", "unreadable"))
        .expect("send");

    let nothing = tokio::time::timeout(QUIET, seen_rx.recv()).await;
    assert!(nothing.is_err());
    assert!(client.is_connected());
    assert_eq!(server.client_count(), 1);

    client.disconnect();
    server.stop().await;
}

#[tokio::test]
async fn test_garbage_socket_does_not_disturb_peers() {
    let (server, addr) = start_server(ServerConfig::default()).await;
    let (seen_tx, mut seen_rx) = mpsc::unbounded_channel();
    server.add_handler(move |_, message| {
        seen_tx.send(message.clone())?;
        Ok(())
    });
    let client = connect(client_config(), addr).await;

    let mut raw = TcpStream::connect(addr).await.expect("raw connect");
    raw.write_all(b"GET / HTTP/1.1\r\nHost: nearmeet\r\n\r\n")
        .await
        .expect("write garbage");
    tokio::time::sleep(QUIET).await;
    assert_eq!(server.client_count(), 1);

    client
        .send_message(&Message::text("alice", "still here"))
        .expect("send");
    let seen = tokio::time::timeout(WAIT, seen_rx.recv())
        .await
        .expect("handled in time")
        .expect("handled");
    assert_eq!(seen["content"]["text"], "still here");

    client.disconnect();
    server.stop().await;
}

#[tokio::test]
async fn test_stop_disconnects_every_client() {
    let (server, addr) = start_server(ServerConfig::default()).await;
    let alice = connect(client_config(), addr).await;
    let bob = connect(client_config(), addr).await;
    wait_for_clients(&server, 2).await;

    server.stop().await;
    wait_for_state(&alice, ConnectionState::Disconnected).await;
    wait_for_state(&bob, ConnectionState::Disconnected).await;
    assert!(alice.send_message(&Message::text("alice", "late")).is_err());
}

#[tokio::test]
async fn test_reconnect_after_manual_disconnect() {
    let (server, addr) = start_server(ServerConfig::default()).await;
    let client = connect(client_config(), addr).await;

    client.disconnect();
    assert_eq!(client.state(), ConnectionState::Disconnected);
    wait_for_clients(&server, 0).await;

    client
        .connect("127.0.0.1", addr.port())
        .await
        .expect("second connect");
    assert!(client.is_connected());
    wait_for_clients(&server, 1).await;

    client.disconnect();
    server.stop().await;
}
