//! Server and client wiring for the daemon.
//!
//! Server mode routes every inbound message through the dispatcher, keeps
//! TEXT messages in the chat store and relays them to the other peers.
//! Client mode keeps inbound TEXT messages in the chat store, prints new
//! store entries, and turns input lines into TEXT messages.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use nearmeet_chat::{format, ChatStore};
use nearmeet_transport::client::{Client, ClientConfig};
use nearmeet_transport::dispatch::Dispatcher;
use nearmeet_transport::messages::Payload;
use nearmeet_transport::server::{Server, ServerConfig};
use nearmeet_types::{validate, ChatMessage, Message, MessageType};
use serde_json::Value;
use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Characters of message text shown in relay logs.
const PREVIEW_CHARS: usize = 40;

/// A running server plus the task relaying its inbound messages.
pub struct ServerNode {
    server: Server,
    store: Arc<ChatStore>,
    relay: JoinHandle<()>,
    local_addr: SocketAddr,
}

impl ServerNode {
    pub async fn start(config: ServerConfig, host: &str, port: u16) -> anyhow::Result<Self> {
        let server = Server::new(config);
        let store = Arc::new(ChatStore::new());
        let dispatcher = Arc::new(Dispatcher::with_default_handlers());

        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        server.add_handler(move |peer, message| {
            inbound_tx.send((peer, message.clone()))?;
            Ok(())
        });

        let local_addr = server
            .start(host, port)
            .await
            .with_context(|| format!("starting server on {host}:{port}"))?;
        let relay = tokio::spawn(relay_loop(
            server.clone(),
            dispatcher,
            Arc::clone(&store),
            inbound_rx,
        ));

        Ok(Self {
            server,
            store,
            relay,
            local_addr,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn store(&self) -> &Arc<ChatStore> {
        &self.store
    }

    pub fn server(&self) -> &Server {
        &self.server
    }

    pub async fn shutdown(self) {
        self.server.stop().await;
        self.relay.abort();
    }
}

async fn relay_loop(
    server: Server,
    dispatcher: Arc<Dispatcher>,
    store: Arc<ChatStore>,
    mut inbound: mpsc::UnboundedReceiver<(SocketAddr, Value)>,
) {
    while let Some((peer, message)) = inbound.recv().await {
        if let Some(reply) = dispatcher.dispatch(&message) {
            tracing::debug!(%peer, %reply, "dispatched");
        }

        let Some(chat) = Message::from_value(&message)
            .ok()
            .and_then(|wire| ChatMessage::from_wire(&wire))
        else {
            continue;
        };
        let preview = format::truncate(&chat.content, PREVIEW_CHARS);
        if !store.add(chat) {
            continue;
        }
        match server.broadcast(&message, Some(peer)) {
            Ok(delivered) => tracing::debug!(%peer, delivered, %preview, "relayed text message"),
            Err(e) => tracing::warn!(%peer, "relay failed: {e}"),
        }
    }
}

/// A connected client with a local chat history.
pub struct ClientNode {
    client: Client,
    store: Arc<ChatStore>,
    username: String,
}

impl ClientNode {
    /// Connect and start recording inbound TEXT messages.
    pub async fn connect(
        config: ClientConfig,
        host: &str,
        port: u16,
        username: impl Into<String>,
    ) -> anyhow::Result<Self> {
        let client = Client::new(config);
        let store = Arc::new(ChatStore::new());

        let inbound_store = Arc::clone(&store);
        client.add_handler(move |payload| {
            if let Some(chat) = text_message(payload) {
                inbound_store.add(chat);
            }
            Ok(())
        });

        client
            .connect(host, port)
            .await
            .with_context(|| format!("connecting to {host}:{port}"))?;

        Ok(Self {
            client,
            store,
            username: username.into(),
        })
    }

    pub fn store(&self) -> &Arc<ChatStore> {
        &self.store
    }

    /// Print every new store entry to stdout.
    pub fn print_messages(&self) {
        self.store.subscribe(|message| {
            println!("{}", format::display_line(message));
            Ok(())
        });
    }

    /// Validate, send and record one chat line.
    pub fn send_text(&self, text: &str) -> anyhow::Result<()> {
        validate::validate_message(text)?;
        let chat = ChatMessage::new(self.username.clone(), text);
        let wire = Message::text(self.username.clone(), text).with_id(chat.message_id.clone());
        self.client.send_message(&wire)?;
        self.store.add(chat);
        Ok(())
    }

    /// Send each non-blank line of `input` until it ends.
    pub async fn pump_lines<R>(&self, input: R) -> anyhow::Result<()>
    where
        R: AsyncBufRead + Unpin,
    {
        let mut lines = input.lines();
        while let Some(line) = lines.next_line().await? {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            if let Err(e) = self.send_text(line) {
                tracing::warn!("message not sent: {e:#}");
            }
        }
        Ok(())
    }

    pub fn disconnect(&self) {
        self.client.disconnect();
    }
}

/// A received TEXT message in stored form.
fn text_message(payload: &Payload) -> Option<ChatMessage> {
    let value = payload.as_json()?;
    if value.get("message_type").and_then(Value::as_str) != Some(MessageType::Text.as_str()) {
        return None;
    }
    let wire = Message::from_value(value).ok()?;
    ChatMessage::from_wire(&wire)
}
