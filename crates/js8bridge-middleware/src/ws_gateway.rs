//! WebSocket gateway onto the [`EventBus`].
//!
//! [`BusGateway`] lets any number of external clients observe radio events
//! and submit commands without each holding its own connection to JS8Call.
//! Clients speak a small JSON op protocol, one object per text frame:
//!
//! | Client → gateway | Effect |
//! |---|---|
//! | `{"op":"subscribe","topic":"js8/#"}` | start receiving matching messages |
//! | `{"op":"unsubscribe","topic":"js8/#"}` | stop receiving them |
//! | `{"op":"publish","topic":"js8/tx/command","msg":{…}}` | publish onto the bus |
//!
//! Every bus message matching one of the client's filters is delivered as
//! `{"op":"publish","topic":…,"msg":…}`. Frames that do not parse are logged
//! and ignored.

use std::net::SocketAddr;
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use js8bridge_types::{BridgeError, BusMessage};
use serde_json::{Value, json};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio_tungstenite::{accept_async, tungstenite::Message};
use tracing::{debug, error, info, warn};

use crate::bus::{EventBus, topic_matches, validate_filter};

/// A decoded client frame.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientOp {
    Subscribe(String),
    Unsubscribe(String),
    Publish { topic: String, msg: Value },
}

/// Bridge between the internal [`EventBus`] and WebSocket clients.
#[derive(Clone)]
pub struct BusGateway {
    bus: Arc<EventBus>,
}

impl BusGateway {
    /// Create a new gateway backed by `bus`.
    pub fn new(bus: Arc<EventBus>) -> Self {
        Self { bus }
    }

    /// Bind the gateway's listening socket.
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::Transport`] if the TCP listener cannot be bound.
    pub async fn bind(addr: &str) -> Result<TcpListener, BridgeError> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| BridgeError::Transport(format!("gateway bind error on {addr}: {e}")))?;
        info!(addr = %addr, "bus gateway listening");
        Ok(listener)
    }

    /// Accept clients until the task is dropped.
    pub async fn serve(self, listener: TcpListener) {
        loop {
            match listener.accept().await {
                Ok((stream, peer)) => {
                    let gateway = self.clone();
                    tokio::spawn(async move {
                        if let Err(e) = gateway.handle_client(stream, peer).await {
                            error!(peer = %peer, error = %e, "gateway client error");
                        }
                    });
                }
                Err(e) => {
                    error!(error = %e, "gateway accept error");
                }
            }
        }
    }

    async fn handle_client(&self, stream: TcpStream, peer: SocketAddr) -> Result<(), BridgeError> {
        let ws_stream = accept_async(stream)
            .await
            .map_err(|e| BridgeError::Transport(format!("ws handshake from {peer}: {e}")))?;
        info!(peer = %peer, "gateway client connected");

        let (mut ws_tx, mut ws_rx) = ws_stream.split();
        let mut rx = self.bus.subscribe();
        let mut subscriptions: Vec<String> = Vec::new();

        loop {
            tokio::select! {
                result = rx.recv() => {
                    match result {
                        Ok(message) => {
                            if !subscriptions.iter().any(|f| topic_matches(f, &message.topic)) {
                                continue;
                            }
                            let frame = json!({
                                "op": "publish",
                                "topic": message.topic,
                                "msg": message.payload,
                            });
                            if ws_tx.send(Message::Text(frame.to_string().into())).await.is_err() {
                                break;
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            warn!(peer = %peer, lagged_by = n, "gateway client lagged");
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
                msg = ws_rx.next() => {
                    match msg {
                        Some(Ok(Message::Close(_))) | None => break,
                        Some(Err(_)) => break,
                        Some(Ok(Message::Text(text))) => {
                            self.handle_client_frame(peer, text.as_str(), &mut subscriptions);
                        }
                        _ => {}
                    }
                }
            }
        }

        info!(peer = %peer, "gateway client disconnected");
        Ok(())
    }

    /// Apply one client frame to `subscriptions` or the bus.
    fn handle_client_frame(&self, peer: SocketAddr, text: &str, subscriptions: &mut Vec<String>) {
        match parse_client_frame(text) {
            Ok(ClientOp::Subscribe(filter)) => {
                debug!(peer = %peer, filter = %filter, "subscribe");
                if !subscriptions.contains(&filter) {
                    subscriptions.push(filter);
                }
            }
            Ok(ClientOp::Unsubscribe(filter)) => {
                debug!(peer = %peer, filter = %filter, "unsubscribe");
                subscriptions.retain(|f| *f != filter);
            }
            Ok(ClientOp::Publish { topic, msg }) => {
                debug!(peer = %peer, topic = %topic, "client publish");
                self.bus.publish(BusMessage::new(topic, msg));
            }
            Err(e) => {
                warn!(peer = %peer, error = %e, "ignoring malformed gateway frame");
            }
        }
    }
}

/// Parse one client text frame.
pub fn parse_client_frame(text: &str) -> Result<ClientOp, BridgeError> {
    let json: Value = serde_json::from_str(text)
        .map_err(|e| BridgeError::Parsing(format!("gateway frame: {e}")))?;

    let op = json.get("op").and_then(Value::as_str).unwrap_or_default();
    let Some(topic) = json.get("topic").and_then(Value::as_str) else {
        return Err(BridgeError::Parsing("gateway frame has no 'topic'".to_string()));
    };

    match op {
        "subscribe" | "unsubscribe" => {
            validate_filter(topic)?;
            if op == "subscribe" {
                Ok(ClientOp::Subscribe(topic.to_string()))
            } else {
                Ok(ClientOp::Unsubscribe(topic.to_string()))
            }
        }
        "publish" => {
            if topic.is_empty() || topic.contains(['+', '#']) {
                return Err(BridgeError::Parsing(format!(
                    "cannot publish to '{topic}': wildcards or empty topic"
                )));
            }
            Ok(ClientOp::Publish {
                topic: topic.to_string(),
                msg: json.get("msg").cloned().unwrap_or(Value::Null),
            })
        }
        other => Err(BridgeError::Parsing(format!("unknown gateway op '{other}'"))),
    }
}
