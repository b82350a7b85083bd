//! MQTT broker client implementing [`BusLink`].
//!
//! [`MqttBus`] keeps one client session to an external broker. A background
//! task drives the rumqttc event loop: it reconnects after every failure,
//! re-subscribes every command filter on each CONNACK, and hands inbound
//! publishes to the matching command streams through [`CommandTaps`].
//!
//! Payloads are JSON on the wire. An inbound payload that is not JSON is
//! delivered as a JSON string so the consumer can reject and count it.
//!
//! Outbound publishes use QoS 0 and never wait on the broker: while the
//! client's request queue is full, [`BusLink::publish`] fails fast instead of
//! stalling the caller.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream::BoxStream;
use js8bridge_types::BridgeError;
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Outgoing, Packet, QoS};
use serde_json::Value;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::adapter::BusLink;
use crate::bus::{CommandTaps, tap_stream};

/// Default broker port.
pub const DEFAULT_BROKER_PORT: u16 = 1883;

/// Largest packet accepted or sent, in bytes.
pub const MAX_PACKET_BYTES: usize = 256 * 1024;

/// Connection settings for [`MqttBus`].
#[derive(Clone)]
pub struct MqttConfig {
    pub host: String,
    pub port: u16,
    pub client_id: String,
    /// No credentials are sent when empty.
    pub username: String,
    pub password: String,
    pub keep_alive: Duration,
    pub reconnect_delay: Duration,
    /// Requests buffered between the client handle and the event loop.
    pub request_capacity: usize,
}

impl std::fmt::Debug for MqttConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MqttConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("client_id", &self.client_id)
            .field("username", &self.username)
            .field(
                "password",
                if self.password.is_empty() { &"<not set>" } else { &"<redacted>" },
            )
            .field("keep_alive", &self.keep_alive)
            .field("reconnect_delay", &self.reconnect_delay)
            .field("request_capacity", &self.request_capacity)
            .finish()
    }
}

impl MqttConfig {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            client_id: format!("js8bridge-{}", std::process::id()),
            username: String::new(),
            password: String::new(),
            keep_alive: Duration::from_secs(30),
            reconnect_delay: Duration::from_secs(5),
            request_capacity: 1024,
        }
    }

    pub fn with_credentials(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.username = username.into();
        self.password = password.into();
        self
    }

    pub fn with_reconnect_delay(mut self, delay: Duration) -> Self {
        self.reconnect_delay = delay;
        self
    }

    fn options(&self) -> MqttOptions {
        let mut options = MqttOptions::new(self.client_id.clone(), self.host.clone(), self.port);
        options.set_keep_alive(self.keep_alive);
        options.set_clean_session(true);
        options.set_max_packet_size(MAX_PACKET_BYTES, MAX_PACKET_BYTES);
        if !self.username.is_empty() {
            options.set_credentials(self.username.clone(), self.password.clone());
        }
        options
    }
}

/// Self-reconnecting MQTT session.
pub struct MqttBus {
    broker: String,
    client: AsyncClient,
    taps: CommandTaps,
    connected: Arc<AtomicBool>,
    closing: Arc<AtomicBool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl MqttBus {
    /// Start the event-loop task. Must be called from within a Tokio runtime.
    pub fn spawn(config: MqttConfig) -> Self {
        let (client, eventloop) = AsyncClient::new(config.options(), config.request_capacity.max(1));
        let taps = CommandTaps::default();
        let connected = Arc::new(AtomicBool::new(false));
        let closing = Arc::new(AtomicBool::new(false));
        let broker = format!("{}:{}", config.host, config.port);

        let task = tokio::spawn(drive(
            eventloop,
            Session {
                client: client.clone(),
                taps: taps.clone(),
                connected: Arc::clone(&connected),
                closing: Arc::clone(&closing),
                broker: broker.clone(),
            },
            config.reconnect_delay,
        ));

        Self {
            broker,
            client,
            taps,
            connected,
            closing,
            task: Mutex::new(Some(task)),
        }
    }

    /// `host:port` of the broker.
    pub fn broker(&self) -> &str {
        &self.broker
    }

    /// Whether the broker has acknowledged the current session.
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Flush queued publishes, disconnect, and stop the event loop. Gives up
    /// after `grace`.
    pub async fn close(&self, grace: Duration) {
        let Some(mut task) = self.task.lock().await.take() else {
            return;
        };
        self.closing.store(true, Ordering::SeqCst);
        match self.client.try_disconnect() {
            Ok(()) => {
                if tokio::time::timeout(grace, &mut task).await.is_err() {
                    warn!(broker = %self.broker, "MQTT session did not close in time");
                    task.abort();
                }
            }
            Err(e) => {
                debug!(broker = %self.broker, error = %e, "disconnect request not queued");
                task.abort();
            }
        }
        self.connected.store(false, Ordering::SeqCst);
    }
}

impl Drop for MqttBus {
    fn drop(&mut self) {
        if let Ok(mut task) = self.task.try_lock()
            && let Some(task) = task.take()
        {
            task.abort();
        }
    }
}

#[async_trait]
impl BusLink for MqttBus {
    async fn publish(&self, topic: &str, payload: Value) -> Result<usize, BridgeError> {
        let bytes = serde_json::to_vec(&payload).map_err(|e| BridgeError::Serialization(e.to_string()))?;
        self.client
            .try_publish(topic, QoS::AtMostOnce, false, bytes)
            .map_err(|e| BridgeError::Transport(format!("publish to {topic}: {e}")))?;
        Ok(1)
    }

    async fn command_stream(&self, filter: &str) -> Result<BoxStream<'static, Value>, BridgeError> {
        let rx = self.taps.register(filter)?;
        // Otherwise the next CONNACK subscribes it.
        if self.is_connected() {
            self.client
                .try_subscribe(filter, QoS::AtLeastOnce)
                .map_err(|e| BridgeError::Transport(format!("subscribe to {filter}: {e}")))?;
        }
        Ok(tap_stream(rx))
    }
}

// ---------------------------------------------------------------------------
// Event loop
// ---------------------------------------------------------------------------

/// State shared between the event-loop task and the [`MqttBus`] handle.
struct Session {
    client: AsyncClient,
    taps: CommandTaps,
    connected: Arc<AtomicBool>,
    closing: Arc<AtomicBool>,
    broker: String,
}

async fn drive(mut eventloop: EventLoop, session: Session, reconnect_delay: Duration) {
    let Session {
        client,
        taps,
        connected,
        closing,
        broker,
    } = session;
    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                connected.store(true, Ordering::SeqCst);
                info!(broker = %broker, code = ?ack.code, "connected to MQTT broker");
                for filter in taps.filters() {
                    if let Err(e) = client.try_subscribe(filter.as_str(), QoS::AtLeastOnce) {
                        error!(broker = %broker, filter = %filter, error = %e, "subscribe failed");
                    }
                }
            }
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                let payload = decode_payload(&publish.payload);
                let delivered = taps.deliver(&publish.topic, &payload);
                debug!(topic = %publish.topic, delivered, "inbound publish");
            }
            Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                connected.store(false, Ordering::SeqCst);
                info!(broker = %broker, "disconnected from MQTT broker");
                return;
            }
            Ok(_) => {}
            Err(e) => {
                connected.store(false, Ordering::SeqCst);
                if closing.load(Ordering::SeqCst) {
                    debug!(broker = %broker, error = %e, "MQTT session closed");
                    return;
                }
                error!(
                    broker = %broker,
                    error = %e,
                    retry_in_secs = reconnect_delay.as_secs_f64(),
                    "MQTT connection error"
                );
                tokio::time::sleep(reconnect_delay).await;
            }
        }
    }
}

/// JSON payloads decode as-is; anything else becomes a JSON string.
pub fn decode_payload(bytes: &[u8]) -> Value {
    serde_json::from_slice(bytes).unwrap_or_else(|_| Value::String(String::from_utf8_lossy(bytes).into_owned()))
}
