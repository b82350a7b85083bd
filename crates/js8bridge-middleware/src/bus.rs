//! Headless, topic-based publish/subscribe bus.
//!
//! Uses a [`tokio::sync::broadcast`] channel under the hood so that every
//! subscriber receives every message without any single subscriber blocking
//! the others. Subscribers narrow the stream with MQTT-style topic filters:
//!
//! | Filter | Matches |
//! |---|---|
//! | `js8/rx/complete` | exactly that topic |
//! | `js8/rig/+` | `js8/rig/freq`, `js8/rig/ptt`, … (one level) |
//! | `js8/#` | everything under `js8`, including `js8` itself |
//!
//! Broadcast receivers that fall behind skip messages. Command streams do
//! not: they are fed through [`CommandTaps`], one unbounded queue per stream,
//! so every matching publish reaches the consumer.

use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use futures_util::stream::{self, BoxStream, StreamExt};
use js8bridge_types::{BridgeError, BusMessage};
use serde_json::Value;
use tokio::sync::{broadcast, mpsc};
use tracing::warn;

use crate::adapter::BusLink;

/// Default channel capacity (number of buffered messages before old ones are
/// dropped for slow subscribers).
const DEFAULT_CAPACITY: usize = 256;

/// Shared bus. Clone it cheaply – all clones share the same underlying
/// broadcast channel.
#[derive(Clone, Debug)]
pub struct EventBus {
    sender: broadcast::Sender<BusMessage>,
    taps: CommandTaps,
}

impl EventBus {
    /// Create a new bus with the given channel capacity.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender,
            taps: CommandTaps::default(),
        }
    }

    /// Publish a message.
    ///
    /// Returns the number of active receivers (command streams included) that
    /// were handed the message. Returns `0` when nobody is listening (this is
    /// a normal condition, not an error).
    pub fn publish(&self, message: BusMessage) -> usize {
        let tapped = self.taps.deliver(&message.topic, &message.payload);
        tapped + self.sender.send(message).unwrap_or(0)
    }

    /// Convenience: wrap `payload` in a [`BusMessage`] and publish it.
    pub fn publish_to(&self, topic: impl Into<String>, payload: Value) -> usize {
        self.publish(BusMessage::new(topic, payload))
    }

    /// Subscribe to every message on the bus.
    pub fn subscribe(&self) -> broadcast::Receiver<BusMessage> {
        self.sender.subscribe()
    }

    /// Subscribe and return a [`TopicSubscriber`] restricted to `filter`.
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::Parsing`] when `filter` is not a valid topic
    /// filter.
    pub fn subscribe_filter(&self, filter: impl Into<String>) -> Result<TopicSubscriber, BridgeError> {
        let filter = filter.into();
        validate_filter(&filter)?;
        Ok(TopicSubscriber {
            filter,
            receiver: self.sender.subscribe(),
        })
    }

    /// Number of live receivers, command streams included.
    pub fn receiver_count(&self) -> usize {
        self.sender.receiver_count() + self.taps.len()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

#[async_trait]
impl BusLink for EventBus {
    async fn publish(&self, topic: &str, payload: Value) -> Result<usize, BridgeError> {
        Ok(self.publish_to(topic, payload))
    }

    async fn command_stream(&self, filter: &str) -> Result<BoxStream<'static, Value>, BridgeError> {
        let rx = self.taps.register(filter)?;
        Ok(tap_stream(rx))
    }
}

// ---------------------------------------------------------------------------
// Lossless command taps
// ---------------------------------------------------------------------------

struct Tap {
    filter: String,
    sender: mpsc::UnboundedSender<Value>,
}

/// Filter-matched, unbounded delivery of payloads to command consumers.
///
/// Clones share the same table. Taps whose receiver has been dropped are
/// pruned on the next delivery.
#[derive(Clone, Default)]
pub struct CommandTaps {
    inner: Arc<Mutex<Vec<Tap>>>,
}

impl std::fmt::Debug for CommandTaps {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandTaps").field("filters", &self.filters()).finish()
    }
}

impl CommandTaps {
    fn table(&self) -> MutexGuard<'_, Vec<Tap>> {
        // The table holds no invariant a panicking holder could break.
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Register a consumer for every payload published on a topic matching
    /// `filter`.
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::Parsing`] when `filter` is not a valid topic
    /// filter.
    pub fn register(&self, filter: &str) -> Result<mpsc::UnboundedReceiver<Value>, BridgeError> {
        validate_filter(filter)?;
        let (sender, rx) = mpsc::unbounded_channel();
        self.table().push(Tap {
            filter: filter.to_string(),
            sender,
        });
        Ok(rx)
    }

    /// Hand `payload` to every tap matching `topic`. Returns how many took it.
    pub fn deliver(&self, topic: &str, payload: &Value) -> usize {
        let mut table = self.table();
        let mut delivered = 0;
        table.retain(|tap| {
            if !topic_matches(&tap.filter, topic) {
                return !tap.sender.is_closed();
            }
            match tap.sender.send(payload.clone()) {
                Ok(()) => {
                    delivered += 1;
                    true
                }
                Err(_) => false,
            }
        });
        delivered
    }

    /// Filters of the live taps.
    pub fn filters(&self) -> Vec<String> {
        self.table()
            .iter()
            .filter(|tap| !tap.sender.is_closed())
            .map(|tap| tap.filter.clone())
            .collect()
    }

    /// Number of live taps.
    pub fn len(&self) -> usize {
        self.table().iter().filter(|tap| !tap.sender.is_closed()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Turn a tap receiver into a payload stream.
pub fn tap_stream(rx: mpsc::UnboundedReceiver<Value>) -> BoxStream<'static, Value> {
    stream::unfold(rx, |mut rx| async move { rx.recv().await.map(|payload| (payload, rx)) }).boxed()
}

// ---------------------------------------------------------------------------
// Topic filters
// ---------------------------------------------------------------------------

/// Check that `filter` is a well-formed topic filter: non-empty, `+` only as
/// a whole level, `#` only as the whole last level.
pub fn validate_filter(filter: &str) -> Result<(), BridgeError> {
    if filter.is_empty() {
        return Err(BridgeError::Parsing("empty topic filter".to_string()));
    }
    let levels: Vec<&str> = filter.split('/').collect();
    for (i, level) in levels.iter().enumerate() {
        let is_last = i + 1 == levels.len();
        if level.contains('#') && (*level != "#" || !is_last) {
            return Err(BridgeError::Parsing(format!(
                "'#' must be the whole last level in filter '{filter}'"
            )));
        }
        if level.contains('+') && *level != "+" {
            return Err(BridgeError::Parsing(format!(
                "'+' must occupy a whole level in filter '{filter}'"
            )));
        }
    }
    Ok(())
}

/// Return `true` when `topic` matches `filter`.
pub fn topic_matches(filter: &str, topic: &str) -> bool {
    let mut filter_levels = filter.split('/');
    let mut topic_levels = topic.split('/');
    loop {
        match (filter_levels.next(), topic_levels.next()) {
            (Some("#"), _) => return true,
            (Some("+"), Some(_)) => continue,
            (Some(f), Some(t)) if f == t => continue,
            (None, None) => return true,
            _ => return false,
        }
    }
}

// ---------------------------------------------------------------------------
// Filtered subscriber
// ---------------------------------------------------------------------------

/// A subscriber that only delivers messages whose topic matches its filter.
pub struct TopicSubscriber {
    filter: String,
    receiver: broadcast::Receiver<BusMessage>,
}

impl TopicSubscriber {
    /// Wait for the next message that matches this subscriber's filter.
    ///
    /// Returns `None` when the bus is closed and no further messages will
    /// arrive.
    pub async fn recv(&mut self) -> Option<BusMessage> {
        loop {
            match self.receiver.recv().await {
                Ok(message) if topic_matches(&self.filter, &message.topic) => {
                    return Some(message);
                }
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!(filter = %self.filter, lagged_by = n, "TopicSubscriber lagged");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// The filter this subscriber was created with.
    pub fn filter(&self) -> &str {
        &self.filter
    }

    /// Turn the subscriber into a stream of matching messages.
    pub fn into_stream(self) -> BoxStream<'static, BusMessage> {
        stream::unfold(self, |mut subscriber| async move {
            subscriber.recv().await.map(|message| (message, subscriber))
        })
        .boxed()
    }
}
