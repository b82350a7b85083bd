use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use thiserror::Error;
use uuid::Uuid;

/// Category of a (possibly partial) received transmission.
pub const ACTIVITY_EVENT: &str = "RX.ACTIVITY";

/// Category of a message the radio application has already reassembled.
pub const DIRECTED_EVENT: &str = "RX.DIRECTED";

/// Command type the radio application expects for a plain text transmission.
pub const SEND_MESSAGE_COMMAND: &str = "TX.SEND_MESSAGE";

/// JS8 end-of-message marker appended to the last frame of a transmission.
pub const END_OF_MESSAGE: char = '♢';

/// One decoded JSON object received from the radio application.
///
/// Unknown top-level fields are preserved in `extra` so the event can be
/// re-serialised without loss.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RadioEvent {
    /// e.g. "RX.ACTIVITY", "RIG.FREQ"
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub value: Value,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub params: Map<String, Value>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl RadioEvent {
    /// Decode an event from a JSON value.
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::Parsing`] when the value is not an object or has
    /// no string `type` field.
    pub fn from_json(raw: Value) -> Result<Self, BridgeError> {
        serde_json::from_value(raw).map_err(|e| BridgeError::Parsing(format!("radio event: {e}")))
    }

    /// `true` for `RX.ACTIVITY` frames.
    pub fn is_activity(&self) -> bool {
        self.kind == ACTIVITY_EVENT
    }

    /// `true` for `RX.DIRECTED` messages.
    pub fn is_directed(&self) -> bool {
        self.kind == DIRECTED_EVENT
    }

    /// Look up a string parameter, ignoring empty strings.
    pub fn param_str(&self, name: &str) -> Option<&str> {
        self.params
            .get(name)
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
    }

    pub fn param_i64(&self, name: &str) -> Option<i64> {
        self.params.get(name).and_then(Value::as_i64)
    }

    /// Re-serialise the full event (type, value, params and extra fields).
    pub fn to_json(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

/// A single frame of a received transmission, derived from an activity event.
#[derive(Debug, Clone, PartialEq)]
pub struct ActivityFragment {
    /// Conversation key grouping frames of one transmission. `None` when the
    /// event carried nothing to derive it from.
    pub key: Option<String>,
    pub text: String,
    pub is_final: bool,
    pub origin: Option<String>,
    pub snr: Option<i64>,
    pub offset: Option<i64>,
}

impl ActivityFragment {
    /// Build a bare fragment with no signal metadata.
    pub fn new(key: impl Into<String>, text: impl Into<String>, is_final: bool) -> Self {
        Self {
            key: Some(key.into()),
            text: text.into(),
            is_final,
            origin: None,
            snr: None,
            offset: None,
        }
    }

    /// Derive a fragment from an `RX.ACTIVITY` event.
    ///
    /// The key is the `ORIGIN` callsign when present, otherwise the audio
    /// `OFFSET`. The text comes from `params.TEXT`, falling back to a string
    /// `value`. A frame is final when `params.FINAL` says so or, lacking that
    /// flag, when its text ends with [`END_OF_MESSAGE`].
    pub fn from_event(event: &RadioEvent) -> Self {
        let origin = event.param_str("ORIGIN").map(str::to_string);
        let offset = event.param_i64("OFFSET");
        let key = origin
            .clone()
            .or_else(|| offset.map(|o| o.to_string()));

        let text = event
            .param_str("TEXT")
            .or_else(|| event.value.as_str())
            .unwrap_or_default()
            .to_string();

        let is_final = match event.params.get("FINAL").and_then(Value::as_bool) {
            Some(flag) => flag,
            None => text.trim_end().ends_with(END_OF_MESSAGE),
        };

        Self {
            key,
            text,
            is_final,
            origin,
            snr: event.param_i64("SNR"),
            offset,
        }
    }
}

/// Outcome of reassembling one conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReassemblyResult {
    pub key: String,
    pub text: String,
    /// `false` when the conversation timed out before its final frame.
    pub complete: bool,
    pub fragments: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snr: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub offset: Option<i64>,
}

impl ReassemblyResult {
    /// Wrap a single final fragment that needed no buffering.
    pub fn single(fragment: ActivityFragment) -> Self {
        Self {
            key: fragment.key.unwrap_or_default(),
            text: fragment.text,
            complete: true,
            fragments: 1,
            origin: fragment.origin,
            snr: fragment.snr,
            offset: fragment.offset,
        }
    }

    /// Build a complete result from an `RX.DIRECTED` event.
    pub fn from_directed(event: &RadioEvent) -> Self {
        let origin = event.param_str("ORIGIN").map(str::to_string);
        let key = origin
            .clone()
            .or_else(|| event.params.get("ID").map(|id| match id {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            }))
            .unwrap_or_default();
        Self {
            key,
            text: event.value.as_str().unwrap_or_default().to_string(),
            complete: true,
            fragments: 1,
            origin,
            snr: event.param_i64("SNR"),
            offset: event.param_i64("OFFSET"),
        }
    }

    pub fn to_json(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

/// A bus-originated request bound for the radio application.
#[derive(Debug, Clone, PartialEq)]
pub struct Command {
    pub id: Uuid,
    pub enqueued_at: DateTime<Utc>,
    /// JSON object written verbatim to the radio link.
    pub payload: Value,
}

impl Command {
    /// Wrap an already well-formed command object.
    pub fn new(payload: Value) -> Self {
        Self {
            id: Uuid::new_v4(),
            enqueued_at: Utc::now(),
            payload,
        }
    }

    /// Parse a payload received on the command topic.
    ///
    /// Objects carrying a `type` are forwarded untouched. An object with only
    /// a string `message` is expanded into a `TX.SEND_MESSAGE` command.
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::Parsing`] for non-object payloads and objects
    /// with neither field.
    pub fn from_bus_payload(payload: Value) -> Result<Self, BridgeError> {
        let Some(object) = payload.as_object() else {
            return Err(BridgeError::Parsing(format!(
                "command payload must be a JSON object, got {payload}"
            )));
        };

        if object.contains_key("type") {
            return Ok(Self::new(payload));
        }

        match object.get("message").and_then(Value::as_str) {
            Some(message) => {
                let expanded = json!({
                    "type": SEND_MESSAGE_COMMAND,
                    "value": message,
                    "params": { "_ID": Utc::now().timestamp_millis() }
                });
                Ok(Self::new(expanded))
            }
            None => Err(BridgeError::Parsing(
                "command payload has neither a 'type' nor a 'message' field".to_string(),
            )),
        }
    }
}

/// A message routed over the publish/subscribe bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusMessage {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    /// e.g. "js8/rx/complete"
    pub topic: String,
    pub payload: Value,
}

impl BusMessage {
    pub fn new(topic: impl Into<String>, payload: Value) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            topic: topic.into(),
            payload,
        }
    }
}

/// Error type shared by every bridge crate.
#[derive(Error, Debug)]
pub enum BridgeError {
    #[error("Transport Error: {0}")]
    Transport(String),

    #[error("Radio link is not connected")]
    NotConnected,

    #[error("Bus Channel Error: {0}")]
    Channel(String),

    #[error("Parsing Error: {0}")]
    Parsing(String),

    #[error("Serialization Error: {0}")]
    Serialization(String),

    #[error("Configuration Error: {0}")]
    Config(String),
}
