//! Collaborator seams.
//!
//! The bridge core never touches a socket itself. It talks to the radio
//! application through a [`RadioLink`] and to the publish/subscribe bus
//! through a [`BusLink`], so either side can be swapped (or faked in tests)
//! without changing the reassembly and queueing logic.
//!
//! # Overview
//!
//! - [`RadioLink`] – newline-delimited JSON link to the radio application;
//!   implemented by [`Js8Link`][crate::js8_link::Js8Link].
//! - [`BusLink`] – topic publish / filtered subscribe; implemented by
//!   [`EventBus`][crate::bus::EventBus].

use async_trait::async_trait;
use futures_util::stream::BoxStream;
use js8bridge_types::BridgeError;
use serde_json::Value;

/// Connection to the radio application's JSON event/command API.
///
/// # Contract
///
/// * `event_stream` – decoded inbound JSON objects, in arrival order. The
///   stream keeps running across reconnects and ends only when the link is
///   shut down for good.
///
/// * `send` – write one command object. Fails with
///   [`BridgeError::NotConnected`] while the connection is down.
///
/// * `is_connected` – whether `send` can currently succeed.
#[async_trait]
pub trait RadioLink: Send + Sync {
    /// Write one command object to the radio application.
    async fn send(&self, command: &Value) -> Result<(), BridgeError>;

    /// Whether a connection is currently established.
    fn is_connected(&self) -> bool;

    /// Take the stream of inbound events.
    async fn event_stream(&self) -> BoxStream<'static, Value>;
}

/// Publish/subscribe bus used to fan radio events out to many clients.
#[async_trait]
pub trait BusLink: Send + Sync {
    /// Publish `payload` on `topic`. Returns the number of local receivers
    /// (zero is not an error).
    async fn publish(&self, topic: &str, payload: Value) -> Result<usize, BridgeError>;

    /// Subscribe to every message whose topic matches `filter` and yield its
    /// payload.
    async fn command_stream(&self, filter: &str) -> Result<BoxStream<'static, Value>, BridgeError>;
}
