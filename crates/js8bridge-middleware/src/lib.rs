//! `js8bridge-middleware` – transports and collaborator seams
//!
//! Moves JSON between the radio application, the bridge core, and bus
//! clients without caring about the data's meaning.
//!
//! # Modules
//!
//! - [`adapter`] – the [`RadioLink`] and [`BusLink`] traits the bridge core
//!   is written against.
//! - [`bus`] – headless, topic-based publish/subscribe bus built on a Tokio
//!   broadcast channel, with MQTT-style topic filters.
//! - [`js8_link`] – self-reconnecting newline-delimited JSON client for the
//!   JS8Call TCP API.
//! - [`mqtt_bus`] – [`BusLink`] over an external MQTT broker.
//! - [`ws_gateway`] – WebSocket gateway that exposes the bus to external
//!   clients.

pub mod adapter;
pub mod bus;
pub mod js8_link;
pub mod mqtt_bus;
pub mod ws_gateway;

pub use adapter::{BusLink, RadioLink};
pub use bus::{CommandTaps, EventBus, TopicSubscriber, topic_matches, validate_filter};
pub use js8_link::{Js8Link, LinkConfig};
pub use mqtt_bus::{MqttBus, MqttConfig};
pub use ws_gateway::{BusGateway, ClientOp};
