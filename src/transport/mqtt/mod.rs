//! MQTT 3.1.1 transport built on rumqttc
//!
//! This module separates pure functions from I/O operations for better
//! testability.
//!
//! # Architecture
//!
//! - [`connection`] - Pure translation of `ClientConfig` into rumqttc options
//! - [`message_handler`] - Pure event routing and packet-id correlation
//! - [`client`] - Impure session management and the event loop task
//!
//! # Example
//!
//! ```rust
//! use mqtt_engine::registry::ClientIdentity;
//! use mqtt_engine::transport::{mqtt::RumqttcTransport, Transport};
//!
//! # tokio_test::block_on(async {
//! let transport = RumqttcTransport::new(ClientIdentity::new(1));
//! assert_eq!(transport.name(), "rumqttc");
//!
//! // Closing before the first dial does nothing
//! transport.close(true).await;
//! # });
//! ```

pub mod client;
pub mod connection;
pub mod message_handler;

pub use client::RumqttcTransport;
pub use connection::configure_mqtt_options;
pub use message_handler::{EventRoute, MessageHandler, PacketTracker};
