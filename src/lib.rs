//! MQTT Engine - client-side MQTT core
//!
//! An asynchronous MQTT 3.1.1 client engine: many independent clients, each
//! with its own connection state machine, topic dispatch table and callback,
//! all driven by a tokio runtime.
//!
//! # Overview
//!
//! This crate provides:
//! - A validated client configuration with a fluent builder
//! - A connection state machine with automatic reconnection
//! - Topic filter matching and per-filter message handlers
//! - A registry resolving transport events to live clients by identity
//! - In-order callback delivery per client
//! - Optional persistence of unacknowledged QoS 1/2 publishes
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use mqtt_engine::{Callback, Client, EngineResult, MqttEngine, QoS};
//!
//! struct Printer;
//!
//! impl Callback for Printer {
//!     fn on_connect(&self, _client: &Client, server: &str, result: &EngineResult<()>) {
//!         println!("connect {server}: {result:?}");
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> EngineResult<()> {
//!     let engine = MqttEngine::new();
//!     let client = engine
//!         .new_builder("mqtt://localhost:1883")
//!         .client_id("sensor-7")
//!         .clean_session(false)
//!         .build()?;
//!
//!     client.set_callback(Printer)?;
//!     client.handle("sensors/+/temperature", |_client, message| {
//!         println!("{} = {}", message.topic, message.payload_str());
//!     })?;
//!     client.connect()?;
//!     client.subscribe("sensors/+/temperature", QoS::AtLeastOnce)?;
//!
//!     client.destroy(false)?;
//!     client.wait().await;
//!     Ok(())
//! }
//! ```

pub mod client;
pub mod config;
pub mod engine;
pub mod error;
pub mod observability;
pub mod persist;
pub mod registry;
pub mod routing;
pub mod testing;
pub mod transport;

pub use client::{Callback, Client, ClientBuilder, ConnectionState, ReconnectConfig, TopicHandler};
pub use config::{ClientConfig, Credentials, LastWill, LogLevel, PersistConfig, TlsConfig};
pub use engine::MqttEngine;
pub use error::{ConnectionFailure, EngineError, EngineResult};
pub use registry::{ClientIdentity, ClientRegistry};
pub use routing::{topic_matches, Subscription, SubscriptionStatus};
pub use transport::{ConnAckCode, Message, QoS};
