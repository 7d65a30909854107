//! Entry point owning the client registry

use crate::client::{Client, ClientBuilder};
use crate::registry::{ClientIdentity, ClientRegistry};
use crate::transport::{EventSink, RumqttcTransportFactory, TransportFactory};
use std::fmt;
use std::sync::Arc;

/// Creates clients and owns the registry they are tracked in
///
/// Engines are independent: a client built by one engine is never visible
/// to another.
#[derive(Clone)]
pub struct MqttEngine {
    registry: Arc<ClientRegistry>,
    transports: Arc<dyn TransportFactory>,
}

impl MqttEngine {
    /// Engine whose clients talk to real brokers over rumqttc
    pub fn new() -> Self {
        Self::with_transport_factory(Arc::new(RumqttcTransportFactory))
    }

    /// Engine whose clients use transports from `transports`
    pub fn with_transport_factory(transports: Arc<dyn TransportFactory>) -> Self {
        Self {
            registry: Arc::new(ClientRegistry::new()),
            transports,
        }
    }

    /// Start configuring a client for `server`
    pub fn new_builder(&self, server: impl Into<String>) -> ClientBuilder {
        ClientBuilder::new(
            server,
            Arc::clone(&self.registry),
            Arc::clone(&self.transports),
        )
    }

    pub fn registry(&self) -> &Arc<ClientRegistry> {
        &self.registry
    }

    /// Live client registered under `identity`
    pub fn client(&self, identity: ClientIdentity) -> Option<Client> {
        self.registry.lookup(identity)
    }

    /// Sink delivering events to whichever client owns `identity`
    pub fn event_sink(&self, identity: ClientIdentity) -> EventSink {
        EventSink::for_identity(identity, &self.registry)
    }
}

impl Default for MqttEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for MqttEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MqttEngine")
            .field("clients", &self.registry.len())
            .finish()
    }
}
