//! Chained construction of a [`Client`]

use super::handle::Client;
use super::state::ReconnectConfig;
use crate::config::{
    ClientConfig, Credentials, LastWill, LogLevel, PersistConfig, TlsConfig, MAX_BUFFER_SIZE,
};
use crate::error::{EngineError, EngineResult};
use crate::persist::open_store;
use crate::registry::ClientRegistry;
use crate::transport::{QoS, TransportFactory};
use std::sync::Arc;
use tracing::{debug, info};

/// Keepalive factor used when a caller passes one that is not above 1
const FALLBACK_KEEPALIVE_FACTOR: f64 = 1.2;

/// Collects client settings; [`ClientBuilder::build`] consumes it
///
/// Obtained from [`MqttEngine::new_builder`](crate::MqttEngine::new_builder).
/// Setters never fail: everything is checked once in `build()`, which names
/// the first invalid field.
pub struct ClientBuilder {
    config: ClientConfig,
    registry: Arc<ClientRegistry>,
    transports: Arc<dyn TransportFactory>,
}

impl ClientBuilder {
    pub(crate) fn new(
        server: impl Into<String>,
        registry: Arc<ClientRegistry>,
        transports: Arc<dyn TransportFactory>,
    ) -> Self {
        Self {
            config: ClientConfig::new(server),
            registry,
            transports,
        }
    }

    /// Replace every setting with `config`, keeping nothing set so far
    pub fn config(mut self, config: ClientConfig) -> Self {
        self.config = config;
        self
    }

    pub fn client_id(mut self, client_id: impl Into<String>) -> Self {
        self.config.client_id = client_id.into();
        self
    }

    pub fn clean_session(mut self, clean: bool) -> Self {
        self.config.clean_session = clean;
        self
    }

    /// Keepalive interval and the backoff factor between reconnect attempts
    ///
    /// A factor that is not above 1 is replaced by 1.2.
    pub fn keepalive(mut self, secs: u16, factor: f64) -> Self {
        self.config.keepalive_secs = secs;
        self.config.keepalive_factor = if factor > 1.0 {
            factor
        } else {
            FALLBACK_KEEPALIVE_FACTOR
        };
        self
    }

    pub fn dial_timeout(mut self, secs: u16) -> Self {
        self.config.dial_timeout_secs = secs;
        self
    }

    pub fn credentials(mut self, username: impl Into<String>, password: Option<String>) -> Self {
        self.config.credentials = Some(Credentials::new(username, password));
        self
    }

    pub fn tls(mut self, tls: TlsConfig) -> Self {
        self.config.tls = Some(tls);
        self
    }

    pub fn will(
        mut self,
        topic: impl Into<String>,
        qos: QoS,
        retain: bool,
        payload: impl Into<Vec<u8>>,
    ) -> Self {
        self.config.will = Some(LastWill {
            topic: topic.into(),
            qos,
            retain,
            payload: payload.into(),
        });
        self
    }

    /// Outbound queue capacity, at most 1024
    pub fn send_buf(mut self, size: usize) -> Self {
        self.config.send_buf = size.min(MAX_BUFFER_SIZE);
        self
    }

    /// Inbound event queue capacity, at most 1024
    pub fn recv_buf(mut self, size: usize) -> Self {
        self.config.recv_buf = size.min(MAX_BUFFER_SIZE);
        self
    }

    /// Recorded for the application's logger setup; see [`ClientConfig::log_level`]
    pub fn log_level(mut self, level: LogLevel) -> Self {
        self.config.log_level = level;
        self
    }

    pub fn persist(mut self, persist: PersistConfig) -> Self {
        self.config.persist = persist;
        self
    }

    pub fn reconnect(mut self, reconnect: ReconnectConfig) -> Self {
        self.config.reconnect = reconnect;
        self
    }

    pub fn drain_timeout(mut self, secs: u16) -> Self {
        self.config.drain_timeout_secs = secs;
        self
    }

    /// Settings collected so far
    pub fn current_config(&self) -> &ClientConfig {
        &self.config
    }

    /// Validate, create the client and register it
    ///
    /// Must be called inside a Tokio runtime. On error nothing is registered.
    /// Persistence problems never fail the build: they are reported through
    /// `on_persist_error` once a callback is set.
    pub fn build(self) -> EngineResult<Client> {
        let ClientBuilder {
            config,
            registry,
            transports,
        } = self;

        config.validate()?;
        tokio::runtime::Handle::try_current()
            .map_err(|_| EngineError::operation("build() must be called inside a Tokio runtime"))?;

        let (store, store_error) = open_store(&config.persist);
        let first_token = store.last_token().map_or(1, |token| token.0 + 1);
        debug!(store = store.name(), first_token, "persistence store opened");

        let identity = registry.next_identity();
        let transport = transports.create(identity);
        let server = config.server.clone();
        let client = Client::spawn(
            identity,
            config,
            transport,
            store,
            Arc::downgrade(&registry),
            first_token,
            store_error,
        );
        registry.register(identity, client.clone())?;

        info!(client = %identity, server = %server, "client created");
        Ok(client)
    }
}
