//! The `Client` handle and the state it shares with its tasks

use super::callback::{Callback, TopicHandler};
use super::dispatcher::{run_dispatcher, run_writer};
use super::lock;
use super::state::{
    interruptible_sleep, ConnectionEvent, ConnectionMachine, ConnectionState, ReconnectionDecision,
};
use crate::config::ClientConfig;
use crate::error::{EngineError, EngineResult};
use crate::persist::PersistStore;
use crate::registry::{ClientIdentity, ClientRegistry};
use crate::routing::{validate_topic_filter, validate_topic_name, Subscription, TopicDispatchTable};
use crate::transport::{
    EventSink, InboundEvent, Message, OutboundPacket, QoS, RequestKind, RequestToken, Transport,
};
use bytes::Bytes;
use regex::Regex;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock, Weak};
use std::time::Duration;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::watch;
use tracing::{debug, info, warn, Instrument};

/// Work items for the dispatcher task
pub(crate) enum Delivery {
    /// From a transport (stamped with its dial attempt) or from the engine itself
    Event {
        attempt: Option<u64>,
        event: InboundEvent,
    },
    DialTimeout {
        attempt: u64,
    },
    Redial {
        retry: u32,
    },
    Shutdown,
}

/// An acknowledged request still waiting for its result
#[derive(Debug, Clone)]
pub(crate) struct InFlight {
    pub kind: RequestKind,
    pub topic: String,
    pub qos: QoS,
}

pub(crate) struct Lifecycle {
    pub state: ConnectionState,
    /// Id of the latest dial; events stamped with an older id are stale
    pub attempt: u64,
    pub attempt_resolved: bool,
    /// Consecutive failed reconnects
    pub retries: u32,
    pub in_flight: BTreeMap<RequestToken, InFlight>,
}

impl Lifecycle {
    fn new() -> Self {
        Self {
            state: ConnectionState::Disconnected,
            attempt: 0,
            attempt_resolved: true,
            retries: 0,
            in_flight: BTreeMap::new(),
        }
    }

    pub fn begin_attempt(&mut self) -> u64 {
        self.attempt += 1;
        self.attempt_resolved = false;
        self.attempt
    }

    /// Whether a handshake outcome for `attempt` is still awaited
    pub fn awaits_handshake(&self, attempt: Option<u64>) -> bool {
        self.state.is_dialing()
            && !self.attempt_resolved
            && attempt.map_or(true, |a| a == self.attempt)
    }

    /// Remove the request a result belongs to: by token, else oldest with the same topic
    pub fn take(
        &mut self,
        kind: RequestKind,
        token: Option<RequestToken>,
        topic: &str,
    ) -> Option<(RequestToken, InFlight)> {
        let key = token
            .filter(|t| self.in_flight.get(t).is_some_and(|op| op.kind == kind))
            .or_else(|| {
                self.in_flight
                    .iter()
                    .find(|(_, op)| op.kind == kind && op.topic == topic)
                    .map(|(t, _)| *t)
            })?;
        self.in_flight.remove(&key).map(|op| (key, op))
    }
}

/// State shared by a client's handles, its tasks and the registry
pub(crate) struct ClientShared {
    pub identity: ClientIdentity,
    pub config: ClientConfig,
    pub transport: Arc<dyn Transport>,
    pub store: Arc<dyn PersistStore>,
    pub registry: Weak<ClientRegistry>,
    pub lifecycle: Mutex<Lifecycle>,
    pub table: Mutex<TopicDispatchTable>,
    callback: RwLock<Option<Arc<dyn Callback>>>,
    /// Store problems found while building, reported once a callback is set
    startup_errors: Mutex<Vec<EngineError>>,
    next_token: AtomicU64,
    inbound_tx: mpsc::Sender<Delivery>,
    outbound_tx: mpsc::Sender<OutboundPacket>,
    state_tx: watch::Sender<ConnectionState>,
    pub shutdown_tx: watch::Sender<bool>,
    in_flight_tx: watch::Sender<usize>,
}

impl ClientShared {
    /// Queue an event from a transport; false once the dispatcher is gone
    pub async fn deliver(&self, attempt: Option<u64>, event: InboundEvent) -> bool {
        self.inbound_tx
            .send(Delivery::Event { attempt, event })
            .await
            .is_ok()
    }

    pub async fn enqueue(&self, delivery: Delivery) {
        let _ = self.inbound_tx.send(delivery).await;
    }

    /// Queue from synchronous code without blocking the caller
    pub fn enqueue_detached(self: &Arc<Self>, delivery: Delivery) {
        match self.inbound_tx.try_send(delivery) {
            Ok(()) => {}
            Err(TrySendError::Full(delivery)) => {
                let shared = Arc::clone(self);
                tokio::spawn(async move { shared.enqueue(delivery).await });
            }
            Err(TrySendError::Closed(_)) => {
                debug!(client = %self.identity, "dispatcher stopped, dropping delivery");
            }
        }
    }

    pub fn callback(&self) -> Option<Arc<dyn Callback>> {
        self.callback
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn next_token(&self) -> RequestToken {
        RequestToken(self.next_token.fetch_add(1, Ordering::Relaxed))
    }

    pub fn state(&self) -> ConnectionState {
        self.state_tx.borrow().clone()
    }

    /// Apply a lifecycle event; returns false if it does not apply in the current state
    pub fn transition(&self, lc: &mut Lifecycle, event: &ConnectionEvent) -> bool {
        match ConnectionMachine::determine_next_state(&lc.state, event) {
            Some(next) => {
                ConnectionMachine::log_state_transition(
                    &self.identity.to_string(),
                    &lc.state,
                    &next,
                );
                lc.state = next.clone();
                self.state_tx.send_replace(next);
                true
            }
            None => false,
        }
    }

    pub fn track(&self, lc: &mut Lifecycle, packet: &OutboundPacket) {
        lc.in_flight.insert(
            packet.token(),
            InFlight {
                kind: packet.kind(),
                topic: packet.topic().to_string(),
                qos: packet.qos(),
            },
        );
        self.in_flight_tx.send_replace(lc.in_flight.len());
    }

    pub fn take(
        &self,
        lc: &mut Lifecycle,
        kind: RequestKind,
        token: Option<RequestToken>,
        topic: &str,
    ) -> Option<(RequestToken, InFlight)> {
        let taken = lc.take(kind, token, topic);
        self.in_flight_tx.send_replace(lc.in_flight.len());
        taken
    }

    pub fn sync_in_flight(&self, lc: &Lifecycle) {
        self.in_flight_tx.send_replace(lc.in_flight.len());
    }

    pub fn clear_in_flight(&self, lc: &mut Lifecycle) -> BTreeMap<RequestToken, InFlight> {
        let drained = std::mem::take(&mut lc.in_flight);
        self.in_flight_tx.send_replace(0);
        drained
    }

    /// Error for an operation attempted in the wrong state
    pub fn state_error(state: &ConnectionState) -> EngineError {
        if state.is_shutting_down() {
            EngineError::AlreadyDestroyed
        } else {
            EngineError::InvalidState {
                state: state.clone(),
            }
        }
    }

    pub fn reconnect_decision(&self, retries: u32) -> ReconnectionDecision {
        self.config.reconnect.should_attempt_reconnection(
            retries,
            self.config.keepalive_factor,
            *self.shutdown_tx.borrow(),
        )
    }

    /// Hand a request to the writer task, failing it through the callback if the queue is full
    pub fn submit(self: &Arc<Self>, packet: OutboundPacket) {
        match self.outbound_tx.try_send(packet) {
            Ok(()) => {}
            Err(TrySendError::Full(packet)) => {
                warn!(client = %self.identity, topic = packet.topic(), "send buffer full");
                self.fail_detached(packet, EngineError::operation("send buffer full"));
            }
            Err(TrySendError::Closed(packet)) => {
                self.fail_detached(packet, EngineError::operation("client writer stopped"));
            }
        }
    }

    pub fn fail_detached(self: &Arc<Self>, packet: OutboundPacket, error: EngineError) {
        self.enqueue_detached(Delivery::Event {
            attempt: None,
            event: packet.into_failure(error),
        });
    }

    /// Dial in the background and arm the ConnAck timer for `attempt`
    pub fn start_dial(self: &Arc<Self>, attempt: u64) {
        let sink = EventSink::new(self.identity, Some(attempt), self.registry.clone());
        let shared = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(error) = shared.transport.dial(&shared.config, sink).await {
                debug!(client = %shared.identity, attempt, error = %error.description(), "dial failed");
                shared
                    .enqueue(Delivery::Event {
                        attempt: Some(attempt),
                        event: InboundEvent::ConnAck(Err(error)),
                    })
                    .await;
            }
        });

        let weak = Arc::downgrade(self);
        let shutdown_rx = self.shutdown_tx.subscribe();
        let timeout = self.config.dial_timeout();
        tokio::spawn(async move {
            if interruptible_sleep(shutdown_rx, timeout).await {
                if let Some(shared) = weak.upgrade() {
                    shared.enqueue(Delivery::DialTimeout { attempt }).await;
                }
            }
        });
    }

    pub fn schedule_redial(self: &Arc<Self>, retry: u32, delay: Duration) {
        info!(
            client = %self.identity,
            retry,
            max = ?self.config.reconnect.max_attempts,
            delay_ms = delay.as_millis() as u64,
            "scheduling reconnection"
        );
        let weak = Arc::downgrade(self);
        let shutdown_rx = self.shutdown_tx.subscribe();
        tokio::spawn(async move {
            if interruptible_sleep(shutdown_rx, delay).await {
                if let Some(shared) = weak.upgrade() {
                    shared.enqueue(Delivery::Redial { retry }).await;
                }
            }
        });
    }

    /// Wait until nothing is in flight or the drain timeout passes
    async fn drain_in_flight(&self) {
        let mut in_flight_rx = self.in_flight_tx.subscribe();
        let timeout = self.config.drain_timeout();
        let drained = tokio::time::timeout(timeout, in_flight_rx.wait_for(|count| *count == 0))
            .await
            .map(|result| result.is_ok())
            .unwrap_or(false);
        if !drained {
            warn!(
                client = %self.identity,
                pending = *self.in_flight_tx.borrow(),
                "drain timeout elapsed with requests in flight"
            );
        }
    }

    /// Closing -> Destroyed; the client leaves the registry
    pub fn finish_destroy(self: &Arc<Self>) {
        // leave the registry first so nothing observing Destroyed can still find us
        if let Some(registry) = self.registry.upgrade() {
            registry.remove(self.identity);
        }
        {
            let mut lc = lock(&self.lifecycle);
            self.clear_in_flight(&mut lc);
            self.transition(&mut lc, &ConnectionEvent::Closed);
        }
        self.enqueue_detached(Delivery::Shutdown);
        info!(client = %self.identity, "client destroyed");
    }
}

/// Handle to one MQTT client
///
/// Cheap to clone; every clone refers to the same client. Operations never
/// block: they queue work and return, and their outcome arrives through the
/// [`Callback`] set with [`Client::set_callback`]. Direct errors are only
/// returned for invalid input and for calls on a destroyed client.
#[derive(Clone)]
pub struct Client {
    pub(crate) shared: Arc<ClientShared>,
}

impl Client {
    pub(crate) fn spawn(
        identity: ClientIdentity,
        config: ClientConfig,
        transport: Arc<dyn Transport>,
        store: Arc<dyn PersistStore>,
        registry: Weak<ClientRegistry>,
        first_token: u64,
        store_error: Option<EngineError>,
    ) -> Self {
        let (inbound_tx, inbound_rx) = mpsc::channel(config.recv_buf);
        let (outbound_tx, outbound_rx) = mpsc::channel(config.send_buf);
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        let (shutdown_tx, _) = watch::channel(false);
        let (in_flight_tx, _) = watch::channel(0usize);

        let shared = Arc::new(ClientShared {
            identity,
            config,
            transport: Arc::clone(&transport),
            store: Arc::clone(&store),
            registry,
            lifecycle: Mutex::new(Lifecycle::new()),
            table: Mutex::new(TopicDispatchTable::new()),
            callback: RwLock::new(None),
            startup_errors: Mutex::new(store_error.into_iter().collect()),
            next_token: AtomicU64::new(first_token.max(1)),
            inbound_tx,
            outbound_tx,
            state_tx,
            shutdown_tx,
            in_flight_tx,
        });

        tokio::spawn(
            run_dispatcher(Arc::downgrade(&shared), inbound_rx)
                .instrument(crate::client_span!(client = %identity, task = "dispatcher")),
        );
        tokio::spawn(
            run_writer(Arc::downgrade(&shared), transport, store, outbound_rx)
                .instrument(crate::client_span!(client = %identity, task = "writer")),
        );

        Client { shared }
    }

    pub fn identity(&self) -> ClientIdentity {
        self.shared.identity
    }

    pub fn config(&self) -> &ClientConfig {
        &self.shared.config
    }

    pub fn server(&self) -> &str {
        &self.shared.config.server
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.state()
    }

    /// Current subscriptions and where each stands
    pub fn subscriptions(&self) -> Vec<Subscription> {
        lock(&self.shared.table).subscriptions()
    }

    /// Number of requests still waiting for an acknowledgment
    pub fn in_flight(&self) -> usize {
        lock(&self.shared.lifecycle).in_flight.len()
    }

    /// Replace the callback receiving operation results
    ///
    /// Until a callback is set, results are discarded. Persistence errors
    /// found while the client was built are delivered to the first callback.
    pub fn set_callback(&self, callback: impl Callback + 'static) -> EngineResult<()> {
        self.ensure_alive()?;
        *self
            .shared
            .callback
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(Arc::new(callback));

        let startup_errors = std::mem::take(&mut *lock(&self.shared.startup_errors));
        for error in startup_errors {
            self.shared.enqueue_detached(Delivery::Event {
                attempt: None,
                event: InboundEvent::PersistError(error),
            });
        }
        Ok(())
    }

    fn ensure_alive(&self) -> EngineResult<()> {
        if self.state().is_shutting_down() {
            return Err(EngineError::AlreadyDestroyed);
        }
        Ok(())
    }

    /// Start connecting; the outcome arrives through `on_connect`
    pub fn connect(&self) -> EngineResult<()> {
        let attempt = {
            let mut lc = lock(&self.shared.lifecycle);
            if !self
                .shared
                .transition(&mut lc, &ConnectionEvent::ConnectRequested)
            {
                return Err(ClientShared::state_error(&lc.state));
            }
            lc.retries = 0;
            lc.begin_attempt()
        };

        info!(client = %self.identity(), server = %self.server(), "connecting");
        self.shared.start_dial(attempt);
        Ok(())
    }

    /// Publish `payload` to `topic`; the outcome arrives through `on_publish`
    pub fn publish(&self, topic: &str, qos: QoS, payload: impl Into<Bytes>) -> EngineResult<()> {
        self.send_publish(topic, qos, false, payload.into())
    }

    /// Publish with the retain flag set
    pub fn publish_retained(
        &self,
        topic: &str,
        qos: QoS,
        payload: impl Into<Bytes>,
    ) -> EngineResult<()> {
        self.send_publish(topic, qos, true, payload.into())
    }

    fn send_publish(&self, topic: &str, qos: QoS, retain: bool, payload: Bytes) -> EngineResult<()> {
        validate_topic_name(topic).map_err(|e| e.into_engine_error(topic))?;

        let shared = &self.shared;
        let packet = OutboundPacket::Publish {
            token: shared.next_token(),
            topic: topic.to_string(),
            qos,
            retain,
            payload,
        };

        let connected = {
            let mut lc = lock(&shared.lifecycle);
            if lc.state.is_shutting_down() {
                return Err(EngineError::AlreadyDestroyed);
            }
            shared.track(&mut lc, &packet);
            lc.state.is_connected()
        };

        if connected {
            shared.submit(packet);
        } else {
            shared.fail_detached(packet, self.not_connected());
        }
        Ok(())
    }

    /// Subscribe to `filter`; the outcome arrives through `on_subscribe`
    pub fn subscribe(&self, filter: &str, qos: QoS) -> EngineResult<()> {
        validate_topic_filter(filter).map_err(|e| e.into_engine_error(filter))?;

        let shared = &self.shared;
        let packet = OutboundPacket::Subscribe {
            token: shared.next_token(),
            filter: filter.to_string(),
            qos,
        };

        let connected = {
            let mut lc = lock(&shared.lifecycle);
            if lc.state.is_shutting_down() {
                return Err(EngineError::AlreadyDestroyed);
            }
            shared.track(&mut lc, &packet);
            let connected = lc.state.is_connected();
            if connected {
                lock(&shared.table).subscribe(filter, qos);
            }
            connected
        };

        if connected {
            shared.submit(packet);
        } else {
            shared.fail_detached(packet, self.not_connected());
        }
        Ok(())
    }

    /// Unsubscribe from `filter`; the outcome arrives through `on_unsubscribe`
    pub fn unsubscribe(&self, filter: &str) -> EngineResult<()> {
        validate_topic_filter(filter).map_err(|e| e.into_engine_error(filter))?;

        let shared = &self.shared;
        let packet = OutboundPacket::Unsubscribe {
            token: shared.next_token(),
            filter: filter.to_string(),
        };

        let connected = {
            let mut lc = lock(&shared.lifecycle);
            if lc.state.is_shutting_down() {
                return Err(EngineError::AlreadyDestroyed);
            }
            shared.track(&mut lc, &packet);
            let connected = lc.state.is_connected();
            if connected {
                lock(&shared.table).begin_unsubscribe(filter);
            }
            connected
        };

        if connected {
            shared.submit(packet);
        } else {
            shared.fail_detached(packet, self.not_connected());
        }
        Ok(())
    }

    fn not_connected(&self) -> EngineError {
        EngineError::operation(format!("not connected ({})", self.state()))
    }

    /// Route messages matching `filter` to `handler`
    pub fn handle<F>(&self, filter: &str, handler: F) -> EngineResult<()>
    where
        F: Fn(&Client, &Message) + Send + Sync + 'static,
    {
        validate_topic_filter(filter).map_err(|e| e.into_engine_error(filter))?;
        self.ensure_alive()?;
        let handler: TopicHandler = Arc::new(handler);
        lock(&self.shared.table).handle(filter, handler);
        Ok(())
    }

    /// Route messages whose topic matches the regular expression `pattern`
    ///
    /// Pattern handlers subscribe nothing; they see whatever the session's
    /// subscriptions bring in, after the filter handlers.
    pub fn handle_regex<F>(&self, pattern: &str, handler: F) -> EngineResult<()>
    where
        F: Fn(&Client, &Message) + Send + Sync + 'static,
    {
        let regex =
            Regex::new(pattern).map_err(|e| EngineError::invalid_topic(pattern, e.to_string()))?;
        self.ensure_alive()?;
        lock(&self.shared.table).handle_pattern(regex, Arc::new(handler));
        Ok(())
    }

    /// Receive messages no filter or pattern handler matched
    pub fn handle_default<F>(&self, handler: F) -> EngineResult<()>
    where
        F: Fn(&Client, &Message) + Send + Sync + 'static,
    {
        self.ensure_alive()?;
        lock(&self.shared.table).set_fallback(Arc::new(handler));
        Ok(())
    }

    /// Shut the client down
    ///
    /// A forced destroy drops the connection at once and reports nothing
    /// further. A graceful destroy first waits, up to the configured drain
    /// timeout, for in-flight acknowledgments, then sends DISCONNECT. Only
    /// the first call has any effect.
    pub fn destroy(&self, force: bool) -> EngineResult<()> {
        let was_connected = {
            let mut lc = lock(&self.shared.lifecycle);
            let was_connected = lc.state.is_connected();
            if !self
                .shared
                .transition(&mut lc, &ConnectionEvent::CloseRequested)
            {
                return Err(EngineError::AlreadyDestroyed);
            }
            was_connected
        };
        self.shared.shutdown_tx.send_replace(true);
        info!(client = %self.identity(), force, "destroying client");

        let shared = Arc::clone(&self.shared);
        if force {
            shared.finish_destroy();
            tokio::spawn(async move { shared.transport.close(true).await });
        } else {
            tokio::spawn(async move {
                if was_connected {
                    shared.drain_in_flight().await;
                }
                shared.transport.close(false).await;
                shared.finish_destroy();
            });
        }
        Ok(())
    }

    /// Wait until the client is Disconnected or Destroyed, returning that state
    pub async fn wait(&self) -> ConnectionState {
        let mut state_rx = self.shared.state_tx.subscribe();
        let settled = state_rx
            .wait_for(|state| {
                matches!(
                    state,
                    ConnectionState::Disconnected | ConnectionState::Destroyed
                )
            })
            .await
            .map(|state| state.clone());
        settled.unwrap_or(ConnectionState::Destroyed)
    }
}

impl fmt::Debug for Client {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Client")
            .field("identity", &self.shared.identity)
            .field("server", &self.shared.config.server)
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn publish_op(topic: &str) -> InFlight {
        InFlight {
            kind: RequestKind::Publish,
            topic: topic.to_string(),
            qos: QoS::AtLeastOnce,
        }
    }

    #[test]
    fn test_take_prefers_token() {
        let mut lc = Lifecycle::new();
        lc.in_flight.insert(RequestToken(1), publish_op("a"));
        lc.in_flight.insert(RequestToken(2), publish_op("a"));

        let (token, _) = lc
            .take(RequestKind::Publish, Some(RequestToken(2)), "a")
            .unwrap();
        assert_eq!(token, RequestToken(2));
    }

    #[test]
    fn test_take_falls_back_to_oldest_same_topic() {
        let mut lc = Lifecycle::new();
        lc.in_flight.insert(RequestToken(5), publish_op("b"));
        lc.in_flight.insert(RequestToken(3), publish_op("a"));
        lc.in_flight.insert(RequestToken(4), publish_op("a"));

        let (token, op) = lc.take(RequestKind::Publish, None, "a").unwrap();
        assert_eq!(token, RequestToken(3));
        assert_eq!(op.topic, "a");
        assert!(lc.take(RequestKind::Subscribe, None, "a").is_none());
    }

    #[test]
    fn test_take_ignores_token_of_other_kind() {
        let mut lc = Lifecycle::new();
        lc.in_flight.insert(
            RequestToken(1),
            InFlight {
                kind: RequestKind::Subscribe,
                topic: "a".to_string(),
                qos: QoS::AtMostOnce,
            },
        );
        assert!(lc
            .take(RequestKind::Publish, Some(RequestToken(1)), "a")
            .is_none());
        assert_eq!(lc.in_flight.len(), 1);
    }

    #[test]
    fn test_handshake_expectations() {
        let mut lc = Lifecycle::new();
        assert!(!lc.awaits_handshake(None));

        lc.state = ConnectionState::Connecting;
        let attempt = lc.begin_attempt();
        assert!(lc.awaits_handshake(Some(attempt)));
        assert!(lc.awaits_handshake(None));
        assert!(!lc.awaits_handshake(Some(attempt + 1)));

        lc.attempt_resolved = true;
        assert!(!lc.awaits_handshake(Some(attempt)));
    }
}
