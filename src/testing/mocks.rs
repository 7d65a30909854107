//! Mock implementations for testing
//!
//! Provides a broker-free [`Transport`], a factory handing those transports
//! out per client, and a [`Callback`] that records everything it is told.

use crate::client::{Callback, Client};
use crate::config::ClientConfig;
use crate::error::{EngineError, EngineResult};
use crate::registry::ClientIdentity;
use crate::routing::topic_matches;
use crate::transport::{
    EventSink, InboundEvent, Message, OutboundPacket, QoS, RequestKind, Transport, TransportFactory,
};
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::Duration;
use tokio::sync::{watch, Mutex};

/// How a [`MockTransport`] answers
#[derive(Debug, Clone)]
pub struct MockBehavior {
    /// Handshake outcome reported on every dial; `None` never answers
    pub connack: Option<EngineResult<()>>,
    /// Acknowledge every request as soon as it is sent
    pub auto_ack: bool,
    /// Highest QoS granted to subscriptions
    pub max_grant: QoS,
    /// Every send fails
    pub fail_sends: bool,
    /// Publishes on a topic the mock is subscribed to come back as messages;
    /// the mock keeps its subscriptions across dials unless the session is clean
    pub loopback: bool,
}

impl Default for MockBehavior {
    fn default() -> Self {
        Self {
            connack: Some(Ok(())),
            auto_ack: true,
            max_grant: QoS::ExactlyOnce,
            fail_sends: false,
            loopback: true,
        }
    }
}

/// Mock transport for testing
///
/// Events are emitted before `dial`/`send` return, so they reach the client's
/// queue in a deterministic order.
#[derive(Debug)]
pub struct MockTransport {
    identity: ClientIdentity,
    behavior: StdMutex<MockBehavior>,
    sink: Mutex<Option<EventSink>>,
    pub sent_packets: Arc<Mutex<Vec<OutboundPacket>>>,
    pub closes: Arc<Mutex<Vec<bool>>>,
    subscriptions: Mutex<Vec<String>>,
    dials: AtomicUsize,
}

impl MockTransport {
    pub fn new(identity: ClientIdentity) -> Self {
        Self::with_behavior(identity, MockBehavior::default())
    }

    pub fn with_behavior(identity: ClientIdentity, behavior: MockBehavior) -> Self {
        Self {
            identity,
            behavior: StdMutex::new(behavior),
            sink: Mutex::new(None),
            sent_packets: Arc::new(Mutex::new(Vec::new())),
            closes: Arc::new(Mutex::new(Vec::new())),
            subscriptions: Mutex::new(Vec::new()),
            dials: AtomicUsize::new(0),
        }
    }

    pub fn identity(&self) -> ClientIdentity {
        self.identity
    }

    fn behavior(&self) -> MockBehavior {
        self.behavior
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Change how later dials and sends are answered
    pub fn update_behavior(&self, update: impl FnOnce(&mut MockBehavior)) {
        let mut behavior = self.behavior.lock().unwrap_or_else(PoisonError::into_inner);
        update(&mut *behavior);
    }

    pub fn dial_count(&self) -> usize {
        self.dials.load(Ordering::SeqCst)
    }

    pub async fn get_sent_packets(&self) -> Vec<OutboundPacket> {
        self.sent_packets.lock().await.clone()
    }

    pub async fn get_sent_of_kind(&self, kind: RequestKind) -> Vec<OutboundPacket> {
        self.sent_packets
            .lock()
            .await
            .iter()
            .filter(|p| p.kind() == kind)
            .cloned()
            .collect()
    }

    pub async fn get_closes(&self) -> Vec<bool> {
        self.closes.lock().await.clone()
    }

    /// Emit an event through the sink of the latest dial
    pub async fn inject(&self, event: InboundEvent) -> bool {
        let sink = self.sink.lock().await.clone();
        match sink {
            Some(sink) => sink.emit(event).await,
            None => false,
        }
    }

    /// Simulate the broker dropping the session
    pub async fn lose_connection(&self, reason: &str) -> bool {
        self.inject(InboundEvent::Lost(EngineError::lost(reason)))
            .await
    }

    /// Simulate a message arriving from the broker
    pub async fn deliver(&self, topic: &str, qos: QoS, payload: impl Into<Bytes>) -> bool {
        self.inject(InboundEvent::Message(Message::new(topic, qos, payload)))
            .await
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn dial(&self, config: &ClientConfig, sink: EventSink) -> EngineResult<()> {
        self.dials.fetch_add(1, Ordering::SeqCst);
        if config.clean_session {
            self.subscriptions.lock().await.clear();
        }
        *self.sink.lock().await = Some(sink.clone());

        if let Some(result) = self.behavior().connack {
            sink.emit(InboundEvent::ConnAck(result)).await;
        }
        Ok(())
    }

    async fn send(&self, packet: OutboundPacket) -> EngineResult<()> {
        let behavior = self.behavior();
        if behavior.fail_sends {
            return Err(EngineError::operation("Mock send failure"));
        }
        if self.sink.lock().await.is_none() {
            return Err(EngineError::operation("Mock transport not dialed"));
        }
        self.sent_packets.lock().await.push(packet.clone());

        if !behavior.auto_ack {
            return Ok(());
        }

        let token = Some(packet.token());
        match packet {
            OutboundPacket::Publish {
                topic,
                qos,
                retain,
                payload,
                ..
            } => {
                self.inject(InboundEvent::PubResult {
                    topic: topic.clone(),
                    token,
                    result: Ok(()),
                })
                .await;

                let echoed = behavior.loopback
                    && self
                        .subscriptions
                        .lock()
                        .await
                        .iter()
                        .any(|filter| topic_matches(filter, &topic));
                if echoed {
                    self.inject(InboundEvent::Message(Message {
                        topic,
                        qos,
                        retain,
                        payload,
                    }))
                    .await;
                }
            }
            OutboundPacket::Subscribe { filter, qos, .. } => {
                self.subscriptions.lock().await.push(filter.clone());
                self.inject(InboundEvent::SubResult {
                    topic: filter,
                    token,
                    result: Ok(qos.min(behavior.max_grant)),
                })
                .await;
            }
            OutboundPacket::Unsubscribe { filter, .. } => {
                self.subscriptions.lock().await.retain(|f| f != &filter);
                self.inject(InboundEvent::UnsubResult {
                    topic: filter,
                    token,
                    result: Ok(()),
                })
                .await;
            }
        }
        Ok(())
    }

    async fn close(&self, force: bool) {
        self.closes.lock().await.push(force);
    }

    fn name(&self) -> &'static str {
        "mock"
    }
}

/// Hands out one [`MockTransport`] per client and keeps them for inspection
#[derive(Debug, Default)]
pub struct MockTransportFactory {
    behavior: MockBehavior,
    transports: StdMutex<HashMap<ClientIdentity, Arc<MockTransport>>>,
}

impl MockTransportFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_behavior(behavior: MockBehavior) -> Self {
        Self {
            behavior,
            transports: StdMutex::new(HashMap::new()),
        }
    }

    /// The transport created for `identity`
    pub fn transport(&self, identity: ClientIdentity) -> Option<Arc<MockTransport>> {
        self.transports
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&identity)
            .cloned()
    }
}

impl TransportFactory for MockTransportFactory {
    fn create(&self, identity: ClientIdentity) -> Arc<dyn Transport> {
        let transport = Arc::new(MockTransport::with_behavior(
            identity,
            self.behavior.clone(),
        ));
        self.transports
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(identity, Arc::clone(&transport));
        transport
    }
}

/// One callback or handler invocation
#[derive(Debug, Clone, PartialEq)]
pub enum Recorded {
    Connect(EngineResult<()>),
    Lost(EngineError),
    Publish {
        topic: String,
        result: EngineResult<()>,
    },
    Subscribe {
        topic: String,
        result: EngineResult<QoS>,
    },
    Unsubscribe {
        topic: String,
        result: EngineResult<()>,
    },
    PersistError(EngineError),
    Message {
        topic: String,
        qos: QoS,
        payload: Bytes,
    },
}

impl Recorded {
    pub fn name(&self) -> &'static str {
        match self {
            Recorded::Connect(_) => "connect",
            Recorded::Lost(_) => "lost",
            Recorded::Publish { .. } => "publish",
            Recorded::Subscribe { .. } => "subscribe",
            Recorded::Unsubscribe { .. } => "unsubscribe",
            Recorded::PersistError(_) => "persist_error",
            Recorded::Message { .. } => "message",
        }
    }
}

/// Callback that records every invocation in order
#[derive(Debug, Clone)]
pub struct RecordingCallback {
    events: Arc<StdMutex<Vec<Recorded>>>,
    count_tx: Arc<watch::Sender<usize>>,
}

impl Default for RecordingCallback {
    fn default() -> Self {
        Self::new()
    }
}

impl RecordingCallback {
    pub fn new() -> Self {
        let (count_tx, _) = watch::channel(0);
        Self {
            events: Arc::new(StdMutex::new(Vec::new())),
            count_tx: Arc::new(count_tx),
        }
    }

    fn record(&self, event: Recorded) {
        let count = {
            let mut events = self.events.lock().unwrap_or_else(PoisonError::into_inner);
            events.push(event);
            events.len()
        };
        self.count_tx.send_replace(count);
    }

    pub fn events(&self) -> Vec<Recorded> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.events().iter().map(Recorded::name).collect()
    }

    /// Topic handler that records messages into the same log
    pub fn handler(&self) -> impl Fn(&Client, &Message) + Send + Sync + 'static {
        let recorder = self.clone();
        move |_client: &Client, message: &Message| {
            recorder.record(Recorded::Message {
                topic: message.topic.clone(),
                qos: message.qos,
                payload: message.payload.clone(),
            })
        }
    }

    /// Wait until at least `count` events were recorded, returning them
    pub async fn wait_for_events(&self, count: usize, timeout: Duration) -> Vec<Recorded> {
        let mut count_rx = self.count_tx.subscribe();
        let _ = tokio::time::timeout(timeout, count_rx.wait_for(|n| *n >= count)).await;
        self.events()
    }
}

impl Callback for RecordingCallback {
    fn on_connect(&self, _client: &Client, _server: &str, result: &EngineResult<()>) {
        self.record(Recorded::Connect(result.clone()));
    }

    fn on_lost(&self, _client: &Client, _server: &str, error: &EngineError) {
        self.record(Recorded::Lost(error.clone()));
    }

    fn on_publish(&self, _client: &Client, topic: &str, result: &EngineResult<()>) {
        self.record(Recorded::Publish {
            topic: topic.to_string(),
            result: result.clone(),
        });
    }

    fn on_subscribe(&self, _client: &Client, topic: &str, result: &EngineResult<QoS>) {
        self.record(Recorded::Subscribe {
            topic: topic.to_string(),
            result: result.clone(),
        });
    }

    fn on_unsubscribe(&self, _client: &Client, topic: &str, result: &EngineResult<()>) {
        self.record(Recorded::Unsubscribe {
            topic: topic.to_string(),
            result: result.clone(),
        });
    }

    fn on_persist_error(&self, _client: &Client, error: &EngineError) {
        self.record(Recorded::PersistError(error.clone()));
    }
}
