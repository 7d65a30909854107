//! Transport layer for the client engine
//!
//! The engine never encodes MQTT packets itself. A [`Transport`] owns one
//! network session at a time: it dials, writes [`OutboundPacket`]s and reports
//! everything the broker says back through an [`EventSink`]. The sink routes
//! each [`InboundEvent`] through the client registry, so a transport never
//! holds a reference to the client it serves.

use crate::config::ClientConfig;
use crate::error::{EngineError, EngineResult};
use crate::registry::{ClientIdentity, ClientRegistry};
use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::{Arc, Weak};
use tracing::trace;

pub mod mqtt;
pub mod tls;

pub use mqtt::RumqttcTransport;

/// MQTT delivery guarantee
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(try_from = "u8", into = "u8")]
pub enum QoS {
    #[default]
    AtMostOnce = 0,
    AtLeastOnce = 1,
    ExactlyOnce = 2,
}

impl QoS {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(QoS::AtMostOnce),
            1 => Some(QoS::AtLeastOnce),
            2 => Some(QoS::ExactlyOnce),
            _ => None,
        }
    }

    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

impl TryFrom<u8> for QoS {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        QoS::from_u8(value).ok_or_else(|| format!("QoS must be 0, 1 or 2, got {value}"))
    }
}

impl From<QoS> for u8 {
    fn from(qos: QoS) -> Self {
        qos.as_u8()
    }
}

impl fmt::Display for QoS {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_u8())
    }
}

/// CONNACK return codes (MQTT 3.1.1 section 3.2.2.3)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnAckCode {
    Accepted,
    BadProtocolVersion,
    IdentifierRejected,
    ServerUnavailable,
    BadCredentials,
    NotAuthorized,
}

impl ConnAckCode {
    pub fn from_u8(code: u8) -> Option<Self> {
        match code {
            0 => Some(Self::Accepted),
            1 => Some(Self::BadProtocolVersion),
            2 => Some(Self::IdentifierRejected),
            3 => Some(Self::ServerUnavailable),
            4 => Some(Self::BadCredentials),
            5 => Some(Self::NotAuthorized),
            _ => None,
        }
    }

    pub fn as_u8(self) -> u8 {
        match self {
            Self::Accepted => 0,
            Self::BadProtocolVersion => 1,
            Self::IdentifierRejected => 2,
            Self::ServerUnavailable => 3,
            Self::BadCredentials => 4,
            Self::NotAuthorized => 5,
        }
    }
}

impl fmt::Display for ConnAckCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Self::Accepted => "accepted",
            Self::BadProtocolVersion => "unacceptable protocol version",
            Self::IdentifierRejected => "identifier rejected",
            Self::ServerUnavailable => "server unavailable",
            Self::BadCredentials => "bad user name or password",
            Self::NotAuthorized => "not authorized",
        };
        write!(f, "code {}: {}", self.as_u8(), text)
    }
}

/// Correlates an outbound request with its acknowledgment
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RequestToken(pub u64);

impl fmt::Display for RequestToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Kind of acknowledged request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RequestKind {
    Publish,
    Subscribe,
    Unsubscribe,
}

impl fmt::Display for RequestKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RequestKind::Publish => write!(f, "publish"),
            RequestKind::Subscribe => write!(f, "subscribe"),
            RequestKind::Unsubscribe => write!(f, "unsubscribe"),
        }
    }
}

/// An application message received from the broker
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub topic: String,
    pub qos: QoS,
    pub retain: bool,
    pub payload: Bytes,
}

impl Message {
    pub fn new(topic: impl Into<String>, qos: QoS, payload: impl Into<Bytes>) -> Self {
        Self {
            topic: topic.into(),
            qos,
            retain: false,
            payload: payload.into(),
        }
    }

    /// Payload as UTF-8 text, lossy
    pub fn payload_str(&self) -> std::borrow::Cow<'_, str> {
        String::from_utf8_lossy(&self.payload)
    }
}

/// A request the engine hands to the transport
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutboundPacket {
    Publish {
        token: RequestToken,
        topic: String,
        qos: QoS,
        retain: bool,
        payload: Bytes,
    },
    Subscribe {
        token: RequestToken,
        filter: String,
        qos: QoS,
    },
    Unsubscribe {
        token: RequestToken,
        filter: String,
    },
}

impl OutboundPacket {
    pub fn token(&self) -> RequestToken {
        match self {
            OutboundPacket::Publish { token, .. }
            | OutboundPacket::Subscribe { token, .. }
            | OutboundPacket::Unsubscribe { token, .. } => *token,
        }
    }

    pub fn topic(&self) -> &str {
        match self {
            OutboundPacket::Publish { topic, .. } => topic,
            OutboundPacket::Subscribe { filter, .. } | OutboundPacket::Unsubscribe { filter, .. } => {
                filter
            }
        }
    }

    pub fn kind(&self) -> RequestKind {
        match self {
            OutboundPacket::Publish { .. } => RequestKind::Publish,
            OutboundPacket::Subscribe { .. } => RequestKind::Subscribe,
            OutboundPacket::Unsubscribe { .. } => RequestKind::Unsubscribe,
        }
    }

    pub fn qos(&self) -> QoS {
        match self {
            OutboundPacket::Publish { qos, .. } | OutboundPacket::Subscribe { qos, .. } => *qos,
            OutboundPacket::Unsubscribe { .. } => QoS::AtMostOnce,
        }
    }

    /// The result event reporting that this request failed
    pub fn into_failure(self, error: EngineError) -> InboundEvent {
        let token = Some(self.token());
        match self {
            OutboundPacket::Publish { topic, .. } => InboundEvent::PubResult {
                topic,
                token,
                result: Err(error),
            },
            OutboundPacket::Subscribe { filter, .. } => InboundEvent::SubResult {
                topic: filter,
                token,
                result: Err(error),
            },
            OutboundPacket::Unsubscribe { filter, .. } => InboundEvent::UnsubResult {
                topic: filter,
                token,
                result: Err(error),
            },
        }
    }
}

/// Everything a transport can report about its session
#[derive(Debug, Clone, PartialEq)]
pub enum InboundEvent {
    ConnAck(EngineResult<()>),
    Lost(EngineError),
    PubResult {
        topic: String,
        token: Option<RequestToken>,
        result: EngineResult<()>,
    },
    SubResult {
        topic: String,
        token: Option<RequestToken>,
        result: EngineResult<QoS>,
    },
    UnsubResult {
        topic: String,
        token: Option<RequestToken>,
        result: EngineResult<()>,
    },
    PersistError(EngineError),
    Message(Message),
}

impl InboundEvent {
    pub fn name(&self) -> &'static str {
        match self {
            InboundEvent::ConnAck(_) => "conn_ack",
            InboundEvent::Lost(_) => "lost",
            InboundEvent::PubResult { .. } => "pub_result",
            InboundEvent::SubResult { .. } => "sub_result",
            InboundEvent::UnsubResult { .. } => "unsub_result",
            InboundEvent::PersistError(_) => "persist_error",
            InboundEvent::Message(_) => "message",
        }
    }
}

/// Delivers transport events to whichever client currently owns `identity`
///
/// The sink resolves the client through the registry on every emit. Events
/// for a client that has been destroyed, or for an identity that was never
/// registered, are dropped.
#[derive(Clone)]
pub struct EventSink {
    identity: ClientIdentity,
    attempt: Option<u64>,
    registry: Weak<ClientRegistry>,
}

impl EventSink {
    pub(crate) fn new(
        identity: ClientIdentity,
        attempt: Option<u64>,
        registry: Weak<ClientRegistry>,
    ) -> Self {
        Self {
            identity,
            attempt,
            registry,
        }
    }

    /// Sink that is not tied to a particular connection attempt
    pub fn for_identity(identity: ClientIdentity, registry: &Arc<ClientRegistry>) -> Self {
        Self::new(identity, None, Arc::downgrade(registry))
    }

    pub fn identity(&self) -> ClientIdentity {
        self.identity
    }

    pub fn attempt(&self) -> Option<u64> {
        self.attempt
    }

    /// Hand an event to the owning client's dispatcher
    ///
    /// Returns `false` when no live client owns this identity any more.
    pub async fn emit(&self, event: InboundEvent) -> bool {
        let Some(registry) = self.registry.upgrade() else {
            trace!(client = %self.identity, event = event.name(), "registry gone, dropping event");
            return false;
        };

        match registry.lookup(self.identity) {
            Some(client) => client.shared.deliver(self.attempt, event).await,
            None => {
                trace!(client = %self.identity, event = event.name(), "no live client, dropping event");
                false
            }
        }
    }
}

impl fmt::Debug for EventSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventSink")
            .field("identity", &self.identity)
            .field("attempt", &self.attempt)
            .finish()
    }
}

/// Network session abstraction
///
/// Implementations report the handshake outcome, acknowledgments and incoming
/// messages through the [`EventSink`] given to `dial`. A returned error from
/// `dial` means the attempt failed before any network exchange.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Start a new session, replacing any previous one
    async fn dial(&self, config: &ClientConfig, sink: EventSink) -> EngineResult<()>;

    /// Write one request on the current session
    async fn send(&self, packet: OutboundPacket) -> EngineResult<()>;

    /// Close the current session; graceful close sends DISCONNECT first
    async fn close(&self, force: bool);

    fn name(&self) -> &'static str;
}

/// Creates one transport per client
pub trait TransportFactory: Send + Sync {
    fn create(&self, identity: ClientIdentity) -> Arc<dyn Transport>;
}

/// Factory for the rumqttc-backed transport
#[derive(Debug, Default, Clone, Copy)]
pub struct RumqttcTransportFactory;

impl TransportFactory for RumqttcTransportFactory {
    fn create(&self, identity: ClientIdentity) -> Arc<dyn Transport> {
        Arc::new(RumqttcTransport::new(identity))
    }
}
