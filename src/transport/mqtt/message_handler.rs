//! Pure message routing and request correlation for MQTT events
//!
//! rumqttc does not hand out packet ids when a request is queued; it reports
//! them later as outgoing events, in queue order. [`PacketTracker`] pairs each
//! queued request with its packet id and then with the broker's
//! acknowledgment.

use super::connection::from_wire_qos;
use crate::error::EngineError;
use crate::transport::{InboundEvent, Message, OutboundPacket, QoS, RequestKind, RequestToken};
use bytes::Bytes;
use rumqttc::{Event, Outgoing, Packet, SubscribeReasonCode};
use std::collections::{HashMap, VecDeque};
use tracing::{debug, trace};

/// Pure message routing decisions based on MQTT events
pub struct MessageHandler;

impl MessageHandler {
    /// Route MQTT event to appropriate handler (pure routing decision)
    pub fn route_mqtt_event(event: &Event) -> EventRoute {
        match event {
            Event::Incoming(incoming) => match incoming {
                Packet::ConnAck(_) => EventRoute::ConnectionAcknowledged,
                Packet::Publish(publish) => EventRoute::MessageReceived {
                    topic: publish.topic.clone(),
                    qos: from_wire_qos(publish.qos),
                    retain: publish.retain,
                    payload: publish.payload.clone(),
                },
                Packet::PubAck(ack) => EventRoute::Acknowledged {
                    kind: RequestKind::Publish,
                    packet_id: ack.pkid,
                },
                Packet::PubComp(comp) => EventRoute::Acknowledged {
                    kind: RequestKind::Publish,
                    packet_id: comp.pkid,
                },
                Packet::SubAck(suback) => EventRoute::SubscriptionAcknowledged {
                    packet_id: suback.pkid,
                    granted: suback.return_codes.first().and_then(|code| match code {
                        SubscribeReasonCode::Success(qos) => Some(from_wire_qos(*qos)),
                        SubscribeReasonCode::Failure => None,
                    }),
                },
                Packet::UnsubAck(unsuback) => EventRoute::Acknowledged {
                    kind: RequestKind::Unsubscribe,
                    packet_id: unsuback.pkid,
                },
                other => EventRoute::InfrastructureEvent(format!("{other:?}")),
            },
            Event::Outgoing(outgoing) => match outgoing {
                Outgoing::Publish(pkid) => EventRoute::RequestWritten {
                    kind: RequestKind::Publish,
                    packet_id: *pkid,
                },
                Outgoing::Subscribe(pkid) => EventRoute::RequestWritten {
                    kind: RequestKind::Subscribe,
                    packet_id: *pkid,
                },
                Outgoing::Unsubscribe(pkid) => EventRoute::RequestWritten {
                    kind: RequestKind::Unsubscribe,
                    packet_id: *pkid,
                },
                Outgoing::Disconnect => EventRoute::DisconnectSent,
                _ => EventRoute::OutgoingEvent,
            },
        }
    }
}

/// Routing decisions for MQTT events
#[derive(Debug, Clone, PartialEq)]
pub enum EventRoute {
    /// Connection acknowledged - ready to publish/subscribe
    ConnectionAcknowledged,
    /// Message received on a subscribed topic
    MessageReceived {
        topic: String,
        qos: QoS,
        retain: bool,
        payload: Bytes,
    },
    /// A queued request went out with this packet id
    RequestWritten { kind: RequestKind, packet_id: u16 },
    /// PUBACK, PUBCOMP or UNSUBACK
    Acknowledged { kind: RequestKind, packet_id: u16 },
    /// SUBACK; `None` when the broker refused the filter
    SubscriptionAcknowledged {
        packet_id: u16,
        granted: Option<QoS>,
    },
    /// Our DISCONNECT was written; the session is over
    DisconnectSent,
    /// Infrastructure event (PingResp, PubRec, etc.)
    InfrastructureEvent(String),
    /// Outgoing event handled entirely by rumqttc
    OutgoingEvent,
}

#[derive(Debug, Clone)]
struct PendingRequest {
    kind: RequestKind,
    token: RequestToken,
    topic: String,
    qos: QoS,
}

/// Correlates requests with packet ids and acknowledgments for one session
#[derive(Debug, Default)]
pub struct PacketTracker {
    queued: VecDeque<PendingRequest>,
    awaiting: HashMap<(RequestKind, u16), PendingRequest>,
}

impl PacketTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Remember a request about to be handed to rumqttc
    pub fn track(&mut self, packet: &OutboundPacket) {
        self.queued.push_back(PendingRequest {
            kind: packet.kind(),
            token: packet.token(),
            topic: packet.topic().to_string(),
            qos: packet.qos(),
        });
    }

    /// Forget a request rumqttc refused to queue
    pub fn untrack(&mut self, token: RequestToken) {
        if let Some(index) = self.queued.iter().rposition(|r| r.token == token) {
            self.queued.remove(index);
        }
    }

    /// Requests not yet resolved
    pub fn pending(&self) -> usize {
        self.queued.len() + self.awaiting.len()
    }

    /// Apply a routing decision, returning the events it resolves
    pub fn apply(&mut self, route: EventRoute) -> Option<InboundEvent> {
        match route {
            EventRoute::ConnectionAcknowledged => Some(InboundEvent::ConnAck(Ok(()))),
            EventRoute::MessageReceived {
                topic,
                qos,
                retain,
                payload,
            } => Some(InboundEvent::Message(Message {
                topic,
                qos,
                retain,
                payload,
            })),
            EventRoute::RequestWritten { kind, packet_id } => self.on_written(kind, packet_id),
            EventRoute::Acknowledged { kind, packet_id } => {
                let request = self.resolve(kind, packet_id)?;
                Some(Self::success(request))
            }
            EventRoute::SubscriptionAcknowledged { packet_id, granted } => {
                let request = self.resolve(RequestKind::Subscribe, packet_id)?;
                let result = granted
                    .ok_or_else(|| EngineError::operation("subscription rejected by server"));
                Some(InboundEvent::SubResult {
                    topic: request.topic,
                    token: Some(request.token),
                    result,
                })
            }
            EventRoute::InfrastructureEvent(description) => {
                trace!(%description, "infrastructure event");
                None
            }
            EventRoute::DisconnectSent | EventRoute::OutgoingEvent => None,
        }
    }

    fn on_written(&mut self, kind: RequestKind, packet_id: u16) -> Option<InboundEvent> {
        let Some(index) = self.queued.iter().position(|r| r.kind == kind) else {
            debug!(%kind, packet_id, "outgoing packet matches no queued request");
            return None;
        };
        let request = self.queued.remove(index)?;

        // QoS 0 publishes are complete once written
        if kind == RequestKind::Publish && request.qos == QoS::AtMostOnce {
            return Some(Self::success(request));
        }
        self.awaiting.insert((kind, packet_id), request);
        None
    }

    fn resolve(&mut self, kind: RequestKind, packet_id: u16) -> Option<PendingRequest> {
        let request = self.awaiting.remove(&(kind, packet_id));
        if request.is_none() {
            debug!(%kind, packet_id, "acknowledgment for unknown packet id");
        }
        request
    }

    fn success(request: PendingRequest) -> InboundEvent {
        let token = Some(request.token);
        let topic = request.topic;
        match request.kind {
            RequestKind::Publish => InboundEvent::PubResult {
                topic,
                token,
                result: Ok(()),
            },
            RequestKind::Subscribe => InboundEvent::SubResult {
                topic,
                token,
                result: Ok(request.qos),
            },
            RequestKind::Unsubscribe => InboundEvent::UnsubResult {
                topic,
                token,
                result: Ok(()),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rumqttc::{ConnAck, ConnectReturnCode, PubAck, Publish, QoS as WireQoS, SubAck};

    fn publish(token: u64, qos: QoS) -> OutboundPacket {
        OutboundPacket::Publish {
            token: RequestToken(token),
            topic: "sensors/temp".to_string(),
            qos,
            retain: false,
            payload: Bytes::from_static(b"21.5"),
        }
    }

    fn subscribe(token: u64) -> OutboundPacket {
        OutboundPacket::Subscribe {
            token: RequestToken(token),
            filter: "sensors/#".to_string(),
            qos: QoS::ExactlyOnce,
        }
    }

    #[test]
    fn test_route_mqtt_event() {
        let connack = Event::Incoming(Packet::ConnAck(ConnAck {
            session_present: false,
            code: ConnectReturnCode::Success,
        }));
        assert_eq!(
            MessageHandler::route_mqtt_event(&connack),
            EventRoute::ConnectionAcknowledged
        );

        let incoming = Event::Incoming(Packet::Publish(Publish::new(
            "test/topic",
            WireQoS::AtLeastOnce,
            "test payload",
        )));
        match MessageHandler::route_mqtt_event(&incoming) {
            EventRoute::MessageReceived {
                topic,
                qos,
                payload,
                retain,
            } => {
                assert_eq!(topic, "test/topic");
                assert_eq!(qos, QoS::AtLeastOnce);
                assert_eq!(payload, Bytes::from_static(b"test payload"));
                assert!(!retain);
            }
            other => panic!("Expected MessageReceived route, got {other:?}"),
        }

        assert_eq!(
            MessageHandler::route_mqtt_event(&Event::Outgoing(Outgoing::Disconnect)),
            EventRoute::DisconnectSent
        );
        assert_eq!(
            MessageHandler::route_mqtt_event(&Event::Outgoing(Outgoing::PingReq)),
            EventRoute::OutgoingEvent
        );
    }

    #[test]
    fn test_qos0_publish_resolves_when_written() {
        let mut tracker = PacketTracker::new();
        tracker.track(&publish(1, QoS::AtMostOnce));

        let event = tracker.apply(EventRoute::RequestWritten {
            kind: RequestKind::Publish,
            packet_id: 0,
        });
        assert_eq!(
            event,
            Some(InboundEvent::PubResult {
                topic: "sensors/temp".to_string(),
                token: Some(RequestToken(1)),
                result: Ok(()),
            })
        );
        assert_eq!(tracker.pending(), 0);
    }

    #[test]
    fn test_qos1_publish_waits_for_puback() {
        let mut tracker = PacketTracker::new();
        tracker.track(&publish(4, QoS::AtLeastOnce));

        assert!(tracker
            .apply(EventRoute::RequestWritten {
                kind: RequestKind::Publish,
                packet_id: 9,
            })
            .is_none());
        assert_eq!(tracker.pending(), 1);

        let route = MessageHandler::route_mqtt_event(&Event::Incoming(Packet::PubAck(
            PubAck::new(9),
        )));
        match tracker.apply(route) {
            Some(InboundEvent::PubResult { token, result, .. }) => {
                assert_eq!(token, Some(RequestToken(4)));
                assert!(result.is_ok());
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_suback_failure_rejects_subscription() {
        let mut tracker = PacketTracker::new();
        tracker.track(&subscribe(2));
        tracker.apply(EventRoute::RequestWritten {
            kind: RequestKind::Subscribe,
            packet_id: 3,
        });

        let route = MessageHandler::route_mqtt_event(&Event::Incoming(Packet::SubAck(
            SubAck::new(3, vec![SubscribeReasonCode::Failure]),
        )));
        match tracker.apply(route) {
            Some(InboundEvent::SubResult { topic, result, .. }) => {
                assert_eq!(topic, "sensors/#");
                assert!(result.is_err());
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_suback_grant_reported() {
        let mut tracker = PacketTracker::new();
        tracker.track(&subscribe(2));
        tracker.apply(EventRoute::RequestWritten {
            kind: RequestKind::Subscribe,
            packet_id: 1,
        });

        let event = tracker.apply(EventRoute::SubscriptionAcknowledged {
            packet_id: 1,
            granted: Some(QoS::AtLeastOnce),
        });
        assert!(matches!(
            event,
            Some(InboundEvent::SubResult {
                result: Ok(QoS::AtLeastOnce),
                ..
            })
        ));
    }

    #[test]
    fn test_untrack_and_unknown_acks() {
        let mut tracker = PacketTracker::new();
        tracker.track(&publish(1, QoS::AtLeastOnce));
        tracker.untrack(RequestToken(1));
        assert_eq!(tracker.pending(), 0);

        assert!(tracker
            .apply(EventRoute::Acknowledged {
                kind: RequestKind::Unsubscribe,
                packet_id: 5,
            })
            .is_none());
    }
}
