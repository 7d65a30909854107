//! Impure I/O operations for the rumqttc transport
//!
//! Each dial creates a fresh rumqttc client and event loop. The event loop is
//! polled on its own task until the session ends; it never retries by itself,
//! reconnection policy belongs to the client state machine.

use super::connection::{classify_connection_error, configure_mqtt_options, to_wire_qos};
use super::message_handler::{EventRoute, MessageHandler, PacketTracker};
use crate::config::ClientConfig;
use crate::error::{EngineError, EngineResult};
use crate::registry::ClientIdentity;
use crate::transport::{EventSink, InboundEvent, OutboundPacket, Transport};
use async_trait::async_trait;
use rumqttc::{AsyncClient, EventLoop};
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn, Instrument};

/// How long a graceful close waits for the event loop to flush DISCONNECT
const DISCONNECT_GRACE: Duration = Duration::from_secs(2);

/// Lower bound for the rumqttc request channel
const MIN_REQUEST_CAPACITY: usize = 10;

struct Session {
    client: AsyncClient,
    tracker: Arc<StdMutex<PacketTracker>>,
    poll_handle: JoinHandle<()>,
    shutdown_tx: watch::Sender<bool>,
}

impl Session {
    fn stop(self) {
        self.shutdown_tx.send_replace(true);
        self.poll_handle.abort();
    }
}

/// MQTT 3.1.1 transport backed by rumqttc
pub struct RumqttcTransport {
    identity: ClientIdentity,
    session: Mutex<Option<Session>>,
}

impl RumqttcTransport {
    pub fn new(identity: ClientIdentity) -> Self {
        Self {
            identity,
            session: Mutex::new(None),
        }
    }

    /// Poll the event loop until the session ends or shutdown is signalled
    async fn run_event_loop(
        identity: ClientIdentity,
        mut event_loop: EventLoop,
        sink: EventSink,
        tracker: Arc<StdMutex<PacketTracker>>,
        mut shutdown_rx: watch::Receiver<bool>,
    ) {
        let mut acknowledged = false;

        loop {
            tokio::select! {
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        debug!(client = %identity, "event loop shutdown requested");
                        break;
                    }
                }

                polled = event_loop.poll() => match polled {
                    Ok(event) => {
                        let route = MessageHandler::route_mqtt_event(&event);
                        match route {
                            EventRoute::ConnectionAcknowledged => acknowledged = true,
                            EventRoute::DisconnectSent => {
                                debug!(client = %identity, "DISCONNECT written, ending session");
                                break;
                            }
                            _ => {}
                        }

                        let inbound = tracker
                            .lock()
                            .unwrap_or_else(PoisonError::into_inner)
                            .apply(route);
                        if let Some(inbound) = inbound {
                            if !sink.emit(inbound).await {
                                debug!(client = %identity, "client gone, stopping event loop");
                                break;
                            }
                        }
                    }
                    Err(error) => {
                        let failure = classify_connection_error(&error, acknowledged);
                        warn!(client = %identity, error = %failure.description(), acknowledged, "MQTT event loop error");
                        let event = if acknowledged {
                            InboundEvent::Lost(failure)
                        } else {
                            InboundEvent::ConnAck(Err(failure))
                        };
                        sink.emit(event).await;
                        break;
                    }
                }
            }
        }

        debug!(client = %identity, "MQTT event loop stopped");
    }
}

#[async_trait]
impl Transport for RumqttcTransport {
    async fn dial(&self, config: &ClientConfig, sink: EventSink) -> EngineResult<()> {
        let mqtt_options = configure_mqtt_options(config, self.identity)?;
        let (client, event_loop) =
            AsyncClient::new(mqtt_options, config.send_buf.max(MIN_REQUEST_CAPACITY));

        let tracker = Arc::new(StdMutex::new(PacketTracker::new()));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let poll_handle = tokio::spawn(
            Self::run_event_loop(
                self.identity,
                event_loop,
                sink,
                Arc::clone(&tracker),
                shutdown_rx,
            )
            .instrument(crate::mqtt_span!(client = %self.identity, server = %config.server)),
        );

        let previous = self.session.lock().await.replace(Session {
            client,
            tracker,
            poll_handle,
            shutdown_tx,
        });
        if let Some(previous) = previous {
            debug!(client = %self.identity, "replacing previous session");
            previous.stop();
        }

        info!(client = %self.identity, server = %config.server, "dialing MQTT broker");
        Ok(())
    }

    async fn send(&self, packet: OutboundPacket) -> EngineResult<()> {
        let (client, tracker) = {
            let session = self.session.lock().await;
            let session = session
                .as_ref()
                .ok_or_else(|| EngineError::operation("no active session"))?;
            (session.client.clone(), Arc::clone(&session.tracker))
        };

        let token = packet.token();
        tracker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .track(&packet);

        let queued = match packet {
            OutboundPacket::Publish {
                topic,
                qos,
                retain,
                payload,
                ..
            } => {
                client
                    .publish_bytes(topic, to_wire_qos(qos), retain, payload)
                    .await
            }
            OutboundPacket::Subscribe { filter, qos, .. } => {
                client.subscribe(filter, to_wire_qos(qos)).await
            }
            OutboundPacket::Unsubscribe { filter, .. } => client.unsubscribe(filter).await,
        };

        queued.map_err(|error| {
            tracker
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .untrack(token);
            EngineError::operation(format!("request not queued: {error}"))
        })
    }

    async fn close(&self, force: bool) {
        let Some(session) = self.session.lock().await.take() else {
            return;
        };

        if force {
            session.stop();
            debug!(client = %self.identity, "session dropped");
            return;
        }

        if let Err(error) = session.client.disconnect().await {
            debug!(client = %self.identity, %error, "DISCONNECT not queued");
        }
        let Session {
            mut poll_handle,
            shutdown_tx,
            ..
        } = session;
        if tokio::time::timeout(DISCONNECT_GRACE, &mut poll_handle)
            .await
            .is_err()
        {
            warn!(client = %self.identity, "event loop did not finish after DISCONNECT");
            shutdown_tx.send_replace(true);
            poll_handle.abort();
        }
        info!(client = %self.identity, "disconnected from MQTT broker");
    }

    fn name(&self) -> &'static str {
        "rumqttc"
    }
}
