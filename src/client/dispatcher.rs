//! Per-client writer and dispatcher tasks
//!
//! The dispatcher is the only place callbacks and topic handlers run. It
//! takes locks to update lifecycle and table state, releases them, and only
//! then calls into user code.

use super::handle::{ClientShared, Delivery, InFlight};
use super::lock;
use super::state::{ConnectionEvent, ConnectionState, ReconnectionDecision};
use super::Client;
use crate::error::{ConnectionFailure, EngineError, EngineResult};
use crate::persist::PersistStore;
use crate::transport::{
    InboundEvent, Message, OutboundPacket, QoS, RequestKind, RequestToken, Transport,
};
use std::sync::{Arc, Weak};
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};

/// Write queued requests to the transport in submission order
///
/// QoS 1/2 publishes are saved to the store before they are written.
pub(crate) async fn run_writer(
    shared: Weak<ClientShared>,
    transport: Arc<dyn Transport>,
    store: Arc<dyn PersistStore>,
    mut outbound_rx: mpsc::Receiver<OutboundPacket>,
) {
    while let Some(packet) = outbound_rx.recv().await {
        let token = packet.token();
        trace!(%token, topic = packet.topic(), kind = %packet.kind(), "writing request");
        if packet.kind() == RequestKind::Publish && packet.qos() > QoS::AtMostOnce {
            if let Err(error) = store.save(token, &packet).await {
                warn!(%token, error = %error, "failed to persist publish");
                let Some(shared) = shared.upgrade() else {
                    break;
                };
                shared
                    .enqueue(Delivery::Event {
                        attempt: None,
                        event: InboundEvent::PersistError(error),
                    })
                    .await;
            }
        }
        if let Err(error) = transport.send(packet.clone()).await {
            debug!(%token, error = %error.description(), "request write failed");
            let Some(shared) = shared.upgrade() else {
                break;
            };
            shared
                .enqueue(Delivery::Event {
                    attempt: None,
                    event: packet.into_failure(error),
                })
                .await;
        }
    }
    trace!("writer stopped");
}

/// Deliver events for one client, one at a time
pub(crate) async fn run_dispatcher(
    shared: Weak<ClientShared>,
    mut inbound_rx: mpsc::Receiver<Delivery>,
) {
    while let Some(delivery) = inbound_rx.recv().await {
        let Some(shared) = shared.upgrade() else {
            break;
        };
        if matches!(delivery, Delivery::Shutdown) {
            break;
        }
        if shared.state() == ConnectionState::Destroyed {
            trace!(client = %shared.identity, "client destroyed, dropping delivery");
            continue;
        }

        match delivery {
            Delivery::Event { attempt, event } => dispatch_event(&shared, attempt, event).await,
            Delivery::DialTimeout { attempt } => {
                let timeout = shared.config.dial_timeout();
                on_connect_failed(
                    &shared,
                    Some(attempt),
                    ConnectionFailure::Timeout(timeout).into(),
                );
            }
            Delivery::Redial { retry } => on_redial(&shared, retry),
            Delivery::Shutdown => break,
        }
    }
    trace!("dispatcher stopped");
}

async fn dispatch_event(shared: &Arc<ClientShared>, attempt: Option<u64>, event: InboundEvent) {
    trace!(client = %shared.identity, event = event.name(), "dispatching");
    match event {
        InboundEvent::ConnAck(Ok(())) => on_connected(shared, attempt).await,
        InboundEvent::ConnAck(Err(error)) => on_connect_failed(shared, attempt, error),
        InboundEvent::Lost(error) => on_lost(shared, attempt, error).await,
        InboundEvent::PubResult {
            topic,
            token,
            result,
        } => on_pub_result(shared, token, &topic, result).await,
        InboundEvent::SubResult {
            topic,
            token,
            result,
        } => on_sub_result(shared, token, &topic, result),
        InboundEvent::UnsubResult {
            topic,
            token,
            result,
        } => on_unsub_result(shared, token, &topic, result),
        InboundEvent::PersistError(error) => {
            warn!(client = %shared.identity, error = %error.description(), "persistence error");
            if let Some(callback) = shared.callback() {
                callback.on_persist_error(&handle(shared), &error);
            }
        }
        InboundEvent::Message(message) => on_message(shared, message),
    }
}

fn handle(shared: &Arc<ClientShared>) -> Client {
    Client {
        shared: Arc::clone(shared),
    }
}

async fn on_connected(shared: &Arc<ClientShared>, attempt: Option<u64>) {
    if !lock(&shared.lifecycle).awaits_handshake(attempt) {
        debug!(client = %shared.identity, ?attempt, "ignoring stale ConnAck");
        return;
    }

    // Settle the store before anything can be published on the new session
    let mut persist_errors = Vec::new();
    let stored = if shared.config.clean_session {
        if let Err(error) = shared.store.destroy().await {
            persist_errors.push(error);
        }
        Vec::new()
    } else {
        match shared.store.load_pending().await {
            Ok(pending) => pending.into_iter().map(|(_, packet)| packet).collect(),
            Err(error) => {
                persist_errors.push(error);
                Vec::new()
            }
        }
    };

    let resend = {
        let mut lc = lock(&shared.lifecycle);
        if !lc.awaits_handshake(attempt) {
            debug!(client = %shared.identity, ?attempt, "handshake superseded while loading store");
            return;
        }
        lc.attempt_resolved = true;
        lc.retries = 0;
        shared.transition(&mut lc, &ConnectionEvent::ConnAckAccepted);

        if shared.config.clean_session {
            lock(&shared.table).clear_subscriptions();
        }
        for packet in &stored {
            shared.track(&mut lc, packet);
        }
        stored
    };

    if !resend.is_empty() {
        info!(client = %shared.identity, count = resend.len(), "resending unacknowledged publishes");
    }
    for packet in resend {
        shared.submit(packet);
    }

    let client = handle(shared);
    if let Some(callback) = shared.callback() {
        callback.on_connect(&client, &shared.config.server, &Ok(()));
        for error in &persist_errors {
            callback.on_persist_error(&client, error);
        }
    }
}

fn on_connect_failed(shared: &Arc<ClientShared>, attempt: Option<u64>, error: EngineError) {
    let gave_up = {
        let mut lc = lock(&shared.lifecycle);
        if !lc.awaits_handshake(attempt) {
            debug!(client = %shared.identity, ?attempt, "ignoring stale connect failure");
            return;
        }
        lc.attempt_resolved = true;

        let may_retry = matches!(lc.state, ConnectionState::Reconnecting(_))
            || shared.config.reconnect.retry_initial_connect;
        let decision = if may_retry && error.is_recoverable() {
            shared.reconnect_decision(lc.retries)
        } else {
            ReconnectionDecision::AbortMaxAttemptsExceeded
        };

        shared.transition(
            &mut lc,
            &ConnectionEvent::ConnectFailed {
                retry_attempt: decision.retry_attempt(),
            },
        );
        match decision {
            ReconnectionDecision::Proceed { attempt, delay } => {
                lc.retries = attempt;
                shared.schedule_redial(attempt, delay);
                false
            }
            _ => true,
        }
    };

    warn!(client = %shared.identity, error = %error.description(), gave_up, "connect attempt failed");
    if gave_up {
        let transport = Arc::clone(&shared.transport);
        tokio::spawn(async move { transport.close(true).await });
    }

    if let Some(callback) = shared.callback() {
        callback.on_connect(&handle(shared), &shared.config.server, &Err(error));
    }
}

fn on_redial(shared: &Arc<ClientShared>, retry: u32) {
    let attempt = {
        let mut lc = lock(&shared.lifecycle);
        if lc.state != ConnectionState::Reconnecting(retry) {
            debug!(client = %shared.identity, retry, state = %lc.state, "skipping redial");
            return;
        }
        lc.begin_attempt()
    };
    info!(client = %shared.identity, retry, "redialing");
    shared.start_dial(attempt);
}

/// Request that failed because the session went away
struct Abandoned {
    token: RequestToken,
    op: InFlight,
}

async fn on_lost(shared: &Arc<ClientShared>, attempt: Option<u64>, error: EngineError) {
    let abandoned = {
        let mut lc = lock(&shared.lifecycle);
        if attempt.is_some_and(|a| a != lc.attempt) {
            debug!(client = %shared.identity, ?attempt, "ignoring loss of a stale session");
            return;
        }

        if !lc.state.is_connected() {
            if lc.awaits_handshake(attempt) {
                drop(lc);
                on_connect_failed(shared, attempt, error);
            } else {
                debug!(client = %shared.identity, state = %lc.state, "suppressing connection loss");
            }
            return;
        }

        let decision = shared.reconnect_decision(0);
        shared.transition(
            &mut lc,
            &ConnectionEvent::TransportLost {
                retry_attempt: decision.retry_attempt(),
            },
        );
        match decision {
            ReconnectionDecision::Proceed { attempt, delay } => {
                lc.retries = attempt;
                shared.schedule_redial(attempt, delay);
            }
            _ => {
                let transport = Arc::clone(&shared.transport);
                tokio::spawn(async move { transport.close(true).await });
            }
        }

        // Persistent sessions keep QoS 1/2 publishes for resending after the reconnect
        let keep_publishes = !shared.config.clean_session && shared.store.is_durable();
        let drained = shared.clear_in_flight(&mut lc);
        let mut abandoned = Vec::new();
        for (token, op) in drained {
            if keep_publishes && op.kind == RequestKind::Publish && op.qos > QoS::AtMostOnce {
                lc.in_flight.insert(token, op);
            } else {
                abandoned.push(Abandoned { token, op });
            }
        }
        shared.sync_in_flight(&lc);

        let mut table = lock(&shared.table);
        for Abandoned { op, .. } in &abandoned {
            match op.kind {
                RequestKind::Subscribe => table.reject_subscription(&op.topic),
                RequestKind::Unsubscribe => table.restore_subscription(&op.topic),
                RequestKind::Publish => {}
            }
        }
        abandoned
    };

    let mut persist_errors = Vec::new();
    for Abandoned { token, op } in &abandoned {
        if op.kind == RequestKind::Publish {
            if let Err(error) = shared.store.ack(*token).await {
                persist_errors.push(error);
            }
        }
    }

    let Some(callback) = shared.callback() else {
        return;
    };
    let client = handle(shared);
    callback.on_lost(&client, &shared.config.server, &error);
    for Abandoned { op, .. } in abandoned {
        match op.kind {
            RequestKind::Publish => callback.on_publish(&client, &op.topic, &Err(error.clone())),
            RequestKind::Subscribe => {
                callback.on_subscribe(&client, &op.topic, &Err(error.clone()))
            }
            RequestKind::Unsubscribe => {
                callback.on_unsubscribe(&client, &op.topic, &Err(error.clone()))
            }
        }
    }
    for persist_error in &persist_errors {
        callback.on_persist_error(&client, persist_error);
    }
}

fn take_in_flight(
    shared: &Arc<ClientShared>,
    kind: RequestKind,
    token: Option<RequestToken>,
    topic: &str,
) -> Option<(RequestToken, InFlight)> {
    let mut lc = lock(&shared.lifecycle);
    let taken = shared.take(&mut lc, kind, token, topic);
    if taken.is_none() {
        debug!(client = %shared.identity, %kind, topic, "result matches no request in flight");
    }
    taken
}

async fn on_pub_result(
    shared: &Arc<ClientShared>,
    token: Option<RequestToken>,
    topic: &str,
    result: EngineResult<()>,
) {
    let Some((token, op)) = take_in_flight(shared, RequestKind::Publish, token, topic) else {
        return;
    };
    let persist_error = if op.qos > QoS::AtMostOnce {
        shared.store.ack(token).await.err()
    } else {
        None
    };

    if let Err(error) = &result {
        warn!(client = %shared.identity, topic = %op.topic, error = %error.description(), "publish failed");
    }
    if let Some(callback) = shared.callback() {
        let client = handle(shared);
        callback.on_publish(&client, &op.topic, &result);
        if let Some(error) = persist_error {
            callback.on_persist_error(&client, &error);
        }
    }
}

fn on_sub_result(
    shared: &Arc<ClientShared>,
    token: Option<RequestToken>,
    topic: &str,
    result: EngineResult<QoS>,
) {
    let Some((_, op)) = take_in_flight(shared, RequestKind::Subscribe, token, topic) else {
        return;
    };
    {
        let mut table = lock(&shared.table);
        match &result {
            Ok(granted) => {
                table.confirm_subscription(&op.topic, *granted);
            }
            Err(_) => table.reject_subscription(&op.topic),
        }
    }

    match &result {
        Ok(granted) => debug!(client = %shared.identity, filter = %op.topic, %granted, "subscribed"),
        Err(error) => {
            warn!(client = %shared.identity, filter = %op.topic, error = %error.description(), "subscribe failed")
        }
    }
    if let Some(callback) = shared.callback() {
        callback.on_subscribe(&handle(shared), &op.topic, &result);
    }
}

fn on_unsub_result(
    shared: &Arc<ClientShared>,
    token: Option<RequestToken>,
    topic: &str,
    result: EngineResult<()>,
) {
    let Some((_, op)) = take_in_flight(shared, RequestKind::Unsubscribe, token, topic) else {
        return;
    };
    {
        let mut table = lock(&shared.table);
        match &result {
            Ok(()) => {
                table.complete_unsubscribe(&op.topic);
            }
            Err(_) => table.restore_subscription(&op.topic),
        }
    }

    if let Some(callback) = shared.callback() {
        callback.on_unsubscribe(&handle(shared), &op.topic, &result);
    }
}

fn on_message(shared: &Arc<ClientShared>, message: Message) {
    let matched = lock(&shared.table).route(&message);
    if matched.handlers.is_empty() {
        debug!(client = %shared.identity, topic = %message.topic, "no handler for message, dropping");
        return;
    }
    if matched.fallback {
        trace!(client = %shared.identity, topic = %message.topic, "delivering to default handler");
    }

    let client = handle(shared);
    for (handler, qos) in matched.handlers {
        let mut delivered = message.clone();
        delivered.qos = qos;
        handler(&client, &delivered);
    }
}
