//! Client lifecycle tests against mock transports
//!
//! Each test drives a client through the public API and checks the callbacks
//! it observes, in order.


use bytes::Bytes;
use mqtt_engine::testing::{MockBehavior, Recorded, RecordingCallback};
use mqtt_engine::transport::{InboundEvent, Message, RequestKind};
use mqtt_engine::{
    Callback, Client, ClientIdentity, ConnAckCode, ConnectionFailure, ConnectionState,
    EngineError, EngineResult, QoS, SubscriptionStatus,
};
use std::time::Duration;
use test_helpers::{connected_client, fast_reconnect, wait_for_sent, MockEngine, WAIT};

#[tokio::test]
async fn test_connect_subscribe_publish_unsubscribe_destroy() {
    let mock = MockEngine::new();
    let (client, recorder) = connected_client(mock.builder()).await;
    assert_eq!(client.state(), ConnectionState::Connected);

    client.handle("sensors/+/temp", recorder.handler()).unwrap();
    client.subscribe("sensors/+/temp", QoS::AtLeastOnce).unwrap();
    client
        .publish("sensors/kitchen/temp", QoS::AtLeastOnce, "21.5")
        .unwrap();
    client.unsubscribe("sensors/+/temp").unwrap();

    let events = recorder.wait_for_events(5, WAIT).await;
    assert_eq!(
        events,
        vec![
            Recorded::Connect(Ok(())),
            Recorded::Subscribe {
                topic: "sensors/+/temp".to_string(),
                result: Ok(QoS::AtLeastOnce),
            },
            Recorded::Publish {
                topic: "sensors/kitchen/temp".to_string(),
                result: Ok(()),
            },
            Recorded::Message {
                topic: "sensors/kitchen/temp".to_string(),
                qos: QoS::AtLeastOnce,
                payload: Bytes::from_static(b"21.5"),
            },
            Recorded::Unsubscribe {
                topic: "sensors/+/temp".to_string(),
                result: Ok(()),
            },
        ]
    );
    assert!(client.subscriptions().is_empty());
    assert_eq!(client.in_flight(), 0);

    client.destroy(false).unwrap();
    assert_eq!(client.wait().await, ConnectionState::Destroyed);
    assert!(mock.engine.registry().is_empty());

    let transport = mock.transport(&client);
    assert_eq!(transport.get_closes().await, vec![false]);
    assert_eq!(recorder.events().len(), 5, "no callbacks after destroy");
}

#[tokio::test]
async fn test_granted_qos_caps_delivery() {
    let mock = MockEngine::with_behavior(MockBehavior {
        max_grant: QoS::AtMostOnce,
        ..Default::default()
    });
    let (client, recorder) = connected_client(mock.builder()).await;

    client.handle("alerts/#", recorder.handler()).unwrap();
    client.subscribe("alerts/#", QoS::ExactlyOnce).unwrap();
    client.publish("alerts/fire", QoS::ExactlyOnce, "!").unwrap();

    let events = recorder.wait_for_events(4, WAIT).await;
    assert_eq!(
        events[1],
        Recorded::Subscribe {
            topic: "alerts/#".to_string(),
            result: Ok(QoS::AtMostOnce),
        }
    );
    assert!(matches!(
        &events[3],
        Recorded::Message { qos: QoS::AtMostOnce, .. }
    ));
    assert_eq!(
        client.subscriptions()[0].status,
        SubscriptionStatus::Active {
            granted: QoS::AtMostOnce
        }
    );
}

#[tokio::test]
async fn test_two_matching_handlers_each_called_once() {
    let mock = MockEngine::new();
    let (client, recorder) = connected_client(mock.builder()).await;

    let wildcard = RecordingCallback::new();
    let exact = RecordingCallback::new();
    client.handle("home/#", wildcard.handler()).unwrap();
    client.handle("home/+/light", exact.handler()).unwrap();
    client.handle("office/#", recorder.handler()).unwrap();

    let transport = mock.transport(&client);
    assert!(
        transport
            .deliver("home/hall/light", QoS::AtLeastOnce, "on")
            .await
    );

    assert_eq!(wildcard.wait_for_events(1, WAIT).await.len(), 1);
    assert_eq!(exact.wait_for_events(1, WAIT).await.len(), 1);

    // a later message proves the first was not delivered twice
    assert!(transport.deliver("home/attic", QoS::AtMostOnce, "x").await);
    assert_eq!(wildcard.wait_for_events(2, WAIT).await.len(), 2);
    assert_eq!(exact.events().len(), 1);
    assert_eq!(recorder.names(), vec!["connect"]);
}

#[tokio::test]
async fn test_unmatched_message_goes_to_default_handler() {
    let mock = MockEngine::new();
    let (client, recorder) = connected_client(mock.builder()).await;

    let fallback = RecordingCallback::new();
    client.handle("known/topic", recorder.handler()).unwrap();
    client.handle_default(fallback.handler()).unwrap();

    let transport = mock.transport(&client);
    transport.deliver("unknown/topic", QoS::AtMostOnce, "?").await;
    transport.deliver("known/topic", QoS::AtMostOnce, "!").await;

    let events = recorder.wait_for_events(2, WAIT).await;
    assert_eq!(events.len(), 2);
    assert_eq!(
        fallback.events(),
        vec![Recorded::Message {
            topic: "unknown/topic".to_string(),
            qos: QoS::AtMostOnce,
            payload: Bytes::from_static(b"?"),
        }]
    );
}

#[tokio::test]
async fn test_handler_survives_unsubscribe_and_resubscribe() {
    let mock = MockEngine::new();
    let (client, recorder) = connected_client(mock.builder()).await;

    client.handle("foo", recorder.handler()).unwrap();
    client.subscribe("foo", QoS::AtLeastOnce).unwrap();
    client.unsubscribe("foo").unwrap();
    client.subscribe("foo", QoS::AtLeastOnce).unwrap();
    client.publish("foo", QoS::AtLeastOnce, "back").unwrap();

    let events = recorder.wait_for_events(6, WAIT).await;
    assert_eq!(
        recorder.names(),
        vec!["connect", "subscribe", "unsubscribe", "subscribe", "publish", "message"],
        "{events:?}"
    );
    assert_eq!(
        events[5],
        Recorded::Message {
            topic: "foo".to_string(),
            qos: QoS::AtLeastOnce,
            payload: Bytes::from_static(b"back"),
        }
    );
}

#[tokio::test]
async fn test_regex_handler_receives_matching_topics() {
    let mock = MockEngine::new();
    let (client, recorder) = connected_client(mock.builder()).await;

    let numbered = RecordingCallback::new();
    let fallback = RecordingCallback::new();
    client.handle_regex(r"^metrics/\d+$", numbered.handler()).unwrap();
    client.handle_default(fallback.handler()).unwrap();
    assert!(matches!(
        client.handle_regex("metrics/(", numbered.handler()),
        Err(EngineError::InvalidTopic { .. })
    ));

    let transport = mock.transport(&client);
    transport.deliver("metrics/17", QoS::AtLeastOnce, "cpu").await;
    transport.deliver("metrics/disk", QoS::AtMostOnce, "io").await;

    let seen = numbered.wait_for_events(1, WAIT).await;
    assert_eq!(
        seen,
        vec![Recorded::Message {
            topic: "metrics/17".to_string(),
            qos: QoS::AtLeastOnce,
            payload: Bytes::from_static(b"cpu"),
        }]
    );
    let missed = fallback.wait_for_events(1, WAIT).await;
    assert!(matches!(&missed[0], Recorded::Message { topic, .. } if topic == "metrics/disk"));
    assert_eq!(numbered.events().len(), 1);
    assert_eq!(recorder.names(), vec!["connect"]);
}

#[tokio::test]
async fn test_events_without_callback_are_discarded() {
    let mock = MockEngine::new();
    let client = mock.builder().reconnect(fast_reconnect()).build().unwrap();
    let transport = mock.transport(&client);

    client.connect().unwrap();
    tokio::time::timeout(WAIT, async {
        while client.state() != ConnectionState::Connected {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();

    client.subscribe("a/b", QoS::AtLeastOnce).unwrap();
    client.publish("a/b", QoS::AtLeastOnce, "unheard").unwrap();
    wait_for_sent(&transport, 2).await;
    assert!(transport.lose_connection("nobody listening").await);

    tokio::time::timeout(WAIT, async {
        while transport.dial_count() < 2 || client.state() != ConnectionState::Connected {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();

    // a callback set now only sees what happens from here on
    let recorder = RecordingCallback::new();
    client.set_callback(recorder.clone()).unwrap();
    client.unsubscribe("a/b").unwrap();
    let events = recorder.wait_for_events(1, WAIT).await;
    assert_eq!(recorder.names(), vec!["unsubscribe"], "{events:?}");
    assert_eq!(client.state(), ConnectionState::Connected);
}

#[tokio::test]
async fn test_destroy_twice_reports_already_destroyed() {
    let mock = MockEngine::new();
    let (client, recorder) = connected_client(mock.builder()).await;

    client.destroy(true).unwrap();
    assert_eq!(client.destroy(true), Err(EngineError::AlreadyDestroyed));
    assert_eq!(client.destroy(false), Err(EngineError::AlreadyDestroyed));
    assert_eq!(client.wait().await, ConnectionState::Destroyed);

    assert_eq!(client.connect(), Err(EngineError::AlreadyDestroyed));
    assert_eq!(
        client.publish("a/b", QoS::AtMostOnce, "x"),
        Err(EngineError::AlreadyDestroyed)
    );
    assert_eq!(
        client.subscribe("a/b", QoS::AtMostOnce),
        Err(EngineError::AlreadyDestroyed)
    );
    assert_eq!(client.unsubscribe("a/b"), Err(EngineError::AlreadyDestroyed));
    assert!(client.set_callback(RecordingCallback::new()).is_err());

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(recorder.names(), vec!["connect"]);
    assert_eq!(mock.transport(&client).get_closes().await, vec![true]);
}

#[tokio::test]
async fn test_forced_destroy_drops_pending_acknowledgments() {
    let mock = MockEngine::with_behavior(MockBehavior {
        auto_ack: false,
        ..Default::default()
    });
    let (client, recorder) = connected_client(mock.builder()).await;

    client.publish("a/b", QoS::AtLeastOnce, "x").unwrap();
    client.subscribe("a/#", QoS::AtLeastOnce).unwrap();
    assert_eq!(client.in_flight(), 2);

    client.destroy(true).unwrap();
    assert_eq!(client.wait().await, ConnectionState::Destroyed);
    assert_eq!(client.in_flight(), 0);

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(recorder.names(), vec!["connect"]);
}

#[tokio::test]
async fn test_graceful_destroy_waits_for_drain_timeout() {
    let mock = MockEngine::with_behavior(MockBehavior {
        auto_ack: false,
        ..Default::default()
    });
    let (client, _recorder) = connected_client(mock.builder().drain_timeout(1)).await;

    client.publish("a/b", QoS::AtLeastOnce, "x").unwrap();
    client.destroy(false).unwrap();
    assert_eq!(client.state(), ConnectionState::Closing);

    let started = tokio::time::Instant::now();
    assert_eq!(client.wait().await, ConnectionState::Destroyed);
    assert!(started.elapsed() >= Duration::from_millis(900));
}

#[tokio::test]
async fn test_events_for_unknown_identity_are_dropped() {
    let mock = MockEngine::new();
    let (client, recorder) = connected_client(mock.builder()).await;
    client.handle_default(recorder.handler()).unwrap();

    let stranger = mock.engine.event_sink(ClientIdentity::new(9_999));
    let delivered = stranger
        .emit(InboundEvent::Message(Message::new("a/b", QoS::AtMostOnce, "x")))
        .await;
    assert!(!delivered);
    let delivered = stranger
        .emit(InboundEvent::Lost(EngineError::lost("not yours")))
        .await;
    assert!(!delivered);

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(recorder.names(), vec!["connect"]);
    assert_eq!(client.state(), ConnectionState::Connected);
}

#[tokio::test]
async fn test_events_after_destroy_are_dropped() {
    let mock = MockEngine::new();
    let (client, recorder) = connected_client(mock.builder()).await;
    client.handle_default(recorder.handler()).unwrap();
    let transport = mock.transport(&client);

    client.destroy(true).unwrap();
    client.wait().await;

    assert!(!transport.deliver("a/b", QoS::AtMostOnce, "late").await);
    assert!(!transport.lose_connection("late").await);
    assert_eq!(recorder.names(), vec!["connect"]);
}

#[tokio::test]
async fn test_reconnect_with_persistent_session_keeps_subscriptions() {
    let mock = MockEngine::new();
    let builder = mock
        .builder()
        .client_id("persistent-1")
        .clean_session(false)
        .reconnect(fast_reconnect());
    let (client, recorder) = connected_client(builder).await;

    client.handle("a/b", recorder.handler()).unwrap();
    client.subscribe("a/b", QoS::AtLeastOnce).unwrap();
    recorder.wait_for_events(2, WAIT).await;

    let transport = mock.transport(&client);
    assert!(transport.lose_connection("broker restarted").await);

    let events = recorder.wait_for_events(4, WAIT).await;
    assert_eq!(
        recorder.names(),
        vec!["connect", "subscribe", "lost", "connect"],
        "{events:?}"
    );
    assert_eq!(
        events[2],
        Recorded::Lost(EngineError::lost("broker restarted"))
    );
    assert_eq!(client.state(), ConnectionState::Connected);
    assert_eq!(transport.dial_count(), 2);

    let subscriptions = client.subscriptions();
    assert_eq!(subscriptions.len(), 1);
    assert_eq!(
        subscriptions[0].status,
        SubscriptionStatus::Active {
            granted: QoS::AtLeastOnce
        }
    );
    assert_eq!(
        transport.get_sent_of_kind(RequestKind::Subscribe).await.len(),
        1,
        "subscriptions are not re-issued"
    );

    // the broker-side session still routes to the kept subscription
    client.publish("a/b", QoS::AtLeastOnce, "again").unwrap();
    let events = recorder.wait_for_events(6, WAIT).await;
    assert_eq!(events[5].name(), "message");
}

#[tokio::test]
async fn test_reconnect_with_clean_session_clears_subscriptions() {
    let mock = MockEngine::new();
    let builder = mock.builder().reconnect(fast_reconnect());
    let (client, recorder) = connected_client(builder).await;

    client.subscribe("a/b", QoS::AtLeastOnce).unwrap();
    recorder.wait_for_events(2, WAIT).await;
    assert_eq!(client.subscriptions().len(), 1);

    mock.transport(&client).lose_connection("keepalive timeout").await;

    recorder.wait_for_events(4, WAIT).await;
    assert_eq!(
        recorder.names(),
        vec!["connect", "subscribe", "lost", "connect"]
    );
    assert!(client.subscriptions().is_empty());
}

#[tokio::test]
async fn test_loss_fails_requests_in_flight() {
    let mock = MockEngine::with_behavior(MockBehavior {
        auto_ack: false,
        ..Default::default()
    });
    let builder = mock.builder().reconnect(fast_reconnect());
    let (client, recorder) = connected_client(builder).await;

    client.subscribe("a/b", QoS::AtLeastOnce).unwrap();
    client.publish("a/b", QoS::AtMostOnce, "x").unwrap();
    // wait for the writer before cutting the session
    let transport = mock.transport(&client);
    wait_for_sent(&transport, 2).await;
    transport.lose_connection("reset by peer").await;

    let events = recorder.wait_for_events(5, WAIT).await;
    assert_eq!(
        recorder.names(),
        vec!["connect", "lost", "subscribe", "publish", "connect"],
        "{events:?}"
    );
    assert!(matches!(&events[2], Recorded::Subscribe { result: Err(_), .. }));
    assert!(matches!(&events[3], Recorded::Publish { result: Err(_), .. }));
    assert!(client.subscriptions().is_empty());
    assert_eq!(client.in_flight(), 0);
}

#[tokio::test]
async fn test_refused_connect_does_not_retry() {
    let mock = MockEngine::with_behavior(MockBehavior {
        connack: Some(Err(
            ConnectionFailure::Refused(ConnAckCode::BadCredentials).into()
        )),
        ..Default::default()
    });
    let client = mock.builder().reconnect(fast_reconnect()).build().unwrap();
    let recorder = RecordingCallback::new();
    client.set_callback(recorder.clone()).unwrap();
    client.connect().unwrap();

    assert_eq!(client.wait().await, ConnectionState::Disconnected);
    let events = recorder.wait_for_events(1, WAIT).await;
    assert_eq!(
        events,
        vec![Recorded::Connect(Err(EngineError::Connection(
            ConnectionFailure::Refused(ConnAckCode::BadCredentials)
        )))]
    );

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(mock.transport(&client).dial_count(), 1);

    // a failed client can be connected again
    mock.transport(&client)
        .update_behavior(|b| b.connack = Some(Ok(())));
    client.connect().unwrap();
    recorder.wait_for_events(2, WAIT).await;
    assert_eq!(client.state(), ConnectionState::Connected);
}

#[tokio::test]
async fn test_dial_timeout_reports_connect_failure() {
    let mock = MockEngine::with_behavior(MockBehavior {
        connack: None,
        ..Default::default()
    });
    let client = mock.builder().dial_timeout(1).build().unwrap();
    let recorder = RecordingCallback::new();
    client.set_callback(recorder.clone()).unwrap();
    client.connect().unwrap();
    assert_eq!(client.state(), ConnectionState::Connecting);

    let events = recorder.wait_for_events(1, WAIT).await;
    assert_eq!(
        events,
        vec![Recorded::Connect(Err(EngineError::Connection(
            ConnectionFailure::Timeout(Duration::from_secs(1))
        )))]
    );
    assert_eq!(client.state(), ConnectionState::Disconnected);
}

#[tokio::test]
async fn test_reconnect_gives_up_after_max_attempts() {
    let mock = MockEngine::new();
    let mut reconnect = fast_reconnect();
    reconnect.max_attempts = Some(2);
    let (client, recorder) = connected_client(mock.builder().reconnect(reconnect)).await;

    let transport = mock.transport(&client);
    transport.update_behavior(|b| {
        b.connack = Some(Err(ConnectionFailure::Dial("connection refused".into()).into()))
    });
    transport.lose_connection("broker down").await;

    assert_eq!(client.wait().await, ConnectionState::Disconnected);
    recorder.wait_for_events(4, WAIT).await;
    assert_eq!(
        recorder.names(),
        vec!["connect", "lost", "connect", "connect"]
    );
    assert_eq!(transport.dial_count(), 3);
}

#[tokio::test]
async fn test_operations_while_disconnected_fail_through_callback() {
    let mock = MockEngine::new();
    let client = mock.builder().build().unwrap();
    let recorder = RecordingCallback::new();
    client.set_callback(recorder.clone()).unwrap();

    client.publish("a/b", QoS::AtLeastOnce, "x").unwrap();
    client.subscribe("a/#", QoS::AtMostOnce).unwrap();

    let events = recorder.wait_for_events(2, WAIT).await;
    assert!(matches!(&events[0], Recorded::Publish { result: Err(_), .. }));
    assert!(matches!(&events[1], Recorded::Subscribe { result: Err(_), .. }));
    assert!(client.subscriptions().is_empty());
    assert!(mock.transport(&client).get_sent_packets().await.is_empty());
}

#[tokio::test]
async fn test_invalid_topics_rejected_synchronously() {
    let mock = MockEngine::new();
    let (client, recorder) = connected_client(mock.builder()).await;

    assert!(matches!(
        client.publish("a/+", QoS::AtMostOnce, "x"),
        Err(EngineError::InvalidTopic { .. })
    ));
    assert!(matches!(
        client.subscribe("a/#/b", QoS::AtMostOnce),
        Err(EngineError::InvalidTopic { .. })
    ));
    assert!(matches!(
        client.unsubscribe(""),
        Err(EngineError::InvalidTopic { .. })
    ));
    assert!(client.handle("a/b+", |_, _| {}).is_err());

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(recorder.names(), vec!["connect"]);
}

#[tokio::test]
async fn test_connect_twice_is_invalid_state() {
    let mock = MockEngine::new();
    let (client, _recorder) = connected_client(mock.builder()).await;

    assert!(matches!(
        client.connect(),
        Err(EngineError::InvalidState {
            state: ConnectionState::Connected
        })
    ));
}

#[tokio::test]
async fn test_clients_are_independent() {
    let mock = MockEngine::new();
    let (first, first_events) = connected_client(mock.builder()).await;
    let (second, second_events) = connected_client(mock.builder()).await;

    first.destroy(true).unwrap();
    first.wait().await;

    second.publish("a/b", QoS::AtMostOnce, "x").unwrap();
    second_events.wait_for_events(2, WAIT).await;
    assert_eq!(second_events.names(), vec!["connect", "publish"]);
    assert_eq!(first_events.names(), vec!["connect"]);
    assert_eq!(mock.engine.registry().identities(), vec![second.identity()]);
}

#[tokio::test]
async fn test_many_clients_deliver_concurrently() {
    let mock = MockEngine::new();

    let handles: Vec<_> = (0..8)
        .map(|i| {
            let builder = mock.builder();
            tokio::spawn(async move {
                let (client, recorder) = connected_client(builder).await;
                let topic = format!("fleet/{i}/status");
                client.handle(&topic, recorder.handler()).unwrap();
                client.subscribe(&topic, QoS::AtLeastOnce).unwrap();
                client.publish(&topic, QoS::AtLeastOnce, "up").unwrap();
                recorder.wait_for_events(4, WAIT).await;
                (client, recorder)
            })
        })
        .collect();

    let results = futures::future::join_all(handles).await;
    for result in results {
        let (client, recorder) = result.unwrap();
        assert_eq!(
            recorder.names(),
            vec!["connect", "subscribe", "publish", "message"],
            "{}",
            client.identity()
        );
    }
    assert_eq!(mock.engine.registry().len(), 8);
}

/// Drives the next step of the scenario from inside each callback
struct Chained {
    recorder: RecordingCallback,
}

impl Callback for Chained {
    fn on_connect(&self, client: &Client, server: &str, result: &EngineResult<()>) {
        self.recorder.on_connect(client, server, result);
        if result.is_ok() {
            client.subscribe("foo", QoS::AtLeastOnce).unwrap();
        }
    }

    fn on_subscribe(&self, client: &Client, topic: &str, result: &EngineResult<QoS>) {
        self.recorder.on_subscribe(client, topic, result);
        if result.is_ok() {
            client.publish("foo", QoS::AtLeastOnce, "bar").unwrap();
        }
    }

    fn on_publish(&self, client: &Client, topic: &str, result: &EngineResult<()>) {
        self.recorder.on_publish(client, topic, result);
        if result.is_ok() {
            client.unsubscribe("foo").unwrap();
        }
    }

    fn on_unsubscribe(&self, client: &Client, topic: &str, result: &EngineResult<()>) {
        self.recorder.on_unsubscribe(client, topic, result);
        if result.is_ok() {
            client.destroy(true).unwrap();
        }
    }
}

#[tokio::test]
async fn test_scenario_chained_from_callbacks() {
    let mock = MockEngine::new();
    let client = mock
        .engine
        .new_builder("localhost:1883")
        .clean_session(true)
        .build()
        .unwrap();
    let recorder = RecordingCallback::new();
    client
        .set_callback(Chained {
            recorder: recorder.clone(),
        })
        .unwrap();

    client.connect().unwrap();
    assert_eq!(client.wait().await, ConnectionState::Destroyed);

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(
        recorder.events(),
        vec![
            Recorded::Connect(Ok(())),
            Recorded::Subscribe {
                topic: "foo".to_string(),
                result: Ok(QoS::AtLeastOnce),
            },
            Recorded::Publish {
                topic: "foo".to_string(),
                result: Ok(()),
            },
            Recorded::Unsubscribe {
                topic: "foo".to_string(),
                result: Ok(()),
            },
        ]
    );
    assert!(mock.engine.registry().is_empty());
}
