//! Pure translation of a client configuration into rumqttc options
//!
//! This module contains pure functions for building connection options and
//! converting between engine and rumqttc protocol types.

use crate::config::ClientConfig;
use crate::error::{ConnectionFailure, EngineError, EngineResult};
use crate::registry::ClientIdentity;
use crate::transport::tls::build_tls_config;
use crate::transport::{ConnAckCode, QoS};
use rumqttc::{
    ConnectReturnCode, ConnectionError, LastWill, MqttOptions, QoS as WireQoS, TlsConfiguration,
    Transport as WireTransport,
};
use std::sync::Arc;
use std::time::Duration;

/// rumqttc rejects keepalives shorter than this
const MIN_KEEPALIVE_SECS: u64 = 5;

/// Largest packet accepted or sent
const MAX_PACKET_SIZE: usize = 256 * 1024;

/// Pure function to configure MQTT options from config
pub fn configure_mqtt_options(
    config: &ClientConfig,
    identity: ClientIdentity,
) -> EngineResult<MqttOptions> {
    let address = config.server_address()?;

    let client_id = if config.client_id.is_empty() {
        generated_client_id(identity)
    } else {
        config.client_id.clone()
    };
    let mut mqtt_options = MqttOptions::new(client_id, address.host, address.port);

    mqtt_options.set_keep_alive(Duration::from_secs(
        u64::from(config.keepalive_secs).max(MIN_KEEPALIVE_SECS),
    ));
    mqtt_options.set_clean_session(config.clean_session);
    mqtt_options.set_max_packet_size(MAX_PACKET_SIZE, MAX_PACKET_SIZE);

    if let Some(credentials) = &config.credentials {
        mqtt_options.set_credentials(
            credentials.username.clone(),
            credentials.password.clone().unwrap_or_default(),
        );
    }

    if let Some(will) = &config.will {
        mqtt_options.set_last_will(LastWill::new(
            will.topic.clone(),
            will.payload.clone(),
            to_wire_qos(will.qos),
            will.retain,
        ));
    }

    match &config.tls {
        Some(tls) => {
            let tls_config = build_tls_config(tls)?;
            mqtt_options.set_transport(WireTransport::tls_with_config(
                TlsConfiguration::Rustls(Arc::new(tls_config)),
            ));
        }
        None if address.tls => {
            mqtt_options.set_transport(WireTransport::tls_with_default_config());
        }
        None => {}
    }

    Ok(mqtt_options)
}

/// Unique id for clients that did not set one, so redials never collide at the broker
fn generated_client_id(identity: ClientIdentity) -> String {
    let millis = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis())
        .unwrap_or_default();
    format!("mqtt-engine-{}-{millis}", identity.get())
}

pub fn to_wire_qos(qos: QoS) -> WireQoS {
    match qos {
        QoS::AtMostOnce => WireQoS::AtMostOnce,
        QoS::AtLeastOnce => WireQoS::AtLeastOnce,
        QoS::ExactlyOnce => WireQoS::ExactlyOnce,
    }
}

pub fn from_wire_qos(qos: WireQoS) -> QoS {
    match qos {
        WireQoS::AtMostOnce => QoS::AtMostOnce,
        WireQoS::AtLeastOnce => QoS::AtLeastOnce,
        WireQoS::ExactlyOnce => QoS::ExactlyOnce,
    }
}

pub fn from_return_code(code: ConnectReturnCode) -> ConnAckCode {
    match code {
        ConnectReturnCode::Success => ConnAckCode::Accepted,
        ConnectReturnCode::RefusedProtocolVersion => ConnAckCode::BadProtocolVersion,
        ConnectReturnCode::BadClientId => ConnAckCode::IdentifierRejected,
        ConnectReturnCode::ServiceUnavailable => ConnAckCode::ServerUnavailable,
        ConnectReturnCode::BadUserNamePassword => ConnAckCode::BadCredentials,
        ConnectReturnCode::NotAuthorized => ConnAckCode::NotAuthorized,
    }
}

/// Classify an event loop failure
///
/// Before the handshake completes every failure is a dial failure; afterwards
/// it is a loss, except for malformed traffic which is reported as a protocol
/// error.
pub fn classify_connection_error(error: &ConnectionError, acknowledged: bool) -> EngineError {
    match error {
        ConnectionError::ConnectionRefused(code) => {
            ConnectionFailure::Refused(from_return_code(*code)).into()
        }
        ConnectionError::Tls(tls) => ConnectionFailure::Tls(tls.to_string()).into(),
        ConnectionError::MqttState(state) if acknowledged => {
            EngineError::protocol(state.to_string())
        }
        other if acknowledged => EngineError::lost(other.to_string()),
        other => ConnectionFailure::Dial(other.to_string()).into(),
    }
}
