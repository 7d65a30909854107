//! User-facing notification hooks

use super::Client;
use crate::error::{EngineError, EngineResult};
use crate::transport::{Message, QoS};
use std::sync::Arc;

/// Handler for messages on a topic filter
pub type TopicHandler = Arc<dyn Fn(&Client, &Message) + Send + Sync>;

/// Receives the asynchronous outcome of every client operation
///
/// All methods default to no-ops so implementors only override what they
/// need. Calls for one client arrive one at a time on that client's
/// dispatcher task, in the order the underlying events occurred.
pub trait Callback: Send + Sync {
    /// Outcome of one connect attempt, including each automatic redial
    fn on_connect(&self, _client: &Client, _server: &str, _result: &EngineResult<()>) {}

    /// An established connection dropped
    fn on_lost(&self, _client: &Client, _server: &str, _error: &EngineError) {}

    fn on_publish(&self, _client: &Client, _topic: &str, _result: &EngineResult<()>) {}

    /// `Ok` carries the QoS granted by the broker
    fn on_subscribe(&self, _client: &Client, _topic: &str, _result: &EngineResult<QoS>) {}

    fn on_unsubscribe(&self, _client: &Client, _topic: &str, _result: &EngineResult<()>) {}

    fn on_persist_error(&self, _client: &Client, _error: &EngineError) {}
}

impl<C: Callback + ?Sized> Callback for Arc<C> {
    fn on_connect(&self, client: &Client, server: &str, result: &EngineResult<()>) {
        (**self).on_connect(client, server, result)
    }

    fn on_lost(&self, client: &Client, server: &str, error: &EngineError) {
        (**self).on_lost(client, server, error)
    }

    fn on_publish(&self, client: &Client, topic: &str, result: &EngineResult<()>) {
        (**self).on_publish(client, topic, result)
    }

    fn on_subscribe(&self, client: &Client, topic: &str, result: &EngineResult<QoS>) {
        (**self).on_subscribe(client, topic, result)
    }

    fn on_unsubscribe(&self, client: &Client, topic: &str, result: &EngineResult<()>) {
        (**self).on_unsubscribe(client, topic, result)
    }

    fn on_persist_error(&self, client: &Client, error: &EngineError) {
        (**self).on_persist_error(client, error)
    }
}
