//! Topic matching and per-client message routing

pub mod table;
pub mod topic;

pub use table::{RouteMatch, Subscription, SubscriptionStatus, TopicDispatchTable};
pub use topic::{topic_matches, validate_topic_filter, validate_topic_name, TopicError};

use crate::error::EngineError;

impl TopicError {
    pub(crate) fn into_engine_error(self, topic: &str) -> EngineError {
        EngineError::invalid_topic(topic, self.to_string())
    }
}
