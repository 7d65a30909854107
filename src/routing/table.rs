//! Per-client table of topic filters, subscriptions and handlers

use super::topic::topic_matches;
use crate::client::callback::TopicHandler;
use crate::transport::{Message, QoS};
use regex::Regex;
use tracing::debug;

/// Where a subscription is in its subscribe/unsubscribe round trip
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionStatus {
    /// SUBSCRIBE sent; `previous` is the grant of an entry being re-subscribed
    Pending { previous: Option<QoS> },
    Active { granted: QoS },
    /// UNSUBSCRIBE sent, still delivering until confirmed
    PendingRemoval { granted: QoS },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscription {
    pub filter: String,
    pub requested: QoS,
    pub status: SubscriptionStatus,
}

impl Subscription {
    /// QoS cap while the broker is delivering on this filter
    pub fn granted(&self) -> Option<QoS> {
        match self.status {
            SubscriptionStatus::Pending { previous } => previous,
            SubscriptionStatus::Active { granted }
            | SubscriptionStatus::PendingRemoval { granted } => Some(granted),
        }
    }
}

struct Route {
    filter: String,
    handler: Option<TopicHandler>,
    subscription: Option<Subscription>,
}

impl Route {
    /// Subscriptions still waiting for their first grant are not routed
    fn delivery_cap(&self) -> Option<Option<QoS>> {
        match &self.subscription {
            None => Some(None),
            Some(subscription) => subscription.granted().map(Some),
        }
    }
}

/// Handlers selected for one message, in registration order
pub struct RouteMatch {
    pub handlers: Vec<(TopicHandler, QoS)>,
    pub fallback: bool,
}

/// Handler selected by a regular expression over the whole topic name
struct PatternRoute {
    pattern: Regex,
    handler: TopicHandler,
}

/// Topic filters with their handlers and subscription state
///
/// Regex routes sit beside the filter routes: they never subscribe anything
/// and see every message the broker delivers on the session.
#[derive(Default)]
pub struct TopicDispatchTable {
    routes: Vec<Route>,
    patterns: Vec<PatternRoute>,
    fallback: Option<TopicHandler>,
}

impl TopicDispatchTable {
    pub fn new() -> Self {
        Self::default()
    }

    fn position(&self, filter: &str) -> Option<usize> {
        self.routes.iter().position(|r| r.filter == filter)
    }

    fn route_mut(&mut self, filter: &str) -> &mut Route {
        let index = match self.position(filter) {
            Some(index) => index,
            None => {
                self.routes.push(Route {
                    filter: filter.to_string(),
                    handler: None,
                    subscription: None,
                });
                self.routes.len() - 1
            }
        };
        &mut self.routes[index]
    }

    /// Register (or replace) the handler for `filter`
    pub fn handle(&mut self, filter: &str, handler: TopicHandler) {
        self.route_mut(filter).handler = Some(handler);
    }

    /// Register (or replace) the handler for topics matching `pattern`
    pub fn handle_pattern(&mut self, pattern: Regex, handler: TopicHandler) {
        match self
            .patterns
            .iter_mut()
            .find(|r| r.pattern.as_str() == pattern.as_str())
        {
            Some(existing) => existing.handler = handler,
            None => self.patterns.push(PatternRoute { pattern, handler }),
        }
    }

    pub fn set_fallback(&mut self, handler: TopicHandler) {
        self.fallback = Some(handler);
    }

    /// Record a subscribe request awaiting confirmation
    pub fn subscribe(&mut self, filter: &str, qos: QoS) {
        let route = self.route_mut(filter);
        let previous = route.subscription.as_ref().and_then(Subscription::granted);
        route.subscription = Some(Subscription {
            filter: filter.to_string(),
            requested: qos,
            status: SubscriptionStatus::Pending { previous },
        });
    }

    /// The broker granted `granted` for `filter`
    pub fn confirm_subscription(&mut self, filter: &str, granted: QoS) -> bool {
        match self.subscription_mut(filter) {
            Some(subscription) => {
                subscription.status = SubscriptionStatus::Active { granted };
                true
            }
            None => false,
        }
    }

    /// The subscribe failed; restore a previous grant or drop the subscription
    pub fn reject_subscription(&mut self, filter: &str) {
        let Some(index) = self.position(filter) else {
            return;
        };
        let route = &mut self.routes[index];
        let Some(subscription) = route.subscription.as_mut() else {
            return;
        };
        let SubscriptionStatus::Pending { previous } = subscription.status else {
            return;
        };
        match previous {
            Some(granted) => subscription.status = SubscriptionStatus::Active { granted },
            None => {
                route.subscription = None;
                self.prune(index);
            }
        }
    }

    /// Mark `filter` as being unsubscribed; messages keep flowing until confirmed
    pub fn begin_unsubscribe(&mut self, filter: &str) -> bool {
        match self.subscription_mut(filter) {
            Some(subscription) => {
                if let Some(granted) = subscription.granted() {
                    subscription.status = SubscriptionStatus::PendingRemoval { granted };
                }
                true
            }
            None => false,
        }
    }

    /// Unsubscribe confirmed: the subscription is gone, a handler stays registered
    pub fn complete_unsubscribe(&mut self, filter: &str) -> bool {
        let Some(index) = self.position(filter) else {
            return false;
        };
        let removed = self.routes[index].subscription.take().is_some();
        self.prune(index);
        removed
    }

    /// Unsubscribe failed: the subscription stays active
    pub fn restore_subscription(&mut self, filter: &str) {
        if let Some(subscription) = self.subscription_mut(filter) {
            if let SubscriptionStatus::PendingRemoval { granted } = subscription.status {
                subscription.status = SubscriptionStatus::Active { granted };
            }
        }
    }

    /// Session state was discarded by the broker; handlers are kept
    pub fn clear_subscriptions(&mut self) -> usize {
        let mut cleared = 0;
        for route in &mut self.routes {
            if route.subscription.take().is_some() {
                cleared += 1;
            }
        }
        self.routes.retain(|r| r.handler.is_some());
        if cleared > 0 {
            debug!(cleared, "subscriptions cleared for new session");
        }
        cleared
    }

    pub fn subscription(&self, filter: &str) -> Option<&Subscription> {
        self.routes
            .iter()
            .find(|r| r.filter == filter)
            .and_then(|r| r.subscription.as_ref())
    }

    fn subscription_mut(&mut self, filter: &str) -> Option<&mut Subscription> {
        self.routes
            .iter_mut()
            .find(|r| r.filter == filter)
            .and_then(|r| r.subscription.as_mut())
    }

    pub fn subscriptions(&self) -> Vec<Subscription> {
        self.routes
            .iter()
            .filter_map(|r| r.subscription.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    /// Handlers for `message`, each paired with its effective delivery QoS
    ///
    /// Filter handlers come first, then regex handlers, each in registration order.
    pub fn route(&self, message: &Message) -> RouteMatch {
        let mut handlers: Vec<_> = self
            .routes
            .iter()
            .filter(|r| topic_matches(&r.filter, &message.topic))
            .filter_map(|r| {
                let handler = r.handler.clone()?;
                let cap = r.delivery_cap()?;
                let qos = cap.map_or(message.qos, |granted| granted.min(message.qos));
                Some((handler, qos))
            })
            .collect();
        handlers.extend(
            self.patterns
                .iter()
                .filter(|r| r.pattern.is_match(&message.topic))
                .map(|r| (r.handler.clone(), message.qos)),
        );

        if handlers.is_empty() {
            if let Some(fallback) = &self.fallback {
                return RouteMatch {
                    handlers: vec![(fallback.clone(), message.qos)],
                    fallback: true,
                };
            }
        }

        RouteMatch {
            handlers,
            fallback: false,
        }
    }

    fn prune(&mut self, index: usize) {
        let route = &self.routes[index];
        if route.handler.is_none() && route.subscription.is_none() {
            self.routes.remove(index);
        }
    }
}
