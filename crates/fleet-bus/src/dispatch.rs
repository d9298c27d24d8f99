//! Subscription registry and wildcard topic dispatch.
//!
//! MQTT wildcard semantics: `+` matches exactly one topic level, `#`
//! matches any remainder and is only valid as the final level.  A message
//! is delivered to the first matching pattern in registration order;
//! unmatched messages are dropped with a debug log.

use fleet_protocol::BusMessage;
use std::sync::Arc;
use tracing::{debug, warn};

/// Callback invoked on the network-loop task for each matched message.
pub type Handler = Arc<dyn Fn(&str, BusMessage) + Send + Sync>;

pub struct Subscription {
    pub pattern: String,
    handler: Handler,
}

/// Ordered set of subscriptions with first-match delivery.
#[derive(Default)]
pub struct SubscriptionSet {
    subs: Vec<Subscription>,
}

impl SubscriptionSet {
    pub fn add(&mut self, pattern: &str, handler: Handler) {
        self.subs.push(Subscription {
            pattern: pattern.to_owned(),
            handler,
        });
    }

    /// Patterns in registration order, for (re-)subscribing after a connect.
    pub fn patterns(&self) -> Vec<String> {
        self.subs.iter().map(|s| s.pattern.clone()).collect()
    }

    /// Decode `payload` and deliver to the first matching handler.
    ///
    /// Malformed JSON and unknown kinds are logged and dropped; this path
    /// never raises.
    pub fn dispatch(&self, topic: &str, payload: &[u8]) {
        let msg: BusMessage = match serde_json::from_slice(payload) {
            Ok(msg) => msg,
            Err(e) => {
                warn!(topic, error = %e, "dropping malformed bus payload");
                return;
            }
        };
        match self.subs.iter().find(|s| topic_matches(&s.pattern, topic)) {
            Some(sub) => (sub.handler)(topic, msg),
            None => debug!(topic, "no handler registered, message discarded"),
        }
    }
}

/// Match `topic` against an MQTT subscription `pattern`.
pub fn topic_matches(pattern: &str, topic: &str) -> bool {
    let mut pattern_levels = pattern.split('/');
    let mut topic_levels = topic.split('/');

    loop {
        match (pattern_levels.next(), topic_levels.next()) {
            (Some("#"), _) => return pattern_levels.next().is_none(),
            (Some("+"), Some(_)) => {}
            (Some(p), Some(t)) if p == t => {}
            (None, None) => return true,
            _ => return false,
        }
    }
}
