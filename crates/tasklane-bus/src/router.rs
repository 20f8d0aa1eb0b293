//! Subscription registry and message dispatch.
//!
//! Subscriptions are indexed by pattern; `route` collects matching
//! subscriptions under a read lock, applies filters, and dispatches in
//! descending priority order. Subscription ids are monotonic and never
//! reused.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use tasklane_core::models::Message;

use crate::error::BusError;
use crate::pattern::{matches, validate_pattern, validate_topic};

/// Callback invoked for each matching subscription.
pub type SubscriberCallback = Arc<dyn Fn(&Message) -> anyhow::Result<()> + Send + Sync>;

/// Optional predicate; a subscription is skipped when its filter returns
/// false.
pub type MessageFilter = Arc<dyn Fn(&Message) -> bool + Send + Sync>;

const MAX_PRIORITY: u8 = 10;

/// Options for a new subscription.
#[derive(Default)]
pub struct SubscriptionOptions {
    pub filter: Option<MessageFilter>,
    /// Dispatch priority in `[0, 10]`; higher fires first among matches.
    pub priority: u8,
}

struct Subscription {
    id: u64,
    callback: SubscriberCallback,
    filter: Option<MessageFilter>,
    priority: u8,
}

/// Pattern-indexed subscription registry and dispatcher.
#[derive(Default)]
pub struct TopicRouter {
    subscriptions: RwLock<HashMap<String, Vec<Subscription>>>,
    next_id: AtomicU64,
}

impl TopicRouter {
    pub fn new() -> Self {
        Self {
            subscriptions: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Register a callback for a topic pattern. Returns the subscription id.
    pub fn subscribe(
        &self,
        pattern: &str,
        callback: SubscriberCallback,
        options: SubscriptionOptions,
    ) -> Result<u64, BusError> {
        validate_pattern(pattern)?;
        if options.priority > MAX_PRIORITY {
            return Err(BusError::InvalidPriority(options.priority));
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let subscription = Subscription {
            id,
            callback,
            filter: options.filter,
            priority: options.priority,
        };

        let mut subscriptions = self.subscriptions.write().expect("subscription lock poisoned");
        let entries = subscriptions.entry(pattern.to_string()).or_default();
        entries.push(subscription);
        // Keep each pattern's list ordered by priority, higher first.
        entries.sort_by(|a, b| b.priority.cmp(&a.priority));

        tracing::debug!(pattern = %pattern, subscription_id = id, "Subscription added");
        Ok(id)
    }

    /// Remove a subscription. The second call for the same id returns
    /// `NotFound`.
    pub fn unsubscribe(&self, subscription_id: u64) -> Result<(), BusError> {
        let mut subscriptions = self.subscriptions.write().expect("subscription lock poisoned");
        let mut removed = false;
        let mut emptied_pattern: Option<String> = None;
        for (pattern, entries) in subscriptions.iter_mut() {
            if let Some(index) = entries.iter().position(|s| s.id == subscription_id) {
                entries.remove(index);
                removed = true;
                if entries.is_empty() {
                    emptied_pattern = Some(pattern.clone());
                }
                break;
            }
        }
        if let Some(pattern) = emptied_pattern {
            subscriptions.remove(&pattern);
        }
        if removed {
            tracing::debug!(subscription_id, "Subscription removed");
            Ok(())
        } else {
            Err(BusError::NotFound(subscription_id))
        }
    }

    /// Dispatch a message to every matching subscription.
    ///
    /// Returns `NoSubscribers` when nothing matches (or every match is
    /// filtered out), `Ok` when at least one callback succeeds, and
    /// `AllFailed` with the aggregated messages otherwise.
    pub fn route(&self, message: &Message) -> Result<(), BusError> {
        validate_topic(&message.topic)?;

        // Collect matching callbacks under the read lock, then dispatch
        // outside it so subscribers may subscribe/unsubscribe reentrantly.
        let mut matched: Vec<(u64, u8, SubscriberCallback)> = Vec::new();
        {
            let subscriptions = self.subscriptions.read().expect("subscription lock poisoned");
            for (pattern, entries) in subscriptions.iter() {
                if !matches(&message.topic, pattern) {
                    continue;
                }
                for sub in entries {
                    if let Some(filter) = &sub.filter {
                        if !filter(message) {
                            continue;
                        }
                    }
                    matched.push((sub.id, sub.priority, sub.callback.clone()));
                }
            }
        }

        if matched.is_empty() {
            return Err(BusError::NoSubscribers(message.topic.clone()));
        }

        matched.sort_by(|a, b| b.1.cmp(&a.1));

        let mut any_succeeded = false;
        let mut failures: Vec<String> = Vec::new();
        for (id, _, callback) in matched {
            match callback(message) {
                Ok(()) => any_succeeded = true,
                Err(e) => {
                    tracing::warn!(
                        subscription_id = id,
                        topic = %message.topic,
                        error = %e,
                        "Subscriber callback failed"
                    );
                    failures.push(format!("subscription {} failed: {}", id, e));
                }
            }
        }

        if any_succeeded {
            Ok(())
        } else {
            Err(BusError::AllFailed(failures.join("; ")))
        }
    }

    /// Number of subscriptions whose pattern matches the given topic,
    /// before filters are applied.
    pub fn subscriber_count(&self, topic: &str) -> usize {
        let subscriptions = self.subscriptions.read().expect("subscription lock poisoned");
        subscriptions
            .iter()
            .filter(|(pattern, _)| matches(topic, pattern))
            .map(|(_, entries)| entries.len())
            .sum()
    }

    /// All registered patterns.
    pub fn patterns(&self) -> Vec<String> {
        let subscriptions = self.subscriptions.read().expect("subscription lock poisoned");
        subscriptions.keys().cloned().collect()
    }

    /// Drop every subscription.
    pub fn clear(&self) {
        self.subscriptions
            .write()
            .expect("subscription lock poisoned")
            .clear();
    }
}
