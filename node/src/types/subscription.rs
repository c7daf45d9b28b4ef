use serde::{Deserialize, Serialize};

use crate::utilities::time::now_millis;
use crate::utilities::{generate_entity_id, EntityId};

use super::event::{Event, EventType};
use super::message::Message;

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FirstEvent {
    /// Start from the beginning of the event log.
    Oldest,
    /// Start from the current head; only events after creation are delivered.
    Newest,
    /// Start from an explicit sequence.
    Sequence(i64),
}

impl Default for FirstEvent {
    fn default() -> Self {
        FirstEvent::Newest
    }
}

/// Which events a subscription wants. Empty vectors mean "all".
/// `author` and `tag` only constrain events that reference a message.
#[derive(Debug, Clone, PartialEq, Default, Deserialize, Serialize)]
pub struct SubscriptionFilter {
    #[serde(default)]
    pub events: Vec<EventType>,
    #[serde(default)]
    pub topics: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tag: Option<String>,
}

impl SubscriptionFilter {
    /// Filter stages that need only the event row.
    pub(crate) fn matches_event(&self, event: &Event) -> bool {
        if !self.events.is_empty() && !self.events.contains(&event.event_type) {
            return false;
        }
        if !self.topics.is_empty() {
            match &event.topic {
                Some(topic) if self.topics.contains(topic) => {}
                _ => return false,
            }
        }
        true
    }

    /// Filter stages that need the referenced message resolved.
    pub(crate) fn matches_message(&self, message: &Message) -> bool {
        if let Some(author) = &self.author {
            if &message.header.author != author {
                return false;
            }
        }
        if let Some(tag) = &self.tag {
            if message.header.tag.as_ref() != Some(tag) {
                return false;
            }
        }
        true
    }

    pub(crate) fn needs_message(&self) -> bool {
        self.author.is_some() || self.tag.is_some()
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct SubscriptionOptions {
    #[serde(default)]
    pub first_event: FirstEvent,
    /// Maximum outstanding un-acked deliveries.
    #[serde(default = "default_read_ahead")]
    pub read_ahead: usize,
    #[serde(default = "default_retry_initial_ms")]
    pub retry_initial_ms: u64,
    #[serde(default = "default_retry_multiplier")]
    pub retry_multiplier: u32,
    #[serde(default = "default_retry_max_ms")]
    pub retry_max_ms: u64,
    /// Redeliveries past this count park the delivery as dead-lettered.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// How long to wait for an ack before treating it as a nack.
    #[serde(default = "default_ack_timeout_ms")]
    pub ack_timeout_ms: u64,
}

fn default_read_ahead() -> usize {
    16
}
fn default_retry_initial_ms() -> u64 {
    250
}
fn default_retry_multiplier() -> u32 {
    2
}
fn default_retry_max_ms() -> u64 {
    30_000
}
fn default_max_retries() -> u32 {
    10
}
fn default_ack_timeout_ms() -> u64 {
    15_000
}

impl Default for SubscriptionOptions {
    fn default() -> Self {
        Self {
            first_event: FirstEvent::default(),
            read_ahead: default_read_ahead(),
            retry_initial_ms: default_retry_initial_ms(),
            retry_multiplier: default_retry_multiplier(),
            retry_max_ms: default_retry_max_ms(),
            max_retries: default_max_retries(),
            ack_timeout_ms: default_ack_timeout_ms(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct Subscription {
    pub id: EntityId,
    pub namespace: String,
    pub name: String,
    #[serde(default)]
    pub filter: SubscriptionFilter,
    #[serde(default)]
    pub options: SubscriptionOptions,
    pub created: u64,
}

impl Subscription {
    pub(crate) fn new(namespace: &str, name: &str) -> Self {
        Self {
            id: generate_entity_id(),
            namespace: namespace.to_string(),
            name: name.to_string(),
            filter: SubscriptionFilter::default(),
            options: SubscriptionOptions::default(),
            created: now_millis(),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn event(event_type: EventType, topic: Option<&str>) -> Event {
        let mut e = Event::new("ns1", event_type, &"ref-1".to_string());
        if let Some(t) = topic {
            e = e.with_topic(t);
        }
        e
    }

    #[test]
    fn test_empty_filter_matches_all() {
        let filter = SubscriptionFilter::default();
        assert!(filter.matches_event(&event(EventType::MessageConfirmed, Some("t1"))));
        assert!(filter.matches_event(&event(EventType::OperationFailed, None)));
    }

    #[test]
    fn test_event_type_filter() {
        let filter = SubscriptionFilter {
            events: vec![EventType::MessageConfirmed],
            ..Default::default()
        };
        assert!(filter.matches_event(&event(EventType::MessageConfirmed, None)));
        assert!(!filter.matches_event(&event(EventType::OperationFailed, None)));
    }

    #[test]
    fn test_topic_filter_requires_topic() {
        let filter = SubscriptionFilter {
            topics: vec!["t1".to_string()],
            ..Default::default()
        };
        assert!(filter.matches_event(&event(EventType::MessageConfirmed, Some("t1"))));
        assert!(!filter.matches_event(&event(EventType::MessageConfirmed, Some("t2"))));
        assert!(!filter.matches_event(&event(EventType::MessageConfirmed, None)));
    }
}
