use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::payload::Payload;

/// A message published on a topic.
///
/// Topics are dot-separated routing keys (e.g. `chat.room.general`).
/// Subscriptions match topics with `*` (one segment) and `#` (zero or more
/// trailing segments) wildcards.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: Uuid,
    pub topic: String,
    pub payload: Payload,
    pub published_at: DateTime<Utc>,
}

impl Message {
    pub fn new(topic: impl Into<String>, payload: Payload) -> Self {
        Self {
            id: Uuid::new_v4(),
            topic: topic.into(),
            payload,
            published_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_carries_topic_and_payload() {
        let msg = Message::new("chat.room.general", Payload::new().with("text", "hi"));
        assert_eq!(msg.topic, "chat.room.general");
        assert_eq!(msg.payload.get_str("text"), Some("hi"));
    }

    #[test]
    fn test_messages_get_unique_ids() {
        let a = Message::new("a", Payload::new());
        let b = Message::new("a", Payload::new());
        assert_ne!(a.id, b.id);
    }
}
