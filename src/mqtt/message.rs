use chrono::{DateTime, Utc};
use std::fmt;

const PREVIEW_CHARS: usize = 40;

/// A message as it came off the broker, before routing
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RawMessage {
    topic: String,
    payload: String,
    received_at: DateTime<Utc>,
}

impl fmt::Display for RawMessage {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let preview: String = self.payload.chars().take(PREVIEW_CHARS).collect();
        let ellipsis = if self.payload.chars().count() > PREVIEW_CHARS {
            "..."
        } else {
            ""
        };
        write!(f, "{} - {}: {}{}", self.received_at, self.topic, preview, ellipsis)
    }
}

impl RawMessage {
    pub fn new(topic: impl Into<String>, payload: impl Into<String>) -> Self {
        Self::received_at(topic, payload, Utc::now())
    }

    pub fn received_at(
        topic: impl Into<String>,
        payload: impl Into<String>,
        received_at: DateTime<Utc>,
    ) -> Self {
        RawMessage {
            topic: topic.into(),
            payload: payload.into(),
            received_at,
        }
    }

    /// Payload bytes are decoded lossily; devices only send text
    pub fn from_publish(publish: &rumqttc::Publish) -> Self {
        Self::new(
            publish.topic.clone(),
            String::from_utf8_lossy(&publish.payload).into_owned(),
        )
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn payload(&self) -> &str {
        &self.payload
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.received_at
    }
}
