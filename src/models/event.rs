use std::fmt::{Display, Formatter, Result};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventType {
    #[serde(rename = "stream.started")]
    StreamStarted,

    #[serde(rename = "stream.ended")]
    StreamEnded,

    #[serde(rename = "recording.ready")]
    RecordingReady,
}

impl EventType {
    pub fn as_str(&self) -> &str {
        match self {
            EventType::StreamStarted => "stream.started",
            EventType::StreamEnded => "stream.ended",
            EventType::RecordingReady => "recording.ready",
        }
    }
}

impl Display for EventType {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DomainEvent {
    pub id: Uuid,
    pub event_type: EventType,
    pub payload: JsonValue,
    pub created_at: DateTime<Utc>,
}

impl DomainEvent {
    pub fn new(event_type: EventType, payload: JsonValue) -> Self {
        Self {
            id: Uuid::new_v4(),
            event_type,
            payload,
            created_at: Utc::now(),
        }
    }

    pub fn routing_key(&self) -> String {
        format!("events.{}", self.event_type)
    }
}
