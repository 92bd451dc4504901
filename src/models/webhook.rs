use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use uuid::Uuid;

use crate::models::status::DeliveryStatus;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookEndpoint {
    pub id: Uuid,
    pub url: String,
    pub secret: String,
    pub active: bool,
    pub event_types: Vec<String>,
}

impl WebhookEndpoint {
    pub fn subscribes_to(&self, event_type: &str) -> bool {
        self.event_types.iter().any(|t| t == event_type)
    }
}

/// Outbound wire body for a webhook POST.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookPayload {
    pub id: Uuid,
    pub event_type: String,
    pub payload: JsonValue,
    pub created_at: DateTime<Utc>,
    pub attempt: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryLog {
    pub id: Uuid,
    pub endpoint_id: Uuid,
    pub event_id: Uuid,
    pub event_type: String,
    pub status: DeliveryStatus,
    pub attempt: i32,
    pub response_status: Option<i32>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CreateDeliveryLog {
    pub endpoint_id: Uuid,
    pub event_id: Uuid,
    pub event_type: String,
    pub status: DeliveryStatus,
    pub attempt: i32,
    pub response_status: Option<i32>,
    pub error_message: Option<String>,
}

impl CreateDeliveryLog {
    pub fn new(
        endpoint_id: Uuid,
        event_id: Uuid,
        event_type: String,
        status: DeliveryStatus,
        attempt: u32,
    ) -> Self {
        Self {
            endpoint_id,
            event_id,
            event_type,
            status,
            attempt: attempt as i32,
            response_status: None,
            error_message: None,
        }
    }

    pub fn with_response_status(mut self, status: u16) -> Self {
        self.response_status = Some(status as i32);
        self
    }

    pub fn with_error(mut self, error: String) -> Self {
        self.error_message = Some(error);
        self
    }
}
