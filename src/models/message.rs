use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::{event::DomainEvent, retry::RetryConfig};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookJob {
    pub endpoint_id: Uuid,
    pub event: DomainEvent,
}

impl WebhookJob {
    pub fn new(endpoint_id: Uuid, event: DomainEvent) -> Self {
        Self { endpoint_id, event }
    }

    pub fn routing_key(&self) -> String {
        format!("webhooks.{}", self.endpoint_id)
    }
}

/// Attempt state carried in the message envelope headers. `next_delay_ms` is
/// the backoff applied before the following attempt if this one fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryAttempt {
    pub count: u32,
    pub next_delay_ms: u64,
}

impl DeliveryAttempt {
    pub fn first(retry_config: &RetryConfig) -> Self {
        Self {
            count: 1,
            next_delay_ms: retry_config.initial_delay_ms,
        }
    }

    pub fn next(&self, retry_config: &RetryConfig) -> Option<Self> {
        if self.count >= retry_config.max_attempts {
            return None;
        }

        let delay_ms = self
            .next_delay_ms
            .saturating_mul(retry_config.backoff_multiplier)
            .min(retry_config.max_delay_ms);

        Some(Self {
            count: self.count + 1,
            next_delay_ms: delay_ms,
        })
    }
}
