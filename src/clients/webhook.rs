use std::time::Duration;

use anyhow::{Error, Result, anyhow};
use hmac::{Hmac, Mac};
use reqwest::Client;
use sha2::Sha256;
use tracing::{debug, info};

use crate::{
    config::Config,
    models::{
        event::DomainEvent,
        message::DeliveryAttempt,
        webhook::{WebhookEndpoint, WebhookPayload},
    },
};

type HmacSha256 = Hmac<Sha256>;

pub const SIGNATURE_HEADER: &str = "X-Webhook-Signature";
pub const EVENT_TYPE_HEADER: &str = "X-Webhook-Event";
pub const DELIVERY_ID_HEADER: &str = "X-Webhook-Delivery";

pub struct WebhookDispatcher {
    http_client: Client,
}

impl WebhookDispatcher {
    pub fn new(config: &Config) -> Result<Self, Error> {
        let http_client = Client::builder()
            .timeout(Duration::from_secs(config.webhook_timeout_seconds))
            .build()
            .map_err(|_| anyhow!("Failed to create HTTP client"))?;

        Ok(Self { http_client })
    }

    /// Performs one outbound webhook POST. A non-2xx response or a transport
    /// error (timeout, DNS failure) is a delivery failure for the caller's
    /// retry scheduling.
    pub async fn deliver(
        &self,
        endpoint: &WebhookEndpoint,
        event: &DomainEvent,
        attempt: &DeliveryAttempt,
    ) -> Result<u16, Error> {
        let payload = WebhookPayload {
            id: event.id,
            event_type: event.event_type.as_str().to_string(),
            payload: event.payload.clone(),
            created_at: event.created_at,
            attempt: attempt.count,
        };

        let body = serde_json::to_vec(&payload)?;
        let signature = sign_payload(&endpoint.secret, &body)?;

        debug!(
            endpoint_id = %endpoint.id,
            event_id = %event.id,
            attempt = attempt.count,
            "Sending webhook"
        );

        let response = self
            .http_client
            .post(&endpoint.url)
            .header("Content-Type", "application/json")
            .header(SIGNATURE_HEADER, format!("sha256={}", signature))
            .header(EVENT_TYPE_HEADER, event.event_type.as_str())
            .header(DELIVERY_ID_HEADER, event.id.to_string())
            .body(body)
            .send()
            .await
            .map_err(|e| anyhow!("Webhook request failed: {}", e))?;

        let status = response.status();

        if status.is_success() {
            info!(
                endpoint_id = %endpoint.id,
                event_id = %event.id,
                status = status.as_u16(),
                "Webhook delivered successfully"
            );
            Ok(status.as_u16())
        } else {
            Err(anyhow!("Webhook endpoint returned status {}", status))
        }
    }
}

/// HMAC-SHA256 of the request body under the endpoint's shared secret,
/// hex-encoded. Receivers verify it from the signature header.
pub fn sign_payload(secret: &str, body: &[u8]) -> Result<String, Error> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|_| anyhow!("Invalid webhook secret"))?;
    mac.update(body);

    Ok(hex::encode(mac.finalize().into_bytes()))
}
