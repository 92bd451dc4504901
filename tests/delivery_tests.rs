use anyhow::Result;
use serde_json::json;
use std::time::Duration;
use tokio_test::{assert_err, assert_ok};
use uuid::Uuid;
use webhook_service::{
    clients::webhook::{
        DELIVERY_ID_HEADER, EVENT_TYPE_HEADER, SIGNATURE_HEADER, WebhookDispatcher, sign_payload,
    },
    config::Config,
    models::{
        event::{DomainEvent, EventType},
        message::DeliveryAttempt,
        retry::RetryConfig,
        webhook::WebhookEndpoint,
    },
};
use wiremock::{
    Mock, MockServer, ResponseTemplate,
    matchers::{header, header_exists, method, path},
};

fn test_config(webhook_timeout_seconds: u64) -> Config {
    Config {
        rabbitmq_url: "amqp://127.0.0.1:5672/%2f".to_string(),
        exchange_name: "webhook_default_exchange".to_string(),
        events_queue_name: "webhook_default_queue".to_string(),
        webhooks_queue_name: "webhook_cannon_single_url".to_string(),
        prefetch_count: 1,
        reconnect_delay_ms: 1000,
        redis_url: "redis://127.0.0.1:6379".to_string(),
        idempotency_ttl_seconds: 300,
        database_url: "postgres://localhost/webhooks_test".to_string(),
        media_server_host: "127.0.0.1".to_string(),
        media_server_port: 4242,
        media_server_username: "admin".to_string(),
        media_server_password: "secret".to_string(),
        webhook_timeout_seconds,
        circuit_breaker_failure_threshold: 5,
        circuit_breaker_timeout_seconds: 30,
        circuit_breaker_success_threshold: 2,
        max_delivery_attempts: 5,
        initial_retry_delay_ms: 1000,
        max_retry_delay_ms: 60000,
        retry_backoff_multiplier: 2,
        worker_concurrency: 1,
        server_port: 8080,
    }
}

fn test_endpoint(url: String) -> WebhookEndpoint {
    WebhookEndpoint {
        id: Uuid::new_v4(),
        url,
        secret: "whsec_test".to_string(),
        active: true,
        event_types: vec!["stream.started".to_string()],
    }
}

fn first_attempt() -> DeliveryAttempt {
    DeliveryAttempt::first(&RetryConfig {
        max_attempts: 5,
        initial_delay_ms: 1000,
        max_delay_ms: 60000,
        backoff_multiplier: 2,
    })
}

/// Test: Successful deliveries post a signed JSON payload
#[tokio::test]
async fn test_successful_delivery_posts_signed_payload() -> Result<()> {
    let server = MockServer::start().await;
    let event = DomainEvent::new(EventType::StreamStarted, json!({"stream_id": "s1"}));

    Mock::given(method("POST"))
        .and(path("/hooks/wh1"))
        .and(header("Content-Type", "application/json"))
        .and(header_exists(SIGNATURE_HEADER))
        .and(header(EVENT_TYPE_HEADER, "stream.started"))
        .and(header(DELIVERY_ID_HEADER, event.id.to_string().as_str()))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    let dispatcher = WebhookDispatcher::new(&test_config(5))?;
    let endpoint = test_endpoint(format!("{}/hooks/wh1", server.uri()));

    let status = dispatcher.deliver(&endpoint, &event, &first_attempt()).await;

    assert_eq!(assert_ok!(status), 200);

    Ok(())
}

/// Test: Signatures match the HMAC-SHA256 test vector
#[test]
fn test_signature_matches_known_vector() -> Result<()> {
    let signature = sign_payload("key", b"The quick brown fox jumps over the lazy dog")?;

    assert_eq!(
        signature,
        "f7bc83f430538424b13298e6aa6fb143ef4d59a14946175997479dbc2d1a3cd8"
    );

    Ok(())
}

/// Test: Signatures depend on the endpoint secret
#[test]
fn test_signature_varies_with_secret() -> Result<()> {
    let body = br#"{"event_type":"stream.started"}"#;

    let first = sign_payload("secret_a", body)?;
    let second = sign_payload("secret_b", body)?;

    assert_ne!(first, second);

    Ok(())
}

/// Test: Non-2xx responses are delivery failures
#[tokio::test]
async fn test_error_response_is_delivery_failure() -> Result<()> {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(500))
        .expect(1)
        .mount(&server)
        .await;

    let dispatcher = WebhookDispatcher::new(&test_config(5))?;
    let endpoint = test_endpoint(format!("{}/hooks/wh1", server.uri()));
    let event = DomainEvent::new(EventType::StreamStarted, json!({"stream_id": "s1"}));

    let result = dispatcher.deliver(&endpoint, &event, &first_attempt()).await;

    assert_err!(result);

    Ok(())
}

/// Test: Timeouts are delivery failures
#[tokio::test]
async fn test_timeout_is_delivery_failure() -> Result<()> {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(5)))
        .mount(&server)
        .await;

    let dispatcher = WebhookDispatcher::new(&test_config(1))?;
    let endpoint = test_endpoint(format!("{}/hooks/wh1", server.uri()));
    let event = DomainEvent::new(EventType::StreamStarted, json!({"stream_id": "s1"}));

    let result = dispatcher.deliver(&endpoint, &event, &first_attempt()).await;

    assert_err!(result);

    Ok(())
}

/// Test: Unreachable endpoints are delivery failures
#[tokio::test]
async fn test_connection_failure_is_delivery_failure() -> Result<()> {
    let dispatcher = WebhookDispatcher::new(&test_config(1))?;

    // Reserved TEST-NET-1 address, nothing listens there
    let endpoint = test_endpoint("http://192.0.2.1:9/hooks/wh1".to_string());
    let event = DomainEvent::new(EventType::StreamStarted, json!({"stream_id": "s1"}));

    let result = dispatcher.deliver(&endpoint, &event, &first_attempt()).await;

    assert_err!(result);

    Ok(())
}

/// Test: Delivered body carries the event payload and attempt count
#[tokio::test]
async fn test_delivery_body_carries_event_payload() -> Result<()> {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(wiremock::matchers::body_partial_json(json!({
            "event_type": "stream.started",
            "payload": {"stream_id": "s1"},
            "attempt": 1,
        })))
        .respond_with(ResponseTemplate::new(204))
        .expect(1)
        .mount(&server)
        .await;

    let dispatcher = WebhookDispatcher::new(&test_config(5))?;
    let endpoint = test_endpoint(format!("{}/hooks/wh1", server.uri()));
    let event = DomainEvent::new(EventType::StreamStarted, json!({"stream_id": "s1"}));

    let status = dispatcher.deliver(&endpoint, &event, &first_attempt()).await?;

    assert_eq!(status, 204);

    Ok(())
}
