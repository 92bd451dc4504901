use serde_json::json;
use uuid::Uuid;
use webhook_service::{
    clients::rbmq::{
        delay_queue_expiry_ms, delay_queue_name, delay_queue_ttl_ms, validate_routing_key,
    },
    models::{
        event::{DomainEvent, EventType},
        message::{DeliveryAttempt, WebhookJob},
        retry::RetryConfig,
    },
};

fn retry_config() -> RetryConfig {
    RetryConfig {
        max_attempts: 4,
        initial_delay_ms: 1000,
        max_delay_ms: 4000,
        backoff_multiplier: 2,
    }
}

/// Test: Internal events route under the events prefix
#[test]
fn test_event_routing_keys_use_events_prefix() {
    let started = DomainEvent::new(EventType::StreamStarted, json!({"stream_id": "s1"}));
    let ended = DomainEvent::new(EventType::StreamEnded, json!({"stream_id": "s1"}));
    let recorded = DomainEvent::new(EventType::RecordingReady, json!({"asset_id": "a1"}));

    assert_eq!(started.routing_key(), "events.stream.started");
    assert_eq!(ended.routing_key(), "events.stream.ended");
    assert_eq!(recorded.routing_key(), "events.recording.ready");
}

/// Test: Webhook jobs route under the webhooks prefix
#[test]
fn test_webhook_job_routing_keys_use_webhooks_prefix() {
    let endpoint_id = Uuid::new_v4();
    let event = DomainEvent::new(EventType::StreamStarted, json!({"stream_id": "s1"}));
    let job = WebhookJob::new(endpoint_id, event);

    assert_eq!(job.routing_key(), format!("webhooks.{}", endpoint_id));
}

/// Test: Routing key grammar accepts only the two known prefixes
#[test]
fn test_routing_key_grammar_is_enforced() {
    assert!(validate_routing_key("events.stream.started").is_ok());
    assert!(validate_routing_key(&format!("webhooks.{}", Uuid::new_v4())).is_ok());

    assert!(validate_routing_key("notifications.push").is_err());
    assert!(validate_routing_key("events.").is_err());
    assert!(validate_routing_key("webhooks.").is_err());
    assert!(validate_routing_key("").is_err());
    assert!(validate_routing_key("stream.started").is_err());
}

/// Test: Delay queues are named for the delay rounded to whole seconds
#[test]
fn test_delay_queue_names_round_to_whole_seconds() {
    assert_eq!(delay_queue_name(5000), "delayedQueue_5s");
    assert_eq!(delay_queue_name(5400), "delayedQueue_5s");
    assert_eq!(delay_queue_name(4600), "delayedQueue_5s");
    assert_eq!(delay_queue_name(12000), "delayedQueue_12s");
}

/// Test: Delays rounding to the same second share queue parameters
#[test]
fn test_shared_delay_queues_share_parameters() {
    assert_eq!(delay_queue_ttl_ms(5400), delay_queue_ttl_ms(4600));
    assert_eq!(delay_queue_expiry_ms(5400), delay_queue_expiry_ms(4600));
}

/// Test: Delay queue TTL and expiry carry their fixed margins
#[test]
fn test_delay_queue_ttl_and_expiry_margins() {
    assert_eq!(delay_queue_ttl_ms(5000), 5100);
    assert_eq!(delay_queue_expiry_ms(5000), 20000);
}

/// Test: Attempt schedule backs off exponentially up to the cap
#[test]
fn test_attempt_schedule_backs_off_to_cap() {
    let config = retry_config();

    let first = DeliveryAttempt::first(&config);
    assert_eq!(first.count, 1);
    assert_eq!(first.next_delay_ms, 1000);

    let second = first.next(&config).unwrap();
    assert_eq!(second.count, 2);
    assert_eq!(second.next_delay_ms, 2000);

    let third = second.next(&config).unwrap();
    assert_eq!(third.count, 3);
    assert_eq!(third.next_delay_ms, 4000);

    let fourth = third.next(&config).unwrap();
    assert_eq!(fourth.count, 4);
    assert_eq!(fourth.next_delay_ms, 4000, "Delay should stay at the cap");
}

/// Test: Attempt schedule exhausts at the configured maximum
#[test]
fn test_attempt_schedule_exhausts_at_max_attempts() {
    let config = retry_config();

    let mut attempt = DeliveryAttempt::first(&config);
    for _ in 1..config.max_attempts {
        attempt = attempt.next(&config).unwrap();
    }

    assert_eq!(attempt.count, config.max_attempts);
    assert!(
        attempt.next(&config).is_none(),
        "Schedule should be exhausted after max attempts"
    );
}

/// Test: Events preserve their payload through a JSON round-trip
#[test]
fn test_event_payload_survives_json_round_trip() {
    let event = DomainEvent::new(
        EventType::StreamStarted,
        json!({"stream_id": "s1", "viewers": 42, "tags": ["live", "hd"]}),
    );

    let serialized = serde_json::to_string(&event).unwrap();
    assert!(serialized.contains("\"stream.started\""));

    let deserialized: DomainEvent = serde_json::from_str(&serialized).unwrap();
    assert_eq!(deserialized.id, event.id);
    assert_eq!(deserialized.event_type, event.event_type);
    assert_eq!(deserialized.payload, event.payload);
}

/// Test: Webhook jobs preserve their structure through a JSON round-trip
#[test]
fn test_webhook_job_survives_json_round_trip() {
    let job = WebhookJob::new(
        Uuid::new_v4(),
        DomainEvent::new(EventType::RecordingReady, json!({"asset_id": "a9"})),
    );

    let serialized = serde_json::to_vec(&job).unwrap();
    let deserialized: WebhookJob = serde_json::from_slice(&serialized).unwrap();

    assert_eq!(deserialized.endpoint_id, job.endpoint_id);
    assert_eq!(deserialized.event.id, job.event.id);
    assert_eq!(deserialized.event.payload, job.event.payload);
}
