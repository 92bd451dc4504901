use anyhow::{Error, Result, anyhow};
use lapin::{
    BasicProperties, Channel, Connection, ConnectionProperties, Consumer, ExchangeKind,
    options::{
        BasicAckOptions, BasicConsumeOptions, BasicPublishOptions, BasicQosOptions,
        BasicRejectOptions, ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions,
    },
    types::{AMQPValue, FieldTable, LongString, ShortString},
};
use tracing::{debug, error, info};

use crate::{
    config::Config,
    models::{event::DomainEvent, message::DeliveryAttempt, retry::RetryConfig},
};

pub const EVENTS_ROUTING_PREFIX: &str = "events.";
pub const WEBHOOKS_ROUTING_PREFIX: &str = "webhooks.";

const ATTEMPT_HEADER: &str = "x-delivery-attempt";
const NEXT_DELAY_HEADER: &str = "x-next-delay-ms";

/// Margin added to a delay queue's message TTL so redelivery never races the
/// queue's own declaration.
const DELAY_TTL_MARGIN_MS: u64 = 100;

/// Margin after which an idle delay queue is dropped by the broker.
const DELAY_QUEUE_EXPIRY_MARGIN_MS: u64 = 15000;

pub struct RabbitMqClient {
    pub channel: Channel,
    connection: Connection,
    exchange_name: String,
    events_queue_name: String,
    webhooks_queue_name: String,
}

impl RabbitMqClient {
    pub async fn connect(config: &Config) -> Result<Self, Error> {
        info!("Connecting to RabbitMQ...");

        let connection = Connection::connect(&config.rabbitmq_url, ConnectionProperties::default())
            .await
            .map_err(|_| anyhow!("Failed to connect to RabbitMQ"))?;

        connection.on_error(|e| {
            error!(error = %e, "RabbitMQ connection error");
        });

        info!("RabbitMQ connection established");

        let channel = connection
            .create_channel()
            .await
            .map_err(|_| anyhow!("RabbitMQ channel creation failed"))?;

        ensure_topology(&channel, config).await?;

        Ok(Self {
            channel,
            connection,
            exchange_name: config.exchange_name.clone(),
            events_queue_name: config.events_queue_name.clone(),
            webhooks_queue_name: config.webhooks_queue_name.clone(),
        })
    }

    pub async fn close(&self) -> Result<(), Error> {
        self.connection
            .close(200, "shutdown")
            .await
            .map_err(|_| anyhow!("Failed to close RabbitMQ connection"))?;

        Ok(())
    }

    pub fn events_queue_name(&self) -> &str {
        &self.events_queue_name
    }

    pub fn webhooks_queue_name(&self) -> &str {
        &self.webhooks_queue_name
    }

    pub async fn create_consumer(&self, queue_name: &str, consumer_tag: &str) -> Result<Consumer, Error> {
        let consumer = self
            .channel
            .basic_consume(
                queue_name,
                consumer_tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|_| anyhow!("Failed to create consumer for {}", queue_name))?;

        info!(queue = queue_name, consumer_tag, "Consumer created for queue");

        Ok(consumer)
    }

    pub async fn acknowledge(&self, delivery_tag: u64) -> Result<(), Error> {
        self.channel
            .basic_ack(delivery_tag, BasicAckOptions::default())
            .await
            .map_err(|_| anyhow!("Failed to acknowledge message"))?;

        Ok(())
    }

    pub async fn reject(&self, delivery_tag: u64, requeue: bool) -> Result<(), Error> {
        self.channel
            .basic_reject(delivery_tag, BasicRejectOptions { requeue })
            .await
            .map_err(|_| anyhow!("Failed to reject message"))?;

        Ok(())
    }

    /// Same-process enqueue: places the event directly onto the internal
    /// events queue, bypassing exchange routing.
    pub async fn send_to_queue(&self, event: &DomainEvent) -> Result<(), Error> {
        let payload = serde_json::to_vec(event)?;

        self.channel
            .basic_publish(
                "",
                &self.events_queue_name,
                BasicPublishOptions::default(),
                &payload,
                persistent_json_properties(),
            )
            .await
            .map_err(|_| anyhow!("Failed to publish message to events queue"))?;

        Ok(())
    }

    pub async fn publish(
        &self,
        routing_key: &str,
        payload: &[u8],
        attempt: &DeliveryAttempt,
    ) -> Result<(), Error> {
        validate_routing_key(routing_key)?;

        self.channel
            .basic_publish(
                &self.exchange_name,
                routing_key,
                BasicPublishOptions::default(),
                payload,
                persistent_json_properties().with_headers(attempt_headers(attempt)),
            )
            .await
            .map_err(|_| anyhow!("Failed to publish message with key {}", routing_key))?;

        debug!(routing_key, attempt = attempt.count, "Message published to exchange");

        Ok(())
    }

    /// Publishes onto a per-delay dead-lettering queue. Once the message's
    /// TTL expires the broker dead-letters it back onto the main exchange
    /// with the original routing key, so it behaves as a fresh publish.
    pub async fn delayed_publish(
        &self,
        routing_key: &str,
        payload: &[u8],
        delay_ms: u64,
        attempt: &DeliveryAttempt,
    ) -> Result<(), Error> {
        validate_routing_key(routing_key)?;

        let queue_name = delay_queue_name(delay_ms);

        let mut arguments = FieldTable::default();
        arguments.insert(
            ShortString::from("x-message-ttl"),
            AMQPValue::LongLongInt(delay_queue_ttl_ms(delay_ms) as i64),
        );
        arguments.insert(
            ShortString::from("x-dead-letter-exchange"),
            AMQPValue::LongString(LongString::from(self.exchange_name.as_str())),
        );
        arguments.insert(
            ShortString::from("x-dead-letter-routing-key"),
            AMQPValue::LongString(LongString::from(routing_key)),
        );
        arguments.insert(
            ShortString::from("x-expires"),
            AMQPValue::LongLongInt(delay_queue_expiry_ms(delay_ms) as i64),
        );

        self.channel
            .queue_declare(
                &queue_name,
                QueueDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                arguments,
            )
            .await
            .map_err(|_| anyhow!("Failed to declare delay queue {}", queue_name))?;

        self.channel
            .basic_publish(
                "",
                &queue_name,
                BasicPublishOptions::default(),
                payload,
                persistent_json_properties().with_headers(attempt_headers(attempt)),
            )
            .await
            .map_err(|_| anyhow!("Failed to publish message to delay queue {}", queue_name))?;

        debug!(
            routing_key,
            delay_ms,
            queue = %queue_name,
            attempt = attempt.count,
            "Message parked for delayed redelivery"
        );

        Ok(())
    }
}

/// Declares the exchange, the two durable queues, and their bindings, and
/// sets consumer prefetch. Safe to repeat; runs on every (re)connect so the
/// topology exists before anything is published or consumed.
pub async fn ensure_topology(channel: &Channel, config: &Config) -> Result<(), Error> {
    channel
        .basic_qos(config.prefetch_count, BasicQosOptions::default())
        .await
        .map_err(|_| anyhow!("Failed to set up QoS"))?;

    channel
        .exchange_declare(
            &config.exchange_name,
            ExchangeKind::Topic,
            ExchangeDeclareOptions {
                durable: true,
                ..Default::default()
            },
            FieldTable::default(),
        )
        .await
        .map_err(|_| anyhow!("Failed to declare exchange"))?;

    channel
        .queue_declare(
            &config.events_queue_name,
            QueueDeclareOptions {
                durable: true,
                ..Default::default()
            },
            FieldTable::default(),
        )
        .await
        .map_err(|_| anyhow!("Failed to declare events queue"))?;

    channel
        .queue_bind(
            &config.events_queue_name,
            &config.exchange_name,
            "events.#",
            QueueBindOptions::default(),
            FieldTable::default(),
        )
        .await
        .map_err(|_| anyhow!("Failed to bind events queue"))?;

    channel
        .queue_declare(
            &config.webhooks_queue_name,
            QueueDeclareOptions {
                durable: true,
                ..Default::default()
            },
            FieldTable::default(),
        )
        .await
        .map_err(|_| anyhow!("Failed to declare webhooks queue"))?;

    channel
        .queue_bind(
            &config.webhooks_queue_name,
            &config.exchange_name,
            "webhooks.#",
            QueueBindOptions::default(),
            FieldTable::default(),
        )
        .await
        .map_err(|_| anyhow!("Failed to bind webhooks queue"))?;

    info!(
        exchange = %config.exchange_name,
        events_queue = %config.events_queue_name,
        webhooks_queue = %config.webhooks_queue_name,
        "Broker topology ensured"
    );

    Ok(())
}

pub fn validate_routing_key(routing_key: &str) -> Result<(), Error> {
    let suffix = routing_key
        .strip_prefix(EVENTS_ROUTING_PREFIX)
        .or_else(|| routing_key.strip_prefix(WEBHOOKS_ROUTING_PREFIX));

    match suffix {
        Some(s) if !s.is_empty() => Ok(()),
        _ => Err(anyhow!("Invalid routing key: {}", routing_key)),
    }
}

/// Delay queues are named for the delay rounded to whole seconds, so calls
/// whose delays round to the same second share one queue.
pub fn delay_queue_name(delay_ms: u64) -> String {
    format!("delayedQueue_{}s", rounded_delay_seconds(delay_ms))
}

pub fn delay_queue_ttl_ms(delay_ms: u64) -> u64 {
    rounded_delay_seconds(delay_ms) * 1000 + DELAY_TTL_MARGIN_MS
}

pub fn delay_queue_expiry_ms(delay_ms: u64) -> u64 {
    rounded_delay_seconds(delay_ms) * 1000 + DELAY_QUEUE_EXPIRY_MARGIN_MS
}

fn rounded_delay_seconds(delay_ms: u64) -> u64 {
    (delay_ms + 500) / 1000
}

pub fn attempt_headers(attempt: &DeliveryAttempt) -> FieldTable {
    let mut headers = FieldTable::default();
    headers.insert(
        ShortString::from(ATTEMPT_HEADER),
        AMQPValue::LongUInt(attempt.count),
    );
    headers.insert(
        ShortString::from(NEXT_DELAY_HEADER),
        AMQPValue::LongLongInt(attempt.next_delay_ms as i64),
    );
    headers
}

/// Reads the attempt state back out of a delivery's headers. Messages
/// published without headers count as a first attempt.
pub fn attempt_from_headers(
    headers: Option<&FieldTable>,
    retry_config: &RetryConfig,
) -> DeliveryAttempt {
    let Some(headers) = headers else {
        return DeliveryAttempt::first(retry_config);
    };

    let count = match headers.inner().get(&ShortString::from(ATTEMPT_HEADER)) {
        Some(AMQPValue::LongUInt(v)) => *v,
        Some(AMQPValue::LongLongInt(v)) => *v as u32,
        Some(AMQPValue::ShortShortInt(v)) => *v as u32,
        _ => return DeliveryAttempt::first(retry_config),
    };

    let next_delay_ms = match headers.inner().get(&ShortString::from(NEXT_DELAY_HEADER)) {
        Some(AMQPValue::LongLongInt(v)) => *v as u64,
        Some(AMQPValue::LongUInt(v)) => *v as u64,
        _ => retry_config.initial_delay_ms,
    };

    DeliveryAttempt { count, next_delay_ms }
}

fn persistent_json_properties() -> BasicProperties {
    BasicProperties::default()
        .with_delivery_mode(2)
        .with_content_type(ShortString::from("application/json"))
}
