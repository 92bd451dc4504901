use anyhow::{Error, Result, anyhow};
use futures_util::StreamExt;
use tokio::time::{Duration, sleep};
use tracing::{debug, error, info, warn};

use crate::{
    clients::{
        circuit_breaker::CircuitBreaker,
        database::DatabaseClient,
        rbmq::{RabbitMqClient, attempt_from_headers},
        redis::RedisClient,
        webhook::WebhookDispatcher,
    },
    config::Config,
    models::{
        event::DomainEvent,
        message::{DeliveryAttempt, WebhookJob},
        retry::RetryConfig,
        status::{DeliveryStatus, IdempotencyStatus},
        webhook::CreateDeliveryLog,
    },
};

/// Drains the internal events queue and fans each event out into one
/// delivery job per subscribed endpoint. Reconnects indefinitely once the
/// first connection has been established.
pub async fn run_event_fanout(config: Config) -> Result<(), Error> {
    let database_client = DatabaseClient::connect(&config.database_url).await?;

    loop {
        match consume_events(&config, &database_client).await {
            Ok(_) => warn!("Event consumer stream ended, reconnecting"),
            Err(e) => warn!(error = %e, "Event consumer disconnected, reconnecting"),
        }

        sleep(Duration::from_millis(config.reconnect_delay_ms)).await;
    }
}

async fn consume_events(config: &Config, database_client: &DatabaseClient) -> Result<(), Error> {
    let rabbitmq = RabbitMqClient::connect(config).await?;
    let mut consumer = rabbitmq
        .create_consumer(rabbitmq.events_queue_name(), "event_fanout")
        .await?;
    let retry_config = config.retry_config();

    while let Some(delivery) = consumer.next().await {
        let delivery = delivery.map_err(|e| anyhow!("Consumer stream error: {}", e))?;

        let attempt = attempt_from_headers(delivery.properties.headers().as_ref(), &retry_config);

        let event = match serde_json::from_slice::<DomainEvent>(&delivery.data) {
            Ok(event) => event,
            Err(e) => {
                warn!(error = %e, "Discarding unparseable event message");
                rabbitmq.reject(delivery.delivery_tag, false).await?;
                continue;
            }
        };

        match process_event(&event, database_client, &rabbitmq, &retry_config).await {
            Ok(job_count) => {
                debug!(event_id = %event.id, job_count, "Event fanned out");
                rabbitmq.acknowledge(delivery.delivery_tag).await?;
            }
            Err(e) => {
                warn!(
                    event_id = %event.id,
                    attempt = attempt.count,
                    error = %e,
                    "Event fan-out failed"
                );

                rabbitmq.acknowledge(delivery.delivery_tag).await?;

                match attempt.next(&retry_config) {
                    Some(next) => {
                        rabbitmq
                            .delayed_publish(
                                &event.routing_key(),
                                &delivery.data,
                                attempt.next_delay_ms,
                                &next,
                            )
                            .await?;
                    }
                    None => {
                        error!(
                            event_id = %event.id,
                            attempts = attempt.count,
                            "Fan-out attempts exhausted, dropping event"
                        );
                    }
                }
            }
        }
    }

    Ok(())
}

pub async fn process_event(
    event: &DomainEvent,
    database_client: &DatabaseClient,
    rabbitmq: &RabbitMqClient,
    retry_config: &RetryConfig,
) -> Result<usize, Error> {
    let endpoints = database_client
        .find_subscribed_endpoints(event.event_type.as_str())
        .await?;

    for endpoint in &endpoints {
        let job = WebhookJob::new(endpoint.id, event.clone());
        let payload = serde_json::to_vec(&job)?;

        rabbitmq
            .publish(
                &job.routing_key(),
                &payload,
                &DeliveryAttempt::first(retry_config),
            )
            .await?;
    }

    Ok(endpoints.len())
}

/// One delivery worker: its own connection and channel, so prefetch = 1
/// serializes processing within the worker while workers stay independent.
pub async fn run_delivery_worker(config: Config, worker_id: usize) -> Result<(), Error> {
    let mut redis_client = RedisClient::connect(&config).await?;
    let database_client = DatabaseClient::connect(&config.database_url).await?;
    let dispatcher = WebhookDispatcher::new(&config)?;

    loop {
        match consume_webhook_jobs(
            &config,
            worker_id,
            &mut redis_client,
            &dispatcher,
            &database_client,
        )
        .await
        {
            Ok(_) => warn!(worker_id, "Webhook consumer stream ended, reconnecting"),
            Err(e) => warn!(worker_id, error = %e, "Webhook consumer disconnected, reconnecting"),
        }

        sleep(Duration::from_millis(config.reconnect_delay_ms)).await;
    }
}

async fn consume_webhook_jobs(
    config: &Config,
    worker_id: usize,
    redis_client: &mut RedisClient,
    dispatcher: &WebhookDispatcher,
    database_client: &DatabaseClient,
) -> Result<(), Error> {
    let rabbitmq = RabbitMqClient::connect(config).await?;
    let mut consumer = rabbitmq
        .create_consumer(
            rabbitmq.webhooks_queue_name(),
            &format!("delivery_worker_{}", worker_id),
        )
        .await?;
    let retry_config = config.retry_config();

    while let Some(delivery) = consumer.next().await {
        let delivery = delivery.map_err(|e| anyhow!("Consumer stream error: {}", e))?;

        let attempt = attempt_from_headers(delivery.properties.headers().as_ref(), &retry_config);

        let job = match serde_json::from_slice::<WebhookJob>(&delivery.data) {
            Ok(job) => job,
            Err(e) => {
                warn!(error = %e, "Discarding unparseable webhook job");
                rabbitmq.reject(delivery.delivery_tag, false).await?;
                continue;
            }
        };

        match process_webhook_job(
            &job,
            &attempt,
            config,
            redis_client,
            dispatcher,
            database_client,
        )
        .await
        {
            Ok(_) => {
                rabbitmq.acknowledge(delivery.delivery_tag).await?;
            }
            Err(e) => {
                warn!(
                    endpoint_id = %job.endpoint_id,
                    event_id = %job.event.id,
                    attempt = attempt.count,
                    error = %e,
                    "Webhook delivery failed"
                );

                // Ack first; the broker never requeues on its own. Redelivery
                // goes through the delay queues with the incremented attempt.
                rabbitmq.acknowledge(delivery.delivery_tag).await?;

                match attempt.next(&retry_config) {
                    Some(next) => {
                        rabbitmq
                            .delayed_publish(
                                &job.routing_key(),
                                &delivery.data,
                                attempt.next_delay_ms,
                                &next,
                            )
                            .await?;
                    }
                    None => {
                        error!(
                            endpoint_id = %job.endpoint_id,
                            event_id = %job.event.id,
                            attempts = attempt.count,
                            "Delivery attempts exhausted, failing permanently"
                        );

                        let log = CreateDeliveryLog::new(
                            job.endpoint_id,
                            job.event.id,
                            job.event.event_type.as_str().to_string(),
                            DeliveryStatus::Failed,
                            attempt.count,
                        )
                        .with_error(format!("{}", e));

                        if let Err(log_err) = database_client.log_delivery(log).await {
                            warn!(error = %log_err, "Failed to write delivery log");
                        }
                    }
                }
            }
        }
    }

    Ok(())
}

pub async fn process_webhook_job(
    job: &WebhookJob,
    attempt: &DeliveryAttempt,
    config: &Config,
    redis_client: &mut RedisClient,
    dispatcher: &WebhookDispatcher,
    database_client: &DatabaseClient,
) -> Result<(), Error> {
    info!(
        endpoint_id = %job.endpoint_id,
        event_id = %job.event.id,
        event_type = %job.event.event_type,
        attempt = attempt.count,
        "Processing webhook job"
    );

    let delivery_key = format!("{}:{}", job.endpoint_id, job.event.id);

    match redis_client.check_idempotency(&delivery_key).await {
        Ok(IdempotencyStatus::Delivered) => {
            info!(
                delivery_key = %delivery_key,
                "Webhook already delivered, skipping"
            );
            return Ok(());
        }
        Ok(IdempotencyStatus::Processing) => {
            info!(
                delivery_key = %delivery_key,
                "Webhook is being delivered elsewhere, skipping"
            );
            return Ok(());
        }
        _ => {}
    }

    redis_client.mark_as_processing(&delivery_key).await?;

    let endpoint = match database_client.find_endpoint(job.endpoint_id).await? {
        Some(endpoint) => endpoint,
        None => {
            info!(endpoint_id = %job.endpoint_id, "Endpoint no longer exists, dropping job");
            redis_client.mark_as_failed(&delivery_key).await?;
            return Ok(());
        }
    };

    if !endpoint.active || !endpoint.subscribes_to(job.event.event_type.as_str()) {
        info!(
            endpoint_id = %endpoint.id,
            "Endpoint inactive or unsubscribed, dropping job"
        );
        redis_client.mark_as_failed(&delivery_key).await?;
        return Ok(());
    }

    let mut circuit_breaker = CircuitBreaker::for_endpoint(
        endpoint.id,
        redis_client.connection(),
        config.circuit_breaker_config(),
    );

    match circuit_breaker
        .call(|| dispatcher.deliver(&endpoint, &job.event, attempt))
        .await
    {
        Ok(response_status) => {
            redis_client.mark_as_delivered(&delivery_key).await?;

            let log = CreateDeliveryLog::new(
                endpoint.id,
                job.event.id,
                job.event.event_type.as_str().to_string(),
                DeliveryStatus::Delivered,
                attempt.count,
            )
            .with_response_status(response_status);

            if let Err(log_err) = database_client.log_delivery(log).await {
                warn!(error = %log_err, "Failed to write delivery log");
            }

            info!(
                endpoint_id = %endpoint.id,
                event_id = %job.event.id,
                "Webhook job completed"
            );
            Ok(())
        }
        Err(e) => {
            redis_client.mark_as_failed(&delivery_key).await?;

            let log = CreateDeliveryLog::new(
                endpoint.id,
                job.event.id,
                job.event.event_type.as_str().to_string(),
                DeliveryStatus::Retrying,
                attempt.count,
            )
            .with_error(format!("{}", e));

            if let Err(log_err) = database_client.log_delivery(log).await {
                warn!(error = %log_err, "Failed to write delivery log");
            }

            Err(anyhow!("Webhook delivery failed: {}", e))
        }
    }
}

pub async fn retry_with_backoff<F, Fut, T, E>(config: &RetryConfig, operation: F) -> Result<T, E>
where
    F: Fn() -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let mut attempt = 0;
    let mut delay_ms = config.initial_delay_ms;

    loop {
        attempt += 1;

        match operation().await {
            Ok(result) => {
                if attempt > 1 {
                    info!(
                        attempt,
                        max_attempts = config.max_attempts,
                        "Retry succeeded"
                    );
                }
                return Ok(result);
            }
            Err(e) => {
                if attempt >= config.max_attempts {
                    warn!(
                        max_attempts = config.max_attempts,
                        error = %e,
                        "Retry failed after exhausting all attempts"
                    );
                    return Err(e);
                }

                debug!(
                    attempt,
                    max_attempts = config.max_attempts,
                    delay_ms,
                    "Retry attempt failed, backing off"
                );

                let jitter = rand::random_range(-0.1..=0.1);

                let jittered_delay = (delay_ms as f64 * (1.0 + jitter)) as u64;

                sleep(Duration::from_millis(jittered_delay)).await;

                delay_ms = std::cmp::min(delay_ms * config.backoff_multiplier, config.max_delay_ms);
            }
        }
    }
}
