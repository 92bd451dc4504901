use anyhow::{Error, Result, anyhow};
use redis::{AsyncCommands, Client, aio::MultiplexedConnection};
use tracing::warn;

use crate::{
    config::Config,
    models::{retry::RetryConfig, status::IdempotencyStatus},
    utils::retry_with_backoff,
};

pub struct RedisClient {
    connection: MultiplexedConnection,
    idempotency_ttl_seconds: u64,
    retry_config: RetryConfig,
}

impl RedisClient {
    pub async fn connect(config: &Config) -> Result<Self, Error> {
        let client = Client::open(config.redis_url.as_str())
            .map_err(|_| anyhow!("Failed to create redis client"))?;

        let connection = client
            .get_multiplexed_async_connection()
            .await
            .map_err(|_| anyhow!("Failed to connect to redis client"))?;

        Ok(Self {
            connection,
            idempotency_ttl_seconds: config.idempotency_ttl_seconds,
            retry_config: config.retry_config(),
        })
    }

    pub fn connection(&self) -> MultiplexedConnection {
        self.connection.clone()
    }

    /// Delivery keys are `<endpoint_id>:<event_id>`, so at-least-once
    /// redeliveries of an already-delivered job can be skipped.
    pub async fn check_idempotency(
        &mut self,
        delivery_key: &str,
    ) -> Result<IdempotencyStatus, Error> {
        let key = format!("idempotency:{}", delivery_key);

        let value: Option<String> = self
            .connection
            .get(&key)
            .await
            .map_err(|_| anyhow!("Failed to get cached value"))?;

        match value.as_deref() {
            None => Ok(IdempotencyStatus::NotFound),
            Some("processing") => Ok(IdempotencyStatus::Processing),
            Some("delivered") => Ok(IdempotencyStatus::Delivered),
            Some("failed") => Ok(IdempotencyStatus::Failed),
            Some(other) => {
                warn!(status = other, key = %key, "Unknown idempotency status");
                Ok(IdempotencyStatus::NotFound)
            }
        }
    }

    pub async fn mark_as_processing(&mut self, delivery_key: &str) -> Result<(), Error> {
        let key = format!("idempotency:{}", delivery_key);

        self.connection
            .set_ex::<_, _, ()>(&key, "processing", self.idempotency_ttl_seconds)
            .await
            .map_err(|e| anyhow!("Failed to mark delivery as processing: {}", e))?;

        Ok(())
    }

    pub async fn mark_as_delivered(&mut self, delivery_key: &str) -> Result<(), Error> {
        let key = format!("idempotency:{}", delivery_key);

        retry_with_backoff(&self.retry_config, || {
            let key_clone = key.clone();
            let mut conn = self.connection.clone();
            let ttl = self.idempotency_ttl_seconds;

            async move {
                conn.set_ex::<_, _, ()>(&key_clone, "delivered", ttl)
                    .await
                    .map_err(|e| e.to_string())
            }
        })
        .await
        .map_err(|e| anyhow!("mark_as_delivered failed: {}", e))?;

        Ok(())
    }

    pub async fn mark_as_failed(&mut self, delivery_key: &str) -> Result<(), Error> {
        let key = format!("idempotency:{}", delivery_key);

        self.connection
            .set_ex::<_, _, ()>(&key, "failed", self.idempotency_ttl_seconds)
            .await
            .map_err(|_| anyhow!("Failed to mark delivery as failed"))?;

        Ok(())
    }
}
