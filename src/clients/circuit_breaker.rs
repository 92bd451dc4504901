use anyhow::{Error, Result, anyhow};
use chrono::Utc;
use redis::{AsyncCommands, aio::MultiplexedConnection};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::models::circuit_breaker::{CircuitBreakerConfig, CircuitState};

/// Redis-backed circuit breaker, one state machine per webhook destination.
/// An open circuit short-circuits the outbound call; the failed delivery
/// then flows through the normal backoff path.
pub struct CircuitBreaker {
    scope: String,
    connection: MultiplexedConnection,
    config: CircuitBreakerConfig,
}

impl CircuitBreaker {
    pub fn for_endpoint(
        endpoint_id: Uuid,
        connection: MultiplexedConnection,
        config: CircuitBreakerConfig,
    ) -> Self {
        Self {
            scope: format!("webhook:{}", endpoint_id),
            connection,
            config,
        }
    }

    pub async fn call<F, Fut, T>(&mut self, operation: F) -> Result<T, Error>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<T, Error>>,
    {
        let state = self.get_state().await?;

        match state {
            CircuitState::Open => {
                if self.should_attempt_reset().await? {
                    info!(scope = %self.scope, "Circuit breaker attempting reset");
                    self.set_state(CircuitState::HalfOpen).await?;
                    return self.try_operation(operation).await;
                }
                warn!(scope = %self.scope, "Circuit breaker is open, rejecting request");
                Err(anyhow!("Circuit breaker is open for {}", self.scope))
            }
            CircuitState::HalfOpen => {
                debug!(scope = %self.scope, "Circuit breaker in half-open state");
                self.try_operation(operation).await
            }
            CircuitState::Closed => self.try_operation(operation).await,
        }
    }

    async fn try_operation<F, Fut, T>(&mut self, operation: F) -> Result<T, Error>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<T, Error>>,
    {
        match operation().await {
            Ok(result) => {
                self.record_success().await?;
                Ok(result)
            }
            Err(e) => {
                self.record_failure().await?;
                Err(e)
            }
        }
    }

    async fn record_success(&mut self) -> Result<(), Error> {
        let state = self.get_state().await?;

        if state == CircuitState::HalfOpen {
            let successes = self.increment_success_count().await?;
            debug!(
                scope = %self.scope,
                successes,
                threshold = self.config.success_threshold,
                "Circuit breaker success recorded"
            );

            if successes >= self.config.success_threshold {
                self.set_state(CircuitState::Closed).await?;
                self.reset_counters().await?;
                info!(scope = %self.scope, "Circuit breaker closed after successful recovery");
            }
        } else if state == CircuitState::Closed {
            self.reset_failure_count().await?;
        }

        Ok(())
    }

    async fn record_failure(&mut self) -> Result<(), Error> {
        let state = self.get_state().await?;

        if state == CircuitState::HalfOpen {
            self.set_state(CircuitState::Open).await?;
            self.set_opened_at().await?;
            warn!(scope = %self.scope, "Circuit breaker reopened after failed recovery attempt");
            return Ok(());
        }

        let failures = self.increment_failure_count().await?;
        debug!(
            scope = %self.scope,
            failures,
            threshold = self.config.failure_threshold,
            "Circuit breaker failure recorded"
        );

        if failures >= self.config.failure_threshold {
            self.set_state(CircuitState::Open).await?;
            self.set_opened_at().await?;
            warn!(
                scope = %self.scope,
                failures,
                "Circuit breaker opened due to consecutive failures"
            );
        }

        Ok(())
    }

    async fn get_state(&mut self) -> Result<CircuitState, Error> {
        let key = format!("circuit:{}:state", self.scope);
        let value: Option<String> = self.connection.get(&key).await?;

        Ok(value
            .map(|s| CircuitState::from_string(&s))
            .unwrap_or(CircuitState::Closed))
    }

    async fn set_state(&mut self, state: CircuitState) -> Result<(), Error> {
        let key = format!("circuit:{}:state", self.scope);
        self.connection
            .set::<_, _, ()>(&key, state.as_str())
            .await?;
        Ok(())
    }

    async fn increment_failure_count(&mut self) -> Result<u32, Error> {
        let key = format!("circuit:{}:failures", self.scope);
        let count: u32 = self.connection.incr(&key, 1).await?;
        self.connection
            .expire::<_, ()>(&key, self.config.timeout_seconds as i64)
            .await?;
        Ok(count)
    }

    async fn reset_failure_count(&mut self) -> Result<(), Error> {
        let key = format!("circuit:{}:failures", self.scope);
        self.connection.del::<_, ()>(&key).await?;
        Ok(())
    }

    async fn increment_success_count(&mut self) -> Result<u32, Error> {
        let key = format!("circuit:{}:successes", self.scope);
        let count: u32 = self.connection.incr(&key, 1).await?;
        Ok(count)
    }

    async fn reset_counters(&mut self) -> Result<(), Error> {
        let keys = vec![
            format!("circuit:{}:failures", self.scope),
            format!("circuit:{}:successes", self.scope),
            format!("circuit:{}:opened_at", self.scope),
        ];

        self.connection.del::<_, ()>(keys).await?;

        Ok(())
    }

    async fn set_opened_at(&mut self) -> Result<(), Error> {
        let key = format!("circuit:{}:opened_at", self.scope);
        let now = Utc::now().timestamp();
        self.connection.set::<_, _, ()>(&key, now).await?;
        Ok(())
    }

    async fn should_attempt_reset(&mut self) -> Result<bool, Error> {
        let key = format!("circuit:{}:opened_at", self.scope);
        let opened_at: Option<i64> = self.connection.get(&key).await?;

        if let Some(opened_at) = opened_at {
            let elapsed = Utc::now().timestamp() - opened_at;
            return Ok(elapsed >= self.config.timeout_seconds as i64);
        }

        Ok(false)
    }
}
