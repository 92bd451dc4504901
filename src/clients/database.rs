use anyhow::{Error, Result, anyhow};
use tokio_postgres::{NoTls, Row};
use tracing::{debug, error, info};
use uuid::Uuid;

use crate::models::webhook::{CreateDeliveryLog, WebhookEndpoint};

pub struct DatabaseClient {
    client: tokio_postgres::Client,
}

impl DatabaseClient {
    pub async fn connect(database_url: &str) -> Result<Self, Error> {
        info!("Connecting to PostgreSQL database");

        let (client, connection) = tokio_postgres::connect(database_url, NoTls)
            .await
            .map_err(|e| anyhow!("Failed to connect to database: {}", e))?;

        tokio::spawn(async move {
            if let Err(e) = connection.await {
                error!(error = %e, "PostgreSQL connection task failed");
            }
        });

        info!("PostgreSQL connection established");

        Ok(Self { client })
    }

    /// Active endpoints subscribed to the given event type; the fan-out
    /// consumer turns each into one webhook-delivery job.
    pub async fn find_subscribed_endpoints(
        &self,
        event_type: &str,
    ) -> Result<Vec<WebhookEndpoint>, Error> {
        let rows = self
            .client
            .query(
                "SELECT id, url, secret, active, event_types \
                 FROM webhook_endpoints \
                 WHERE active AND $1 = ANY(event_types)",
                &[&event_type],
            )
            .await
            .map_err(|e| anyhow!("Failed to query subscribed endpoints: {}", e))?;

        Ok(rows.iter().map(row_to_endpoint).collect())
    }

    pub async fn find_endpoint(&self, endpoint_id: Uuid) -> Result<Option<WebhookEndpoint>, Error> {
        let row = self
            .client
            .query_opt(
                "SELECT id, url, secret, active, event_types \
                 FROM webhook_endpoints \
                 WHERE id = $1",
                &[&endpoint_id],
            )
            .await
            .map_err(|e| anyhow!("Failed to query endpoint: {}", e))?;

        Ok(row.as_ref().map(row_to_endpoint))
    }

    pub async fn log_delivery(&self, log: CreateDeliveryLog) -> Result<(), Error> {
        let status_str = log.status.to_string();

        self.client
            .execute(
                "INSERT INTO webhook_deliveries (\
                     endpoint_id, \
                     event_id, \
                     event_type, \
                     status, \
                     attempt, \
                     response_status, \
                     error_message\
                 ) \
                 VALUES ($1, $2, $3, $4, $5, $6, $7)",
                &[
                    &log.endpoint_id,
                    &log.event_id,
                    &log.event_type,
                    &status_str,
                    &log.attempt,
                    &log.response_status,
                    &log.error_message,
                ],
            )
            .await
            .map_err(|e| {
                error!(
                    error = %e,
                    event_id = %log.event_id,
                    "Failed to write delivery log to database"
                );
                anyhow!("Database write failed: {}", e)
            })?;

        debug!(
            event_id = %log.event_id,
            status = %status_str,
            "Delivery log written to database"
        );

        Ok(())
    }

    pub async fn health_check(&self) -> Result<(), Error> {
        self.client
            .query_one("SELECT 1", &[])
            .await
            .map_err(|e| anyhow!("Database health check failed: {}", e))?;

        Ok(())
    }
}

fn row_to_endpoint(row: &Row) -> WebhookEndpoint {
    WebhookEndpoint {
        id: row.get("id"),
        url: row.get("url"),
        secret: row.get("secret"),
        active: row.get("active"),
        event_types: row.get("event_types"),
    }
}
