use std::time::Duration;

use anyhow::{Error, Result, anyhow};
use reqwest::{Client, StatusCode};
use serde_json::{Value as JsonValue, json};
use tracing::{debug, info, warn};

use crate::{
    config::Config,
    models::media_server::{AuthCredential, ControlResponse},
};

const AUTH_STATUS_OK: &str = "OK";
const AUTH_STATUS_CHALLENGE: &str = "CHALL";

/// Client for the media server's control API. Commands are POSTed as a
/// URL-encoded `command` form field carrying a JSON envelope; the server
/// authenticates via a challenge-response handshake.
pub struct MediaServerClient {
    http_client: Client,
    api_url: String,
    username: String,
    password: String,
    auth: Option<AuthCredential>,
}

impl MediaServerClient {
    pub fn new(host: &str, port: u16, username: &str, password: &str) -> Result<Self, Error> {
        let http_client = Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(|_| anyhow!("Failed to create HTTP client"))?;

        Ok(Self {
            http_client,
            api_url: format!("http://{}:{}/api2", host, port),
            username: username.to_string(),
            password: password.to_string(),
            auth: None,
        })
    }

    pub fn from_config(config: &Config) -> Result<Self, Error> {
        Self::new(
            &config.media_server_host,
            config.media_server_port,
            &config.media_server_username,
            &config.media_server_password,
        )
    }

    /// Lists the names of currently live streams. Failures are logged and
    /// yield an empty list; they never propagate past the client.
    pub async fn list_active_streams(&mut self) -> Vec<String> {
        match self.execute(json!({ "active_streams": 1 })).await {
            Ok(response) => response.active_streams.unwrap_or_default(),
            Err(e) => {
                warn!(error = %e, "Failed to list active streams");
                Vec::new()
            }
        }
    }

    /// Forcibly terminates a live stream. Returns whether the server
    /// accepted the command.
    pub async fn terminate_stream(&mut self, stream_name: &str) -> bool {
        match self.execute(json!({ "nuke_stream": stream_name })).await {
            Ok(_) => {
                info!(stream = stream_name, "Stream terminated");
                true
            }
            Err(e) => {
                warn!(stream = stream_name, error = %e, "Failed to terminate stream");
                false
            }
        }
    }

    /// Runs one command through the handshake. On a `CHALL` reply the
    /// response hash is recomputed from the fresh challenge and the command
    /// is retried exactly once; a second rejection is a failure.
    async fn execute(&mut self, command: JsonValue) -> Result<ControlResponse, Error> {
        let response = self.send_command(&command).await?;

        match response.authorize_status() {
            AUTH_STATUS_OK => Ok(response),
            AUTH_STATUS_CHALLENGE => {
                let challenge = response
                    .challenge()
                    .ok_or_else(|| anyhow!("Challenge reply carried no challenge value"))?;

                debug!(
                    stale_challenge = self.auth.as_ref().map(|a| a.challenge.as_str()),
                    challenge,
                    "Renewing control API credentials"
                );

                self.auth = Some(AuthCredential::answer(&self.password, challenge));

                let retried = self.send_command(&command).await?;
                match retried.authorize_status() {
                    AUTH_STATUS_OK => Ok(retried),
                    status => Err(anyhow!(
                        "Control API rejected credentials with status {}",
                        status
                    )),
                }
            }
            status => Err(anyhow!("Control API returned authorize status {}", status)),
        }
    }

    async fn send_command(&self, command: &JsonValue) -> Result<ControlResponse, Error> {
        let mut envelope = command.clone();

        if let Some(auth) = &self.auth {
            envelope["authorize"] = json!({
                "username": self.username,
                "password": auth.response_hash,
            });
        }

        let response = self
            .http_client
            .post(&self.api_url)
            .form(&[("command", envelope.to_string())])
            .send()
            .await
            .map_err(|e| anyhow!("Control API request failed: {}", e))?;

        if response.status() != StatusCode::OK {
            return Err(anyhow!(
                "Control API returned HTTP status {}",
                response.status()
            ));
        }

        response
            .json::<ControlResponse>()
            .await
            .map_err(|e| anyhow!("Failed to parse control API response: {}", e))
    }
}
