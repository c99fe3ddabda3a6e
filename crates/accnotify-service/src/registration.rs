//! Device registration with the push server.

use anyhow::anyhow;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use tracing::info;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum RegistrationError {
    #[error("server unreachable: {0}")]
    Unreachable(String),
    #[error("registration timed out")]
    Timeout,
    #[error("registration rejected ({status}): {message}")]
    Rejected { status: u16, message: String },
    #[error("unexpected response: {0}")]
    Protocol(String),
}

#[derive(Debug, Serialize)]
struct RegisterRequest<'a> {
    device_key: &'a str,
    public_key: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    name: Option<&'a str>,
}

#[derive(Debug, Deserialize)]
struct RegisterResponse {
    #[serde(default)]
    success: bool,
    #[serde(default)]
    device_key: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

#[derive(Clone)]
pub struct RegistrationClient {
    client: reqwest::Client,
    base_url: String,
}

impl RegistrationClient {
    pub fn new(server_url: &str) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("accnotify/", env!("CARGO_PKG_VERSION")))
            .connect_timeout(REQUEST_TIMEOUT)
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| anyhow!("http client: {e}"))?;
        Ok(Self {
            client,
            base_url: server_url.trim_end_matches('/').to_string(),
        })
    }

    /// Register `device_key` with `public_key_pem`. Returns the key the
    /// server confirmed, which is the one to use from now on.
    pub async fn register(
        &self,
        device_key: &str,
        public_key_pem: &str,
        name: Option<&str>,
    ) -> Result<String, RegistrationError> {
        let url = format!("{}/register", self.base_url);
        let res = self
            .client
            .post(url)
            .json(&RegisterRequest {
                device_key,
                public_key: public_key_pem,
                name,
            })
            .send()
            .await
            .map_err(classify)?;

        let status = res.status();
        let text = res.text().await.map_err(classify)?;
        if !status.is_success() {
            let message = serde_json::from_str::<RegisterResponse>(&text)
                .ok()
                .and_then(|r| r.message)
                .unwrap_or(text);
            return Err(RegistrationError::Rejected {
                status: status.as_u16(),
                message,
            });
        }
        interpret(&text, device_key)
    }
}

/// Name reported to the server when none is configured.
pub fn default_device_name() -> Option<String> {
    std::env::var("HOSTNAME")
        .ok()
        .or_else(|| std::fs::read_to_string("/etc/hostname").ok())
        .map(|name| name.trim().to_string())
        .filter(|name| !name.is_empty())
}

fn classify(err: reqwest::Error) -> RegistrationError {
    if err.is_timeout() {
        RegistrationError::Timeout
    } else if err.is_connect() || err.is_request() {
        RegistrationError::Unreachable(err.to_string())
    } else {
        RegistrationError::Protocol(err.to_string())
    }
}

fn interpret(body: &str, requested: &str) -> Result<String, RegistrationError> {
    let response: RegisterResponse =
        serde_json::from_str(body).map_err(|e| RegistrationError::Protocol(e.to_string()))?;
    if !response.success {
        return Err(RegistrationError::Rejected {
            status: 200,
            message: response
                .message
                .unwrap_or_else(|| "server declined registration".into()),
        });
    }
    let key = response
        .device_key
        .filter(|k| !k.is_empty())
        .unwrap_or_else(|| requested.to_string());
    info!(device_key = %key, "device registered");
    Ok(key)
}
