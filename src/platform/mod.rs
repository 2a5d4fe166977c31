//! Chat platform client
//!
//! Boundary to the chat platform's REST API. The toolkit only needs four
//! message operations, so the surface is a small trait; handlers and the
//! migrator take it as a trait object, and tests substitute mocks. The
//! HTTP implementation targets the platform's post endpoints with a
//! bearer token and a per-request timeout, so one unreachable message
//! cannot stall a migration batch.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde_json::{json, Value};

/// Default per-request timeout.
const DEFAULT_TIMEOUT_SECS: u64 = 10;

/// Errors from platform calls.
#[derive(Debug, thiserror::Error)]
pub enum PlatformError {
    #[error("message not found: {0}")]
    NotFound(String),
    #[error("request failed: {0}")]
    Transport(String),
    #[error("platform rejected request ({status}): {message}")]
    Api { status: u16, message: String },
}

impl From<reqwest::Error> for PlatformError {
    fn from(err: reqwest::Error) -> Self {
        PlatformError::Transport(err.to_string())
    }
}

/// Message operations the toolkit performs against the platform.
#[async_trait]
pub trait PlatformClient: Send + Sync {
    /// Whether the message still exists on the platform.
    async fn message_exists(&self, message_id: &str) -> Result<bool, PlatformError>;

    /// Create a message in a channel; returns the platform message id.
    async fn create_message(
        &self,
        channel_id: &str,
        text: &str,
        payload: &Value,
    ) -> Result<String, PlatformError>;

    /// Replace a message's text and interactive payload.
    async fn update_message(
        &self,
        message_id: &str,
        text: &str,
        payload: &Value,
    ) -> Result<(), PlatformError>;

    /// Delete a message. Deleting an already-gone message is an error
    /// (`NotFound`) so callers can distinguish it.
    async fn delete_message(&self, message_id: &str) -> Result<(), PlatformError>;
}

/// REST implementation against the platform's post API.
pub struct HttpPlatformClient {
    client: reqwest::Client,
    base_url: String,
    token: String,
}

impl HttpPlatformClient {
    /// Create a client for the given API base URL and bearer token.
    pub fn new(base_url: impl Into<String>, token: impl Into<String>) -> Result<Self, PlatformError> {
        Self::with_timeout(base_url, token, Duration::from_secs(DEFAULT_TIMEOUT_SECS))
    }

    /// Create a client with an explicit per-request timeout.
    pub fn with_timeout(
        base_url: impl Into<String>,
        token: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, PlatformError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url: base_url.into(),
            token: token.into(),
        })
    }

    /// Build the endpoint URL for a post.
    fn post_url(&self, message_id: &str) -> String {
        let base = self.base_url.trim_end_matches('/');
        format!("{}/api/v4/posts/{}", base, message_id)
    }

    fn posts_url(&self) -> String {
        let base = self.base_url.trim_end_matches('/');
        format!("{}/api/v4/posts", base)
    }

    async fn check_status(resp: reqwest::Response, message_id: &str) -> Result<reqwest::Response, PlatformError> {
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        if status == StatusCode::NOT_FOUND {
            return Err(PlatformError::NotFound(message_id.to_string()));
        }
        let message = resp
            .text()
            .await
            .ok()
            .filter(|body| !body.is_empty())
            .unwrap_or_else(|| "request failed".to_string());
        Err(PlatformError::Api {
            status: status.as_u16(),
            message,
        })
    }
}

#[async_trait]
impl PlatformClient for HttpPlatformClient {
    async fn message_exists(&self, message_id: &str) -> Result<bool, PlatformError> {
        let resp = self
            .client
            .get(self.post_url(message_id))
            .bearer_auth(&self.token)
            .send()
            .await?;

        match Self::check_status(resp, message_id).await {
            Ok(_) => Ok(true),
            Err(PlatformError::NotFound(_)) => Ok(false),
            Err(err) => Err(err),
        }
    }

    async fn create_message(
        &self,
        channel_id: &str,
        text: &str,
        payload: &Value,
    ) -> Result<String, PlatformError> {
        let resp = self
            .client
            .post(self.posts_url())
            .bearer_auth(&self.token)
            .json(&json!({
                "channel_id": channel_id,
                "message": text,
                "props": payload,
            }))
            .send()
            .await?;

        let resp = Self::check_status(resp, "").await?;
        let body: Value = resp.json().await?;
        body.get("id")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| PlatformError::Transport("create response carried no id".to_string()))
    }

    async fn update_message(
        &self,
        message_id: &str,
        text: &str,
        payload: &Value,
    ) -> Result<(), PlatformError> {
        let resp = self
            .client
            .put(self.post_url(message_id))
            .bearer_auth(&self.token)
            .json(&json!({
                "id": message_id,
                "message": text,
                "props": payload,
            }))
            .send()
            .await?;

        Self::check_status(resp, message_id).await.map(|_| ())
    }

    async fn delete_message(&self, message_id: &str) -> Result<(), PlatformError> {
        let resp = self
            .client
            .delete(self.post_url(message_id))
            .bearer_auth(&self.token)
            .send()
            .await?;

        Self::check_status(resp, message_id).await.map(|_| ())
    }
}
