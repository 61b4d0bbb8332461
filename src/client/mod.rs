//! HTTP client for a subscriber agent.
//!
//! Used by the relay to deliver events and by the admin CLI to manage
//! subscriptions.

use std::time::Duration;

use reqwest::{Client, StatusCode};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::debug;

use crate::api::{ListResponse, StatusBody, SubscriptionRequest};
use crate::registry::Subscription;

/// Errors returned by agent calls.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Agent returned {status}: {body}")]
    Status { status: StatusCode, body: String },
}

impl ClientError {
    /// Whether retrying the same request may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            ClientError::Http(e) => e.is_timeout() || e.is_connect(),
            ClientError::Status { status, .. } => {
                *status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error()
            }
        }
    }
}

pub type Result<T> = std::result::Result<T, ClientError>;

/// Normalize an agent endpoint to a base URL.
///
/// Registry rows store either `host:port` or a full URL.
pub fn agent_base_url(endpoint: &str) -> String {
    let endpoint = endpoint.trim_end_matches('/');
    if endpoint.starts_with("http://") || endpoint.starts_with("https://") {
        endpoint.to_string()
    } else {
        format!("http://{}", endpoint)
    }
}

/// Bearer-authenticated client for one agent.
#[derive(Debug, Clone)]
pub struct AgentClient {
    client: Client,
    base_url: String,
    token: String,
}

impl AgentClient {
    pub fn new(endpoint: &str, token: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self::with_client(client, endpoint, token))
    }

    /// Share an existing connection pool.
    pub fn with_client(client: Client, endpoint: &str, token: impl Into<String>) -> Self {
        Self {
            client,
            base_url: agent_base_url(endpoint),
            token: token.into(),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// POST a raw event body to the agent's execute route.
    pub async fn execute(&self, body: String) -> Result<()> {
        let response = self
            .client
            .post(format!("{}/", self.base_url))
            .bearer_auth(&self.token)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .body(body)
            .send()
            .await?;
        check(response).await?;
        debug!(agent = %self.base_url, "Event delivered to agent");
        Ok(())
    }

    pub async fn subscribe(&self, username: &str, event_type: &str, command: &str) -> Result<String> {
        let request = subscription_request(username, event_type, command);
        let body: StatusBody = self.post_json("subscribe", &request).await?;
        Ok(body.status)
    }

    pub async fn edit(&self, username: &str, event_type: &str, command: &str) -> Result<String> {
        let request = subscription_request(username, event_type, command);
        let body: StatusBody = self.post_json("edit", &request).await?;
        Ok(body.status)
    }

    pub async fn unsubscribe(&self, username: &str, event_type: &str) -> Result<String> {
        let request = subscription_request(username, event_type, "");
        let body: StatusBody = self.post_json("unsubscribe", &request).await?;
        Ok(body.status)
    }

    pub async fn list_subscriptions(
        &self,
        username: &str,
        event_type: Option<&str>,
    ) -> Result<Vec<Subscription>> {
        let mut query = vec![("username", username)];
        if let Some(event_type) = event_type {
            query.push(("event_type", event_type));
        }
        let response = self
            .client
            .get(format!("{}/list-subscriptions", self.base_url))
            .bearer_auth(&self.token)
            .query(&query)
            .send()
            .await?;
        let body: ListResponse = check(response).await?.json().await?;
        Ok(body.subscriptions)
    }

    pub async fn health(&self) -> Result<()> {
        let response = self
            .client
            .get(format!("{}/health", self.base_url))
            .bearer_auth(&self.token)
            .send()
            .await?;
        check(response).await?;
        Ok(())
    }

    async fn post_json<B: Serialize, T: DeserializeOwned>(&self, path: &str, body: &B) -> Result<T> {
        let response = self
            .client
            .post(format!("{}/{}", self.base_url, path))
            .bearer_auth(&self.token)
            .json(body)
            .send()
            .await?;
        Ok(check(response).await?.json().await?)
    }
}

fn subscription_request(username: &str, event_type: &str, command: &str) -> SubscriptionRequest {
    SubscriptionRequest {
        username: username.to_string(),
        event_type: event_type.to_string(),
        command: command.to_string(),
    }
}

async fn check(response: reqwest::Response) -> Result<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(ClientError::Status {
        status,
        body: body.chars().take(200).collect(),
    })
}
