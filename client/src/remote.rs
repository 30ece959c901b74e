//! Remote API client.
//!
//! [`RemoteApi`] is the seam the sync driver talks through; tests swap in a
//! fake. [`HttpRemoteApi`] speaks JSON over HTTP with a bearer token.

use crate::config::Config;
use async_trait::async_trait;
use farmsync_engine::{EntityKind, ServerId};
use serde_json::Value;
use std::fmt;
use std::time::Duration;

/// Failure talking to the server.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RemoteError {
    /// Network trouble or a server-side error; worth retrying
    #[error("transient failure: {0}")]
    Transient(String),

    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    /// The server refused the request; retrying won't help
    #[error("rejected by server ({status}): {message}")]
    Rejected { status: u16, message: String },

    #[error("invalid response: {0}")]
    InvalidResponse(String),

    #[error("client configuration: {0}")]
    Configuration(String),
}

impl RemoteError {
    pub fn is_transient(&self) -> bool {
        matches!(self, RemoteError::Transient(_) | RemoteError::Timeout(_))
    }
}

/// Server acknowledgement of a write.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RemoteAck {
    pub server_id: Option<ServerId>,
}

/// Remote CRUD per entity kind.
///
/// Bodies are already in wire format.
#[async_trait]
pub trait RemoteApi: Send + Sync + fmt::Debug {
    async fn create(&self, kind: EntityKind, body: Value) -> Result<RemoteAck, RemoteError>;

    async fn update(
        &self,
        kind: EntityKind,
        server_id: &str,
        body: Value,
    ) -> Result<RemoteAck, RemoteError>;

    async fn delete(&self, kind: EntityKind, server_id: &str) -> Result<(), RemoteError>;

    /// Every record of a kind visible to the organization.
    async fn list(
        &self,
        kind: EntityKind,
        organization_id: Option<&str>,
    ) -> Result<Vec<Value>, RemoteError>;
}

/// Map a non-success status to an error.
pub fn classify_status(status: u16, message: String) -> RemoteError {
    match status {
        408 | 429 | 500..=599 => RemoteError::Transient(format!("HTTP {status}: {message}")),
        _ => RemoteError::Rejected { status, message },
    }
}

/// Server id from a write response: `id` at the top level or under `data`.
pub fn extract_server_id(body: &Value) -> Option<ServerId> {
    let id = body
        .get("id")
        .or_else(|| body.get("data").and_then(|d| d.get("id")))?;

    match id {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// List responses are either a bare array or `{"data": [...]}`.
fn extract_list(body: Value) -> Result<Vec<Value>, RemoteError> {
    match body {
        Value::Array(items) => Ok(items),
        Value::Object(mut map) => match map.remove("data") {
            Some(Value::Array(items)) => Ok(items),
            _ => Err(RemoteError::InvalidResponse(
                "expected an array or an object with a data array".into(),
            )),
        },
        other => Err(RemoteError::InvalidResponse(format!(
            "expected an array, got {other}"
        ))),
    }
}

/// HTTP implementation over reqwest.
#[derive(Clone)]
pub struct HttpRemoteApi {
    client: reqwest::Client,
    base_url: String,
    token: Option<String>,
    timeout: Duration,
}

impl fmt::Debug for HttpRemoteApi {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpRemoteApi")
            .field("base_url", &self.base_url)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

impl HttpRemoteApi {
    pub fn new(
        base_url: impl Into<String>,
        token: Option<String>,
        timeout: Duration,
    ) -> Result<Self, RemoteError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| RemoteError::Configuration(e.to_string()))?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token,
            timeout,
        })
    }

    pub fn from_config(config: &Config) -> Result<Self, RemoteError> {
        Self::new(
            config.api_base_url.clone(),
            config.api_token.clone(),
            config.request_timeout,
        )
    }

    fn url(&self, kind: EntityKind, server_id: Option<&str>) -> String {
        match server_id {
            Some(id) => format!("{}/{}/{}", self.base_url, kind.endpoint(), id),
            None => format!("{}/{}", self.base_url, kind.endpoint()),
        }
    }

    fn with_auth(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    fn transport_error(&self, e: reqwest::Error) -> RemoteError {
        if e.is_timeout() {
            RemoteError::Timeout(self.timeout)
        } else {
            RemoteError::Transient(e.to_string())
        }
    }

    async fn send(&self, request: reqwest::RequestBuilder) -> Result<reqwest::Response, RemoteError> {
        let response = self
            .with_auth(request)
            .send()
            .await
            .map_err(|e| self.transport_error(e))?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let message = response.text().await.unwrap_or_default();
        Err(classify_status(status.as_u16(), message))
    }

    async fn read_json(&self, response: reqwest::Response) -> Result<Value, RemoteError> {
        let text = response.text().await.map_err(|e| self.transport_error(e))?;
        if text.trim().is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_str(&text).map_err(|e| RemoteError::InvalidResponse(e.to_string()))
    }
}

#[async_trait]
impl RemoteApi for HttpRemoteApi {
    async fn create(&self, kind: EntityKind, body: Value) -> Result<RemoteAck, RemoteError> {
        let response = self
            .send(self.client.post(self.url(kind, None)).json(&body))
            .await?;
        let body = self.read_json(response).await?;

        Ok(RemoteAck {
            server_id: extract_server_id(&body),
        })
    }

    async fn update(
        &self,
        kind: EntityKind,
        server_id: &str,
        body: Value,
    ) -> Result<RemoteAck, RemoteError> {
        let response = self
            .send(self.client.put(self.url(kind, Some(server_id))).json(&body))
            .await?;
        let body = self.read_json(response).await?;

        Ok(RemoteAck {
            server_id: extract_server_id(&body).or_else(|| Some(server_id.to_string())),
        })
    }

    async fn delete(&self, kind: EntityKind, server_id: &str) -> Result<(), RemoteError> {
        match self
            .send(self.client.delete(self.url(kind, Some(server_id))))
            .await
        {
            Ok(_) => Ok(()),
            // Already gone on the server
            Err(RemoteError::Rejected { status: 404, .. }) => {
                tracing::debug!(kind = %kind, server_id = %server_id, "Delete target already absent");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn list(
        &self,
        kind: EntityKind,
        organization_id: Option<&str>,
    ) -> Result<Vec<Value>, RemoteError> {
        let mut request = self.client.get(self.url(kind, None));
        if let Some(org) = organization_id {
            request = request.query(&[("organizationId", org)]);
        }

        let response = self.send(request).await?;
        extract_list(self.read_json(response).await?)
    }
}
