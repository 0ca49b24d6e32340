use async_trait::async_trait;
use reqwest::{Client, Method, StatusCode};
use serde_json::Value;
use tracing::debug;

use crate::types::{ErrorInfo, ErrorKind};

#[derive(thiserror::Error, Debug)]
pub enum ResourceError {
    #[error("{0}")]
    Network(#[from] reqwest::Error),
    #[error("{message}")]
    Api { status: u16, message: String },
    #[error("unexpected payload: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("not signed in")]
    NotEnabled,
}

impl From<&ResourceError> for ErrorInfo {
    fn from(err: &ResourceError) -> Self {
        let kind = match err {
            ResourceError::Network(_) => ErrorKind::Network,
            ResourceError::Api { .. } => ErrorKind::Api,
            ResourceError::Decode(_) => ErrorKind::Decode,
            ResourceError::NotEnabled => ErrorKind::NotEnabled,
        };
        let status = match err {
            ResourceError::Api { status, .. } => Some(*status),
            ResourceError::Network(e) => e.status().map(|s| s.as_u16()),
            _ => None,
        };
        Self {
            kind,
            message: err.to_string(),
            status,
        }
    }
}

impl From<ResourceError> for ErrorInfo {
    fn from(err: ResourceError) -> Self {
        Self::from(&err)
    }
}

/// The REST API as seen by descriptors. Payloads are opaque JSON; every call
/// carries the session's bearer token.
#[async_trait]
pub trait ResourceApi: Send + Sync {
    async fn get(&self, token: &str, path: &str) -> Result<Value, ResourceError>;

    async fn post(&self, token: &str, path: &str, body: &Value) -> Result<Value, ResourceError>;

    async fn put(&self, token: &str, path: &str, body: &Value) -> Result<Value, ResourceError>;
}

pub struct HttpResourceApi {
    client: Client,
    base_url: String,
}

impl HttpResourceApi {
    pub fn new(base_url: impl Into<String>) -> Result<Self, ResourceError> {
        let client = Client::builder().build()?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_owned(),
        })
    }

    async fn send(
        &self,
        method: Method,
        token: &str,
        path: &str,
        body: Option<&Value>,
    ) -> Result<Value, ResourceError> {
        let url = format!("{}{}", self.base_url, path);
        debug!(%method, %url, "api request");

        let mut request = self.client.request(method, &url).bearer_auth(token);
        if let Some(body) = body {
            request = request.json(body);
        }

        let resp = request.send().await?;
        let status = resp.status();
        let bytes = resp.bytes().await?;

        if !status.is_success() {
            return Err(api_error(status, &bytes));
        }
        if bytes.is_empty() {
            return Ok(Value::Null);
        }
        Ok(serde_json::from_slice(&bytes)?)
    }
}

#[async_trait]
impl ResourceApi for HttpResourceApi {
    async fn get(&self, token: &str, path: &str) -> Result<Value, ResourceError> {
        self.send(Method::GET, token, path, None).await
    }

    async fn post(&self, token: &str, path: &str, body: &Value) -> Result<Value, ResourceError> {
        self.send(Method::POST, token, path, Some(body)).await
    }

    async fn put(&self, token: &str, path: &str, body: &Value) -> Result<Value, ResourceError> {
        self.send(Method::PUT, token, path, Some(body)).await
    }
}

/// Non-2xx response: prefer the server's own `message`, fall back to the
/// status reason.
fn api_error(status: StatusCode, body: &[u8]) -> ResourceError {
    let message = serde_json::from_slice::<Value>(body)
        .ok()
        .and_then(|v| v.get("message").and_then(Value::as_str).map(str::to_owned))
        .unwrap_or_else(|| format!("Request failed with status code {}", status.as_u16()));

    ResourceError::Api {
        status: status.as_u16(),
        message,
    }
}


#[cfg(test)]
mod tests {
    use reqwest::StatusCode;

    use super::*;

    #[test]
    fn api_error_uses_server_message() {
        let err = api_error(StatusCode::BAD_REQUEST, br#"{"message":"Issue is required"}"#);
        assert_eq!(err.to_string(), "Issue is required");

        let info = ErrorInfo::from(&err);
        assert_eq!(info.kind, ErrorKind::Api);
        assert_eq!(info.status, Some(400));
    }

    #[test]
    fn api_error_without_body_reports_status() {
        let err = api_error(StatusCode::INTERNAL_SERVER_ERROR, b"");
        assert_eq!(err.to_string(), "Request failed with status code 500");
    }

    #[test]
    fn not_enabled_is_its_own_kind() {
        let info = ErrorInfo::from(ResourceError::NotEnabled);
        assert_eq!(info.kind, ErrorKind::NotEnabled);
        assert_eq!(info.message, "not signed in");
        assert_eq!(info.status, None);
    }

    #[test]
    fn base_url_trailing_slash_is_trimmed() {
        let api = HttpResourceApi::new("http://localhost:8080/").unwrap();
        assert_eq!(api.base_url, "http://localhost:8080");
    }
}
