use std::sync::Arc;

use axum::http::HeaderMap;
use parking_lot::RwLock;
use thiserror::Error;
use tracing::{debug, info};

use crate::types::KeyPart;

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("missing authorization header")]
    MissingHeader,
    #[error("invalid authorization header: {0}")]
    Invalid(String),
}

/// Bearer token issued by the identity provider, plus the identity used to
/// scope cache keys.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionToken {
    token: Arc<str>,
    identity: Arc<str>,
}

impl SessionToken {
    pub fn new(token: &str) -> Self {
        let identity = decode_subject(token).unwrap_or_else(|e| {
            debug!(error = %e, "token is not a decodable JWT, keying cache by raw token");
            token.to_owned()
        });

        Self {
            token: Arc::from(token),
            identity: Arc::from(identity.as_str()),
        }
    }

    pub fn bearer(&self) -> &str {
        &self.token
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }
}

/// The session's current sign-in state. Queries are gated on a token being
/// present.
#[derive(Default)]
pub struct Session {
    current: RwLock<Option<SessionToken>>,
}

impl Session {
    pub fn new(initial: Option<SessionToken>) -> Self {
        Self {
            current: RwLock::new(initial),
        }
    }

    pub fn current(&self) -> Option<SessionToken> {
        self.current.read().clone()
    }

    /// Returns true when the identity changed.
    pub fn sign_in(&self, token: SessionToken) -> bool {
        let mut current = self.current.write();
        let changed = current.as_ref().map(SessionToken::identity) != Some(token.identity());
        info!(identity = %token.identity(), changed, "session signed in");
        *current = Some(token);
        changed
    }

    pub fn sign_out(&self) -> Option<SessionToken> {
        let previous = self.current.write().take();
        if let Some(token) = &previous {
            info!(identity = %token.identity(), "session signed out");
        }
        previous
    }
}

/// Cache-key part for the given sign-in state; `null` when signed out.
pub fn identity_part(token: Option<&SessionToken>) -> KeyPart {
    KeyPart::from(token.map(|t| t.identity().to_owned()))
}

pub fn bearer_from_headers(headers: &HeaderMap) -> Result<SessionToken, AuthError> {
    let value = headers
        .get("authorization")
        .ok_or(AuthError::MissingHeader)?
        .to_str()
        .map_err(|e| AuthError::Invalid(e.to_string()))?;

    let token = value
        .strip_prefix("Bearer ")
        .ok_or_else(|| AuthError::Invalid("expected Bearer scheme".into()))?
        .trim();

    if token.is_empty() {
        return Err(AuthError::Invalid("empty token".into()));
    }

    Ok(SessionToken::new(token))
}

fn decode_subject(token: &str) -> Result<String, AuthError> {
    let parts: Vec<&str> = token.splitn(3, '.').collect();
    if parts.len() != 3 {
        return Err(AuthError::Invalid("malformed JWT".into()));
    }

    let payload_bytes = base64_url_decode(parts[1])
        .map_err(|e| AuthError::Invalid(format!("base64 decode error: {e}")))?;

    let payload: serde_json::Value = serde_json::from_slice(&payload_bytes)
        .map_err(|e| AuthError::Invalid(format!("invalid JSON payload: {e}")))?;

    payload["sub"]
        .as_str()
        .filter(|sub| !sub.is_empty())
        .map(String::from)
        .ok_or_else(|| AuthError::Invalid("missing 'sub' claim".into()))
}

fn base64_url_decode(input: &str) -> Result<Vec<u8>, String> {
    use base64::engine::general_purpose::URL_SAFE_NO_PAD;
    use base64::Engine;

    URL_SAFE_NO_PAD
        .decode(input.trim_end_matches('='))
        .map_err(|e| e.to_string())
}
