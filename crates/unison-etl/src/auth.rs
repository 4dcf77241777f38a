//! Credential providers for the HTTP transport.
//!
//! Token acquisition (OAuth flows, refresh) lives outside this crate; the
//! transport only asks an [`AuthProvider`] for a bearer token per request.

use std::fmt;

use async_trait::async_trait;

use crate::api::TransportError;

/// Supplies a bearer token for each outgoing request.
#[async_trait]
pub trait AuthProvider: Send + Sync + fmt::Debug {
    async fn bearer_token(&self) -> Result<String, TransportError>;
}

/// A fixed access token, typically read from configuration.
#[derive(Clone)]
pub struct StaticToken(String);

impl StaticToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }
}

impl fmt::Debug for StaticToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("StaticToken").field(&"<redacted>").finish()
    }
}

#[async_trait]
impl AuthProvider for StaticToken {
    async fn bearer_token(&self) -> Result<String, TransportError> {
        if self.0.trim().is_empty() {
            return Err(TransportError::Auth("access token is empty".to_string()));
        }
        Ok(self.0.clone())
    }
}
