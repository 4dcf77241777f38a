//! Request/response shapes of the collection API and the transport seam.
//!
//! Everything above this module speaks the normalized shapes defined here;
//! [`crate::http::HttpTransport`] maps them onto the real Web API and tests
//! substitute in-memory transports.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use unison_core::model::{CollectionId, RecordId};

/// Largest page the upstream serves per request.
pub const MAX_PAGE_SIZE: u32 = 100;

/// Largest number of ids the upstream accepts per write request.
pub const MAX_WRITE_BATCH: usize = 100;

/// A single call against the collection API.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum ApiRequest {
    /// Read one page of a collection starting at `cursor`.
    FetchPage {
        collection_id: CollectionId,
        cursor: u64,
        page_size: u32,
    },
    /// Create a new (target) collection.
    CreateCollection {
        name: String,
        public: bool,
        description: Option<String>,
    },
    /// Append ids to an existing collection.
    AddItems {
        collection_id: CollectionId,
        ids: Vec<RecordId>,
    },
}

impl ApiRequest {
    /// Short name used in log lines.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::FetchPage { .. } => "fetch_page",
            Self::CreateCollection { .. } => "create_collection",
            Self::AddItems { .. } => "add_items",
        }
    }

    /// Returns `true` for requests that mutate remote state.
    #[cfg(test)]
    #[must_use]
    pub const fn is_write(&self) -> bool {
        !matches!(self, Self::FetchPage { .. })
    }
}

/// What came back from the upstream, before any retry decision.
#[derive(Debug, Clone, PartialEq)]
pub struct ApiResponse {
    pub status: u16,
    /// Server-provided `Retry-After`, if any.
    pub retry_after: Option<Duration>,
    pub body: Value,
}

impl ApiResponse {
    /// A `200 OK` carrying `body`.
    #[must_use]
    pub fn ok(body: Value) -> Self {
        Self {
            status: 200,
            retry_after: None,
            body,
        }
    }

    /// A bodiless response with the given status.
    #[must_use]
    pub fn status(status: u16) -> Self {
        Self {
            status,
            retry_after: None,
            body: Value::Null,
        }
    }

    #[must_use]
    pub fn with_retry_after(mut self, retry_after: Duration) -> Self {
        self.retry_after = Some(retry_after);
        self
    }

    #[must_use]
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Best-effort human-readable error text from the body.
    #[must_use]
    pub fn error_message(&self) -> String {
        match &self.body {
            Value::Null => format!("HTTP {}", self.status),
            Value::String(s) => s.clone(),
            body => body
                .get("error")
                .and_then(|e| e.get("message").or(Some(e)))
                .and_then(Value::as_str)
                .map_or_else(|| body.to_string(), str::to_string),
        }
    }
}

/// One page of a collection in normalized form.
///
/// `next_cursor` is the upstream's explicit continuation signal: absent
/// means the collection is exhausted, regardless of how many items the
/// page held.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Page {
    #[serde(default)]
    pub items: Vec<Value>,
    #[serde(default)]
    pub next_cursor: Option<u64>,
    #[serde(default)]
    pub total: Option<u64>,
}

/// Response body of a create-collection call.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct CreatedCollection {
    pub collection_id: CollectionId,
}

/// Failures below the HTTP status level.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The request never produced a response (DNS, reset, timeout).
    #[error("connection error: {0}")]
    Connection(String),

    /// No credential could be obtained.
    #[error("authentication failed: {0}")]
    Auth(String),

    /// A response arrived but could not be understood.
    #[error("protocol error: {0}")]
    Protocol(String),
}

/// Sends a single request, with no retry logic of its own.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, request: &ApiRequest) -> Result<ApiResponse, TransportError>;
}

#[async_trait]
impl<T: Transport + ?Sized> Transport for &T {
    async fn send(&self, request: &ApiRequest) -> Result<ApiResponse, TransportError> {
        (**self).send(request).await
    }
}
