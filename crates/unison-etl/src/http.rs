//! `reqwest` transport for the Spotify Web API.
//!
//! Maps the normalized [`ApiRequest`]s onto concrete endpoints and
//! rewrites successful responses into the shapes [`crate::api`] defines.
//! Non-2xx responses are passed through untouched so the client can make
//! the retry decision.

use std::sync::{Arc, OnceLock};
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::RETRY_AFTER;
use reqwest::{Client, RequestBuilder, Url};
use serde_json::{json, Value};

use unison_core::model::RecordId;

use crate::api::{ApiRequest, ApiResponse, Transport, TransportError};
use crate::auth::AuthProvider;
use crate::error::SyncResult;

/// Default Web API base URL.
pub const DEFAULT_API_BASE: &str = "https://api.spotify.com/v1";

/// HTTP transport backed by a shared [`reqwest::Client`].
#[derive(Debug)]
pub struct HttpTransport {
    http: Client,
    base_url: String,
    auth: Arc<dyn AuthProvider>,
    user_id: OnceLock<String>,
}

impl HttpTransport {
    /// Build a transport against `base_url`.
    ///
    /// `user_id` names the account that owns created collections; when
    /// absent it is looked up once via `/me`.
    pub fn new(
        base_url: impl Into<String>,
        auth: Arc<dyn AuthProvider>,
        user_id: Option<String>,
    ) -> SyncResult<Self> {
        let http = Client::builder()
            .user_agent(concat!("unison/", env!("CARGO_PKG_VERSION")))
            .timeout(Duration::from_secs(30))
            .build()?;

        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            auth,
            user_id: user_id.map_or_else(OnceLock::new, OnceLock::from),
        })
    }

    async fn execute(
        &self,
        builder: RequestBuilder,
        token: &str,
    ) -> Result<ApiResponse, TransportError> {
        let response = builder
            .bearer_auth(token)
            .send()
            .await
            .map_err(|e| TransportError::Connection(e.to_string()))?;

        let status = response.status().as_u16();
        let retry_after = response
            .headers()
            .get(RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.trim().parse::<u64>().ok())
            .map(Duration::from_secs);

        let text = response
            .text()
            .await
            .map_err(|e| TransportError::Connection(e.to_string()))?;
        let body = if text.trim().is_empty() {
            Value::Null
        } else {
            serde_json::from_str(&text).unwrap_or(Value::String(text))
        };

        Ok(ApiResponse {
            status,
            retry_after,
            body,
        })
    }

    /// Resolve the owning user, or hand back the failed `/me` response.
    async fn owner(&self, token: &str) -> Result<Result<String, ApiResponse>, TransportError> {
        if let Some(id) = self.user_id.get() {
            return Ok(Ok(id.clone()));
        }

        let me = self
            .execute(self.http.get(format!("{}/me", self.base_url)), token)
            .await?;
        if !me.is_success() {
            return Ok(Err(me));
        }

        let id = me
            .body
            .get("id")
            .and_then(Value::as_str)
            .ok_or_else(|| TransportError::Protocol("profile response has no id".to_string()))?
            .to_string();
        log::debug!("Resolved current user {}", id);
        Ok(Ok(self.user_id.get_or_init(|| id).clone()))
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn send(&self, request: &ApiRequest) -> Result<ApiResponse, TransportError> {
        let token = self.auth.bearer_token().await?;

        let builder = match request {
            ApiRequest::FetchPage {
                collection_id,
                cursor,
                page_size,
            } => self
                .http
                .get(format!("{}/playlists/{collection_id}/tracks", self.base_url))
                .query(&[("offset", cursor.to_string()), ("limit", page_size.to_string())]),
            ApiRequest::CreateCollection {
                name,
                public,
                description,
            } => {
                let user = match self.owner(&token).await? {
                    Ok(user) => user,
                    Err(failed) => return Ok(failed),
                };
                self.http
                    .post(format!("{}/users/{user}/playlists", self.base_url))
                    .json(&json!({
                        "name": name,
                        "public": public,
                        "description": description.as_deref().unwrap_or_default(),
                    }))
            }
            ApiRequest::AddItems { collection_id, ids } => self
                .http
                .post(format!("{}/playlists/{collection_id}/tracks", self.base_url))
                .json(&json!({ "uris": ids.iter().map(track_uri).collect::<Vec<_>>() })),
        };

        let mut response = self.execute(builder, &token).await?;
        if response.is_success() {
            response.body = normalize(request, &response.body)?;
        }
        Ok(response)
    }
}

// ---------------------------------------------------------------------------
// Response normalization
// ---------------------------------------------------------------------------

fn normalize(request: &ApiRequest, body: &Value) -> Result<Value, TransportError> {
    match request {
        ApiRequest::FetchPage { cursor, .. } => Ok(normalize_page(body, *cursor)),
        ApiRequest::CreateCollection { .. } => {
            let id = body.get("id").and_then(Value::as_str).ok_or_else(|| {
                TransportError::Protocol("created playlist has no id".to_string())
            })?;
            Ok(json!({ "collection_id": id }))
        }
        ApiRequest::AddItems { .. } => Ok(json!({
            "snapshot_id": body.get("snapshot_id").cloned().unwrap_or(Value::Null),
        })),
    }
}

/// Turn a Web API paging object into `{items, next_cursor, total}`.
///
/// The next cursor is the `offset` query parameter of the `next` URL; a
/// `next` URL without one falls back to `cursor + items.len()`.
fn normalize_page(body: &Value, cursor: u64) -> Value {
    let items = body.get("items").cloned().unwrap_or_else(|| json!([]));
    let returned = items.as_array().map_or(0, Vec::len) as u64;

    let next_cursor = body
        .get("next")
        .and_then(Value::as_str)
        .map(|next| offset_of(next).unwrap_or(cursor + returned));

    json!({
        "items": items,
        "next_cursor": next_cursor,
        "total": body.get("total").cloned().unwrap_or(Value::Null),
    })
}

fn offset_of(url: &str) -> Option<u64> {
    let url = Url::parse(url).ok()?;
    url.query_pairs()
        .find(|(key, _)| key == "offset")
        .and_then(|(_, value)| value.parse().ok())
}

fn track_uri(id: &RecordId) -> String {
    let id = id.as_str();
    if id.starts_with("spotify:") {
        id.to_string()
    } else {
        format!("spotify:track:{id}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::Page;
    use crate::auth::StaticToken;

    #[test]
    fn test_normalize_page_reads_offset_from_next() {
        let body = json!({
            "items": [{"track": {"id": "A"}}, {"track": {"id": "B"}}],
            "next": "https://api.spotify.com/v1/playlists/p1/tracks?offset=2&limit=2",
            "total": 5
        });
        let page: Page = serde_json::from_value(normalize_page(&body, 0)).unwrap();
        assert_eq!(page.items.len(), 2);
        assert_eq!(page.next_cursor, Some(2));
        assert_eq!(page.total, Some(5));
    }

    #[test]
    fn test_normalize_page_without_next_is_last() {
        let body = json!({"items": [], "next": null, "total": 0});
        let page: Page = serde_json::from_value(normalize_page(&body, 0)).unwrap();
        assert!(page.next_cursor.is_none());
    }

    #[test]
    fn test_normalize_page_next_without_offset_falls_back() {
        let body = json!({
            "items": [{"track": {"id": "A"}}],
            "next": "https://example.invalid/next-page",
        });
        let page: Page = serde_json::from_value(normalize_page(&body, 10)).unwrap();
        assert_eq!(page.next_cursor, Some(11));
        assert!(page.total.is_none());
    }

    #[test]
    fn test_track_uri() {
        assert_eq!(
            track_uri(&RecordId::new("4iV5W9uYEdYUVa79Axb7Rh").unwrap()),
            "spotify:track:4iV5W9uYEdYUVa79Axb7Rh"
        );
        assert_eq!(
            track_uri(&RecordId::new("spotify:track:X").unwrap()),
            "spotify:track:X"
        );
    }

    #[test]
    fn test_created_collection_normalized() {
        let request = ApiRequest::CreateCollection {
            name: "Merged".to_string(),
            public: false,
            description: None,
        };
        let body = normalize(&request, &json!({"id": "new123", "name": "Merged"})).unwrap();
        assert_eq!(body, json!({"collection_id": "new123"}));
        assert!(normalize(&request, &json!({})).is_err());
    }

    #[test]
    fn test_transport_trims_base_url() {
        let transport = HttpTransport::new(
            "https://api.example.test/v1/",
            Arc::new(StaticToken::new("t")),
            Some("me".to_string()),
        )
        .unwrap();
        assert_eq!(transport.base_url, "https://api.example.test/v1");
        assert_eq!(transport.user_id.get().map(String::as_str), Some("me"));
    }
}
