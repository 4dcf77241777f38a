//! Rate-limited API client with throttling and retry handling.
//!
//! Every upstream call in the pipeline goes through [`RateLimitedClient`].
//! The client owns the retry decision:
//!
//! - `429`: wait the server's `Retry-After`, or the policy default.
//! - `5xx` and connection failures: wait an exponential backoff delay.
//! - any other non-2xx, or an auth failure: fail immediately.
//!
//! A call makes at most `max_attempts` attempts in total.

use serde_json::Value;
use tokio::time::sleep;

use unison_core::model::{CollectionId, RecordId};

use crate::api::{
    ApiRequest, CreatedCollection, Page, Transport, TransportError, MAX_PAGE_SIZE,
    MAX_WRITE_BATCH,
};
use crate::error::{SyncError, SyncResult};
use crate::resilience::{RateLimiter, RetryPolicy};

/// Wraps a [`Transport`] with pacing and bounded retries.
#[derive(Debug)]
pub struct RateLimitedClient<T> {
    transport: T,
    policy: RetryPolicy,
    limiter: RateLimiter,
}

impl<T: Transport> RateLimitedClient<T> {
    pub fn new(transport: T, policy: RetryPolicy, limiter: RateLimiter) -> Self {
        Self {
            transport,
            policy,
            limiter,
        }
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Perform `request`, retrying transient failures.
    ///
    /// # Errors
    ///
    /// - [`SyncError::RateLimitExceeded`] if the last attempt was throttled
    /// - [`SyncError::UpstreamUnavailable`] if the last attempt hit a server
    ///   or network failure
    /// - [`SyncError::RequestRejected`] on the first non-retryable status
    /// - [`SyncError::Parse`] if the transport could not read the response
    pub async fn call(&self, request: &ApiRequest) -> SyncResult<Value> {
        let max_attempts = self.policy.max_attempts.max(1);
        let mut backoff = self.policy.backoff();
        let mut attempt = 0;

        loop {
            attempt += 1;
            self.limiter.acquire().await;

            let (delay, reason, failure) = match self.transport.send(request).await {
                Ok(response) if response.is_success() => return Ok(response.body),
                Ok(response) if response.status == 429 => (
                    response
                        .retry_after
                        .unwrap_or(self.policy.default_retry_after),
                    "throttled".to_string(),
                    SyncError::RateLimitExceeded { attempts: attempt },
                ),
                Ok(response) if response.status >= 500 => {
                    let message = response.error_message();
                    (
                        backoff.next().unwrap_or(self.policy.backoff_cap),
                        format!("HTTP {}", response.status),
                        SyncError::UpstreamUnavailable {
                            attempts: attempt,
                            message,
                        },
                    )
                }
                Ok(response) => {
                    log::warn!(
                        "{} rejected with HTTP {}",
                        request.kind(),
                        response.status
                    );
                    return Err(SyncError::RequestRejected {
                        status: response.status,
                        message: response.error_message(),
                    });
                }
                Err(TransportError::Auth(message)) => {
                    return Err(SyncError::RequestRejected {
                        status: 401,
                        message,
                    })
                }
                Err(TransportError::Protocol(message)) => return Err(SyncError::Parse { message }),
                Err(TransportError::Connection(message)) => (
                    backoff.next().unwrap_or(self.policy.backoff_cap),
                    message.clone(),
                    SyncError::UpstreamUnavailable {
                        attempts: attempt,
                        message,
                    },
                ),
            };

            if attempt >= max_attempts {
                log::error!(
                    "{} failed after {} attempts: {}",
                    request.kind(),
                    attempt,
                    reason
                );
                return Err(failure);
            }

            log::warn!(
                "{} {} (attempt {}/{}), retrying in {:?}",
                request.kind(),
                reason,
                attempt,
                max_attempts,
                delay
            );
            sleep(delay).await;
        }
    }

    /// Fetch one page of `collection_id` starting at `cursor`.
    pub async fn fetch_page(
        &self,
        collection_id: &CollectionId,
        cursor: u64,
        page_size: u32,
    ) -> SyncResult<Page> {
        if page_size == 0 || page_size > MAX_PAGE_SIZE {
            return Err(SyncError::InvalidArgument(format!(
                "page size must be between 1 and {MAX_PAGE_SIZE}, got {page_size}"
            )));
        }

        let body = self
            .call(&ApiRequest::FetchPage {
                collection_id: collection_id.clone(),
                cursor,
                page_size,
            })
            .await?;

        serde_json::from_value(body).map_err(|e| SyncError::Parse {
            message: format!("page of {collection_id} at {cursor}: {e}"),
        })
    }

    /// Create a collection and return its id.
    pub async fn create_collection(
        &self,
        name: &str,
        public: bool,
        description: Option<&str>,
    ) -> SyncResult<CollectionId> {
        let body = self
            .call(&ApiRequest::CreateCollection {
                name: name.to_string(),
                public,
                description: description.map(str::to_string),
            })
            .await?;

        let created: CreatedCollection =
            serde_json::from_value(body).map_err(|e| SyncError::Parse {
                message: format!("created collection {name:?}: {e}"),
            })?;
        Ok(created.collection_id)
    }

    /// Append up to [`MAX_WRITE_BATCH`] ids to `collection_id`.
    pub async fn add_items(&self, collection_id: &CollectionId, ids: &[RecordId]) -> SyncResult<()> {
        if ids.is_empty() {
            return Ok(());
        }
        if ids.len() > MAX_WRITE_BATCH {
            return Err(SyncError::InvalidArgument(format!(
                "at most {MAX_WRITE_BATCH} ids per write, got {}",
                ids.len()
            )));
        }

        self.call(&ApiRequest::AddItems {
            collection_id: collection_id.clone(),
            ids: ids.to_vec(),
        })
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::ApiResponse;
    use async_trait::async_trait;
    use serde_json::json;
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use tokio::time::{Duration, Instant};

    /// Replays a fixed script of responses and records every request.
    #[derive(Debug, Default)]
    struct ScriptedTransport {
        script: Mutex<VecDeque<Result<ApiResponse, TransportError>>>,
        seen: Mutex<Vec<ApiRequest>>,
    }

    impl ScriptedTransport {
        fn new(script: Vec<Result<ApiResponse, TransportError>>) -> Self {
            Self {
                script: Mutex::new(script.into()),
                seen: Mutex::default(),
            }
        }

        fn calls(&self) -> usize {
            self.seen.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl Transport for ScriptedTransport {
        async fn send(&self, request: &ApiRequest) -> Result<ApiResponse, TransportError> {
            self.seen.lock().unwrap().push(request.clone());
            self.script
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Ok(ApiResponse::ok(json!({}))))
        }
    }

    fn client(script: Vec<Result<ApiResponse, TransportError>>) -> RateLimitedClient<ScriptedTransport> {
        RateLimitedClient::new(
            ScriptedTransport::new(script),
            RetryPolicy::default(),
            RateLimiter::unlimited(),
        )
    }

    fn fetch() -> ApiRequest {
        ApiRequest::FetchPage {
            collection_id: CollectionId::new("p1").unwrap(),
            cursor: 0,
            page_size: 100,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_throttled_call_honors_retry_after() {
        let client = client(vec![
            Ok(ApiResponse::status(429).with_retry_after(Duration::from_secs(2))),
            Ok(ApiResponse::ok(json!({"ok": true}))),
        ]);

        let start = Instant::now();
        let body = client.call(&fetch()).await.unwrap();

        assert_eq!(body, json!({"ok": true}));
        assert_eq!(client.transport().calls(), 2);
        assert!(start.elapsed() >= Duration::from_secs(2));
        assert!(start.elapsed() < Duration::from_secs(3));
    }

    #[tokio::test(start_paused = true)]
    async fn test_throttled_without_header_uses_default_wait() {
        let client = client(vec![Ok(ApiResponse::status(429)), Ok(ApiResponse::ok(json!({})))]);

        let start = Instant::now();
        client.call(&fetch()).await.unwrap();

        assert!(start.elapsed() >= Duration::from_secs(5));
    }

    #[tokio::test(start_paused = true)]
    async fn test_throttling_exhausts_attempts() {
        let client = client((0..5).map(|_| Ok(ApiResponse::status(429))).collect());

        let err = client.call(&fetch()).await.unwrap_err();

        assert!(matches!(err, SyncError::RateLimitExceeded { attempts: 5 }));
        assert_eq!(client.transport().calls(), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_server_errors_back_off_exponentially() {
        let client = client(vec![
            Ok(ApiResponse::status(503)),
            Ok(ApiResponse::status(502)),
            Ok(ApiResponse::ok(json!({}))),
        ]);

        let start = Instant::now();
        client.call(&fetch()).await.unwrap();

        // 1s then 2s
        assert!(start.elapsed() >= Duration::from_secs(3));
        assert!(start.elapsed() < Duration::from_secs(4));
        assert_eq!(client.transport().calls(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_server_errors_exhaust_attempts() {
        let client = client((0..5).map(|_| Ok(ApiResponse::status(500))).collect());

        let err = client.call(&fetch()).await.unwrap_err();

        assert!(matches!(err, SyncError::UpstreamUnavailable { attempts: 5, .. }));
        assert!(err.is_transient());
    }

    #[tokio::test(start_paused = true)]
    async fn test_connection_errors_are_retried() {
        let client = client(vec![
            Err(TransportError::Connection("reset".to_string())),
            Ok(ApiResponse::ok(json!({"items": []}))),
        ]);

        assert!(client.call(&fetch()).await.is_ok());
        assert_eq!(client.transport().calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_last_failure_decides_error_kind() {
        let client = client(vec![
            Ok(ApiResponse::status(500)),
            Ok(ApiResponse::status(500)),
            Ok(ApiResponse::status(500)),
            Ok(ApiResponse::status(500)),
            Ok(ApiResponse::status(429)),
        ]);

        let err = client.call(&fetch()).await.unwrap_err();
        assert!(matches!(err, SyncError::RateLimitExceeded { attempts: 5 }));
    }

    #[tokio::test]
    async fn test_client_error_is_not_retried() {
        let client = client(vec![Ok(ApiResponse {
            status: 404,
            retry_after: None,
            body: json!({"error": {"status": 404, "message": "Not found."}}),
        })]);

        let err = client.call(&fetch()).await.unwrap_err();

        match err {
            SyncError::RequestRejected { status, message } => {
                assert_eq!(status, 404);
                assert_eq!(message, "Not found.");
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(client.transport().calls(), 1);
    }

    #[tokio::test]
    async fn test_auth_failure_is_not_retried() {
        let client = client(vec![Err(TransportError::Auth("expired".to_string()))]);

        let err = client.call(&fetch()).await.unwrap_err();

        assert!(matches!(err, SyncError::RequestRejected { status: 401, .. }));
        assert_eq!(client.transport().calls(), 1);
    }

    #[tokio::test]
    async fn test_fetch_page_validates_page_size() {
        let client = client(vec![]);
        let p1 = CollectionId::new("p1").unwrap();

        assert!(matches!(
            client.fetch_page(&p1, 0, 0).await,
            Err(SyncError::InvalidArgument(_))
        ));
        assert!(matches!(
            client.fetch_page(&p1, 0, 101).await,
            Err(SyncError::InvalidArgument(_))
        ));
        assert_eq!(client.transport().calls(), 0);
    }

    #[tokio::test]
    async fn test_fetch_page_parses_body() {
        let client = client(vec![Ok(ApiResponse::ok(json!({
            "items": [{"track": {"id": "A"}}],
            "next_cursor": 1,
            "total": 2
        })))]);

        let page = client
            .fetch_page(&CollectionId::new("p1").unwrap(), 0, 1)
            .await
            .unwrap();

        assert_eq!(page.items.len(), 1);
        assert_eq!(page.next_cursor, Some(1));
        assert_eq!(page.total, Some(2));
    }

    #[tokio::test]
    async fn test_add_items_rejects_oversized_batch() {
        let client = client(vec![]);
        let ids: Vec<RecordId> = (0..101)
            .map(|i| RecordId::new(format!("t{i}")).unwrap())
            .collect();

        let err = client
            .add_items(&CollectionId::new("m").unwrap(), &ids)
            .await
            .unwrap_err();

        assert!(matches!(err, SyncError::InvalidArgument(_)));
        assert_eq!(client.transport().calls(), 0);
    }

    #[tokio::test]
    async fn test_create_collection_returns_id() {
        let client = client(vec![Ok(ApiResponse::ok(json!({"collection_id": "new1"})))]);

        let id = client.create_collection("Merged", false, None).await.unwrap();

        assert_eq!(id.as_str(), "new1");
    }
}
