//! Shared fixtures: an in-memory collection API and a scratch workspace.

#![allow(dead_code)]

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tempfile::TempDir;

use unison_core::schema::Database;
use unison_etl::api::{ApiRequest, ApiResponse, Transport, TransportError};
use unison_etl::{CheckpointStore, RateLimitedClient, RateLimiter, RetryPolicy};

/// A target collection created through the fake API.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreatedTarget {
    pub id: String,
    pub name: String,
    pub ids: Vec<String>,
}

#[derive(Debug)]
struct Outage {
    kind: &'static str,
    remaining_ok: usize,
    status: u16,
}

#[derive(Debug, Default)]
struct FakeState {
    collections: BTreeMap<String, Vec<Value>>,
    stalled: BTreeSet<String>,
    withheld: BTreeSet<(String, u64)>,
    created: Vec<CreatedTarget>,
    requests: Vec<ApiRequest>,
    outage: Option<Outage>,
}

/// Stateful stand-in for the upstream API.
///
/// Serves pages of seeded collections, records created targets and the
/// ids written to them, and can be told to start failing a request kind.
#[derive(Debug, Default)]
pub struct FakeApi {
    state: Mutex<FakeState>,
}

impl FakeApi {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_collection(self, id: &str, items: Vec<Value>) -> Self {
        self.set_collection(id, items);
        self
    }

    pub fn set_collection(&self, id: &str, items: Vec<Value>) {
        self.state
            .lock()
            .unwrap()
            .collections
            .insert(id.to_string(), items);
    }

    /// Make `id` answer every page with no items and a cursor that does
    /// not move.
    pub fn stall(&self, id: &str) {
        self.state.lock().unwrap().stalled.insert(id.to_string());
    }

    /// Make the page of `id` at `cursor` come back empty while still
    /// pointing at the following page.
    pub fn withhold_page(&self, id: &str, cursor: u64) {
        self.state
            .lock()
            .unwrap()
            .withheld
            .insert((id.to_string(), cursor));
    }

    /// After `successes` more successful calls of `kind`, answer every
    /// further call of that kind with `status`.
    pub fn fail_after(&self, kind: &'static str, successes: usize, status: u16) {
        self.state.lock().unwrap().outage = Some(Outage {
            kind,
            remaining_ok: successes,
            status,
        });
    }

    pub fn heal(&self) {
        self.state.lock().unwrap().outage = None;
    }

    pub fn requests(&self) -> Vec<ApiRequest> {
        self.state.lock().unwrap().requests.clone()
    }

    pub fn count(&self, kind: &str) -> usize {
        self.state
            .lock()
            .unwrap()
            .requests
            .iter()
            .filter(|r| r.kind() == kind)
            .count()
    }

    pub fn clear_requests(&self) {
        self.state.lock().unwrap().requests.clear();
    }

    pub fn created(&self) -> Vec<CreatedTarget> {
        self.state.lock().unwrap().created.clone()
    }
}

#[async_trait]
impl Transport for FakeApi {
    async fn send(&self, request: &ApiRequest) -> Result<ApiResponse, TransportError> {
        let mut state = self.state.lock().unwrap();
        state.requests.push(request.clone());

        if let Some(outage) = state.outage.as_mut() {
            if outage.kind == request.kind() {
                if outage.remaining_ok == 0 {
                    return Ok(ApiResponse::status(outage.status));
                }
                outage.remaining_ok -= 1;
            }
        }

        match request {
            ApiRequest::FetchPage {
                collection_id,
                cursor,
                page_size,
            } => {
                let Some(items) = state.collections.get(collection_id.as_str()) else {
                    return Ok(ApiResponse::status(404));
                };
                let total = items.len();
                if state.stalled.contains(collection_id.as_str()) {
                    return Ok(ApiResponse::ok(json!({
                        "items": [],
                        "next_cursor": cursor,
                        "total": total,
                    })));
                }

                let start = usize::try_from(*cursor).unwrap().min(total);
                let end = (start + *page_size as usize).min(total);
                let next_cursor = (end < total).then_some(end);
                if state
                    .withheld
                    .contains(&(collection_id.as_str().to_string(), *cursor))
                {
                    return Ok(ApiResponse::ok(json!({
                        "items": [],
                        "next_cursor": next_cursor,
                        "total": total,
                    })));
                }
                Ok(ApiResponse::ok(json!({
                    "items": items[start..end].to_vec(),
                    "next_cursor": next_cursor,
                    "total": total,
                })))
            }
            ApiRequest::CreateCollection { name, .. } => {
                let id = format!("target-{}", state.created.len() + 1);
                state.created.push(CreatedTarget {
                    id: id.clone(),
                    name: name.clone(),
                    ids: Vec::new(),
                });
                Ok(ApiResponse::ok(json!({ "collection_id": id })))
            }
            ApiRequest::AddItems { collection_id, ids } => {
                let Some(target) = state
                    .created
                    .iter_mut()
                    .find(|t| t.id == collection_id.as_str())
                else {
                    return Ok(ApiResponse::status(404));
                };
                target
                    .ids
                    .extend(ids.iter().map(|id| id.as_str().to_string()));
                Ok(ApiResponse::ok(json!({})))
            }
        }
    }
}

/// An API entry wrapping a fully populated track.
pub fn entry(id: &str, added_at: &str) -> Value {
    json!({
        "added_at": added_at,
        "track": {
            "id": id,
            "name": format!("Song {id}"),
            "artists": [{"id": format!("artist-{id}"), "name": format!("Artist {id}")}],
            "album": {"id": "album-1", "name": "Album", "release_date": "2001-06-01"},
            "duration_ms": 180_000,
            "popularity": 40,
            "explicit": false,
            "external_ids": {"isrc": format!("ISRC{id}")}
        }
    })
}

/// `count` entries with ids `{prefix}-0000...`, added one minute apart.
pub fn entries(prefix: &str, count: usize) -> Vec<Value> {
    (0..count)
        .map(|i| {
            entry(
                &format!("{prefix}-{i:04}"),
                &format!("2020-01-{:02}T{:02}:{:02}:00Z", 1 + i / 1440, (i / 60) % 24, i % 60),
            )
        })
        .collect()
}

/// Retries that finish instantly on paused time.
pub fn fast_policy() -> RetryPolicy {
    RetryPolicy {
        max_attempts: 2,
        default_retry_after: Duration::from_millis(10),
        backoff_base: Duration::from_millis(10),
        backoff_cap: Duration::from_millis(50),
    }
}

/// Scratch database, checkpoint directory, and a client over `api`.
pub struct Harness {
    pub db: Database,
    pub checkpoints: CheckpointStore,
    pub client: RateLimitedClient<FakeApi>,
    pub dir: TempDir,
}

impl Harness {
    pub fn new(api: FakeApi) -> Self {
        let dir = TempDir::new().unwrap();
        let db = Database::open(dir.path().join("unison.db")).unwrap();
        let checkpoints = CheckpointStore::open(dir.path().join("checkpoints")).unwrap();
        let client = RateLimitedClient::new(api, fast_policy(), RateLimiter::unlimited());
        Self {
            db,
            checkpoints,
            client,
            dir,
        }
    }

    pub fn api(&self) -> &FakeApi {
        self.client.transport()
    }
}
