//! Checkpointed, resumable collection fetching.
//!
//! A fetch pages through one collection, lands every page in the raw log
//! in its own transaction, and records progress in a checkpoint so an
//! interrupted run picks up where it stopped instead of starting over.

use serde::Serialize;

use unison_core::model::CollectionId;
use unison_core::schema::Database;

use crate::api::{Transport, MAX_PAGE_SIZE};
use crate::checkpoint::{CheckpointRecord, CheckpointStore};
use crate::client::RateLimitedClient;
use crate::error::{SyncError, SyncResult};

/// Lifecycle of a collection fetch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum FetchState {
    NotStarted,
    Resuming,
    InProgress,
    Completed,
    Failed,
}

impl FetchState {
    /// State implied by a stored checkpoint, before any new work.
    pub fn from_checkpoint(record: Option<&CheckpointRecord>) -> Self {
        match record {
            None => Self::NotStarted,
            Some(r) if r.completed => Self::Completed,
            Some(_) => Self::Resuming,
        }
    }
}

/// Tuning for a fetch run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchOptions {
    pub page_size: u32,
    /// Save a checkpoint after roughly this many items.
    pub checkpoint_interval: u64,
    /// Discard any existing checkpoint and fetch from scratch.
    pub refresh: bool,
}

impl Default for FetchOptions {
    fn default() -> Self {
        Self {
            page_size: MAX_PAGE_SIZE,
            checkpoint_interval: 500,
            refresh: false,
        }
    }
}

/// Result of a fetch that reached the end of its collection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FetchOutcome {
    pub collection_id: CollectionId,
    pub state: FetchState,
    /// Cursor the run resumed from, if it resumed.
    pub resumed_from: Option<u64>,
    /// Items received during this run.
    pub fetched: u64,
    /// Entries stored during this run.
    pub stored: u64,
    /// Entries skipped as malformed during this run.
    pub skipped: u64,
    /// Entries stored across every run of this stream.
    pub accumulated_count: u64,
    pub cursor: u64,
    pub total: Option<u64>,
}

/// Checkpoint key of a collection fetch.
pub fn stream_key(collection_id: &CollectionId) -> String {
    format!("fetch:{collection_id}")
}

/// Pages a collection into the raw log.
#[derive(Debug)]
pub struct Fetcher<'a, T> {
    client: &'a RateLimitedClient<T>,
    checkpoints: &'a CheckpointStore,
    store: &'a Database,
    options: FetchOptions,
}

impl<'a, T: Transport> Fetcher<'a, T> {
    pub fn new(
        client: &'a RateLimitedClient<T>,
        checkpoints: &'a CheckpointStore,
        store: &'a Database,
        options: FetchOptions,
    ) -> Self {
        Self {
            client,
            checkpoints,
            store,
            options,
        }
    }

    /// Fetch `collection_id` to completion, resuming from its checkpoint.
    ///
    /// A completed checkpoint makes this a no-op unless `refresh` is set.
    ///
    /// # Errors
    ///
    /// Failures after work has started are returned as
    /// [`SyncError::Interrupted`], reporting the last cursor that reached
    /// the checkpoint store.
    pub async fn fetch(&self, collection_id: &CollectionId) -> SyncResult<FetchOutcome> {
        let key = stream_key(collection_id);

        if self.options.refresh {
            self.checkpoints.clear(&key)?;
        }

        let existing = self.checkpoints.load(&key)?;
        let mut state = FetchState::from_checkpoint(existing.as_ref());
        log::debug!("{} starts as {:?}", key, state);

        let mut resumed_from = None;
        let mut checkpoint = match existing {
            Some(record) if record.completed => {
                log::info!(
                    "{} already fetched ({} entries), skipping",
                    collection_id,
                    record.accumulated_count
                );
                return Ok(FetchOutcome {
                    collection_id: collection_id.clone(),
                    state,
                    resumed_from: None,
                    fetched: 0,
                    stored: 0,
                    skipped: 0,
                    accumulated_count: record.accumulated_count,
                    cursor: record.cursor,
                    total: record.total,
                });
            }
            Some(record) if self.store.current_generation(collection_id)?.is_some() => {
                log::info!(
                    "Resuming {} at cursor {} ({} entries stored)",
                    collection_id,
                    record.cursor,
                    record.accumulated_count
                );
                resumed_from = Some(record.cursor);
                record
            }
            Some(record) => {
                log::warn!(
                    "Checkpoint for {} is at cursor {} but the store has no entries for it, starting over",
                    collection_id,
                    record.cursor
                );
                self.checkpoints.clear(&key)?;
                self.store.begin_generation(collection_id)?;
                CheckpointRecord::new(&key)
            }
            None => {
                let generation = self.store.begin_generation(collection_id)?;
                log::info!("Fetching {} (generation {})", collection_id, generation);
                CheckpointRecord::new(&key)
            }
        };

        transition(&key, &mut state, FetchState::InProgress);

        let mut outcome = FetchOutcome {
            collection_id: collection_id.clone(),
            state,
            resumed_from,
            fetched: 0,
            stored: 0,
            skipped: 0,
            accumulated_count: checkpoint.accumulated_count,
            cursor: checkpoint.cursor,
            total: checkpoint.total,
        };
        let mut durable = checkpoint.cursor;
        let mut since_checkpoint = 0;

        loop {
            let page = match self
                .client
                .fetch_page(collection_id, checkpoint.cursor, self.options.page_size)
                .await
            {
                Ok(page) => page,
                Err(e) => return Err(self.interrupt(&mut state, &checkpoint, durable, e)),
            };

            if page.total.is_some() {
                checkpoint.total = page.total;
            }

            let summary = match self
                .store
                .ingest(collection_id, Some(checkpoint.cursor), &page.items)
            {
                Ok(summary) => summary,
                Err(e) => return Err(self.interrupt(&mut state, &checkpoint, durable, e.into())),
            };

            let returned = page.items.len() as u64;
            let advanced = checkpoint.cursor + returned;
            let next = match page.next_cursor {
                Some(next) => {
                    let next = next.max(advanced);
                    if next == checkpoint.cursor {
                        let stalled = SyncError::StalledPagination {
                            cursor: checkpoint.cursor,
                        };
                        return Err(self.interrupt(&mut state, &checkpoint, durable, stalled));
                    }
                    Some(next)
                }
                None => None,
            };

            checkpoint.cursor = next.unwrap_or(advanced);
            checkpoint.accumulated_count += summary.stored;
            outcome.fetched += returned;
            outcome.stored += summary.stored;
            outcome.skipped += summary.skipped;
            since_checkpoint += returned;

            log::debug!(
                "{}: {}/{} (+{} stored, {} skipped)",
                collection_id,
                checkpoint.cursor,
                checkpoint
                    .total
                    .map_or_else(|| "?".to_string(), |t| t.to_string()),
                summary.stored,
                summary.skipped
            );

            if next.is_none() {
                break;
            }

            if since_checkpoint >= self.options.checkpoint_interval {
                if let Err(e) = self.checkpoints.save(&checkpoint) {
                    return Err(self.interrupt(&mut state, &checkpoint, durable, e));
                }
                durable = checkpoint.cursor;
                since_checkpoint = 0;
                log::info!(
                    "{}: {} of {} fetched",
                    collection_id,
                    checkpoint.cursor,
                    checkpoint
                        .total
                        .map_or_else(|| "?".to_string(), |t| t.to_string())
                );
            }
        }

        checkpoint.completed = true;
        if let Err(e) = self.checkpoints.save(&checkpoint) {
            checkpoint.completed = false;
            return Err(self.interrupt(&mut state, &checkpoint, durable, e));
        }
        transition(&key, &mut state, FetchState::Completed);

        log::info!(
            "Fetched {}: {} entries stored, {} skipped",
            collection_id,
            checkpoint.accumulated_count,
            outcome.skipped
        );

        outcome.state = state;
        outcome.accumulated_count = checkpoint.accumulated_count;
        outcome.cursor = checkpoint.cursor;
        outcome.total = checkpoint.total;
        Ok(outcome)
    }

    /// Save progress and wrap `source` as an interrupted run.
    ///
    /// If the save fails, the reported cursor falls back to `durable`, the
    /// last one known to be on disk.
    fn interrupt(
        &self,
        state: &mut FetchState,
        checkpoint: &CheckpointRecord,
        durable: u64,
        source: SyncError,
    ) -> SyncError {
        transition(&checkpoint.stream_key, state, FetchState::Failed);

        let saved = match self.checkpoints.save(checkpoint) {
            Ok(()) => checkpoint.cursor,
            Err(e) => {
                log::error!(
                    "Could not save checkpoint {}, resume will start from {}: {}",
                    checkpoint.stream_key,
                    durable,
                    e
                );
                durable
            }
        };

        log::error!(
            "{} stopped at {}: {}",
            checkpoint.stream_key,
            checkpoint.cursor,
            source
        );

        SyncError::Interrupted {
            stream_key: checkpoint.stream_key.clone(),
            saved,
            total: checkpoint.total,
            source: Box::new(source),
        }
    }
}

fn transition(key: &str, state: &mut FetchState, next: FetchState) {
    log::debug!("{}: {:?} -> {:?}", key, state, next);
    *state = next;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_from_checkpoint() {
        assert_eq!(FetchState::from_checkpoint(None), FetchState::NotStarted);

        let mut record = CheckpointRecord::new("fetch:p1");
        assert_eq!(
            FetchState::from_checkpoint(Some(&record)),
            FetchState::Resuming
        );

        record.completed = true;
        assert_eq!(
            FetchState::from_checkpoint(Some(&record)),
            FetchState::Completed
        );
    }

    #[test]
    fn test_stream_key() {
        assert_eq!(
            stream_key(&CollectionId::new("37i9dQ").unwrap()),
            "fetch:37i9dQ"
        );
    }
}
