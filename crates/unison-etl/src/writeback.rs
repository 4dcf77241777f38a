//! Confirmed, checkpointed write-back of the deduplicated library.
//!
//! The id list is split into target collections of at most
//! `max_per_target` ids each. Every target is its own checkpointed stream:
//! the created collection id and the number of ids written are saved after
//! creation and after every batch, so a re-run continues the same target
//! instead of creating another one or resubmitting written ids.

use serde::Serialize;

use unison_core::model::{CollectionId, RecordId};

use crate::api::{Transport, MAX_WRITE_BATCH};
use crate::checkpoint::{CheckpointRecord, CheckpointStore};
use crate::client::RateLimitedClient;
use crate::error::{SyncError, SyncResult};

/// Default upper bound on ids per target collection.
pub const DEFAULT_MAX_PER_TARGET: usize = 10_000;

/// One planned target collection and the slice of ids it receives.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TargetPlan {
    pub name: String,
    /// 1-based part number.
    pub part: usize,
    pub parts: usize,
    pub start: usize,
    pub end: usize,
}

impl TargetPlan {
    pub fn len(&self) -> usize {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }

    /// Checkpoint key of this target.
    pub fn stream_key(&self, target_name: &str) -> String {
        format!("write:{target_name}:{}:{}", self.part, self.parts)
    }
}

/// Split `total` ids into `ceil(total / max_per_target)` targets.
///
/// A single target keeps `target_name`; several are suffixed
/// `" (Part k)"`. Concatenating the slices reproduces the input order.
///
/// # Errors
///
/// [`SyncError::InvalidArgument`] if `max_per_target` is zero.
pub fn plan_targets(
    total: usize,
    target_name: &str,
    max_per_target: usize,
) -> SyncResult<Vec<TargetPlan>> {
    if max_per_target == 0 {
        return Err(SyncError::InvalidArgument(
            "max_per_target must be at least 1".to_string(),
        ));
    }

    let parts = total.div_ceil(max_per_target);
    Ok((0..parts)
        .map(|index| {
            let part = index + 1;
            let name = if parts == 1 {
                target_name.to_string()
            } else {
                format!("{target_name} (Part {part})")
            };
            TargetPlan {
                name,
                part,
                parts,
                start: index * max_per_target,
                end: total.min(part * max_per_target),
            }
        })
        .collect())
}

/// Outcome of one target collection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TargetReport {
    pub name: String,
    pub collection_id: CollectionId,
    pub written: u64,
    pub planned: u64,
    /// Ids already written by an earlier run, if this run resumed.
    pub resumed_from: Option<u64>,
}

/// Outcome of a write-back.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WriteReport {
    pub confirmed: bool,
    pub targets: Vec<TargetReport>,
}

impl WriteReport {
    pub fn total_written(&self) -> u64 {
        self.targets.iter().map(|t| t.written).sum()
    }
}

/// Settings for created target collections.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteOptions {
    pub batch_size: usize,
    pub public: bool,
    pub description: Option<String>,
}

impl Default for WriteOptions {
    fn default() -> Self {
        Self {
            batch_size: MAX_WRITE_BATCH,
            public: false,
            description: None,
        }
    }
}

/// Writes id lists to new target collections.
#[derive(Debug)]
pub struct WriteBack<'a, T> {
    client: &'a RateLimitedClient<T>,
    checkpoints: &'a CheckpointStore,
    options: WriteOptions,
}

impl<'a, T: Transport> WriteBack<'a, T> {
    pub fn new(
        client: &'a RateLimitedClient<T>,
        checkpoints: &'a CheckpointStore,
        options: WriteOptions,
    ) -> Self {
        Self {
            client,
            checkpoints,
            options,
        }
    }

    /// Write `ids` to one or more new collections named after `target_name`.
    ///
    /// Nothing is sent unless `confirm` is `true`.
    ///
    /// # Errors
    ///
    /// [`SyncError::InvalidArgument`] for a zero `max_per_target` or batch
    /// size; [`SyncError::Interrupted`] when a target stops part-way (its
    /// progress is checkpointed and the partial collection is kept).
    pub async fn execute(
        &self,
        ids: &[RecordId],
        target_name: &str,
        max_per_target: usize,
        confirm: bool,
    ) -> SyncResult<WriteReport> {
        if !confirm {
            log::info!("Write-back not confirmed, nothing written");
            return Ok(WriteReport {
                confirmed: false,
                targets: Vec::new(),
            });
        }

        if self.options.batch_size == 0 || self.options.batch_size > MAX_WRITE_BATCH {
            return Err(SyncError::InvalidArgument(format!(
                "batch size must be between 1 and {MAX_WRITE_BATCH}, got {}",
                self.options.batch_size
            )));
        }

        let plans = plan_targets(ids.len(), target_name, max_per_target)?;
        log::info!(
            "Writing {} ids to {} target collection(s)",
            ids.len(),
            plans.len()
        );

        let mut targets = Vec::with_capacity(plans.len());
        for plan in &plans {
            let key = plan.stream_key(target_name);
            targets.push(self.write_target(&key, plan, &ids[plan.start..plan.end]).await?);
        }

        Ok(WriteReport {
            confirmed: true,
            targets,
        })
    }

    async fn write_target(
        &self,
        key: &str,
        plan: &TargetPlan,
        slice: &[RecordId],
    ) -> SyncResult<TargetReport> {
        let planned = slice.len() as u64;
        let existing = self.checkpoints.load(key)?;
        let resumed_from = existing.as_ref().map(|record| record.accumulated_count);

        if let Some(record) = &existing {
            if record.total != Some(planned) || record.accumulated_count > planned {
                return Err(SyncError::CheckpointCorrupt {
                    path: self.checkpoints.dir().to_path_buf(),
                    message: format!(
                        "{key} was saved for {:?} ids with {} written, but {planned} are planned",
                        record.total, record.accumulated_count
                    ),
                });
            }
        }

        let mut checkpoint = match existing {
            Some(record) if record.completed => {
                log::info!("{} already written, skipping", plan.name);
                let collection_id = remote_id(&record)?;
                return Ok(TargetReport {
                    name: plan.name.clone(),
                    collection_id,
                    written: record.accumulated_count,
                    planned,
                    resumed_from,
                });
            }
            Some(record) => record,
            None => CheckpointRecord::new(key).with_total(Some(planned)),
        };
        let mut durable = checkpoint.accumulated_count;

        let collection_id = if checkpoint.remote_id.is_some() {
            let id = remote_id(&checkpoint)?;
            log::info!(
                "Resuming {} ({}) after {} of {} ids",
                plan.name,
                id,
                checkpoint.accumulated_count,
                planned
            );
            id
        } else {
            let id = self
                .client
                .create_collection(
                    &plan.name,
                    self.options.public,
                    self.options.description.as_deref(),
                )
                .await
                .map_err(|e| interrupted(&checkpoint, durable, e))?;
            log::info!("Created {} ({})", plan.name, id);
            checkpoint.remote_id = Some(id.to_string());
            if let Err(e) = self.checkpoints.save(&checkpoint) {
                return Err(self.halt(&checkpoint, durable, e));
            }
            id
        };

        let mut written = usize::try_from(checkpoint.accumulated_count)
            .map_err(|_| SyncError::InvalidArgument(format!("{key}: written count overflows")))?;

        for batch in slice[written..].chunks(self.options.batch_size) {
            if let Err(e) = self.client.add_items(&collection_id, batch).await {
                log::error!(
                    "{} stopped after {} of {} ids: {}",
                    plan.name,
                    written,
                    planned,
                    e
                );
                return Err(self.halt(&checkpoint, durable, e));
            }

            written += batch.len();
            checkpoint.cursor = written as u64;
            checkpoint.accumulated_count = written as u64;
            if let Err(e) = self.checkpoints.save(&checkpoint) {
                return Err(self.halt(&checkpoint, durable, e));
            }
            durable = checkpoint.accumulated_count;
            log::debug!("{}: {}/{}", plan.name, written, planned);
        }

        checkpoint.completed = true;
        if let Err(e) = self.checkpoints.save(&checkpoint) {
            checkpoint.completed = false;
            return Err(self.halt(&checkpoint, durable, e));
        }
        log::info!("Wrote {} ids to {}", written, plan.name);

        Ok(TargetReport {
            name: plan.name.clone(),
            collection_id,
            written: written as u64,
            planned,
            resumed_from,
        })
    }

    /// Save `checkpoint` and wrap `source` as an interrupted target.
    ///
    /// A failed save reports `durable`, the last count known to be on disk.
    fn halt(&self, checkpoint: &CheckpointRecord, durable: u64, source: SyncError) -> SyncError {
        let saved = match self.checkpoints.save(checkpoint) {
            Ok(()) => checkpoint.accumulated_count,
            Err(e) => {
                log::error!(
                    "Could not save checkpoint {}, resume will start after {}: {}",
                    checkpoint.stream_key,
                    durable,
                    e
                );
                durable
            }
        };
        interrupted(checkpoint, saved, source)
    }
}

fn remote_id(record: &CheckpointRecord) -> SyncResult<CollectionId> {
    let id = record.remote_id.clone().unwrap_or_default();
    CollectionId::new(id).map_err(|e| SyncError::InvalidArgument(format!(
        "{} has no usable remote collection id: {e}",
        record.stream_key
    )))
}

fn interrupted(checkpoint: &CheckpointRecord, saved: u64, source: SyncError) -> SyncError {
    SyncError::Interrupted {
        stream_key: checkpoint.stream_key.clone(),
        saved,
        total: checkpoint.total,
        source: Box::new(source),
    }
}
