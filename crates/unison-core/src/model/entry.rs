use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Error, Result};
use crate::model::ids::{CollectionId, RecordId};

/// One occurrence of a track within one source collection.
///
/// The `payload` is the full entry wrapper exactly as the API returned it
/// (`{"added_at": ..., "track": {...}}`) and is never modified once stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entry {
    pub record_id: RecordId,
    pub collection_source: CollectionId,
    /// Verbatim `added_at` of the wrapper, if present.
    pub added_at: Option<String>,
    pub payload: Value,
}

impl Entry {
    /// Validate an API entry wrapper.
    ///
    /// # Errors
    /// Returns [`Error::MalformedEntry`] when the nested track object is
    /// missing (local files, removed tracks) or carries no usable id.
    pub fn from_payload(collection_source: &CollectionId, payload: Value) -> Result<Self> {
        let record_id = record_id_of(&payload)?;
        let added_at = payload
            .get("added_at")
            .and_then(Value::as_str)
            .map(str::to_string);

        Ok(Self {
            record_id,
            collection_source: collection_source.clone(),
            added_at,
            payload,
        })
    }
}

/// Pull the track id out of an entry wrapper.
pub(crate) fn record_id_of(payload: &Value) -> Result<RecordId> {
    let track = payload
        .get("track")
        .filter(|t| t.is_object())
        .ok_or_else(|| Error::MalformedEntry("entry has no track".to_string()))?;

    let id = track
        .get("id")
        .and_then(Value::as_str)
        .ok_or_else(|| Error::MalformedEntry("track has no id".to_string()))?;

    RecordId::new(id).map_err(|_| Error::MalformedEntry("track id is empty".to_string()))
}

/// A persisted copy of an entry's payload plus ingestion metadata.
///
/// Rows are append-only. `generation` identifies the fetch run of the
/// collection the row belongs to, `position` its upstream offset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawRecord {
    pub id: i64,
    pub collection_source: CollectionId,
    pub generation: i64,
    pub position: Option<u64>,
    pub record_id: RecordId,
    pub payload: Value,
    pub fetched_at: DateTime<Utc>,
}
