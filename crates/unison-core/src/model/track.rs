use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::Result;
use crate::model::entry::{record_id_of, RawRecord};
use crate::model::ids::{CollectionId, RecordId};

/// One typed row of the projection, derived from exactly one raw record.
///
/// Every optional field follows null-on-absence: a missing or mistyped
/// value in the payload becomes `None` (or `false` for `explicit`), never
/// an error. Only a missing `record_id` rejects the row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProjectedRecord {
    pub record_id: RecordId,
    pub name: Option<String>,
    pub primary_artist: Option<String>,
    pub primary_artist_id: Option<String>,
    pub album: Option<String>,
    pub album_id: Option<String>,
    pub release_date: Option<String>,
    pub duration_ms: Option<i64>,
    pub popularity: Option<i64>,
    pub explicit: bool,
    pub isrc: Option<String>,
    /// Verbatim `added_at` of the entry wrapper (not of the track).
    pub added_at: Option<String>,
    pub collection_source: CollectionId,
    pub position: Option<u64>,
}

impl ProjectedRecord {
    /// Extract the typed projection of a raw record.
    ///
    /// # Errors
    /// Returns `Error::MalformedEntry` if the payload has no track id.
    pub fn extract(raw: &RawRecord) -> Result<Self> {
        let record_id = record_id_of(&raw.payload)?;
        let track = raw.payload.get("track").unwrap_or(&Value::Null);
        let album = track.get("album").unwrap_or(&Value::Null);
        let first_artist = track
            .get("artists")
            .and_then(Value::as_array)
            .and_then(|artists| artists.first())
            .unwrap_or(&Value::Null);

        Ok(Self {
            record_id,
            name: text(track.get("name")),
            primary_artist: text(first_artist.get("name")),
            primary_artist_id: text(first_artist.get("id")),
            album: text(album.get("name")),
            album_id: text(album.get("id")),
            release_date: text(album.get("release_date")),
            duration_ms: integer(track.get("duration_ms")),
            popularity: integer(track.get("popularity")),
            explicit: boolean(track.get("explicit")),
            isrc: text(track.get("external_ids").and_then(|ids| ids.get("isrc"))),
            added_at: text(raw.payload.get("added_at")),
            collection_source: raw.collection_source.clone(),
            position: raw.position,
        })
    }

    /// The release year, when `release_date` starts with four digits.
    #[must_use]
    pub fn release_year(&self) -> Option<i32> {
        let date = self.release_date.as_deref()?;
        let year = date.get(..4)?;
        if year.bytes().all(|b| b.is_ascii_digit()) {
            year.parse().ok()
        } else {
            None
        }
    }
}

fn text(value: Option<&Value>) -> Option<String> {
    value.and_then(Value::as_str).map(str::to_string)
}

#[allow(clippy::cast_possible_truncation)]
fn integer(value: Option<&Value>) -> Option<i64> {
    match value? {
        Value::Number(n) => n
            .as_i64()
            .or_else(|| n.as_f64().filter(|f| f.is_finite()).map(|f| f.trunc() as i64)),
        Value::String(s) => {
            let s = s.trim();
            s.parse::<i64>().ok().or_else(|| {
                s.parse::<f64>()
                    .ok()
                    .filter(|f| f.is_finite())
                    .map(|f| f.trunc() as i64)
            })
        }
        _ => None,
    }
}

fn boolean(value: Option<&Value>) -> bool {
    match value {
        Some(Value::Bool(b)) => *b,
        Some(Value::Number(n)) => n.as_f64().is_some_and(|f| f != 0.0),
        Some(Value::String(s)) => matches!(
            s.trim().to_ascii_lowercase().as_str(),
            "true" | "1" | "yes"
        ),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde_json::json;

    fn raw(payload: Value) -> RawRecord {
        RawRecord {
            id: 1,
            collection_source: CollectionId::new("p1").unwrap(),
            generation: 1,
            position: Some(7),
            record_id: RecordId::new("placeholder").unwrap(),
            payload,
            fetched_at: Utc::now(),
        }
    }

    #[test]
    fn test_extract_full_payload() {
        let record = ProjectedRecord::extract(&raw(json!({
            "added_at": "2021-03-04T05:06:07Z",
            "track": {
                "id": "T1",
                "name": "Blue in Green",
                "artists": [
                    {"id": "AR1", "name": "Miles Davis"},
                    {"id": "AR2", "name": "Bill Evans"}
                ],
                "album": {"id": "AL1", "name": "Kind of Blue", "release_date": "1959-08-17"},
                "duration_ms": 337_000,
                "popularity": 71,
                "explicit": false,
                "external_ids": {"isrc": "USSM15900115"}
            }
        })))
        .unwrap();

        assert_eq!(record.record_id.as_str(), "T1");
        assert_eq!(record.name.as_deref(), Some("Blue in Green"));
        assert_eq!(record.primary_artist.as_deref(), Some("Miles Davis"));
        assert_eq!(record.primary_artist_id.as_deref(), Some("AR1"));
        assert_eq!(record.album.as_deref(), Some("Kind of Blue"));
        assert_eq!(record.release_date.as_deref(), Some("1959-08-17"));
        assert_eq!(record.release_year(), Some(1959));
        assert_eq!(record.duration_ms, Some(337_000));
        assert_eq!(record.popularity, Some(71));
        assert!(!record.explicit);
        assert_eq!(record.isrc.as_deref(), Some("USSM15900115"));
        assert_eq!(record.added_at.as_deref(), Some("2021-03-04T05:06:07Z"));
        assert_eq!(record.collection_source.as_str(), "p1");
        assert_eq!(record.position, Some(7));
    }

    #[test]
    fn test_extract_minimal_payload_never_fails() {
        let record = ProjectedRecord::extract(&raw(json!({"track": {"id": "T2"}}))).unwrap();
        assert_eq!(record.record_id.as_str(), "T2");
        assert!(record.name.is_none());
        assert!(record.primary_artist.is_none());
        assert!(record.album.is_none());
        assert!(record.duration_ms.is_none());
        assert!(record.isrc.is_none());
        assert!(record.added_at.is_none());
        assert!(!record.explicit);
    }

    #[test]
    fn test_extract_empty_artist_list_is_null() {
        let record =
            ProjectedRecord::extract(&raw(json!({"track": {"id": "T3", "artists": []}})))
                .unwrap();
        assert!(record.primary_artist.is_none());
    }

    #[test]
    fn test_extract_casts_loose_types() {
        let record = ProjectedRecord::extract(&raw(json!({
            "track": {
                "id": "T4",
                "duration_ms": "215000",
                "popularity": 42.9,
                "explicit": "true",
                "external_ids": {}
            }
        })))
        .unwrap();
        assert_eq!(record.duration_ms, Some(215_000));
        assert_eq!(record.popularity, Some(42));
        assert!(record.explicit);
        assert!(record.isrc.is_none());
    }

    #[test]
    fn test_extract_non_numeric_duration_is_null() {
        let record = ProjectedRecord::extract(&raw(json!({
            "track": {"id": "T5", "duration_ms": "three minutes", "explicit": 1}
        })))
        .unwrap();
        assert!(record.duration_ms.is_none());
        assert!(record.explicit);
    }

    #[test]
    fn test_extract_requires_record_id() {
        let err = ProjectedRecord::extract(&raw(json!({"track": {"name": "no id"}}))).unwrap_err();
        assert!(err.is_malformed_entry());
    }

    #[test]
    fn test_release_year_requires_digits() {
        let mut record =
            ProjectedRecord::extract(&raw(json!({"track": {"id": "T6"}}))).unwrap();
        record.release_date = Some("19xx".to_string());
        assert!(record.release_year().is_none());
        record.release_date = Some("2004".to_string());
        assert_eq!(record.release_year(), Some(2004));
    }
}
