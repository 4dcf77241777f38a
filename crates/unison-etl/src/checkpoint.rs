//! Durable progress records for resumable streams.
//!
//! One JSON file per stream key lives in the checkpoint directory. Writes
//! go to a temporary file in the same directory, are synced, then renamed
//! over the old record, so a crash leaves either the previous or the new
//! record and never a torn one.

use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;

use crate::error::{SyncError, SyncResult};

/// Progress of one stream (a collection fetch or a write-back target).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointRecord {
    pub stream_key: String,
    /// Upstream position to continue from.
    pub cursor: u64,
    /// Items durably handled so far.
    pub accumulated_count: u64,
    pub completed: bool,
    pub updated_at: DateTime<Utc>,
    /// Upstream total, when known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total: Option<u64>,
    /// Remote collection created for a write-back target.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_id: Option<String>,
}

impl CheckpointRecord {
    /// A fresh record at cursor zero.
    pub fn new(stream_key: impl Into<String>) -> Self {
        Self {
            stream_key: stream_key.into(),
            cursor: 0,
            accumulated_count: 0,
            completed: false,
            updated_at: Utc::now(),
            total: None,
            remote_id: None,
        }
    }

    #[must_use]
    pub fn with_total(mut self, total: Option<u64>) -> Self {
        self.total = total;
        self
    }
}

/// A checkpoint file that could not be read as a record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CorruptCheckpoint {
    /// Key decoded from the file name, when the name is one we wrote.
    pub stream_key: Option<String>,
    pub path: PathBuf,
    pub message: String,
}

/// Everything in a checkpoint directory, readable or not.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CheckpointListing {
    /// Sorted by stream key.
    pub records: Vec<CheckpointRecord>,
    pub corrupt: Vec<CorruptCheckpoint>,
}

impl CheckpointListing {
    pub fn is_empty(&self) -> bool {
        self.records.is_empty() && self.corrupt.is_empty()
    }
}

/// Directory-backed checkpoint storage.
#[derive(Debug, Clone)]
pub struct CheckpointStore {
    dir: PathBuf,
}

impl CheckpointStore {
    /// Open (creating if needed) a checkpoint directory.
    pub fn open(dir: impl Into<PathBuf>) -> SyncResult<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, stream_key: &str) -> PathBuf {
        self.dir
            .join(format!("{}.json", URL_SAFE_NO_PAD.encode(stream_key)))
    }

    /// Whether a file exists for `stream_key`, without reading it.
    pub fn contains(&self, stream_key: &str) -> bool {
        self.path_for(stream_key).is_file()
    }

    /// Checkpoint files in the directory, paired with the key their name
    /// encodes. Temporary files from in-flight saves are skipped.
    fn files(&self) -> SyncResult<Vec<(PathBuf, Option<String>)>> {
        let mut files = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let key = key_from_path(&path);
            files.push((path, key));
        }
        Ok(files)
    }

    /// Load the record for `stream_key`, or `None` if there is none.
    ///
    /// # Errors
    ///
    /// [`SyncError::CheckpointCorrupt`] if the file exists but does not
    /// parse, or belongs to a different key.
    pub fn load(&self, stream_key: &str) -> SyncResult<Option<CheckpointRecord>> {
        let path = self.path_for(stream_key);
        let text = match fs::read_to_string(&path) {
            Ok(text) => text,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let record = parse_record(&path, &text)?;
        if record.stream_key != stream_key {
            return Err(SyncError::CheckpointCorrupt {
                path,
                message: format!(
                    "record is for {:?}, expected {:?}",
                    record.stream_key, stream_key
                ),
            });
        }
        Ok(Some(record))
    }

    /// Atomically persist `record`, stamping `updated_at`.
    ///
    /// # Errors
    ///
    /// [`SyncError::InvalidArgument`] if the cursor would move backwards
    /// relative to the stored record.
    pub fn save(&self, record: &CheckpointRecord) -> SyncResult<()> {
        if let Some(existing) = self.load(&record.stream_key)? {
            if record.cursor < existing.cursor {
                return Err(SyncError::InvalidArgument(format!(
                    "checkpoint {} would move back from {} to {}",
                    record.stream_key, existing.cursor, record.cursor
                )));
            }
        }

        let mut stamped = record.clone();
        stamped.updated_at = Utc::now();

        let mut tmp = NamedTempFile::new_in(&self.dir)?;
        serde_json::to_writer_pretty(&mut tmp, &stamped)?;
        tmp.write_all(b"\n")?;
        tmp.as_file().sync_all()?;
        tmp.persist(self.path_for(&record.stream_key))
            .map_err(|e| e.error)?;

        log::debug!(
            "Checkpoint {}: cursor {}, {} handled{}",
            record.stream_key,
            record.cursor,
            record.accumulated_count,
            if record.completed { ", completed" } else { "" }
        );
        Ok(())
    }

    /// Remove the record for `stream_key`; missing records are fine.
    pub fn clear(&self, stream_key: &str) -> SyncResult<()> {
        match fs::remove_file(self.path_for(stream_key)) {
            Ok(()) => {
                log::info!("Cleared checkpoint {}", stream_key);
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Every stored record, sorted by stream key.
    ///
    /// Files that do not parse, or whose record names a different key than
    /// the file, are reported in [`CheckpointListing::corrupt`] rather than
    /// failing the listing.
    pub fn list(&self) -> SyncResult<CheckpointListing> {
        let mut listing = CheckpointListing::default();
        for (path, key) in self.files()? {
            let parsed = fs::read_to_string(&path)
                .map_err(SyncError::from)
                .and_then(|text| parse_record(&path, &text));
            match parsed {
                Ok(record) if key.as_deref() == Some(record.stream_key.as_str()) => {
                    listing.records.push(record);
                }
                Ok(record) => listing.corrupt.push(CorruptCheckpoint {
                    stream_key: key,
                    message: format!("file holds the record for {:?}", record.stream_key),
                    path,
                }),
                Err(e) => listing.corrupt.push(CorruptCheckpoint {
                    stream_key: key,
                    message: match e {
                        SyncError::CheckpointCorrupt { message, .. } => message,
                        other => other.to_string(),
                    },
                    path,
                }),
            }
        }
        listing
            .records
            .sort_by(|a, b| a.stream_key.cmp(&b.stream_key));
        listing.corrupt.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(listing)
    }

    /// Remove every record whose key starts with `prefix`.
    ///
    /// Keys come from the file names, so unreadable records are removed
    /// too. Returns the number of files removed.
    pub fn clear_prefix(&self, prefix: &str) -> SyncResult<usize> {
        let mut cleared = 0;
        for (path, key) in self.files()? {
            match key {
                Some(key) if key.starts_with(prefix) => {
                    fs::remove_file(&path)?;
                    log::info!("Cleared checkpoint {}", key);
                    cleared += 1;
                }
                Some(_) => {}
                None => log::warn!("Skipping unrecognised file {}", path.display()),
            }
        }
        Ok(cleared)
    }
}

fn key_from_path(path: &Path) -> Option<String> {
    let stem = path.file_stem()?.to_str()?;
    let bytes = URL_SAFE_NO_PAD.decode(stem).ok()?;
    String::from_utf8(bytes).ok()
}

fn parse_record(path: &Path, text: &str) -> SyncResult<CheckpointRecord> {
    serde_json::from_str(text).map_err(|e| SyncError::CheckpointCorrupt {
        path: path.to_path_buf(),
        message: e.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn store() -> (TempDir, CheckpointStore) {
        let dir = TempDir::new().unwrap();
        let store = CheckpointStore::open(dir.path().join("checkpoints")).unwrap();
        (dir, store)
    }

    #[test]
    fn test_load_missing_is_none() {
        let (_dir, store) = store();
        assert!(store.load("fetch:p1").unwrap().is_none());
    }

    #[test]
    fn test_save_then_load() {
        let (_dir, store) = store();
        let mut record = CheckpointRecord::new("fetch:p1").with_total(Some(9487));
        record.cursor = 1200;
        record.accumulated_count = 1198;
        store.save(&record).unwrap();

        let loaded = store.load("fetch:p1").unwrap().unwrap();
        assert_eq!(loaded.cursor, 1200);
        assert_eq!(loaded.accumulated_count, 1198);
        assert_eq!(loaded.total, Some(9487));
        assert!(!loaded.completed);
    }

    #[test]
    fn test_cursor_cannot_regress() {
        let (_dir, store) = store();
        let mut record = CheckpointRecord::new("fetch:p1");
        record.cursor = 500;
        store.save(&record).unwrap();

        record.cursor = 400;
        assert!(matches!(
            store.save(&record),
            Err(SyncError::InvalidArgument(_))
        ));
        assert_eq!(store.load("fetch:p1").unwrap().unwrap().cursor, 500);
    }

    #[test]
    fn test_garbage_file_is_corrupt() {
        let (_dir, store) = store();
        fs::write(store.path_for("fetch:p1"), "{ not json").unwrap();

        assert!(matches!(
            store.load("fetch:p1"),
            Err(SyncError::CheckpointCorrupt { .. })
        ));
    }

    #[test]
    fn test_mismatched_key_is_corrupt() {
        let (_dir, store) = store();
        store.save(&CheckpointRecord::new("fetch:p2")).unwrap();
        fs::rename(store.path_for("fetch:p2"), store.path_for("fetch:p1")).unwrap();

        assert!(matches!(
            store.load("fetch:p1"),
            Err(SyncError::CheckpointCorrupt { .. })
        ));
    }

    #[test]
    fn test_keys_with_separators_are_distinct_files() {
        let (_dir, store) = store();
        store.save(&CheckpointRecord::new("write:Mix/One:1:2")).unwrap();
        store.save(&CheckpointRecord::new("write:Mix/One:2:2")).unwrap();

        let keys: Vec<String> = store
            .list()
            .unwrap()
            .records
            .into_iter()
            .map(|r| r.stream_key)
            .collect();
        assert_eq!(keys, vec!["write:Mix/One:1:2", "write:Mix/One:2:2"]);
    }

    #[test]
    fn test_clear_and_clear_prefix() {
        let (_dir, store) = store();
        store.save(&CheckpointRecord::new("fetch:p1")).unwrap();
        store.save(&CheckpointRecord::new("fetch:p2")).unwrap();
        store.save(&CheckpointRecord::new("write:M:1:1")).unwrap();

        store.clear("fetch:p1").unwrap();
        store.clear("fetch:p1").unwrap();
        assert!(store.load("fetch:p1").unwrap().is_none());

        assert_eq!(store.clear_prefix("write:").unwrap(), 1);
        assert_eq!(store.list().unwrap().records.len(), 1);
    }

    #[test]
    fn test_corrupt_file_is_listed_and_clearable() {
        let (_dir, store) = store();
        store.save(&CheckpointRecord::new("fetch:ok")).unwrap();
        fs::write(store.path_for("fetch:bad"), "{ not json").unwrap();

        let listing = store.list().unwrap();
        assert_eq!(listing.records.len(), 1);
        assert_eq!(listing.records[0].stream_key, "fetch:ok");
        assert_eq!(listing.corrupt.len(), 1);
        assert_eq!(listing.corrupt[0].stream_key.as_deref(), Some("fetch:bad"));
        assert_eq!(listing.corrupt[0].path, store.path_for("fetch:bad"));

        assert!(store.contains("fetch:bad"));
        store.clear("fetch:bad").unwrap();
        assert!(!store.contains("fetch:bad"));
        assert!(store.list().unwrap().corrupt.is_empty());
    }

    #[test]
    fn test_clear_prefix_removes_corrupt_files() {
        let (_dir, store) = store();
        store.save(&CheckpointRecord::new("fetch:ok")).unwrap();
        fs::write(store.path_for("fetch:bad"), "{ not json").unwrap();
        store.save(&CheckpointRecord::new("write:M:1:1")).unwrap();

        assert_eq!(store.clear_prefix("fetch:").unwrap(), 2);
        let listing = store.list().unwrap();
        assert!(listing.corrupt.is_empty());
        assert_eq!(listing.records.len(), 1);

        assert_eq!(store.clear_prefix("").unwrap(), 1);
        assert!(store.list().unwrap().is_empty());
    }

    #[test]
    fn test_misplaced_record_is_listed_as_corrupt() {
        let (_dir, store) = store();
        store.save(&CheckpointRecord::new("fetch:p2")).unwrap();
        fs::rename(store.path_for("fetch:p2"), store.path_for("fetch:p1")).unwrap();

        let listing = store.list().unwrap();
        assert!(listing.records.is_empty());
        assert_eq!(listing.corrupt[0].stream_key.as_deref(), Some("fetch:p1"));
    }

    #[test]
    fn test_no_temp_files_left_behind() {
        let (_dir, store) = store();
        for cursor in [100, 200, 300] {
            let mut record = CheckpointRecord::new("fetch:p1");
            record.cursor = cursor;
            store.save(&record).unwrap();
        }
        assert_eq!(fs::read_dir(store.dir()).unwrap().count(), 1);
    }
}
