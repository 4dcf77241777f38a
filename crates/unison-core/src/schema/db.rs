use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension};
use serde_json::Value;
use std::path::Path;

use crate::error::{Error, Result};
use crate::model::{CollectionId, Entry, ProjectedRecord, RawRecord};

use super::migrations::{CREATE_TRACKS_NEXT, MIGRATIONS, TRACKS_INDEXES};

/// Result of ingesting one batch of entries.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IngestSummary {
    /// Entries appended to the raw log.
    pub stored: u64,
    /// Entries dropped because they have no track or no track id.
    pub skipped: u64,
}

/// Result of a projection rebuild.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RebuildSummary {
    /// Rows written to the new projection.
    pub projected: u64,
    /// Raw rows whose payload could not be projected.
    pub skipped: u64,
    /// Raw rows left out because a newer fetch covers the same slot.
    pub superseded: u64,
}

/// Row filter for [`Database::query_projection`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProjectionFilter {
    pub collection_source: Option<CollectionId>,
}

impl ProjectionFilter {
    #[must_use]
    pub fn all() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn collection(collection_source: CollectionId) -> Self {
        Self {
            collection_source: Some(collection_source),
        }
    }
}

/// Raw rows that make up the current projection: the live generation of
/// each collection, newest row per upstream position.
const CURRENT_RAW_SQL: &str = "
    SELECT r.id, r.collection_source, r.generation, r.position, r.record_id,
           r.payload, r.fetched_at
    FROM raw_entries r
    JOIN collections c
      ON c.collection_source = r.collection_source
     AND c.generation = r.generation
    WHERE r.position IS NULL
       OR r.id = (
            SELECT MAX(r2.id) FROM raw_entries r2
            WHERE r2.collection_source = r.collection_source
              AND r2.generation = r.generation
              AND r2.position = r.position
       )
    ORDER BY r.collection_source, r.position, r.id";

const PROJECTION_COLUMNS: &str = "record_id, name, primary_artist, primary_artist_id, album, \
     album_id, release_date, duration_ms, popularity, explicit, isrc, added_at, \
     collection_source, position, raw_id";

/// The hybrid store: an append-only raw log plus a typed projection.
#[derive(Debug)]
pub struct Database {
    conn: Connection,
}

impl Database {
    /// Open (or create) a database at the given path and apply migrations.
    ///
    /// File databases run in WAL mode so readers keep seeing a complete
    /// projection while a rebuild is in flight.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path)?;
        let _mode: String = conn.query_row("PRAGMA journal_mode = WAL", [], |row| row.get(0))?;
        let db = Self { conn };
        db.apply_migrations()?;
        Ok(db)
    }

    /// Open an in-memory database (for tests).
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let db = Self { conn };
        db.apply_migrations()?;
        Ok(db)
    }

    /// Get a reference to the underlying connection (for advanced queries).
    #[must_use]
    pub const fn conn(&self) -> &Connection {
        &self.conn
    }

    fn apply_migrations(&self) -> Result<()> {
        self.conn.execute(
            "CREATE TABLE IF NOT EXISTS schema_migrations (
                version INTEGER PRIMARY KEY,
                name TEXT NOT NULL,
                applied_at TEXT NOT NULL DEFAULT (datetime('now'))
            )",
            [],
        )?;

        let mut stmt = self
            .conn
            .prepare("SELECT version FROM schema_migrations ORDER BY version")?;
        let applied: Vec<u32> = stmt
            .query_map([], |row| row.get(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        for migration in MIGRATIONS {
            if !applied.contains(&migration.version) {
                log::info!(
                    "Applying migration {} ({})",
                    migration.version,
                    migration.name
                );
                self.conn.execute_batch(migration.sql)?;
                self.conn.execute(
                    "INSERT INTO schema_migrations (version, name) VALUES (?1, ?2)",
                    rusqlite::params![migration.version, migration.name],
                )?;
            }
        }

        Ok(())
    }
}

// Collections and generations
impl Database {
    /// Start a new fetch generation for a collection and return it.
    ///
    /// Rows of older generations stay in the raw log but drop out of the
    /// projection on the next rebuild.
    pub fn begin_generation(&self, collection: &CollectionId) -> Result<i64> {
        self.conn.execute(
            "INSERT INTO collections (collection_source, generation, updated_at)
             VALUES (?1, 1, ?2)
             ON CONFLICT(collection_source) DO UPDATE
             SET generation = generation + 1, updated_at = excluded.updated_at",
            rusqlite::params![collection, Utc::now().to_rfc3339()],
        )?;

        self.current_generation(collection)?
            .ok_or_else(|| Error::NotFound {
                entity: "collection",
                id: collection.to_string(),
            })
    }

    /// The live generation of a collection, if it was ever ingested.
    pub fn current_generation(&self, collection: &CollectionId) -> Result<Option<i64>> {
        let generation = self
            .conn
            .query_row(
                "SELECT generation FROM collections WHERE collection_source = ?1",
                [collection],
                |row| row.get(0),
            )
            .optional()?;
        Ok(generation)
    }

    /// All collections known to the store, sorted by id.
    pub fn collections(&self) -> Result<Vec<CollectionId>> {
        let mut stmt = self
            .conn
            .prepare("SELECT collection_source FROM collections ORDER BY collection_source")?;
        let collections = stmt
            .query_map([], |row| row.get(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(collections)
    }
}

// Raw ingestion
impl Database {
    /// Append a batch of API entries to the raw log.
    ///
    /// Entries are tagged with the collection's live generation (created on
    /// first use) and, when `first_position` is given, with consecutive
    /// upstream positions. Entries without a track or track id are skipped
    /// and counted. The whole batch commits or none of it does.
    pub fn ingest(
        &self,
        collection: &CollectionId,
        first_position: Option<u64>,
        items: &[Value],
    ) -> Result<IngestSummary> {
        let tx = self.conn.unchecked_transaction()?;

        let generation = match self.current_generation(collection)? {
            Some(generation) => generation,
            None => self.begin_generation(collection)?,
        };
        let fetched_at = Utc::now().to_rfc3339();
        let mut summary = IngestSummary::default();

        {
            let mut insert = tx.prepare(
                "INSERT INTO raw_entries
                    (collection_source, generation, position, record_id, payload, fetched_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            )?;

            for (offset, item) in items.iter().enumerate() {
                let position = first_position
                    .map(|first| to_sql_int(first + offset as u64))
                    .transpose()?;

                match Entry::from_payload(collection, item.clone()) {
                    Ok(entry) => {
                        insert.execute(rusqlite::params![
                            collection,
                            generation,
                            position,
                            entry.record_id,
                            serde_json::to_string(&entry.payload)?,
                            fetched_at,
                        ])?;
                        summary.stored += 1;
                    }
                    Err(e) if e.is_malformed_entry() => {
                        log::debug!("Skipping entry in {} at {:?}: {}", collection, position, e);
                        summary.skipped += 1;
                    }
                    Err(e) => return Err(e),
                }
            }
        }

        tx.commit()?;
        Ok(summary)
    }

    /// All raw rows of a collection (every generation), oldest first.
    #[cfg(test)]
    pub fn raw_records(&self, collection: &CollectionId) -> Result<Vec<RawRecord>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, collection_source, generation, position, record_id, payload, fetched_at
             FROM raw_entries
             WHERE collection_source = ?1
             ORDER BY id",
        )?;
        let mut rows = stmt.query([collection])?;

        let mut records = Vec::new();
        while let Some(row) = rows.next()? {
            records.push(row_to_raw(row)?);
        }
        Ok(records)
    }

    /// Number of raw rows, optionally restricted to one collection.
    pub fn raw_entry_count(&self, collection: Option<&CollectionId>) -> Result<u64> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM raw_entries WHERE ?1 IS NULL OR collection_source = ?1",
            [collection],
            |row| row.get(0),
        )?;
        Ok(u64::try_from(count).unwrap_or(0))
    }
}

// Projection
impl Database {
    /// Recompute the projection from the raw log and swap it in.
    ///
    /// The new rows are built in `tracks_next`; the old table is dropped
    /// and the new one renamed inside the same transaction, so a reader
    /// never observes a half-built projection.
    pub fn rebuild_projection(&self) -> Result<RebuildSummary> {
        let tx = self.conn.unchecked_transaction()?;
        tx.execute_batch("DROP TABLE IF EXISTS tracks_next;")?;
        tx.execute_batch(CREATE_TRACKS_NEXT)?;

        let total_raw: i64 = tx.query_row("SELECT COUNT(*) FROM raw_entries", [], |row| {
            row.get(0)
        })?;

        let mut summary = RebuildSummary::default();
        let mut considered: u64 = 0;
        {
            let mut select = tx.prepare(CURRENT_RAW_SQL)?;
            let mut insert = tx.prepare(&format!(
                "INSERT INTO tracks_next ({PROJECTION_COLUMNS})
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)"
            ))?;

            let mut rows = select.query([])?;
            while let Some(row) = rows.next()? {
                considered += 1;
                let raw = row_to_raw(row)?;
                match ProjectedRecord::extract(&raw) {
                    Ok(record) => {
                        insert.execute(rusqlite::params![
                            record.record_id,
                            record.name,
                            record.primary_artist,
                            record.primary_artist_id,
                            record.album,
                            record.album_id,
                            record.release_date,
                            record.duration_ms,
                            record.popularity,
                            record.explicit,
                            record.isrc,
                            record.added_at,
                            record.collection_source,
                            record.position.map(to_sql_int).transpose()?,
                            raw.id,
                        ])?;
                        summary.projected += 1;
                    }
                    Err(e) if e.is_malformed_entry() => {
                        log::warn!("Raw entry {} cannot be projected: {}", raw.id, e);
                        summary.skipped += 1;
                    }
                    Err(e) => return Err(e),
                }
            }
        }
        summary.superseded = u64::try_from(total_raw)
            .unwrap_or(0)
            .saturating_sub(considered);

        tx.execute_batch("DROP TABLE tracks; ALTER TABLE tracks_next RENAME TO tracks;")?;
        tx.execute_batch(TRACKS_INDEXES)?;
        tx.commit()?;

        log::info!(
            "Projection rebuilt: {} rows ({} skipped, {} superseded)",
            summary.projected,
            summary.skipped,
            summary.superseded
        );
        Ok(summary)
    }

    /// Read projection rows, ordered by collection then upstream position.
    pub fn query_projection(&self, filter: &ProjectionFilter) -> Result<Vec<ProjectedRecord>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {PROJECTION_COLUMNS}
             FROM tracks
             WHERE ?1 IS NULL OR collection_source = ?1
             ORDER BY collection_source, position, raw_id"
        ))?;

        let records = stmt
            .query_map([&filter.collection_source], row_to_projected)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(records)
    }

    /// Number of rows in the current projection.
    pub fn projected_count(&self) -> Result<u64> {
        let count: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM tracks", [], |row| row.get(0))?;
        Ok(u64::try_from(count).unwrap_or(0))
    }
}

fn to_sql_int(value: u64) -> Result<i64> {
    i64::try_from(value).map_err(|_| Error::InvalidData(format!("position {value} out of range")))
}

fn row_to_raw(row: &rusqlite::Row) -> Result<RawRecord> {
    let position: Option<i64> = row.get(3)?;
    let payload: String = row.get(5)?;
    let fetched_at: String = row.get(6)?;

    Ok(RawRecord {
        id: row.get(0)?,
        collection_source: row.get(1)?,
        generation: row.get(2)?,
        position: position.and_then(|p| u64::try_from(p).ok()),
        record_id: row.get(4)?,
        payload: serde_json::from_str(&payload)?,
        fetched_at: DateTime::parse_from_rfc3339(&fetched_at)
            .map_err(|e| Error::InvalidData(format!("bad fetched_at {fetched_at:?}: {e}")))?
            .with_timezone(&Utc),
    })
}

fn row_to_projected(row: &rusqlite::Row) -> rusqlite::Result<ProjectedRecord> {
    let position: Option<i64> = row.get(13)?;

    Ok(ProjectedRecord {
        record_id: row.get(0)?,
        name: row.get(1)?,
        primary_artist: row.get(2)?,
        primary_artist_id: row.get(3)?,
        album: row.get(4)?,
        album_id: row.get(5)?,
        release_date: row.get(6)?,
        duration_ms: row.get(7)?,
        popularity: row.get(8)?,
        explicit: row.get(9)?,
        isrc: row.get(10)?,
        added_at: row.get(11)?,
        collection_source: row.get(12)?,
        position: position.and_then(|p| u64::try_from(p).ok()),
    })
}
