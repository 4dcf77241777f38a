/// A schema migration.
#[derive(Debug)]
pub struct Migration {
    pub version: u32,
    pub name: &'static str,
    pub sql: &'static str,
}

/// Column list of the projection table, shared by the migration and by
/// the table swap in `rebuild_projection`.
macro_rules! tracks_columns {
    () => {
        "record_id TEXT NOT NULL,
    name TEXT,
    primary_artist TEXT,
    primary_artist_id TEXT,
    album TEXT,
    album_id TEXT,
    release_date TEXT,
    duration_ms INTEGER,
    popularity INTEGER,
    explicit INTEGER NOT NULL DEFAULT 0,
    isrc TEXT,
    added_at TEXT,
    collection_source TEXT NOT NULL,
    position INTEGER,
    raw_id INTEGER NOT NULL"
    };
}

/// DDL for the staging table filled by a projection rebuild.
pub(crate) const CREATE_TRACKS_NEXT: &str =
    concat!("CREATE TABLE tracks_next (\n    ", tracks_columns!(), "\n);");

/// Indexes on the live projection table (dropped with it on swap).
pub(crate) const TRACKS_INDEXES: &str = r#"
CREATE INDEX IF NOT EXISTS idx_tracks_record_id ON tracks(record_id);
CREATE INDEX IF NOT EXISTS idx_tracks_collection ON tracks(collection_source);
"#;

const MIGRATION_001: &str = concat!(
    r#"
-- Schema version tracking
CREATE TABLE IF NOT EXISTS schema_migrations (
    version INTEGER PRIMARY KEY,
    name TEXT NOT NULL,
    applied_at TEXT NOT NULL DEFAULT (datetime('now'))
);

-- One row per source collection; generation bumps on every fresh fetch
CREATE TABLE IF NOT EXISTS collections (
    collection_source TEXT PRIMARY KEY,
    generation INTEGER NOT NULL,
    updated_at TEXT NOT NULL
);

-- Raw entries (append-only audit log of every payload ever ingested)
CREATE TABLE IF NOT EXISTS raw_entries (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    collection_source TEXT NOT NULL,
    generation INTEGER NOT NULL,
    position INTEGER,
    record_id TEXT NOT NULL,
    payload TEXT NOT NULL,
    fetched_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_raw_entries_stream
    ON raw_entries(collection_source, generation, position);

-- Projection (typed view, rebuilt wholesale from raw_entries)
CREATE TABLE IF NOT EXISTS tracks (
    "#,
    tracks_columns!(),
    r#"
);

CREATE INDEX IF NOT EXISTS idx_tracks_record_id ON tracks(record_id);
CREATE INDEX IF NOT EXISTS idx_tracks_collection ON tracks(collection_source);
"#
);

pub const MIGRATIONS: &[Migration] = &[Migration {
    version: 1,
    name: "initial_schema",
    sql: MIGRATION_001,
}];
