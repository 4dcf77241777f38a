//! SQLite persistence: the raw audit log and its rebuilt projection.

pub mod db;
pub mod migrations;

pub use db::{Database, IngestSummary, ProjectionFilter, RebuildSummary};
