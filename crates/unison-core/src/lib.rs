//! Core domain model for unison.
//!
//! This crate defines the playlist-entry data model (Entry, RawRecord,
//! ProjectedRecord), the total field-extraction rules that turn a raw
//! API payload into a typed row, and the SQLite-backed hybrid store that
//! keeps raw payloads as an append-only audit log next to a projection
//! rebuilt wholesale from them.

#![deny(unsafe_code)]
#![warn(missing_debug_implementations)]

pub mod error;
pub mod model;
pub mod schema;

pub use error::{Error, Result};
