//! Sync pipeline for unison.
//!
//! Fetches playlists page by page through a rate-limited client, lands them
//! in the hybrid store with resumable checkpoints, reconciles duplicates
//! over the projection, and writes the deduplicated library back in capped
//! target collections.

#![deny(unsafe_code)]
#![warn(missing_debug_implementations)]

pub mod api;
pub mod auth;
pub mod checkpoint;
pub mod client;
pub mod config;
pub mod error;
pub mod fetch;
pub mod http;
pub mod reconcile;
pub mod resilience;
pub mod writeback;

pub use api::{ApiRequest, ApiResponse, Page, Transport, TransportError};
pub use auth::{AuthProvider, StaticToken};
pub use checkpoint::{CheckpointListing, CheckpointRecord, CheckpointStore, CorruptCheckpoint};
pub use client::RateLimitedClient;
pub use config::Config;
pub use error::{SyncError, SyncResult};
pub use fetch::{FetchOptions, FetchOutcome, FetchState, Fetcher};
pub use http::HttpTransport;
pub use reconcile::{DryRunSummary, Reconciler, Scope, SummaryOptions};
pub use resilience::{RateLimiter, RetryPolicy};
pub use writeback::{plan_targets, TargetReport, WriteBack, WriteOptions, WriteReport};
