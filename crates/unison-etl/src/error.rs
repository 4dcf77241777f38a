//! Error types for the sync pipeline.

use std::path::PathBuf;

use thiserror::Error;

/// Errors that can occur while fetching, reconciling, or writing back.
#[derive(Debug, Error)]
pub enum SyncError {
    /// Throttling persisted through every allowed attempt.
    #[error("rate limit exceeded after {attempts} attempts")]
    RateLimitExceeded { attempts: u32 },

    /// Server errors or network failures persisted through every attempt.
    #[error("upstream unavailable after {attempts} attempts: {message}")]
    UpstreamUnavailable { attempts: u32, message: String },

    /// The upstream refused the request (4xx other than 429, or auth).
    #[error("request rejected ({status}): {message}")]
    RequestRejected { status: u16, message: String },

    /// A response body did not have the expected shape.
    #[error("parse error: {message}")]
    Parse { message: String },

    /// The upstream kept announcing a next page without moving forward.
    #[error("pagination stalled at cursor {cursor}")]
    StalledPagination { cursor: u64 },

    /// A checkpoint file exists but cannot be trusted.
    #[error("checkpoint corrupt at {}: {message}", .path.display())]
    CheckpointCorrupt { path: PathBuf, message: String },

    /// A caller passed an unusable argument.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// A run stopped part-way; its progress is checkpointed.
    #[error("{stream_key} interrupted: {}, safe to resume: {source}", progress(.stream_key, .saved, .total))]
    Interrupted {
        stream_key: String,
        saved: u64,
        total: Option<u64>,
        #[source]
        source: Box<SyncError>,
    },

    /// An error propagated from the storage layer.
    #[error("store error: {0}")]
    Store(#[from] unison_core::Error),

    /// An error propagated from `reqwest` while building a client.
    #[error("request error: {0}")]
    Request(#[from] reqwest::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

#[allow(clippy::trivially_copy_pass_by_ref)]
fn progress(stream_key: &str, saved: &u64, total: &Option<u64>) -> String {
    let verb = if stream_key.starts_with("write:") {
        "written"
    } else {
        "fetched"
    };
    match total {
        Some(total) => format!("{} of {} {verb}", grouped(*saved), grouped(*total)),
        None => format!("{} {verb}", grouped(*saved)),
    }
}

/// `9487` as `9,487`.
fn grouped(value: u64) -> String {
    let digits = value.to_string();
    let mut out = String::with_capacity(digits.len() + digits.len() / 3);
    for (i, digit) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            out.push(',');
        }
        out.push(digit);
    }
    out
}

impl SyncError {
    /// Returns `true` when re-running the stream later may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::RateLimitExceeded { .. } | Self::UpstreamUnavailable { .. } => true,
            Self::Interrupted { source, .. } => source.is_transient(),
            _ => false,
        }
    }

    /// Returns `true` when the error must not be retried automatically.
    pub fn is_rejected(&self) -> bool {
        match self {
            Self::RequestRejected { .. } => true,
            Self::Interrupted { source, .. } => source.is_rejected(),
            _ => false,
        }
    }

    /// Progress saved before the failure, if this is an interrupted run.
    pub fn saved_progress(&self) -> Option<(u64, Option<u64>)> {
        match self {
            Self::Interrupted { saved, total, .. } => Some((*saved, *total)),
            _ => None,
        }
    }
}

/// Convenience alias for pipeline results.
pub type SyncResult<T> = std::result::Result<T, SyncError>;
