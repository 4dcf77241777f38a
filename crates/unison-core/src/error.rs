use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("not found: {entity} with id {id}")]
    NotFound { entity: &'static str, id: String },

    #[error("invalid data: {0}")]
    InvalidData(String),

    /// An entry that cannot be stored or projected (no track, no id).
    #[error("malformed entry: {0}")]
    MalformedEntry(String),
}

impl Error {
    /// Returns `true` when only a single entry is affected and the run
    /// can carry on without it.
    pub fn is_malformed_entry(&self) -> bool {
        matches!(self, Self::MalformedEntry(_))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
