use thiserror::Error;

/// Errors produced by the store layer.
#[derive(Error, Debug)]
pub enum StoreError {
    /// SQLite error.
    #[error("Database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// Referenced channel/message/notification does not exist (or has been
    /// removed). Distinct from [`StoreError::Forbidden`]: existence of a
    /// record the caller cannot see is never leaked through this variant.
    #[error("Record not found")]
    NotFound,

    /// Caller is authenticated but lacks the required relationship
    /// (not a channel member, not the record's owner).
    #[error("Forbidden: {0}")]
    Forbidden(String),

    /// A channel create/lookup was given an unusable participant set.
    #[error("Invalid participants: {0}")]
    InvalidParticipants(String),

    /// A message had no content and no attachments.
    #[error("Invalid message: {0}")]
    InvalidMessage(String),

    /// A broadcast addressed no role at all.
    #[error("Invalid audience: {0}")]
    InvalidAudience(String),

    /// Failed to determine a platform data directory.
    #[error("Could not determine application data directory")]
    NoDataDir,

    /// Generic I/O error (e.g. creating the database directory).
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Migration failure.
    #[error("Migration error: {0}")]
    Migration(String),

    /// UUID parsing error.
    #[error("UUID error: {0}")]
    Uuid(#[from] uuid::Error),

    /// Attachment list (de)serialization error.
    #[error("Attachment encoding error: {0}")]
    Json(#[from] serde_json::Error),

    /// Chrono parsing error.
    #[error("Timestamp parse error: {0}")]
    ChronoParse(#[from] chrono::ParseError),
}

impl StoreError {
    pub(crate) fn forbidden(reason: &str) -> Self {
        StoreError::Forbidden(reason.to_string())
    }
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, StoreError>;
