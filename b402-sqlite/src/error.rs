use b402::StoreError;
use b402::amount::AmountError;

/// Errors raised inside the SQLite backend.
#[derive(Debug, thiserror::Error)]
pub enum SqliteError {
    /// SQLite refused a statement.
    #[error("sqlite error: {0}")]
    Database(#[from] rusqlite::Error),
    /// A JSON column could not be encoded.
    #[error("failed to encode JSON column: {0}")]
    Json(#[from] serde_json::Error),
    /// A domain-level store error raised while a connection was held.
    #[error(transparent)]
    Store(#[from] StoreError),
    /// Another thread panicked while holding the connection.
    #[error("connection mutex poisoned")]
    Poisoned,
    /// The blocking task running the statement did not complete.
    #[error("spawn_blocking failed: {0}")]
    Join(String),
}

impl From<AmountError> for SqliteError {
    fn from(value: AmountError) -> Self {
        Self::Store(StoreError::Amount(value))
    }
}

impl From<SqliteError> for StoreError {
    fn from(value: SqliteError) -> Self {
        match value {
            SqliteError::Store(err) => err,
            SqliteError::Json(err) => Self::Serialization(err),
            other => Self::backend(other),
        }
    }
}
