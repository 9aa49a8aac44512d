use thiserror::Error;

/// Errors raised by the persistence layer.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("sqlite: {0}")]
    Sql(#[from] rusqlite::Error),

    #[error("sqlite connection: {0}")]
    Connection(#[from] tokio_rusqlite::Error),

    #[error("payload encoding: {0}")]
    Encoding(#[from] serde_json::Error),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),
}

impl StoreError {
    /// True when SQLite refused the statement because another connection
    /// holds the database lock.
    pub fn is_busy(&self) -> bool {
        match self {
            StoreError::Sql(err) => matches!(
                err.sqlite_error_code(),
                Some(rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked)
            ),
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, StoreError>;
