use diffcache_core::StoreError;
use thiserror::Error;

/// Failure of one unit of background computation.
#[derive(Error, Debug)]
pub enum ComputeError {
    /// Worth retrying later; never journaled.
    #[error("transient: {0}")]
    Transient(String),

    /// The difference cannot be computed from the given commits.
    #[error("cannot compute difference: {0}")]
    FatalDiff(String),

    #[error("replay failed: {0}")]
    Replay(String),

    /// Stored state does not match what the job expects.
    #[error("inconsistent state: {0}")]
    Invariant(String),

    #[error("git: {0}")]
    Git(#[from] git2::Error),

    #[error("highlighter: {0}")]
    Highlight(#[from] syntect::Error),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl From<rusqlite::Error> for ComputeError {
    fn from(err: rusqlite::Error) -> Self {
        ComputeError::Store(StoreError::Sql(err))
    }
}

impl ComputeError {
    pub fn is_transient(&self) -> bool {
        match self {
            ComputeError::Transient(_) => true,
            ComputeError::Store(err) => err.is_busy(),
            _ => false,
        }
    }
}
