//! Domain repositories.

mod event_sourced;

pub use event_sourced::{Repository, SoftDeleter};

use serde::Deserialize;

use crate::codec::EncodeError;
use crate::storage::{ConcurrencyConflict, StorageError};
use crate::utils::retry::is_retryable;

/// How `Repository::remove` treats a stream.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeleteMode {
    /// Removal is rejected.
    #[default]
    Disabled,
    /// Removal appends the aggregate's deletion event; history is kept.
    Soft,
    /// Removal tombstones the stream without reading it.
    Hard,
}

/// Result type for repository operations.
pub type Result<T> = std::result::Result<T, RepositoryError>;

/// Errors that can occur during repository operations.
#[derive(Debug, thiserror::Error)]
pub enum RepositoryError {
    #[error(transparent)]
    Concurrency(#[from] ConcurrencyConflict),

    #[error("Aggregate not found: {stream}")]
    NotFound { stream: String },

    #[error("Deletion is disabled for '{aggregate_type}'; set delete_mode to 'soft' or 'hard'")]
    DeletionDisabled { aggregate_type: String },

    #[error("Soft delete misconfigured: aggregate '{aggregate_type}' has no deletion method '{method}'")]
    DeletionMisconfigured {
        aggregate_type: String,
        method: String,
    },

    #[error("Storage error: {0}")]
    Storage(StorageError),

    #[error(transparent)]
    Serialization(#[from] EncodeError),
}

impl From<StorageError> for RepositoryError {
    fn from(e: StorageError) -> Self {
        match e {
            StorageError::Concurrency(conflict) => RepositoryError::Concurrency(conflict),
            other => RepositoryError::Storage(other),
        }
    }
}

impl RepositoryError {
    /// Whether repeating the same call could succeed. Conflicts never are:
    /// the caller has to reload and decide again.
    pub fn is_retryable(&self) -> bool {
        matches!(self, RepositoryError::Storage(e) if is_retryable(e))
    }
}
