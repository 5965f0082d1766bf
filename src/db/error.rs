//! Package store error types.

use thiserror::Error;

use super::client::ClientError;

/// Errors returned by [`PackageRepository`](super::PackageRepository).
#[derive(Error, Debug)]
pub enum RepositoryError {
    /// A collection or document read failed.
    #[error("Failed to {op} (collection '{collection}'): {source}")]
    Read {
        op: &'static str,
        collection: &'static str,
        source: ClientError,
    },

    /// An add, overwrite or delete failed, or the lookup preceding it did.
    #[error("Failed to {op} (collection '{collection}'): {source}")]
    Write {
        op: &'static str,
        collection: &'static str,
        source: ClientError,
    },

    /// No document's key derives to the requested id.
    #[error("Package not found: {id}")]
    NotFound { collection: &'static str, id: i32 },

    /// Several document keys derive to the same id.
    #[error("Package id {id} is ambiguous, it matches documents {}", .keys.join(", "))]
    AmbiguousId { id: i32, keys: Vec<String> },

    #[error("Failed to encode package: {0}")]
    Encode(#[from] serde_json::Error),
}

impl RepositoryError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, RepositoryError::NotFound { .. })
    }
}
