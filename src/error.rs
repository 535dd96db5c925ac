//! Error taxonomy for cache operations.

use crate::provider::ProviderError;

/// Errors surfaced by [`crate::cache::MetadataCache`].
///
/// Every error is local to the operation that produced it; none of them are
/// fatal to the host process.
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    /// No local record exists for the id.
    #[error("video {0} is not cached")]
    NotCached(String),

    /// The provider has no video with this id.
    #[error("video {0} not found upstream")]
    NotFoundUpstream(String),

    #[error("metadata provider failed: {0}")]
    Provider(#[from] ProviderError),

    /// Missing identifier or bad pagination arguments.
    #[error("invalid request: {0}")]
    Validation(String),

    #[error(transparent)]
    Store(#[from] anyhow::Error),
}

impl CacheError {
    /// Both flavours of "not found", regardless of where the lookup failed.
    pub fn is_not_found(&self) -> bool {
        matches!(self, CacheError::NotCached(_) | CacheError::NotFoundUpstream(_))
    }
}
