use resilience_core::ValidationError;
use thiserror::Error;
use uuid::Uuid;

/// Failures of the durable local store.
#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("mood entry not found: {0}")]
    NotFound(Uuid),

    #[error("failed to encode {key}: {source}")]
    Encode {
        key: &'static str,
        #[source]
        source: serde_json::Error,
    },

    #[error("failed to decode {key}: {source}")]
    Decode {
        key: &'static str,
        #[source]
        source: serde_json::Error,
    },

    #[error("storage backend failed for {key}: {source}")]
    Backend {
        key: &'static str,
        #[source]
        source: std::io::Error,
    },
}

/// Failures surfaced by [`crate::ResilienceStore`] mutations and queries.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("mood entry not found: {0}")]
    NotFound(Uuid),

    /// The mutation was aborted; memory and metrics are unchanged.
    #[error("local storage failure: {0}")]
    Storage(#[source] RepositoryError),

    #[error("remote mirror is not configured")]
    MirrorDisabled,

    #[error("remote mirror failed: {0}")]
    Mirror(#[from] MirrorError),
}

impl From<RepositoryError> for StoreError {
    fn from(err: RepositoryError) -> Self {
        match err {
            RepositoryError::NotFound(id) => StoreError::NotFound(id),
            other => StoreError::Storage(other),
        }
    }
}

/// Failures talking to the remote mirror.
#[derive(Debug, Error)]
pub enum MirrorError {
    /// Worth retrying: rate limits, 5xx, timeouts.
    #[error("remote unavailable: {0}")]
    Unavailable(String),

    /// The remote refused the request; retrying will not help.
    #[error("remote rejected request ({status}): {body}")]
    Rejected { status: u16, body: String },

    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("unexpected response: {0}")]
    Decode(String),

    /// Connectivity dropped before the request was sent.
    #[error("offline")]
    Offline,
}

impl MirrorError {
    pub fn is_retryable(&self) -> bool {
        match self {
            MirrorError::Unavailable(_) | MirrorError::Transport(_) => true,
            MirrorError::Rejected { .. } | MirrorError::Decode(_) | MirrorError::Offline => false,
        }
    }
}
