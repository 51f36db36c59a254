use crate::services::{classifier::ClassifyError, source::FetchError, storage::StorageError};

/// Classifies a failure as worth retrying or not.
pub trait Transience {
    fn is_transient(&self) -> bool;
}

/// Failure of one attempt of the fetch stage (fetch + store write).
#[derive(Debug, thiserror::Error)]
pub enum StageError {
    #[error("fetch failed: {0}")]
    Fetch(#[from] FetchError),

    #[error("store write failed: {0}")]
    Storage(#[from] StorageError),

    #[error("classification failed: {0}")]
    Classify(#[from] ClassifyError),

    #[error("payload missing from store at {0}")]
    MissingPayload(String),
}

impl Transience for StageError {
    fn is_transient(&self) -> bool {
        match self {
            StageError::Fetch(e) => e.is_transient(),
            StageError::Storage(e) => e.is_transient(),
            StageError::Classify(e) => e.is_transient(),
            StageError::MissingPayload(_) => false,
        }
    }
}
