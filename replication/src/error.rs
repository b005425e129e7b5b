use pocketbase::PocketBaseError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("pocketbase: {0}")]
    PocketBase(#[from] PocketBaseError),
    #[error("malformed {collection} row: {reason}")]
    Decode {
        collection: &'static str,
        reason: String,
    },
}

#[derive(Debug, Error)]
pub enum ReplicationError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("invalid input: {0}")]
    Validation(String),
}

impl From<PocketBaseError> for ReplicationError {
    fn from(err: PocketBaseError) -> Self {
        Self::Store(StoreError::PocketBase(err))
    }
}
