use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(String),

    #[error("store operation cancelled: {0}")]
    Cancelled(String),

    /// Failure injected by the in-memory store.
    #[error("injected failure: {0}")]
    Injected(String),
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;
