use crate::record::{FieldPatch, Fields};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("record {0} already exists")]
    AlreadyExists(String),

    #[error("record {0} not found")]
    NotFound(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Durable storage for per-instance records, keyed by instance ID.
#[async_trait::async_trait]
pub trait RecordStore: Send + Sync {
    /// Creates a record, failing with [`StoreError::AlreadyExists`] rather than overwriting.
    async fn create(&self, id: &str, fields: Fields) -> Result<(), StoreError>;

    async fn get(&self, id: &str) -> Result<Option<Fields>, StoreError>;

    /// Applies a partial update in a single write. `None` values delete their field; fields not
    /// named by the patch are left untouched.
    async fn update(&self, id: &str, patch: FieldPatch) -> Result<(), StoreError>;

    async fn delete(&self, id: &str) -> Result<(), StoreError>;
}
