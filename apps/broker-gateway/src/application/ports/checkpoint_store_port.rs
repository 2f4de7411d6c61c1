//! Checkpoint Store Port (Driven Port)
//!
//! Opaque blob storage. Validation of the contents happens in the core.

use async_trait::async_trait;

/// Checkpoint storage error.
#[derive(Debug, Clone, thiserror::Error)]
pub enum CheckpointStoreError {
    /// Reading failed.
    #[error("checkpoint read failed: {message}")]
    ReadFailed {
        /// Error details.
        message: String,
    },

    /// Writing failed.
    #[error("checkpoint write failed: {message}")]
    WriteFailed {
        /// Error details.
        message: String,
    },
}

/// Port for durable checkpoint storage.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Load the stored blob, if any.
    async fn load(&self) -> Result<Option<Vec<u8>>, CheckpointStoreError>;

    /// Replace the stored blob atomically.
    async fn save(&self, blob: &[u8]) -> Result<(), CheckpointStoreError>;

    /// Remove the stored blob.
    async fn clear(&self) -> Result<(), CheckpointStoreError>;
}
