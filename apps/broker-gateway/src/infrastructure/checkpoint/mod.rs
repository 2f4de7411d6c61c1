//! File-backed checkpoint store.
//!
//! The blob is written to `<path>.tmp` and renamed over `<path>`, so a
//! reader sees either the previous checkpoint or the new one, never a torn
//! write.

use std::io;
use std::path::{Path, PathBuf};

use async_trait::async_trait;

use crate::application::ports::{CheckpointStore, CheckpointStoreError};

/// Stores the checkpoint in a single file.
#[derive(Debug, Clone)]
pub struct FileCheckpointStore {
    path: PathBuf,
}

impl FileCheckpointStore {
    /// Store at `path`. Parent directories are created on first save.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// The checkpoint file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn tmp_path(&self) -> PathBuf {
        let mut name = self.path.file_name().unwrap_or_default().to_os_string();
        name.push(".tmp");
        self.path.with_file_name(name)
    }
}

fn read_failed(err: &io::Error) -> CheckpointStoreError {
    CheckpointStoreError::ReadFailed {
        message: err.to_string(),
    }
}

fn write_failed(err: &io::Error) -> CheckpointStoreError {
    CheckpointStoreError::WriteFailed {
        message: err.to_string(),
    }
}

#[async_trait]
impl CheckpointStore for FileCheckpointStore {
    async fn load(&self) -> Result<Option<Vec<u8>>, CheckpointStoreError> {
        match tokio::fs::read(&self.path).await {
            Ok(blob) => Ok(Some(blob)),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(read_failed(&err)),
        }
    }

    async fn save(&self, blob: &[u8]) -> Result<(), CheckpointStoreError> {
        let parent = self.path.parent().filter(|p| !p.as_os_str().is_empty());
        if let Some(parent) = parent {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| write_failed(&e))?;
        }

        let tmp = self.tmp_path();
        tokio::fs::write(&tmp, blob)
            .await
            .map_err(|e| write_failed(&e))?;
        tokio::fs::rename(&tmp, &self.path)
            .await
            .map_err(|e| write_failed(&e))?;

        tracing::debug!(path = %self.path.display(), bytes = blob.len(), "Checkpoint written");
        Ok(())
    }

    async fn clear(&self) -> Result<(), CheckpointStoreError> {
        match tokio::fs::remove_file(&self.path).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(write_failed(&err)),
        }
    }
}
