//! Blob storage for raw messages, attachments and uploaded archives.
//!
//! Keys are relative, `/`-separated paths. Deleting a key that ends in `/`
//! removes everything under that prefix.

use std::pin::Pin;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::error::StorageError;

pub mod local;

pub use local::LocalStorage;

/// A readable blob.
pub type BlobReader = Pin<Box<dyn AsyncRead + Send>>;

#[async_trait]
pub trait StorageService: Send + Sync {
    /// Writes `content` at `path`, replacing any existing blob.
    async fn put(&self, path: &str, content: &[u8]) -> Result<(), StorageError>;

    /// Opens the blob at `path` for streaming reads.
    async fn get(&self, path: &str) -> Result<BlobReader, StorageError>;

    async fn exists(&self, path: &str) -> Result<bool, StorageError>;

    /// Deletes a blob, or a whole prefix when `path` ends with `/`.
    /// Missing paths are not an error.
    async fn delete(&self, path: &str) -> Result<(), StorageError>;

    /// Reads a whole blob into memory.
    async fn get_bytes(&self, path: &str) -> Result<Vec<u8>, StorageError> {
        let mut reader = self.get(path).await?;
        let mut buf = Vec::new();
        reader
            .read_to_end(&mut buf)
            .await
            .map_err(|e| StorageError::ReadFile {
                path: path.into(),
                source: e,
            })?;
        Ok(buf)
    }
}
