use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use log::debug;

use crate::error::StorageError;

use super::{BlobReader, StorageService};

/// Stores blobs as files under a root directory.
pub struct LocalStorage {
    root: PathBuf,
}

impl LocalStorage {
    pub fn new<P: AsRef<Path>>(root: P) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Maps a storage key onto the filesystem, refusing anything that could
    /// escape the root.
    fn resolve(&self, key: &str) -> Result<PathBuf, StorageError> {
        let relative = Path::new(key.trim_end_matches('/'));
        if key.trim_matches('/').is_empty() {
            return Err(StorageError::InvalidPath(key.to_string()));
        }
        for component in relative.components() {
            match component {
                Component::Normal(_) => {}
                _ => return Err(StorageError::InvalidPath(key.to_string())),
            }
        }
        Ok(self.root.join(relative))
    }

    async fn ensure_directory(path: &Path) -> Result<(), StorageError> {
        tokio::fs::create_dir_all(path)
            .await
            .map_err(|e| StorageError::CreateDirectory {
                path: path.to_path_buf(),
                source: e,
            })
    }
}

#[async_trait]
impl StorageService for LocalStorage {
    async fn put(&self, path: &str, content: &[u8]) -> Result<(), StorageError> {
        let target = self.resolve(path)?;
        if let Some(parent) = target.parent() {
            Self::ensure_directory(parent).await?;
        }

        // Write beside the target, then rename, so readers never see a
        // partially written blob.
        let staging = target.with_extension(format!("part-{}", uuid::Uuid::new_v4()));
        tokio::fs::write(&staging, content)
            .await
            .map_err(|e| StorageError::WriteFile {
                path: staging.clone(),
                source: e,
            })?;
        if let Err(e) = tokio::fs::rename(&staging, &target).await {
            let _ = tokio::fs::remove_file(&staging).await;
            return Err(StorageError::WriteFile {
                path: target,
                source: e,
            });
        }
        debug!("Stored {} bytes at {}", content.len(), target.display());
        Ok(())
    }

    async fn get(&self, path: &str) -> Result<BlobReader, StorageError> {
        let target = self.resolve(path)?;
        match tokio::fs::File::open(&target).await {
            Ok(file) => Ok(Box::pin(file)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(StorageError::NotFound(path.to_string()))
            }
            Err(e) => Err(StorageError::ReadFile {
                path: target,
                source: e,
            }),
        }
    }

    async fn exists(&self, path: &str) -> Result<bool, StorageError> {
        let target = self.resolve(path)?;
        tokio::fs::try_exists(&target)
            .await
            .map_err(|e| StorageError::ReadFile {
                path: target,
                source: e,
            })
    }

    async fn delete(&self, path: &str) -> Result<(), StorageError> {
        let target = self.resolve(path)?;
        let result = if path.ends_with('/') {
            tokio::fs::remove_dir_all(&target).await
        } else {
            tokio::fs::remove_file(&target).await
        };
        match result {
            Ok(()) => {
                debug!("Deleted {}", target.display());
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StorageError::Delete {
                path: target,
                source: e,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn storage() -> (TempDir, LocalStorage) {
        let dir = TempDir::new().unwrap();
        let storage = LocalStorage::new(dir.path());
        (dir, storage)
    }

    #[tokio::test]
    async fn test_put_get_round_trip() {
        let (_dir, storage) = storage();
        storage.put("archive/a/emails/1.eml", b"hello").await.unwrap();

        assert!(storage.exists("archive/a/emails/1.eml").await.unwrap());
        assert_eq!(storage.get_bytes("archive/a/emails/1.eml").await.unwrap(), b"hello");
    }

    #[tokio::test]
    async fn test_put_overwrites() {
        let (_dir, storage) = storage();
        storage.put("x.bin", b"one").await.unwrap();
        storage.put("x.bin", b"two").await.unwrap();
        assert_eq!(storage.get_bytes("x.bin").await.unwrap(), b"two");
    }

    #[tokio::test]
    async fn test_get_missing_is_not_found() {
        let (_dir, storage) = storage();
        let result = storage.get("nope.eml").await;
        assert!(matches!(result, Err(StorageError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_delete_prefix_removes_tree() {
        let (dir, storage) = storage();
        storage.put("archive/src-1/emails/a.eml", b"a").await.unwrap();
        storage.put("archive/src-1/attachments/b.pdf", b"b").await.unwrap();
        storage.put("archive/src-2/emails/c.eml", b"c").await.unwrap();

        storage.delete("archive/src-1/").await.unwrap();

        assert!(!dir.path().join("archive/src-1").exists());
        assert!(storage.exists("archive/src-2/emails/c.eml").await.unwrap());
        storage.delete("archive/src-1/").await.unwrap();
    }

    #[tokio::test]
    async fn test_delete_single_file() {
        let (_dir, storage) = storage();
        storage.put("uploads/file.mbox", b"x").await.unwrap();
        storage.delete("uploads/file.mbox").await.unwrap();
        assert!(!storage.exists("uploads/file.mbox").await.unwrap());
    }

    #[tokio::test]
    async fn test_rejects_escaping_paths() {
        let (_dir, storage) = storage();
        for bad in ["../etc/passwd", "/abs/path", "a/../../b", "", "/"] {
            assert!(
                matches!(storage.put(bad, b"x").await, Err(StorageError::InvalidPath(_))),
                "{} should be rejected",
                bad
            );
        }
    }
}
