//! Locating the uploaded archive behind a file-import source.

use std::path::{Path, PathBuf};

use log::{error, info};
use tempfile::NamedTempFile;

use crate::error::StorageError;
use crate::factory::FileImportCredentials;
use crate::storage::StorageService;

use super::{ConnectorError, Result};

/// An archive readable from the local filesystem. Uploaded archives are
/// copied out of storage into a temp file that is removed on drop.
pub(crate) struct LocalArchive {
    path: PathBuf,
    temp: Option<NamedTempFile>,
}

impl LocalArchive {
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Removes the temp copy now instead of waiting for drop.
    pub fn close(self) {
        if let Some(temp) = self.temp {
            if let Err(e) = temp.close() {
                error!("Failed to remove temporary archive copy: {}", e);
            }
        }
    }
}

fn storage_error(err: StorageError) -> ConnectorError {
    match err {
        StorageError::NotFound(path) => ConnectorError::Config(format!(
            "Archive '{}' not found or upload not finished yet",
            path
        )),
        other => ConnectorError::Io(std::io::Error::other(other.to_string())),
    }
}

/// Checks that the archive is declared, has the expected extension and
/// exists.
pub(crate) async fn validate(
    creds: &FileImportCredentials,
    storage: &dyn StorageService,
    extension: &str,
) -> Result<()> {
    let path = creds
        .file_path()
        .ok_or_else(|| ConnectorError::Config("Archive file path not provided".into()))?;
    if !path.to_ascii_lowercase().ends_with(extension) {
        return Err(ConnectorError::Config(format!(
            "Provided file is not a {} archive",
            extension
        )));
    }

    let exists = match &creds.local_file_path {
        Some(local) => tokio::fs::try_exists(local).await?,
        None => storage.exists(path).await.map_err(storage_error)?,
    };
    if !exists {
        return Err(ConnectorError::Config(format!(
            "Archive '{}' not found or upload not finished yet",
            path
        )));
    }
    Ok(())
}

/// Makes the archive available as a local file.
pub(crate) async fn materialize(
    creds: &FileImportCredentials,
    storage: &dyn StorageService,
) -> Result<LocalArchive> {
    if let Some(local) = &creds.local_file_path {
        return Ok(LocalArchive {
            path: PathBuf::from(local),
            temp: None,
        });
    }

    let key = creds
        .file_path()
        .ok_or_else(|| ConnectorError::Config("Archive file path not provided".into()))?;
    let mut reader = storage.get(key).await.map_err(storage_error)?;

    let temp = NamedTempFile::new()?;
    let mut file = tokio::fs::File::create(temp.path()).await?;
    let copied = tokio::io::copy(&mut reader, &mut file).await?;
    file.sync_all().await?;
    info!("Copied uploaded archive '{}' ({} bytes) for import", key, copied);

    Ok(LocalArchive {
        path: temp.path().to_path_buf(),
        temp: Some(temp),
    })
}

/// Deletes the uploaded archive after a complete import. Failures are
/// logged only.
pub(crate) async fn remove_upload(creds: &FileImportCredentials, storage: &dyn StorageService) {
    if let Some(key) = creds.uploaded_key() {
        match storage.delete(key).await {
            Ok(()) => info!("Deleted uploaded archive '{}' after import", key),
            Err(e) => error!("Failed to delete uploaded archive '{}': {}", key, e),
        }
    }
}
