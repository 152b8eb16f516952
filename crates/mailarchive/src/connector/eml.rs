//! EML-in-zip archive import. Each `.eml` entry is one message and its
//! directory inside the zip becomes the folder path.

use std::io::Read;
use std::sync::Arc;

use async_trait::async_trait;
use log::{debug, info, warn};

use crate::factory::FileImportCredentials;
use crate::source::ProviderKind;
use crate::storage::StorageService;
use crate::sync_state::SyncState;

use super::file_source::{self, LocalArchive};
use super::message::{parse_raw_email, RawContext};
use super::{synthetic_user, ConnectorError, EmailConnector, EmailObject, MailboxUser, Result};

/// An opened zip and the index of the next entry to read.
struct ZipCursor {
    archive: zip::ZipArchive<std::fs::File>,
    next_index: usize,
}

/// Reads the next `.eml` entry as `(entry name, bytes)`. An entry that
/// cannot be opened or fails its checksum is a skippable `Parse` error;
/// the cursor has already moved past it.
fn next_eml_entry(cursor: &mut ZipCursor) -> Result<Option<(String, Vec<u8>)>> {
    while cursor.next_index < cursor.archive.len() {
        let index = cursor.next_index;
        cursor.next_index += 1;

        let mut entry = cursor.archive.by_index(index).map_err(|e| {
            warn!("Skipping unreadable zip entry #{}: {}", index, e);
            ConnectorError::Parse(format!("zip entry #{} is unreadable: {}", index, e))
        })?;
        let name = entry.name().to_string();
        if entry.is_dir()
            || name.starts_with("__MACOSX/")
            || !name.to_ascii_lowercase().ends_with(".eml")
        {
            debug!("Skipping zip entry {}", name);
            continue;
        }

        // The declared size comes from the archive header and is not trusted.
        let mut raw = Vec::new();
        if let Err(e) = entry.read_to_end(&mut raw) {
            warn!("Skipping corrupt zip entry {}: {}", name, e);
            return Err(ConnectorError::Parse(format!(
                "zip entry {} is corrupt: {}",
                name, e
            )));
        }
        return Ok(Some((name, raw)));
    }
    Ok(None)
}

/// The entry's directory, or `None` at the zip root.
fn entry_folder(name: &str) -> Option<String> {
    name.rsplit_once('/')
        .map(|(dir, _)| dir.to_string())
        .filter(|dir| !dir.is_empty())
}

pub struct EmlConnector {
    credentials: FileImportCredentials,
    storage: Arc<dyn StorageService>,
    archive: Option<LocalArchive>,
    cursor: Option<ZipCursor>,
    completed: bool,
}

impl EmlConnector {
    pub fn new(credentials: FileImportCredentials, storage: Arc<dyn StorageService>) -> Self {
        Self {
            credentials,
            storage,
            archive: None,
            cursor: None,
            completed: false,
        }
    }

    async fn cursor(&mut self) -> Result<&mut ZipCursor> {
        if self.cursor.is_none() {
            let archive = file_source::materialize(&self.credentials, self.storage.as_ref()).await?;
            let file = std::fs::File::open(archive.path())?;
            let zip = zip::ZipArchive::new(file)?;
            info!(
                "Opened EML archive {} with {} entries",
                archive.path().display(),
                zip.len()
            );
            self.cursor = Some(ZipCursor {
                archive: zip,
                next_index: 0,
            });
            self.archive = Some(archive);
        }
        self.cursor.as_mut().ok_or(ConnectorError::NotStarted)
    }
}

#[async_trait]
impl EmailConnector for EmlConnector {
    fn provider(&self) -> ProviderKind {
        ProviderKind::EmlImport
    }

    async fn test_connection(&mut self) -> Result<bool> {
        file_source::validate(&self.credentials, self.storage.as_ref(), ".zip").await?;
        Ok(true)
    }

    async fn list_all_users(&mut self) -> Result<Vec<MailboxUser>> {
        Ok(vec![synthetic_user(
            &self.credentials.display_name(".zip"),
            "eml.local",
        )])
    }

    async fn start_fetch(&mut self, _user_email: &str, _state: Option<&SyncState>) -> Result<()> {
        self.finish_fetch().await;
        self.completed = false;
        Ok(())
    }

    async fn next_email(&mut self) -> Result<Option<EmailObject>> {
        let cursor = self.cursor().await?;
        let Some((name, raw)) = next_eml_entry(cursor)? else {
            self.completed = true;
            return Ok(None);
        };

        let ctx = RawContext::new(name.clone()).path(entry_folder(&name));
        parse_raw_email(&raw, ctx).map(Some).map_err(|e| {
            warn!("Skipping EML entry {}: {}", name, e);
            e
        })
    }

    async fn finish_fetch(&mut self) {
        self.cursor = None;
        if let Some(archive) = self.archive.take() {
            archive.close();
        }
        if self.completed {
            file_source::remove_upload(&self.credentials, self.storage.as_ref()).await;
            self.completed = false;
        }
    }

    fn updated_sync_state(&self, _user_email: &str) -> SyncState {
        SyncState::Empty
    }
}
