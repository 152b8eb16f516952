//! Outlook PST import.
//!
//! The PST is exported with the external `readpst` tool into a temporary
//! directory of per-folder mbox files, which are then split with the mbox
//! reader. The exported directory structure becomes the folder path.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use log::{debug, info, warn};
use tempfile::TempDir;
use tokio::process::Command;
use walkdir::WalkDir;

use crate::factory::FileImportCredentials;
use crate::source::ProviderKind;
use crate::storage::StorageService;
use crate::sync_state::SyncState;

use super::file_source::{self, LocalArchive};
use super::mbox::MboxReader;
use super::message::{parse_raw_email, RawContext};
use super::{synthetic_user, ConnectorError, EmailConnector, EmailObject, MailboxUser, Result};

/// One exported folder file and its folder path.
struct ExportedFolder {
    file: PathBuf,
    folder: Option<String>,
}

/// Lists the exported mbox files under `root`, sorted for a stable order.
fn exported_folders(root: &Path) -> Result<VecDeque<ExportedFolder>> {
    let mut folders = Vec::new();
    for entry in WalkDir::new(root).sort_by_file_name() {
        let entry = entry.map_err(|e| ConnectorError::Io(std::io::Error::other(e.to_string())))?;
        if !entry.file_type().is_file() {
            continue;
        }
        let folder = entry
            .path()
            .parent()
            .and_then(|dir| dir.strip_prefix(root).ok())
            .map(|rel| rel.to_string_lossy().replace('\\', "/"))
            .filter(|rel| !rel.is_empty());
        folders.push(ExportedFolder {
            file: entry.path().to_path_buf(),
            folder,
        });
    }
    Ok(folders.into())
}

/// Runs `readpst` in recursive mode, writing into `out_dir`.
async fn run_readpst(bin: &str, pst: &Path, out_dir: &Path) -> Result<()> {
    info!("Extracting PST {} with {}", pst.display(), bin);
    let output = Command::new(bin)
        .arg("-r")
        .arg("-q")
        .arg("-o")
        .arg(out_dir)
        .arg(pst)
        .output()
        .await
        .map_err(|e| ConnectorError::Config(format!("Failed to run {}: {}", bin, e)))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(ConnectorError::Protocol(format!(
            "{} exited with {}: {}",
            bin,
            output.status,
            stderr.trim()
        )));
    }
    Ok(())
}

/// State of an extracted PST being read.
struct Extraction {
    // Held so the export is removed when the pass ends.
    _out_dir: TempDir,
    pending: VecDeque<ExportedFolder>,
    current: Option<(MboxReader, Option<String>)>,
}

pub struct PstConnector {
    credentials: FileImportCredentials,
    storage: Arc<dyn StorageService>,
    readpst_bin: String,
    archive: Option<LocalArchive>,
    extraction: Option<Extraction>,
    position: usize,
    completed: bool,
}

impl PstConnector {
    pub fn new(
        credentials: FileImportCredentials,
        storage: Arc<dyn StorageService>,
        readpst_bin: String,
    ) -> Self {
        Self {
            credentials,
            storage,
            readpst_bin,
            archive: None,
            extraction: None,
            position: 0,
            completed: false,
        }
    }

    async fn extraction(&mut self) -> Result<&mut Extraction> {
        if self.extraction.is_none() {
            let archive = file_source::materialize(&self.credentials, self.storage.as_ref()).await?;
            let out_dir = TempDir::new()?;
            run_readpst(&self.readpst_bin, archive.path(), out_dir.path()).await?;
            let pending = exported_folders(out_dir.path())?;
            info!("PST export produced {} folder file(s)", pending.len());

            self.extraction = Some(Extraction {
                _out_dir: out_dir,
                pending,
                current: None,
            });
            self.archive = Some(archive);
        }
        self.extraction.as_mut().ok_or(ConnectorError::NotStarted)
    }

    /// The next raw message across all exported folders.
    async fn next_raw(&mut self) -> Result<Option<(Vec<u8>, Option<String>)>> {
        let extraction = self.extraction().await?;
        loop {
            if let Some((reader, folder)) = extraction.current.as_mut() {
                if let Some(raw) = reader.next_message().await? {
                    return Ok(Some((raw, folder.clone())));
                }
                extraction.current = None;
            }

            let Some(next) = extraction.pending.pop_front() else {
                return Ok(None);
            };
            debug!("Reading exported PST folder {:?}", next.folder);
            let reader = MboxReader::open(&next.file).await?;
            extraction.current = Some((reader, next.folder));
        }
    }
}

#[async_trait]
impl EmailConnector for PstConnector {
    fn provider(&self) -> ProviderKind {
        ProviderKind::PstImport
    }

    async fn test_connection(&mut self) -> Result<bool> {
        file_source::validate(&self.credentials, self.storage.as_ref(), ".pst").await?;
        Ok(true)
    }

    async fn list_all_users(&mut self) -> Result<Vec<MailboxUser>> {
        Ok(vec![synthetic_user(
            &self.credentials.display_name(".pst"),
            "pst.local",
        )])
    }

    async fn start_fetch(&mut self, _user_email: &str, _state: Option<&SyncState>) -> Result<()> {
        self.finish_fetch().await;
        self.position = 0;
        self.completed = false;
        Ok(())
    }

    async fn next_email(&mut self) -> Result<Option<EmailObject>> {
        let Some((raw, folder)) = self.next_raw().await? else {
            self.completed = true;
            return Ok(None);
        };
        self.position += 1;

        let ctx = RawContext::new(format!("pst-{}", self.position)).path(folder);
        parse_raw_email(&raw, ctx).map(Some).map_err(|e| {
            warn!("Skipping message {} of PST archive: {}", self.position, e);
            e
        })
    }

    async fn finish_fetch(&mut self) {
        self.extraction = None;
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
