//! Mbox archive import.
//!
//! The archive is read one line at a time and split on `From ` separator
//! lines, so memory use is bounded by the largest single message.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use log::{info, warn};
use tokio::io::{AsyncBufReadExt, BufReader};

use crate::factory::FileImportCredentials;
use crate::source::ProviderKind;
use crate::storage::StorageService;
use crate::sync_state::SyncState;

use super::file_source::{self, LocalArchive};
use super::message::{parse_raw_email, RawContext};
use super::{synthetic_user, EmailConnector, EmailObject, MailboxUser, Result};

/// Splits an mbox file into raw messages. The `From ` envelope line is
/// dropped and `>From ` quoting is undone.
pub(crate) struct MboxReader {
    reader: BufReader<tokio::fs::File>,
    pending_separator: bool,
    done: bool,
}

impl MboxReader {
    pub async fn open(path: &Path) -> Result<Self> {
        let file = tokio::fs::File::open(path).await?;
        Ok(Self {
            reader: BufReader::new(file),
            pending_separator: false,
            done: false,
        })
    }

    /// The next raw message, or `None` at end of file.
    pub async fn next_message(&mut self) -> Result<Option<Vec<u8>>> {
        if self.done {
            return Ok(None);
        }

        let mut message = Vec::new();
        let mut in_message = std::mem::take(&mut self.pending_separator);
        loop {
            let mut line = Vec::new();
            if self.reader.read_until(b'\n', &mut line).await? == 0 {
                self.done = true;
                return Ok(if in_message && !is_blank(&message) {
                    Some(message)
                } else {
                    None
                });
            }

            if line.starts_with(b"From ") {
                if in_message && !is_blank(&message) {
                    self.pending_separator = true;
                    return Ok(Some(message));
                }
                in_message = true;
                continue;
            }

            if !in_message {
                // Preamble before the first separator.
                continue;
            }
            message.extend_from_slice(unquote_from(&line));
        }
    }
}

/// Strips one level of mboxrd quoting from `>From `, `>>From `, ...
fn unquote_from(line: &[u8]) -> &[u8] {
    let quotes = line.iter().take_while(|b| **b == b'>').count();
    if quotes > 0 && line[quotes..].starts_with(b"From ") {
        &line[1..]
    } else {
        line
    }
}

fn is_blank(bytes: &[u8]) -> bool {
    bytes.iter().all(u8::is_ascii_whitespace)
}

/// Folder for an mbox message: the first Gmail label, else `X-Folder`.
pub(crate) fn folder_from_headers(email: &EmailObject) -> Option<String> {
    let first = |name: &str| {
        email
            .headers
            .get(name)
            .and_then(|values| values.first())
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    };
    first("x-gmail-labels")
        .and_then(|labels| labels.split(',').next().map(|l| l.trim().to_string()))
        .filter(|l| !l.is_empty())
        .or_else(|| first("x-folder"))
}

pub struct MboxConnector {
    credentials: FileImportCredentials,
    storage: Arc<dyn StorageService>,
    archive: Option<LocalArchive>,
    reader: Option<MboxReader>,
    position: usize,
    completed: bool,
}

impl MboxConnector {
    pub fn new(credentials: FileImportCredentials, storage: Arc<dyn StorageService>) -> Self {
        Self {
            credentials,
            storage,
            archive: None,
            reader: None,
            position: 0,
            completed: false,
        }
    }

    async fn reader(&mut self) -> Result<&mut MboxReader> {
        if self.reader.is_none() {
            let archive = file_source::materialize(&self.credentials, self.storage.as_ref()).await?;
            info!("Reading mbox archive {}", archive.path().display());
            self.reader = Some(MboxReader::open(archive.path()).await?);
            self.archive = Some(archive);
        }
        self.reader.as_mut().ok_or(super::ConnectorError::NotStarted)
    }
}

#[async_trait]
impl EmailConnector for MboxConnector {
    fn provider(&self) -> ProviderKind {
        ProviderKind::MboxImport
    }

    async fn test_connection(&mut self) -> Result<bool> {
        file_source::validate(&self.credentials, self.storage.as_ref(), ".mbox").await?;
        Ok(true)
    }

    async fn list_all_users(&mut self) -> Result<Vec<MailboxUser>> {
        let user = synthetic_user(&self.credentials.display_name(".mbox"), "mbox.local");
        info!("Found mbox mailbox: {}", user.display_name);
        Ok(vec![user])
    }

    async fn start_fetch(&mut self, _user_email: &str, _state: Option<&SyncState>) -> Result<()> {
        self.finish_fetch().await;
        self.position = 0;
        self.completed = false;
        Ok(())
    }

    async fn next_email(&mut self) -> Result<Option<EmailObject>> {
        let Some(raw) = self.reader().await?.next_message().await? else {
            self.completed = true;
            return Ok(None);
        };
        self.position += 1;

        match parse_raw_email(&raw, RawContext::new(format!("mbox-{}", self.position))) {
            Ok(mut email) => {
                email.path = folder_from_headers(&email);
                Ok(Some(email))
            }
            Err(e) => {
                warn!("Skipping message {} of mbox archive: {}", self.position, e);
                Err(e)
            }
        }
    }

    async fn finish_fetch(&mut self) {
        self.reader = None;
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
