//! Archives fetched emails: raw message blobs, archived-email rows and
//! content-addressed attachments, then queues the new rows for indexing.

use std::sync::Arc;

use futures_util::StreamExt;
use log::{debug, info, warn};
use tracing::{info_span, Instrument};

use crate::connector::message::{sanitize_filename, sha256_hex};
use crate::connector::{email_stream, EmailAttachment, EmailConnector, EmailObject};
use crate::db::attachment_repo::{self, Attachment};
use crate::db::email_repo::{self, ArchivedEmail, Recipients};
use crate::db::source_repo::IngestionSource;
use crate::db::{now_rfc3339, Database};
use crate::error::ProcessError;
use crate::factory::ProviderCredentials;
use crate::queue::{IndexBatchJob, JobName, JobQueue, NewJob};
use crate::storage::StorageService;
use crate::sync_state::SyncState;

/// Default number of email ids per `index-email-batch` job.
pub const DEFAULT_INDEX_BATCH_SIZE: usize = 50;

/// The result of one mailbox pass.
pub struct MailboxOutcome {
    /// Cursor to merge into the source.
    pub sync_state: SyncState,
    /// Newly archived emails.
    pub processed: usize,
    /// Duplicates and items the connector could not produce.
    pub skipped: usize,
    /// Emails that were fetched but could not be archived.
    pub failed: usize,
    pub status_message: Option<String>,
    pub updated_credentials: Option<ProviderCredentials>,
}

#[derive(Default)]
struct PassCounters {
    processed: usize,
    skipped: usize,
    failed: usize,
}

/// Maps a provider folder path onto storage key segments.
fn storage_folder(path: Option<&str>) -> String {
    let Some(path) = path else {
        return String::new();
    };
    path.split('/')
        .map(str::trim)
        .filter(|s| !s.is_empty() && *s != "." && *s != "..")
        .map(|s| format!("{}/", sanitize_filename(s)))
        .collect()
}

pub struct MailboxProcessor {
    db: Database,
    storage: Arc<dyn StorageService>,
    queue: Arc<dyn JobQueue>,
    root_folder: String,
    index_batch_size: usize,
}

impl MailboxProcessor {
    pub fn new(
        db: Database,
        storage: Arc<dyn StorageService>,
        queue: Arc<dyn JobQueue>,
        root_folder: impl Into<String>,
    ) -> Self {
        Self {
            db,
            storage,
            queue,
            root_folder: root_folder.into(),
            index_batch_size: DEFAULT_INDEX_BATCH_SIZE,
        }
    }

    pub fn with_index_batch_size(mut self, size: usize) -> Self {
        self.index_batch_size = size.max(1);
        self
    }

    /// Archives one email. Returns the new row id, or `None` when this
    /// source already holds the same message.
    pub async fn process_email(
        &self,
        email: &EmailObject,
        source: &IngestionSource,
        user_email: &str,
    ) -> Result<Option<String>, ProcessError> {
        if let Some(existing) = email_repo::find_id_by_identity(&self.db, &source.id, &email.message_id)? {
            debug!(
                "Skipping duplicate email {} (already archived as {})",
                email.message_id, existing
            );
            return Ok(None);
        }

        let prefix = source.storage_prefix(&self.root_folder);

        // Attachments first: a failure here leaves no email row that would
        // make a retry look like a duplicate.
        let mut attachment_ids = Vec::with_capacity(email.attachments.len());
        for attachment in &email.attachments {
            let stored = self.store_attachment(attachment, source, &prefix).await?;
            if !attachment_ids.contains(&stored.id) {
                attachment_ids.push(stored.id);
            }
        }

        let id = uuid::Uuid::new_v4().to_string();
        let storage_path = format!(
            "{}emails/{}{}.eml",
            prefix,
            storage_folder(email.path.as_deref()),
            id
        );
        self.storage.put(&storage_path, &email.eml).await?;

        let sender = email.from.first();
        let row = ArchivedEmail {
            id: id.clone(),
            ingestion_source_id: source.id.clone(),
            user_email: user_email.to_string(),
            message_id_header: email.message_id.clone(),
            thread_id: email.thread_id.clone(),
            sent_at: email.received_at.to_rfc3339(),
            subject: (!email.subject.is_empty()).then(|| email.subject.clone()),
            sender_name: sender.and_then(|s| s.name.clone()),
            sender_email: sender.map(|s| s.address.clone()).unwrap_or_default(),
            recipients: Recipients {
                to: email.to.clone(),
                cc: email.cc.clone(),
                bcc: email.bcc.clone(),
            },
            storage_path: storage_path.clone(),
            storage_hash_sha256: sha256_hex(&email.eml),
            size_bytes: email.eml.len() as i64,
            path: email.path.clone(),
            tags: email.tags.clone(),
            has_attachments: !email.attachments.is_empty(),
            is_indexed: false,
            archived_at: now_rfc3339(),
        };
        if let Err(e) = email_repo::insert_with_attachments(&self.db, &row, &attachment_ids) {
            // Leave no orphaned blob behind.
            let _ = self.storage.delete(&storage_path).await;
            return Err(e.into());
        }
        Ok(Some(id))
    }

    /// Returns the attachment row for this content, writing the blob only
    /// when the source does not hold it yet.
    async fn store_attachment(
        &self,
        attachment: &EmailAttachment,
        source: &IngestionSource,
        prefix: &str,
    ) -> Result<Attachment, ProcessError> {
        let hash = sha256_hex(&attachment.content);
        if let Some(existing) = attachment_repo::find_by_hash(&self.db, &source.id, &hash)? {
            debug!(
                "Reusing stored attachment {} for hash {}",
                existing.storage_path, hash
            );
            return Ok(existing);
        }

        let id = uuid::Uuid::new_v4().to_string();
        let storage_path = format!(
            "{}attachments/{}-{}",
            prefix,
            id,
            sanitize_filename(&attachment.filename)
        );
        self.storage.put(&storage_path, &attachment.content).await?;

        let stored = attachment_repo::insert_or_get(
            &self.db,
            &Attachment {
                id,
                ingestion_source_id: source.id.clone(),
                filename: attachment.filename.clone(),
                mime_type: Some(attachment.content_type.clone()),
                size_bytes: attachment.content.len() as i64,
                content_hash_sha256: hash,
                storage_path: storage_path.clone(),
            },
        )?;
        if stored.storage_path != storage_path {
            // Another worker stored the same content first.
            let _ = self.storage.delete(&storage_path).await;
        }
        Ok(stored)
    }

    fn enqueue_index_batch(&self, emails: Vec<String>) -> Result<(), ProcessError> {
        if emails.is_empty() {
            return Ok(());
        }
        debug!("Queueing {} email(s) for indexing", emails.len());
        self.queue
            .add(NewJob::new(JobName::IndexEmailBatch, &IndexBatchJob { emails })?)?;
        Ok(())
    }

    /// Runs one full pass over a mailbox. Errors from single emails are
    /// logged and skipped; a connector error that ends the pass is returned
    /// and no cursor is reported.
    pub async fn process_mailbox(
        &self,
        connector: &mut dyn EmailConnector,
        source: &IngestionSource,
        user_email: &str,
    ) -> Result<MailboxOutcome, ProcessError> {
        let span = info_span!("mailbox", source_id = %source.id, user = %user_email);
        let result = async {
            connector
                .start_fetch(user_email, Some(&source.sync_state))
                .await?;
            self.drain(connector, source, user_email).await
        }
        .instrument(span)
        .await;
        connector.finish_fetch().await;

        let counters = result?;
        info!(
            "Mailbox {} done: {} archived, {} skipped, {} failed",
            user_email, counters.processed, counters.skipped, counters.failed
        );
        Ok(MailboxOutcome {
            sync_state: connector.updated_sync_state(user_email),
            processed: counters.processed,
            skipped: counters.skipped,
            failed: counters.failed,
            status_message: connector.status_message(),
            updated_credentials: connector.updated_credentials(),
        })
    }

    async fn drain(
        &self,
        connector: &mut dyn EmailConnector,
        source: &IngestionSource,
        user_email: &str,
    ) -> Result<PassCounters, ProcessError> {
        let mut counters = PassCounters::default();
        let mut batch = Vec::with_capacity(self.index_batch_size);
        let mut stream = Box::pin(email_stream(connector));

        while let Some(item) = stream.next().await {
            let email = match item {
                Ok(email) => email,
                Err(e) if e.is_skippable() => {
                    warn!("Skipping email in {}: {}", user_email, e);
                    counters.skipped += 1;
                    continue;
                }
                Err(e) => {
                    self.enqueue_index_batch(batch)?;
                    return Err(e.into());
                }
            };

            match self.process_email(&email, source, user_email).await {
                Ok(Some(id)) => {
                    counters.processed += 1;
                    batch.push(id);
                    if batch.len() >= self.index_batch_size {
                        self.enqueue_index_batch(std::mem::take(&mut batch))?;
                    }
                }
                Ok(None) => counters.skipped += 1,
                Err(e) => {
                    warn!(
                        "Failed to archive email {} for source {}: {}",
                        email.id, source.id, e
                    );
                    counters.failed += 1;
                }
            }
        }
        self.enqueue_index_batch(batch)?;
        Ok(counters)
    }
}
