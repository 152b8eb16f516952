//! Ingestion orchestration: the source lifecycle and the job handlers that
//! drive imports and syncs through the queue.

use std::sync::Arc;

use log::{debug, info, warn};
use serde_json::json;

use crate::connector::EmailConnector;
use crate::crypto::CredentialCipher;
use crate::db::source_repo::{self, IngestionSource, SourceUpdate};
use crate::db::{now_rfc3339, Database};
use crate::factory::{ConnectorFactory, ProviderCredentials};
use crate::oauth::CompletedAuthorization;
use crate::processor::{MailboxProcessor, DEFAULT_INDEX_BATCH_SIZE};
use crate::queue::{JobName, JobQueue, JobState, NewJob, SourceJob};
use crate::source::SourceStatus;
use crate::storage::StorageService;
use crate::sync_state::SyncState;

pub mod audit;
pub mod error;
mod handlers;
pub mod search;

pub use audit::{Actor, AuditAction, AuditEntry, AuditSink, DbAuditSink};
pub use error::{IngestionError, Result};
pub use search::{NoopSearchIndex, SearchError, SearchIndex};

pub const FORCE_SYNC_MESSAGE: &str = "Force sync triggered by user.";

#[derive(Debug, Clone)]
pub struct IngestionConfig {
    /// Top-level storage folder holding every source's blobs.
    pub root_folder: String,
    pub deletion_disabled: bool,
    pub index_batch_size: usize,
}

impl Default for IngestionConfig {
    fn default() -> Self {
        Self {
            root_folder: "mail-archive".to_string(),
            deletion_disabled: false,
            index_batch_size: DEFAULT_INDEX_BATCH_SIZE,
        }
    }
}

/// What a caller supplies to register a source.
#[derive(Clone)]
pub struct NewSource {
    pub user_id: String,
    pub name: String,
    pub credentials: ProviderCredentials,
}

pub struct IngestionService {
    db: Database,
    queue: Arc<dyn JobQueue>,
    storage: Arc<dyn StorageService>,
    cipher: Arc<CredentialCipher>,
    factory: Arc<dyn ConnectorFactory>,
    audit: Arc<dyn AuditSink>,
    search: Arc<dyn SearchIndex>,
    processor: MailboxProcessor,
    config: IngestionConfig,
}

impl IngestionService {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        db: Database,
        queue: Arc<dyn JobQueue>,
        storage: Arc<dyn StorageService>,
        cipher: Arc<CredentialCipher>,
        factory: Arc<dyn ConnectorFactory>,
        audit: Arc<dyn AuditSink>,
        search: Arc<dyn SearchIndex>,
        config: IngestionConfig,
    ) -> Self {
        let processor = MailboxProcessor::new(
            db.clone(),
            Arc::clone(&storage),
            Arc::clone(&queue),
            config.root_folder.clone(),
        )
        .with_index_batch_size(config.index_batch_size);
        Self {
            db,
            queue,
            storage,
            cipher,
            factory,
            audit,
            search,
            processor,
            config,
        }
    }

    pub fn find_by_id(&self, id: &str) -> Result<IngestionSource> {
        source_repo::find_by_id(&self.db, id)?.ok_or_else(|| IngestionError::NotFound(id.to_string()))
    }

    /// Sources owned by `user_id`, or every source.
    pub fn find_all(&self, user_id: Option<&str>) -> Result<Vec<IngestionSource>> {
        Ok(source_repo::find_all(&self.db, user_id)?)
    }

    pub fn credentials(&self, source: &IngestionSource) -> Result<ProviderCredentials> {
        Ok(self.cipher.decrypt_object(&source.credentials)?)
    }

    fn connector_for(&self, source: &IngestionSource) -> Result<Box<dyn EmailConnector>> {
        let credentials = self.credentials(source)?;
        Ok(self.factory.create(source, credentials)?)
    }

    fn record(&self, actor: &Actor, action: AuditAction, source_id: &str, details: serde_json::Value) {
        self.audit
            .record(AuditEntry::source(actor, action, source_id, details));
    }

    /// Registers a source and tests its connection. A source that cannot
    /// connect is removed again and the error returned; one that can moves
    /// to `auth_success`, which queues the initial import.
    pub async fn create(&self, new: NewSource, actor: &Actor) -> Result<IngestionSource> {
        let now = now_rfc3339();
        let source = IngestionSource {
            id: uuid::Uuid::new_v4().to_string(),
            user_id: new.user_id,
            name: new.name,
            provider: new.credentials.kind(),
            credentials: self.cipher.encrypt_object(&new.credentials)?,
            status: SourceStatus::PendingAuth,
            sync_state: SyncState::Empty,
            last_sync_started_at: None,
            last_sync_finished_at: None,
            last_sync_status_message: None,
            created_at: now.clone(),
            updated_at: now,
        };
        source_repo::insert(&self.db, &source)?;
        self.record(
            actor,
            AuditAction::Create,
            &source.id,
            json!({"sourceName": source.name, "sourceType": source.provider.as_str()}),
        );

        let tested = match self.factory.create(&source, new.credentials) {
            Ok(mut connector) => connector.test_connection().await,
            Err(e) => Err(e),
        };
        match tested {
            Ok(true) => {
                info!("Connection test passed for source {} ({})", source.name, source.id);
                self.update(&source.id, SourceUpdate::status(SourceStatus::AuthSuccess), Some(actor))
            }
            Ok(false) => {
                self.discard(&source)?;
                Err(IngestionError::ConnectionTestFailed)
            }
            Err(e) => {
                warn!("Connection test failed for source {}: {}", source.id, e);
                self.discard(&source)?;
                Err(e.into())
            }
        }
    }

    /// Registers an Outlook.com account from a finished authorization.
    pub async fn create_outlook_personal(
        &self,
        name: impl Into<String>,
        authorization: CompletedAuthorization,
        actor: &Actor,
    ) -> Result<IngestionSource> {
        self.create(
            NewSource {
                user_id: authorization.user_id,
                name: name.into(),
                credentials: ProviderCredentials::OutlookPersonal(authorization.credentials),
            },
            actor,
        )
        .await
    }

    /// Removes a source that never got past `pending_auth`.
    fn discard(&self, source: &IngestionSource) -> Result<()> {
        source_repo::delete(&self.db, &source.id)?;
        Ok(())
    }

    /// Applies a partial update. Moving into `auth_success` from any other
    /// status queues the initial import.
    pub fn update(
        &self,
        id: &str,
        changes: SourceUpdate,
        actor: Option<&Actor>,
    ) -> Result<IngestionSource> {
        if let Some(next) = changes.status {
            let current = self.find_by_id(id)?;
            if !current.status.can_transition_to(next) {
                return Err(IngestionError::InvalidTransition {
                    from: current.status,
                    to: next,
                });
            }
        }

        let (before, after) = source_repo::update(&self.db, id, &changes)?
            .ok_or_else(|| IngestionError::NotFound(id.to_string()))?;

        if before.status != SourceStatus::AuthSuccess && after.status == SourceStatus::AuthSuccess {
            self.trigger_initial_import(&after.id)?;
        }

        if let Some(actor) = actor {
            let changed = changes.field_names();
            if !changed.is_empty() {
                self.record(actor, AuditAction::Update, id, json!({"changedFields": changed}));
            }
        }
        Ok(after)
    }

    /// Replaces the stored credentials, encrypted.
    pub fn update_credentials(
        &self,
        id: &str,
        credentials: &ProviderCredentials,
        actor: Option<&Actor>,
    ) -> Result<IngestionSource> {
        let changes = SourceUpdate {
            credentials: Some(self.cipher.encrypt_object(credentials)?),
            ..Default::default()
        };
        self.update(id, changes, actor)
    }

    pub fn trigger_initial_import(&self, id: &str) -> Result<()> {
        let job = NewJob::new(
            JobName::InitialImport,
            &SourceJob {
                ingestion_source_id: id.to_string(),
            },
        )?
        .for_source(id);
        self.queue.add(job)?;
        info!("Queued initial import for source {}", id);
        Ok(())
    }

    /// Removes the source's queued jobs that no worker holds. A pending
    /// sync cycle goes with its children unless one of them is running;
    /// the fan-in of a cycle that lost children does not settle the source.
    fn remove_queued_jobs(&self, id: &str) -> Result<usize> {
        let mut removed = 0;
        for parent in self.queue.find_by_source(id, &[JobState::WaitingChildren])? {
            let running = self
                .queue
                .children_values(parent.id)?
                .iter()
                .any(|child| child.state == JobState::Active);
            if running {
                debug!("Keeping flow {} of source {}: a child is running", parent.id, id);
                continue;
            }
            if self.queue.remove(parent.id)? {
                removed += 1;
            }
        }
        for job in self.queue.find_by_source(id, &JobState::REMOVABLE)? {
            match self.queue.remove(job.id) {
                Ok(true) => removed += 1,
                Ok(false) => {}
                Err(e) => warn!("Failed to remove stale job {}: {}", job.id, e),
            }
        }
        Ok(removed)
    }

    /// Drops every queued job of the source that no worker holds, resets it
    /// to `active` and queues a continuous sync.
    pub fn force_sync(&self, id: &str, actor: &Actor) -> Result<()> {
        let source = self.find_by_id(id)?;
        info!("Force sync started for source {}", id);

        let removed = self.remove_queued_jobs(id)?;
        if removed > 0 {
            info!("Removed {} stale job(s) of source {} during force sync", removed, id);
        }

        self.update(
            id,
            SourceUpdate::status(SourceStatus::Active).with_message(FORCE_SYNC_MESSAGE),
            Some(actor),
        )?;
        self.record(actor, AuditAction::Sync, id, json!({"sourceName": source.name}));

        let job = NewJob::new(
            JobName::ContinuousSync,
            &SourceJob {
                ingestion_source_id: id.to_string(),
            },
        )?
        .for_source(id);
        self.queue.add(job)?;
        Ok(())
    }

    /// Pauses an importing or syncing source. Resume with [`force_sync`].
    ///
    /// [`force_sync`]: IngestionService::force_sync
    pub fn pause(&self, id: &str, actor: &Actor) -> Result<IngestionSource> {
        let source = self.find_by_id(id)?;
        if !matches!(
            source.status,
            SourceStatus::Active | SourceStatus::Importing | SourceStatus::Syncing
        ) {
            return Err(IngestionError::InvalidTransition {
                from: source.status,
                to: SourceStatus::Paused,
            });
        }
        self.update(
            id,
            SourceUpdate::status(SourceStatus::Paused).with_message("Sync paused by user."),
            Some(actor),
        )
    }

    /// Deletes a source with its blobs, its uploaded file and its search
    /// entries. Rows that reference the source cascade.
    pub async fn delete(&self, id: &str, actor: &Actor) -> Result<IngestionSource> {
        if self.config.deletion_disabled {
            return Err(IngestionError::DeletionDisabled);
        }
        let source = self.find_by_id(id)?;

        self.storage
            .delete(&source.storage_prefix(&self.config.root_folder))
            .await?;

        match self.credentials(&source) {
            Ok(credentials) => {
                if let Some(key) = credentials.file_import().and_then(|f| f.uploaded_key()) {
                    if self.storage.exists(key).await? {
                        self.storage.delete(key).await?;
                    }
                }
            }
            Err(e) => warn!(
                "Could not decrypt credentials of source {} during delete: {}",
                id, e
            ),
        }

        self.search.delete_by_source(id).await?;

        self.remove_queued_jobs(id)?;

        let deleted = source_repo::delete(&self.db, id)?
            .ok_or_else(|| IngestionError::NotFound(id.to_string()))?;
        self.record(actor, AuditAction::Delete, id, json!({"sourceName": deleted.name}));
        info!("Deleted ingestion source {} ({})", deleted.name, id);
        Ok(deleted)
    }
}

