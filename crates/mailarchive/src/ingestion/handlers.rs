//! Job handlers run by the worker pool.

use log::{debug, info, warn};
use serde_json::Value;

use crate::connector::MailboxUser;
use crate::db::email_repo;
use crate::db::source_repo::{self, IngestionSource, SourceUpdate};
use crate::queue::{
    CycleFinishedJob, FlowSpec, IndexBatchJob, Job, JobId, JobName, JobOptions, JobState,
    MailboxJob, MailboxJobResult, NewJob, SourceJob,
};
use crate::source::SourceStatus;

use super::{IngestionError, IngestionService, Result};

pub const NO_USERS_MESSAGE: &str = "Initial import complete. No users found.";

fn to_value<T: serde::Serialize>(value: &T) -> Option<Value> {
    serde_json::to_value(value).ok()
}

impl IngestionService {
    /// Runs one claimed job. The returned value is stored as the job result.
    pub async fn handle_job(&self, job: &Job) -> Result<Option<Value>> {
        match job.name {
            JobName::InitialImport => {
                self.initial_import(&job.payload_as::<SourceJob>()?.ingestion_source_id)
                    .await?;
                Ok(None)
            }
            JobName::ContinuousSync => {
                self.continuous_sync(&job.payload_as::<SourceJob>()?.ingestion_source_id)
                    .await?;
                Ok(None)
            }
            JobName::ProcessMailbox => {
                let result = self.process_mailbox(&job.payload_as::<MailboxJob>()?).await?;
                Ok(to_value(&result))
            }
            JobName::SyncCycleFinished => {
                self.sync_cycle_finished(job.id, &job.payload_as::<CycleFinishedJob>()?)?;
                Ok(None)
            }
            JobName::IndexEmailBatch => {
                self.index_email_batch(&job.payload_as::<IndexBatchJob>()?)
                    .await?;
                Ok(None)
            }
            JobName::ScheduleContinuousSync => {
                self.schedule_continuous_sync()?;
                Ok(None)
            }
        }
    }

    async fn list_users(&self, source: &IngestionSource) -> Result<Vec<MailboxUser>> {
        let mut connector = self.connector_for(source)?;
        let users = connector.list_all_users().await?;
        Ok(users
            .into_iter()
            .filter(|u| !u.primary_email.is_empty())
            .collect())
    }

    /// Adds the fan-out: one `process-mailbox` child per user and a
    /// `sync-cycle-finished` parent that runs once they all settle.
    fn add_mailbox_flow(
        &self,
        source: &IngestionSource,
        users: &[MailboxUser],
        is_initial_import: bool,
    ) -> Result<JobId> {
        let parent = NewJob::new(
            JobName::SyncCycleFinished,
            &CycleFinishedJob {
                ingestion_source_id: source.id.clone(),
                user_count: users.len(),
                is_initial_import,
            },
        )?
        .for_source(&source.id);

        let children = users
            .iter()
            .map(|user| {
                Ok(NewJob::new(
                    JobName::ProcessMailbox,
                    &MailboxJob {
                        ingestion_source_id: source.id.clone(),
                        user_email: user.primary_email.clone(),
                    },
                )?
                .for_source(&source.id)
                .with_options(JobOptions::once()))
            })
            .collect::<Result<Vec<_>>>()?;

        let (parent_id, _) = self.queue.add_flow(FlowSpec { parent, children })?;
        info!(
            "Queued {} mailbox job(s) for source {} under flow {}",
            users.len(),
            source.id,
            parent_id
        );
        Ok(parent_id)
    }

    pub async fn initial_import(&self, source_id: &str) -> Result<()> {
        let source = self.find_by_id(source_id)?;
        info!("Starting initial import for source {} ({})", source.name, source.id);
        self.update(
            source_id,
            SourceUpdate::status(SourceStatus::Importing)
                .with_message("Starting initial import...")
                .started_now(),
            None,
        )?;

        let result = async {
            let users = self.list_users(&source).await?;
            if users.is_empty() {
                self.update(
                    source_id,
                    SourceUpdate::status(source.provider.settled_status())
                        .with_message(NO_USERS_MESSAGE)
                        .finished_now(),
                    None,
                )?;
                return Ok(());
            }
            self.add_mailbox_flow(&source, &users, true).map(|_| ())
        }
        .await;

        if let Err(e) = &result {
            warn!("Initial import failed for source {}: {}", source_id, e);
            self.update(
                source_id,
                SourceUpdate::status(SourceStatus::Error)
                    .with_message(format!("Initial import failed: {}", e)),
                None,
            )?;
        }
        result
    }

    pub async fn continuous_sync(&self, source_id: &str) -> Result<()> {
        let source = self.find_by_id(source_id)?;
        if !source.status.is_syncable() {
            debug!(
                "Skipping continuous sync for source {} in status {}",
                source_id, source.status
            );
            return Ok(());
        }

        self.update(
            source_id,
            SourceUpdate::status(SourceStatus::Syncing).started_now(),
            None,
        )?;

        let result = async {
            let users = self.list_users(&source).await?;
            if users.is_empty() {
                self.update(
                    source_id,
                    SourceUpdate::status(source.provider.settled_status())
                        .with_message("Sync complete. No users found.")
                        .finished_now(),
                    None,
                )?;
                return Ok(());
            }
            self.add_mailbox_flow(&source, &users, false).map(|_| ())
        }
        .await;

        if let Err(e) = &result {
            warn!("Continuous sync failed for source {}: {}", source_id, e);
            self.update(
                source_id,
                SourceUpdate::status(SourceStatus::Error)
                    .with_message(format!("Continuous sync failed: {}", e)),
                None,
            )?;
        }
        result
    }

    /// Archives one mailbox and commits its cursor. A pass that fails
    /// leaves the stored cursor untouched.
    pub async fn process_mailbox(&self, job: &MailboxJob) -> Result<MailboxJobResult> {
        let source = self.find_by_id(&job.ingestion_source_id)?;
        if source.status == SourceStatus::Paused {
            info!(
                "Source {} is paused; skipping mailbox {}",
                source.id, job.user_email
            );
            return Ok(MailboxJobResult {
                user_email: job.user_email.clone(),
                processed: 0,
                status_message: None,
            });
        }

        let mut connector = self.connector_for(&source)?;
        let outcome = self
            .processor
            .process_mailbox(connector.as_mut(), &source, &job.user_email)
            .await?;

        if !outcome.sync_state.is_empty() {
            source_repo::merge_sync_state(&self.db, &source.id, outcome.sync_state)?;
        }
        if let Some(credentials) = &outcome.updated_credentials {
            self.update_credentials(&source.id, credentials, None)?;
            debug!("Stored rotated credentials for source {}", source.id);
        }

        Ok(MailboxJobResult {
            user_email: job.user_email.clone(),
            processed: outcome.processed,
            status_message: outcome.status_message,
        })
    }

    /// The fan-in: settles the source once every mailbox job has finished.
    pub fn sync_cycle_finished(&self, job_id: JobId, job: &CycleFinishedJob) -> Result<()> {
        let source = match self.find_by_id(&job.ingestion_source_id) {
            Ok(source) => source,
            Err(IngestionError::NotFound(id)) => {
                info!("Source {} was deleted before its sync cycle finished", id);
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        let outcomes = self.queue.children_values(job_id)?;
        if outcomes.len() < job.user_count {
            info!(
                "Sync cycle {} of source {} lost {} of {} mailbox job(s); leaving the status to the newer cycle",
                job_id,
                source.id,
                job.user_count - outcomes.len(),
                job.user_count
            );
            return Ok(());
        }
        let failures: Vec<String> = outcomes
            .iter()
            .filter(|o| o.state == JobState::Failed)
            .map(|o| o.failed_reason.clone().unwrap_or_else(|| "unknown error".into()))
            .collect();
        let notes: Vec<String> = outcomes
            .iter()
            .filter_map(|o| o.result_as::<MailboxJobResult>())
            .filter_map(|r| r.status_message)
            .collect();

        let (status, message) = if !failures.is_empty() {
            (
                SourceStatus::Error,
                format!(
                    "{} of {} mailbox(es) failed: {}",
                    failures.len(),
                    job.user_count,
                    failures.join("; ")
                ),
            )
        } else if !notes.is_empty() {
            (source.provider.settled_status(), notes.join("; "))
        } else {
            (
                source.provider.settled_status(),
                format!("Successfully synced {} mailbox(es).", job.user_count),
            )
        };

        let mut changes = SourceUpdate::default().with_message(message).finished_now();
        if source.status == SourceStatus::Paused {
            info!("Source {} was paused during the cycle; keeping it paused", source.id);
        } else if source.status.can_transition_to(status) {
            changes.status = Some(status);
        } else {
            warn!(
                "Source {} moved to {} during the cycle; not settling it to {}",
                source.id, source.status, status
            );
        }
        self.update(&source.id, changes, None)?;
        info!(
            "Sync cycle finished for source {} ({}, initial import: {})",
            source.id, status, job.is_initial_import
        );
        Ok(())
    }

    pub async fn index_email_batch(&self, job: &IndexBatchJob) -> Result<()> {
        if job.emails.is_empty() {
            return Ok(());
        }
        self.search.index_emails(&job.emails).await?;
        let marked = email_repo::mark_indexed(&self.db, &job.emails)?;
        debug!("Indexed {} of {} email(s)", marked, job.emails.len());
        Ok(())
    }

    /// Queues a continuous sync for every syncable source with nothing in
    /// flight. Returns how many were queued.
    ///
    /// Live mailboxes in `error` are retried each tick, so a provider that
    /// was unreachable or rate limited recovers on its own. A file import
    /// that failed stays put until it is force synced.
    pub fn schedule_continuous_sync(&self) -> Result<usize> {
        let mut queued = 0;
        let candidates = source_repo::find_by_status(
            &self.db,
            &[SourceStatus::Active, SourceStatus::Error],
        )?;
        for source in candidates {
            if source.status == SourceStatus::Error && source.provider.is_file_import() {
                continue;
            }
            if !self
                .queue
                .find_by_source(&source.id, &JobState::IN_FLIGHT)?
                .is_empty()
            {
                debug!("Source {} still has jobs in flight; not scheduling", source.id);
                continue;
            }
            let job = NewJob::new(
                JobName::ContinuousSync,
                &SourceJob {
                    ingestion_source_id: source.id.clone(),
                },
            )?
            .for_source(&source.id);
            self.queue.add(job)?;
            queued += 1;
        }
        if queued > 0 {
            info!("Scheduled continuous sync for {} source(s)", queued);
        }
        Ok(queued)
    }
}
