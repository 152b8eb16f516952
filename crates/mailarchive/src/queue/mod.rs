//! Durable job queue with parent/child flows.
//!
//! Jobs are delivered at least once: a claimed job holds a lock until it
//! completes or fails, and a lock that expires returns the job to the
//! waiting state. A flow parent stays in `waiting-children` until every
//! child settles (completed, failed for good, or removed) and then runs
//! exactly once.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

pub mod error;
pub mod payload;
pub mod sqlite;

pub use crate::db::job_repo::FailRecord;
pub use error::{QueueError, Result};
pub use payload::{CycleFinishedJob, IndexBatchJob, MailboxJob, MailboxJobResult, SourceJob};
pub use sqlite::SqliteJobQueue;

pub const INGESTION_QUEUE: &str = "ingestion";
pub const INDEXING_QUEUE: &str = "indexing";

pub type JobId = i64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JobName {
    InitialImport,
    ContinuousSync,
    ProcessMailbox,
    SyncCycleFinished,
    IndexEmailBatch,
    ScheduleContinuousSync,
}

impl JobName {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobName::InitialImport => "initial-import",
            JobName::ContinuousSync => "continuous-sync",
            JobName::ProcessMailbox => "process-mailbox",
            JobName::SyncCycleFinished => "sync-cycle-finished",
            JobName::IndexEmailBatch => "index-email-batch",
            JobName::ScheduleContinuousSync => "schedule-continuous-sync",
        }
    }

    /// The queue this kind of job runs on.
    pub fn queue(&self) -> &'static str {
        match self {
            JobName::IndexEmailBatch => INDEXING_QUEUE,
            _ => INGESTION_QUEUE,
        }
    }
}

impl fmt::Display for JobName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobName {
    type Err = QueueError;

    fn from_str(s: &str) -> Result<Self> {
        Ok(match s {
            "initial-import" => JobName::InitialImport,
            "continuous-sync" => JobName::ContinuousSync,
            "process-mailbox" => JobName::ProcessMailbox,
            "sync-cycle-finished" => JobName::SyncCycleFinished,
            "index-email-batch" => JobName::IndexEmailBatch,
            "schedule-continuous-sync" => JobName::ScheduleContinuousSync,
            other => return Err(QueueError::UnknownJobName(other.to_string())),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JobState {
    WaitingChildren,
    Waiting,
    Delayed,
    Active,
    Completed,
    Failed,
    Paused,
}

impl JobState {
    /// States a job can be removed from without interrupting a worker.
    pub const REMOVABLE: [JobState; 4] = [
        JobState::Waiting,
        JobState::Delayed,
        JobState::Failed,
        JobState::Paused,
    ];

    /// States of a job that still has work ahead of it.
    pub const IN_FLIGHT: [JobState; 4] = [
        JobState::WaitingChildren,
        JobState::Waiting,
        JobState::Delayed,
        JobState::Active,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::WaitingChildren => "waiting-children",
            JobState::Waiting => "waiting",
            JobState::Delayed => "delayed",
            JobState::Active => "active",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
            JobState::Paused => "paused",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        Ok(match s {
            "waiting-children" => JobState::WaitingChildren,
            "waiting" => JobState::Waiting,
            "delayed" => JobState::Delayed,
            "active" => JobState::Active,
            "completed" => JobState::Completed,
            "failed" => JobState::Failed,
            "paused" => JobState::Paused,
            other => return Err(QueueError::UnknownState(other.to_string())),
        })
    }

    pub fn is_settled(&self) -> bool {
        matches!(self, JobState::Completed | JobState::Failed)
    }
}

/// Retry behaviour for a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JobOptions {
    pub attempts: u32,
    /// Base for exponential backoff between attempts.
    pub backoff_ms: u64,
    /// Initial delay before the first attempt.
    pub delay_ms: u64,
}

impl Default for JobOptions {
    fn default() -> Self {
        Self {
            attempts: 5,
            backoff_ms: 1000,
            delay_ms: 0,
        }
    }
}

impl JobOptions {
    /// One attempt, no retry.
    pub fn once() -> Self {
        Self {
            attempts: 1,
            ..Self::default()
        }
    }
}

/// A job to enqueue.
#[derive(Debug, Clone)]
pub struct NewJob {
    pub name: JobName,
    pub payload: Value,
    /// Correlates the job with an ingestion source for lookup and removal.
    pub source_id: Option<String>,
    pub options: JobOptions,
}

impl NewJob {
    pub fn new<T: Serialize>(name: JobName, payload: &T) -> Result<Self> {
        let payload = serde_json::to_value(payload).map_err(|e| QueueError::Payload {
            name: name.to_string(),
            source: e,
        })?;
        Ok(Self {
            name,
            payload,
            source_id: None,
            options: JobOptions::default(),
        })
    }

    pub fn for_source(mut self, source_id: impl Into<String>) -> Self {
        self.source_id = Some(source_id.into());
        self
    }

    pub fn with_options(mut self, options: JobOptions) -> Self {
        self.options = options;
        self
    }
}

/// One parent that runs after all of its children settle.
#[derive(Debug, Clone)]
pub struct FlowSpec {
    pub parent: NewJob,
    pub children: Vec<NewJob>,
}

/// A claimed or looked-up job.
#[derive(Debug, Clone)]
pub struct Job {
    pub id: JobId,
    pub queue: String,
    pub name: JobName,
    pub payload: Value,
    pub source_id: Option<String>,
    pub state: JobState,
    pub attempts_made: u32,
    pub max_attempts: u32,
    pub parent_id: Option<JobId>,
}

impl Job {
    pub fn payload_as<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_value(self.payload.clone()).map_err(|e| QueueError::Payload {
            name: self.name.to_string(),
            source: e,
        })
    }
}

/// How one child of a flow ended.
#[derive(Debug, Clone)]
pub struct ChildOutcome {
    pub id: JobId,
    pub name: JobName,
    pub state: JobState,
    pub result: Option<Value>,
    pub failed_reason: Option<String>,
}

impl ChildOutcome {
    pub fn result_as<T: DeserializeOwned>(&self) -> Option<T> {
        self.result
            .as_ref()
            .and_then(|v| serde_json::from_value(v.clone()).ok())
    }
}

pub trait JobQueue: Send + Sync {
    fn add(&self, job: NewJob) -> Result<JobId>;

    /// Adds the parent and children atomically. Returns (parent, children).
    fn add_flow(&self, flow: FlowSpec) -> Result<(JobId, Vec<JobId>)>;

    /// Claims the next runnable job on `queue`.
    fn claim(&self, queue: &str) -> Result<Option<Job>>;

    /// Returns false when the job was no longer active.
    fn complete(&self, id: JobId, result: Option<&Value>) -> Result<bool>;

    fn fail(&self, id: JobId, reason: &str) -> Result<FailRecord>;

    fn children_values(&self, parent: JobId) -> Result<Vec<ChildOutcome>>;

    /// Jobs for a source; all states when `states` is empty.
    fn find_by_source(&self, source_id: &str, states: &[JobState]) -> Result<Vec<Job>>;

    /// Deletes a job together with its children. Removing an unsettled
    /// child counts it as settled for its parent.
    fn remove(&self, id: JobId) -> Result<bool>;

    /// Returns jobs with expired locks to the waiting state.
    fn reclaim_stalled(&self) -> Result<usize>;

    /// How long a claim stays valid without a heartbeat.
    fn lock_duration(&self) -> Duration;

    /// Renews the lock of a running job. Returns false when the job is no
    /// longer active, e.g. after it was reclaimed or removed.
    fn extend_lock(&self, id: JobId) -> Result<bool>;
}
