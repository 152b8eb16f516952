//! SQLite-backed [`JobQueue`].

use std::str::FromStr;
use std::time::Duration;

use log::{debug, warn};
use serde_json::Value;

use crate::db::job_repo::{self, FailRecord, JobRow, NewJobRow};
use crate::db::Database;

use super::{
    ChildOutcome, FlowSpec, Job, JobId, JobName, JobQueue, JobState, NewJob, QueueError, Result,
};

/// Default time a claimed job may run before it counts as stalled.
pub const DEFAULT_LOCK_DURATION: Duration = Duration::from_secs(30 * 60);

#[derive(Clone)]
pub struct SqliteJobQueue {
    db: Database,
    lock_duration: Duration,
}

impl SqliteJobQueue {
    pub fn new(db: Database) -> Self {
        Self {
            db,
            lock_duration: DEFAULT_LOCK_DURATION,
        }
    }

    pub fn with_lock_duration(mut self, lock_duration: Duration) -> Self {
        self.lock_duration = lock_duration;
        self
    }

    /// Number of jobs in `state` on `queue`.
    pub fn count(&self, queue: &str, state: JobState) -> Result<u64> {
        Ok(job_repo::count_by_state(&self.db, queue, state.as_str())?)
    }

    pub fn find(&self, id: JobId) -> Result<Option<Job>> {
        job_repo::find_by_id(&self.db, id)?
            .map(job_from_row)
            .transpose()
    }
}

fn encode(job: &NewJob) -> Result<NewJobRow> {
    let payload = serde_json::to_string(&job.payload).map_err(|e| QueueError::Payload {
        name: job.name.to_string(),
        source: e,
    })?;
    Ok(NewJobRow {
        queue: job.name.queue().to_string(),
        name: job.name.as_str().to_string(),
        payload,
        source_id: job.source_id.clone(),
        state: if job.options.delay_ms > 0 {
            JobState::Delayed.as_str()
        } else {
            JobState::Waiting.as_str()
        },
        max_attempts: job.options.attempts.max(1),
        backoff_ms: job.options.backoff_ms,
        delay_ms: job.options.delay_ms,
        parent_id: None,
        pending_children: 0,
    })
}

fn parse_json(name: &str, raw: &str) -> Result<Value> {
    serde_json::from_str(raw).map_err(|e| QueueError::Payload {
        name: name.to_string(),
        source: e,
    })
}

fn job_from_row(row: JobRow) -> Result<Job> {
    Ok(Job {
        id: row.id,
        name: JobName::from_str(&row.name)?,
        payload: parse_json(&row.name, &row.payload)?,
        state: JobState::parse(&row.state)?,
        queue: row.queue,
        source_id: row.source_id,
        attempts_made: row.attempts_made,
        max_attempts: row.max_attempts,
        parent_id: row.parent_id,
    })
}

impl JobQueue for SqliteJobQueue {
    fn add(&self, job: NewJob) -> Result<JobId> {
        let id = job_repo::insert(&self.db, &encode(&job)?)?;
        debug!("Enqueued {} job {} on {}", job.name, id, job.name.queue());
        Ok(id)
    }

    fn add_flow(&self, flow: FlowSpec) -> Result<(JobId, Vec<JobId>)> {
        let parent = encode(&flow.parent)?;
        let children = flow
            .children
            .iter()
            .map(encode)
            .collect::<Result<Vec<_>>>()?;
        let ids = job_repo::insert_flow(&self.db, &parent, &children)?;
        debug!(
            "Enqueued {} flow {} with {} child job(s)",
            flow.parent.name,
            ids.0,
            ids.1.len()
        );
        Ok(ids)
    }

    fn claim(&self, queue: &str) -> Result<Option<Job>> {
        let lock_ms = self.lock_duration.as_millis() as u64;
        job_repo::claim_next(&self.db, queue, lock_ms)?
            .map(job_from_row)
            .transpose()
    }

    fn complete(&self, id: JobId, result: Option<&Value>) -> Result<bool> {
        let result = result.map(Value::to_string);
        Ok(job_repo::complete(&self.db, id, result.as_deref())?)
    }

    fn fail(&self, id: JobId, reason: &str) -> Result<FailRecord> {
        let record = job_repo::fail(&self.db, id, reason)?;
        match &record {
            FailRecord::Retrying { run_at } => {
                debug!("Job {} will retry at {}", id, run_at)
            }
            FailRecord::Exhausted => warn!("Job {} failed permanently: {}", id, reason),
            FailRecord::NotActive => {}
        }
        Ok(record)
    }

    fn children_values(&self, parent: JobId) -> Result<Vec<ChildOutcome>> {
        job_repo::find_children(&self.db, parent)?
            .into_iter()
            .map(|row| {
                let result = row
                    .result
                    .as_deref()
                    .map(|raw| parse_json(&row.name, raw))
                    .transpose()?;
                Ok(ChildOutcome {
                    id: row.id,
                    name: JobName::from_str(&row.name)?,
                    state: JobState::parse(&row.state)?,
                    result,
                    failed_reason: row.failed_reason,
                })
            })
            .collect()
    }

    fn find_by_source(&self, source_id: &str, states: &[JobState]) -> Result<Vec<Job>> {
        let states: Vec<&str> = states.iter().map(JobState::as_str).collect();
        job_repo::find_by_source(&self.db, source_id, &states)?
            .into_iter()
            .map(job_from_row)
            .collect()
    }

    fn remove(&self, id: JobId) -> Result<bool> {
        Ok(job_repo::remove(&self.db, id)?)
    }

    fn reclaim_stalled(&self) -> Result<usize> {
        let reclaimed = job_repo::reclaim_stalled(&self.db)?;
        if reclaimed > 0 {
            warn!("Reclaimed {} stalled job(s)", reclaimed);
        }
        Ok(reclaimed)
    }

    fn lock_duration(&self) -> Duration {
        self.lock_duration
    }

    fn extend_lock(&self, id: JobId) -> Result<bool> {
        let lock_ms = self.lock_duration.as_millis() as u64;
        Ok(job_repo::extend_lock(&self.db, id, lock_ms)?)
    }
}
