//! Queue job repository: rows of the `queue_jobs` table backing the durable
//! job queue, including parent/child bookkeeping for flows.

use chrono::{Duration, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};

use super::{now_rfc3339, Database, DatabaseError};

/// A raw job row from the database.
#[derive(Debug, Clone)]
pub struct JobRow {
    pub id: i64,
    pub queue: String,
    pub name: String,
    pub payload: String,
    pub source_id: Option<String>,
    pub state: String,
    pub attempts_made: u32,
    pub max_attempts: u32,
    pub backoff_ms: u64,
    pub run_at: String,
    pub locked_until: Option<String>,
    pub parent_id: Option<i64>,
    pub pending_children: u32,
    pub result: Option<String>,
    pub failed_reason: Option<String>,
    pub created_at: String,
    pub finished_at: Option<String>,
}

impl JobRow {
    fn from_row(row: &Row<'_>) -> Result<Self, rusqlite::Error> {
        Ok(Self {
            id: row.get("id")?,
            queue: row.get("queue")?,
            name: row.get("name")?,
            payload: row.get("payload")?,
            source_id: row.get("source_id")?,
            state: row.get("state")?,
            attempts_made: row.get("attempts_made")?,
            max_attempts: row.get("max_attempts")?,
            backoff_ms: row.get("backoff_ms")?,
            run_at: row.get("run_at")?,
            locked_until: row.get("locked_until")?,
            parent_id: row.get("parent_id")?,
            pending_children: row.get("pending_children")?,
            result: row.get("result")?,
            failed_reason: row.get("failed_reason")?,
            created_at: row.get("created_at")?,
            finished_at: row.get("finished_at")?,
        })
    }
}

/// Values for a new job row.
#[derive(Debug, Clone)]
pub struct NewJobRow {
    pub queue: String,
    pub name: String,
    pub payload: String,
    pub source_id: Option<String>,
    pub state: &'static str,
    pub max_attempts: u32,
    pub backoff_ms: u64,
    pub delay_ms: u64,
    pub parent_id: Option<i64>,
    pub pending_children: u32,
}

/// How a failed attempt was recorded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailRecord {
    /// Re-scheduled as `delayed` until `run_at`.
    Retrying { run_at: String },
    /// Attempts exhausted; the job is terminally `failed`.
    Exhausted,
    /// The job was not active (already settled or removed).
    NotActive,
}

fn timestamp_in(ms: u64) -> String {
    let offset = Duration::milliseconds(i64::try_from(ms).unwrap_or(i64::MAX / 2));
    (Utc::now() + offset).to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}

fn insert_conn(conn: &Connection, job: &NewJobRow) -> Result<i64, DatabaseError> {
    let now = now_rfc3339();
    conn.execute(
        "INSERT INTO queue_jobs (queue, name, payload, source_id, state, max_attempts, backoff_ms,
         run_at, parent_id, pending_children, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
        params![
            job.queue,
            job.name,
            job.payload,
            job.source_id,
            job.state,
            job.max_attempts,
            job.backoff_ms,
            timestamp_in(job.delay_ms),
            job.parent_id,
            job.pending_children,
            now,
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

pub fn insert(db: &Database, job: &NewJobRow) -> Result<i64, DatabaseError> {
    db.with_conn(|conn| insert_conn(conn, job))
}

/// Inserts a parent and its children atomically. The parent waits for its
/// children unless there are none, in which case it is immediately runnable.
pub fn insert_flow(
    db: &Database,
    parent: &NewJobRow,
    children: &[NewJobRow],
) -> Result<(i64, Vec<i64>), DatabaseError> {
    db.with_transaction(|tx| {
        let mut parent = parent.clone();
        parent.pending_children = children.len() as u32;
        parent.state = if children.is_empty() {
            "waiting"
        } else {
            "waiting-children"
        };
        let parent_id = insert_conn(tx, &parent)?;

        let mut child_ids = Vec::with_capacity(children.len());
        for child in children {
            let mut child = child.clone();
            child.parent_id = Some(parent_id);
            child_ids.push(insert_conn(tx, &child)?);
        }
        Ok((parent_id, child_ids))
    })
}

pub fn find_by_id(db: &Database, id: i64) -> Result<Option<JobRow>, DatabaseError> {
    db.with_conn(|conn| find_by_id_conn(conn, id))
}

fn find_by_id_conn(conn: &Connection, id: i64) -> Result<Option<JobRow>, DatabaseError> {
    Ok(conn
        .query_row(
            "SELECT * FROM queue_jobs WHERE id = ?1",
            params![id],
            JobRow::from_row,
        )
        .optional()?)
}

/// Claims the next runnable job on `queue`, marking it active with a lock
/// that expires after `lock_ms`.
pub fn claim_next(db: &Database, queue: &str, lock_ms: u64) -> Result<Option<JobRow>, DatabaseError> {
    db.with_transaction(|tx| {
        let now = now_rfc3339();
        let candidate: Option<i64> = tx
            .query_row(
                "SELECT id FROM queue_jobs
                 WHERE queue = ?1 AND state IN ('waiting', 'delayed') AND run_at <= ?2
                 ORDER BY run_at, id LIMIT 1",
                params![queue, now],
                |r| r.get(0),
            )
            .optional()?;
        let Some(id) = candidate else {
            return Ok(None);
        };

        tx.execute(
            "UPDATE queue_jobs SET state = 'active', attempts_made = attempts_made + 1,
             locked_until = ?2
             WHERE id = ?1",
            params![id, timestamp_in(lock_ms)],
        )?;
        find_by_id_conn(tx, id)
    })
}

/// Pushes an active job's lock deadline `lock_ms` into the future.
/// Returns false when the job is no longer active.
pub fn extend_lock(db: &Database, id: i64, lock_ms: u64) -> Result<bool, DatabaseError> {
    db.with_conn(|conn| {
        let updated = conn.execute(
            "UPDATE queue_jobs SET locked_until = ?2 WHERE id = ?1 AND state = 'active'",
            params![id, timestamp_in(lock_ms)],
        )?;
        Ok(updated > 0)
    })
}

/// Decrements the parent's outstanding-children counter and releases the
/// parent once the last child settles.
fn settle_parent(conn: &Connection, parent_id: Option<i64>) -> Result<(), DatabaseError> {
    let Some(parent_id) = parent_id else {
        return Ok(());
    };
    conn.execute(
        "UPDATE queue_jobs SET pending_children = pending_children - 1
         WHERE id = ?1 AND pending_children > 0",
        params![parent_id],
    )?;
    let released = conn.execute(
        "UPDATE queue_jobs SET state = 'waiting', run_at = ?2
         WHERE id = ?1 AND state = 'waiting-children' AND pending_children = 0",
        params![parent_id, now_rfc3339()],
    )?;
    if released > 0 {
        log::debug!("Parent job {} released after all children settled", parent_id);
    }
    Ok(())
}

/// Marks an active job completed. Returns false when the job was not active.
pub fn complete(db: &Database, id: i64, result: Option<&str>) -> Result<bool, DatabaseError> {
    db.with_transaction(|tx| {
        let updated = tx.execute(
            "UPDATE queue_jobs SET state = 'completed', result = ?2, finished_at = ?3,
             locked_until = NULL
             WHERE id = ?1 AND state = 'active'",
            params![id, result, now_rfc3339()],
        )?;
        if updated == 0 {
            return Ok(false);
        }
        let parent_id: Option<i64> = tx.query_row(
            "SELECT parent_id FROM queue_jobs WHERE id = ?1",
            params![id],
            |r| r.get(0),
        )?;
        settle_parent(tx, parent_id)?;
        Ok(true)
    })
}

/// Records a failed attempt. Retries with exponential backoff
/// (`backoff_ms * 2^(attempt-1)`) until `max_attempts` is reached.
pub fn fail(db: &Database, id: i64, reason: &str) -> Result<FailRecord, DatabaseError> {
    db.with_transaction(|tx| {
        let Some(job) = find_by_id_conn(tx, id)? else {
            return Ok(FailRecord::NotActive);
        };
        if job.state != "active" {
            return Ok(FailRecord::NotActive);
        }

        if job.attempts_made < job.max_attempts {
            let exponent = job.attempts_made.saturating_sub(1).min(20);
            let delay = job.backoff_ms.saturating_mul(1u64 << exponent);
            let run_at = timestamp_in(delay);
            tx.execute(
                "UPDATE queue_jobs SET state = 'delayed', run_at = ?2, failed_reason = ?3,
                 locked_until = NULL
                 WHERE id = ?1",
                params![id, run_at, reason],
            )?;
            return Ok(FailRecord::Retrying { run_at });
        }

        tx.execute(
            "UPDATE queue_jobs SET state = 'failed', failed_reason = ?2, finished_at = ?3,
             locked_until = NULL
             WHERE id = ?1",
            params![id, reason, now_rfc3339()],
        )?;
        settle_parent(tx, job.parent_id)?;
        Ok(FailRecord::Exhausted)
    })
}

pub fn find_children(db: &Database, parent_id: i64) -> Result<Vec<JobRow>, DatabaseError> {
    db.with_conn(|conn| {
        let mut stmt = conn.prepare("SELECT * FROM queue_jobs WHERE parent_id = ?1 ORDER BY id")?;
        let rows = stmt
            .query_map(params![parent_id], JobRow::from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    })
}

/// Jobs correlated with a source, optionally narrowed to the given states.
pub fn find_by_source(
    db: &Database,
    source_id: &str,
    states: &[&str],
) -> Result<Vec<JobRow>, DatabaseError> {
    db.with_conn(|conn| {
        let mut stmt = conn.prepare("SELECT * FROM queue_jobs WHERE source_id = ?1 ORDER BY id")?;
        let rows = stmt
            .query_map(params![source_id], JobRow::from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows
            .into_iter()
            .filter(|r| states.is_empty() || states.contains(&r.state.as_str()))
            .collect())
    })
}

/// Removes a job (children cascade). Removing an unsettled child counts as
/// settling it, so its parent is not left waiting forever.
pub fn remove(db: &Database, id: i64) -> Result<bool, DatabaseError> {
    db.with_transaction(|tx| {
        let Some(job) = find_by_id_conn(tx, id)? else {
            return Ok(false);
        };
        tx.execute("DELETE FROM queue_jobs WHERE id = ?1", params![id])?;
        if !matches!(job.state.as_str(), "completed" | "failed") {
            settle_parent(tx, job.parent_id)?;
        }
        Ok(true)
    })
}

/// Returns active jobs whose lock expired to the waiting state, or fails
/// them when they have no attempts left.
pub fn reclaim_stalled(db: &Database) -> Result<usize, DatabaseError> {
    db.with_transaction(|tx| {
        let now = now_rfc3339();
        let mut stmt = tx.prepare(
            "SELECT * FROM queue_jobs WHERE state = 'active' AND locked_until IS NOT NULL
             AND locked_until < ?1",
        )?;
        let stalled = stmt
            .query_map(params![now], JobRow::from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        drop(stmt);

        for job in &stalled {
            if job.attempts_made < job.max_attempts {
                tx.execute(
                    "UPDATE queue_jobs SET state = 'waiting', locked_until = NULL, run_at = ?2
                     WHERE id = ?1",
                    params![job.id, now],
                )?;
            } else {
                tx.execute(
                    "UPDATE queue_jobs SET state = 'failed', locked_until = NULL,
                     failed_reason = 'job stalled more than allowable limit', finished_at = ?2
                     WHERE id = ?1",
                    params![job.id, now],
                )?;
                settle_parent(tx, job.parent_id)?;
            }
        }
        Ok(stalled.len())
    })
}

/// Counts jobs on a queue in the given state.
pub fn count_by_state(db: &Database, queue: &str, state: &str) -> Result<u64, DatabaseError> {
    db.with_conn(|conn| {
        Ok(conn.query_row(
            "SELECT COUNT(*) FROM queue_jobs WHERE queue = ?1 AND state = ?2",
            params![queue, state],
            |r| r.get(0),
        )?)
    })
}
