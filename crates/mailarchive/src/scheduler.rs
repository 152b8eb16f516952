//! Periodic continuous-sync scheduler.
//!
//! Each tick queues one `schedule-continuous-sync` job, which a worker
//! expands into a `continuous-sync` per idle syncable source, and returns
//! stalled jobs to the queue.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use log::{debug, error, info};
use tokio::sync::broadcast;

use crate::error::WorkerError;
use crate::queue::{JobName, JobOptions, JobQueue, NewJob};

pub struct SyncScheduler {
    queue: Arc<dyn JobQueue>,
    interval: Duration,
    shutdown: Arc<AtomicBool>,
    trigger_tx: broadcast::Sender<()>,
}

impl SyncScheduler {
    pub fn new(queue: Arc<dyn JobQueue>, interval: Duration) -> Self {
        let (trigger_tx, _) = broadcast::channel(16);
        Self {
            queue,
            interval,
            shutdown: Arc::new(AtomicBool::new(false)),
            trigger_tx,
        }
    }

    /// Runs one tick now: reclaims stalled jobs and queues the scheduling job.
    pub fn tick(&self) {
        run_tick(self.queue.as_ref());
    }

    /// Starts the loop in a background thread.
    pub fn start(&self) -> Result<JoinHandle<()>, WorkerError> {
        let queue = Arc::clone(&self.queue);
        let shutdown = Arc::clone(&self.shutdown);
        let interval = self.interval;
        let mut trigger_rx = self.trigger_tx.subscribe();
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|e| WorkerError::Runtime(e.to_string()))?;

        std::thread::Builder::new()
            .name("mailarchive-scheduler".into())
            .spawn(move || {
                rt.block_on(async {
                    let mut interval_timer = tokio::time::interval(interval);

                    loop {
                        tokio::select! {
                            _ = interval_timer.tick() => {},
                            Ok(()) = trigger_rx.recv() => {
                                debug!("Scheduler woken by trigger");
                            },
                        }

                        if shutdown.load(Ordering::Acquire) {
                            break;
                        }
                        run_tick(queue.as_ref());
                    }
                });
                debug!("Scheduler stopped");
            })
            .map_err(|e| WorkerError::SpawnFailed(e.to_string()))
    }

    /// Wakes the loop for an immediate tick.
    pub fn trigger(&self) {
        let _ = self.trigger_tx.send(());
    }

    /// Signals the loop to stop and wakes it so it notices.
    pub fn stop(&self) {
        self.shutdown.store(true, Ordering::Release);
        let _ = self.trigger_tx.send(());
    }
}

fn run_tick(queue: &dyn JobQueue) {
    if let Err(e) = queue.reclaim_stalled() {
        error!("Failed to reclaim stalled jobs: {}", e);
    }

    let job = match NewJob::new(JobName::ScheduleContinuousSync, &serde_json::json!({})) {
        Ok(job) => job.with_options(JobOptions::once()),
        Err(e) => {
            error!("Failed to build scheduling job: {}", e);
            return;
        }
    };
    match queue.add(job) {
        Ok(id) => info!("Queued continuous sync scheduling job {}", id),
        Err(e) => error!("Failed to queue continuous sync scheduling: {}", e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use crate::queue::{JobState, SqliteJobQueue, INGESTION_QUEUE};

    fn queue() -> SqliteJobQueue {
        SqliteJobQueue::new(Database::open_in_memory().unwrap())
    }

    #[test]
    fn test_tick_queues_scheduling_job() {
        let queue = queue();
        let scheduler = SyncScheduler::new(Arc::new(queue.clone()), Duration::from_secs(3600));
        scheduler.tick();

        let job = queue.claim(INGESTION_QUEUE).unwrap().unwrap();
        assert_eq!(job.name, JobName::ScheduleContinuousSync);
        assert_eq!(job.max_attempts, 1);
    }

    #[test]
    fn test_trigger_and_shutdown() {
        let queue = queue();
        let scheduler = SyncScheduler::new(Arc::new(queue.clone()), Duration::from_secs(3600));
        let handle = scheduler.start().unwrap();

        // The first interval tick fires immediately.
        std::thread::sleep(Duration::from_millis(100));
        scheduler.trigger();
        std::thread::sleep(Duration::from_millis(100));
        scheduler.stop();
        handle.join().expect("scheduler thread panicked");

        assert_eq!(queue.count(INGESTION_QUEUE, JobState::Waiting).unwrap(), 2);
    }
}
