use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TrySendError};
use log::{debug, error, info, warn};
use tokio::runtime::Runtime;
use tracing::{info_span, Instrument};

use crate::error::WorkerError;
use crate::ingestion::IngestionService;
use crate::queue::{FailRecord, Job, JobId, JobName, JobQueue, INDEXING_QUEUE, INGESTION_QUEUE};

#[derive(Debug, Clone)]
pub struct WorkerPoolConfig {
    pub worker_count: usize,
    /// How long an idle worker sleeps before polling again.
    pub poll_interval: Duration,
    /// Queues each worker polls, in priority order.
    pub queues: Vec<String>,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            worker_count: num_cpus::get().max(1),
            poll_interval: Duration::from_millis(500),
            queues: vec![INGESTION_QUEUE.to_string(), INDEXING_QUEUE.to_string()],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    Completed,
    Retrying { run_at: String },
    Failed(String),
}

/// What a worker did with one job.
#[derive(Debug, Clone)]
pub struct JobReport {
    pub worker_id: usize,
    pub job_id: JobId,
    pub name: JobName,
    pub outcome: JobOutcome,
}

/// Keeps `job_id`'s lock alive while `work` runs, renewing it every third
/// of the queue's lock duration so `reclaim_stalled` never sees a running
/// job as stalled.
pub(crate) async fn with_heartbeat<F: Future>(
    queue: &dyn JobQueue,
    job_id: JobId,
    work: F,
) -> F::Output {
    let period = (queue.lock_duration() / 3).max(Duration::from_millis(1));
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
    tokio::pin!(work);
    loop {
        tokio::select! {
            output = &mut work => return output,
            _ = ticker.tick() => match queue.extend_lock(job_id) {
                Ok(true) => debug!("Renewed lock of job {}", job_id),
                Ok(false) => warn!("Job {} is no longer active while still running", job_id),
                Err(e) => warn!("Failed to renew lock of job {}: {}", job_id, e),
            },
        }
    }
}

pub struct WorkerPool {
    report_receiver: Receiver<JobReport>,
    workers: Vec<JoinHandle<()>>,
    shutdown: Arc<AtomicBool>,
}

struct Worker {
    id: usize,
    runtime: Runtime,
    service: Arc<IngestionService>,
    queue: Arc<dyn JobQueue>,
    config: Arc<WorkerPoolConfig>,
    reports: Sender<JobReport>,
    shutdown: Arc<AtomicBool>,
}

impl WorkerPool {
    /// Starts `config.worker_count` threads, each driving its own
    /// single-threaded runtime.
    pub fn start(
        service: Arc<IngestionService>,
        queue: Arc<dyn JobQueue>,
        config: WorkerPoolConfig,
    ) -> Result<Self, WorkerError> {
        let worker_count = config.worker_count.max(1);
        let (report_sender, report_receiver) = bounded::<JobReport>(worker_count * 16);
        let shutdown = Arc::new(AtomicBool::new(false));
        let config = Arc::new(config);

        let mut workers = Vec::with_capacity(worker_count);
        for worker_id in 0..worker_count {
            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .map_err(|e| WorkerError::Runtime(e.to_string()))?;
            let worker = Worker {
                id: worker_id,
                runtime,
                service: Arc::clone(&service),
                queue: Arc::clone(&queue),
                config: Arc::clone(&config),
                reports: report_sender.clone(),
                shutdown: Arc::clone(&shutdown),
            };

            let handle = thread::Builder::new()
                .name(format!("mailarchive-worker-{}", worker_id))
                .spawn(move || worker.run())
                .map_err(|e| WorkerError::SpawnFailed(e.to_string()))?;
            workers.push(handle);
        }

        info!(
            "Started {} workers on queues {:?}",
            worker_count, config.queues
        );

        Ok(Self {
            report_receiver,
            workers,
            shutdown,
        })
    }

    pub fn try_recv_report(&self) -> Option<JobReport> {
        self.report_receiver.try_recv().ok()
    }

    pub fn recv_report_timeout(&self, timeout: Duration) -> Option<JobReport> {
        self.report_receiver.recv_timeout(timeout).ok()
    }

    /// Asks every worker to stop after its current job.
    pub fn shutdown(&self) {
        info!("Shutting down worker pool...");
        self.shutdown.store(true, Ordering::Release);
    }

    pub fn wait(self) {
        for (i, worker) in self.workers.into_iter().enumerate() {
            if let Err(e) = worker.join() {
                error!("Worker {} panicked: {:?}", i, e);
            } else {
                debug!("Worker {} finished", i);
            }
        }
        info!("All workers have stopped");
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }
}

impl Worker {
    fn run(self) {
        debug!("Worker {} started", self.id);

        while !self.shutdown.load(Ordering::Acquire) {
            match self.claim() {
                Some(job) => self.execute(job),
                None => thread::sleep(self.config.poll_interval),
            }
        }

        debug!("Worker {} stopped", self.id);
    }

    fn claim(&self) -> Option<Job> {
        for queue in &self.config.queues {
            match self.queue.claim(queue) {
                Ok(Some(job)) => return Some(job),
                Ok(None) => {}
                Err(e) => error!("Worker {} failed to poll {}: {}", self.id, queue, e),
            }
        }
        None
    }

    fn execute(&self, job: Job) {
        let span = info_span!(
            "job",
            id = job.id,
            name = %job.name,
            source = job.source_id.as_deref().unwrap_or(""),
            attempt = job.attempts_made,
        );
        debug!("Worker {} running {} job {}", self.id, job.name, job.id);

        let work = self.service.handle_job(&job).instrument(span);
        let result = self
            .runtime
            .block_on(with_heartbeat(self.queue.as_ref(), job.id, work));

        let outcome = match result {
            Ok(value) => match self.queue.complete(job.id, value.as_ref()) {
                Ok(true) => JobOutcome::Completed,
                Ok(false) => {
                    warn!("Job {} was no longer active when it completed", job.id);
                    JobOutcome::Completed
                }
                Err(e) => {
                    error!("Failed to record completion of job {}: {}", job.id, e);
                    return;
                }
            },
            Err(e) => {
                let reason = e.to_string();
                warn!("{} job {} failed: {}", job.name, job.id, reason);
                match self.queue.fail(job.id, &reason) {
                    Ok(FailRecord::Retrying { run_at }) => JobOutcome::Retrying { run_at },
                    Ok(_) => JobOutcome::Failed(reason),
                    Err(e) => {
                        error!("Failed to record failure of job {}: {}", job.id, e);
                        return;
                    }
                }
            }
        };

        let report = JobReport {
            worker_id: self.id,
            job_id: job.id,
            name: job.name,
            outcome,
        };
        if let Err(TrySendError::Full(report)) = self.reports.try_send(report) {
            debug!("Report channel full; dropping report for job {}", report.job_id);
        }
    }
}
