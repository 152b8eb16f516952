//! Runs the ingestion workers and the sync scheduler until interrupted.
//!
//! Usage: `mailarchive-worker [CONFIG]`. Without an argument the config is
//! read from `$MAILARCHIVE_CONFIG`, then `~/.mailarchive/config.yaml`.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::{bounded, RecvTimeoutError};
use log::{debug, error, info, warn};

use mailarchive::config::{load_config, AppConfig};
use mailarchive::crypto::CredentialCipher;
use mailarchive::db::Database;
use mailarchive::error::{ConfigError, MailArchiveError, Result, WorkerError};
use mailarchive::factory::{FactoryContext, ProviderConnectorFactory};
use mailarchive::ingestion::{DbAuditSink, IngestionConfig, IngestionService, NoopSearchIndex};
use mailarchive::queue::{JobQueue, SqliteJobQueue};
use mailarchive::scheduler::SyncScheduler;
use mailarchive::storage::{LocalStorage, StorageService};
use mailarchive::telemetry::init_logging;
use mailarchive::worker::{JobOutcome, WorkerPool, WorkerPoolConfig};

fn config_path() -> Option<PathBuf> {
    if let Some(arg) = std::env::args_os().nth(1) {
        return Some(PathBuf::from(arg));
    }
    if let Some(env) = std::env::var_os("MAILARCHIVE_CONFIG") {
        return Some(PathBuf::from(env));
    }
    dirs::home_dir().map(|h| h.join(".mailarchive").join("config.yaml"))
}

fn build_service(config: &AppConfig, queue: Arc<dyn JobQueue>, db: Database) -> Result<IngestionService> {
    let storage: Arc<dyn StorageService> = Arc::new(LocalStorage::new(config.storage_root()));
    let cipher = CredentialCipher::from_secret(&config.encryption_key()?)?;

    let mut ctx = FactoryContext::new(Arc::clone(&storage));
    ctx.outlook_app = config.outlook_app()?;
    ctx.readpst_bin = config.readpst_bin();

    Ok(IngestionService::new(
        db.clone(),
        queue,
        storage,
        Arc::new(cipher),
        Arc::new(ProviderConnectorFactory::new(ctx)),
        Arc::new(DbAuditSink::new(db)),
        Arc::new(NoopSearchIndex),
        IngestionConfig {
            root_folder: config.storage.opened_emails_folder.clone(),
            deletion_disabled: config.ingestion.deletion_disabled,
            index_batch_size: config.ingestion.index_batch_size,
        },
    ))
}

fn run(config: AppConfig) -> Result<()> {
    let db_path = config.database_path().ok_or_else(|| ConfigError::Validation {
        message: "database_path is not set and no home directory was found".to_string(),
    })?;
    let db = Database::open(&db_path)?;

    let queue: Arc<dyn JobQueue> = Arc::new(
        SqliteJobQueue::new(db.clone())
            .with_lock_duration(Duration::from_secs(config.workers.lock_duration_secs)),
    );
    let service = Arc::new(build_service(&config, Arc::clone(&queue), db)?);

    let pool = WorkerPool::start(
        service,
        Arc::clone(&queue),
        WorkerPoolConfig {
            worker_count: config.workers.count,
            poll_interval: Duration::from_millis(config.workers.poll_interval_ms),
            ..WorkerPoolConfig::default()
        },
    )?;

    let scheduler = SyncScheduler::new(queue, Duration::from_secs(config.sync.interval_secs));
    let scheduler_handle = scheduler.start()?;

    let (shutdown_tx, shutdown_rx) = bounded::<()>(1);
    ctrlc::set_handler(move || {
        let _ = shutdown_tx.try_send(());
    })
    .map_err(|e| MailArchiveError::Worker(WorkerError::SpawnFailed(e.to_string())))?;

    info!("mailarchive worker running; press Ctrl-C to stop");
    loop {
        match shutdown_rx.recv_timeout(Duration::from_secs(1)) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
            Err(RecvTimeoutError::Timeout) => {}
        }
        while let Some(report) = pool.try_recv_report() {
            match report.outcome {
                JobOutcome::Completed => debug!("{} job {} completed", report.name, report.job_id),
                JobOutcome::Retrying { run_at } => {
                    debug!("{} job {} retries at {}", report.name, report.job_id, run_at)
                }
                JobOutcome::Failed(reason) => {
                    warn!("{} job {} failed: {}", report.name, report.job_id, reason)
                }
            }
        }
    }

    info!("Shutdown requested");
    scheduler.stop();
    if scheduler_handle.join().is_err() {
        error!("Scheduler thread panicked");
    }
    pool.shutdown();
    pool.wait();
    Ok(())
}

fn main() -> ExitCode {
    let Some(path) = config_path() else {
        eprintln!("No config path given and no home directory found");
        return ExitCode::FAILURE;
    };
    let config = match load_config(&path) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Failed to load {}: {}", path.display(), e);
            return ExitCode::FAILURE;
        }
    };
    if let Err(e) = init_logging(&config.logging) {
        eprintln!("Failed to initialize logging: {}", e);
        return ExitCode::FAILURE;
    }

    info!("Starting mailarchive worker v{}", env!("CARGO_PKG_VERSION"));
    match run(config) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{}", e);
            ExitCode::FAILURE
        }
    }
}
