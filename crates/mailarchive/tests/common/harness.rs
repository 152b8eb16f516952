//! Test harness for isolated ingestion runs.
//!
//! The `TestHarness` wires a real `IngestionService` over an in-memory
//! database, a `LocalStorage` rooted in a temp directory and the fake
//! provider, and drains the queue the way a worker would.

#![allow(dead_code)]

use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use tempfile::TempDir;

use mailarchive::crypto::CredentialCipher;
use mailarchive::db::email_repo::{self, ArchivedEmail};
use mailarchive::db::source_repo::IngestionSource;
use mailarchive::db::Database;
use mailarchive::factory::ProviderCredentials;
use mailarchive::ingestion::{
    Actor, AuditEntry, AuditSink, IngestionConfig, IngestionService, NewSource, SearchError,
    SearchIndex,
};
use mailarchive::queue::{JobName, JobQueue, SqliteJobQueue, INDEXING_QUEUE, INGESTION_QUEUE};
use mailarchive::storage::{LocalStorage, StorageService};

use super::fake::{FakeFactory, FakeProvider};

pub const TEST_KEY: &str = "000102030405060708090a0b0c0d0e0f101112131415161718191a1b1c1d1e1f";

#[derive(Default)]
pub struct MemoryAuditSink {
    pub entries: Mutex<Vec<AuditEntry>>,
}

impl AuditSink for MemoryAuditSink {
    fn record(&self, entry: AuditEntry) {
        self.entries.lock().expect("audit sink poisoned").push(entry);
    }
}

#[derive(Default)]
pub struct RecordingSearchIndex {
    pub indexed: Mutex<Vec<String>>,
    pub deleted_sources: Mutex<Vec<String>>,
}

#[async_trait]
impl SearchIndex for RecordingSearchIndex {
    async fn index_emails(&self, email_ids: &[String]) -> Result<(), SearchError> {
        self.indexed
            .lock()
            .expect("search index poisoned")
            .extend_from_slice(email_ids);
        Ok(())
    }

    async fn delete_by_source(&self, source_id: &str) -> Result<(), SearchError> {
        self.deleted_sources
            .lock()
            .expect("search index poisoned")
            .push(source_id.to_string());
        Ok(())
    }
}

/// One executed job.
#[derive(Debug, Clone)]
pub struct RanJob {
    pub name: JobName,
    pub error: Option<String>,
}

pub struct TestHarness {
    temp_dir: TempDir,
    pub db: Database,
    pub queue: Arc<SqliteJobQueue>,
    pub storage: Arc<LocalStorage>,
    pub provider: Arc<Mutex<FakeProvider>>,
    pub audit: Arc<MemoryAuditSink>,
    pub search: Arc<RecordingSearchIndex>,
    pub service: IngestionService,
    pub actor: Actor,
}

impl TestHarness {
    pub fn new() -> Self {
        Self::with_config(IngestionConfig::default())
    }

    pub fn with_config(config: IngestionConfig) -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        let db = Database::open_in_memory().expect("Failed to open database");
        let queue = Arc::new(SqliteJobQueue::new(db.clone()));
        let storage = Arc::new(LocalStorage::new(temp_dir.path()));
        let provider = Arc::new(Mutex::new(FakeProvider::default()));
        let audit = Arc::new(MemoryAuditSink::default());
        let search = Arc::new(RecordingSearchIndex::default());

        let service = IngestionService::new(
            db.clone(),
            Arc::clone(&queue) as Arc<dyn JobQueue>,
            Arc::clone(&storage) as Arc<dyn StorageService>,
            Arc::new(CredentialCipher::from_hex_key(TEST_KEY).expect("test key")),
            Arc::new(FakeFactory {
                provider: Arc::clone(&provider),
            }),
            Arc::clone(&audit) as Arc<dyn AuditSink>,
            Arc::clone(&search) as Arc<dyn SearchIndex>,
            config,
        );

        Self {
            temp_dir,
            db,
            queue,
            storage,
            provider,
            audit,
            search,
            service,
            actor: Actor::new("user-1", Some("203.0.113.9".to_string())),
        }
    }

    pub fn root(&self) -> &Path {
        self.temp_dir.path()
    }

    pub fn provider(&self) -> MutexGuard<'_, FakeProvider> {
        self.provider.lock().expect("fake provider poisoned")
    }

    pub async fn create_source(&self, name: &str, credentials: ProviderCredentials) -> IngestionSource {
        self.service
            .create(
                NewSource {
                    user_id: self.actor.id.clone(),
                    name: name.to_string(),
                    credentials,
                },
                &self.actor,
            )
            .await
            .expect("Failed to create source")
    }

    /// Claims and runs one job, ingestion before indexing.
    pub async fn run_next(&self) -> Option<RanJob> {
        let job = match self.queue.claim(INGESTION_QUEUE).expect("claim") {
            Some(job) => job,
            None => self.queue.claim(INDEXING_QUEUE).expect("claim")?,
        };
        match self.service.handle_job(&job).await {
            Ok(value) => {
                self.queue.complete(job.id, value.as_ref()).expect("complete");
                Some(RanJob {
                    name: job.name,
                    error: None,
                })
            }
            Err(e) => {
                let reason = e.to_string();
                self.queue.fail(job.id, &reason).expect("fail");
                Some(RanJob {
                    name: job.name,
                    error: Some(reason),
                })
            }
        }
    }

    /// Runs jobs until both queues are idle. Retries scheduled in the
    /// future are left alone.
    pub async fn run_jobs(&self) -> Vec<RanJob> {
        let mut ran = Vec::new();
        for _ in 0..1_000 {
            match self.run_next().await {
                Some(job) => ran.push(job),
                None => return ran,
            }
        }
        panic!("queue did not drain after 1000 jobs");
    }

    pub fn source(&self, id: &str) -> IngestionSource {
        self.service.find_by_id(id).expect("source exists")
    }

    pub fn archived(&self, source_id: &str) -> Vec<ArchivedEmail> {
        email_repo::find_by_source(&self.db, source_id).expect("find emails")
    }

    /// Number of files stored under `prefix`.
    pub fn blob_count(&self, prefix: &str) -> usize {
        let dir = self.root().join(prefix);
        if !dir.exists() {
            return 0;
        }
        walkdir::WalkDir::new(dir)
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file())
            .count()
    }
}
