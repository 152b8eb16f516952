//! Email archiving ingestion: provider connectors, a durable job queue and
//! deduplicated blob storage.

pub mod config;
pub mod connector;
pub mod crypto;
pub mod db;
pub mod error;
pub mod factory;
pub mod ingestion;
pub mod oauth;
pub mod processor;
pub mod queue;
pub mod retry;
pub mod scheduler;
pub mod secrets;
pub mod source;
pub mod storage;
pub mod sync_state;
pub mod telemetry;
pub mod worker;

pub use config::{load_config, AppConfig};
pub use connector::{EmailConnector, EmailObject, MailboxUser};
pub use error::{ConfigError, MailArchiveError, ProcessError, Result, StorageError, WorkerError};
pub use ingestion::{Actor, IngestionService};
pub use queue::{JobQueue, SqliteJobQueue};
pub use secrets::{resolve_secret, SecretError, SecretSource};
pub use source::{ProviderKind, SourceStatus};
pub use sync_state::SyncState;
