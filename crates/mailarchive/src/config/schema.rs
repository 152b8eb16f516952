use serde::{Deserialize, Serialize};

use crate::secrets::SecretSource;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub version: String,
    /// SQLite file. Defaults to `~/.mailarchive/data/mailarchive.db`.
    #[serde(default)]
    pub database_path: Option<String>,
    pub storage: StorageConfig,
    #[serde(default)]
    pub workers: WorkersConfig,
    #[serde(default)]
    pub sync: SyncConfig,
    #[serde(default)]
    pub ingestion: IngestionSettings,
    /// 64 hex characters used to encrypt stored credentials.
    pub encryption_key: SecretSource,
    #[serde(default)]
    pub logging: LoggingConfig,
    /// App registration for Outlook.com accounts. Personal sources are
    /// unavailable without it.
    #[serde(default)]
    pub outlook: Option<OutlookConfig>,
    #[serde(default)]
    pub readpst_path: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Local directory backing the blob store.
    pub root: String,
    /// Folder under the root that holds every source's blobs.
    #[serde(default = "default_archive_folder")]
    pub opened_emails_folder: String,
}

fn default_archive_folder() -> String {
    "mail-archive".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkersConfig {
    #[serde(default = "default_worker_count")]
    pub count: usize,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// How long a claimed job may run before it counts as stalled.
    #[serde(default = "default_lock_duration_secs")]
    pub lock_duration_secs: u64,
}

fn default_worker_count() -> usize {
    num_cpus::get()
}

fn default_poll_interval_ms() -> u64 {
    500
}

fn default_lock_duration_secs() -> u64 {
    30 * 60
}

impl Default for WorkersConfig {
    fn default() -> Self {
        Self {
            count: default_worker_count(),
            poll_interval_ms: default_poll_interval_ms(),
            lock_duration_secs: default_lock_duration_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    #[serde(default = "default_sync_interval_secs")]
    pub interval_secs: u64,
}

fn default_sync_interval_secs() -> u64 {
    5 * 60
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_sync_interval_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestionSettings {
    #[serde(default)]
    pub deletion_disabled: bool,
    #[serde(default = "default_index_batch_size")]
    pub index_batch_size: usize,
}

fn default_index_batch_size() -> usize {
    crate::processor::DEFAULT_INDEX_BATCH_SIZE
}

impl Default for IngestionSettings {
    fn default() -> Self {
        Self {
            deletion_disabled: false,
            index_batch_size: default_index_batch_size(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// An `EnvFilter` directive such as `info` or `mailarchive=debug`.
    /// `RUST_LOG` takes precedence.
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub format: LogFormat,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::Text,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutlookConfig {
    pub client_id: String,
    pub client_secret: SecretSource,
    pub redirect_uri: String,
}
