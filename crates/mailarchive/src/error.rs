//! Crate-wide error types. Each subsystem keeps its own enum; the
//! top-level [`MailArchiveError`] only aggregates them for the binary.

use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum MailArchiveError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Worker error: {0}")]
    Worker(#[from] WorkerError),

    #[error("Database error: {0}")]
    Database(#[from] crate::db::DatabaseError),

    #[error("Queue error: {0}")]
    Queue(#[from] crate::queue::QueueError),

    #[error("Connector error: {0}")]
    Connector(#[from] crate::connector::ConnectorError),

    #[error("Ingestion error: {0}")]
    Ingestion(#[from] crate::ingestion::IngestionError),

    #[error("Secret error: {0}")]
    Secret(#[from] crate::secrets::SecretError),

    #[error("Credential encryption error: {0}")]
    Crypto(#[from] crate::crypto::CryptoError),

    #[error("Processing error: {0}")]
    Process(#[from] ProcessError),

    #[error("Logging error: {0}")]
    Logging(#[from] crate::telemetry::LoggingError),
}

/// Loading or validating `config.yaml`.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file '{path}': {source}")]
    ReadFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config JSON: {0}")]
    ParseJson(#[from] serde_json::Error),

    #[error("Failed to parse config YAML: {0}")]
    ParseYaml(#[from] serde_yaml::Error),

    #[error("Config validation failed: {message}")]
    Validation { message: String },

    #[error("Schema validation failed: {errors}")]
    SchemaValidation { errors: String },

    #[error("Secret for '{field}' could not be resolved: {source}")]
    Secret {
        field: &'static str,
        #[source]
        source: crate::secrets::SecretError,
    },
}

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Failed to create directory '{path}': {source}")]
    CreateDirectory {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to write file '{path}': {source}")]
    WriteFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to read file '{path}': {source}")]
    ReadFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to delete '{path}': {source}")]
    Delete {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid storage path '{0}'")]
    InvalidPath(String),

    #[error("Object not found: {0}")]
    NotFound(String),
}

/// Failures while archiving a mailbox.
#[derive(Error, Debug)]
pub enum ProcessError {
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Database error: {0}")]
    Database(#[from] crate::db::DatabaseError),

    #[error("Connector error: {0}")]
    Connector(#[from] crate::connector::ConnectorError),

    #[error("Failed to enqueue indexing: {0}")]
    Queue(#[from] crate::queue::QueueError),
}

/// Starting worker threads or the scheduler.
#[derive(Error, Debug)]
pub enum WorkerError {
    #[error("Failed to spawn worker: {0}")]
    SpawnFailed(String),

    #[error("Failed to build async runtime: {0}")]
    Runtime(String),
}

pub type Result<T> = std::result::Result<T, MailArchiveError>;
