//! Ingestion orchestration errors.

use thiserror::Error;

use crate::connector::ConnectorError;
use crate::crypto::CryptoError;
use crate::db::DatabaseError;
use crate::error::{ProcessError, StorageError};
use crate::queue::QueueError;
use crate::source::SourceStatus;

use super::search::SearchError;

#[derive(Error, Debug)]
pub enum IngestionError {
    #[error("Ingestion source not found: {0}")]
    NotFound(String),

    #[error("Deletion is disabled on this instance")]
    DeletionDisabled,

    #[error("Ingestion authentication failed.")]
    ConnectionTestFailed,

    #[error("Cannot move source from '{from}' to '{to}'")]
    InvalidTransition {
        from: SourceStatus,
        to: SourceStatus,
    },

    #[error(transparent)]
    Connector(#[from] ConnectorError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("Failed to decrypt or encrypt credentials: {0}")]
    Crypto(#[from] CryptoError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Process(#[from] ProcessError),

    #[error("Search index error: {0}")]
    Search(#[from] SearchError),
}

pub type Result<T> = std::result::Result<T, IngestionError>;
