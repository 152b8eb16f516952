//! Queue error types.

use thiserror::Error;

use crate::db::DatabaseError;

#[derive(Error, Debug)]
pub enum QueueError {
    #[error("Queue storage error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Invalid job payload for '{name}': {source}")]
    Payload {
        name: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("Unknown job name '{0}'")]
    UnknownJobName(String),

    #[error("Unknown job state '{0}'")]
    UnknownState(String),
}

pub type Result<T> = std::result::Result<T, QueueError>;
