//! Job payloads. Field names are camelCase on the wire.

use serde::{Deserialize, Serialize};

/// `initial-import`, `continuous-sync`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceJob {
    pub ingestion_source_id: String,
}

/// `process-mailbox`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MailboxJob {
    pub ingestion_source_id: String,
    pub user_email: String,
}

/// `sync-cycle-finished`, the fan-in parent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CycleFinishedJob {
    pub ingestion_source_id: String,
    pub user_count: usize,
    pub is_initial_import: bool,
}

/// `index-email-batch`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexBatchJob {
    pub emails: Vec<String>,
}

/// Stored as the result of a completed `process-mailbox` job and read back
/// by the fan-in.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MailboxJobResult {
    pub user_email: String,
    pub processed: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_message: Option<String>,
}
