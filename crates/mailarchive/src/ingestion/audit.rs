//! Audit trail for user-driven source changes. Recording is best-effort:
//! a sink that cannot write logs the failure and the operation goes on.

use log::warn;
use serde_json::Value;

use crate::db::{audit_repo, Database};

/// Who performed an operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Actor {
    pub id: String,
    pub ip: Option<String>,
}

impl Actor {
    pub fn new(id: impl Into<String>, ip: Option<String>) -> Self {
        Self { id: id.into(), ip }
    }

    /// Background work with no user behind it.
    pub fn system() -> Self {
        Self::new("system", None)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuditAction {
    Create,
    Update,
    Delete,
    Sync,
}

impl AuditAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditAction::Create => "CREATE",
            AuditAction::Update => "UPDATE",
            AuditAction::Delete => "DELETE",
            AuditAction::Sync => "SYNC",
        }
    }
}

#[derive(Debug, Clone)]
pub struct AuditEntry {
    pub actor_id: String,
    pub action_type: AuditAction,
    pub target_type: &'static str,
    pub target_id: String,
    pub actor_ip: Option<String>,
    pub details: Value,
}

impl AuditEntry {
    /// An entry about an ingestion source.
    pub fn source(actor: &Actor, action: AuditAction, source_id: &str, details: Value) -> Self {
        Self {
            actor_id: actor.id.clone(),
            action_type: action,
            target_type: "IngestionSource",
            target_id: source_id.to_string(),
            actor_ip: actor.ip.clone(),
            details,
        }
    }
}

pub trait AuditSink: Send + Sync {
    fn record(&self, entry: AuditEntry);
}

/// Writes entries to the `audit_log` table.
pub struct DbAuditSink {
    db: Database,
}

impl DbAuditSink {
    pub fn new(db: Database) -> Self {
        Self { db }
    }
}

impl AuditSink for DbAuditSink {
    fn record(&self, entry: AuditEntry) {
        if let Err(e) = audit_repo::insert(
            &self.db,
            &entry.actor_id,
            entry.action_type.as_str(),
            entry.target_type,
            &entry.target_id,
            entry.actor_ip.as_deref(),
            &entry.details,
        ) {
            warn!(
                "Failed to record {} audit entry for {}: {}",
                entry.action_type.as_str(),
                entry.target_id,
                e
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn test_db_sink_writes_rows() {
        let db = Database::open_in_memory().unwrap();
        let sink = DbAuditSink::new(db.clone());
        let actor = Actor::new("admin", Some("10.0.0.1".into()));
        sink.record(AuditEntry::source(
            &actor,
            AuditAction::Sync,
            "src-1",
            json!({"sourceName": "Team"}),
        ));

        let rows = audit_repo::find_by_target(&db, "src-1").unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].action_type, "SYNC");
        assert_eq!(rows[0].target_type, "IngestionSource");
        assert_eq!(rows[0].actor_ip.as_deref(), Some("10.0.0.1"));
        assert_eq!(rows[0].details["sourceName"], "Team");
    }

    #[test]
    fn test_system_actor() {
        let actor = Actor::system();
        assert_eq!(actor.id, "system");
        assert!(actor.ip.is_none());
    }
}
