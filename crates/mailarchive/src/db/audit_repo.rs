//! Audit log repository: append-only rows for source lifecycle actions.

use rusqlite::{params, Row};

use super::{now_rfc3339, Database, DatabaseError};

#[derive(Debug, Clone)]
pub struct AuditRow {
    pub id: i64,
    pub actor_id: String,
    pub action_type: String,
    pub target_type: String,
    pub target_id: String,
    pub actor_ip: Option<String>,
    pub details: serde_json::Value,
    pub created_at: String,
}

impl AuditRow {
    fn from_row(row: &Row<'_>) -> Result<Self, rusqlite::Error> {
        let details: String = row.get("details")?;
        Ok(Self {
            id: row.get("id")?,
            actor_id: row.get("actor_id")?,
            action_type: row.get("action_type")?,
            target_type: row.get("target_type")?,
            target_id: row.get("target_id")?,
            actor_ip: row.get("actor_ip")?,
            details: serde_json::from_str(&details).map_err(|e| {
                rusqlite::Error::FromSqlConversionFailure(
                    0,
                    rusqlite::types::Type::Text,
                    Box::new(e),
                )
            })?,
            created_at: row.get("created_at")?,
        })
    }
}

pub fn insert(
    db: &Database,
    actor_id: &str,
    action_type: &str,
    target_type: &str,
    target_id: &str,
    actor_ip: Option<&str>,
    details: &serde_json::Value,
) -> Result<i64, DatabaseError> {
    db.with_conn(|conn| {
        conn.execute(
            "INSERT INTO audit_log (actor_id, action_type, target_type, target_id, actor_ip, details, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                actor_id,
                action_type,
                target_type,
                target_id,
                actor_ip,
                details.to_string(),
                now_rfc3339(),
            ],
        )?;
        Ok(conn.last_insert_rowid())
    })
}

pub fn find_by_target(db: &Database, target_id: &str) -> Result<Vec<AuditRow>, DatabaseError> {
    db.with_conn(|conn| {
        let mut stmt =
            conn.prepare("SELECT * FROM audit_log WHERE target_id = ?1 ORDER BY id")?;
        let rows = stmt
            .query_map(params![target_id], AuditRow::from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    })
}
