//! Ingestion source repository: CRUD operations for the `ingestion_sources` table.

use rusqlite::{params, Connection, OptionalExtension, Row};

use crate::source::{ProviderKind, SourceStatus};
use crate::sync_state::SyncState;

use super::{now_rfc3339, Database, DatabaseError};

/// A stored ingestion source. `credentials` is the encrypted blob and is
/// never decrypted by this layer.
#[derive(Debug, Clone)]
pub struct IngestionSource {
    pub id: String,
    pub user_id: String,
    pub name: String,
    pub provider: ProviderKind,
    pub credentials: String,
    pub status: SourceStatus,
    pub sync_state: SyncState,
    pub last_sync_started_at: Option<String>,
    pub last_sync_finished_at: Option<String>,
    pub last_sync_status_message: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

impl IngestionSource {
    fn from_row(row: &Row<'_>) -> Result<Self, rusqlite::Error> {
        let provider: String = row.get("provider")?;
        let status: String = row.get("status")?;
        let sync_state: Option<String> = row.get("sync_state")?;

        Ok(Self {
            id: row.get("id")?,
            user_id: row.get("user_id")?,
            name: row.get("name")?,
            provider: provider
                .parse()
                .map_err(|e| conversion_error("provider", Box::new(e)))?,
            credentials: row.get("credentials")?,
            status: SourceStatus::parse(&status).ok_or_else(|| {
                conversion_error(
                    "status",
                    Box::new(DatabaseError::UnknownValue {
                        kind: "status",
                        value: status.clone(),
                    }),
                )
            })?,
            sync_state: SyncState::from_column(sync_state.as_deref())
                .map_err(|e| conversion_error("sync_state", Box::new(e)))?,
            last_sync_started_at: row.get("last_sync_started_at")?,
            last_sync_finished_at: row.get("last_sync_finished_at")?,
            last_sync_status_message: row.get("last_sync_status_message")?,
            created_at: row.get("created_at")?,
            updated_at: row.get("updated_at")?,
        })
    }

    /// Storage namespace holding every blob of this source:
    /// `{root_folder}/{name-with-dashes}-{id}/`.
    pub fn storage_prefix(&self, root_folder: &str) -> String {
        format!("{}/{}-{}/", root_folder, self.name.replace(' ', "-"), self.id)
    }
}

fn conversion_error(
    column: &str,
    err: Box<dyn std::error::Error + Send + Sync>,
) -> rusqlite::Error {
    log::error!("Invalid value in ingestion_sources.{}: {}", column, err);
    rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, err)
}

/// Partial update of a source. `None` leaves the column untouched; the
/// nested options on timestamps/message allow clearing a value.
#[derive(Debug, Default, Clone)]
pub struct SourceUpdate {
    pub name: Option<String>,
    pub credentials: Option<String>,
    pub status: Option<SourceStatus>,
    pub last_sync_started_at: Option<Option<String>>,
    pub last_sync_finished_at: Option<Option<String>>,
    pub last_sync_status_message: Option<Option<String>>,
}

impl SourceUpdate {
    pub fn status(status: SourceStatus) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.last_sync_status_message = Some(Some(message.into()));
        self
    }

    pub fn started_now(mut self) -> Self {
        self.last_sync_started_at = Some(Some(now_rfc3339()));
        self
    }

    pub fn finished_now(mut self) -> Self {
        self.last_sync_finished_at = Some(Some(now_rfc3339()));
        self
    }

    /// Names of the fields this update sets, for audit details.
    pub fn field_names(&self) -> Vec<&'static str> {
        let mut fields = Vec::new();
        if self.name.is_some() {
            fields.push("name");
        }
        if self.credentials.is_some() {
            fields.push("credentials");
        }
        if self.status.is_some() {
            fields.push("status");
        }
        if self.last_sync_started_at.is_some() {
            fields.push("lastSyncStartedAt");
        }
        if self.last_sync_finished_at.is_some() {
            fields.push("lastSyncFinishedAt");
        }
        if self.last_sync_status_message.is_some() {
            fields.push("lastSyncStatusMessage");
        }
        fields
    }
}

/// Inserts a new source row.
pub fn insert(db: &Database, source: &IngestionSource) -> Result<(), DatabaseError> {
    let sync_state = source
        .sync_state
        .to_column()
        .map_err(|e| DatabaseError::Json {
            column: "sync_state",
            source: e,
        })?;

    db.with_conn(|conn| {
        conn.execute(
            "INSERT INTO ingestion_sources (id, user_id, name, provider, credentials, status,
             sync_state, last_sync_started_at, last_sync_finished_at, last_sync_status_message,
             created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            params![
                source.id,
                source.user_id,
                source.name,
                source.provider.as_str(),
                source.credentials,
                source.status.as_str(),
                sync_state,
                source.last_sync_started_at,
                source.last_sync_finished_at,
                source.last_sync_status_message,
                source.created_at,
                source.updated_at,
            ],
        )?;
        Ok(())
    })
}

pub fn find_by_id(db: &Database, id: &str) -> Result<Option<IngestionSource>, DatabaseError> {
    db.with_conn(|conn| find_by_id_conn(conn, id))
}

fn find_by_id_conn(conn: &Connection, id: &str) -> Result<Option<IngestionSource>, DatabaseError> {
    Ok(conn
        .query_row(
            "SELECT * FROM ingestion_sources WHERE id = ?1",
            params![id],
            IngestionSource::from_row,
        )
        .optional()?)
}

/// All sources, newest first. `user_id` narrows to one owner.
pub fn find_all(db: &Database, user_id: Option<&str>) -> Result<Vec<IngestionSource>, DatabaseError> {
    db.with_conn(|conn| {
        let mut stmt = conn.prepare(
            "SELECT * FROM ingestion_sources
             WHERE (?1 IS NULL OR user_id = ?1)
             ORDER BY created_at DESC",
        )?;
        let rows = stmt
            .query_map(params![user_id], IngestionSource::from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    })
}

pub fn find_by_status(
    db: &Database,
    statuses: &[SourceStatus],
) -> Result<Vec<IngestionSource>, DatabaseError> {
    Ok(find_all(db, None)?
        .into_iter()
        .filter(|s| statuses.contains(&s.status))
        .collect())
}

/// Applies a partial update and returns `(before, after)`, read under the
/// same lock so callers can compare status transitions reliably.
pub fn update(
    db: &Database,
    id: &str,
    changes: &SourceUpdate,
) -> Result<Option<(IngestionSource, IngestionSource)>, DatabaseError> {
    db.with_transaction(|tx| {
        let Some(before) = find_by_id_conn(tx, id)? else {
            return Ok(None);
        };

        tx.execute(
            "UPDATE ingestion_sources SET
                name = COALESCE(?2, name),
                credentials = COALESCE(?3, credentials),
                status = COALESCE(?4, status),
                last_sync_started_at = CASE WHEN ?5 THEN ?6 ELSE last_sync_started_at END,
                last_sync_finished_at = CASE WHEN ?7 THEN ?8 ELSE last_sync_finished_at END,
                last_sync_status_message = CASE WHEN ?9 THEN ?10 ELSE last_sync_status_message END,
                updated_at = ?11
             WHERE id = ?1",
            params![
                id,
                changes.name,
                changes.credentials,
                changes.status.map(|s| s.as_str()),
                changes.last_sync_started_at.is_some(),
                changes.last_sync_started_at.clone().flatten(),
                changes.last_sync_finished_at.is_some(),
                changes.last_sync_finished_at.clone().flatten(),
                changes.last_sync_status_message.is_some(),
                changes.last_sync_status_message.clone().flatten(),
                now_rfc3339(),
            ],
        )?;

        let after = find_by_id_conn(tx, id)?.ok_or(DatabaseError::Sqlite(
            rusqlite::Error::QueryReturnedNoRows,
        ))?;
        Ok(Some((before, after)))
    })
}

/// Folds `update` into the stored sync state inside one transaction, so two
/// mailbox jobs finishing together both keep their entries.
pub fn merge_sync_state(db: &Database, id: &str, update: SyncState) -> Result<(), DatabaseError> {
    db.with_transaction(|tx| {
        let current: Option<Option<String>> = tx
            .query_row(
                "SELECT sync_state FROM ingestion_sources WHERE id = ?1",
                params![id],
                |r| r.get(0),
            )
            .optional()?;
        let Some(current) = current else {
            return Ok(());
        };

        let mut state =
            SyncState::from_column(current.as_deref()).map_err(|e| DatabaseError::Json {
                column: "sync_state",
                source: e,
            })?;
        state.merge(update);
        let encoded = state.to_column().map_err(|e| DatabaseError::Json {
            column: "sync_state",
            source: e,
        })?;

        tx.execute(
            "UPDATE ingestion_sources SET sync_state = ?2, updated_at = ?3 WHERE id = ?1",
            params![id, encoded, now_rfc3339()],
        )?;
        Ok(())
    })
}

/// Deletes the source row; emails, attachments and jobs cascade.
pub fn delete(db: &Database, id: &str) -> Result<Option<IngestionSource>, DatabaseError> {
    db.with_transaction(|tx| {
        let existing = find_by_id_conn(tx, id)?;
        if existing.is_some() {
            tx.execute("DELETE FROM ingestion_sources WHERE id = ?1", params![id])?;
        }
        Ok(existing)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync_state::UidCursor;
    use std::collections::BTreeMap;

    fn test_db() -> Database {
        Database::open_in_memory().expect("Failed to create test database")
    }

    fn sample_source(id: &str) -> IngestionSource {
        let now = now_rfc3339();
        IngestionSource {
            id: id.to_string(),
            user_id: "user-1".to_string(),
            name: "Team Inbox".to_string(),
            provider: ProviderKind::GenericImap,
            credentials: "deadbeef".to_string(),
            status: SourceStatus::PendingAuth,
            sync_state: SyncState::Empty,
            last_sync_started_at: None,
            last_sync_finished_at: None,
            last_sync_status_message: None,
            created_at: now.clone(),
            updated_at: now,
        }
    }

    #[test]
    fn test_insert_and_find() {
        let db = test_db();
        insert(&db, &sample_source("s1")).unwrap();

        let found = find_by_id(&db, "s1").unwrap().unwrap();
        assert_eq!(found.name, "Team Inbox");
        assert_eq!(found.provider, ProviderKind::GenericImap);
        assert_eq!(found.status, SourceStatus::PendingAuth);
        assert_eq!(found.sync_state, SyncState::Empty);
        assert!(find_by_id(&db, "missing").unwrap().is_none());
    }

    #[test]
    fn test_update_returns_before_and_after() {
        let db = test_db();
        insert(&db, &sample_source("s1")).unwrap();

        let (before, after) = update(
            &db,
            "s1",
            &SourceUpdate::status(SourceStatus::AuthSuccess).with_message("ok"),
        )
        .unwrap()
        .unwrap();
        assert_eq!(before.status, SourceStatus::PendingAuth);
        assert_eq!(after.status, SourceStatus::AuthSuccess);
        assert_eq!(after.last_sync_status_message.as_deref(), Some("ok"));
        assert_eq!(after.name, "Team Inbox");
    }

    #[test]
    fn test_update_can_clear_message() {
        let db = test_db();
        insert(&db, &sample_source("s1")).unwrap();
        update(&db, "s1", &SourceUpdate::default().with_message("x")).unwrap();

        let clear = SourceUpdate {
            last_sync_status_message: Some(None),
            ..Default::default()
        };
        let (_, after) = update(&db, "s1", &clear).unwrap().unwrap();
        assert!(after.last_sync_status_message.is_none());
    }

    #[test]
    fn test_update_missing_source() {
        let db = test_db();
        assert!(update(&db, "nope", &SourceUpdate::default()).unwrap().is_none());
    }

    #[test]
    fn test_merge_sync_state_accumulates() {
        let db = test_db();
        insert(&db, &sample_source("s1")).unwrap();

        let cursor = |max| UidCursor {
            uid_validity: 1,
            max_uid: max,
        };
        merge_sync_state(
            &db,
            "s1",
            SyncState::Imap(BTreeMap::from([("INBOX".to_string(), cursor(3))])),
        )
        .unwrap();
        merge_sync_state(
            &db,
            "s1",
            SyncState::Imap(BTreeMap::from([("Sent".to_string(), cursor(9))])),
        )
        .unwrap();

        let state = find_by_id(&db, "s1").unwrap().unwrap().sync_state;
        let cursors = state.imap_cursors().unwrap();
        assert_eq!(cursors.len(), 2);
        assert_eq!(cursors["Sent"].max_uid, 9);
    }

    #[test]
    fn test_find_all_filters_by_owner() {
        let db = test_db();
        insert(&db, &sample_source("s1")).unwrap();
        let mut other = sample_source("s2");
        other.user_id = "user-2".to_string();
        insert(&db, &other).unwrap();

        assert_eq!(find_all(&db, None).unwrap().len(), 2);
        let mine = find_all(&db, Some("user-2")).unwrap();
        assert_eq!(mine.len(), 1);
        assert_eq!(mine[0].id, "s2");
    }

    #[test]
    fn test_storage_prefix_dashes_name() {
        let source = sample_source("abc");
        assert_eq!(source.storage_prefix("archive"), "archive/Team-Inbox-abc/");
    }

    #[test]
    fn test_delete_returns_row() {
        let db = test_db();
        insert(&db, &sample_source("s1")).unwrap();
        assert!(delete(&db, "s1").unwrap().is_some());
        assert!(find_by_id(&db, "s1").unwrap().is_none());
        assert!(delete(&db, "s1").unwrap().is_none());
    }
}
