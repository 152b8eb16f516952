//! Archived email repository: CRUD operations for the `archived_emails` table.

use rusqlite::{params, OptionalExtension, Row};
use serde::{Deserialize, Serialize};

use crate::connector::EmailAddress;

use super::{now_rfc3339, Database, DatabaseError};

/// Recipient summary stored as JSON on each archived email.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Recipients {
    pub to: Vec<EmailAddress>,
    pub cc: Vec<EmailAddress>,
    pub bcc: Vec<EmailAddress>,
}

/// An archived email row.
#[derive(Debug, Clone)]
pub struct ArchivedEmail {
    pub id: String,
    pub ingestion_source_id: String,
    pub user_email: String,
    pub message_id_header: String,
    pub thread_id: Option<String>,
    pub sent_at: String,
    pub subject: Option<String>,
    pub sender_name: Option<String>,
    pub sender_email: String,
    pub recipients: Recipients,
    pub storage_path: String,
    pub storage_hash_sha256: String,
    pub size_bytes: i64,
    pub path: Option<String>,
    pub tags: Vec<String>,
    pub has_attachments: bool,
    pub is_indexed: bool,
    pub archived_at: String,
}

impl ArchivedEmail {
    fn from_row(row: &Row<'_>) -> Result<Self, rusqlite::Error> {
        let recipients: String = row.get("recipients")?;
        let tags: String = row.get("tags")?;
        let json_err = |e: serde_json::Error| {
            rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
        };

        Ok(Self {
            id: row.get("id")?,
            ingestion_source_id: row.get("ingestion_source_id")?,
            user_email: row.get("user_email")?,
            message_id_header: row.get("message_id_header")?,
            thread_id: row.get("thread_id")?,
            sent_at: row.get("sent_at")?,
            subject: row.get("subject")?,
            sender_name: row.get("sender_name")?,
            sender_email: row.get("sender_email")?,
            recipients: serde_json::from_str(&recipients).map_err(json_err)?,
            storage_path: row.get("storage_path")?,
            storage_hash_sha256: row.get("storage_hash_sha256")?,
            size_bytes: row.get("size_bytes")?,
            path: row.get("path")?,
            tags: serde_json::from_str(&tags).map_err(json_err)?,
            has_attachments: row.get("has_attachments")?,
            is_indexed: row.get("is_indexed")?,
            archived_at: row.get("archived_at")?,
        })
    }
}

/// Inserts an archived email row.
pub fn insert(db: &Database, email: &ArchivedEmail) -> Result<(), DatabaseError> {
    insert_with_attachments(db, email, &[])
}

/// Inserts an archived email row together with its attachment links in
/// one transaction, so a row never exists without its links.
pub fn insert_with_attachments(
    db: &Database,
    email: &ArchivedEmail,
    attachment_ids: &[String],
) -> Result<(), DatabaseError> {
    let recipients = serde_json::to_string(&email.recipients).map_err(|e| DatabaseError::Json {
        column: "recipients",
        source: e,
    })?;
    let tags = serde_json::to_string(&email.tags).map_err(|e| DatabaseError::Json {
        column: "tags",
        source: e,
    })?;

    db.with_transaction(|tx| {
        tx.execute(
            "INSERT INTO archived_emails (id, ingestion_source_id, user_email, message_id_header,
             thread_id, sent_at, subject, sender_name, sender_email, recipients, storage_path,
             storage_hash_sha256, size_bytes, path, tags, has_attachments, is_indexed, archived_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18)",
            params![
                email.id,
                email.ingestion_source_id,
                email.user_email,
                email.message_id_header,
                email.thread_id,
                email.sent_at,
                email.subject,
                email.sender_name,
                email.sender_email,
                recipients,
                email.storage_path,
                email.storage_hash_sha256,
                email.size_bytes,
                email.path,
                tags,
                email.has_attachments,
                email.is_indexed,
                email.archived_at,
            ],
        )?;
        for attachment_id in attachment_ids {
            tx.execute(
                "INSERT OR IGNORE INTO email_attachments (email_id, attachment_id) VALUES (?1, ?2)",
                params![email.id, attachment_id],
            )?;
        }
        Ok(())
    })
}

/// Returns the id of an email already archived for this source under the
/// given message identity.
pub fn find_id_by_identity(
    db: &Database,
    source_id: &str,
    message_id: &str,
) -> Result<Option<String>, DatabaseError> {
    db.with_conn(|conn| {
        Ok(conn
            .query_row(
                "SELECT id FROM archived_emails
                 WHERE ingestion_source_id = ?1 AND message_id_header = ?2
                 LIMIT 1",
                params![source_id, message_id],
                |r| r.get(0),
            )
            .optional()?)
    })
}

pub fn find_by_id(db: &Database, id: &str) -> Result<Option<ArchivedEmail>, DatabaseError> {
    db.with_conn(|conn| {
        Ok(conn
            .query_row(
                "SELECT * FROM archived_emails WHERE id = ?1",
                params![id],
                ArchivedEmail::from_row,
            )
            .optional()?)
    })
}

pub fn find_by_source(db: &Database, source_id: &str) -> Result<Vec<ArchivedEmail>, DatabaseError> {
    db.with_conn(|conn| {
        let mut stmt = conn.prepare(
            "SELECT * FROM archived_emails WHERE ingestion_source_id = ?1 ORDER BY sent_at",
        )?;
        let rows = stmt
            .query_map(params![source_id], ArchivedEmail::from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    })
}

pub fn count_by_source(db: &Database, source_id: &str) -> Result<u64, DatabaseError> {
    db.with_conn(|conn| {
        let count: u64 = conn.query_row(
            "SELECT COUNT(*) FROM archived_emails WHERE ingestion_source_id = ?1",
            params![source_id],
            |r| r.get(0),
        )?;
        Ok(count)
    })
}

/// Flags the given emails as indexed. Unknown ids are ignored.
pub fn mark_indexed(db: &Database, ids: &[String]) -> Result<usize, DatabaseError> {
    let indexed_at = now_rfc3339();
    db.with_transaction(|tx| {
        let mut stmt = tx.prepare(
            "UPDATE archived_emails SET is_indexed = 1, indexed_at = ?2 WHERE id = ?1",
        )?;
        let mut updated = 0;
        for id in ids {
            updated += stmt.execute(params![id, indexed_at])?;
        }
        Ok(updated)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::source_repo::{self, IngestionSource};
    use crate::source::{ProviderKind, SourceStatus};
    use crate::sync_state::SyncState;

    fn test_db() -> Database {
        let db = Database::open_in_memory().expect("Failed to create test database");
        let now = now_rfc3339();
        source_repo::insert(
            &db,
            &IngestionSource {
                id: "src".to_string(),
                user_id: "owner".to_string(),
                name: "Archive".to_string(),
                provider: ProviderKind::MboxImport,
                credentials: "x".to_string(),
                status: SourceStatus::Importing,
                sync_state: SyncState::Empty,
                last_sync_started_at: None,
                last_sync_finished_at: None,
                last_sync_status_message: None,
                created_at: now.clone(),
                updated_at: now,
            },
        )
        .unwrap();
        db
    }

    fn sample_email(id: &str, message_id: &str) -> ArchivedEmail {
        ArchivedEmail {
            id: id.to_string(),
            ingestion_source_id: "src".to_string(),
            user_email: "me@example.com".to_string(),
            message_id_header: message_id.to_string(),
            thread_id: Some("thread-1".to_string()),
            sent_at: "2026-03-01T10:00:00.000Z".to_string(),
            subject: Some("Quarterly report".to_string()),
            sender_name: Some("Ann".to_string()),
            sender_email: "ann@example.com".to_string(),
            recipients: Recipients {
                to: vec![EmailAddress {
                    name: None,
                    address: "me@example.com".to_string(),
                }],
                ..Default::default()
            },
            storage_path: "archive/x.eml".to_string(),
            storage_hash_sha256: "ab".repeat(32),
            size_bytes: 120,
            path: Some("INBOX".to_string()),
            tags: vec!["INBOX".to_string(), "IMPORTANT".to_string()],
            has_attachments: false,
            is_indexed: false,
            archived_at: now_rfc3339(),
        }
    }

    #[test]
    fn test_insert_and_find_by_identity() {
        let db = test_db();
        insert(&db, &sample_email("e1", "<m1@example.com>")).unwrap();

        let id = find_id_by_identity(&db, "src", "<m1@example.com>").unwrap();
        assert_eq!(id.as_deref(), Some("e1"));
        assert!(find_id_by_identity(&db, "src", "<other>").unwrap().is_none());
        assert!(find_id_by_identity(&db, "other-src", "<m1@example.com>")
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_json_columns_round_trip() {
        let db = test_db();
        insert(&db, &sample_email("e1", "m1")).unwrap();

        let found = find_by_id(&db, "e1").unwrap().unwrap();
        assert_eq!(found.tags, vec!["INBOX", "IMPORTANT"]);
        assert_eq!(found.recipients.to[0].address, "me@example.com");
        assert!(found.recipients.cc.is_empty());
    }

    #[test]
    fn test_mark_indexed() {
        let db = test_db();
        insert(&db, &sample_email("e1", "m1")).unwrap();
        insert(&db, &sample_email("e2", "m2")).unwrap();

        let updated = mark_indexed(&db, &["e1".to_string(), "ghost".to_string()]).unwrap();
        assert_eq!(updated, 1);
        assert!(find_by_id(&db, "e1").unwrap().unwrap().is_indexed);
        assert!(!find_by_id(&db, "e2").unwrap().unwrap().is_indexed);
        assert_eq!(count_by_source(&db, "src").unwrap(), 2);
    }

    #[test]
    fn test_insert_with_attachments_links_atomically() {
        use crate::db::attachment_repo::{self, Attachment};

        let db = test_db();
        let stored = attachment_repo::insert_or_get(
            &db,
            &Attachment {
                id: "a1".to_string(),
                ingestion_source_id: "src".to_string(),
                filename: "invoice.pdf".to_string(),
                mime_type: Some("application/pdf".to_string()),
                size_bytes: 4,
                content_hash_sha256: "h1".to_string(),
                storage_path: "archive/attachments/a1-invoice.pdf".to_string(),
            },
        )
        .unwrap();

        let mut email = sample_email("e1", "m1");
        email.has_attachments = true;
        insert_with_attachments(&db, &email, &[stored.id.clone()]).unwrap();
        let mut other = sample_email("e2", "m2");
        other.has_attachments = true;
        insert_with_attachments(&db, &other, &[stored.id.clone()]).unwrap();
        assert_eq!(attachment_repo::count_links(&db, "a1").unwrap(), 2);

        // A link that cannot be written rolls the email row back too.
        let mut broken = sample_email("e3", "m3");
        broken.has_attachments = true;
        assert!(insert_with_attachments(&db, &broken, &["missing".to_string()]).is_err());
        assert!(find_by_id(&db, "e3").unwrap().is_none());
        assert!(find_id_by_identity(&db, "src", "m3").unwrap().is_none());
    }

    #[test]
    fn test_emails_cascade_with_source() {
        let db = test_db();
        insert(&db, &sample_email("e1", "m1")).unwrap();
        source_repo::delete(&db, "src").unwrap();
        assert_eq!(count_by_source(&db, "src").unwrap(), 0);
    }
}
