//! Attachment repository: deduplicated attachment rows and the
//! `email_attachments` join table.

use rusqlite::{params, OptionalExtension, Row};

use super::{Database, DatabaseError};

#[derive(Debug, Clone)]
pub struct Attachment {
    pub id: String,
    pub ingestion_source_id: String,
    pub filename: String,
    pub mime_type: Option<String>,
    pub size_bytes: i64,
    pub content_hash_sha256: String,
    pub storage_path: String,
}

impl Attachment {
    fn from_row(row: &Row<'_>) -> Result<Self, rusqlite::Error> {
        Ok(Self {
            id: row.get("id")?,
            ingestion_source_id: row.get("ingestion_source_id")?,
            filename: row.get("filename")?,
            mime_type: row.get("mime_type")?,
            size_bytes: row.get("size_bytes")?,
            content_hash_sha256: row.get("content_hash_sha256")?,
            storage_path: row.get("storage_path")?,
        })
    }
}

/// Finds the attachment stored for `(source, hash)`, if any.
pub fn find_by_hash(
    db: &Database,
    source_id: &str,
    hash: &str,
) -> Result<Option<Attachment>, DatabaseError> {
    db.with_conn(|conn| {
        Ok(conn
            .query_row(
                "SELECT * FROM attachments
                 WHERE ingestion_source_id = ?1 AND content_hash_sha256 = ?2",
                params![source_id, hash],
                Attachment::from_row,
            )
            .optional()?)
    })
}

/// Inserts the attachment unless one with the same `(source, hash)` already
/// exists, and returns whichever row is stored. When two processors race on
/// the same content, the loser gets the winner's row back.
pub fn insert_or_get(db: &Database, attachment: &Attachment) -> Result<Attachment, DatabaseError> {
    db.with_transaction(|tx| {
        tx.execute(
            "INSERT OR IGNORE INTO attachments (id, ingestion_source_id, filename, mime_type,
             size_bytes, content_hash_sha256, storage_path)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                attachment.id,
                attachment.ingestion_source_id,
                attachment.filename,
                attachment.mime_type,
                attachment.size_bytes,
                attachment.content_hash_sha256,
                attachment.storage_path,
            ],
        )?;
        Ok(tx.query_row(
            "SELECT * FROM attachments
             WHERE ingestion_source_id = ?1 AND content_hash_sha256 = ?2",
            params![attachment.ingestion_source_id, attachment.content_hash_sha256],
            Attachment::from_row,
        )?)
    })
}

pub fn count_by_source(db: &Database, source_id: &str) -> Result<u64, DatabaseError> {
    db.with_conn(|conn| {
        Ok(conn.query_row(
            "SELECT COUNT(*) FROM attachments WHERE ingestion_source_id = ?1",
            params![source_id],
            |r| r.get(0),
        )?)
    })
}

/// Number of emails referencing the attachment.
pub fn count_links(db: &Database, attachment_id: &str) -> Result<u64, DatabaseError> {
    db.with_conn(|conn| {
        Ok(conn.query_row(
            "SELECT COUNT(*) FROM email_attachments WHERE attachment_id = ?1",
            params![attachment_id],
            |r| r.get(0),
        )?)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_db() -> Database {
        let db = Database::open_in_memory().unwrap();
        db.with_conn(|conn| {
            conn.execute_batch(
                "INSERT INTO ingestion_sources (id, user_id, name, provider, credentials, created_at, updated_at)
                 VALUES ('src', 'u', 'n', 'eml_import', 'x', '2026-01-01', '2026-01-01');
                 INSERT INTO archived_emails (id, ingestion_source_id, user_email, message_id_header,
                   sent_at, sender_email, recipients, storage_path, storage_hash_sha256, size_bytes, archived_at)
                 VALUES ('e1', 'src', 'u@x', 'm1', '2026-01-01', 'a@x', '{\"to\":[],\"cc\":[],\"bcc\":[]}', 'p', 'h', 1, '2026-01-01'),
                        ('e2', 'src', 'u@x', 'm2', '2026-01-01', 'a@x', '{\"to\":[],\"cc\":[],\"bcc\":[]}', 'p', 'h', 1, '2026-01-01');",
            )?;
            Ok(())
        })
        .unwrap();
        db
    }

    fn sample(id: &str, hash: &str) -> Attachment {
        Attachment {
            id: id.to_string(),
            ingestion_source_id: "src".to_string(),
            filename: "invoice.pdf".to_string(),
            mime_type: Some("application/pdf".to_string()),
            size_bytes: 4,
            content_hash_sha256: hash.to_string(),
            storage_path: format!("archive/attachments/{}-invoice.pdf", id),
        }
    }

    #[test]
    fn test_insert_or_get_returns_existing_row() {
        let db = test_db();
        let first = insert_or_get(&db, &sample("a1", "h1")).unwrap();
        let second = insert_or_get(&db, &sample("a2", "h1")).unwrap();

        assert_eq!(first.id, "a1");
        assert_eq!(second.id, "a1");
        assert_eq!(second.storage_path, first.storage_path);
        assert_eq!(count_by_source(&db, "src").unwrap(), 1);
        assert!(find_by_hash(&db, "src", "h1").unwrap().is_some());
        assert!(find_by_hash(&db, "src", "h2").unwrap().is_none());
    }
}
