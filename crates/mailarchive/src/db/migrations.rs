//! Versioned schema migrations.
//!
//! Applied versions are recorded in `_migrations`. Each pending step runs
//! in its own transaction together with its bookkeeping row, so a crash
//! mid-migration leaves the schema at the previous version.

use rusqlite::{params, Connection};

use super::error::DatabaseError;

/// How a step decides whether its SQL still needs to run.
enum Guard {
    Always,
    /// `ALTER TABLE .. ADD COLUMN` on a table that may already carry it.
    MissingColumn(&'static str, &'static str),
}

struct Step {
    version: u32,
    name: &'static str,
    sql: &'static str,
    guard: Guard,
}

const STEPS: &[Step] = &[
    Step {
        version: 1,
        name: "create_ingestion_sources_table",
        sql: include_str!("sql/001_create_ingestion_sources.sql"),
        guard: Guard::Always,
    },
    Step {
        version: 2,
        name: "create_archived_emails_table",
        sql: include_str!("sql/002_create_archived_emails.sql"),
        guard: Guard::Always,
    },
    Step {
        version: 3,
        name: "create_attachments_tables",
        sql: include_str!("sql/003_create_attachments.sql"),
        guard: Guard::Always,
    },
    Step {
        version: 4,
        name: "create_queue_jobs_table",
        sql: include_str!("sql/004_create_queue_jobs.sql"),
        guard: Guard::Always,
    },
    Step {
        version: 5,
        name: "create_audit_log_table",
        sql: include_str!("sql/005_create_audit_log.sql"),
        guard: Guard::Always,
    },
    Step {
        version: 6,
        name: "add_indexed_at_to_archived_emails",
        sql: include_str!("sql/006_add_indexed_at.sql"),
        guard: Guard::MissingColumn("archived_emails", "indexed_at"),
    },
];

/// Highest schema version known to this build.
pub fn latest_version() -> u32 {
    STEPS.last().map(|s| s.version).unwrap_or(0)
}

/// Version recorded in `_migrations`, 0 for a fresh database.
pub fn applied_version(conn: &Connection) -> Result<u32, DatabaseError> {
    Ok(conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM _migrations",
        [],
        |r| r.get(0),
    )?)
}

/// Brings the schema up to [`latest_version`].
pub fn run_all(conn: &Connection) -> Result<(), DatabaseError> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS _migrations (
            version INTEGER PRIMARY KEY,
            description TEXT NOT NULL,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        );",
    )?;

    let from = applied_version(conn)?;
    for step in STEPS.iter().filter(|s| s.version > from) {
        apply(conn, step)?;
    }
    Ok(())
}

fn apply(conn: &Connection, step: &Step) -> Result<(), DatabaseError> {
    let failed = |e: rusqlite::Error| DatabaseError::Migration {
        version: step.version,
        reason: e.to_string(),
    };

    let tx = conn.unchecked_transaction().map_err(failed)?;
    let needed = match step.guard {
        Guard::Always => true,
        Guard::MissingColumn(table, column) => !has_column(&tx, table, column)?,
    };
    if needed {
        log::info!("Applying schema v{} ({})", step.version, step.name);
        tx.execute_batch(step.sql).map_err(failed)?;
    } else {
        log::debug!("Schema v{} already present, recording only", step.version);
    }
    tx.execute(
        "INSERT INTO _migrations (version, description) VALUES (?1, ?2)",
        params![step.version, step.name],
    )
    .map_err(failed)?;
    tx.commit().map_err(failed)
}

fn has_column(conn: &Connection, table: &str, column: &str) -> Result<bool, DatabaseError> {
    let hits: u32 = conn.query_row(
        "SELECT COUNT(*) FROM pragma_table_info(?1) WHERE name = ?2",
        params![table, column],
        |r| r.get(0),
    )?;
    Ok(hits > 0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn migrated() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch("PRAGMA foreign_keys=ON;").unwrap();
        run_all(&conn).unwrap();
        conn
    }

    #[test]
    fn test_fresh_database_reaches_latest_version() {
        let conn = migrated();
        assert_eq!(applied_version(&conn).unwrap(), latest_version());
        assert!(has_column(&conn, "queue_jobs", "pending_children").unwrap());
    }

    #[test]
    fn test_rerun_records_nothing_new() {
        let conn = migrated();
        run_all(&conn).unwrap();
        let rows: u32 = conn
            .query_row("SELECT COUNT(*) FROM _migrations", [], |r| r.get(0))
            .unwrap();
        assert_eq!(rows, STEPS.len() as u32);
    }

    #[test]
    fn test_existing_column_is_recorded_without_altering() {
        let conn = Connection::open_in_memory().unwrap();
        for sql in [
            include_str!("sql/001_create_ingestion_sources.sql"),
            include_str!("sql/002_create_archived_emails.sql"),
            include_str!("sql/006_add_indexed_at.sql"),
        ] {
            conn.execute_batch(sql).unwrap();
        }

        run_all(&conn).unwrap();
        assert_eq!(applied_version(&conn).unwrap(), latest_version());
        assert!(has_column(&conn, "archived_emails", "indexed_at").unwrap());
    }

    #[test]
    fn test_has_column_on_unknown_table() {
        let conn = Connection::open_in_memory().unwrap();
        assert!(!has_column(&conn, "jobs; DROP TABLE x", "id").unwrap());
    }

    #[test]
    fn test_attachment_hash_unique_per_source() {
        let conn = migrated();
        conn.execute(
            "INSERT INTO ingestion_sources (id, user_id, name, provider, credentials, created_at, updated_at)
             VALUES ('s1', 'u1', 'src', 'mbox_import', 'x', '2026-01-01', '2026-01-01')",
            [],
        )
        .unwrap();
        let insert = "INSERT INTO attachments (id, ingestion_source_id, filename, size_bytes, content_hash_sha256, storage_path)
                      VALUES (?1, 's1', 'a.pdf', 3, 'abc', 'p')";
        conn.execute(insert, ["a1"]).unwrap();
        assert!(conn.execute(insert, ["a2"]).is_err());
    }
}
