//! End-to-end import and sync runs through the queue, the job handlers and
//! the mailbox processor.

mod common;

use mailarchive::db::source_repo::{self, SourceUpdate};
use mailarchive::db::{attachment_repo, email_repo};
use mailarchive::ingestion::IngestionConfig;
use mailarchive::queue::{JobName, JobQueue, JobState};
use mailarchive::sync_state::UidCursor;
use mailarchive::SourceStatus;

use common::{imap_credentials, mbox_upload, MessageBuilder, TestHarness, UID_VALIDITY};

fn deliver(h: &TestHarness, user: &str, folder: &str, message_id: &str) -> u32 {
    let email = MessageBuilder::new(message_id).build(message_id, Some(folder));
    h.provider().deliver(user, folder, email)
}

fn names(ran: &[common::RanJob]) -> Vec<JobName> {
    ran.iter().map(|j| j.name).collect()
}

#[tokio::test]
async fn test_initial_import_fans_out_and_settles_active() {
    let h = TestHarness::new();
    deliver(&h, "alice@example.com", "INBOX", "a1@example.com");
    deliver(&h, "alice@example.com", "INBOX", "a2@example.com");
    deliver(&h, "bob@example.com", "INBOX", "b1@example.com");

    let source = h.create_source("Corp Mail", imap_credentials()).await;
    assert_eq!(source.status, SourceStatus::AuthSuccess);

    let ran = h.run_jobs().await;
    assert!(ran.iter().all(|j| j.error.is_none()), "{:?}", ran);
    let names = names(&ran);
    assert_eq!(names[0], JobName::InitialImport);
    assert_eq!(
        names.iter().filter(|n| **n == JobName::ProcessMailbox).count(),
        2
    );
    let finished_at = names
        .iter()
        .position(|n| *n == JobName::SyncCycleFinished)
        .expect("fan-in ran");
    let last_mailbox = names
        .iter()
        .rposition(|n| *n == JobName::ProcessMailbox)
        .unwrap();
    assert!(finished_at > last_mailbox, "fan-in ran before its children");

    let source = h.source(&source.id);
    assert_eq!(source.status, SourceStatus::Active);
    assert_eq!(
        source.last_sync_status_message.as_deref(),
        Some("Successfully synced 2 mailbox(es).")
    );
    assert!(source.last_sync_started_at.is_some());
    assert!(source.last_sync_finished_at.is_some());
    assert_eq!(h.archived(&source.id).len(), 3);
}

#[tokio::test]
async fn test_imap_resumes_from_per_folder_max_uid() {
    let h = TestHarness::new();
    deliver(&h, "archive@example.com", "INBOX", "m1@example.com");
    deliver(&h, "archive@example.com", "INBOX", "m2@example.com");
    deliver(&h, "archive@example.com", "Sent", "m3@example.com");

    let source = h.create_source("Shared Inbox", imap_credentials()).await;
    h.run_jobs().await;

    let source = h.source(&source.id);
    let cursors = source.sync_state.imap_cursors().expect("imap cursors");
    assert_eq!(
        cursors.get("INBOX"),
        Some(&UidCursor {
            uid_validity: UID_VALIDITY,
            max_uid: 2
        })
    );
    assert_eq!(cursors.get("Sent").map(|c| c.max_uid), Some(1));

    let inbox_email = h
        .archived(&source.id)
        .into_iter()
        .find(|e| e.message_id_header == "m1@example.com")
        .expect("m1 archived");
    assert!(inbox_email.storage_path.contains("/emails/INBOX/"));
    assert_eq!(inbox_email.path.as_deref(), Some("INBOX"));

    deliver(&h, "archive@example.com", "INBOX", "m4@example.com");
    h.service.force_sync(&source.id, &h.actor).unwrap();
    h.run_jobs().await;

    let source = h.source(&source.id);
    let cursors = source.sync_state.imap_cursors().unwrap();
    assert_eq!(cursors.get("INBOX").map(|c| c.max_uid), Some(3));
    assert_eq!(cursors.get("Sent").map(|c| c.max_uid), Some(1));
    assert_eq!(h.archived(&source.id).len(), 4);
    assert_eq!(source.status, SourceStatus::Active);
}

#[tokio::test]
async fn test_reimport_does_not_duplicate() {
    let h = TestHarness::new();
    h.provider().honor_cursor = false;
    for id in ["r1@example.com", "r2@example.com", "r3@example.com"] {
        deliver(&h, "archive@example.com", "INBOX", id);
    }

    let source = h.create_source("Replay", imap_credentials()).await;
    h.run_jobs().await;
    assert_eq!(h.archived(&source.id).len(), 3);

    for _ in 0..2 {
        h.service.force_sync(&source.id, &h.actor).unwrap();
        let ran = h.run_jobs().await;
        assert!(ran.iter().all(|j| j.error.is_none()), "{:?}", ran);
        // Nothing new to index.
        assert!(!ran.iter().any(|j| j.name == JobName::IndexEmailBatch));
    }

    assert_eq!(email_repo::count_by_source(&h.db, &source.id).unwrap(), 3);
    let prefix = h.source(&source.id).storage_prefix("mail-archive");
    assert_eq!(h.blob_count(&format!("{}emails", prefix)), 3);
}

#[tokio::test]
async fn test_identical_attachments_are_stored_once() {
    let h = TestHarness::new();
    let report = b"%PDF-1.4 quarterly numbers";
    for id in ["q1@example.com", "q2@example.com"] {
        let email = MessageBuilder::new(id)
            .attachment("report.pdf", "application/pdf", report)
            .build(id, Some("INBOX"));
        h.provider().deliver("finance@example.com", "INBOX", email);
    }
    let other = MessageBuilder::new("q3@example.com")
        .attachment("notes.txt", "text/plain", b"different content")
        .build("q3", Some("INBOX"));
    h.provider().deliver("finance@example.com", "INBOX", other);

    let source = h.create_source("Finance", imap_credentials()).await;
    h.run_jobs().await;

    let emails = h.archived(&source.id);
    assert_eq!(emails.len(), 3);
    assert!(emails.iter().all(|e| e.has_attachments));
    assert_eq!(attachment_repo::count_by_source(&h.db, &source.id).unwrap(), 2);

    let hash = mailarchive::connector::message::sha256_hex(report);
    let shared = attachment_repo::find_by_hash(&h.db, &source.id, &hash)
        .unwrap()
        .expect("shared attachment");
    assert_eq!(attachment_repo::count_links(&h.db, &shared.id).unwrap(), 2);

    let prefix = h.source(&source.id).storage_prefix("mail-archive");
    assert_eq!(h.blob_count(&format!("{}attachments", prefix)), 2);
}

#[tokio::test]
async fn test_no_users_settles_without_fan_out() {
    let h = TestHarness::new();
    let source = h.create_source("Empty Tenant", imap_credentials()).await;

    let ran = h.run_jobs().await;
    assert_eq!(names(&ran), vec![JobName::InitialImport]);

    let source = h.source(&source.id);
    assert_eq!(source.status, SourceStatus::Active);
    assert_eq!(
        source.last_sync_status_message.as_deref(),
        Some("Initial import complete. No users found.")
    );
    assert!(source.last_sync_finished_at.is_some());
}

#[tokio::test]
async fn test_failed_mailbox_marks_source_error() {
    let h = TestHarness::new();
    deliver(&h, "good@example.com", "INBOX", "g1@example.com");
    deliver(&h, "revoked@example.com", "INBOX", "x1@example.com");
    h.provider()
        .failing_users
        .insert("revoked@example.com".to_string());

    let source = h.create_source("Mixed", imap_credentials()).await;
    let ran = h.run_jobs().await;

    let failed: Vec<_> = ran.iter().filter(|j| j.error.is_some()).collect();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].name, JobName::ProcessMailbox);
    assert!(ran.iter().any(|j| j.name == JobName::SyncCycleFinished));

    let source = h.source(&source.id);
    assert_eq!(source.status, SourceStatus::Error);
    let message = source.last_sync_status_message.unwrap();
    assert!(message.starts_with("1 of 2 mailbox(es) failed"), "{}", message);
    assert!(message.contains("token revoked"), "{}", message);

    // The healthy mailbox is archived; the failed one reports no cursor.
    let emails = h.archived(&source.id);
    assert_eq!(emails.len(), 1);
    assert_eq!(emails[0].user_email, "good@example.com");
    assert_eq!(h.provider().finished_passes, 2);
}

#[tokio::test]
async fn test_error_source_recovers_on_next_sync() {
    let h = TestHarness::new();
    deliver(&h, "flaky@example.com", "INBOX", "f1@example.com");
    h.provider()
        .failing_users
        .insert("flaky@example.com".to_string());
    let source = h.create_source("Flaky", imap_credentials()).await;
    h.run_jobs().await;
    assert_eq!(h.source(&source.id).status, SourceStatus::Error);

    h.provider().failing_users.clear();
    h.service.continuous_sync(&source.id).await.unwrap();
    h.run_jobs().await;

    let source = h.source(&source.id);
    assert_eq!(source.status, SourceStatus::Active);
    assert_eq!(h.archived(&source.id).len(), 1);
}

#[tokio::test]
async fn test_listing_failure_fails_initial_import() {
    let h = TestHarness::new();
    h.provider().list_error = Some("directory unavailable".to_string());

    let source = h.create_source("Broken Directory", imap_credentials()).await;
    let ran = h.run_jobs().await;
    assert_eq!(ran.len(), 1);
    assert!(ran[0].error.is_some());

    let source = h.source(&source.id);
    assert_eq!(source.status, SourceStatus::Error);
    let message = source.last_sync_status_message.unwrap();
    assert!(message.starts_with("Initial import failed:"), "{}", message);
    assert!(message.contains("directory unavailable"), "{}", message);
}

#[tokio::test]
async fn test_connector_status_message_wins_over_summary() {
    let h = TestHarness::new();
    deliver(&h, "busy@example.com", "INBOX", "s1@example.com");
    h.provider().status_message = Some("Rate limit reached; resuming next cycle.".to_string());

    let source = h.create_source("Busy", imap_credentials()).await;
    h.run_jobs().await;

    let source = h.source(&source.id);
    assert_eq!(source.status, SourceStatus::Active);
    assert_eq!(
        source.last_sync_status_message.as_deref(),
        Some("Rate limit reached; resuming next cycle.")
    );
}

#[tokio::test]
async fn test_new_emails_are_indexed_in_batches() {
    let h = TestHarness::with_config(IngestionConfig {
        index_batch_size: 2,
        ..IngestionConfig::default()
    });
    for id in ["i1@example.com", "i2@example.com", "i3@example.com"] {
        deliver(&h, "archive@example.com", "INBOX", id);
    }

    let source = h.create_source("Indexed", imap_credentials()).await;
    let ran = h.run_jobs().await;
    assert_eq!(
        ran.iter()
            .filter(|j| j.name == JobName::IndexEmailBatch)
            .count(),
        2
    );

    let emails = h.archived(&source.id);
    assert!(emails.iter().all(|e| e.is_indexed));
    let mut indexed = h.search.indexed.lock().unwrap().clone();
    indexed.sort();
    let mut ids: Vec<String> = emails.into_iter().map(|e| e.id).collect();
    ids.sort();
    assert_eq!(indexed, ids);
}

#[tokio::test]
async fn test_pause_during_import_keeps_source_paused() {
    let h = TestHarness::new();
    deliver(&h, "alice@example.com", "INBOX", "p1@example.com");

    let source = h.create_source("Pausable", imap_credentials()).await;
    let first = h.run_next().await.expect("initial import queued");
    assert_eq!(first.name, JobName::InitialImport);
    assert_eq!(h.source(&source.id).status, SourceStatus::Importing);

    h.service.pause(&source.id, &h.actor).unwrap();
    h.run_jobs().await;

    let source = h.source(&source.id);
    assert_eq!(source.status, SourceStatus::Paused);
    assert!(source.last_sync_finished_at.is_some());
    assert!(h.archived(&source.id).is_empty());
}

#[tokio::test]
async fn test_scheduler_job_queues_idle_active_sources() {
    let h = TestHarness::new();
    let active = h.create_source("Active", imap_credentials()).await;
    h.run_jobs().await;
    assert_eq!(h.source(&active.id).status, SourceStatus::Active);

    assert_eq!(h.service.schedule_continuous_sync().unwrap(), 1);
    let queued = h
        .queue
        .find_by_source(&active.id, &JobState::IN_FLIGHT)
        .unwrap();
    assert_eq!(queued.len(), 1);
    assert_eq!(queued[0].name, JobName::ContinuousSync);

    // Still in flight: not queued twice.
    assert_eq!(h.service.schedule_continuous_sync().unwrap(), 0);

    h.run_jobs().await;
    assert_eq!(h.source(&active.id).status, SourceStatus::Active);
}

#[tokio::test]
async fn test_scheduler_retries_unreachable_mailbox_source() {
    let h = TestHarness::new();
    deliver(&h, "archive@example.com", "INBOX", "r1@example.com");
    h.provider().list_error = Some("connection reset".to_string());

    let source = h.create_source("Unreachable", imap_credentials()).await;
    h.run_jobs().await;
    assert_eq!(h.source(&source.id).status, SourceStatus::Error);

    h.provider().list_error = None;
    assert_eq!(h.service.schedule_continuous_sync().unwrap(), 1);
    let ran = h.run_jobs().await;
    assert_eq!(ran[0].name, JobName::ContinuousSync);

    let source = h.source(&source.id);
    assert_eq!(source.status, SourceStatus::Active);
    assert_eq!(h.archived(&source.id).len(), 1);
}

#[tokio::test]
async fn test_scheduler_leaves_failed_file_import_alone() {
    let h = TestHarness::new();
    let source = h
        .create_source("Old Export", mbox_upload("uploads/export.mbox"))
        .await;
    h.run_jobs().await;
    source_repo::update(
        &h.db,
        &source.id,
        &SourceUpdate::status(SourceStatus::Error).with_message("Import failed: truncated file"),
    )
    .unwrap();

    assert_eq!(h.service.schedule_continuous_sync().unwrap(), 0);
}
