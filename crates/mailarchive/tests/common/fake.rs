//! An in-memory provider behind the real `ConnectorFactory` seam.
//!
//! Messages live in per-user folders with IMAP-style UIDs; the connector
//! resumes from the per-folder max UID it reported last time.

#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use mailarchive::connector::{ConnectorError, EmailConnector, EmailObject, MailboxUser, Result};
use mailarchive::db::source_repo::IngestionSource;
use mailarchive::factory::{ConnectorFactory, ProviderCredentials};
use mailarchive::sync_state::{SyncState, UidCursor};
use mailarchive::ProviderKind;

pub const UID_VALIDITY: u32 = 7;

#[derive(Clone)]
pub struct FakeMessage {
    pub folder: String,
    pub uid: u32,
    pub email: EmailObject,
}

/// What the fake provider serves. Shared between the test and every
/// connector the factory hands out.
pub struct FakeProvider {
    pub users: Vec<String>,
    pub mailboxes: HashMap<String, Vec<FakeMessage>>,
    /// Users whose pass fails with an authentication error.
    pub failing_users: HashSet<String>,
    pub connection_ok: bool,
    /// When set, `list_all_users` fails with this message.
    pub list_error: Option<String>,
    /// When false, every pass starts from the beginning.
    pub honor_cursor: bool,
    pub status_message: Option<String>,
    pub connectors_created: usize,
    pub finished_passes: usize,
}

impl Default for FakeProvider {
    fn default() -> Self {
        Self {
            users: Vec::new(),
            mailboxes: HashMap::new(),
            failing_users: HashSet::new(),
            connection_ok: true,
            list_error: None,
            honor_cursor: true,
            status_message: None,
            connectors_created: 0,
            finished_passes: 0,
        }
    }
}

impl FakeProvider {
    pub fn add_user(&mut self, email: &str) {
        if !self.users.iter().any(|u| u == email) {
            self.users.push(email.to_string());
        }
    }

    pub fn deliver(&mut self, user: &str, folder: &str, email: EmailObject) -> u32 {
        self.add_user(user);
        let messages = self.mailboxes.entry(user.to_string()).or_default();
        let uid = messages
            .iter()
            .filter(|m| m.folder == folder)
            .map(|m| m.uid)
            .max()
            .unwrap_or(0)
            + 1;
        messages.push(FakeMessage {
            folder: folder.to_string(),
            uid,
            email,
        });
        uid
    }
}

pub struct FakeConnector {
    kind: ProviderKind,
    provider: Arc<Mutex<FakeProvider>>,
    queue: VecDeque<FakeMessage>,
    fail_with: Option<String>,
    cursors: BTreeMap<String, UidCursor>,
    touched: BTreeMap<String, UidCursor>,
}

impl FakeConnector {
    fn provider(&self) -> std::sync::MutexGuard<'_, FakeProvider> {
        self.provider.lock().expect("fake provider poisoned")
    }
}

#[async_trait]
impl EmailConnector for FakeConnector {
    fn provider(&self) -> ProviderKind {
        self.kind
    }

    async fn test_connection(&mut self) -> Result<bool> {
        Ok(self.provider().connection_ok)
    }

    async fn list_all_users(&mut self) -> Result<Vec<MailboxUser>> {
        let provider = self.provider();
        if let Some(message) = &provider.list_error {
            return Err(ConnectorError::Network(message.clone()));
        }
        Ok(provider
            .users
            .iter()
            .map(|email| MailboxUser {
                id: email.clone(),
                primary_email: email.clone(),
                display_name: email.clone(),
            })
            .collect())
    }

    async fn start_fetch(&mut self, user_email: &str, state: Option<&SyncState>) -> Result<()> {
        let provider = self.provider.lock().expect("fake provider poisoned");
        let cursors = if provider.honor_cursor {
            state
                .and_then(SyncState::imap_cursors)
                .cloned()
                .unwrap_or_default()
        } else {
            BTreeMap::new()
        };

        let mut pending: Vec<FakeMessage> = provider
            .mailboxes
            .get(user_email)
            .map(|messages| {
                messages
                    .iter()
                    .filter(|m| cursors.get(&m.folder).map_or(true, |c| m.uid > c.max_uid))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        pending.sort_by(|a, b| a.folder.cmp(&b.folder).then(a.uid.cmp(&b.uid)));

        self.fail_with = provider
            .failing_users
            .contains(user_email)
            .then(|| "token revoked".to_string());
        drop(provider);

        self.queue = pending.into();
        self.cursors = cursors;
        self.touched.clear();
        Ok(())
    }

    async fn next_email(&mut self) -> Result<Option<EmailObject>> {
        if let Some(message) = self.fail_with.take() {
            return Err(ConnectorError::Auth(message));
        }
        let Some(message) = self.queue.pop_front() else {
            return Ok(None);
        };
        let previous = self.cursors.get(&message.folder).map_or(0, |c| c.max_uid);
        let cursor = self
            .touched
            .entry(message.folder.clone())
            .or_insert(UidCursor {
                uid_validity: UID_VALIDITY,
                max_uid: previous,
            });
        cursor.max_uid = cursor.max_uid.max(message.uid);
        Ok(Some(message.email))
    }

    async fn finish_fetch(&mut self) {
        self.provider().finished_passes += 1;
    }

    fn updated_sync_state(&self, _user_email: &str) -> SyncState {
        SyncState::Imap(self.touched.clone())
    }

    fn status_message(&self) -> Option<String> {
        self.provider().status_message.clone()
    }
}

/// Hands out [`FakeConnector`]s over one shared [`FakeProvider`].
pub struct FakeFactory {
    pub provider: Arc<Mutex<FakeProvider>>,
}

impl ConnectorFactory for FakeFactory {
    fn create(
        &self,
        source: &IngestionSource,
        _credentials: ProviderCredentials,
    ) -> Result<Box<dyn EmailConnector>> {
        self.provider
            .lock()
            .expect("fake provider poisoned")
            .connectors_created += 1;
        Ok(Box::new(FakeConnector {
            kind: source.provider,
            provider: Arc::clone(&self.provider),
            queue: VecDeque::new(),
            fail_with: None,
            cursors: BTreeMap::new(),
            touched: BTreeMap::new(),
        }))
    }
}
