//! Generic IMAP connector.
//!
//! Every selectable folder except junk, trash and "all mail" is walked in
//! turn. Progress is a max-UID cursor per folder, invalidated whenever the
//! server reports a new UIDVALIDITY. Messages are fetched with
//! `BODY.PEEK[]` so nothing is marked as read.

use std::collections::{BTreeMap, VecDeque};

use async_imap::types::NameAttribute;
use async_imap::Session;
use async_native_tls::TlsConnector;
use async_trait::async_trait;
use futures_util::StreamExt;
use log::{debug, error, info, warn};
use tracing::Instrument;

use crate::factory::ImapCredentials;
use crate::retry::RetryPolicy;
use crate::source::ProviderKind;
use crate::sync_state::{SyncState, UidCursor};

use super::message::{parse_raw_email, RawContext};
use super::{
    ConnectorError, EmailConnector, EmailObject, MailboxUser, Result, RATE_LIMIT_MESSAGE,
};

type AsyncTcpStream = async_io::Async<std::net::TcpStream>;
type TlsStream = async_native_tls::TlsStream<AsyncTcpStream>;
type ImapSession = Session<TlsStream>;

/// UIDs fetched per `UID FETCH` command.
const FETCH_BATCH_SIZE: usize = 250;

/// Runs an IMAP operation against a live session. Transient failures drop
/// the session so the next attempt reconnects, with backoff in between.
macro_rules! with_session {
    ($self:ident, $what:expr, |$session:ident| $op:expr) => {{
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            let outcome = match $self.session().await {
                Ok($session) => $op.await,
                Err(e) => Err(e),
            };
            match outcome {
                Ok(value) => break Ok(value),
                Err(e) if e.is_transient() && attempt < $self.retry.max_attempts => {
                    $self.session = None;
                    let delay = $self.retry.delay_for(attempt);
                    warn!(
                        "IMAP {} failed (attempt {}/{}): {}. Retrying in {:?}",
                        $what, attempt, $self.retry.max_attempts, e, delay
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) if e.is_transient() => {
                    $self.session = None;
                    error!("IMAP {} failed after {} attempts: {}", $what, attempt, e);
                    break Err(ConnectorError::RetriesExhausted {
                        attempts: attempt,
                        last: e.to_string(),
                    });
                }
                Err(e) => break Err(e),
            }
        }
    }};
}

/// A listed mailbox and its flags, e.g. `\Noselect` or `\Trash`.
#[derive(Debug, Clone)]
struct FolderInfo {
    name: String,
    flags: Vec<String>,
}

fn attribute_name(attr: &NameAttribute<'_>) -> Option<String> {
    match attr {
        NameAttribute::NoSelect => Some("\\Noselect".to_string()),
        NameAttribute::All => Some("\\All".to_string()),
        NameAttribute::Junk => Some("\\Junk".to_string()),
        NameAttribute::Trash => Some("\\Trash".to_string()),
        NameAttribute::Extension(name) => Some(name.to_string()),
        _ => None,
    }
}

/// Folders that are never archived: unselectable containers, junk, trash
/// and the Gmail-style "all mail" view that duplicates everything.
fn is_skipped_folder(folder: &FolderInfo) -> bool {
    folder.flags.iter().any(|flag| {
        matches!(
            flag.to_ascii_lowercase().as_str(),
            "\\noselect" | "\\junk" | "\\trash" | "\\all"
        )
    })
}

/// The UID to resume after. A changed UIDVALIDITY invalidates the cursor.
fn resume_after(previous: Option<&UidCursor>, uid_validity: u32, folder: &str) -> u32 {
    match previous {
        Some(cursor) if cursor.uid_validity == uid_validity => cursor.max_uid,
        Some(cursor) => {
            info!(
                "UIDVALIDITY of '{}' changed from {} to {}, resyncing folder",
                folder, cursor.uid_validity, uid_validity
            );
            0
        }
        None => 0,
    }
}

/// `UID n:*` always matches the highest UID, even below `n`, so results
/// are filtered against the cursor.
fn new_uids(found: impl IntoIterator<Item = u32>, after: u32) -> VecDeque<u32> {
    let mut uids: Vec<u32> = found.into_iter().filter(|uid| *uid > after).collect();
    uids.sort_unstable();
    uids.into()
}

fn uid_set(uids: &[u32]) -> String {
    uids.iter()
        .map(u32::to_string)
        .collect::<Vec<_>>()
        .join(",")
}

async fn connect(credentials: &ImapCredentials) -> Result<ImapSession> {
    if !credentials.secure {
        return Err(ConnectorError::Config(
            "TLS is required for IMAP connections".to_string(),
        ));
    }

    let addr = format!("{}:{}", credentials.host, credentials.port);
    info!("Connecting to IMAP server at {}", addr);

    let std_stream = std::net::TcpStream::connect(&addr)
        .map_err(|e| ConnectorError::Network(format!("{}: {}", addr, e)))?;
    std_stream.set_nonblocking(true)?;
    let tcp_stream = async_io::Async::new(std_stream)?;

    let tls_stream = TlsConnector::new()
        .connect(&credentials.host, tcp_stream)
        .await?;

    let client = async_imap::Client::new(tls_stream);
    let session = client
        .login(&credentials.username, &credentials.password)
        .await
        .map_err(|(e, _)| match ConnectorError::from(e) {
            network @ ConnectorError::Network(_) => network,
            other => ConnectorError::Auth(other.to_string()),
        })?;

    info!("Authenticated to IMAP server as {}", credentials.username);
    Ok(session)
}

async fn list_folders(session: &mut ImapSession) -> Result<Vec<FolderInfo>> {
    let mut names = session.list(Some(""), Some("*")).await?;
    let mut folders = Vec::new();
    while let Some(name) = names.next().await {
        let name = name?;
        folders.push(FolderInfo {
            name: name.name().to_string(),
            flags: name.attributes().iter().filter_map(attribute_name).collect(),
        });
    }
    Ok(folders)
}

/// Opens `folder` read-only and returns `(UIDVALIDITY, message count)`.
async fn examine(session: &mut ImapSession, folder: &str) -> Result<(u32, u32)> {
    let mailbox = session.examine(folder).await?;
    let uid_validity = mailbox.uid_validity.ok_or_else(|| {
        ConnectorError::Protocol(format!("Server did not provide UIDVALIDITY for '{}'", folder))
    })?;
    Ok((uid_validity, mailbox.exists))
}

async fn search_after(session: &mut ImapSession, after: u32) -> Result<VecDeque<u32>> {
    let query = format!("UID {}:*", after.saturating_add(1));
    debug!("Searching with query: {}", query);
    let found = session.uid_search(&query).await?;
    Ok(new_uids(found, after))
}

async fn fetch_batch(session: &mut ImapSession, uids: &[u32]) -> Result<Vec<(u32, Vec<u8>)>> {
    let set = uid_set(uids);
    let mut messages = session.uid_fetch(&set, "(UID BODY.PEEK[])").await?;
    let mut fetched = Vec::with_capacity(uids.len());
    while let Some(message) = messages.next().await {
        let message = message?;
        match (message.uid, message.body()) {
            (Some(uid), Some(body)) => fetched.push((uid, body.to_vec())),
            _ => warn!("Fetched message without UID or body"),
        }
    }
    fetched.sort_by_key(|(uid, _)| *uid);
    Ok(fetched)
}

/// The folder currently being walked.
struct FolderPass {
    name: String,
    pending: VecDeque<u32>,
    fetched: VecDeque<(u32, Vec<u8>)>,
}

pub struct ImapConnector {
    credentials: ImapCredentials,
    retry: RetryPolicy,
    session: Option<ImapSession>,
    /// `None` until the folder list is fetched on the first pull.
    folders: Option<VecDeque<String>>,
    current: Option<FolderPass>,
    previous: BTreeMap<String, UidCursor>,
    cursors: BTreeMap<String, UidCursor>,
    status_message: Option<String>,
}

impl ImapConnector {
    pub fn new(credentials: ImapCredentials, retry: RetryPolicy) -> Result<Self> {
        if credentials.host.trim().is_empty() || credentials.username.trim().is_empty() {
            return Err(ConnectorError::Config(
                "IMAP host and username are required".to_string(),
            ));
        }
        Ok(Self {
            credentials,
            retry,
            session: None,
            folders: None,
            current: None,
            previous: BTreeMap::new(),
            cursors: BTreeMap::new(),
            status_message: None,
        })
    }

    async fn session(&mut self) -> Result<&mut ImapSession> {
        if self.session.is_none() {
            self.session = Some(connect(&self.credentials).await?);
        }
        self.session.as_mut().ok_or(ConnectorError::NotStarted)
    }

    async fn disconnect(&mut self) {
        if let Some(mut session) = self.session.take() {
            info!("Disconnecting from IMAP server");
            if let Err(e) = session.logout().await {
                debug!("IMAP logout failed: {}", e);
            }
        }
    }

    async fn load_folders(&mut self) -> Result<()> {
        if self.folders.is_some() {
            return Ok(());
        }
        let listed = with_session!(self, "LIST", |session| list_folders(session))?;
        let folders: VecDeque<String> = listed
            .into_iter()
            .filter(|folder| {
                let skip = is_skipped_folder(folder);
                if skip {
                    debug!("Skipping folder '{}' ({:?})", folder.name, folder.flags);
                }
                !skip
            })
            .map(|folder| folder.name)
            .collect();
        info!("Found {} folder(s) to sync", folders.len());
        self.folders = Some(folders);
        Ok(())
    }

    /// Opens the next folder and finds its new UIDs.
    async fn open_folder(&mut self, name: String) -> Result<FolderPass> {
        let (uid_validity, exists) =
            with_session!(self, "EXAMINE", |session| examine(session, &name))?;
        let after = resume_after(self.previous.get(&name), uid_validity, &name);
        self.cursors.insert(
            name.clone(),
            UidCursor {
                uid_validity,
                max_uid: after,
            },
        );

        // Some servers reject searches on empty folders.
        let pending = if exists == 0 {
            VecDeque::new()
        } else {
            with_session!(self, "UID SEARCH", |session| search_after(session, after))?
        };
        info!(
            "Folder '{}': {} message(s), {} new since UID {}",
            name,
            exists,
            pending.len(),
            after
        );
        Ok(FolderPass {
            name,
            pending,
            fetched: VecDeque::new(),
        })
    }

    /// A folder failed: its cursor is not advanced and the pass moves on.
    fn abandon_folder(&mut self, name: &str, err: &ConnectorError) {
        error!("Failed to sync IMAP folder '{}': {}", name, err);
        self.cursors.remove(name);
        self.current = None;
        self.status_message = Some(match err {
            ConnectorError::RetriesExhausted { .. } => RATE_LIMIT_MESSAGE.to_string(),
            other => format!("Failed to sync folder '{}': {}", name, other),
        });
    }

    fn is_fatal(err: &ConnectorError) -> bool {
        matches!(err, ConnectorError::Auth(_) | ConnectorError::Config(_))
    }

    /// The next raw message and its folder, walking folders in order.
    async fn next_raw(&mut self) -> Result<Option<(u32, Vec<u8>, String)>> {
        self.load_folders().await?;
        loop {
            if let Some(pass) = self.current.as_mut() {
                if let Some((uid, raw)) = pass.fetched.pop_front() {
                    return Ok(Some((uid, raw, pass.name.clone())));
                }
                if !pass.pending.is_empty() {
                    let take = pass.pending.len().min(FETCH_BATCH_SIZE);
                    let batch: Vec<u32> = pass.pending.drain(..take).collect();
                    let name = pass.name.clone();
                    match with_session!(self, "UID FETCH", |session| fetch_batch(session, &batch)) {
                        Ok(fetched) => {
                            if let Some(pass) = self.current.as_mut() {
                                pass.fetched = fetched.into();
                            }
                        }
                        Err(e) if Self::is_fatal(&e) => return Err(e),
                        Err(e) => self.abandon_folder(&name, &e),
                    }
                    continue;
                }
                self.current = None;
            }

            let Some(name) = self.folders.as_mut().and_then(VecDeque::pop_front) else {
                return Ok(None);
            };
            let span = tracing::info_span!("imap_folder", folder = %name);
            match self.open_folder(name.clone()).instrument(span).await {
                Ok(pass) => self.current = Some(pass),
                Err(e) if Self::is_fatal(&e) => return Err(e),
                Err(e) => self.abandon_folder(&name, &e),
            }
        }
    }
}

#[async_trait]
impl EmailConnector for ImapConnector {
    fn provider(&self) -> ProviderKind {
        ProviderKind::GenericImap
    }

    async fn test_connection(&mut self) -> Result<bool> {
        self.session().await?;
        self.disconnect().await;
        Ok(true)
    }

    async fn list_all_users(&mut self) -> Result<Vec<MailboxUser>> {
        let email = self.credentials.username.clone();
        Ok(vec![MailboxUser {
            id: email.clone(),
            primary_email: email.clone(),
            display_name: email,
        }])
    }

    async fn start_fetch(&mut self, user_email: &str, state: Option<&SyncState>) -> Result<()> {
        debug!("Starting IMAP pass for {}", user_email);
        self.folders = None;
        self.current = None;
        self.cursors.clear();
        self.status_message = None;
        self.previous = state
            .and_then(SyncState::imap_cursors)
            .cloned()
            .unwrap_or_default();
        Ok(())
    }

    async fn next_email(&mut self) -> Result<Option<EmailObject>> {
        let Some((uid, raw, folder)) = self.next_raw().await? else {
            return Ok(None);
        };

        if let Some(cursor) = self.cursors.get_mut(&folder) {
            cursor.max_uid = cursor.max_uid.max(uid);
        }

        let ctx = RawContext::new(uid.to_string()).path(Some(folder.clone()));
        parse_raw_email(&raw, ctx).map(Some).map_err(|e| {
            warn!("Skipping UID {} in '{}': {}", uid, folder, e);
            e
        })
    }

    async fn finish_fetch(&mut self) {
        self.current = None;
        self.folders = None;
        self.disconnect().await;
    }

    fn updated_sync_state(&self, _user_email: &str) -> SyncState {
        SyncState::Imap(self.cursors.clone())
    }

    fn status_message(&self) -> Option<String> {
        self.status_message.clone()
    }
}
