//! Microsoft Graph mailbox walker shared by the Microsoft 365 and Outlook
//! personal connectors.
//!
//! Folders are listed depth-first with display-name paths. Each folder is
//! then walked with a delta query whose final `@odata.deltaLink` becomes
//! that folder's cursor.

use std::collections::{BTreeMap, VecDeque};

use async_trait::async_trait;
use log::{debug, error, info, warn};
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::Deserialize;

use crate::retry::RetryPolicy;

use super::http;
use super::{ConnectorError, Result, RATE_LIMIT_MESSAGE};

pub(crate) const GRAPH_API_BASE: &str = "https://graph.microsoft.com/v1.0";

const NO_QUERY: &[(&str, String)] = &[];

/// Supplies bearer tokens for Graph calls, refreshing as needed.
#[async_trait]
pub(crate) trait GraphAuth: Send {
    async fn access_token(&mut self, client: &Client) -> Result<String>;
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GraphMailFolder {
    id: String,
    #[serde(default)]
    display_name: Option<String>,
    #[serde(default)]
    child_folder_count: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct Page<T> {
    #[serde(default = "Vec::new")]
    value: Vec<T>,
    #[serde(rename = "@odata.nextLink")]
    next_link: Option<String>,
    #[serde(rename = "@odata.deltaLink")]
    delta_link: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DeltaMessage {
    id: Option<String>,
    #[serde(default)]
    conversation_id: Option<String>,
    #[serde(rename = "@removed")]
    removed: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct GraphUser {
    pub id: Option<String>,
    pub user_principal_name: Option<String>,
    pub display_name: Option<String>,
}

/// A mail folder with its path of display names from the root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct GraphFolder {
    pub id: String,
    pub path: String,
}

/// A message downloaded in MIME form.
pub(crate) struct GraphMessage {
    pub id: String,
    pub conversation_id: Option<String>,
    pub folder_path: String,
    pub raw: Vec<u8>,
}

fn child_path(parent: &str, display_name: &str) -> String {
    if parent.is_empty() {
        display_name.to_string()
    } else {
        format!("{}/{}", parent, display_name)
    }
}

/// Ids of the messages added or changed in a delta page. Removals are
/// ignored; archived copies are never deleted.
fn changed_messages(page: Vec<DeltaMessage>) -> VecDeque<(String, Option<String>)> {
    page.into_iter()
        .filter(|m| m.removed.is_none())
        .filter_map(|m| m.id.map(|id| (id, m.conversation_id)))
        .collect()
}

/// An expired or invalid delta token.
fn is_sync_reset(err: &ConnectorError) -> bool {
    matches!(err, ConnectorError::Http { status: 410, .. })
}

/// Delta walk of a single folder.
struct FolderDelta {
    folder: GraphFolder,
    next_url: Option<String>,
    pending: VecDeque<(String, Option<String>)>,
    /// Link from the final delta page, committed once every change
    /// listed before it has been downloaded.
    delta_link: Option<String>,
    restarted: bool,
}

/// Walks every folder of one Graph mailbox (`/users/{id}` or `/me`).
pub(crate) struct GraphMailbox {
    client: Client,
    retry: RetryPolicy,
    mailbox_url: String,
    folders: Option<VecDeque<GraphFolder>>,
    current: Option<FolderDelta>,
    delta_tokens: BTreeMap<String, String>,
    status_message: Option<String>,
}

impl GraphMailbox {
    pub fn new(retry: RetryPolicy) -> Result<Self> {
        Ok(Self {
            client: http::create_http_client()?,
            retry,
            mailbox_url: String::new(),
            folders: None,
            current: None,
            delta_tokens: BTreeMap::new(),
            status_message: None,
        })
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    /// Resets for a pass over `mailbox_url`, resuming from `previous` delta
    /// links keyed by folder id.
    pub fn start(&mut self, mailbox_url: String, previous: Option<&BTreeMap<String, String>>) {
        self.mailbox_url = mailbox_url;
        self.folders = None;
        self.current = None;
        self.delta_tokens = previous.cloned().unwrap_or_default();
        self.status_message = None;
    }

    pub fn finish(&mut self) {
        self.folders = None;
        self.current = None;
    }

    /// Delta links after the pass. Folders that failed keep their old link.
    pub fn delta_tokens(&self) -> &BTreeMap<String, String> {
        &self.delta_tokens
    }

    pub fn status_message(&self) -> Option<String> {
        self.status_message.clone()
    }

    /// GET with retries. `url` may be a full `@odata` link.
    pub async fn get_json<T: DeserializeOwned>(
        &self,
        auth: &mut dyn GraphAuth,
        url: &str,
        query: &[(&str, String)],
    ) -> Result<T> {
        let token = auth.access_token(&self.client).await?;
        self.retry
            .run("Graph request", || {
                http::get_json(&self.client, url, &token, query)
            })
            .await
    }

    async fn get_raw(&self, auth: &mut dyn GraphAuth, message_id: &str) -> Result<Vec<u8>> {
        let url = format!("{}/messages/{}/$value", self.mailbox_url, message_id);
        let token = auth.access_token(&self.client).await?;
        self.retry
            .run("Graph message download", || {
                http::get_bytes(&self.client, &url, &token)
            })
            .await
    }

    /// Every folder of a page-walked listing endpoint.
    async fn list_level(
        &self,
        auth: &mut dyn GraphAuth,
        url: String,
    ) -> Result<Vec<GraphMailFolder>> {
        let mut folders = Vec::new();
        let mut next = Some(url);
        while let Some(url) = next {
            let page: Page<GraphMailFolder> = self.get_json(auth, &url, NO_QUERY).await?;
            folders.extend(page.value);
            next = page.next_link;
        }
        Ok(folders)
    }

    /// All folders, depth-first in listing order.
    async fn list_folders(&self, auth: &mut dyn GraphAuth) -> Result<VecDeque<GraphFolder>> {
        let root = self
            .list_level(auth, format!("{}/mailFolders", self.mailbox_url))
            .await?;
        let mut stack: Vec<(GraphMailFolder, String)> =
            root.into_iter().rev().map(|f| (f, String::new())).collect();

        let mut ordered = VecDeque::new();
        while let Some((folder, parent)) = stack.pop() {
            let path = child_path(&parent, folder.display_name.as_deref().unwrap_or_default());
            if folder.child_folder_count.unwrap_or(0) > 0 {
                let url = format!("{}/mailFolders/{}/childFolders", self.mailbox_url, folder.id);
                let children = self.list_level(auth, url).await?;
                stack.extend(children.into_iter().rev().map(|c| (c, path.clone())));
            }
            if path.is_empty() {
                continue;
            }
            ordered.push_back(GraphFolder {
                id: folder.id,
                path,
            });
        }
        Ok(ordered)
    }

    fn initial_delta_url(&self, folder_id: &str) -> String {
        format!(
            "{}/mailFolders/{}/messages/delta?$select=id,conversationId",
            self.mailbox_url, folder_id
        )
    }

    fn open_folder(&self, folder: GraphFolder) -> FolderDelta {
        let next_url = match self.delta_tokens.get(&folder.id) {
            Some(link) => link.clone(),
            None => self.initial_delta_url(&folder.id),
        };
        info!("Syncing Graph folder '{}'", folder.path);
        FolderDelta {
            folder,
            next_url: Some(next_url),
            pending: VecDeque::new(),
            delta_link: None,
            restarted: false,
        }
    }

    /// Queues the changes of a fetched delta page on the current folder.
    fn accept_page(&mut self, page: Page<DeltaMessage>) {
        if let Some(delta) = self.current.as_mut() {
            delta.pending = changed_messages(page.value);
            delta.next_url = page.next_link;
            if page.delta_link.is_some() {
                delta.delta_link = page.delta_link;
            }
            debug!(
                "Delta page for '{}' with {} change(s)",
                delta.folder.path,
                delta.pending.len()
            );
        }
    }

    /// The current folder is drained: its new delta link becomes the cursor.
    fn complete_folder(&mut self) {
        if let Some(delta) = self.current.take() {
            match delta.delta_link {
                Some(link) => {
                    self.delta_tokens.insert(delta.folder.id, link);
                }
                None => warn!(
                    "Graph folder '{}' ended without a delta link",
                    delta.folder.path
                ),
            }
        }
    }

    /// A folder failed: its delta link stays where it was and the walk
    /// continues with the next folder.
    fn abandon_folder(&mut self, err: &ConnectorError) {
        if let Some(delta) = self.current.take() {
            error!("Failed to sync Graph folder '{}': {}", delta.folder.path, err);
            self.status_message = Some(match err {
                ConnectorError::RetriesExhausted { .. } => RATE_LIMIT_MESSAGE.to_string(),
                other => format!("Failed to sync folder '{}': {}", delta.folder.path, other),
            });
        }
    }

    fn is_fatal(err: &ConnectorError) -> bool {
        matches!(err, ConnectorError::Auth(_) | ConnectorError::Config(_))
    }

    /// The next message of the walk, or `None` once every folder is done.
    pub async fn next_message(&mut self, auth: &mut dyn GraphAuth) -> Result<Option<GraphMessage>> {
        if self.folders.is_none() {
            let folders = self.list_folders(auth).await?;
            info!("Found {} Graph mail folder(s)", folders.len());
            self.folders = Some(folders);
        }

        loop {
            let Some(delta) = self.current.as_mut() else {
                let Some(folder) = self.folders.as_mut().and_then(VecDeque::pop_front) else {
                    return Ok(None);
                };
                self.current = Some(self.open_folder(folder));
                continue;
            };

            if let Some((id, conversation_id)) = delta.pending.pop_front() {
                let folder_path = delta.folder.path.clone();
                match self.get_raw(auth, &id).await {
                    Ok(raw) => {
                        return Ok(Some(GraphMessage {
                            id,
                            conversation_id,
                            folder_path,
                            raw,
                        }))
                    }
                    Err(e) if e.is_skippable() => {
                        warn!("Message {} vanished before download: {}", id, e);
                        return Err(e);
                    }
                    Err(e) if Self::is_fatal(&e) => return Err(e),
                    Err(e) => {
                        self.abandon_folder(&e);
                        continue;
                    }
                }
            }

            let Some(url) = delta.next_url.take() else {
                self.complete_folder();
                continue;
            };
            let folder_id = delta.folder.id.clone();

            match self.get_json::<Page<DeltaMessage>>(auth, &url, NO_QUERY).await {
                Ok(page) => self.accept_page(page),
                Err(e) if is_sync_reset(&e) => {
                    let can_restart = self.current.as_ref().is_some_and(|d| !d.restarted);
                    if !can_restart {
                        self.abandon_folder(&e);
                        continue;
                    }
                    let initial = self.initial_delta_url(&folder_id);
                    self.delta_tokens.remove(&folder_id);
                    if let Some(delta) = self.current.as_mut() {
                        warn!(
                            "Delta token for '{}' expired, restarting folder sync",
                            delta.folder.path
                        );
                        delta.restarted = true;
                        delta.next_url = Some(initial);
                        delta.delta_link = None;
                    }
                }
                Err(e) if Self::is_fatal(&e) => return Err(e),
                Err(e) => self.abandon_folder(&e),
            }
        }
    }
}
