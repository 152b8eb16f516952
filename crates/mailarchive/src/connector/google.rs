//! Google Workspace connector.
//!
//! A service account with domain-wide delegation impersonates the admin to
//! list the directory and each user to read their Gmail. The first pass over
//! a mailbox lists every message; later passes replay the history API from
//! the stored history id.

use std::collections::{BTreeMap, HashMap, VecDeque};

use async_trait::async_trait;
use base64::alphabet;
use base64::engine::{DecodePaddingMode, GeneralPurpose, GeneralPurposeConfig};
use base64::Engine;
use chrono::Utc;
use jsonwebtoken::{Algorithm, EncodingKey, Header};
use log::{debug, info, warn};
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::factory::GoogleWorkspaceCredentials;
use crate::retry::RetryPolicy;
use crate::source::ProviderKind;
use crate::sync_state::{HistoryCursor, SyncState};

use super::http::{self, AccessToken};
use super::message::{parse_raw_email, RawContext};
use super::{
    ConnectorError, EmailConnector, EmailObject, MailboxUser, Result, RATE_LIMIT_MESSAGE,
};

const DIRECTORY_SCOPE: &str = "https://www.googleapis.com/auth/admin.directory.user.readonly";
const GMAIL_SCOPE: &str = "https://www.googleapis.com/auth/gmail.readonly";
const DIRECTORY_USERS_URL: &str = "https://admin.googleapis.com/admin/directory/v1/users";
const GMAIL_API_BASE: &str = "https://gmail.googleapis.com/gmail/v1/users";
const DEFAULT_TOKEN_URI: &str = "https://oauth2.googleapis.com/token";
const JWT_BEARER_GRANT: &str = "urn:ietf:params:oauth:grant-type:jwt-bearer";

/// Gmail's `raw` field is URL-safe base64 with or without padding.
const RAW_ENGINE: GeneralPurpose = GeneralPurpose::new(
    &alphabet::URL_SAFE,
    GeneralPurposeConfig::new().with_decode_padding_mode(DecodePaddingMode::Indifferent),
);

fn default_token_uri() -> String {
    DEFAULT_TOKEN_URI.to_string()
}

#[derive(Deserialize)]
struct ServiceAccountKey {
    client_email: String,
    private_key: String,
    #[serde(default = "default_token_uri")]
    token_uri: String,
}

#[derive(Serialize)]
struct JwtClaims<'a> {
    iss: &'a str,
    sub: &'a str,
    scope: &'a str,
    aud: &'a str,
    iat: i64,
    exp: i64,
}

/// Mints and caches impersonation tokens per (subject, scope).
struct ServiceAccountAuth {
    key: ServiceAccountKey,
    encoding_key: EncodingKey,
    retry: RetryPolicy,
    tokens: HashMap<(String, &'static str), AccessToken>,
}

impl ServiceAccountAuth {
    fn from_credentials(credentials: &GoogleWorkspaceCredentials, retry: RetryPolicy) -> Result<Self> {
        let key: ServiceAccountKey = serde_json::from_str(&credentials.service_account_key_json)
            .map_err(|e| ConnectorError::Config(format!("Invalid service account key JSON: {}", e)))?;
        let encoding_key = EncodingKey::from_rsa_pem(key.private_key.as_bytes())
            .map_err(|e| ConnectorError::Config(format!("Invalid service account private key: {}", e)))?;
        Ok(Self {
            key,
            encoding_key,
            retry,
            tokens: HashMap::new(),
        })
    }

    fn assertion(&self, subject: &str, scope: &str, now: i64) -> Result<String> {
        let claims = JwtClaims {
            iss: &self.key.client_email,
            sub: subject,
            scope,
            aud: &self.key.token_uri,
            iat: now,
            exp: now + 3600,
        };
        jsonwebtoken::encode(&Header::new(Algorithm::RS256), &claims, &self.encoding_key)
            .map_err(|e| ConnectorError::Auth(format!("Failed to sign service account JWT: {}", e)))
    }

    async fn token(&mut self, client: &Client, subject: &str, scope: &'static str) -> Result<String> {
        let cache_key = (subject.to_string(), scope);
        if let Some(token) = self.tokens.get(&cache_key).filter(|t| t.is_fresh()) {
            return Ok(token.secret().to_string());
        }

        let assertion = self.assertion(subject, scope, Utc::now().timestamp())?;
        let form = [("grant_type", JWT_BEARER_GRANT), ("assertion", assertion.as_str())];
        let token_uri = self.key.token_uri.clone();
        let response = self
            .retry
            .run("Google token request", || {
                http::post_token_form(client, &token_uri, &form)
            })
            .await?;
        debug!("Minted Google access token for {}", subject);

        let token = AccessToken::new(response.access_token, response.expires_in.unwrap_or(3600));
        let secret = token.secret().to_string();
        self.tokens.insert(cache_key, token);
        Ok(secret)
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DirectoryUserName {
    full_name: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DirectoryUser {
    id: Option<String>,
    primary_email: Option<String>,
    name: Option<DirectoryUserName>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DirectoryPage {
    #[serde(default)]
    users: Vec<DirectoryUser>,
    next_page_token: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Profile {
    history_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct MessageRef {
    id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MessageListPage {
    #[serde(default)]
    messages: Vec<MessageRef>,
    next_page_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct MessageAdded {
    message: Option<MessageRef>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct HistoryRecord {
    #[serde(default)]
    messages_added: Vec<MessageAdded>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct HistoryPage {
    #[serde(default)]
    history: Vec<HistoryRecord>,
    next_page_token: Option<String>,
    history_id: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawMessage {
    id: String,
    thread_id: Option<String>,
    #[serde(default)]
    label_ids: Vec<String>,
    raw: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct GmailLabel {
    id: String,
    name: String,
    #[serde(rename = "type", default)]
    kind: Option<String>,
}

#[derive(Debug, Deserialize)]
struct LabelList {
    #[serde(default)]
    labels: Vec<GmailLabel>,
}

fn directory_users(page: Vec<DirectoryUser>) -> impl Iterator<Item = MailboxUser> {
    page.into_iter().filter_map(|user| {
        Some(MailboxUser {
            id: user.id?,
            primary_email: user.primary_email?,
            display_name: user.name?.full_name?,
        })
    })
}

/// Message ids added since the start history id, de-duplicated in order.
fn added_message_ids(history: Vec<HistoryRecord>) -> VecDeque<String> {
    let mut seen = std::collections::HashSet::new();
    history
        .into_iter()
        .flat_map(|record| record.messages_added)
        .filter_map(|added| added.message.map(|m| m.id))
        .filter(|id| seen.insert(id.clone()))
        .collect()
}

/// Folder path from user labels, tags from every label name.
fn map_labels(
    label_ids: &[String],
    labels: &HashMap<String, GmailLabel>,
) -> (Option<String>, Vec<String>) {
    let mut path: Vec<&str> = Vec::new();
    let mut tags = Vec::with_capacity(label_ids.len());
    for id in label_ids {
        match labels.get(id) {
            Some(label) => {
                tags.push(label.name.clone());
                if label.kind.as_deref() == Some("user") {
                    path.push(&label.name);
                }
            }
            None => tags.push(id.clone()),
        }
    }
    let path = (!path.is_empty()).then(|| path.join("/"));
    (path, tags)
}

fn decode_raw(raw: &str) -> Result<Vec<u8>> {
    RAW_ENGINE
        .decode(raw.trim())
        .map_err(|e| ConnectorError::Parse(format!("Invalid base64 message body: {}", e)))
}

/// How the pass discovers message ids.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Listing {
    Full,
    History { start: String },
}

struct GmailPass {
    user: String,
    listing: Listing,
    page_token: Option<String>,
    listing_done: bool,
    pending: VecDeque<String>,
    labels: Option<HashMap<String, GmailLabel>>,
    /// History id to resume from once this pass completes.
    next_history_id: Option<String>,
    started: bool,
    completed: bool,
}

impl GmailPass {
    fn new(user: &str, state: Option<&SyncState>) -> Self {
        let listing = match state.and_then(|s| s.google_history(user)) {
            Some(start) => Listing::History {
                start: start.to_string(),
            },
            None => Listing::Full,
        };
        Self {
            user: user.to_string(),
            listing,
            page_token: None,
            listing_done: false,
            pending: VecDeque::new(),
            labels: None,
            next_history_id: None,
            started: false,
            completed: false,
        }
    }
}

pub struct GoogleWorkspaceConnector {
    admin_email: String,
    auth: ServiceAccountAuth,
    client: Client,
    retry: RetryPolicy,
    pass: Option<GmailPass>,
    status_message: Option<String>,
}

impl GoogleWorkspaceConnector {
    pub fn new(credentials: GoogleWorkspaceCredentials, retry: RetryPolicy) -> Result<Self> {
        let auth = ServiceAccountAuth::from_credentials(&credentials, retry)?;
        Ok(Self {
            admin_email: credentials.impersonated_admin_email,
            auth,
            client: http::create_http_client()?,
            retry,
            pass: None,
            status_message: None,
        })
    }

    async fn get<T: DeserializeOwned>(
        &mut self,
        subject: &str,
        scope: &'static str,
        url: &str,
        query: &[(&str, String)],
    ) -> Result<T> {
        let token = self.auth.token(&self.client, subject, scope).await?;
        let client = &self.client;
        self.retry
            .run("Google API request", || http::get_json(client, url, &token, query))
            .await
    }

    async fn gmail<T: DeserializeOwned>(
        &mut self,
        user: &str,
        path: &str,
        query: &[(&str, String)],
    ) -> Result<T> {
        let url = format!("{}/{}/{}", GMAIL_API_BASE, user, path);
        self.get(user, GMAIL_SCOPE, &url, query).await
    }

    async fn current_history_id(&mut self, user: &str) -> Result<Option<String>> {
        let profile: Profile = self.gmail(user, "profile", &[]).await?;
        Ok(profile.history_id)
    }

    /// Fetches the next page of ids into the pass. Falls back to a full
    /// listing when the stored history id has expired.
    async fn fill_pending(&mut self) -> Result<()> {
        let Some(pass) = self.pass.as_ref() else {
            return Err(ConnectorError::NotStarted);
        };
        let user = pass.user.clone();
        let listing = pass.listing.clone();
        let started = pass.started;
        let mut query = Vec::new();
        if let Some(token) = &pass.page_token {
            query.push(("pageToken", token.clone()));
        }

        match listing {
            Listing::Full => {
                if !started {
                    // Taken before listing so nothing that arrives meanwhile is missed.
                    let history_id = self.current_history_id(&user).await?;
                    if let Some(pass) = self.pass.as_mut() {
                        pass.next_history_id = history_id;
                    }
                }
                query.push(("maxResults", "500".to_string()));
                let page: MessageListPage = self.gmail(&user, "messages", &query).await?;
                if let Some(pass) = self.pass.as_mut() {
                    pass.started = true;
                    pass.pending.extend(page.messages.into_iter().map(|m| m.id));
                    pass.listing_done = page.next_page_token.is_none();
                    pass.page_token = page.next_page_token;
                }
            }
            Listing::History { start } => {
                query.push(("startHistoryId", start.clone()));
                query.push(("historyTypes", "messageAdded".to_string()));
                match self.gmail::<HistoryPage>(&user, "history", &query).await {
                    Ok(page) => {
                        if let Some(pass) = self.pass.as_mut() {
                            pass.started = true;
                            pass.pending.extend(added_message_ids(page.history));
                            if page.history_id.is_some() {
                                pass.next_history_id = page.history_id;
                            } else if pass.next_history_id.is_none() {
                                pass.next_history_id = Some(start);
                            }
                            pass.listing_done = page.next_page_token.is_none();
                            pass.page_token = page.next_page_token;
                        }
                    }
                    Err(ConnectorError::NotFound(_)) if !started => {
                        warn!(
                            "History id {} for {} expired, falling back to a full listing",
                            start, user
                        );
                        if let Some(pass) = self.pass.as_mut() {
                            pass.listing = Listing::Full;
                            pass.page_token = None;
                        }
                    }
                    Err(e) => return Err(e),
                }
            }
        }
        Ok(())
    }

    async fn load_labels(&mut self, user: &str) -> Result<()> {
        if self.pass.as_ref().is_some_and(|p| p.labels.is_some()) {
            return Ok(());
        }
        let list: LabelList = self.gmail(user, "labels", &[]).await?;
        let labels = list
            .labels
            .into_iter()
            .map(|label| (label.id.clone(), label))
            .collect();
        if let Some(pass) = self.pass.as_mut() {
            pass.labels = Some(labels);
        }
        Ok(())
    }

    async fn fetch_message(&mut self, user: &str, id: &str) -> Result<EmailObject> {
        self.load_labels(user).await?;
        let message: RawMessage = self
            .gmail(user, &format!("messages/{}", id), &[("format", "raw".to_string())])
            .await?;
        let raw = message
            .raw
            .as_deref()
            .ok_or_else(|| ConnectorError::Parse(format!("Message {} has no raw body", id)))
            .and_then(decode_raw)?;

        let empty = HashMap::new();
        let labels = self
            .pass
            .as_ref()
            .and_then(|p| p.labels.as_ref())
            .unwrap_or(&empty);
        let (path, tags) = map_labels(&message.label_ids, labels);

        let ctx = RawContext::new(message.id)
            .thread(message.thread_id)
            .path(path)
            .tags(tags);
        parse_raw_email(&raw, ctx)
    }

    async fn next_inner(&mut self) -> Result<Option<EmailObject>> {
        loop {
            let Some(pass) = self.pass.as_mut() else {
                return Err(ConnectorError::NotStarted);
            };
            if let Some(id) = pass.pending.pop_front() {
                let user = pass.user.clone();
                return self.fetch_message(&user, &id).await.map(Some);
            }
            if pass.listing_done {
                pass.completed = true;
                return Ok(None);
            }
            self.fill_pending().await?;
        }
    }
}

#[async_trait]
impl EmailConnector for GoogleWorkspaceConnector {
    fn provider(&self) -> ProviderKind {
        ProviderKind::GoogleWorkspace
    }

    async fn test_connection(&mut self) -> Result<bool> {
        let admin = self.admin_email.clone();
        let query = [
            ("customer", "my_customer".to_string()),
            ("maxResults", "1".to_string()),
            ("orderBy", "email".to_string()),
        ];
        let _: DirectoryPage = self
            .get(&admin, DIRECTORY_SCOPE, DIRECTORY_USERS_URL, &query)
            .await?;
        info!("Google Workspace connection test successful");
        Ok(true)
    }

    async fn list_all_users(&mut self) -> Result<Vec<MailboxUser>> {
        let admin = self.admin_email.clone();
        let mut users = Vec::new();
        let mut page_token: Option<String> = None;
        loop {
            let mut query = vec![
                ("customer", "my_customer".to_string()),
                ("maxResults", "500".to_string()),
                ("orderBy", "email".to_string()),
            ];
            if let Some(token) = page_token.take() {
                query.push(("pageToken", token));
            }
            let page: DirectoryPage = self
                .get(&admin, DIRECTORY_SCOPE, DIRECTORY_USERS_URL, &query)
                .await?;
            users.extend(directory_users(page.users));
            match page.next_page_token {
                Some(token) => page_token = Some(token),
                None => break,
            }
        }
        info!("Found {} Google Workspace user(s)", users.len());
        Ok(users)
    }

    async fn start_fetch(&mut self, user_email: &str, state: Option<&SyncState>) -> Result<()> {
        let pass = GmailPass::new(user_email, state);
        debug!("Starting Gmail pass for {} ({:?})", user_email, pass.listing);
        self.pass = Some(pass);
        self.status_message = None;
        Ok(())
    }

    async fn next_email(&mut self) -> Result<Option<EmailObject>> {
        match self.next_inner().await {
            Err(ConnectorError::RetriesExhausted { attempts, last }) => {
                // The mailbox is abandoned for this cycle; its history id stays put.
                warn!(
                    "Gmail pass abandoned after {} attempts: {}",
                    attempts, last
                );
                self.status_message = Some(RATE_LIMIT_MESSAGE.to_string());
                if let Some(pass) = self.pass.as_mut() {
                    pass.pending.clear();
                    pass.listing_done = true;
                    pass.completed = false;
                }
                Ok(None)
            }
            Err(e) if e.is_skippable() => {
                warn!("Skipping Gmail message: {}", e);
                Err(e)
            }
            other => other,
        }
    }

    async fn finish_fetch(&mut self) {
        if let Some(pass) = self.pass.as_mut() {
            pass.pending.clear();
            pass.labels = None;
        }
    }

    fn updated_sync_state(&self, user_email: &str) -> SyncState {
        match &self.pass {
            Some(pass) if pass.completed && pass.user == user_email => match &pass.next_history_id {
                Some(history_id) => SyncState::Google(BTreeMap::from([(
                    user_email.to_string(),
                    HistoryCursor {
                        history_id: history_id.clone(),
                    },
                )])),
                None => SyncState::Empty,
            },
            _ => SyncState::Empty,
        }
    }

    fn status_message(&self) -> Option<String> {
        self.status_message.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn label(id: &str, name: &str, kind: &str) -> (String, GmailLabel) {
        (
            id.to_string(),
            GmailLabel {
                id: id.to_string(),
                name: name.to_string(),
                kind: Some(kind.to_string()),
            },
        )
    }

    #[test]
    fn test_invalid_key_json_is_config_error() {
        let creds = GoogleWorkspaceCredentials {
            service_account_key_json: "{not json".into(),
            impersonated_admin_email: "admin@example.com".into(),
        };
        assert!(matches!(
            GoogleWorkspaceConnector::new(creds, RetryPolicy::default()),
            Err(ConnectorError::Config(_))
        ));
    }

    #[test]
    fn test_invalid_private_key_is_config_error() {
        let creds = GoogleWorkspaceCredentials {
            service_account_key_json:
                r#"{"client_email":"sa@proj.iam.gserviceaccount.com","private_key":"nope"}"#.into(),
            impersonated_admin_email: "admin@example.com".into(),
        };
        assert!(matches!(
            GoogleWorkspaceConnector::new(creds, RetryPolicy::default()),
            Err(ConnectorError::Config(_))
        ));
    }

    #[test]
    fn test_map_labels() {
        let labels: HashMap<_, _> = [
            label("INBOX", "INBOX", "system"),
            label("Label_1", "Clients", "user"),
            label("Label_2", "Acme", "user"),
        ]
        .into_iter()
        .collect();
        let ids = vec![
            "INBOX".to_string(),
            "Label_1".to_string(),
            "Label_2".to_string(),
            "CATEGORY_UPDATES".to_string(),
        ];
        let (path, tags) = map_labels(&ids, &labels);
        assert_eq!(path.as_deref(), Some("Clients/Acme"));
        assert_eq!(tags, vec!["INBOX", "Clients", "Acme", "CATEGORY_UPDATES"]);

        let (path, _) = map_labels(&["INBOX".to_string()], &labels);
        assert!(path.is_none());
    }

    #[test]
    fn test_decode_raw_with_and_without_padding() {
        let encoded = base64::engine::general_purpose::URL_SAFE.encode(b"Subject: hi\r\n\r\n?>");
        assert_eq!(decode_raw(&encoded).unwrap(), b"Subject: hi\r\n\r\n?>");
        let unpadded = encoded.trim_end_matches('=');
        assert_eq!(decode_raw(unpadded).unwrap(), b"Subject: hi\r\n\r\n?>");
        assert!(matches!(decode_raw("***"), Err(ConnectorError::Parse(_))));
    }

    #[test]
    fn test_added_message_ids_dedup() {
        let page: HistoryPage = serde_json::from_str(
            r#"{"history":[
                {"messagesAdded":[{"message":{"id":"a"}},{"message":{"id":"b"}}]},
                {"messagesAdded":[{"message":{"id":"a"}}]},
                {"id":"9"}
            ],"historyId":"120"}"#,
        )
        .unwrap();
        assert_eq!(page.history_id.as_deref(), Some("120"));
        assert_eq!(
            added_message_ids(page.history),
            VecDeque::from(vec!["a".to_string(), "b".to_string()])
        );
    }

    #[test]
    fn test_directory_users_need_full_identity() {
        let page: DirectoryPage = serde_json::from_str(
            r#"{"users":[
                {"id":"1","primaryEmail":"a@example.com","name":{"fullName":"Ann"}},
                {"id":"2","primaryEmail":"b@example.com","name":{}}
            ],"nextPageToken":"n"}"#,
        )
        .unwrap();
        let users: Vec<_> = directory_users(page.users).collect();
        assert_eq!(users.len(), 1);
        assert_eq!(users[0].display_name, "Ann");
    }

    #[test]
    fn test_pass_listing_from_state() {
        assert_eq!(GmailPass::new("u@example.com", None).listing, Listing::Full);
        let state = SyncState::Google(BTreeMap::from([(
            "u@example.com".to_string(),
            HistoryCursor {
                history_id: "77".to_string(),
            },
        )]));
        assert_eq!(
            GmailPass::new("u@example.com", Some(&state)).listing,
            Listing::History {
                start: "77".to_string()
            }
        );
        assert_eq!(GmailPass::new("other@example.com", Some(&state)).listing, Listing::Full);
    }
}
