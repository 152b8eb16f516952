//! Outlook.com personal accounts, accessed through Graph `/me` with a
//! delegated refresh token obtained via the PKCE flow.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::Utc;
use log::{debug, info};
use reqwest::Client;
use secrecy::ExposeSecret;

use crate::factory::{OutlookAppCredentials, OutlookPersonalCredentials, ProviderCredentials};
use crate::retry::RetryPolicy;
use crate::source::ProviderKind;
use crate::sync_state::{DeltaCursor, SyncState};

use super::graph::{GraphAuth, GraphMailbox, GraphUser, GRAPH_API_BASE};
use super::http;
use super::message::{parse_raw_email, RawContext};
use super::{ConnectorError, EmailConnector, EmailObject, MailboxUser, Result};

pub(crate) const OUTLOOK_TOKEN_URL: &str =
    "https://login.microsoftonline.com/common/oauth2/v2.0/token";

/// Refresh this long before the stored expiry.
const EXPIRY_MARGIN_MS: i64 = 60_000;

/// Keeps the delegated tokens current, rotating the refresh token when the
/// endpoint issues a new one.
struct RefreshTokenAuth {
    credentials: OutlookPersonalCredentials,
    app: OutlookAppCredentials,
    retry: RetryPolicy,
    rotated: bool,
}

impl RefreshTokenAuth {
    fn cached_token(&self, now_ms: i64) -> Option<&str> {
        match (&self.credentials.access_token, self.credentials.expires_at) {
            (Some(token), Some(expires_at)) if expires_at - EXPIRY_MARGIN_MS > now_ms => {
                Some(token.as_str())
            }
            _ => None,
        }
    }

    fn apply(&mut self, response: http::TokenResponse, now_ms: i64) {
        let lifetime_ms = response.expires_in.unwrap_or(3600) as i64 * 1000;
        self.credentials.access_token = Some(response.access_token);
        self.credentials.expires_at = Some(now_ms + lifetime_ms);
        if let Some(refresh) = response.refresh_token {
            self.credentials.refresh_token = refresh;
        }
        self.rotated = true;
    }
}

#[async_trait]
impl GraphAuth for RefreshTokenAuth {
    async fn access_token(&mut self, client: &Client) -> Result<String> {
        if let Some(token) = self.cached_token(Utc::now().timestamp_millis()) {
            return Ok(token.to_string());
        }

        let scope = self.credentials.scopes.join(" ");
        let form = [
            ("client_id", self.app.client_id.as_str()),
            ("client_secret", self.app.client_secret.expose_secret()),
            ("refresh_token", self.credentials.refresh_token.as_str()),
            ("grant_type", "refresh_token"),
            ("scope", scope.as_str()),
        ];
        let response = self
            .retry
            .run("Outlook token refresh", || {
                http::post_token_form(client, OUTLOOK_TOKEN_URL, &form)
            })
            .await?;
        debug!("Refreshed Outlook access token for {}", self.credentials.account_email);

        let token = response.access_token.clone();
        self.apply(response, Utc::now().timestamp_millis());
        Ok(token)
    }
}

pub struct OutlookPersonalConnector {
    auth: RefreshTokenAuth,
    mailbox: GraphMailbox,
}

impl OutlookPersonalConnector {
    pub fn new(
        credentials: OutlookPersonalCredentials,
        app: OutlookAppCredentials,
        retry: RetryPolicy,
    ) -> Result<Self> {
        if credentials.refresh_token.is_empty() {
            return Err(ConnectorError::Config(
                "Outlook account has no refresh token; reconnect the account".to_string(),
            ));
        }
        Ok(Self {
            auth: RefreshTokenAuth {
                credentials,
                app,
                retry,
                rotated: false,
            },
            mailbox: GraphMailbox::new(retry)?,
        })
    }

    fn me_url() -> String {
        format!("{}/me", GRAPH_API_BASE)
    }
}

#[async_trait]
impl EmailConnector for OutlookPersonalConnector {
    fn provider(&self) -> ProviderKind {
        ProviderKind::OutlookPersonal
    }

    async fn test_connection(&mut self) -> Result<bool> {
        let _: GraphUser = self
            .mailbox
            .get_json(&mut self.auth, &Self::me_url(), &[])
            .await?;
        info!("Outlook personal connection test successful");
        Ok(true)
    }

    async fn list_all_users(&mut self) -> Result<Vec<MailboxUser>> {
        let select = [("$select", "id,userPrincipalName,displayName".to_string())];
        let me: GraphUser = self
            .mailbox
            .get_json(&mut self.auth, &Self::me_url(), &select)
            .await?;

        let (Some(id), Some(upn)) = (me.id, me.user_principal_name) else {
            return Ok(Vec::new());
        };
        Ok(vec![MailboxUser {
            id,
            display_name: me.display_name.unwrap_or_else(|| upn.clone()),
            primary_email: upn,
        }])
    }

    async fn start_fetch(&mut self, user_email: &str, state: Option<&SyncState>) -> Result<()> {
        let previous = state.and_then(|s| s.delta_tokens(user_email));
        self.mailbox.start(Self::me_url(), previous);
        Ok(())
    }

    async fn next_email(&mut self) -> Result<Option<EmailObject>> {
        let Some(message) = self.mailbox.next_message(&mut self.auth).await? else {
            return Ok(None);
        };
        let ctx = RawContext::new(message.id)
            .thread(message.conversation_id)
            .path(Some(message.folder_path));
        parse_raw_email(&message.raw, ctx).map(Some)
    }

    async fn finish_fetch(&mut self) {
        self.mailbox.finish();
    }

    fn updated_sync_state(&self, user_email: &str) -> SyncState {
        let tokens = self.mailbox.delta_tokens();
        if tokens.is_empty() {
            return SyncState::Empty;
        }
        SyncState::OutlookPersonal(BTreeMap::from([(
            user_email.to_string(),
            DeltaCursor {
                delta_tokens: tokens.clone(),
            },
        )]))
    }

    fn status_message(&self) -> Option<String> {
        self.mailbox.status_message()
    }

    fn updated_credentials(&self) -> Option<ProviderCredentials> {
        self.auth
            .rotated
            .then(|| ProviderCredentials::OutlookPersonal(self.auth.credentials.clone()))
    }
}
