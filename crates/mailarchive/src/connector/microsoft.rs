//! Microsoft 365 connector using app-only (client credentials) Graph access
//! across every mailbox of the tenant.

use std::collections::BTreeMap;

use async_trait::async_trait;
use log::{debug, info};
use reqwest::Client;

use crate::factory::Microsoft365Credentials;
use crate::retry::RetryPolicy;
use crate::source::ProviderKind;
use crate::sync_state::{DeltaCursor, SyncState};

use super::graph::{GraphAuth, GraphMailbox, GraphUser, GRAPH_API_BASE};
use super::http::{self, AccessToken};
use super::message::{parse_raw_email, RawContext};
use super::{ConnectorError, EmailConnector, EmailObject, MailboxUser, Result};

const GRAPH_SCOPE: &str = "https://graph.microsoft.com/.default";

/// Default token lifetime when the endpoint omits `expires_in`.
const DEFAULT_TOKEN_LIFETIME_SECS: u64 = 3600;

#[derive(Debug, serde::Deserialize)]
struct UserPage {
    #[serde(default)]
    value: Vec<GraphUser>,
    #[serde(rename = "@odata.nextLink")]
    next_link: Option<String>,
}

/// Users with all three identity fields; others cannot be archived.
fn mailbox_users(users: Vec<GraphUser>) -> impl Iterator<Item = MailboxUser> {
    users.into_iter().filter_map(|user| {
        Some(MailboxUser {
            id: user.id?,
            primary_email: user.user_principal_name?,
            display_name: user.display_name?,
        })
    })
}

struct ClientCredentialsAuth {
    credentials: Microsoft365Credentials,
    retry: RetryPolicy,
    token: Option<AccessToken>,
}

impl ClientCredentialsAuth {
    fn token_url(&self) -> String {
        format!(
            "https://login.microsoftonline.com/{}/oauth2/v2.0/token",
            self.credentials.tenant_id
        )
    }
}

#[async_trait]
impl GraphAuth for ClientCredentialsAuth {
    async fn access_token(&mut self, client: &Client) -> Result<String> {
        if let Some(token) = self.token.as_ref().filter(|t| t.is_fresh()) {
            return Ok(token.secret().to_string());
        }

        let url = self.token_url();
        let form = [
            ("client_id", self.credentials.client_id.as_str()),
            ("client_secret", self.credentials.client_secret.as_str()),
            ("scope", GRAPH_SCOPE),
            ("grant_type", "client_credentials"),
        ];
        let response = self
            .retry
            .run("Microsoft token request", || {
                http::post_token_form(client, &url, &form)
            })
            .await?;
        debug!("Acquired Microsoft Graph app token");

        let token = AccessToken::new(
            response.access_token,
            response.expires_in.unwrap_or(DEFAULT_TOKEN_LIFETIME_SECS),
        );
        let secret = token.secret().to_string();
        self.token = Some(token);
        Ok(secret)
    }
}

pub struct MicrosoftConnector {
    auth: ClientCredentialsAuth,
    mailbox: GraphMailbox,
}

impl MicrosoftConnector {
    pub fn new(credentials: Microsoft365Credentials, retry: RetryPolicy) -> Result<Self> {
        if credentials.client_id.is_empty()
            || credentials.client_secret.is_empty()
            || credentials.tenant_id.is_empty()
        {
            return Err(ConnectorError::Config(
                "Microsoft 365 client id, secret and tenant id are required".to_string(),
            ));
        }
        Ok(Self {
            auth: ClientCredentialsAuth {
                credentials,
                retry,
                token: None,
            },
            mailbox: GraphMailbox::new(retry)?,
        })
    }
}

#[async_trait]
impl EmailConnector for MicrosoftConnector {
    fn provider(&self) -> ProviderKind {
        ProviderKind::Microsoft365
    }

    async fn test_connection(&mut self) -> Result<bool> {
        let url = format!("{}/users", GRAPH_API_BASE);
        let _: UserPage = self
            .mailbox
            .get_json(&mut self.auth, &url, &[("$top", "1".to_string())])
            .await?;
        info!("Microsoft 365 connection test successful");
        Ok(true)
    }

    async fn list_all_users(&mut self) -> Result<Vec<MailboxUser>> {
        let mut users = Vec::new();
        let first = format!("{}/users", GRAPH_API_BASE);
        let select = [("$select", "id,userPrincipalName,displayName".to_string())];

        let mut page: UserPage = self.mailbox.get_json(&mut self.auth, &first, &select).await?;
        loop {
            users.extend(mailbox_users(page.value));
            let Some(next) = page.next_link else { break };
            page = self.mailbox.get_json(&mut self.auth, &next, &[]).await?;
        }
        info!("Found {} Microsoft 365 mailbox(es)", users.len());
        Ok(users)
    }

    async fn start_fetch(&mut self, user_email: &str, state: Option<&SyncState>) -> Result<()> {
        let previous = state.and_then(|s| s.delta_tokens(user_email));
        self.mailbox
            .start(format!("{}/users/{}", GRAPH_API_BASE, user_email), previous);
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
        SyncState::Microsoft(BTreeMap::from([(
            user_email.to_string(),
            DeltaCursor {
                delta_tokens: tokens.clone(),
            },
        )]))
    }

    fn status_message(&self) -> Option<String> {
        self.mailbox.status_message()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn credentials() -> Microsoft365Credentials {
        Microsoft365Credentials {
            client_id: "client".into(),
            client_secret: "secret".into(),
            tenant_id: "contoso.onmicrosoft.com".into(),
        }
    }

    #[test]
    fn test_users_missing_fields_are_skipped() {
        let page: UserPage = serde_json::from_str(
            r#"{"value":[
                {"id":"1","userPrincipalName":"a@contoso.com","displayName":"A"},
                {"id":"2","userPrincipalName":"b@contoso.com"},
                {"id":"3","userPrincipalName":"c@contoso.com","displayName":"C"}
            ]}"#,
        )
        .unwrap();
        let users: Vec<_> = mailbox_users(page.value).collect();
        assert_eq!(users.len(), 2);
        assert_eq!(users[1].primary_email, "c@contoso.com");
    }

    #[test]
    fn test_token_url_uses_tenant() {
        let auth = ClientCredentialsAuth {
            credentials: credentials(),
            retry: RetryPolicy::immediate(1),
            token: None,
        };
        assert_eq!(
            auth.token_url(),
            "https://login.microsoftonline.com/contoso.onmicrosoft.com/oauth2/v2.0/token"
        );
    }

    #[test]
    fn test_requires_all_credentials() {
        let mut creds = credentials();
        creds.tenant_id.clear();
        assert!(matches!(
            MicrosoftConnector::new(creds, RetryPolicy::default()),
            Err(ConnectorError::Config(_))
        ));
    }

    #[tokio::test]
    async fn test_no_delta_links_means_empty_state() {
        let mut connector = MicrosoftConnector::new(credentials(), RetryPolicy::immediate(1)).unwrap();
        connector.start_fetch("a@contoso.com", None).await.unwrap();
        assert_eq!(connector.updated_sync_state("a@contoso.com"), SyncState::Empty);
    }

    #[tokio::test]
    async fn test_resumes_user_delta_links() {
        let mut connector = MicrosoftConnector::new(credentials(), RetryPolicy::immediate(1)).unwrap();
        let state = SyncState::Microsoft(BTreeMap::from([(
            "a@contoso.com".to_string(),
            DeltaCursor {
                delta_tokens: BTreeMap::from([("inbox".to_string(), "link".to_string())]),
            },
        )]));
        connector.start_fetch("a@contoso.com", Some(&state)).await.unwrap();
        assert_eq!(connector.updated_sync_state("a@contoso.com"), state);
    }
}
