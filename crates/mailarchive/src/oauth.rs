//! Authorization code flow with PKCE for Outlook.com personal accounts.
//!
//! `initiate` hands back the URL the user visits plus an opaque state; the
//! matching code verifier stays server-side for ten minutes and can be
//! consumed exactly once by `complete`.

use std::time::Duration;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::Utc;
use log::{debug, info, warn};
use moka::sync::Cache;
use rand::RngCore;
use reqwest::{Client, Url};
use secrecy::ExposeSecret;
use serde::Deserialize;
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::connector::http::{self, TokenResponse};
use crate::connector::outlook_personal::OUTLOOK_TOKEN_URL;
use crate::connector::ConnectorError;
use crate::factory::{OutlookAppCredentials, OutlookPersonalCredentials};

const AUTHORIZE_URL: &str = "https://login.microsoftonline.com/common/oauth2/v2.0/authorize";
const ME_URL: &str = "https://graph.microsoft.com/v1.0/me";
const DEFAULT_SCOPES: &[&str] = &["User.Read", "Mail.Read", "offline_access"];

/// How long an authorization may stay pending.
const STATE_TTL: Duration = Duration::from_secs(600);
const MAX_PENDING: u64 = 10_000;

#[derive(Debug, Error)]
pub enum OAuthError {
    #[error("Outlook personal OAuth is not configured: {0}")]
    NotConfigured(String),

    /// Unknown, expired or already used state.
    #[error("Invalid or expired authorization state")]
    InvalidState,

    #[error("Token endpoint did not return a refresh token")]
    MissingRefreshToken,

    #[error("Could not determine the account email address")]
    MissingEmail,

    #[error(transparent)]
    Connector(#[from] ConnectorError),
}

pub type Result<T> = std::result::Result<T, OAuthError>;

/// What the caller sends the user to.
#[derive(Debug, Clone)]
pub struct AuthorizationRequest {
    pub auth_url: String,
    pub state: String,
}

/// A finished authorization, ready to become an ingestion source.
#[derive(Clone)]
pub struct CompletedAuthorization {
    pub user_id: String,
    pub credentials: OutlookPersonalCredentials,
}

#[derive(Clone)]
struct PendingAuthorization {
    user_id: String,
    code_verifier: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MeResponse {
    user_principal_name: Option<String>,
    mail: Option<String>,
}

/// 32 random bytes, base64url without padding (43 chars).
fn generate_code_verifier() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

/// S256 challenge for a verifier.
fn code_challenge(verifier: &str) -> String {
    URL_SAFE_NO_PAD.encode(Sha256::digest(verifier.as_bytes()))
}

pub struct OutlookPkceFlow {
    app: OutlookAppCredentials,
    redirect_uri: String,
    client: Client,
    pending: Cache<String, PendingAuthorization>,
}

impl OutlookPkceFlow {
    pub fn new(app: OutlookAppCredentials, redirect_uri: impl Into<String>) -> Result<Self> {
        let redirect_uri = redirect_uri.into();
        if app.client_id.is_empty() || redirect_uri.is_empty() {
            return Err(OAuthError::NotConfigured(
                "client id and redirect uri are required".to_string(),
            ));
        }
        Ok(Self {
            app,
            redirect_uri,
            client: http::create_http_client()?,
            pending: Cache::builder()
                .max_capacity(MAX_PENDING)
                .time_to_live(STATE_TTL)
                .build(),
        })
    }

    /// Starts an authorization on behalf of `user_id`.
    pub fn initiate(&self, user_id: &str) -> Result<AuthorizationRequest> {
        let code_verifier = generate_code_verifier();
        let state = uuid::Uuid::new_v4().to_string();
        let scope = DEFAULT_SCOPES.join(" ");

        let auth_url = Url::parse_with_params(
            AUTHORIZE_URL,
            &[
                ("client_id", self.app.client_id.as_str()),
                ("response_type", "code"),
                ("redirect_uri", self.redirect_uri.as_str()),
                ("response_mode", "query"),
                ("scope", scope.as_str()),
                ("state", state.as_str()),
                ("code_challenge", code_challenge(&code_verifier).as_str()),
                ("code_challenge_method", "S256"),
            ],
        )
        .map_err(|e| OAuthError::NotConfigured(format!("invalid authorize url: {}", e)))?;

        self.pending.insert(
            state.clone(),
            PendingAuthorization {
                user_id: user_id.to_string(),
                code_verifier,
            },
        );
        debug!("Initiated Outlook authorization for user {}", user_id);

        Ok(AuthorizationRequest {
            auth_url: auth_url.into(),
            state,
        })
    }

    /// Consumes the pending state. A state works once.
    fn take_pending(&self, state: &str) -> Result<PendingAuthorization> {
        self.pending.remove(state).ok_or(OAuthError::InvalidState)
    }

    /// Exchanges the authorization code and looks up the account address.
    pub async fn complete(&self, code: &str, state: &str) -> Result<CompletedAuthorization> {
        let pending = self.take_pending(state)?;

        let form = [
            ("client_id", self.app.client_id.as_str()),
            ("client_secret", self.app.client_secret.expose_secret()),
            ("code", code),
            ("redirect_uri", self.redirect_uri.as_str()),
            ("grant_type", "authorization_code"),
            ("code_verifier", pending.code_verifier.as_str()),
        ];
        let tokens = http::post_token_form(&self.client, OUTLOOK_TOKEN_URL, &form)
            .await
            .inspect_err(|e| warn!("Outlook code exchange failed: {}", e))?;

        let me: MeResponse = http::get_json(&self.client, ME_URL, &tokens.access_token, &[]).await?;
        let account_email = me
            .user_principal_name
            .or(me.mail)
            .ok_or(OAuthError::MissingEmail)?;

        let credentials = credentials_from_tokens(account_email, tokens, Utc::now().timestamp_millis())?;
        info!("Completed Outlook authorization for {}", credentials.account_email);
        Ok(CompletedAuthorization {
            user_id: pending.user_id,
            credentials,
        })
    }
}

fn credentials_from_tokens(
    account_email: String,
    tokens: TokenResponse,
    now_ms: i64,
) -> Result<OutlookPersonalCredentials> {
    let refresh_token = tokens.refresh_token.ok_or(OAuthError::MissingRefreshToken)?;
    let scopes = match tokens.scope.as_deref() {
        Some(scope) => scope.split_whitespace().map(str::to_string).collect(),
        None => DEFAULT_SCOPES.iter().map(|s| s.to_string()).collect(),
    };
    Ok(OutlookPersonalCredentials {
        account_email,
        refresh_token,
        expires_at: Some(now_ms + tokens.expires_in.unwrap_or(3600) as i64 * 1000),
        access_token: Some(tokens.access_token),
        scopes,
    })
}

#[cfg(test)]
mod tests {
    use secrecy::SecretString;

    use super::*;

    fn flow() -> OutlookPkceFlow {
        OutlookPkceFlow::new(
            OutlookAppCredentials {
                client_id: "app-id".into(),
                client_secret: SecretString::from("secret"),
            },
            "https://archive.example.com/oauth/callback",
        )
        .unwrap()
    }

    #[test]
    fn test_code_challenge_matches_rfc_7636_example() {
        assert_eq!(
            code_challenge("dBjftJeZ4CVP-mB92K27uhbUJU1p1r_wW1gFWFOEjXk"),
            "E9Melhoa2OwvFrEMTJguCHaoeK1t8URWbuGJSstw-cM"
        );
    }

    #[test]
    fn test_verifier_shape() {
        let verifier = generate_code_verifier();
        assert_eq!(verifier.len(), 43);
        assert_ne!(verifier, generate_code_verifier());
    }

    #[test]
    fn test_initiate_builds_url_and_stores_state() {
        let flow = flow();
        let request = flow.initiate("user-1").unwrap();
        let url = Url::parse(&request.auth_url).unwrap();
        let params: std::collections::HashMap<_, _> = url.query_pairs().into_owned().collect();

        assert_eq!(params["client_id"], "app-id");
        assert_eq!(params["state"], request.state);
        assert_eq!(params["code_challenge_method"], "S256");
        assert_eq!(params["scope"], "User.Read Mail.Read offline_access");

        let pending = flow.take_pending(&request.state).unwrap();
        assert_eq!(pending.user_id, "user-1");
        assert_eq!(params["code_challenge"], code_challenge(&pending.code_verifier));
    }

    #[test]
    fn test_state_is_single_use() {
        let flow = flow();
        let request = flow.initiate("user-1").unwrap();
        assert!(flow.take_pending(&request.state).is_ok());
        assert!(matches!(
            flow.take_pending(&request.state),
            Err(OAuthError::InvalidState)
        ));
        assert!(matches!(
            flow.take_pending("never-issued"),
            Err(OAuthError::InvalidState)
        ));
    }

    #[tokio::test]
    async fn test_complete_rejects_unknown_state() {
        assert!(matches!(
            flow().complete("code", "bogus").await,
            Err(OAuthError::InvalidState)
        ));
    }

    #[test]
    fn test_requires_client_id() {
        let result = OutlookPkceFlow::new(
            OutlookAppCredentials {
                client_id: String::new(),
                client_secret: SecretString::from("secret"),
            },
            "https://archive.example.com/cb",
        );
        assert!(matches!(result, Err(OAuthError::NotConfigured(_))));
    }

    #[test]
    fn test_credentials_from_tokens() {
        let tokens = TokenResponse {
            access_token: "access".into(),
            expires_in: Some(3600),
            refresh_token: Some("refresh".into()),
            scope: Some("Mail.Read offline_access".into()),
        };
        let creds = credentials_from_tokens("me@outlook.com".into(), tokens, 1_000).unwrap();
        assert_eq!(creds.scopes, vec!["Mail.Read", "offline_access"]);
        assert_eq!(creds.expires_at, Some(3_601_000));

        let no_refresh = TokenResponse {
            access_token: "access".into(),
            expires_in: None,
            refresh_token: None,
            scope: None,
        };
        assert!(matches!(
            credentials_from_tokens("me@outlook.com".into(), no_refresh, 0),
            Err(OAuthError::MissingRefreshToken)
        ));
    }
}
