//! Thin reqwest helpers shared by the hosted-platform connectors.

use std::time::{Duration, Instant};

use log::debug;
use reqwest::{Client, Response};
use secrecy::{ExposeSecret, SecretString};
use serde::de::DeserializeOwned;
use serde::Deserialize;

use super::{ConnectorError, Result};

/// Default connect timeout for HTTP requests (10 seconds).
const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Default request timeout for HTTP requests (60 seconds). Raw message
/// downloads can be large.
const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

/// Tokens are refreshed this long before they actually expire.
const EXPIRY_MARGIN: Duration = Duration::from_secs(60);

/// Creates an HTTP client with appropriate timeouts.
pub(crate) fn create_http_client() -> Result<Client> {
    Client::builder()
        .connect_timeout(DEFAULT_CONNECT_TIMEOUT)
        .timeout(DEFAULT_REQUEST_TIMEOUT)
        .build()
        .map_err(|e| ConnectorError::Config(format!("Failed to create HTTP client: {}", e)))
}

/// Response from an OAuth2 token endpoint.
#[derive(Debug, Clone, Deserialize)]
pub(crate) struct TokenResponse {
    pub access_token: String,
    #[serde(default)]
    pub expires_in: Option<u64>,
    #[serde(default)]
    pub refresh_token: Option<String>,
    /// Space-separated scopes actually granted.
    #[serde(default)]
    pub scope: Option<String>,
}

/// A bearer token with its local expiry.
pub(crate) struct AccessToken {
    token: SecretString,
    expires_at: Instant,
}

impl AccessToken {
    pub fn new(token: impl Into<String>, expires_in_secs: u64) -> Self {
        Self {
            token: SecretString::from(token.into()),
            expires_at: Instant::now() + Duration::from_secs(expires_in_secs),
        }
    }

    pub fn is_fresh(&self) -> bool {
        Instant::now() + EXPIRY_MARGIN < self.expires_at
    }

    pub fn secret(&self) -> &str {
        self.token.expose_secret()
    }
}

/// Posts a form to a token endpoint. Rejections other than throttling or
/// server errors are reported as authentication failures.
pub(crate) async fn post_token_form(
    client: &Client,
    url: &str,
    form: &[(&str, &str)],
) -> Result<TokenResponse> {
    debug!("Requesting access token from {}", url);
    let response = client.post(url).form(form).send().await?;
    let status = response.status().as_u16();
    if !response.status().is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(if status == 429 || status >= 500 {
            ConnectorError::from_status(status, &body)
        } else {
            ConnectorError::Auth(format!("token endpoint returned {}", status))
        });
    }
    Ok(response.json().await?)
}

async fn check(response: Response) -> Result<Response> {
    if response.status().is_success() {
        return Ok(response);
    }
    let status = response.status().as_u16();
    let retry_after = response
        .headers()
        .get(reqwest::header::RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    let body = response.text().await.unwrap_or_default();
    Err(match (ConnectorError::from_status(status, &body), retry_after) {
        (ConnectorError::RateLimited(msg), Some(after)) => {
            ConnectorError::RateLimited(format!("retry after {}s: {}", after, msg))
        }
        (e, _) => e,
    })
}

pub(crate) async fn get_json<T: DeserializeOwned>(
    client: &Client,
    url: &str,
    token: &str,
    query: &[(&str, String)],
) -> Result<T> {
    let response = client.get(url).bearer_auth(token).query(query).send().await?;
    Ok(check(response).await?.json().await?)
}

pub(crate) async fn get_bytes(client: &Client, url: &str, token: &str) -> Result<Vec<u8>> {
    let response = client.get(url).bearer_auth(token).send().await?;
    Ok(check(response).await?.bytes().await?.to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_access_token_freshness() {
        assert!(AccessToken::new("t", 3600).is_fresh());
        assert!(!AccessToken::new("t", 30).is_fresh());
        assert_eq!(AccessToken::new("abc", 10).secret(), "abc");
    }

    #[test]
    fn test_token_response_optional_fields() {
        let parsed: TokenResponse = serde_json::from_str(r#"{"access_token":"a"}"#).unwrap();
        assert_eq!(parsed.access_token, "a");
        assert!(parsed.refresh_token.is_none());
        assert!(parsed.expires_in.is_none());
    }
}
