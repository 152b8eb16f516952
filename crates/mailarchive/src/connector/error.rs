//! Connector error types.

use thiserror::Error;

/// Errors raised by provider connectors.
#[derive(Error, Debug)]
pub enum ConnectorError {
    /// Credentials or settings are malformed.
    #[error("Invalid connector configuration: {0}")]
    Config(String),

    /// The declared provider is unknown or does not match the credentials.
    #[error("Unsupported provider: {0}")]
    UnsupportedProvider(String),

    /// The provider rejected the credentials.
    #[error("Authentication failed: {0}")]
    Auth(String),

    /// Connection-level failure (DNS, TCP, TLS, timeout).
    #[error("Network error: {0}")]
    Network(String),

    /// Unexpected HTTP status from a provider API.
    #[error("HTTP {status}: {message}")]
    Http { status: u16, message: String },

    /// The provider throttled us.
    #[error("Rate limited by provider: {0}")]
    RateLimited(String),

    /// A single item vanished between listing and fetching.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Mail protocol error (IMAP responses, unexpected payloads).
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// A single message could not be parsed.
    #[error("Failed to parse email: {0}")]
    Parse(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Archive error: {0}")]
    Zip(#[from] zip::result::ZipError),

    /// A transient failure persisted through every retry.
    #[error("Gave up after {attempts} attempts: {last}")]
    RetriesExhausted { attempts: u32, last: String },

    /// `next_email` was called without a preceding `start_fetch`.
    #[error("Fetch not started")]
    NotStarted,
}

impl ConnectorError {
    /// Only this item failed; the pass may continue with the next one.
    pub fn is_skippable(&self) -> bool {
        matches!(self, ConnectorError::Parse(_) | ConnectorError::NotFound(_))
    }

    /// Worth retrying after a backoff.
    pub fn is_transient(&self) -> bool {
        match self {
            ConnectorError::Network(_) | ConnectorError::RateLimited(_) => true,
            ConnectorError::Http { status, .. } => *status == 429 || *status >= 500,
            _ => false,
        }
    }

    /// Maps an HTTP status and body to the matching variant.
    pub fn from_status(status: u16, body: &str) -> Self {
        let message = truncate_body(body);
        match status {
            401 | 403 => ConnectorError::Auth(message),
            404 => ConnectorError::NotFound(message),
            429 => ConnectorError::RateLimited(message),
            _ => ConnectorError::Http { status, message },
        }
    }
}

impl From<reqwest::Error> for ConnectorError {
    fn from(err: reqwest::Error) -> Self {
        if let Some(status) = err.status() {
            return ConnectorError::from_status(status.as_u16(), &err.to_string());
        }
        if err.is_decode() {
            return ConnectorError::Protocol(err.to_string());
        }
        ConnectorError::Network(err.to_string())
    }
}

impl From<async_imap::error::Error> for ConnectorError {
    fn from(err: async_imap::error::Error) -> Self {
        use async_imap::error::Error as ImapError;
        match err {
            ImapError::Io(e) => ConnectorError::Network(e.to_string()),
            ImapError::ConnectionLost => ConnectorError::Network("connection lost".to_string()),
            ImapError::No(msg) | ImapError::Bad(msg) => ConnectorError::Protocol(msg),
            other => ConnectorError::Protocol(other.to_string()),
        }
    }
}

impl From<async_native_tls::Error> for ConnectorError {
    fn from(err: async_native_tls::Error) -> Self {
        ConnectorError::Network(format!("TLS: {}", err))
    }
}

/// Maximum length for provider error bodies kept in messages.
const MAX_ERROR_BODY_LENGTH: usize = 200;

fn truncate_body(body: &str) -> String {
    if body.len() > MAX_ERROR_BODY_LENGTH {
        let mut end = MAX_ERROR_BODY_LENGTH;
        while !body.is_char_boundary(end) {
            end -= 1;
        }
        format!("{}... (truncated)", &body[..end])
    } else {
        body.to_string()
    }
}

pub type Result<T> = std::result::Result<T, ConnectorError>;
