//! Provider connectors behind a single pull-based contract.
//!
//! A pass over one mailbox is `start_fetch`, then `next_email` until it
//! yields `None`, then `finish_fetch`. Connections open lazily on the first
//! pull and are always released by `finish_fetch`.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::Stream;
use serde::{Deserialize, Serialize};

use crate::factory::ProviderCredentials;
use crate::source::ProviderKind;
use crate::sync_state::SyncState;

pub mod eml;
pub mod error;
mod file_source;
pub mod google;
pub mod graph;
pub(crate) mod http;
pub mod imap;
pub mod mbox;
pub mod message;
pub mod microsoft;
pub mod outlook_personal;
pub mod pst;

pub use error::{ConnectorError, Result};

/// Message shown while a source waits out a provider rate limit.
pub const RATE_LIMIT_MESSAGE: &str =
    "Sync paused due to reaching the mail server rate limit. The process will automatically resume later.";

/// One mailbox to fan out over.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MailboxUser {
    pub id: String,
    pub primary_email: String,
    pub display_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmailAddress {
    pub name: Option<String>,
    pub address: String,
}

#[derive(Debug, Clone)]
pub struct EmailAttachment {
    pub filename: String,
    pub content_type: String,
    pub size: usize,
    pub content: Vec<u8>,
}

/// A fetched email, parsed and ready for archiving.
#[derive(Debug, Clone)]
pub struct EmailObject {
    /// Provider-side id (UID, Graph id, Gmail id, archive entry name).
    pub id: String,
    /// Message identity used for dedup.
    pub message_id: String,
    pub from: Vec<EmailAddress>,
    pub to: Vec<EmailAddress>,
    pub cc: Vec<EmailAddress>,
    pub bcc: Vec<EmailAddress>,
    pub subject: String,
    pub body: String,
    pub html: String,
    pub headers: BTreeMap<String, Vec<String>>,
    pub attachments: Vec<EmailAttachment>,
    pub received_at: DateTime<Utc>,
    pub eml: Vec<u8>,
    pub thread_id: Option<String>,
    pub path: Option<String>,
    pub tags: Vec<String>,
}

/// The contract every provider connector implements.
#[async_trait]
pub trait EmailConnector: Send {
    fn provider(&self) -> ProviderKind;

    /// Verifies the credentials by making a cheap authenticated call.
    async fn test_connection(&mut self) -> Result<bool>;

    /// Every mailbox the credentials can reach. Single-mailbox providers
    /// return one synthetic user.
    async fn list_all_users(&mut self) -> Result<Vec<MailboxUser>>;

    /// Prepares a pass over one mailbox, resuming from `state` when given.
    async fn start_fetch(&mut self, user_email: &str, state: Option<&SyncState>) -> Result<()>;

    /// The next email of the pass, or `None` when the pass is complete.
    async fn next_email(&mut self) -> Result<Option<EmailObject>>;

    /// Releases connections and temporary files. Safe to call after errors.
    async fn finish_fetch(&mut self);

    /// The cursor reached by the last pass for `user_email`.
    fn updated_sync_state(&self, user_email: &str) -> SyncState;

    /// A human-readable note about the last pass, if any.
    fn status_message(&self) -> Option<String> {
        None
    }

    /// Credentials rotated during the pass that should be persisted.
    fn updated_credentials(&self) -> Option<ProviderCredentials> {
        None
    }
}

/// Adapts a started pass into a stream. The stream ends after the last
/// email or after the first error that is not skippable.
pub fn email_stream<'a>(
    connector: &'a mut (dyn EmailConnector + 'a),
) -> impl Stream<Item = Result<EmailObject>> + Send + 'a {
    futures_util::stream::unfold(Some(connector), |state| async move {
        let connector = state?;
        match connector.next_email().await {
            Ok(Some(email)) => Some((Ok(email), Some(connector))),
            Ok(None) => None,
            Err(e) if e.is_skippable() => Some((Err(e), Some(connector))),
            Err(e) => Some((Err(e), None)),
        }
    })
}

/// Deterministic synthetic address for single-mailbox file imports.
pub(crate) fn synthetic_user(source_name: &str, domain: &str) -> MailboxUser {
    let local: String = source_name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_lowercase()
            } else {
                '-'
            }
        })
        .collect();
    let local = local.trim_matches('-');
    let local = if local.is_empty() { "import" } else { local };
    let email = format!("{}@{}", local, domain);
    MailboxUser {
        id: email.clone(),
        primary_email: email,
        display_name: source_name.to_string(),
    }
}


#[cfg(test)]
mod tests {
    use std::collections::VecDeque;

    use futures_util::StreamExt;

    use super::testing::ScriptedConnector;
    use super::*;

    fn email(id: &str) -> EmailObject {
        message::parse_raw_email(
            format!("Message-ID: <{}@x>\r\nSubject: s\r\n\r\nbody", id).as_bytes(),
            message::RawContext::new(id),
        )
        .unwrap()
    }

    #[test]
    fn test_synthetic_user() {
        let user = synthetic_user("Old Archive 2019!", "mbox.local");
        assert_eq!(user.primary_email, "old-archive-2019@mbox.local");
        assert_eq!(user.display_name, "Old Archive 2019!");
        assert_eq!(synthetic_user("***", "eml.local").primary_email, "import@eml.local");
    }

    #[tokio::test]
    async fn test_stream_continues_past_skippable_errors() {
        let mut connector = ScriptedConnector {
            users: vec![],
            script: VecDeque::from(vec![
                Ok(email("a")),
                Err(ConnectorError::Parse("garbled".into())),
                Ok(email("b")),
            ]),
            finished: false,
        };
        let items: Vec<_> = email_stream(&mut connector).collect().await;
        assert_eq!(items.len(), 3);
        assert!(items[1].is_err());
        assert_eq!(items[2].as_ref().unwrap().message_id, "b@x");
    }

    #[tokio::test]
    async fn test_stream_stops_after_fatal_error() {
        let mut connector = ScriptedConnector {
            users: vec![],
            script: VecDeque::from(vec![
                Ok(email("a")),
                Err(ConnectorError::Auth("revoked".into())),
                Ok(email("b")),
            ]),
            finished: false,
        };
        let items: Vec<_> = email_stream(&mut connector).collect().await;
        assert_eq!(items.len(), 2);
        assert!(matches!(items[1], Err(ConnectorError::Auth(_))));
    }
}
